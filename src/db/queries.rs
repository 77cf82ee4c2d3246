//! SQL query constants
//!
//! Contains all SQL used by the PostgreSQL store.

/// Idempotent DDL applied on startup, one statement per entry
pub const BOOTSTRAP: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS sync_snapshots (
        snapshot_id UUID PRIMARY KEY,
        connection_id TEXT NOT NULL,
        captured_at TIMESTAMPTZ NOT NULL,
        status TEXT NOT NULL CHECK (status IN ('running', 'completed', 'failed')),
        error_message TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_sync_snapshots_connection
        ON sync_snapshots (connection_id, status, captured_at DESC)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS snapshot_entities (
        entity_id BIGSERIAL PRIMARY KEY,
        snapshot_id UUID NOT NULL REFERENCES sync_snapshots (snapshot_id) ON DELETE CASCADE,
        level TEXT NOT NULL CHECK (level IN ('schema', 'table', 'column')),
        schema_name TEXT NOT NULL,
        table_name TEXT,
        name TEXT NOT NULL,
        attributes JSONB NOT NULL DEFAULT '{}'::jsonb,
        custom_attributes JSONB NOT NULL DEFAULT '{}'::jsonb
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_snapshot_entities_level
        ON snapshot_entities (snapshot_id, level)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS diff_runs (
        diff_run_id UUID PRIMARY KEY,
        connection_id TEXT NOT NULL,
        older_snapshot_id UUID NOT NULL,
        newer_snapshot_id UUID NOT NULL,
        started_at TIMESTAMPTZ NOT NULL,
        completed_at TIMESTAMPTZ,
        status TEXT NOT NULL CHECK (status IN ('created', 'running', 'completed', 'failed')),
        schemas_changed BIGINT NOT NULL DEFAULT 0,
        tables_changed BIGINT NOT NULL DEFAULT 0,
        columns_changed BIGINT NOT NULL DEFAULT 0,
        error_message TEXT
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_diff_runs_connection
        ON diff_runs (connection_id, started_at DESC)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS change_records (
        change_id BIGSERIAL PRIMARY KEY,
        diff_run_id UUID NOT NULL REFERENCES diff_runs (diff_run_id) ON DELETE CASCADE,
        level TEXT NOT NULL CHECK (level IN ('schema', 'table', 'column')),
        qualified_key TEXT NOT NULL,
        schema_name TEXT NOT NULL,
        table_name TEXT,
        column_name TEXT,
        change_type TEXT NOT NULL CHECK (change_type IN ('added', 'removed', 'modified', 'unchanged')),
        older_payload JSONB,
        newer_payload JSONB,
        differences JSONB
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_change_records_run
        ON change_records (diff_run_id, level, change_type)
    "#,
];

pub const INSERT_SNAPSHOT: &str = r#"
    INSERT INTO sync_snapshots (snapshot_id, connection_id, captured_at, status)
    VALUES ($1, $2, $3, $4)
"#;

pub const LOCK_SNAPSHOT: &str = r#"
    SELECT status FROM sync_snapshots WHERE snapshot_id = $1 FOR UPDATE
"#;

pub const INSERT_ENTITY: &str = r#"
    INSERT INTO snapshot_entities
        (snapshot_id, level, schema_name, table_name, name, attributes, custom_attributes)
    VALUES ($1, $2, $3, $4, $5, $6, $7)
"#;

/// Only a running snapshot can be finished
pub const FINISH_SNAPSHOT: &str = r#"
    UPDATE sync_snapshots
    SET status = $2, error_message = $3
    WHERE snapshot_id = $1 AND status = 'running'
    RETURNING snapshot_id, connection_id, captured_at, status, error_message
"#;

pub const GET_SNAPSHOT: &str = r#"
    SELECT snapshot_id, connection_id, captured_at, status, error_message
    FROM sync_snapshots
    WHERE snapshot_id = $1
"#;

pub const CONNECTION_EXISTS: &str = r#"
    SELECT EXISTS(SELECT 1 FROM sync_snapshots WHERE connection_id = $1)
"#;

/// Newest first; UUID comparison breaks capture-time ties
pub const LIST_COMPLETED_SNAPSHOTS: &str = r#"
    SELECT snapshot_id, connection_id, captured_at, status, error_message
    FROM sync_snapshots
    WHERE connection_id = $1 AND status = 'completed'
    ORDER BY captured_at DESC, snapshot_id DESC
"#;

pub const LIST_ENTITIES: &str = r#"
    SELECT level, schema_name, table_name, name, attributes, custom_attributes
    FROM snapshot_entities
    WHERE snapshot_id = $1 AND level = $2
    ORDER BY entity_id
"#;

/// Deletes terminal snapshots outside the newest `$2` completed ones
pub const PRUNE_SNAPSHOTS: &str = r#"
    DELETE FROM sync_snapshots
    WHERE connection_id = $1
      AND status IN ('completed', 'failed')
      AND snapshot_id NOT IN (
          SELECT snapshot_id FROM sync_snapshots
          WHERE connection_id = $1 AND status = 'completed'
          ORDER BY captured_at DESC, snapshot_id DESC
          LIMIT $2
      )
"#;

/// Serializes run creation per connection for the rest of the transaction
pub const LOCK_CONNECTION: &str = r#"
    SELECT pg_advisory_xact_lock(hashtext($1))
"#;

pub const COUNT_ACTIVE_RUNS: &str = r#"
    SELECT COUNT(*) FROM diff_runs
    WHERE connection_id = $1 AND status = 'running' AND started_at > $2
"#;

pub const INSERT_RUN: &str = r#"
    INSERT INTO diff_runs
        (diff_run_id, connection_id, older_snapshot_id, newer_snapshot_id, started_at, status)
    VALUES ($1, $2, $3, $4, $5, $6)
"#;

pub const COMPLETE_RUN: &str = r#"
    UPDATE diff_runs
    SET status = 'completed', completed_at = $2,
        schemas_changed = $3, tables_changed = $4, columns_changed = $5
    WHERE diff_run_id = $1 AND status = 'running'
"#;

pub const FAIL_RUN: &str = r#"
    UPDATE diff_runs
    SET status = 'failed', completed_at = $2, error_message = $3,
        schemas_changed = 0, tables_changed = 0, columns_changed = 0
    WHERE diff_run_id = $1 AND status = 'running'
"#;

pub const INSERT_CHANGE: &str = r#"
    INSERT INTO change_records
        (diff_run_id, level, qualified_key, schema_name, table_name, column_name,
         change_type, older_payload, newer_payload, differences)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
"#;

const RUN_COLUMNS: &str = "diff_run_id, connection_id, older_snapshot_id, newer_snapshot_id, \
    started_at, completed_at, status, schemas_changed, tables_changed, columns_changed, error_message";

pub fn get_run() -> String {
    format!("SELECT {} FROM diff_runs WHERE diff_run_id = $1", RUN_COLUMNS)
}

pub fn list_runs() -> String {
    format!(
        "SELECT {} FROM diff_runs WHERE connection_id = $1 \
         ORDER BY started_at DESC, diff_run_id DESC LIMIT $2",
        RUN_COLUMNS
    )
}

pub const RUN_EXISTS: &str = r#"
    SELECT EXISTS(SELECT 1 FROM diff_runs WHERE diff_run_id = $1)
"#;

/// Level order, then key segments compared bytewise
pub const LIST_CHANGES: &str = r#"
    SELECT diff_run_id, level, schema_name, table_name, column_name, change_type,
           older_payload, newer_payload, differences
    FROM change_records
    WHERE diff_run_id = $1
      AND ($2::text IS NULL OR level = $2)
      AND ($3::text IS NULL OR change_type = $3)
    ORDER BY CASE level WHEN 'schema' THEN 0 WHEN 'table' THEN 1 ELSE 2 END,
             schema_name COLLATE "C",
             table_name COLLATE "C" NULLS FIRST,
             column_name COLLATE "C" NULLS FIRST
"#;
