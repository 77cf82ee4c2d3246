//! schemadiff API server
//!
//! Accepts metadata snapshots from extractors, runs incremental diffs between
//! the latest two completed snapshots of a connection and serves the results.

use schemadiff::config::{LogFormat, Settings, StorageConfig};
use schemadiff::db::{bootstrap_schema, create_pool};
use schemadiff::routes::create_router;
use schemadiff::state::AppState;
use schemadiff::store::{MemoryStore, MetadataStore, PgStore};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration first: the log format is part of it
    let settings = Settings::load()?;

    // Initialize tracing subscriber for structured logging
    init_tracing(settings.log_format);

    info!("🚀 Starting schemadiff - metadata snapshot diff engine...");
    info!("📋 Configuration loaded successfully");

    let store: Arc<dyn MetadataStore> = match &settings.storage {
        StorageConfig::Postgres(db) => {
            let pool = create_pool(db).await.map_err(|e| {
                error!("❌ FATAL: Failed to initialize database pool: {}", e);
                e
            })?;
            info!("✅ Database pool created successfully");

            bootstrap_schema(&pool).await?;
            Arc::new(PgStore::new(pool))
        }
        StorageConfig::Memory => {
            warn!("⚠️  No database configured, snapshots and diff runs are kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    info!(
        ignored_attributes = ?settings.diff.ignored_attributes,
        ignored_custom_attributes = ?settings.diff.ignored_custom_attributes,
        persist_unchanged = settings.diff.persist_unchanged,
        stale_run_after_secs = settings.diff.stale_run_after.as_secs(),
        "🔍 Diff settings"
    );

    let state = Arc::new(AppState::new(store, settings.diff.clone()));

    // Build the router
    let app = create_router(state, &settings);

    // Create socket address
    let addr = SocketAddr::from((settings.server.host, settings.server.port));

    info!("🌐 Server listening on http://{}", addr);
    info!("");
    info!("📚 API Endpoints:");
    info!("   ─── Snapshots ───");
    info!("   POST   /api/connections/{{id}}/snapshots        - Store an extraction");
    info!("   GET    /api/connections/{{id}}/snapshots        - List completed snapshots");
    info!("   DELETE /api/connections/{{id}}/snapshots        - Prune old snapshots");
    info!("   GET    /api/connections/{{id}}/snapshots/latest - Latest completed snapshot");
    info!("   GET    /api/snapshots/{{id}}                    - Snapshot by id");
    info!("");
    info!("   ─── Diff Runs ───");
    info!("   POST   /api/connections/{{id}}/diffs            - Run a diff");
    info!("   GET    /api/connections/{{id}}/diffs            - List diff runs");
    info!("   GET    /api/connections/{{id}}/diffs/latest     - Latest diff run");
    info!("   GET    /api/diffs/{{id}}                        - Diff run by id");
    info!("   GET    /api/diffs/{{id}}/changes                - Change records");
    info!("");

    // Create TCP listener and serve
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("👋 Server shutdown complete");
    Ok(())
}

/// Initialize tracing with structured logging
fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,schemadiff=debug,tower_http=debug"));

    let registry = tracing_subscriber::registry().with(env_filter);

    match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(true).with_target(true))
            .init(),
        LogFormat::Compact => registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true)
                    .compact(),
            )
            .init(),
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("📴 Received Ctrl+C signal, initiating graceful shutdown...");
        },
        _ = terminate => {
            info!("📴 Received terminate signal, initiating graceful shutdown...");
        },
    }
}
