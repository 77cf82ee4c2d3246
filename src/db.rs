//! Database connection management
//!
//! Builds the metadata store pool and applies the store's DDL.

pub mod queries;

use crate::config::DatabaseConfig;
use crate::error::{ApiResult, AppError};
use deadpool_postgres::{Config, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime};
use tokio_postgres::NoTls;
use tracing::{debug, info};

/// Create a connection pool, negotiating TLS when the configuration asks for it
pub async fn create_pool(config: &DatabaseConfig) -> ApiResult<Pool> {
    let mut cfg = Config::new();
    cfg.host = Some(config.host.clone());
    cfg.port = Some(config.port);
    cfg.user = Some(config.user.clone());
    cfg.password = Some(config.password.clone());
    cfg.dbname = Some(config.database.clone());
    cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });
    cfg.pool = Some(PoolConfig::new(config.max_pool_size));

    let pool = if config.require_tls {
        let certs = rustls_native_certs::load_native_certs();
        let mut root_store = rustls::RootCertStore::empty();
        for cert in certs.certs {
            root_store.add(cert).ok();
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        let tls = tokio_postgres_rustls::MakeRustlsConnect::new(tls_config);

        cfg.create_pool(Some(Runtime::Tokio1), tls)
            .map_err(|e| AppError::Config(format!("Failed to create TLS pool: {}", e)))?
    } else {
        cfg.create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| AppError::Config(format!("Failed to create pool: {}", e)))?
    };

    // Test connection
    let client = pool.get().await?;
    client.query_one("SELECT 1", &[]).await?;
    drop(client);

    info!(
        "Metadata store pool established ({}:{}/{}, TLS: {})",
        config.host, config.port, config.database, config.require_tls
    );
    Ok(pool)
}

/// Create the snapshot and diff tables if they don't exist
pub async fn bootstrap_schema(pool: &Pool) -> ApiResult<()> {
    let client = pool.get().await?;
    for statement in queries::BOOTSTRAP {
        client.batch_execute(statement).await?;
    }
    debug!("Applied {} bootstrap statements", queries::BOOTSTRAP.len());
    info!("Metadata store tables initialized");
    Ok(())
}
