use crate::config::DatabaseConfig;
use crate::error::IngestError;
use log::LevelFilter;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::ConnectOptions;
use std::num::NonZeroUsize;

/// Open the shared connection pool used by every worker.
///
/// Unless overridden, the pool is sized to the worker count so each worker
/// can hold its own transaction without waiting on another.
pub async fn connect(config: &DatabaseConfig, workers: NonZeroUsize) -> Result<PgPool, IngestError> {
    let options = config
        .connect_options()?
        .log_statements(LevelFilter::Trace);

    let max_connections = config
        .max_connections
        .unwrap_or_else(|| u32::try_from(workers.get()).unwrap_or(u32::MAX));

    log::info!(
        "connecting to database (max {} connections)",
        max_connections
    );

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect_with(options)
        .await?;

    log::debug!("database pool ready");
    Ok(pool)
}
