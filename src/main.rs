use std::path::Path;
use std::process::ExitCode;

use user_loader::config::{self, DatabaseConfig, IngestConfig};
use user_loader::db;
use user_loader::error::IngestError;
use user_loader::ingest::{Coordinator, IngestSummary, PgRecordSink};

#[tokio::main]
async fn main() -> ExitCode {
    user_loader::init_logger();

    log::info!("starting user loader");

    match run().await {
        Ok(summary) => {
            println!("{summary}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            log::error!("ingestion failed: {}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<IngestSummary, IngestError> {
    if config::load_env_file(Path::new(".env"))? {
        log::info!("loaded environment from .env");
    }

    let config = IngestConfig::from_env()?;
    let database_config = DatabaseConfig::from_env()?;

    let pool = db::connect(&database_config, config.workers).await?;
    let sink = PgRecordSink::new(pool.clone(), config.address_failure_policy);

    log::info!(
        "{} workers, queue capacity {}, address failure policy {:?}",
        config.workers,
        config.queue_capacity,
        sink.policy()
    );

    let result = Coordinator::new(&config, sink)
        .run_path(&config.input_path)
        .await;

    pool.close().await;
    result
}
