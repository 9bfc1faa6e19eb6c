use crate::config::ConfigError;
use crate::ingest::DecodeError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that abort an ingestion run.
///
/// Failures of individual records are not represented here; they surface as
/// [`crate::ingest::RecordOutcome`] values and are counted in the summary.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to open input {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("work queue closed after {dispatched} records were dispatched")]
    QueueClosed { dispatched: usize },
    #[error("pipeline task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
