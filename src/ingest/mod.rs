//! Bounded-concurrency user ingestion.
//!
//! This module streams users out of a JSON array and writes them to the
//! database through a fixed pool of workers:
//!
//! 1. **Decoding** (`decoder`) - Pulls one array element at a time off a `BufRead`
//! 2. **Hand-off** (`queue`) - Bounded channel between the producer and the workers
//! 3. **Workers** (`worker`) - Fixed set of tasks, one record in flight each
//! 4. **Transaction** (`transaction`, `database_operations`) - User plus addresses, all or nothing
//! 5. **Coordination** (`coordinator`) - Wires the above, joins, summarizes
//! 6. **Statistics** (`stats`) - Per-worker counts merged into the run summary
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use user_loader::config::IngestConfig;
//! use user_loader::ingest::{Coordinator, PgRecordSink};
//!
//! let config = IngestConfig::from_env()?;
//! let sink = PgRecordSink::new(pool, config.address_failure_policy);
//!
//! let summary = Coordinator::new(&config, sink)
//!     .run_path(&config.input_path)
//!     .await?;
//!
//! println!("{summary}");
//! ```

pub mod coordinator;
pub mod database_operations;
pub mod decoder;
pub mod queue;
pub mod stats;
pub mod transaction;
pub mod worker;

// Re-export main types
pub use coordinator::Coordinator;
pub use decoder::{DecodeError, RecordStream};
pub use queue::{WorkReceiver, WorkSender, work_queue};
pub use stats::{IngestStats, IngestSummary};
pub use transaction::{PgRecordSink, RecordOutcome, RecordSink};
pub use worker::spawn_workers;
