//! Pipeline coordination for a single ingestion run.
//!
//! The coordinator wires the pieces together:
//! 1. Open the input and consume the opening `[`
//! 2. Create the work queue and spawn the worker pool
//! 3. Run the decode-and-send loop on a blocking thread
//! 4. Close the queue by dropping the sender once the loop ends
//! 5. Join every worker and merge their statistics
//!
//! When reading from a file, the whole input is validated before the first
//! record is dispatched. A streaming run over an arbitrary reader cannot look
//! ahead: a decode error there stops the producer immediately, and records
//! already handed to the queue are still processed before the error is
//! returned.

use super::decoder::{self, DecodeError, RecordStream};
use super::queue::{QueueClosed, WorkSender, work_queue};
use super::stats::{IngestStats, IngestSummary};
use super::transaction::RecordSink;
use super::worker::spawn_workers;
use crate::config::IngestConfig;
use crate::error::IngestError;
use std::fs::File;
use std::io::{BufRead, BufReader, Seek};
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

/// Read buffer for the input file. Records are decoded straight out of it.
const INPUT_BUFFER_SIZE: usize = 64 * 1024;

/// Drives one ingestion run from an input source to a [`RecordSink`].
pub struct Coordinator<S> {
    workers: NonZeroUsize,
    queue_capacity: NonZeroUsize,
    sink: Arc<S>,
}

impl<S: RecordSink> Coordinator<S> {
    pub fn new(config: &IngestConfig, sink: S) -> Self {
        Self::with_shared_sink(config, Arc::new(sink))
    }

    /// Build a coordinator around a sink the caller keeps a handle to.
    pub fn with_shared_sink(config: &IngestConfig, sink: Arc<S>) -> Self {
        Self {
            workers: config.workers,
            queue_capacity: config.queue_capacity,
            sink,
        }
    }

    /// Ingest the JSON array stored at `path`.
    ///
    /// The file is decoded once up front without dispatching anything, so a
    /// malformed file (a missing closing `]` included) fails before any
    /// record reaches the sink. The second pass streams as
    /// [`Coordinator::run_reader`] does.
    pub async fn run_path(&self, path: &Path) -> Result<IngestSummary, IngestError> {
        log::info!("ingesting users from {}", path.display());

        let file = File::open(path).map_err(|source| IngestError::Open {
            path: path.to_path_buf(),
            source,
        })?;

        let (file, records) = tokio::task::spawn_blocking(move || validate_file(file)).await??;
        log::debug!("input is well formed, {} records", records);

        self.run_reader(BufReader::with_capacity(INPUT_BUFFER_SIZE, file))
            .await
    }

    /// Ingest the JSON array readable from `reader`.
    ///
    /// Records are dispatched as they are decoded; a decode error stops the
    /// producer but records already queued are still persisted.
    pub async fn run_reader<R>(&self, reader: R) -> Result<IngestSummary, IngestError>
    where
        R: BufRead + Send + 'static,
    {
        let started = Instant::now();
        let stream = RecordStream::new(reader)?;

        let (sender, receiver) = work_queue(self.queue_capacity);
        let handles = spawn_workers(self.workers, receiver, Arc::clone(&self.sink));

        // The sender moves into the producer and is dropped when it returns,
        // which is what lets the workers' receive loops end.
        let produced = tokio::task::spawn_blocking(move || produce(stream, sender)).await;

        let mut stats = IngestStats::default();
        let mut worker_failure = None;
        for (worker_id, handle) in handles.into_iter().enumerate() {
            match handle.await {
                Ok(worker_stats) => stats.merge(worker_stats),
                Err(err) => {
                    log::error!("worker {} did not finish: {}", worker_id, err);
                    worker_failure.get_or_insert(err);
                }
            }
        }

        let dispatched = match produced {
            Ok(Ok(dispatched)) => dispatched,
            Ok(Err(err)) => {
                log::error!(
                    "ingestion aborted after {} committed users: {}",
                    stats.users_committed,
                    err
                );
                return Err(err);
            }
            Err(err) => return Err(IngestError::Task(err)),
        };

        if let Some(err) = worker_failure {
            return Err(IngestError::Task(err));
        }

        let summary = IngestSummary {
            dispatched,
            workers: self.workers.get(),
            stats,
            elapsed: started.elapsed(),
        };

        log::info!(
            "ingested {} of {} users ({} addresses) in {:.2?}; {} failed",
            summary.stats.users_committed,
            summary.dispatched,
            summary.stats.addresses_committed,
            summary.elapsed,
            summary.stats.failures()
        );

        Ok(summary)
    }
}

/// First pass over the input file. Hands the file back rewound.
fn validate_file(mut file: File) -> Result<(File, usize), IngestError> {
    let records = decoder::validate(BufReader::with_capacity(INPUT_BUFFER_SIZE, &mut file))?;
    file.rewind().map_err(DecodeError::Io)?;
    Ok((file, records))
}

/// Decode-and-send loop. Runs on a blocking thread.
fn produce<R: BufRead>(
    mut stream: RecordStream<R>,
    sender: WorkSender,
) -> Result<usize, IngestError> {
    let mut dispatched = 0;

    while stream.has_more()? {
        let user = stream.next_record()?;
        log::trace!("dispatching user {}", user.id);

        if let Err(QueueClosed(user)) = sender.blocking_send(user) {
            log::error!("work queue closed before user {} could be dispatched", user.id);
            return Err(IngestError::QueueClosed { dispatched });
        }
        dispatched += 1;
    }

    stream.finish()?;
    log::debug!("producer finished after {} records", dispatched);
    Ok(dispatched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::transaction::RecordOutcome;
    use crate::models::User;
    use std::collections::BTreeMap;
    use std::io::{Cursor, Write};
    use std::sync::Mutex;

    /// Zip code that makes [`MemorySink`] reject an address.
    const FAILING_ZIP: &str = "FAIL";

    /// In-memory stand-in for the database: unique user ids, one map entry
    /// per committed user, addresses rejected by zip code.
    #[derive(Default)]
    struct MemorySink {
        users: Mutex<BTreeMap<String, User>>,
    }

    impl MemorySink {
        fn committed(&self) -> BTreeMap<String, User> {
            self.users.lock().unwrap().clone()
        }
    }

    impl RecordSink for MemorySink {
        async fn persist(&self, mut user: User) -> RecordOutcome {
            tokio::task::yield_now().await;
            user.claim_addresses();

            if user.addresses.iter().any(|a| a.zip_code == FAILING_ZIP) {
                return RecordOutcome::AddressRejected {
                    committed_addresses: 0,
                    rolled_back: true,
                };
            }

            let mut users = self.users.lock().unwrap();
            if user.id.is_empty() || users.contains_key(&user.id) {
                return RecordOutcome::UserRejected;
            }
            let addresses = user.addresses.len();
            users.insert(user.id.clone(), user);
            RecordOutcome::Committed { addresses }
        }
    }

    /// Panics on one chosen id, otherwise behaves like [`MemorySink`].
    struct PanickingSink {
        panic_on: &'static str,
        inner: MemorySink,
    }

    impl RecordSink for PanickingSink {
        async fn persist(&self, user: User) -> RecordOutcome {
            if user.id == self.panic_on {
                panic!("sink failure for user {}", user.id);
            }
            self.inner.persist(user).await
        }
    }

    fn config(workers: usize) -> IngestConfig {
        IngestConfig::default().with_workers(NonZeroUsize::new(workers).unwrap())
    }

    fn generated_input(count: usize) -> String {
        let users: Vec<serde_json::Value> = (0..count)
            .map(|i| {
                serde_json::json!({
                    "id": format!("user-{i}"),
                    "name": format!("User {i}"),
                    "email": format!("user{i}@example.com"),
                    "phone_number": format!("555-{i:04}"),
                    "addresses": (0..i % 3).map(|n| serde_json::json!({
                        "street": format!("{n} Main St"),
                        "city": "Springfield",
                        "state": "IL",
                        "zip_code": "62701",
                        "country": "US",
                        "user_id": "forged"
                    })).collect::<Vec<_>>()
                })
            })
            .collect();
        serde_json::to_string_pretty(&users).unwrap()
    }

    async fn run(
        workers: usize,
        input: &str,
    ) -> (Arc<MemorySink>, Result<IngestSummary, IngestError>) {
        let sink = Arc::new(MemorySink::default());
        let coordinator = Coordinator::with_shared_sink(&config(workers), Arc::clone(&sink));
        let result = coordinator
            .run_reader(Cursor::new(input.as_bytes().to_vec()))
            .await;
        (sink, result)
    }

    #[tokio::test]
    async fn empty_array_writes_nothing() {
        let (sink, result) = run(10, "[]").await;
        let summary = result.expect("empty input succeeds");

        assert_eq!(summary.dispatched, 0);
        assert_eq!(summary.stats, IngestStats::default());
        assert!(sink.committed().is_empty());
    }

    #[tokio::test]
    async fn single_record_end_to_end() {
        let input = r#"[{"id":"u1","name":"Ann","email":"a@x.com","phone_number":"1","addresses":[{"street":"1 Main","city":"X","state":"Y","zip_code":"0","country":"Z"}]}]"#;
        let (sink, result) = run(1, input).await;
        let summary = result.expect("valid input");

        assert_eq!(summary.dispatched, 1);
        assert_eq!(summary.stats.users_committed, 1);
        assert_eq!(summary.stats.addresses_committed, 1);

        let committed = sink.committed();
        let user = committed.get("u1").expect("u1 committed");
        assert_eq!(user.addresses.len(), 1);
        assert_eq!(user.addresses[0].user_id, "u1");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn worker_count_does_not_change_committed_set() {
        let input = generated_input(250);

        let (single, single_result) = run(1, &input).await;
        let (pooled, pooled_result) = run(10, &input).await;

        assert_eq!(single_result.unwrap().stats.users_committed, 250);
        assert_eq!(pooled_result.unwrap().stats.users_committed, 250);
        assert_eq!(single.committed(), pooled.committed());
        assert!(
            pooled
                .committed()
                .values()
                .flat_map(|user| user.addresses.iter().map(move |a| (user, a)))
                .all(|(user, address)| address.user_id == user.id)
        );
    }

    #[tokio::test]
    async fn per_record_failures_do_not_stop_the_run() {
        let input = r#"[
            {"id": "a"},
            {"id": "a"},
            {"id": "b", "addresses": [{"zip_code": "1"}, {"zip_code": "FAIL"}]},
            {"id": ""},
            {"id": "c"}
        ]"#;
        let (sink, result) = run(3, input).await;
        let summary = result.expect("per-record failures are not fatal");

        assert_eq!(summary.dispatched, 5);
        assert_eq!(summary.stats.users_committed, 2);
        assert_eq!(summary.stats.users_rejected, 2);
        assert_eq!(summary.stats.users_rolled_back, 1);
        assert_eq!(
            sink.committed().keys().cloned().collect::<Vec<_>>(),
            ["a", "c"]
        );
    }

    #[tokio::test]
    async fn rerun_rejects_every_record() {
        let input = generated_input(20);
        let sink = Arc::new(MemorySink::default());
        let coordinator = Coordinator::with_shared_sink(&config(4), Arc::clone(&sink));

        let first = coordinator
            .run_reader(Cursor::new(input.clone().into_bytes()))
            .await
            .unwrap();
        let second = coordinator
            .run_reader(Cursor::new(input.into_bytes()))
            .await
            .unwrap();

        assert_eq!(first.stats.users_committed, 20);
        assert_eq!(second.stats.users_committed, 0);
        assert_eq!(second.stats.users_rejected, 20);
        assert_eq!(sink.committed().len(), 20);
    }

    #[tokio::test]
    async fn missing_array_start_fails_before_any_write() {
        let (sink, result) = run(2, r#"{"id": "u1"}"#).await;
        assert!(matches!(
            result,
            Err(IngestError::Decode(DecodeError::ExpectedArrayStart { .. }))
        ));
        assert!(sink.committed().is_empty());
    }

    #[tokio::test]
    async fn malformed_first_record_fails_before_any_write() {
        let (sink, result) = run(2, r#"[{"id": "u1", "name": }]"#).await;
        assert!(matches!(
            result,
            Err(IngestError::Decode(DecodeError::Record { index: 0, .. }))
        ));
        assert!(sink.committed().is_empty());
    }

    #[tokio::test]
    async fn decode_error_stops_dispatch_but_finishes_in_flight_records() {
        let (sink, result) = run(2, r#"[{"id": "u1"}, {"id": "u2"}, {"id": 3}, {"id": "u4"}]"#).await;

        assert!(matches!(
            result,
            Err(IngestError::Decode(DecodeError::Record { index: 2, .. }))
        ));
        assert_eq!(
            sink.committed().keys().cloned().collect::<Vec<_>>(),
            ["u1", "u2"]
        );
    }

    #[tokio::test]
    async fn missing_file_is_fatal() {
        let sink = MemorySink::default();
        let coordinator = Coordinator::new(&config(1), sink);
        let result = coordinator
            .run_path(Path::new("/nonexistent/users_data.json"))
            .await;
        assert!(matches!(result, Err(IngestError::Open { .. })));
    }

    #[tokio::test]
    async fn reads_input_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(generated_input(5).as_bytes()).unwrap();

        let sink = Arc::new(MemorySink::default());
        let coordinator = Coordinator::with_shared_sink(&config(2), Arc::clone(&sink));
        let summary = coordinator.run_path(file.path()).await.unwrap();

        assert_eq!(summary.dispatched, 5);
        assert_eq!(sink.committed().len(), 5);
    }

    #[tokio::test]
    async fn file_missing_closing_bracket_fails_before_any_write() {
        let input = r#"[{"id":"u1","name":"Ann","email":"a@x.com","phone_number":"1","addresses":[{"street":"1 Main","city":"X","state":"Y","zip_code":"0","country":"Z"}]}"#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(input.as_bytes()).unwrap();

        let sink = Arc::new(MemorySink::default());
        let coordinator = Coordinator::with_shared_sink(&config(1), Arc::clone(&sink));
        let result = coordinator.run_path(file.path()).await;

        assert!(matches!(
            result,
            Err(IngestError::Decode(DecodeError::UnexpectedEof))
        ));
        assert!(sink.committed().is_empty());
    }

    #[tokio::test]
    async fn file_with_bad_late_record_fails_before_any_write() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(br#"[{"id": "u1"}, {"id": "u2"}, {"id": 3}]"#)
            .unwrap();

        let sink = Arc::new(MemorySink::default());
        let coordinator = Coordinator::with_shared_sink(&config(2), Arc::clone(&sink));
        let result = coordinator.run_path(file.path()).await;

        assert!(matches!(
            result,
            Err(IngestError::Decode(DecodeError::Record { index: 2, .. }))
        ));
        assert!(sink.committed().is_empty());
    }

    #[tokio::test]
    async fn worker_panic_is_fatal_after_remaining_workers_finish() {
        let sink = Arc::new(PanickingSink {
            panic_on: "u2",
            inner: MemorySink::default(),
        });
        let coordinator = Coordinator::with_shared_sink(&config(2), Arc::clone(&sink));
        let input = r#"[{"id": "u1"}, {"id": "u2"}, {"id": "u3"}, {"id": "u4"}, {"id": "u5"}]"#;

        let result = coordinator
            .run_reader(Cursor::new(input.as_bytes().to_vec()))
            .await;

        assert!(matches!(result, Err(IngestError::Task(_))));
        assert_eq!(
            sink.inner.committed().keys().cloned().collect::<Vec<_>>(),
            ["u1", "u3", "u4", "u5"]
        );
    }
}
