use super::queue::WorkReceiver;
use super::stats::IngestStats;
use super::transaction::RecordSink;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Spawn `count` workers that consume the queue until it is closed and
/// drained. Each handle resolves to that worker's own statistics.
pub fn spawn_workers<S: RecordSink>(
    count: NonZeroUsize,
    receiver: WorkReceiver,
    sink: Arc<S>,
) -> Vec<JoinHandle<IngestStats>> {
    log::debug!("spawning {} ingest workers", count);

    (0..count.get())
        .map(|worker_id| {
            let receiver = receiver.clone();
            let sink = Arc::clone(&sink);
            tokio::spawn(async move { run_worker(worker_id, receiver, sink).await })
        })
        .collect()
}

async fn run_worker<S: RecordSink>(
    worker_id: usize,
    receiver: WorkReceiver,
    sink: Arc<S>,
) -> IngestStats {
    let mut stats = IngestStats::default();

    while let Some(user) = receiver.recv().await {
        let user_id = user.id.clone();
        let outcome = sink.persist(user).await;
        log::trace!("worker {}: user {} -> {:?}", worker_id, user_id, outcome);
        stats.record(&outcome);
    }

    log::debug!(
        "worker {} finished: {} committed, {} failed",
        worker_id,
        stats.users_committed,
        stats.failures()
    );
    stats
}
