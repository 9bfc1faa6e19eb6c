//! Bounded hand-off between the decoder loop and the worker pool.
//!
//! There is exactly one [`WorkSender`]. It is not `Clone`, and the queue
//! closes when it is dropped, so the close can only ever happen once and
//! only after the final send has returned.

use crate::models::User;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};

/// Returned when every receiver has gone away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueClosed(pub User);

/// Producer half of the work queue.
#[derive(Debug)]
pub struct WorkSender {
    inner: mpsc::Sender<User>,
}

impl WorkSender {
    /// Wait for queue space, then enqueue. For use from async code.
    pub async fn send(&self, user: User) -> Result<(), QueueClosed> {
        self.inner
            .send(user)
            .await
            .map_err(|mpsc::error::SendError(user)| QueueClosed(user))
    }

    /// Block the current thread until the record is enqueued. Must not be
    /// called from inside the async runtime.
    pub fn blocking_send(&self, user: User) -> Result<(), QueueClosed> {
        self.inner
            .blocking_send(user)
            .map_err(|mpsc::error::SendError(user)| QueueClosed(user))
    }
}

/// Consumer half of the work queue, shared by every worker.
#[derive(Debug, Clone)]
pub struct WorkReceiver {
    inner: Arc<Mutex<mpsc::Receiver<User>>>,
}

impl WorkReceiver {
    /// Next queued record, or `None` once the sender is gone and the buffer
    /// is drained.
    pub async fn recv(&self) -> Option<User> {
        let mut receiver = self.inner.lock().await;
        receiver.recv().await
    }
}

/// Create a work queue holding at most `capacity` records.
pub fn work_queue(capacity: NonZeroUsize) -> (WorkSender, WorkReceiver) {
    let (tx, rx) = mpsc::channel(capacity.get());
    (
        WorkSender { inner: tx },
        WorkReceiver {
            inner: Arc::new(Mutex::new(rx)),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn user(id: &str) -> User {
        User {
            id: id.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn drains_buffered_records_after_close() {
        let (sender, receiver) = work_queue(NonZeroUsize::new(2).unwrap());
        sender.send(user("a")).await.unwrap();
        sender.send(user("b")).await.unwrap();
        drop(sender);

        assert_eq!(receiver.recv().await.unwrap().id, "a");
        assert_eq!(receiver.recv().await.unwrap().id, "b");
        assert!(receiver.recv().await.is_none());
        assert!(receiver.recv().await.is_none());
    }

    #[tokio::test]
    async fn send_waits_while_queue_is_full() {
        let (sender, receiver) = work_queue(NonZeroUsize::MIN);
        sender.send(user("a")).await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), sender.send(user("b"))).await;
        assert!(blocked.is_err(), "second send should wait for a consumer");

        assert_eq!(receiver.recv().await.unwrap().id, "a");
        sender.send(user("c")).await.unwrap();
        assert_eq!(receiver.recv().await.unwrap().id, "c");
    }

    #[tokio::test]
    async fn cloned_receivers_share_one_queue() {
        let (sender, first) = work_queue(NonZeroUsize::new(4).unwrap());
        let second = first.clone();

        for id in ["a", "b", "c"] {
            sender.send(user(id)).await.unwrap();
        }
        drop(sender);

        let mut seen = vec![
            first.recv().await.unwrap().id,
            second.recv().await.unwrap().id,
            first.recv().await.unwrap().id,
        ];
        seen.sort();
        assert_eq!(seen, ["a", "b", "c"]);
        assert!(second.recv().await.is_none());
    }

    #[tokio::test]
    async fn blocking_send_from_blocking_thread() {
        let (sender, receiver) = work_queue(NonZeroUsize::MIN);

        let producer = tokio::task::spawn_blocking(move || {
            for id in ["a", "b", "c"] {
                sender.blocking_send(user(id)).unwrap();
            }
        });

        let mut ids = Vec::new();
        while let Some(user) = receiver.recv().await {
            ids.push(user.id);
        }
        producer.await.unwrap();
        assert_eq!(ids, ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn send_fails_once_receivers_are_gone() {
        let (sender, receiver) = work_queue(NonZeroUsize::MIN);
        drop(receiver);

        let QueueClosed(returned) = sender.send(user("a")).await.unwrap_err();
        assert_eq!(returned.id, "a");
    }
}
