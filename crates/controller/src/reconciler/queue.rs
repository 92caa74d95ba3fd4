// The three work queues (§5): independent rate-limited backoff, keyed
// de-duplication (re-enqueuing a queued key is a no-op; re-enqueuing an
// in-flight key coalesces into a single requeue once the current run
// finishes). Fast-slow schedule: first 5 retries at 20 ms, then 500 ms.
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

const FAST_RETRIES: u32 = 5;
const FAST_DELAY: Duration = Duration::from_millis(20);
const SLOW_DELAY: Duration = Duration::from_millis(500);

fn backoff_delay(attempt: u32) -> Duration {
    if attempt < FAST_RETRIES {
        FAST_DELAY
    } else {
        SLOW_DELAY
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum KeyState {
    Queued,
    InFlight,
    InFlightDirty,
}

struct Inner<K> {
    state: HashMap<K, KeyState>,
    retry_counts: HashMap<K, u32>,
}

/// A de-duplicating, rate-limited FIFO of keys. Cheap to clone: everything
/// is behind an `Arc`.
pub struct WorkQueue<K: Clone + Eq + Hash + Send + Sync + 'static> {
    tx: mpsc::UnboundedSender<K>,
    rx: Mutex<mpsc::UnboundedReceiver<K>>,
    inner: Mutex<Inner<K>>,
}

impl<K: Clone + Eq + Hash + Send + Sync + 'static> WorkQueue<K> {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            tx,
            rx: Mutex::new(rx),
            inner: Mutex::new(Inner {
                state: HashMap::new(),
                retry_counts: HashMap::new(),
            }),
        })
    }

    /// Enqueues `key`. No-op if already queued; coalesces into a single
    /// future requeue if the key is currently in-flight.
    pub fn enqueue(self: &Arc<Self>, key: K) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state.get(&key) {
            None => {
                inner.state.insert(key.clone(), KeyState::Queued);
                drop(inner);
                let _ = self.tx.send(key);
            }
            Some(KeyState::Queued) => {}
            Some(KeyState::InFlight) => {
                inner.state.insert(key, KeyState::InFlightDirty);
            }
            Some(KeyState::InFlightDirty) => {}
        }
    }

    /// Blocks until a key is available, marking it in-flight. Safe for
    /// several workers to call concurrently on the same queue: the receiver
    /// is shared behind a `Mutex`, polled with `try_recv` in a short loop so
    /// the guard is never held across an `.await`.
    pub async fn dequeue(self: &Arc<Self>) -> Option<K> {
        let key = loop {
            let mut rx = self.rx.lock().unwrap();
            match rx.try_recv() {
                Ok(key) => break key,
                Err(mpsc::error::TryRecvError::Disconnected) => return None,
                Err(mpsc::error::TryRecvError::Empty) => {}
            }
            drop(rx);
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        let mut inner = self.inner.lock().unwrap();
        inner.state.insert(key.clone(), KeyState::InFlight);
        Some(key)
    }

    /// Call after successfully processing `key`. Resets its retry count and
    /// requeues immediately if a coalesced enqueue arrived mid-flight.
    pub fn finish_ok(self: &Arc<Self>, key: K) {
        let mut inner = self.inner.lock().unwrap();
        inner.retry_counts.remove(&key);
        let was_dirty = matches!(inner.state.remove(&key), Some(KeyState::InFlightDirty));
        drop(inner);
        if was_dirty {
            self.enqueue(key);
        }
    }

    /// Call after a retryable failure processing `key`; schedules a
    /// backoff-delayed requeue.
    pub fn finish_retry(self: &Arc<Self>, key: K) {
        let attempt = {
            let mut inner = self.inner.lock().unwrap();
            inner.state.remove(&key);
            let attempt = inner.retry_counts.entry(key.clone()).or_insert(0);
            let current = *attempt;
            *attempt += 1;
            current
        };
        let delay = backoff_delay(attempt);
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.enqueue(key);
        });
    }

    /// Call after a non-retryable outcome (benign `NotFound`, or a
    /// persistent/`Invalid` error already surfaced to `Error` state).
    pub fn finish_drop(self: &Arc<Self>, key: K) {
        let mut inner = self.inner.lock().unwrap();
        inner.retry_counts.remove(&key);
        let was_dirty = matches!(inner.state.remove(&key), Some(KeyState::InFlightDirty));
        drop(inner);
        if was_dirty {
            self.enqueue(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_enqueue_of_queued_key_is_a_no_op() {
        let queue: Arc<WorkQueue<&'static str>> = WorkQueue::new();
        queue.enqueue("a");
        queue.enqueue("a");
        let key = queue.dequeue().await.unwrap();
        assert_eq!(key, "a");
        // The second enqueue should not have produced a second item.
        assert!(tokio::time::timeout(Duration::from_millis(20), queue.dequeue())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn enqueue_while_in_flight_coalesces_into_one_requeue() {
        let queue: Arc<WorkQueue<&'static str>> = WorkQueue::new();
        queue.enqueue("a");
        let key = queue.dequeue().await.unwrap();
        queue.enqueue("a");
        queue.enqueue("a");
        queue.finish_ok(key);
        let requeued = queue.dequeue().await.unwrap();
        assert_eq!(requeued, "a");
    }

    #[tokio::test]
    async fn retry_schedules_a_delayed_requeue() {
        let queue: Arc<WorkQueue<&'static str>> = WorkQueue::new();
        queue.enqueue("a");
        let key = queue.dequeue().await.unwrap();
        queue.finish_retry(key);
        assert!(tokio::time::timeout(Duration::from_millis(5), queue.dequeue())
            .await
            .is_err());
        let requeued = tokio::time::timeout(Duration::from_millis(100), queue.dequeue())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(requeued, "a");
    }
}
