//! Per-file FIFO of blocked lock requests and GRANTED dispatch
//! (spec §4.3).

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{instrument, warn};

use super::deadlock::WaitForGraph;
use super::types::{FileHandle, UnifiedLock, Waiter};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::metrics::Metrics;

/// Implemented by whichever protocol adapter owns the wire-level
/// GRANTED notification (the NLM callback client, in this crate).
#[async_trait]
pub trait GrantedSink: Send + Sync {
    async fn notify_granted(&self, waiter: &Waiter, granted: &UnifiedLock);
}

#[derive(Default)]
struct FileQueue {
    waiters: VecDeque<Waiter>,
}

/// Bounded per-file FIFO queue of blocking lock requests.
///
/// A request rejected for exceeding the per-file cap returns
/// [`Error::LockLimitExceeded`]; the NLM layer maps this to
/// `NLM4_DENIED_NOLOCKS` on the wire.
pub struct BlockingQueue {
    queues: DashMap<FileHandle, Arc<Mutex<FileQueue>>>,
    cap: usize,
    metrics: Arc<dyn Metrics>,
}

impl BlockingQueue {
    /// `config` is accepted for symmetry with the other collaborators
    /// even though the queue cap has no dedicated config key today
    /// (spec §4.3 uses the compiled-in default).
    pub fn new(_config: &Config, metrics: Arc<dyn Metrics>) -> Self {
        Self {
            queues: DashMap::new(),
            cap: crate::config::DEFAULT_BLOCKING_QUEUE_CAP,
            metrics,
        }
    }

    fn queue_for(&self, file_handle: &FileHandle) -> Arc<Mutex<FileQueue>> {
        self.queues.entry(file_handle.clone()).or_default().clone()
    }

    #[instrument(skip(self, waiter))]
    pub async fn enqueue(&self, file_handle: &FileHandle, waiter: Waiter) -> Result<()> {
        let queue = self.queue_for(file_handle);
        let mut guard = queue.lock().await;
        if guard.waiters.len() >= self.cap {
            self.metrics.lock_limit_exceeded();
            return Err(Error::LockLimitExceeded);
        }
        guard.waiters.push_back(waiter);
        Ok(())
    }

    /// Cancels a previously enqueued waiter by its identifying tuple.
    /// Idempotent: cancelling an already-removed waiter is not an error
    /// (spec §4.4, NLM CANCEL idempotence).
    #[instrument(skip(self))]
    pub async fn cancel(&self, file_handle: &FileHandle, owner_id: &str, offset: u64, length: u64) -> bool {
        let Some(queue) = self.queues.get(file_handle).map(|q| q.clone()) else {
            return false;
        };
        let mut guard = queue.lock().await;
        let before = guard.waiters.len();
        guard.waiters.retain(|w| {
            !(w.requested.owner.owner_id == owner_id && w.requested.offset == offset && w.requested.length == length)
        });
        before != guard.waiters.len()
    }

    pub async fn cancel_all_for_owner(&self, owner_id: &str) {
        for item in self.queues.iter() {
            let queue = item.value().clone();
            let mut guard = queue.lock().await;
            guard.waiters.retain(|w| w.requested.owner.owner_id != owner_id);
        }
    }

    /// Cancels every queued waiter whose owner id starts with `prefix`,
    /// across every file. Used by FREE_ALL, which operates on a whole
    /// caller rather than one exact owner id (spec §9).
    pub async fn cancel_all_for_owner_prefix(&self, prefix: &str) {
        for item in self.queues.iter() {
            let queue = item.value().clone();
            let mut guard = queue.lock().await;
            guard.waiters.retain(|w| !w.requested.owner.owner_id.starts_with(prefix));
        }
    }

    /// Drains every cancelled waiter at the head of the queue, then
    /// attempts to grant the new head against `manager`. Repeats until
    /// either the queue is empty or the new head still conflicts.
    ///
    /// Called after every successful release/unlock so that the next
    /// eligible waiter, in FIFO order, is granted (spec §4.3). Every
    /// waiter granted here has its outbound wait-for-graph edges removed
    /// (spec §4.7: grant, like cancel, ends a wait), or the next blocked
    /// request can hit a stale edge and be rejected as a false-positive
    /// deadlock.
    #[instrument(skip(self, manager, wait_graph, sink))]
    pub async fn try_grant_head(
        &self,
        file_handle: &FileHandle,
        manager: &super::manager::LockManager,
        wait_graph: &WaitForGraph,
        sink: &dyn GrantedSink,
    ) {
        let queue = self.queue_for(file_handle);

        loop {
            let candidate = {
                let mut guard = queue.lock().await;
                loop {
                    match guard.waiters.front() {
                        Some(w) if w.is_cancelled() => {
                            guard.waiters.pop_front();
                        }
                        _ => break,
                    }
                }
                guard.waiters.front().cloned()
            };

            let Some(waiter) = candidate else { return };

            let mut requested = waiter.requested.clone();
            requested.blocking = false;
            match manager.insert(file_handle, requested).await {
                Ok(granted) => {
                    {
                        let mut guard = queue.lock().await;
                        guard.waiters.pop_front();
                    }
                    wait_graph.remove_waiter(&waiter.requested.owner.owner_id);
                    sink.notify_granted(&waiter, &granted).await;
                    // Loop again: releasing into one waiter may free capacity
                    // for the next one behind it (e.g. two compatible shared locks).
                }
                Err(Error::LockConflict(_)) => return,
                Err(other) => {
                    warn!(error = %other, "failed to grant head of blocking queue");
                    return;
                }
            }
        }
    }

    pub async fn len(&self, file_handle: &FileHandle) -> usize {
        match self.queues.get(file_handle) {
            Some(queue) => queue.lock().await.waiters.len(),
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicBool;
    use std::time::Instant;

    use super::*;
    use crate::lock::manager::LockManager;
    use crate::lock::types::{AccessMode, LockId, LockType};
    use crate::metrics::NullMetrics;
    use crate::owner::LockOwner;

    fn handle() -> FileHandle {
        FileHandle::new(vec![9])
    }

    fn waiter(owner: &str, client: &str, offset: u64, length: u64) -> Waiter {
        Waiter {
            requested: UnifiedLock {
                id: LockId(0),
                owner: LockOwner::new(owner, client, "share"),
                file_handle: handle(),
                offset,
                length,
                lock_type: LockType::Exclusive,
                access_mode: AccessMode::None,
                acquired_at: Instant::now(),
                blocking: true,
                reclaim: false,
                lease: None,
            },
            cookie: vec![],
            callback_addr: "127.0.0.1:0".parse::<SocketAddr>().unwrap(),
            callback_program: 100021,
            callback_version: 4,
            caller_name: "client".to_string(),
            svid: 1,
            oh: vec![],
            file_handle: handle(),
            queued_at: Instant::now(),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    struct RecordingSink {
        granted: tokio::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl GrantedSink for RecordingSink {
        async fn notify_granted(&self, waiter: &Waiter, _granted: &UnifiedLock) {
            self.granted.lock().await.push(waiter.requested.owner.owner_id.clone());
        }
    }

    #[tokio::test]
    async fn enqueue_respects_cap() {
        let queue = BlockingQueue::new(&Config::default(), Arc::new(NullMetrics));
        let file = handle();
        for i in 0..crate::config::DEFAULT_BLOCKING_QUEUE_CAP {
            queue.enqueue(&file, waiter(&format!("o{i}"), "c", 0, 1)).await.unwrap();
        }
        let result = queue.enqueue(&file, waiter("overflow", "c", 0, 1)).await;
        assert!(matches!(result, Err(Error::LockLimitExceeded)));
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let queue = BlockingQueue::new(&Config::default(), Arc::new(NullMetrics));
        let file = handle();
        queue.enqueue(&file, waiter("o1", "c1", 0, 10)).await.unwrap();
        assert!(queue.cancel(&file, "o1", 0, 10).await);
        assert!(!queue.cancel(&file, "o1", 0, 10).await);
    }

    #[tokio::test]
    async fn try_grant_head_grants_fifo_order() {
        let queue = BlockingQueue::new(&Config::default(), Arc::new(NullMetrics));
        let manager = LockManager::new(&Config::default(), Arc::new(NullMetrics));
        let file = handle();

        queue.enqueue(&file, waiter("o1", "c1", 0, 10)).await.unwrap();
        queue.enqueue(&file, waiter("o2", "c2", 0, 10)).await.unwrap();

        let sink = RecordingSink { granted: tokio::sync::Mutex::new(Vec::new()) };
        let wait_graph = WaitForGraph::new();
        queue.try_grant_head(&file, &manager, &wait_graph, &sink).await;

        assert_eq!(*sink.granted.lock().await, vec!["o1".to_string()]);
        assert_eq!(queue.len(&file).await, 1);
    }

    #[tokio::test]
    async fn skips_cancelled_head_and_grants_next() {
        let queue = BlockingQueue::new(&Config::default(), Arc::new(NullMetrics));
        let manager = LockManager::new(&Config::default(), Arc::new(NullMetrics));
        let file = handle();

        queue.enqueue(&file, waiter("o1", "c1", 0, 10)).await.unwrap();
        queue.cancel(&file, "o1", 0, 10).await;
        queue.enqueue(&file, waiter("o2", "c2", 0, 10)).await.unwrap();

        let sink = RecordingSink { granted: tokio::sync::Mutex::new(Vec::new()) };
        let wait_graph = WaitForGraph::new();
        queue.try_grant_head(&file, &manager, &wait_graph, &sink).await;

        assert_eq!(*sink.granted.lock().await, vec!["o2".to_string()]);
    }
}
