//! Periodic scan that force-revokes leases stuck mid-break past their
//! timeout (spec §4.6).
//!
//! A client that never acknowledges a break (crashed, partitioned, or
//! simply slow) must not be allowed to block other protocols
//! indefinitely; this task is the backstop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{instrument, warn};

use super::manager::LockManager;
use super::types::LeaseState;
use crate::metrics::{Conflicting, Initiator, Resolution};

/// Runs [`LeaseBreakScanner::scan_once`] on a fixed interval until
/// stopped. Tolerant of individual scan errors: a store failure on one
/// pass is logged and retried on the next tick rather than aborting the
/// task.
pub struct LeaseBreakScanner {
    manager: Arc<LockManager>,
    timeout: Duration,
    interval: Duration,
    stopped: Arc<AtomicBool>,
}

impl LeaseBreakScanner {
    pub fn new(manager: Arc<LockManager>, timeout: Duration, interval: Duration) -> Self {
        Self { manager, timeout, interval, stopped: Arc::new(AtomicBool::new(false)) }
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// Idempotent: spawning twice on an already-stopped scanner is a
    /// no-op on the second call's returned handle, since `stopped` is
    /// checked at the top of every iteration.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while !self.stopped.load(Ordering::SeqCst) {
                self.scan_once().await;
                tokio::time::sleep(self.interval).await;
            }
        })
    }

    #[instrument(skip(self))]
    pub async fn scan_once(&self) {
        for file_handle in self.manager.tracked_file_handles() {
            let locks = self.manager.locks_on_file(&file_handle).await;
            for lock in locks {
                let Some(lease) = &lock.lease else { continue };
                if !lease.breaking {
                    continue;
                }
                let Some(break_started) = lease.break_started else { continue };
                if Instant::now().duration_since(break_started) < self.timeout {
                    continue;
                }

                warn!(
                    owner = %lock.owner.owner_id,
                    lease_key = lease.lease_key,
                    "lease break timed out, force-revoking"
                );

                if let Err(err) = self
                    .manager
                    .acknowledge_break(&file_handle, lease.lease_key, LeaseState::NONE)
                    .await
                {
                    warn!(error = %err, "failed to force-revoke timed-out lease");
                    continue;
                }

                self.manager.metrics().lease_break_timeout();
                self.manager.metrics().cross_protocol_conflict(
                    Initiator::Nfs,
                    Conflicting::SmbLease,
                    Resolution::BreakCompleted,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant as StdInstant;

    use super::*;
    use crate::config::Config;
    use crate::lock::types::{FileHandle, LockId, LockType, OpLock};
    use crate::metrics::NullMetrics;
    use crate::owner::LockOwner;

    fn lease_lock(owner: &str, lease_key: u128, break_started: Option<StdInstant>) -> crate::lock::types::UnifiedLock {
        crate::lock::types::UnifiedLock {
            id: LockId(0),
            owner: LockOwner::new(owner, "client", "share"),
            file_handle: FileHandle::new(vec![1]),
            offset: 0,
            length: 0,
            lock_type: LockType::Exclusive,
            access_mode: crate::lock::types::AccessMode::None,
            acquired_at: StdInstant::now(),
            blocking: false,
            reclaim: false,
            lease: Some(OpLock {
                lease_key,
                scope: crate::lock::types::LeaseScope::File,
                lease_state: LeaseState::READ | LeaseState::WRITE,
                break_to_state: LeaseState::NONE,
                breaking: break_started.is_some(),
                epoch: 1,
                break_started,
                reclaim: false,
            }),
        }
    }

    #[tokio::test]
    async fn force_revokes_lease_past_timeout() {
        let manager = Arc::new(LockManager::new(&Config::default(), Arc::new(NullMetrics)));
        let file = FileHandle::new(vec![1]);
        manager.insert(&file, lease_lock("smb:1", 7, Some(StdInstant::now() - Duration::from_secs(60)))).await.unwrap();

        let scanner = LeaseBreakScanner::new(manager.clone(), Duration::from_secs(35), Duration::from_millis(10));
        scanner.scan_once().await;

        assert!(manager.locks_on_file(&file).await.is_empty());
    }

    #[tokio::test]
    async fn leaves_fresh_breaking_lease_alone() {
        let manager = Arc::new(LockManager::new(&Config::default(), Arc::new(NullMetrics)));
        let file = FileHandle::new(vec![1]);
        manager.insert(&file, lease_lock("smb:1", 7, Some(StdInstant::now()))).await.unwrap();

        let scanner = LeaseBreakScanner::new(manager.clone(), Duration::from_secs(35), Duration::from_millis(10));
        scanner.scan_once().await;

        assert_eq!(manager.locks_on_file(&file).await.len(), 1);
    }

    #[tokio::test]
    async fn leaves_non_breaking_lease_alone() {
        let manager = Arc::new(LockManager::new(&Config::default(), Arc::new(NullMetrics)));
        let file = FileHandle::new(vec![1]);
        manager.insert(&file, lease_lock("smb:1", 7, None)).await.unwrap();

        let scanner = LeaseBreakScanner::new(manager.clone(), Duration::from_secs(35), Duration::from_millis(10));
        scanner.scan_once().await;

        assert_eq!(manager.locks_on_file(&file).await.len(), 1);
    }
}
