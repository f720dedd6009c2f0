//! Cross-protocol lease-break hook consumed by NFS-side operations
//! before WRITE, LOCK acquisition and REMOVE (spec §4.5, §6).

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant as TokioInstant;

use super::types::FileHandle;
use crate::error::{Error, Result};

/// Implemented by the lock manager itself: it already owns lease
/// state, so there is no separate collaborator behind this trait in
/// this crate (spec §9 notes the `OplockChecker` as the consumer-facing
/// name for the manager's own break-initiation surface).
#[async_trait]
pub trait OplockChecker: Send + Sync {
    async fn check_and_break_for_write(&self, file_handle: &FileHandle, exclude_owner: Option<&str>) -> Result<()>;
    async fn check_and_break_for_read(&self, file_handle: &FileHandle, exclude_owner: Option<&str>) -> Result<()>;
    async fn check_and_break_for_delete(&self, file_handle: &FileHandle, exclude_owner: Option<&str>) -> Result<()>;
}

/// Cooperative cancellation signal, threaded through every external
/// call per spec §5.
#[derive(Clone)]
pub struct CancellationToken {
    notify: std::sync::Arc<tokio::sync::Notify>,
    cancelled: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            notify: std::sync::Arc::new(tokio::sync::Notify::new()),
            cancelled: std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, std::sync::atomic::Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

/// Polls `checker` at a 100ms cadence (spec §4.5) until it reports
/// clear, `timeout` elapses, or `cancellation` fires. On timeout the
/// caller proceeds anyway — the break-timeout scanner will force-revoke
/// the lease independently.
pub async fn wait_for_lease_break(
    checker: &dyn OplockChecker,
    file_handle: &FileHandle,
    exclude_owner: Option<&str>,
    trigger: BreakTrigger,
    timeout: Duration,
    poll_interval: Duration,
    cancellation: &CancellationToken,
) -> Result<()> {
    let deadline = TokioInstant::now() + timeout;

    loop {
        let outcome = match trigger {
            BreakTrigger::Write => checker.check_and_break_for_write(file_handle, exclude_owner).await,
            BreakTrigger::Read => checker.check_and_break_for_read(file_handle, exclude_owner).await,
            BreakTrigger::Delete => checker.check_and_break_for_delete(file_handle, exclude_owner).await,
        };

        match outcome {
            Ok(()) => return Ok(()),
            Err(Error::LeaseBreakPending) => {
                if TokioInstant::now() >= deadline {
                    return Ok(()); // timeout: proceed, scanner will force-revoke.
                }
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = cancellation.cancelled() => return Ok(()),
                }
            }
            Err(other) => return Err(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakTrigger {
    Write,
    Read,
    Delete,
}
