//! Post-restart grace-period state machine (spec §4.8).
//!
//! While active, only reclaim-flagged lock requests from clients that
//! held locks before the restart are admitted. The period ends early
//! once every expected client has reclaimed, or at the latest after
//! the configured timeout.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{info, instrument};

use super::types::GraceState;
use crate::error::{Error, Result};
use crate::metrics::Metrics;

/// Invoked once, outside any held lock, when the grace period ends
/// (either by full reclaim or by timeout).
#[async_trait::async_trait]
pub trait GraceEndHook: Send + Sync {
    async fn on_grace_end(&self);
}

pub struct GracePeriodManager {
    state: RwLock<GraceState>,
    metrics: Arc<dyn Metrics>,
}

impl GracePeriodManager {
    pub fn new(metrics: Arc<dyn Metrics>) -> Self {
        Self { state: RwLock::new(GraceState::Normal), metrics }
    }

    /// Enters the grace period with the set of clients that held locks
    /// at the time of the last clean persistence snapshot.
    #[instrument(skip(self, expected_clients))]
    pub async fn enter(&self, duration: Duration, expected_clients: HashSet<String>) {
        let mut state = self.state.write().await;
        self.metrics.grace_period_entered();
        if expected_clients.is_empty() {
            info!("grace period skipped: no clients to reclaim for");
            *state = GraceState::Normal;
            self.metrics.grace_period_exited();
            return;
        }
        *state = GraceState::Active {
            grace_end: Instant::now() + duration,
            expected_clients,
            reclaimed_clients: HashSet::new(),
        };
    }

    /// Records that `client_id` has finished reclaiming its locks.
    /// Returns `true` if this completed reclaim for every expected
    /// client, letting the caller end the grace period early.
    #[instrument(skip(self))]
    pub async fn mark_reclaimed(&self, client_id: &str) -> bool {
        let mut state = self.state.write().await;
        match &mut *state {
            GraceState::Active { expected_clients, reclaimed_clients, .. } => {
                reclaimed_clients.insert(client_id.to_string());
                expected_clients.is_subset(reclaimed_clients)
            }
            GraceState::Normal => false,
        }
    }

    /// Ends the grace period unconditionally, whether by early exit or
    /// by timeout. Idempotent.
    #[instrument(skip(self, hook))]
    pub async fn exit(&self, hook: &dyn GraceEndHook) {
        {
            let mut state = self.state.write().await;
            if matches!(*state, GraceState::Normal) {
                return;
            }
            *state = GraceState::Normal;
        }
        self.metrics.grace_period_exited();
        hook.on_grace_end().await;
    }

    pub async fn is_active(&self) -> bool {
        matches!(*self.state.read().await, GraceState::Active { .. })
    }

    pub async fn remaining(&self) -> Option<Duration> {
        match &*self.state.read().await {
            GraceState::Active { grace_end, .. } => Some(grace_end.saturating_duration_since(Instant::now())),
            GraceState::Normal => None,
        }
    }

    /// Gate applied to every incoming lock request while grace is
    /// active (spec §4.8): only reclaim requests are allowed, and
    /// non-reclaim requests are rejected with the remaining duration so
    /// the caller can report it back to the client.
    pub async fn is_operation_allowed(&self, is_reclaim: bool) -> Result<()> {
        match &*self.state.read().await {
            GraceState::Normal => Ok(()),
            GraceState::Active { grace_end, .. } => {
                if is_reclaim {
                    Ok(())
                } else {
                    let remaining_seconds = grace_end.saturating_duration_since(Instant::now()).as_secs();
                    Err(Error::GracePeriod { remaining_seconds })
                }
            }
        }
    }

    /// Returns `true` once `grace_end` has passed, for the timer task
    /// driving [`Self::exit`] on timeout.
    pub async fn has_timed_out(&self) -> bool {
        match &*self.state.read().await {
            GraceState::Active { grace_end, .. } => Instant::now() >= *grace_end,
            GraceState::Normal => false,
        }
    }
}

/// Polls `manager` at `poll_interval` and calls `exit` once the grace
/// period has timed out. Runs until the grace period ends by any means.
pub async fn run_timeout_watchdog(manager: Arc<GracePeriodManager>, hook: Arc<dyn GraceEndHook>, poll_interval: Duration) {
    loop {
        if !manager.is_active().await {
            return;
        }
        if manager.has_timed_out().await {
            manager.exit(hook.as_ref()).await;
            return;
        }
        tokio::time::sleep(poll_interval).await;
    }
}
