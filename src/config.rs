//! Runtime configuration for the lock/lease core (spec §6).
//!
//! Deserializable with `serde`/`toml`, matching how the rest of the
//! `nfs-mamont` stack reads its server configuration.

use std::time::Duration;

use serde::Deserialize;

/// Default per-file cap on the blocking-queue (spec §4.3).
pub const DEFAULT_BLOCKING_QUEUE_CAP: usize = 100;

/// Default cadence of the lease break-timeout scanner (spec §4.6).
pub const DEFAULT_BREAK_SCANNER_INTERVAL: Duration = Duration::from_secs(1);

/// Default poll cadence of the cross-protocol lease-break hook (spec §4.5).
pub const DEFAULT_LEASE_BREAK_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub max_locks_per_file: usize,
    pub max_locks_per_client: usize,
    pub max_total_locks: usize,
    #[serde(with = "duration_secs")]
    pub blocking_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub grace_period: Duration,
    pub mandatory_locking: bool,
    #[serde(with = "duration_secs")]
    pub lease_break_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_locks_per_file: 1000,
            max_locks_per_client: 10_000,
            max_total_locks: 100_000,
            blocking_timeout: Duration::from_secs(60),
            grace_period: Duration::from_secs(90),
            mandatory_locking: false,
            lease_break_timeout: Duration::from_secs(35),
        }
    }
}

impl Config {
    /// Resolves the effective lease break timeout: a zero value in the
    /// config means "use the default" (spec §4.6).
    pub fn effective_lease_break_timeout(&self) -> Duration {
        if self.lease_break_timeout.is_zero() {
            Config::default().lease_break_timeout
        } else {
            self.lease_break_timeout
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
