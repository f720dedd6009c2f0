//! Per-file / per-client / total lock caps and per-adapter connection
//! caps (spec §4.2, §4.9, §6 config keys).

use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;

use crate::config::Config;
use crate::error::{Error, Result};

/// Tracks outstanding lock counts against the configured caps.
///
/// Counts are incremented on a successful insert and decremented on
/// release; a failed insert never mutates the counters (spec §7
/// rollback-on-failure policy).
#[derive(Debug)]
pub struct LockLimits {
    max_per_file: usize,
    max_per_client: usize,
    max_total: usize,
    per_file: DashMap<crate::lock::types::FileHandle, usize>,
    per_client: DashMap<String, usize>,
    total: AtomicUsize,
}

impl LockLimits {
    pub fn new(config: &Config) -> Self {
        Self {
            max_per_file: config.max_locks_per_file,
            max_per_client: config.max_locks_per_client,
            max_total: config.max_total_locks,
            per_file: DashMap::new(),
            per_client: DashMap::new(),
            total: AtomicUsize::new(0),
        }
    }

    /// Checks whether one more lock on `file`/`client` would exceed any
    /// configured cap, without mutating state.
    pub fn would_exceed(&self, file: &crate::lock::types::FileHandle, client_id: &str) -> bool {
        let file_count = self.per_file.get(file).map(|v| *v).unwrap_or(0);
        let client_count = self.per_client.get(client_id).map(|v| *v).unwrap_or(0);
        let total = self.total.load(Ordering::SeqCst);
        file_count + 1 > self.max_per_file
            || client_count + 1 > self.max_per_client
            || total + 1 > self.max_total
    }

    pub fn reserve(&self, file: &crate::lock::types::FileHandle, client_id: &str) -> Result<()> {
        if self.would_exceed(file, client_id) {
            return Err(Error::LockLimitExceeded);
        }
        *self.per_file.entry(file.clone()).or_insert(0) += 1;
        *self.per_client.entry(client_id.to_string()).or_insert(0) += 1;
        self.total.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub fn release(&self, file: &crate::lock::types::FileHandle, client_id: &str) {
        if let Some(mut count) = self.per_file.get_mut(file) {
            *count = count.saturating_sub(1);
        }
        if let Some(mut count) = self.per_client.get_mut(client_id) {
            *count = count.saturating_sub(1);
        }
        self.total.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(v.saturating_sub(1))).ok();
    }
}

/// Per-adapter connection cap (spec §4.9).
#[derive(Debug, Default)]
pub struct ConnectionLimits {
    caps: DashMap<String, usize>,
    counts: DashMap<String, usize>,
}

impl ConnectionLimits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_cap(&self, adapter: &str, cap: usize) {
        self.caps.insert(adapter.to_string(), cap);
    }

    pub fn try_register(&self, adapter: &str) -> Result<()> {
        if let Some(cap) = self.caps.get(adapter) {
            let current = self.counts.get(adapter).map(|v| *v).unwrap_or(0);
            if current + 1 > *cap {
                return Err(Error::ConnectionLimitReached);
            }
        }
        *self.counts.entry(adapter.to_string()).or_insert(0) += 1;
        Ok(())
    }

    pub fn unregister(&self, adapter: &str) {
        if let Some(mut count) = self.counts.get_mut(adapter) {
            *count = count.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::types::FileHandle;

    fn config_with_caps(per_file: usize, per_client: usize, total: usize) -> Config {
        let mut config = Config::default();
        config.max_locks_per_file = per_file;
        config.max_locks_per_client = per_client;
        config.max_total_locks = total;
        config
    }

    #[test]
    fn reserve_respects_per_file_cap() {
        let limits = LockLimits::new(&config_with_caps(1, 100, 100));
        let file = FileHandle::new(vec![1]);
        limits.reserve(&file, "c1").unwrap();
        assert!(matches!(limits.reserve(&file, "c2"), Err(Error::LockLimitExceeded)));
    }

    #[test]
    fn release_decrements_and_allows_reuse() {
        let limits = LockLimits::new(&config_with_caps(1, 100, 100));
        let file = FileHandle::new(vec![1]);
        limits.reserve(&file, "c1").unwrap();
        limits.release(&file, "c1");
        assert!(limits.reserve(&file, "c2").is_ok());
    }

    #[test]
    fn connection_limit_enforced_per_adapter() {
        let limits = ConnectionLimits::new();
        limits.set_cap("nfs", 1);
        limits.try_register("nfs").unwrap();
        assert!(matches!(limits.try_register("nfs"), Err(Error::ConnectionLimitReached)));
        limits.unregister("nfs");
        assert!(limits.try_register("nfs").is_ok());
    }
}
