//! In-memory lock manager: indexed storage, conflict resolution,
//! atomic operations and break-callback dispatch (spec §4.2).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::RwLock;
use tracing::{instrument, warn};

use super::callbacks::BreakCallbacks;
use super::conflict::conflicts_with;
use super::limits::LockLimits;
use super::oplock_checker::OplockChecker;
use super::range::Range;
use super::types::{FileHandle, FileLock, LeaseState, LockId, LockType, UnifiedLock};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::owner::LockOwner;

/// What the blocking queue should do after a release (spec §4.3): a
/// release can unblock any number of waiters on the file it touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseOutcome {
    pub had_waiters_hint: bool,
}

#[derive(Default)]
struct FileEntry {
    unified: Vec<UnifiedLock>,
    legacy: Vec<FileLock>,
}

impl FileEntry {
    fn all_views(&self, file_handle: &FileHandle) -> Vec<UnifiedLock> {
        let mut views: Vec<UnifiedLock> = self.unified.clone();
        views.extend(self.legacy.iter().map(|l| l.as_unified_view(file_handle.clone())));
        views
    }
}

/// A pending break that must be dispatched to subscribers after the
/// per-file lock is released (spec §9, option (b)).
struct PendingBreak {
    file_handle: FileHandle,
    lock: UnifiedLock,
    break_to_state: LeaseState,
}

pub struct LockManager {
    files: DashMap<FileHandle, Arc<RwLock<FileEntry>>>,
    limits: LockLimits,
    next_id: AtomicU64,
    callbacks: std::sync::RwLock<Vec<Arc<dyn BreakCallbacks>>>,
    metrics: Arc<dyn Metrics>,
}

impl LockManager {
    pub fn new(config: &Config, metrics: Arc<dyn Metrics>) -> Self {
        Self {
            files: DashMap::new(),
            limits: LockLimits::new(config),
            next_id: AtomicU64::new(1),
            callbacks: std::sync::RwLock::new(Vec::new()),
            metrics,
        }
    }

    pub fn register_break_callbacks(&self, subscriber: Arc<dyn BreakCallbacks>) {
        self.callbacks.write().unwrap().push(subscriber);
    }

    pub fn next_id(&self) -> LockId {
        LockId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn entry_for(&self, file_handle: &FileHandle) -> Arc<RwLock<FileEntry>> {
        self.files.entry(file_handle.clone()).or_default().clone()
    }

    /// Validates `candidate` against every existing lock on the file
    /// and returns the first conflicting record, if any.
    fn first_conflict(existing: &[UnifiedLock], candidate: &UnifiedLock) -> Option<UnifiedLock> {
        existing.iter().find(|l| conflicts_with(l, candidate)).cloned()
    }

    /// Every distinct owner id whose lock on this file conflicts with
    /// `candidate` (spec §4.7: `would_cause_cycle` is checked against
    /// the full set of conflicting holders, not just one of them).
    pub async fn conflicting_owners(&self, file_handle: &FileHandle, candidate: &UnifiedLock) -> Vec<String> {
        let entry = self.entry_for(file_handle);
        let guard = entry.read().await;
        let views = guard.all_views(file_handle);
        let mut owners: Vec<String> =
            views.iter().filter(|l| conflicts_with(l, candidate)).map(|l| l.owner.owner_id.clone()).collect();
        owners.sort();
        owners.dedup();
        owners
    }

    #[instrument(skip(self, lock))]
    pub async fn insert(&self, file_handle: &FileHandle, mut lock: UnifiedLock) -> Result<UnifiedLock> {
        lock.validate().map_err(Error::InvalidArgument)?;
        lock.file_handle = file_handle.clone();

        let entry = self.entry_for(file_handle);
        let mut guard = entry.write().await;

        let views = guard.all_views(file_handle);
        if let Some(conflict) = Self::first_conflict(&views, &lock) {
            self.metrics.lock_conflict();
            return Err(Error::LockConflict(Box::new(conflict)));
        }

        self.limits.reserve(file_handle, &lock.owner.client_id).map_err(|err| {
            self.metrics.lock_limit_exceeded();
            err
        })?;

        lock.id = self.next_id();
        lock.acquired_at = Instant::now();
        self.metrics.lock_inserted(lock.is_lease());
        guard.unified.push(lock.clone());
        Ok(lock)
    }

    /// Inserts a legacy per-session [`FileLock`] (spec §3, §4.2): the
    /// simplified record older protocol paths use, evaluated against
    /// the same conflict predicate and sharing the same per-file table
    /// as [`UnifiedLock`]s.
    #[instrument(skip(self, lock))]
    pub async fn insert_legacy(&self, file_handle: &FileHandle, mut lock: FileLock) -> Result<FileLock> {
        let entry = self.entry_for(file_handle);
        let mut guard = entry.write().await;

        let candidate = lock.as_unified_view(file_handle.clone());
        let views = guard.all_views(file_handle);
        if let Some(conflict) = Self::first_conflict(&views, &candidate) {
            self.metrics.lock_conflict();
            return Err(Error::LockConflict(Box::new(conflict)));
        }

        self.limits.reserve(file_handle, &lock.session_id).map_err(|err| {
            self.metrics.lock_limit_exceeded();
            err
        })?;

        lock.id = self.next_id();
        self.metrics.lock_inserted(false);
        guard.legacy.push(lock.clone());
        Ok(lock)
    }

    /// POSIX-style split release (spec §4.2). Every existing lock owned
    /// by `owner` overlapping `[offset, offset+length)` is trimmed,
    /// split, or removed entirely. Legacy [`FileLock`] records are
    /// matched by their synthesized `legacy:<session_id>` owner id.
    #[instrument(skip(self))]
    pub async fn release(&self, file_handle: &FileHandle, owner: &LockOwner, offset: u64, length: u64) -> Result<()> {
        let release_range = Range::new(offset, length);
        let entry = self.entry_for(file_handle);
        let mut guard = entry.write().await;

        let mut remaining = Vec::with_capacity(guard.unified.len());
        let mut released_any = false;

        for existing in guard.unified.drain(..) {
            if existing.owner.owner_id != owner.owner_id {
                remaining.push(existing);
                continue;
            }
            if existing.is_lease() {
                // Leases are not fragmented: releasing one removes it entirely,
                // regardless of the requested range.
                released_any = true;
                self.limits.release(file_handle, &owner.client_id);
                continue;
            }
            if !existing.range().overlaps(&release_range) {
                remaining.push(existing);
                continue;
            }

            released_any = true;
            self.limits.release(file_handle, &owner.client_id);

            for fragment_range in split_remaining(&existing.range(), &release_range) {
                let mut fragment = existing.clone();
                fragment.id = self.next_id();
                fragment.offset = fragment_range.offset;
                fragment.length = fragment_range.length;
                remaining.push(fragment);
            }
        }

        guard.unified = remaining;

        let mut remaining_legacy = Vec::with_capacity(guard.legacy.len());
        for existing in guard.legacy.drain(..) {
            if format!("legacy:{}", existing.session_id) != owner.owner_id {
                remaining_legacy.push(existing);
                continue;
            }
            if !existing.range().overlaps(&release_range) {
                remaining_legacy.push(existing);
                continue;
            }

            released_any = true;
            self.limits.release(file_handle, &owner.client_id);

            for fragment_range in split_remaining(&existing.range(), &release_range) {
                let mut fragment = existing.clone();
                fragment.id = self.next_id();
                fragment.offset = fragment_range.offset;
                fragment.length = fragment_range.length;
                remaining_legacy.push(fragment);
            }
        }
        guard.legacy = remaining_legacy;

        if !released_any {
            return Err(Error::LockNotFound);
        }
        self.metrics.lock_released();
        Ok(())
    }

    /// Pure query: never mutates.
    pub async fn test_lock(
        &self,
        file_handle: &FileHandle,
        owner: &LockOwner,
        offset: u64,
        length: u64,
        exclusive: bool,
    ) -> (bool, Option<UnifiedLock>) {
        let entry = self.entry_for(file_handle);
        let guard = entry.read().await;
        let candidate = UnifiedLock {
            id: LockId(0),
            owner: owner.clone(),
            file_handle: file_handle.clone(),
            offset,
            length,
            lock_type: if exclusive { LockType::Exclusive } else { LockType::Shared },
            access_mode: super::types::AccessMode::None,
            acquired_at: Instant::now(),
            blocking: false,
            reclaim: false,
            lease: None,
        };
        let views = guard.all_views(file_handle);
        match Self::first_conflict(&views, &candidate) {
            Some(holder) => (false, Some(holder)),
            None => (true, None),
        }
    }

    /// Atomic shared→exclusive upgrade (spec §4.2). No-op success if the
    /// caller already holds an exclusive lock on that exact range.
    #[instrument(skip(self))]
    pub async fn upgrade(&self, file_handle: &FileHandle, owner: &LockOwner, offset: u64, length: u64) -> Result<UnifiedLock> {
        let target_range = Range::new(offset, length);
        let entry = self.entry_for(file_handle);
        let mut guard = entry.write().await;

        if let Some(existing) = guard.unified.iter().find(|l| {
            l.owner.owner_id == owner.owner_id
                && l.offset == offset
                && l.length == length
                && matches!(l.lock_type, LockType::Exclusive)
        }) {
            return Ok(existing.clone());
        }

        let foreign_shared_conflict = guard.unified.iter().any(|l| {
            l.owner.owner_id != owner.owner_id
                && matches!(l.lock_type, LockType::Shared)
                && l.range().overlaps(&target_range)
        });
        if foreign_shared_conflict {
            let conflict = guard
                .unified
                .iter()
                .find(|l| {
                    l.owner.owner_id != owner.owner_id
                        && matches!(l.lock_type, LockType::Shared)
                        && l.range().overlaps(&target_range)
                })
                .cloned()
                .expect("conflict exists by construction above");
            return Err(Error::LockConflict(Box::new(conflict)));
        }

        let position = guard
            .unified
            .iter()
            .position(|l| l.owner.owner_id == owner.owner_id && l.offset == offset && l.length == length);
        match position {
            Some(index) => {
                guard.unified[index].lock_type = LockType::Exclusive;
                Ok(guard.unified[index].clone())
            }
            None => Err(Error::LockNotFound),
        }
    }

    #[instrument(skip(self))]
    pub async fn release_all_for_owner(&self, owner: &LockOwner) {
        for item in self.files.iter() {
            let entry = item.value().clone();
            let mut guard = entry.write().await;

            let before = guard.unified.len();
            guard.unified.retain(|l| l.owner.owner_id != owner.owner_id);
            let removed = before - guard.unified.len();

            let before_legacy = guard.legacy.len();
            guard.legacy.retain(|l| format!("legacy:{}", l.session_id) != owner.owner_id);
            let removed_legacy = before_legacy - guard.legacy.len();

            for _ in 0..(removed + removed_legacy) {
                self.limits.release(item.key(), &owner.client_id);
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn release_all_for_client(&self, client_id: &str) {
        for item in self.files.iter() {
            let entry = item.value().clone();
            let mut guard = entry.write().await;

            let before = guard.unified.len();
            guard.unified.retain(|l| l.owner.client_id != client_id);
            let removed = before - guard.unified.len();

            let before_legacy = guard.legacy.len();
            guard.legacy.retain(|l| l.session_id != client_id);
            let removed_legacy = before_legacy - guard.legacy.len();

            for _ in 0..(removed + removed_legacy) {
                self.limits.release(item.key(), client_id);
            }
        }
    }

    /// Coalesces adjacent or overlapping locks sharing
    /// `(file_handle, owner_id, type)`.
    #[instrument(skip(self))]
    pub async fn merge(&self, file_handle: &FileHandle) {
        let entry = self.entry_for(file_handle);
        let mut guard = entry.write().await;
        guard.unified = merge_locks(std::mem::take(&mut guard.unified));
    }

    async fn check_and_break(
        &self,
        file_handle: &FileHandle,
        exclude_owner: Option<&str>,
        trigger: super::oplock_checker::BreakTrigger,
    ) -> Result<()> {
        let entry = self.entry_for(file_handle);
        let mut pending = Vec::new();

        {
            let mut guard = entry.write().await;
            for lock in guard.unified.iter_mut() {
                let Some(lease) = lock.lease.as_mut() else { continue };
                if Some(lock.owner.owner_id.as_str()) == exclude_owner {
                    continue;
                }
                let current = lease.effective_state();
                let break_to_state = match trigger {
                    super::oplock_checker::BreakTrigger::Write => LeaseState::NONE,
                    super::oplock_checker::BreakTrigger::Delete => LeaseState::NONE,
                    super::oplock_checker::BreakTrigger::Read => {
                        if current.contains(LeaseState::WRITE) {
                            LeaseState::READ
                        } else {
                            continue;
                        }
                    }
                };
                if break_to_state == current {
                    continue;
                }

                lease.breaking = true;
                lease.break_to_state = break_to_state;
                lease.break_started = Some(Instant::now());
                lease.epoch = lease.epoch.wrapping_add(1);
                self.metrics.lease_break_initiated();

                pending.push(PendingBreak { file_handle: file_handle.clone(), lock: lock.clone(), break_to_state });
            }
        }

        if pending.is_empty() {
            return Ok(());
        }

        let subscribers = self.callbacks.read().unwrap().clone();
        for item in &pending {
            for subscriber in &subscribers {
                subscriber.on_oplock_break(&item.file_handle, &item.lock, item.break_to_state).await;
            }
        }

        Err(Error::LeaseBreakPending)
    }

    #[instrument(skip(self))]
    pub async fn check_and_break_for_write_impl(&self, file_handle: &FileHandle, exclude_owner: Option<&str>) -> Result<()> {
        self.check_and_break(file_handle, exclude_owner, super::oplock_checker::BreakTrigger::Write).await
    }

    #[instrument(skip(self))]
    pub async fn check_and_break_for_read_impl(&self, file_handle: &FileHandle, exclude_owner: Option<&str>) -> Result<()> {
        self.check_and_break(file_handle, exclude_owner, super::oplock_checker::BreakTrigger::Read).await
    }

    #[instrument(skip(self))]
    pub async fn check_and_break_for_delete_impl(&self, file_handle: &FileHandle, exclude_owner: Option<&str>) -> Result<()> {
        self.check_and_break(file_handle, exclude_owner, super::oplock_checker::BreakTrigger::Delete).await
    }

    /// Called when a lease holder confirms the downgrade (spec §4.2).
    #[instrument(skip(self))]
    pub async fn acknowledge_break(&self, file_handle: &FileHandle, lease_key: u128, acknowledged_state: LeaseState) -> Result<()> {
        let entry = self.entry_for(file_handle);
        let mut guard = entry.write().await;

        let position = guard
            .unified
            .iter()
            .position(|l| l.lease.as_ref().map(|lease| lease.lease_key) == Some(lease_key));

        let Some(index) = position else {
            return Err(Error::LockNotFound);
        };

        if acknowledged_state == LeaseState::NONE {
            guard.unified.remove(index);
            return Ok(());
        }

        let lease = guard.unified[index].lease.as_mut().expect("checked above");
        lease.lease_state = acknowledged_state;
        lease.breaking = false;
        lease.break_to_state = LeaseState::NONE;
        lease.break_started = None;
        lease.epoch = lease.epoch.wrapping_add(1);
        Ok(())
    }

    /// FREE_ALL's definitive cross-share cleanup entry point (spec §9):
    /// releases every lock whose owner id starts with `owner_prefix`
    /// across every tracked file.
    #[instrument(skip(self))]
    pub async fn release_all_with_owner_prefix(&self, owner_prefix: &str) {
        for item in self.files.iter() {
            let file_handle = item.key().clone();
            let entry = item.value().clone();
            let mut guard = entry.write().await;

            let mut removed_client_ids = Vec::new();
            guard.unified.retain(|l| {
                if l.owner.owner_id.starts_with(owner_prefix) {
                    warn!(owner = %l.owner.owner_id, "free_all releasing lock");
                    removed_client_ids.push(l.owner.client_id.clone());
                    false
                } else {
                    true
                }
            });
            guard.legacy.retain(|l| {
                let owner_id = format!("legacy:{}", l.session_id);
                if owner_id.starts_with(owner_prefix) {
                    warn!(owner = %owner_id, "free_all releasing legacy lock");
                    removed_client_ids.push(l.session_id.clone());
                    false
                } else {
                    true
                }
            });
            for client_id in &removed_client_ids {
                self.limits.release(&file_handle, client_id);
            }
        }
    }

    /// All views on this file, unified and legacy projected alike
    /// (spec §4.2: conflict resolution treats both representations).
    pub async fn locks_on_file(&self, file_handle: &FileHandle) -> Vec<UnifiedLock> {
        let entry = self.entry_for(file_handle);
        let guard = entry.read().await;
        guard.all_views(file_handle)
    }

    /// Every file handle with at least one tracked entry, used by the
    /// lease break-timeout scanner to iterate without holding any
    /// per-file lock across the sweep.
    pub fn tracked_file_handles(&self) -> Vec<FileHandle> {
        self.files.iter().map(|item| item.key().clone()).collect()
    }

    pub fn metrics(&self) -> &Arc<dyn Metrics> {
        &self.metrics
    }
}

#[async_trait]
impl OplockChecker for LockManager {
    async fn check_and_break_for_write(&self, file_handle: &FileHandle, exclude_owner: Option<&str>) -> Result<()> {
        self.check_and_break_for_write_impl(file_handle, exclude_owner).await
    }

    async fn check_and_break_for_read(&self, file_handle: &FileHandle, exclude_owner: Option<&str>) -> Result<()> {
        self.check_and_break_for_read_impl(file_handle, exclude_owner).await
    }

    async fn check_and_break_for_delete(&self, file_handle: &FileHandle, exclude_owner: Option<&str>) -> Result<()> {
        self.check_and_break_for_delete_impl(file_handle, exclude_owner).await
    }
}

/// Computes the fragments of `existing` that survive releasing
/// `release` from it (spec §4.2's four cases: full cover, prefix,
/// suffix, interior split).
fn split_remaining(existing: &Range, release: &Range) -> Vec<Range> {
    let existing_end = existing.end();
    let release_end = release.end();

    let release_covers_start = release.offset <= existing.offset;
    let release_covers_end = match (release_end, existing_end) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(re), Some(ee)) => re >= ee,
    };

    if release_covers_start && release_covers_end {
        return Vec::new();
    }

    if release_covers_start {
        // Suffix remains: [release_end, existing_end)
        let new_offset = release_end.expect("release_end is Some when it doesn't cover an infinite end");
        let new_length = match existing_end {
            Some(ee) => ee.saturating_sub(new_offset),
            None => 0,
        };
        return vec![Range::new(new_offset, new_length)];
    }

    if release_covers_end {
        // Prefix remains: [existing.offset, release.offset)
        return vec![Range::new(existing.offset, release.offset - existing.offset)];
    }

    // Interior split: [existing.offset, release.offset) and [release_end, existing_end)
    let prefix = Range::new(existing.offset, release.offset - existing.offset);
    let release_end = release_end.expect("interior split implies release has a finite end");
    let suffix_length = match existing_end {
        Some(ee) => ee.saturating_sub(release_end),
        None => 0,
    };
    vec![prefix, Range::new(release_end, suffix_length)]
}

fn merge_locks(mut locks: Vec<UnifiedLock>) -> Vec<UnifiedLock> {
    locks.sort_by_key(|l| (l.owner.owner_id.clone(), l.offset));
    let mut merged: Vec<UnifiedLock> = Vec::with_capacity(locks.len());

    for lock in locks {
        if lock.is_lease() {
            merged.push(lock);
            continue;
        }
        if let Some(last) = merged.last_mut() {
            let same_group = last.owner.owner_id == lock.owner.owner_id
                && std::mem::discriminant(&last.lock_type) == std::mem::discriminant(&lock.lock_type)
                && !last.is_lease();
            if same_group {
                let last_end = last.range().end();
                let can_merge = match last_end {
                    None => true,
                    Some(end) => lock.offset <= end,
                };
                if can_merge {
                    let new_end = match (last_end, lock.range().end()) {
                        (None, _) | (_, None) => None,
                        (Some(a), Some(b)) => Some(a.max(b)),
                    };
                    last.length = match new_end {
                        None => 0,
                        Some(end) => end - last.offset,
                    };
                    continue;
                }
            }
        }
        merged.push(lock);
    }

    merged
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::metrics::NullMetrics;

    fn manager() -> LockManager {
        LockManager::new(&Config::default(), Arc::new(NullMetrics))
    }

    fn handle() -> FileHandle {
        FileHandle::new(vec![1, 2, 3])
    }

    fn byte_lock(owner: &str, client: &str, offset: u64, length: u64, exclusive: bool) -> UnifiedLock {
        UnifiedLock {
            id: LockId(0),
            owner: LockOwner::new(owner, client, "share"),
            file_handle: handle(),
            offset,
            length,
            lock_type: if exclusive { LockType::Exclusive } else { LockType::Shared },
            access_mode: super::super::types::AccessMode::None,
            acquired_at: Instant::now(),
            blocking: false,
            reclaim: false,
            lease: None,
        }
    }

    #[tokio::test]
    async fn insert_then_release_round_trip() {
        let mgr = manager();
        let file = handle();
        mgr.insert(&file, byte_lock("o1", "c1", 0, 100, true)).await.unwrap();
        let owner = LockOwner::new("o1", "c1", "share");
        mgr.release(&file, &owner, 0, 100).await.unwrap();
        assert!(mgr.locks_on_file(&file).await.is_empty());
    }

    #[tokio::test]
    async fn overlapping_exclusive_conflicts() {
        let mgr = manager();
        let file = handle();
        mgr.insert(&file, byte_lock("o1", "c1", 0, 100, true)).await.unwrap();
        let result = mgr.insert(&file, byte_lock("o2", "c2", 50, 50, true)).await;
        assert!(matches!(result, Err(Error::LockConflict(_))));
    }

    #[tokio::test]
    async fn release_splits_interior() {
        let mgr = manager();
        let file = handle();
        mgr.insert(&file, byte_lock("o1", "c1", 0, 100, true)).await.unwrap();
        let owner = LockOwner::new("o1", "c1", "share");
        mgr.release(&file, &owner, 40, 20).await.unwrap();

        let mut ranges: Vec<(u64, u64)> = mgr.locks_on_file(&file).await.iter().map(|l| (l.offset, l.length)).collect();
        ranges.sort();
        assert_eq!(ranges, vec![(0, 40), (60, 40)]);
    }

    #[tokio::test]
    async fn release_shortens_prefix_and_suffix() {
        let mgr = manager();
        let file = handle();
        let owner = LockOwner::new("o1", "c1", "share");

        mgr.insert(&file, byte_lock("o1", "c1", 0, 100, true)).await.unwrap();
        mgr.release(&file, &owner, 0, 20).await.unwrap();
        let ranges: Vec<(u64, u64)> = mgr.locks_on_file(&file).await.iter().map(|l| (l.offset, l.length)).collect();
        assert_eq!(ranges, vec![(20, 80)]);

        mgr.release(&file, &owner, 90, 10).await.unwrap();
        let ranges: Vec<(u64, u64)> = mgr.locks_on_file(&file).await.iter().map(|l| (l.offset, l.length)).collect();
        assert_eq!(ranges, vec![(20, 70)]);
    }

    #[tokio::test]
    async fn upgrade_fails_with_foreign_shared_holder() {
        let mgr = manager();
        let file = handle();
        mgr.insert(&file, byte_lock("o1", "c1", 0, 100, false)).await.unwrap();
        mgr.insert(&file, byte_lock("o2", "c2", 0, 100, false)).await.unwrap();

        let owner = LockOwner::new("o1", "c1", "share");
        let result = mgr.upgrade(&file, &owner, 0, 100).await;
        assert!(matches!(result, Err(Error::LockConflict(_))));
    }

    #[tokio::test]
    async fn upgrade_succeeds_alone() {
        let mgr = manager();
        let file = handle();
        mgr.insert(&file, byte_lock("o1", "c1", 0, 100, false)).await.unwrap();
        let owner = LockOwner::new("o1", "c1", "share");
        let upgraded = mgr.upgrade(&file, &owner, 0, 100).await.unwrap();
        assert!(matches!(upgraded.lock_type, LockType::Exclusive));
    }

    #[tokio::test]
    async fn upgrade_is_noop_if_already_exclusive() {
        let mgr = manager();
        let file = handle();
        mgr.insert(&file, byte_lock("o1", "c1", 0, 100, true)).await.unwrap();
        let owner = LockOwner::new("o1", "c1", "share");
        assert!(mgr.upgrade(&file, &owner, 0, 100).await.is_ok());
    }

    #[tokio::test]
    async fn lock_limit_exceeded_when_per_file_cap_hit() {
        let mut config = Config::default();
        config.max_locks_per_file = 1;
        let mgr = LockManager::new(&config, Arc::new(NullMetrics));
        let file = handle();
        mgr.insert(&file, byte_lock("o1", "c1", 0, 10, true)).await.unwrap();
        let result = mgr.insert(&file, byte_lock("o2", "c2", 100, 10, true)).await;
        assert!(matches!(result, Err(Error::LockLimitExceeded)));
    }

    #[tokio::test]
    async fn release_all_for_client_clears_everything() {
        let mgr = manager();
        let file = handle();
        mgr.insert(&file, byte_lock("o1", "c1", 0, 10, true)).await.unwrap();
        mgr.insert(&file, byte_lock("o1b", "c1", 20, 10, true)).await.unwrap();
        mgr.release_all_for_client("c1").await;
        assert!(mgr.locks_on_file(&file).await.is_empty());
    }

    #[tokio::test]
    async fn write_triggers_lease_break_to_none() {
        let mgr = manager();
        let file = handle();
        let lease = crate::lock::conflict::test_support::lease("smb:1", 7, LeaseState::READ | LeaseState::WRITE);
        mgr.insert(&file, lease).await.unwrap();

        let result = mgr.check_and_break_for_write_impl(&file, Some("nfs:writer")).await;
        assert!(matches!(result, Err(Error::LeaseBreakPending)));

        let locks = mgr.locks_on_file(&file).await;
        let lease = locks[0].lease.as_ref().unwrap();
        assert!(lease.breaking);
        assert_eq!(lease.break_to_state, LeaseState::NONE);
    }

    #[tokio::test]
    async fn acknowledge_break_to_none_removes_lease() {
        let mgr = manager();
        let file = handle();
        let lease = crate::lock::conflict::test_support::lease("smb:1", 7, LeaseState::READ | LeaseState::WRITE);
        mgr.insert(&file, lease).await.unwrap();
        mgr.check_and_break_for_write_impl(&file, None).await.ok();
        mgr.acknowledge_break(&file, 7, LeaseState::NONE).await.unwrap();
        assert!(mgr.locks_on_file(&file).await.is_empty());
    }

    #[test]
    fn merge_coalesces_adjacent_same_owner_locks() {
        let a = byte_lock("o1", "c1", 0, 50, true);
        let b = byte_lock("o1", "c1", 50, 50, true);
        let merged = merge_locks(vec![a, b]);
        assert_eq!(merged.len(), 1);
        assert_eq!((merged[0].offset, merged[0].length), (0, 100));
    }

    #[test]
    fn merge_keeps_different_owners_separate() {
        let a = byte_lock("o1", "c1", 0, 50, true);
        let b = byte_lock("o2", "c2", 50, 50, true);
        let merged = merge_locks(vec![a, b]);
        assert_eq!(merged.len(), 2);
    }

    fn file_lock(session_id: &str, offset: u64, length: u64, exclusive: bool) -> FileLock {
        FileLock { id: LockId(0), session_id: session_id.to_string(), offset, length, exclusive }
    }

    #[tokio::test]
    async fn legacy_lock_conflicts_with_unified_lock_on_same_file() {
        let mgr = manager();
        let file = handle();
        mgr.insert(&file, byte_lock("o1", "c1", 0, 100, true)).await.unwrap();
        let result = mgr.insert_legacy(&file, file_lock("session-2", 50, 10, true)).await;
        assert!(matches!(result, Err(Error::LockConflict(_))));
    }

    #[tokio::test]
    async fn legacy_lock_insert_and_release_round_trip() {
        let mgr = manager();
        let file = handle();
        mgr.insert_legacy(&file, file_lock("session-1", 0, 100, true)).await.unwrap();
        assert_eq!(mgr.locks_on_file(&file).await.len(), 1);

        let owner = LockOwner::new("legacy:session-1", "session-1", String::new());
        mgr.release(&file, &owner, 0, 100).await.unwrap();
        assert!(mgr.locks_on_file(&file).await.is_empty());
    }

    #[tokio::test]
    async fn release_all_for_client_also_clears_legacy_locks() {
        let mgr = manager();
        let file = handle();
        mgr.insert_legacy(&file, file_lock("c1", 0, 10, true)).await.unwrap();
        mgr.release_all_for_client("c1").await;
        assert!(mgr.locks_on_file(&file).await.is_empty());
    }

    #[tokio::test]
    async fn conflicting_owners_returns_every_distinct_conflicting_owner() {
        let mgr = manager();
        let file = handle();
        mgr.insert(&file, byte_lock("o1", "c1", 0, 50, false)).await.unwrap();
        mgr.insert(&file, byte_lock("o2", "c2", 25, 50, false)).await.unwrap();

        let candidate = byte_lock("o3", "c3", 0, 75, true);
        let owners = mgr.conflicting_owners(&file, &candidate).await;
        assert_eq!(owners, vec!["o1".to_string(), "o2".to_string()]);
    }
}
