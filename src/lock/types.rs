//! Core lock/lease data model (spec §3).

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use bitflags::bitflags;

pub use crate::owner::LockOwner;

/// Opaque bytes identifying a file, as handed to the core by whichever
/// protocol is driving it. Never interpreted, only compared and hashed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileHandle(pub Vec<u8>);

impl FileHandle {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }
}

impl From<&[u8]> for FileHandle {
    fn from(value: &[u8]) -> Self {
        Self(value.to_vec())
    }
}

/// Globally unique identifier assigned to a [`UnifiedLock`] at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockId(pub u64);

/// Byte-range lock type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockType {
    Shared,
    Exclusive,
}

/// SMB share-mode reservation. Ignored by NFS-family protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    None,
    DenyRead,
    DenyWrite,
    DenyAll,
}

impl AccessMode {
    pub fn is_none(self) -> bool {
        matches!(self, AccessMode::None)
    }
}

bitflags! {
    /// SMB2/3 lease state mask (spec §3): Read=0x01, Write=0x02, Handle=0x04.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct LeaseState: u8 {
        const READ = 0x01;
        const WRITE = 0x02;
        const HANDLE = 0x04;
    }
}

impl LeaseState {
    pub const NONE: LeaseState = LeaseState::empty();

    /// The valid file lease states are exactly {None, R, RW, RH, RWH}.
    /// W-alone, H-alone and WH are invalid.
    pub fn is_valid_for_file(self) -> bool {
        matches!(
            self,
            LeaseState::NONE
        ) || self.contains(LeaseState::READ)
    }

    /// The valid directory lease states are exactly {None, R, RH}.
    pub fn is_valid_for_directory(self) -> bool {
        self == LeaseState::NONE || self == LeaseState::READ || self == LeaseState::READ | LeaseState::HANDLE
    }
}

/// Whether an [`OpLock`] was granted over a file or a directory; governs
/// which set of lease states ingress validation accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseScope {
    File,
    Directory,
}

/// SMB2/3 opportunistic-caching grant (spec §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpLock {
    /// 128-bit client-chosen key. Multiple handles sharing this key
    /// share the lease.
    pub lease_key: u128,
    pub scope: LeaseScope,
    pub lease_state: LeaseState,
    /// Target state while a break is in progress; `empty()` if none.
    pub break_to_state: LeaseState,
    pub breaking: bool,
    /// Incremented on every state change.
    pub epoch: u16,
    pub break_started: Option<Instant>,
    pub reclaim: bool,
}

impl OpLock {
    /// The state conflict checks must use: `break_to_state` while a
    /// break is in flight, `lease_state` otherwise (spec §3 invariant).
    pub fn effective_state(&self) -> LeaseState {
        if self.breaking {
            self.break_to_state
        } else {
            self.lease_state
        }
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        let valid = match self.scope {
            LeaseScope::File => self.lease_state.is_valid_for_file(),
            LeaseScope::Directory => self.lease_state.is_valid_for_directory(),
        };
        if valid {
            Ok(())
        } else {
            Err("invalid lease state for scope")
        }
    }
}

/// The single record representing either a byte-range lock or an
/// SMB2/3 lease (spec §3, §9 "Lease vs byte-range in one record").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnifiedLock {
    pub id: LockId,
    pub owner: LockOwner,
    pub file_handle: FileHandle,
    /// `length == 0` means "to end of file"; for leases both are 0.
    pub offset: u64,
    pub length: u64,
    pub lock_type: LockType,
    pub access_mode: AccessMode,
    pub acquired_at: Instant,
    pub blocking: bool,
    pub reclaim: bool,
    /// If present, this record denotes a lease rather than a byte-range lock.
    pub lease: Option<OpLock>,
}

impl UnifiedLock {
    pub fn is_lease(&self) -> bool {
        self.lease.is_some()
    }

    /// `length + offset` never overflows; `length == 0` is treated as
    /// infinity by the range algebra (spec §3 invariant).
    pub fn range(&self) -> super::range::Range {
        super::range::Range { offset: self.offset, length: self.length }
    }

    /// Enforces the spec §3 invariant that a lease always covers `[0, 0)`.
    pub fn validate(&self) -> Result<(), &'static str> {
        if let Some(lease) = &self.lease {
            if self.offset != 0 || self.length != 0 {
                return Err("lease records must have offset=0 and length=0");
            }
            lease.validate()?;
        }
        if self.offset.checked_add(self.length).is_none() {
            return Err("offset + length overflows");
        }
        Ok(())
    }
}

/// Legacy per-session record (spec §3), coexisting with [`UnifiedLock`]
/// on the same per-file table.
#[derive(Debug, Clone)]
pub struct FileLock {
    pub id: LockId,
    pub session_id: String,
    pub offset: u64,
    pub length: u64,
    pub exclusive: bool,
}

impl FileLock {
    pub fn range(&self) -> super::range::Range {
        super::range::Range { offset: self.offset, length: self.length }
    }

    /// Projects this legacy record onto the unified shape so the
    /// conflict predicate can treat both kinds of record uniformly.
    pub fn as_unified_view(&self, file_handle: FileHandle) -> UnifiedLock {
        UnifiedLock {
            id: self.id,
            owner: LockOwner::new(format!("legacy:{}", self.session_id), self.session_id.clone(), String::new()),
            file_handle,
            offset: self.offset,
            length: self.length,
            lock_type: if self.exclusive { LockType::Exclusive } else { LockType::Shared },
            access_mode: AccessMode::None,
            acquired_at: Instant::now(),
            blocking: false,
            reclaim: false,
            lease: None,
        }
    }
}

/// A queued blocking lock request (spec §3).
#[derive(Debug, Clone)]
pub struct Waiter {
    pub requested: UnifiedLock,
    pub cookie: Vec<u8>,
    pub callback_addr: std::net::SocketAddr,
    pub callback_program: u32,
    pub callback_version: u32,
    pub caller_name: String,
    pub svid: i32,
    pub oh: Vec<u8>,
    pub file_handle: FileHandle,
    pub queued_at: Instant,
    pub cancelled: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl Waiter {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

/// Flat, serialization-friendly mirror of [`UnifiedLock`] for persistence.
///
/// `breaking`, `reclaim`, `blocking` and `break_started` are documented
/// by spec §8 as not required to survive a persist/restore round trip.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PersistedLock {
    pub id: u64,
    pub owner_id: String,
    pub client_id: String,
    pub share_name: String,
    pub file_handle: Vec<u8>,
    pub offset: u64,
    pub length: u64,
    pub exclusive: bool,
    pub access_mode: u8,
    pub is_lease: bool,
    pub lease_key: Option<u128>,
    pub lease_state: u8,
    pub breaking: bool,
    pub break_to_state: u8,
    pub break_started_millis: Option<u64>,
    pub epoch: u16,
    pub reclaim: bool,
    pub blocking: bool,
    /// Server epoch captured at persist time, so a restart can
    /// distinguish pre-restart records (spec §3).
    pub server_epoch: u64,
}

fn access_mode_to_u8(mode: AccessMode) -> u8 {
    match mode {
        AccessMode::None => 0,
        AccessMode::DenyRead => 1,
        AccessMode::DenyWrite => 2,
        AccessMode::DenyAll => 3,
    }
}

fn access_mode_from_u8(value: u8) -> AccessMode {
    match value {
        1 => AccessMode::DenyRead,
        2 => AccessMode::DenyWrite,
        3 => AccessMode::DenyAll,
        _ => AccessMode::None,
    }
}

fn instant_to_millis_since(instant: Instant, reference: Instant, reference_wall: SystemTime) -> u64 {
    let wall = reference_wall + instant.saturating_duration_since(reference);
    wall.duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

impl UnifiedLock {
    /// Converts this lock to its persisted mirror. `now`/`now_wall` pin
    /// down the monotonic-to-wall-clock correspondence used to stamp
    /// `break_started_millis`.
    pub fn to_persisted(&self, server_epoch: u64, now: Instant, now_wall: SystemTime) -> PersistedLock {
        let (is_lease, lease_key, lease_state, breaking, break_to_state, break_started_millis, epoch) =
            match &self.lease {
                Some(lease) => (
                    true,
                    Some(lease.lease_key),
                    lease.lease_state.bits(),
                    lease.breaking,
                    lease.break_to_state.bits(),
                    lease.break_started.map(|t| instant_to_millis_since(t, now, now_wall)),
                    lease.epoch,
                ),
                None => (false, None, 0, false, 0, None, 0),
            };

        PersistedLock {
            id: self.id.0,
            owner_id: self.owner.owner_id.clone(),
            client_id: self.owner.client_id.clone(),
            share_name: self.owner.share_name.clone(),
            file_handle: self.file_handle.0.clone(),
            offset: self.offset,
            length: self.length,
            exclusive: matches!(self.lock_type, LockType::Exclusive),
            access_mode: access_mode_to_u8(self.access_mode),
            is_lease,
            lease_key,
            lease_state,
            breaking,
            break_to_state,
            break_started_millis,
            epoch,
            reclaim: self.reclaim,
            blocking: self.blocking,
            server_epoch,
        }
    }

    /// Reconstructs a [`UnifiedLock`] from its persisted mirror. The
    /// runtime-only fields not covered by spec §8 (`breaking`,
    /// `reclaim`, `blocking`, `break_started`) are *not* guaranteed to
    /// round-trip exactly, but are populated best-effort from the
    /// persisted record so a restart can still make progress.
    pub fn from_persisted(persisted: &PersistedLock, now: Instant) -> Self {
        let lease = if persisted.is_lease {
            Some(OpLock {
                lease_key: persisted.lease_key.unwrap_or_default(),
                scope: LeaseScope::File,
                lease_state: LeaseState::from_bits_truncate(persisted.lease_state),
                break_to_state: LeaseState::from_bits_truncate(persisted.break_to_state),
                breaking: persisted.breaking,
                epoch: persisted.epoch,
                break_started: if persisted.breaking { Some(now) } else { None },
                reclaim: persisted.reclaim,
            })
        } else {
            None
        };

        UnifiedLock {
            id: LockId(persisted.id),
            owner: LockOwner::new(
                persisted.owner_id.clone(),
                persisted.client_id.clone(),
                persisted.share_name.clone(),
            ),
            file_handle: FileHandle(persisted.file_handle.clone()),
            offset: persisted.offset,
            length: persisted.length,
            lock_type: if persisted.exclusive { LockType::Exclusive } else { LockType::Shared },
            access_mode: access_mode_from_u8(persisted.access_mode),
            acquired_at: now,
            blocking: persisted.blocking,
            reclaim: persisted.reclaim,
            lease,
        }
    }
}

/// Flat mirror of a client's NSM monitoring registration (spec §3, §4.9).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PersistedClientRegistration {
    pub client_id: String,
    pub mon_name: Option<String>,
    pub priv_data: Option<[u8; 16]>,
    pub callback_host: Option<String>,
    pub callback_prog: Option<u32>,
    pub callback_vers: Option<u32>,
    pub callback_proc: Option<u32>,
    pub registered_at_millis: u64,
    pub server_epoch: u64,
}

/// Post-restart grace state (spec §3, §4.8).
#[derive(Debug, Clone)]
pub enum GraceState {
    Normal,
    Active {
        grace_end: Instant,
        expected_clients: std::collections::HashSet<String>,
        reclaimed_clients: std::collections::HashSet<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_lease_state_validity() {
        assert!(LeaseState::NONE.is_valid_for_file());
        assert!(LeaseState::READ.is_valid_for_file());
        assert!((LeaseState::READ | LeaseState::WRITE).is_valid_for_file());
        assert!((LeaseState::READ | LeaseState::HANDLE).is_valid_for_file());
        assert!((LeaseState::READ | LeaseState::WRITE | LeaseState::HANDLE).is_valid_for_file());

        assert!(!LeaseState::WRITE.is_valid_for_file());
        assert!(!LeaseState::HANDLE.is_valid_for_file());
        assert!(!(LeaseState::WRITE | LeaseState::HANDLE).is_valid_for_file());
    }

    #[test]
    fn directory_lease_state_validity() {
        assert!(LeaseState::NONE.is_valid_for_directory());
        assert!(LeaseState::READ.is_valid_for_directory());
        assert!((LeaseState::READ | LeaseState::HANDLE).is_valid_for_directory());
        assert!(!(LeaseState::READ | LeaseState::WRITE).is_valid_for_directory());
        assert!(!LeaseState::WRITE.is_valid_for_directory());
    }

    #[test]
    fn effective_state_uses_break_to_state_while_breaking() {
        let lease = OpLock {
            lease_key: 1,
            scope: LeaseScope::File,
            lease_state: LeaseState::READ | LeaseState::WRITE,
            break_to_state: LeaseState::READ,
            breaking: true,
            epoch: 1,
            break_started: Some(Instant::now()),
            reclaim: false,
        };
        assert_eq!(lease.effective_state(), LeaseState::READ);
    }

    #[test]
    fn lease_offset_length_invariant_enforced() {
        let lock = UnifiedLock {
            id: LockId(1),
            owner: LockOwner::new("smb:1", "c1", "share"),
            file_handle: FileHandle::new(vec![1]),
            offset: 10,
            length: 0,
            lock_type: LockType::Exclusive,
            access_mode: AccessMode::None,
            acquired_at: Instant::now(),
            blocking: false,
            reclaim: false,
            lease: Some(OpLock {
                lease_key: 1,
                scope: LeaseScope::File,
                lease_state: LeaseState::READ,
                break_to_state: LeaseState::NONE,
                breaking: false,
                epoch: 0,
                break_started: None,
                reclaim: false,
            }),
        };
        assert!(lock.validate().is_err());
    }
}
