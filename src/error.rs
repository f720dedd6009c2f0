//! Crate-wide error taxonomy for the lock/lease core (spec §7).

use std::fmt;

/// Errors the lock/lease core can return to its callers.
///
/// `LeaseBreakPending` is internal-only: it drives the NFS-side poll
/// loop in [`crate::lock::oplock_checker`] and must never be surfaced
/// on the wire by a protocol handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    NotFound,
    LockNotFound,
    Locked,
    LockConflict(Box<crate::lock::types::UnifiedLock>),
    LockLimitExceeded,
    Deadlock,
    GracePeriod { remaining_seconds: u64 },
    ConnectionLimitReached,
    InvalidArgument(&'static str),
    StaleHandle,
    AccessDenied,
    PermissionDenied,
    NotSupported,
    IOError(String),
    LeaseBreakPending,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotFound => write!(f, "not found"),
            Error::LockNotFound => write!(f, "lock not found"),
            Error::Locked => write!(f, "resource is locked"),
            Error::LockConflict(_) => write!(f, "lock conflict"),
            Error::LockLimitExceeded => write!(f, "lock limit exceeded"),
            Error::Deadlock => write!(f, "operation would deadlock"),
            Error::GracePeriod { remaining_seconds } => {
                write!(f, "server is in grace period, {remaining_seconds}s remaining")
            }
            Error::ConnectionLimitReached => write!(f, "connection limit reached"),
            Error::InvalidArgument(why) => write!(f, "invalid argument: {why}"),
            Error::StaleHandle => write!(f, "stale file handle"),
            Error::AccessDenied => write!(f, "access denied"),
            Error::PermissionDenied => write!(f, "permission denied"),
            Error::NotSupported => write!(f, "operation not supported"),
            Error::IOError(msg) => write!(f, "I/O error: {msg}"),
            Error::LeaseBreakPending => write!(f, "lease break pending"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;
