//! Cross-protocol advisory lock and lease core (spec §3, §4).
//!
//! This module owns the unified data model, conflict predicate and the
//! stateful collaborators ([`manager::LockManager`], [`blocking_queue::BlockingQueue`],
//! [`deadlock::WaitForGraph`], [`grace::GracePeriodManager`],
//! [`connection::ConnectionTracker`], [`lease_scanner::LeaseBreakScanner`])
//! that protocol adapters (NLM, SMB, NFSv4) drive.

pub mod blocking_queue;
pub mod callbacks;
pub mod conflict;
pub mod connection;
pub mod deadlock;
pub mod grace;
pub mod lease_scanner;
pub mod limits;
pub mod manager;
pub mod oplock_checker;
pub mod persistence;
pub mod range;
pub mod types;

pub use manager::LockManager;
pub use types::{FileHandle, LockId, UnifiedLock};
