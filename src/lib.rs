//! Cross-protocol advisory lock and lease manager for a multi-protocol
//! file server: unifies NLM byte-range locks, SMB byte-range locks,
//! SMB2/3 leases, SMB share-mode reservations and NFS-style delegations
//! behind one conflict algebra, blocking queue, deadlock detector and
//! grace-period reclaim state machine.

pub mod config;
pub mod error;
pub mod lock;
pub mod metrics;
pub mod nlm;
pub mod owner;

pub use config::Config;
pub use error::{Error, Result};
pub use lock::LockManager;
