//! Protocol-agnostic lock owner identity (spec §3, §9).
//!
//! The core treats `owner_id` as an opaque string: it is never parsed
//! inside the lock manager, deadlock graph or blocking queue, only
//! compared for equality. Only the NLM translation helpers
//! ([`crate::nlm::owner`]) build and parse the `nlm:` encoding.

/// Identity of whoever is holding or requesting a lock, independent of
/// which wire protocol they arrived on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockOwner {
    /// Opaque identity string. Distinct protocols use distinct
    /// prefixes (`nlm:<host>:<svid>:<oh_hex>`, `smb:<session>`,
    /// `nfs4:<clientid>:<stateid>`) so owners from different protocols
    /// never collide by accident.
    pub owner_id: String,
    /// Links back to the [`crate::lock::connection::ConnectionTracker`] entry.
    pub client_id: String,
    pub share_name: String,
}

impl LockOwner {
    pub fn new(owner_id: impl Into<String>, client_id: impl Into<String>, share_name: impl Into<String>) -> Self {
        Self { owner_id: owner_id.into(), client_id: client_id.into(), share_name: share_name.into() }
    }
}
