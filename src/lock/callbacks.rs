//! Break-callback subscription interface (spec §6).
//!
//! SMB adapters register all three methods; NFS adapters typically
//! register only `on_oplock_break` (for delegation recall).

use async_trait::async_trait;

use super::types::{FileHandle, LeaseState, UnifiedLock};

#[async_trait]
pub trait BreakCallbacks: Send + Sync {
    async fn on_oplock_break(&self, file_handle: &FileHandle, lock: &UnifiedLock, break_to_state: LeaseState);

    async fn on_byte_range_revoke(&self, file_handle: &FileHandle, lock: &UnifiedLock, reason: &str);

    async fn on_access_conflict(
        &self,
        file_handle: &FileHandle,
        existing: &UnifiedLock,
        requested_mode: super::types::AccessMode,
    );
}
