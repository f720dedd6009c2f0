//! Persistence contract for locks/leases and client monitoring
//! registrations (spec §4.10, §6). Only the interface is in scope;
//! concrete backends (in-memory, embedded KV, relational) are external
//! collaborators (spec §1).

use async_trait::async_trait;

use super::types::{PersistedClientRegistration, PersistedLock};
use crate::error::Result;

/// Filter for [`LockStore::list_locks`]. Every field is optional; a
/// `None` field is not filtered on.
#[derive(Debug, Clone, Default)]
pub struct LockQuery {
    pub file_id: Option<Vec<u8>>,
    pub owner_id: Option<String>,
    pub client_id: Option<String>,
    pub share_name: Option<String>,
    pub is_lease: Option<bool>,
}

impl LockQuery {
    pub fn matches(&self, lock: &PersistedLock) -> bool {
        if let Some(file_id) = &self.file_id {
            if &lock.file_handle != file_id {
                return false;
            }
        }
        if let Some(owner_id) = &self.owner_id {
            if &lock.owner_id != owner_id {
                return false;
            }
        }
        if let Some(client_id) = &self.client_id {
            if &lock.client_id != client_id {
                return false;
            }
        }
        if let Some(share_name) = &self.share_name {
            if &lock.share_name != share_name {
                return false;
            }
        }
        if let Some(is_lease) = self.is_lease {
            if lock.is_lease != is_lease {
                return false;
            }
        }
        true
    }
}

/// Backing store for locks/leases and NSM-style client registrations.
///
/// Implementations may be synchronous or asynchronous internally; the
/// core always treats calls as blocking operations guarded by the
/// caller's cancellation context (spec §4.10, §5).
#[async_trait]
pub trait LockStore: Send + Sync {
    async fn put_lock(&self, lock: PersistedLock) -> Result<()>;
    async fn get_lock(&self, id: u64) -> Result<Option<PersistedLock>>;
    async fn delete_lock(&self, id: u64) -> Result<()>;
    async fn list_locks(&self, query: LockQuery) -> Result<Vec<PersistedLock>>;
    async fn delete_locks_by_client(&self, client_id: &str) -> Result<usize>;
    async fn delete_locks_by_file(&self, file_id: &[u8]) -> Result<usize>;

    async fn get_server_epoch(&self) -> Result<u64>;
    async fn increment_server_epoch(&self) -> Result<u64>;

    async fn put_client_registration(&self, registration: PersistedClientRegistration) -> Result<()>;
    async fn get_client_registration(&self, client_id: &str) -> Result<Option<PersistedClientRegistration>>;
    async fn delete_client_registration(&self, client_id: &str) -> Result<()>;
    async fn list_client_registrations(&self) -> Result<Vec<PersistedClientRegistration>>;
    async fn delete_all_client_registrations(&self) -> Result<usize>;
    async fn delete_client_registrations_by_mon_name(&self, mon_name: &str) -> Result<usize>;
}


#[cfg(test)]
mod tests {
    use super::test_store::InMemoryLockStore;
    use super::*;

    fn sample_lock(id: u64, client_id: &str) -> PersistedLock {
        PersistedLock {
            id,
            owner_id: format!("nlm:host:{id}:00"),
            client_id: client_id.to_string(),
            share_name: "share".to_string(),
            file_handle: vec![1, 2, 3],
            offset: 0,
            length: 100,
            exclusive: true,
            access_mode: 0,
            is_lease: false,
            lease_key: None,
            lease_state: 0,
            breaking: false,
            break_to_state: 0,
            break_started_millis: None,
            epoch: 0,
            reclaim: false,
            blocking: false,
            server_epoch: 0,
        }
    }

    #[tokio::test]
    async fn round_trip_put_get_delete() {
        let store = InMemoryLockStore::new();
        store.put_lock(sample_lock(1, "c1")).await.unwrap();
        assert!(store.get_lock(1).await.unwrap().is_some());
        store.delete_lock(1).await.unwrap();
        assert!(store.get_lock(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_locks_filters_by_client() {
        let store = InMemoryLockStore::new();
        store.put_lock(sample_lock(1, "c1")).await.unwrap();
        store.put_lock(sample_lock(2, "c2")).await.unwrap();
        let query = LockQuery { client_id: Some("c1".to_string()), ..Default::default() };
        let result = store.list_locks(query).await.unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].id, 1);
    }

    #[tokio::test]
    async fn server_epoch_is_monotonic() {
        let store = InMemoryLockStore::new();
        assert_eq!(store.get_server_epoch().await.unwrap(), 0);
        assert_eq!(store.increment_server_epoch().await.unwrap(), 1);
        assert_eq!(store.increment_server_epoch().await.unwrap(), 2);
    }
}
