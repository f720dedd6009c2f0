//! Per-client connection tracking: registration, liveness and
//! TTL-delayed disconnect handling (spec §4.9).
//!
//! Carries the NSM monitoring fields inline rather than as a separate
//! protocol handler, since full `SM_MON`/`SM_NOTIFY` wire support is out
//! of scope; adapters that do speak NSM populate these fields directly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{info, instrument};

use super::limits::ConnectionLimits;
use crate::error::Result;

/// NSM-derived monitoring fields a client registration may carry
/// (spec §3, §4.9). `None` when the adapter doesn't speak NSM.
#[derive(Debug, Clone, Default)]
pub struct MonitorInfo {
    pub mon_name: Option<String>,
    pub priv_data: Option<[u8; 16]>,
    pub callback_host: Option<String>,
    pub callback_prog: Option<u32>,
    pub callback_vers: Option<u32>,
    pub callback_proc: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct ClientRecord {
    pub client_id: String,
    pub adapter_type: String,
    pub remote_addr: std::net::SocketAddr,
    pub registered_at: Instant,
    pub last_seen: Instant,
    pub lock_count: usize,
    pub monitor: MonitorInfo,
}

/// Implemented by the lock manager (and blocking queue) to drop a
/// client's state once its TTL elapses without a reconnect.
#[async_trait::async_trait]
pub trait ClientCleanup: Send + Sync {
    async fn on_client_disconnected(&self, client_id: &str);
}

/// Tracks live client registrations across all protocol adapters.
///
/// Registration is idempotent: re-registering an already-known
/// `client_id` refreshes `last_seen` and cancels any pending
/// disconnect rather than erroring (spec §4.9).
pub struct ConnectionTracker {
    clients: DashMap<String, ClientRecord>,
    pending_disconnects: DashMap<String, JoinHandle<()>>,
    limits: ConnectionLimits,
    ttl: Duration,
    cleanup: std::sync::RwLock<Vec<Arc<dyn ClientCleanup>>>,
}

impl ConnectionTracker {
    pub fn new(ttl: Duration) -> Self {
        Self {
            clients: DashMap::new(),
            pending_disconnects: DashMap::new(),
            limits: ConnectionLimits::new(),
            ttl,
            cleanup: std::sync::RwLock::new(Vec::new()),
        }
    }

    pub fn set_adapter_cap(&self, adapter: &str, cap: usize) {
        self.limits.set_cap(adapter, cap);
    }

    pub fn register_cleanup(&self, handler: Arc<dyn ClientCleanup>) {
        self.cleanup.write().unwrap().push(handler);
    }

    #[instrument(skip(self))]
    pub fn register(
        &self,
        client_id: &str,
        adapter_type: &str,
        remote_addr: std::net::SocketAddr,
        monitor: MonitorInfo,
    ) -> Result<()> {
        if let Some(handle) = self.pending_disconnects.remove(client_id) {
            handle.1.abort();
        }

        if self.clients.contains_key(client_id) {
            let mut record = self.clients.get_mut(client_id).unwrap();
            record.last_seen = Instant::now();
            record.adapter_type = adapter_type.to_string();
            record.remote_addr = remote_addr;
            if monitor.mon_name.is_some() {
                record.monitor = monitor;
            }
            return Ok(());
        }

        self.limits.try_register(adapter_type)?;
        let now = Instant::now();
        self.clients.insert(
            client_id.to_string(),
            ClientRecord {
                client_id: client_id.to_string(),
                adapter_type: adapter_type.to_string(),
                remote_addr,
                registered_at: now,
                last_seen: now,
                lock_count: 0,
                monitor,
            },
        );
        Ok(())
    }

    pub fn touch(&self, client_id: &str) {
        if let Some(mut record) = self.clients.get_mut(client_id) {
            record.last_seen = Instant::now();
        }
    }

    pub fn set_lock_count(&self, client_id: &str, count: usize) {
        if let Some(mut record) = self.clients.get_mut(client_id) {
            record.lock_count = count;
        }
    }

    pub fn get(&self, client_id: &str) -> Option<ClientRecord> {
        self.clients.get(client_id).map(|r| r.clone())
    }

    pub fn all(&self) -> Vec<ClientRecord> {
        self.clients.iter().map(|r| r.value().clone()).collect()
    }

    /// Schedules removal of `client_id` after the tracker's default TTL
    /// rather than immediately, so a brief reconnect doesn't tear down
    /// locks unnecessarily (spec §4.9). A subsequent [`Self::register`]
    /// call for the same `client_id` cancels this.
    pub fn schedule_disconnect(tracker: Arc<Self>, client_id: String) {
        let ttl = tracker.ttl;
        Self::spawn_disconnect_after(tracker, client_id, ttl);
    }

    /// Unregisters `client_id` with a per-call TTL (spec §4.9):
    /// `ttl = 0` tears the client down synchronously, `ttl > 0` schedules
    /// it exactly like [`Self::schedule_disconnect`] but against the
    /// caller-supplied duration rather than the tracker's default.
    #[instrument(skip(tracker))]
    pub async fn unregister(tracker: Arc<Self>, client_id: &str, ttl: Duration) {
        if ttl.is_zero() {
            if let Some((_, handle)) = tracker.pending_disconnects.remove(client_id) {
                handle.abort();
            }
            tracker.teardown_now(client_id).await;
            return;
        }
        Self::spawn_disconnect_after(tracker, client_id.to_string(), ttl);
    }

    fn spawn_disconnect_after(tracker: Arc<Self>, client_id: String, ttl: Duration) {
        let task_tracker = tracker.clone();
        let task_client_id = client_id.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            task_tracker.pending_disconnects.remove(&task_client_id);
            task_tracker.teardown_now(&task_client_id).await;
        });
        tracker.pending_disconnects.insert(client_id, task);
    }

    async fn teardown_now(&self, client_id: &str) {
        let adapter_type = self.clients.remove(client_id).map(|(_, r)| r.adapter_type);
        if let Some(adapter_type) = adapter_type {
            self.limits.unregister(&adapter_type);
        }
        info!(client_id = %client_id, "client torn down");

        let handlers = self.cleanup.read().unwrap().clone();
        for handler in handlers {
            handler.on_client_disconnected(client_id).await;
        }
    }

    pub fn cancel_disconnect(&self, client_id: &str) {
        if let Some((_, handle)) = self.pending_disconnects.remove(client_id) {
            handle.abort();
        }
    }

    /// Tears down every tracked client immediately, used on full server
    /// shutdown. Skips the TTL delay entirely.
    pub fn close(&self) {
        for item in self.pending_disconnects.iter() {
            item.value().abort();
        }
        self.pending_disconnects.clear();
        self.clients.clear();
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Snapshot used when entering the grace period: every currently
    /// registered client, keyed by id, is expected to reclaim.
    pub fn expected_clients(&self) -> HashMap<String, ClientRecord> {
        self.clients.iter().map(|r| (r.key().clone(), r.value().clone())).collect()
    }
}
