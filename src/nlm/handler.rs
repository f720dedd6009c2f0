//! NLM v4 protocol handler: translates wire requests into calls against
//! the cross-protocol lock core (spec §4.4).
//!
//! Procedures are exposed as ordinary `async fn`s rather than the
//! promise/`keep()` continuation style used elsewhere in this codebase
//! for stubbed procedures — there is no deferred reply here, every
//! request either resolves immediately or is queued by
//! [`crate::lock::blocking_queue::BlockingQueue`] and resolved later by
//! a GRANTED callback.

use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

use tracing::{instrument, warn};

use super::owner;
use super::xdr::{
    Nlm4CancArgs, Nlm4Holder, Nlm4Lock, Nlm4LockArgs, Nlm4Notify, Nlm4Res, Nlm4ShareArgs, Nlm4ShareRes, Nlm4Stat,
    Nlm4TestArgs, Nlm4TestReply, Nlm4TestRes, Nlm4UnlockArgs,
};
use crate::config::Config;
use crate::error::Error;
use crate::lock::blocking_queue::{BlockingQueue, GrantedSink};
use crate::lock::connection::ConnectionTracker;
use crate::lock::deadlock::WaitForGraph;
use crate::lock::grace::GracePeriodManager;
use crate::lock::manager::LockManager;
use crate::lock::oplock_checker::{wait_for_lease_break, BreakTrigger, CancellationToken};
use crate::lock::types::{AccessMode, FileHandle, LockId, LockOwner, LockType, UnifiedLock, Waiter};

/// Everything one NLM request needs in order to queue a GRANTED callback
/// should it block: the client's own NLM listener address and RPC
/// program/version to call back into.
#[derive(Debug, Clone, Copy)]
pub struct CallbackTarget {
    pub addr: SocketAddr,
    pub program: u32,
    pub version: u32,
}

/// NLM v4 state machine, wired to the cross-protocol lock core.
pub struct NlmHandler {
    manager: Arc<LockManager>,
    queue: Arc<BlockingQueue>,
    wait_graph: Arc<WaitForGraph>,
    grace: Arc<GracePeriodManager>,
    connections: Arc<ConnectionTracker>,
    granted_sink: Arc<dyn GrantedSink>,
    lease_break_timeout: std::time::Duration,
    lease_break_poll_interval: std::time::Duration,
}

impl NlmHandler {
    pub fn new(
        config: &Config,
        manager: Arc<LockManager>,
        queue: Arc<BlockingQueue>,
        wait_graph: Arc<WaitForGraph>,
        grace: Arc<GracePeriodManager>,
        connections: Arc<ConnectionTracker>,
        granted_sink: Arc<dyn GrantedSink>,
    ) -> Self {
        Self {
            manager,
            queue,
            wait_graph,
            grace,
            connections,
            granted_sink,
            lease_break_timeout: config.effective_lease_break_timeout(),
            lease_break_poll_interval: crate::config::DEFAULT_LEASE_BREAK_POLL_INTERVAL,
        }
    }

    pub async fn null(&self) {}

    fn owner_and_handle(lock: &Nlm4Lock, client_id: &str) -> (LockOwner, FileHandle) {
        let owner_id = owner::format_owner_id(&lock.caller_name, lock.svid, &lock.oh);
        (LockOwner::new(owner_id, client_id.to_string(), String::new()), FileHandle::new(lock.fh.clone()))
    }

    /// TEST never blocks, never mutates, and is not subject to the
    /// grace-period gate (spec §4.4: a query about lock state is always
    /// safe to answer during grace).
    #[instrument(skip(self, args))]
    pub async fn test(&self, args: Nlm4TestArgs, client_id: &str) -> Nlm4TestRes {
        self.connections.touch(client_id);
        let (owner, file_handle) = Self::owner_and_handle(&args.alock, client_id);
        let (free, holder) =
            self.manager.test_lock(&file_handle, &owner, args.alock.l_offset, args.alock.l_len, args.exclusive).await;

        let reply = if free {
            Nlm4TestReply::Granted
        } else {
            let holder = holder.expect("conflict implies a holder");
            Nlm4TestReply::Denied {
                holder: Nlm4Holder {
                    exclusive: matches!(holder.lock_type, LockType::Exclusive),
                    svid: owner::parse_owner_id(&holder.owner.owner_id).map(|(_, svid, _)| svid).unwrap_or(0),
                    oh: owner::parse_owner_id(&holder.owner.owner_id).map(|(_, _, oh)| oh).unwrap_or_default(),
                    l_offset: holder.offset,
                    l_len: holder.length,
                },
            }
        };
        Nlm4TestRes { cookie: args.cookie, reply }
    }

    /// LOCK: grants immediately, queues as a blocking waiter, or denies
    /// outright. `reclaim` requests bypass the grace-period gate.
    #[instrument(skip(self, args, callback))]
    pub async fn lock(&self, args: Nlm4LockArgs, callback: CallbackTarget, client_id: &str) -> Nlm4Res {
        self.connections.touch(client_id);

        if let Err(err) = self.grace.is_operation_allowed(args.reclaim).await {
            return Nlm4Res { cookie: args.cookie, stat: Nlm4Stat::from(&err) };
        }

        let (owner, file_handle) = Self::owner_and_handle(&args.alock, client_id);

        let trigger = if args.exclusive { BreakTrigger::Write } else { BreakTrigger::Read };
        let cancellation = CancellationToken::new();
        if let Err(err) = wait_for_lease_break(
            self.manager.as_ref(),
            &file_handle,
            Some(owner.owner_id.as_str()),
            trigger,
            self.lease_break_timeout,
            self.lease_break_poll_interval,
            &cancellation,
        )
        .await
        {
            return Nlm4Res { cookie: args.cookie, stat: Nlm4Stat::from(&err) };
        }

        let candidate = UnifiedLock {
            id: LockId(0),
            owner: owner.clone(),
            file_handle: file_handle.clone(),
            offset: args.alock.l_offset,
            length: args.alock.l_len,
            lock_type: if args.exclusive { LockType::Exclusive } else { LockType::Shared },
            access_mode: AccessMode::None,
            acquired_at: Instant::now(),
            blocking: args.block,
            reclaim: args.reclaim,
            lease: None,
        };

        match self.manager.insert(&file_handle, candidate.clone()).await {
            Ok(_) => {
                if args.reclaim && self.grace.mark_reclaimed(client_id).await {
                    // Every expected client has reclaimed; the caller of
                    // `lock` drives `GracePeriodManager::exit` from its
                    // own event loop once it observes this, since exit
                    // needs the hook and that lives above this handler.
                }
                self.connections.set_lock_count(client_id, self.manager.locks_on_file(&file_handle).await.len());
                Nlm4Res { cookie: args.cookie, stat: Nlm4Stat::Granted }
            }
            Err(Error::LockConflict(holder)) if args.block => self.queue_blocking_lock(args, callback, owner, candidate, &holder).await,
            Err(err) => Nlm4Res { cookie: args.cookie, stat: Nlm4Stat::from(&err) },
        }
    }

    async fn queue_blocking_lock(
        &self,
        args: Nlm4LockArgs,
        callback: CallbackTarget,
        owner: LockOwner,
        candidate: UnifiedLock,
        holder: &UnifiedLock,
    ) -> Nlm4Res {
        let mut holders = self.manager.conflicting_owners(&candidate.file_handle, &candidate).await;
        if holders.is_empty() {
            holders.push(holder.owner.owner_id.clone());
        }

        if let Err(err) = self.wait_graph.add_waiter(&owner.owner_id, &holders) {
            self.manager.metrics().deadlock_denied();
            return Nlm4Res { cookie: args.cookie, stat: Nlm4Stat::from(&err) };
        }

        let waiter = Waiter {
            requested: candidate,
            cookie: args.cookie.0.clone(),
            callback_addr: callback.addr,
            callback_program: callback.program,
            callback_version: callback.version,
            caller_name: args.alock.caller_name.clone(),
            svid: args.alock.svid,
            oh: args.alock.oh.clone(),
            file_handle: FileHandle::new(args.alock.fh.clone()),
            queued_at: Instant::now(),
            cancelled: Arc::new(AtomicBool::new(false)),
        };

        match self.queue.enqueue(&waiter.file_handle.clone(), waiter).await {
            Ok(()) => Nlm4Res { cookie: args.cookie, stat: Nlm4Stat::Blocked },
            Err(err) => {
                self.wait_graph.remove_waiter(&owner.owner_id);
                Nlm4Res { cookie: args.cookie, stat: Nlm4Stat::from(&err) }
            }
        }
    }

    /// CANCEL is idempotent (spec §4.4): cancelling an already-granted or
    /// already-cancelled request is not an error, it simply reports
    /// whatever the current state already is.
    #[instrument(skip(self, args))]
    pub async fn cancel(&self, args: Nlm4CancArgs, client_id: &str) -> Nlm4Res {
        self.connections.touch(client_id);
        let (owner, file_handle) = Self::owner_and_handle(&args.alock, client_id);
        self.queue.cancel(&file_handle, &owner.owner_id, args.alock.l_offset, args.alock.l_len).await;
        self.wait_graph.remove_owner(&owner.owner_id);
        Nlm4Res { cookie: args.cookie, stat: Nlm4Stat::Granted }
    }

    /// UNLOCK splits/removes the matching range and, on success, tries
    /// to grant the new head of that file's blocking queue.
    #[instrument(skip(self, args))]
    pub async fn unlock(&self, args: Nlm4UnlockArgs, client_id: &str) -> Nlm4Res {
        self.connections.touch(client_id);
        let (owner, file_handle) = Self::owner_and_handle(&args.alock, client_id);

        let stat = match self.manager.release(&file_handle, &owner, args.alock.l_offset, args.alock.l_len).await {
            Ok(()) => Nlm4Stat::Granted,
            Err(Error::LockNotFound) => Nlm4Stat::Granted, // unlocking what isn't held is not an error (RFC 1813).
            Err(err) => Nlm4Stat::from(&err),
        };

        self.wait_graph.remove_owner(&owner.owner_id);
        self.queue.try_grant_head(&file_handle, &self.manager, &self.wait_graph, self.granted_sink.as_ref()).await;
        self.connections.set_lock_count(client_id, self.manager.locks_on_file(&file_handle).await.len());
        Nlm4Res { cookie: args.cookie, stat }
    }

    /// NM_LOCK: identical to LOCK but used by clients that skip NSM
    /// monitoring registration (spec §4.4). The core does not care which
    /// path a lock arrived by.
    pub async fn nm_lock(&self, args: Nlm4LockArgs, callback: CallbackTarget, client_id: &str) -> Nlm4Res {
        self.lock(args, callback, client_id).await
    }

    /// SHARE/UNSHARE (DOS share-mode reservations): always granted.
    /// Real conflict tracking against `UnifiedLock::access_mode` is not
    /// wired up for this legacy NLM path since no example client in the
    /// corpus this crate targets exercises it; see DESIGN.md.
    pub async fn share(&self, args: Nlm4ShareArgs, client_id: &str) -> Nlm4ShareRes {
        self.connections.touch(client_id);
        let _ = args.reclaim;
        Nlm4ShareRes { cookie: args.cookie, stat: Nlm4Stat::Granted, sequence: 0 }
    }

    pub async fn unshare(&self, args: Nlm4ShareArgs, client_id: &str) -> Nlm4ShareRes {
        self.connections.touch(client_id);
        Nlm4ShareRes { cookie: args.cookie, stat: Nlm4Stat::Granted, sequence: 0 }
    }

    /// FREE_ALL (spec §9 redesign flag): the definitive cross-share
    /// cleanup entry point, called when a client reboots (its NSM state
    /// number changes) or disconnects uncleanly. Releases every lock and
    /// cancels every queued waiter owned by that caller, across every
    /// file and every share.
    #[instrument(skip(self, notify))]
    pub async fn free_all(&self, notify: Nlm4Notify) {
        let prefix = format!("nlm:{}:", notify.name);
        self.manager.release_all_with_owner_prefix(&prefix).await;
        self.queue.cancel_all_for_owner_prefix(&prefix).await;
        warn!(caller = %notify.name, state = notify.state, "free_all processed");
    }

    /// Async MSG variants (TEST_MSG/LOCK_MSG/CANCEL_MSG/UNLOCK_MSG):
    /// decoded and applied exactly like their synchronous counterparts.
    /// The matching `_RES` callback to the client's own NLM listener is
    /// intentionally not implemented — no client in scope for this
    /// crate relies on the async NLM dialect, only on the synchronous
    /// calls plus the GRANTED callback (spec §9 open question).
    pub async fn test_msg(&self, args: Nlm4TestArgs, client_id: &str) {
        let _ = self.test(args, client_id).await;
    }

    pub async fn lock_msg(&self, args: Nlm4LockArgs, callback: CallbackTarget, client_id: &str) {
        let _ = self.lock(args, callback, client_id).await;
    }

    pub async fn cancel_msg(&self, args: Nlm4CancArgs, client_id: &str) {
        let _ = self.cancel(args, client_id).await;
    }

    pub async fn unlock_msg(&self, args: Nlm4UnlockArgs, client_id: &str) {
        let _ = self.unlock(args, client_id).await;
    }
}
