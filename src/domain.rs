// src/domain.rs

//! Domain: the enclosing registry of peers and names.
//!
//! The domain is the uniqueness and lifecycle authority: it owns the
//! global name index, the peer list with its logical-id map, and the
//! per-uid user table. Structural changes to the name index happen under
//! the domain lock with the writer sequence raised; name lookups walk the
//! index without the domain lock, retrying across write sections. The
//! sequence/rwlock combination gives the same linearizable-lookup
//! contract a seqlock-protected tree would.
//!
//! Lock ordering: the domain lock is outer to `PeerInfo`'s lock (name and
//! user manipulation) and is never taken while holding a peer's rwlock
//! from the domain side; peers that tear themselves down deactivate and
//! drain before touching the domain.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock, RwLockWriteGuard};

use crate::active::ActiveGate;
use crate::peer::{Peer, PeerName};
use crate::user::UserRegistry;
use crate::wait::WaitQueue;

/// Name index type: byte-wise ordered, globally unique live names.
pub(crate) type NameTree = BTreeMap<Arc<[u8]>, PeerName>;

pub(crate) struct DomainInner {
    /// Connected peers, in connect order.
    pub(crate) peers: Vec<Arc<Peer>>,
    /// Logical peer id -> peer. Rebound on RESET.
    pub(crate) map_peers: BTreeMap<u64, Arc<Peer>>,
    /// Per-uid accounting table.
    pub(crate) users: UserRegistry,
    /// Logical id allocator.
    ids: u64,
}

impl DomainInner {
    pub(crate) fn alloc_id(&mut self) -> u64 {
        self.ids += 1;
        self.ids
    }
}

/// The peer registry. See the module docs for the locking discipline.
pub struct Domain {
    pub(crate) lock: Mutex<DomainInner>,
    names: RwLock<NameTree>,
    seq: AtomicU64,
    pub(crate) active: ActiveGate,
    pub(crate) waitq: WaitQueue,
    /// Tiebreak allocator for queue commit keys.
    commit_stamp: AtomicU64,
}

impl Domain {
    /// Create an active domain.
    pub fn new() -> Arc<Self> {
        let domain = Arc::new(Self {
            lock: Mutex::new(DomainInner {
                peers: Vec::new(),
                map_peers: BTreeMap::new(),
                users: UserRegistry::new(),
                ids: 0,
            }),
            names: RwLock::new(BTreeMap::new()),
            seq: AtomicU64::new(0),
            active: ActiveGate::new(),
            waitq: WaitQueue::new(),
            commit_stamp: AtomicU64::new(0),
        });
        let activated = domain.active.activate();
        debug_assert!(activated);
        domain
    }

    /// Acquire an active reference; fails once the domain is shut down.
    pub fn acquire(&self) -> bool {
        self.active.acquire()
    }

    /// Release an active reference.
    pub fn release(&self) {
        self.active.release(&self.waitq);
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.is_active()
    }

    // ===== Writer sequence =====

    /// Raise the writer sequence. Must hold the domain lock.
    pub(crate) fn write_seq_begin(&self) {
        let prev = self.seq.fetch_add(1, Ordering::AcqRel);
        debug_assert!(prev % 2 == 0, "nested write sections");
    }

    /// Drop the writer sequence. Must hold the domain lock.
    pub(crate) fn write_seq_end(&self) {
        let prev = self.seq.fetch_add(1, Ordering::AcqRel);
        debug_assert!(prev % 2 == 1, "unbalanced write section");
    }

    pub(crate) fn names_write(&self) -> RwLockWriteGuard<'_, NameTree> {
        self.names.write()
    }

    /// Look up a name without the domain lock.
    ///
    /// Retries across write sections: the result is either the state
    /// before a concurrent structural change or the state after it, never
    /// a torn view.
    pub fn resolve_name(&self, name: &[u8]) -> Option<Arc<Peer>> {
        loop {
            let seq_before = self.seq.load(Ordering::Acquire);
            if seq_before % 2 == 1 {
                std::hint::spin_loop();
                continue;
            }
            let found = self
                .names
                .read()
                .get(name)
                .and_then(|entry| entry.peer.upgrade());
            if self.seq.load(Ordering::Acquire) == seq_before {
                return found;
            }
        }
    }

    /// Look up a peer by logical id. A reset rebinds the id, so a stale
    /// id resolves to nothing.
    pub fn peer_by_id(&self, id: u64) -> Option<Arc<Peer>> {
        if id == 0 {
            return None;
        }
        self.lock.lock().map_peers.get(&id).cloned()
    }

    /// Allocate a commit-key tiebreak stamp.
    pub(crate) fn next_stamp(&self) -> u64 {
        self.commit_stamp.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn inner(&self) -> MutexGuard<'_, DomainInner> {
        self.lock.lock()
    }

    // ===== Introspection =====

    pub fn n_peers(&self) -> usize {
        self.lock.lock().peers.len()
    }

    pub fn n_names(&self) -> usize {
        self.names.read().len()
    }

    pub fn has_name(&self, name: &[u8]) -> bool {
        self.names.read().contains_key(name)
    }

    pub fn n_users(&self) -> usize {
        self.lock.lock().users.len()
    }

    // ===== Shutdown =====

    /// Tear down the domain and every connected peer.
    ///
    /// Deactivates the domain gate, drains in-flight CONNECT/RESOLVE
    /// callers, then deactivates and drains every peer before cleaning
    /// them all up under one locked write section. The peer map is reset
    /// in one step afterwards. Safe to call more than once.
    pub fn teardown(&self) {
        self.active.deactivate();
        self.active.drain(&self.waitq);

        // Peers are deactivated and drained outside the domain lock;
        // their releases never need it, so this cannot deadlock.
        let peers: Vec<Arc<Peer>> = self.lock.lock().peers.clone();
        for peer in &peers {
            peer.active.deactivate();
        }
        for peer in &peers {
            peer.active.drain(&peer.waitq);
        }

        let mut inner = self.lock.lock();
        self.write_seq_begin();
        {
            let mut tree = self.names.write();
            for peer in &peers {
                peer.teardown_for_domain(&mut inner, &mut tree);
            }
        }
        inner.peers.clear();
        inner.map_peers.clear();
        self.write_seq_end();
        drop(inner);

        tracing::debug!(n_peers = peers.len(), "domain torn down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_domain_is_active_and_empty() {
        let domain = Domain::new();
        assert!(domain.is_active());
        assert_eq!(domain.n_peers(), 0);
        assert_eq!(domain.n_names(), 0);
        assert_eq!(domain.n_users(), 0);
    }

    #[test]
    fn acquire_release() {
        let domain = Domain::new();
        assert!(domain.acquire());
        domain.release();
    }

    #[test]
    fn teardown_blocks_acquire() {
        let domain = Domain::new();
        domain.teardown();
        assert!(!domain.acquire());
        assert!(!domain.is_active());

        // Idempotent.
        domain.teardown();
    }

    #[test]
    fn resolve_unknown_name() {
        let domain = Domain::new();
        assert!(domain.resolve_name(b"nobody").is_none());
    }

    #[test]
    fn stamps_are_unique() {
        let domain = Domain::new();
        let a = domain.next_stamp();
        let b = domain.next_stamp();
        assert_ne!(a, b);
    }
}
