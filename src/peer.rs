// src/peer.rs

//! Peer lifecycle and command dispatch.
//!
//! A peer is an addressable endpoint owned by a user identity. Its
//! externally visible handle carries the rwlock that serializes
//! CONNECT/DISCONNECT against each other (send-side commands hold it
//! shared), the wait-queue, the active-gate, and, once connected, the
//! private `PeerInfo` with the receive queue, payload pool, quota and
//! handle maps.
//!
//! Lifecycle:
//!
//! ```text
//!   Peer::new          CONNECT             DISCONNECT / domain teardown
//!   ┌──────┐   ┌───────────────────┐   ┌──────────────┐   ┌──────────┐
//!   │ NEW  ├──>│      ACTIVE       ├──>│ DEACTIVATING ├──>│ RELEASED │
//!   └──────┘   │ send/recv/resolve │   │ drain barrier│   └──────────┘
//!              └───────────────────┘   └──────────────┘
//! ```
//!
//! While a caller holds an active reference, `Peer::dereference` yields a
//! stable `PeerInfo`; teardown drains those references before pulling the
//! info out under the domain lock.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::active::ActiveGate;
use crate::domain::{Domain, DomainInner, NameTree};
use crate::error::{BusError, BusResult};
use crate::fd::FdTable;
use crate::message::{Message, FD_WORD_SIZE};
use crate::pool::Pool;
use crate::queue::Queue;
use crate::transaction::Transaction;
use crate::user::{User, UserQuota};
use crate::wait::WaitQueue;
use crate::wire::{
    self, cmd, connect_flags, recv_flags, send_flags, CallerMemory, CmdConnect, CmdRecv,
    CmdResolve, CmdSend, NAME_MAX_SIZE, OFFSET_INVALID,
};

/// Caller identity: the ambient uid plus the admin capability in the
/// domain's user namespace. Name claims require admin.
#[derive(Debug, Clone, Copy)]
pub struct Credentials {
    pub uid: u64,
    pub admin: bool,
}

/// Name-binding record in the domain's name index. The index key is the
/// name itself; the entry points back at the owning peer.
pub struct PeerName {
    pub(crate) peer: Weak<Peer>,
}

/// Mutable per-peer state guarded by the info lock.
pub(crate) struct PeerCore {
    pub(crate) pool: Pool,
    pub(crate) queue: Queue,
    pub(crate) quota: UserQuota,
}

#[derive(Default)]
struct HandleMaps {
    /// Outgoing handle id -> destination logical peer id.
    by_id: BTreeMap<u64, u64>,
    /// Destination logical peer id -> handle id, so repeated resolves of
    /// the same destination return the same handle.
    by_node: BTreeMap<u64, u64>,
}

/// Per-peer private state, created by the first successful CONNECT and
/// destroyed after teardown has drained the queue and pool.
pub struct PeerInfo {
    core: Mutex<PeerCore>,
    /// Pinned user accounting object; released under the domain lock.
    user: Mutex<Option<Arc<User>>>,
    handles: RwLock<HandleMaps>,
    /// Raised around handle-map writes; readers retry across it.
    seqcount: AtomicU64,
    /// Monotonic handle id allocator.
    handle_ids: AtomicU64,
    /// Fixed at connect; never changes.
    pool_size: u64,
    /// Lock-free receive hint: 0 for "nothing committed at the front",
    /// otherwise the head message's fd count plus one.
    head_hint: AtomicU64,
    dropped_messages: AtomicU64,
    conveyed_errors: AtomicU64,
}

impl PeerInfo {
    /// Allocate peer state with a pool of `pool_size` bytes.
    pub fn new(pool_size: u64) -> BusResult<Arc<Self>> {
        let pool = Pool::new(pool_size)?;
        Ok(Arc::new(Self {
            core: Mutex::new(PeerCore {
                pool,
                queue: Queue::new(),
                quota: UserQuota::new(),
            }),
            user: Mutex::new(None),
            handles: RwLock::new(HandleMaps::default()),
            seqcount: AtomicU64::new(0),
            handle_ids: AtomicU64::new(0),
            pool_size,
            head_hint: AtomicU64::new(0),
            dropped_messages: AtomicU64::new(0),
            conveyed_errors: AtomicU64::new(0),
        }))
    }

    pub(crate) fn core(&self) -> MutexGuard<'_, PeerCore> {
        self.core.lock()
    }

    #[inline]
    pub fn pool_size(&self) -> u64 {
        self.pool_size
    }

    pub fn user(&self) -> Option<Arc<User>> {
        self.user.lock().clone()
    }

    pub(crate) fn set_user(&self, user: Arc<User>) {
        *self.user.lock() = Some(user);
    }

    pub(crate) fn take_user(&self) -> Option<Arc<User>> {
        self.user.lock().take()
    }

    /// Discard all queued messages and published slices.
    ///
    /// Committed messages are deallocated; uncommitted ones are only
    /// unlinked; the unlink is the signal their transaction observes at
    /// commit time. The queue epoch is bumped and the pool flushed.
    pub fn reset(&self) {
        let mut guard = self.core();
        let core = &mut *guard;
        for (committed, msg) in core.queue.drain_all() {
            if committed {
                msg.deallocate(&mut core.pool, &mut core.quota);
            }
        }
        core.queue.post_flush();
        core.pool.flush();
        self.refresh_head_hint(core);
    }

    /// Final teardown of the info object. The user binding must have been
    /// released already (under the domain lock).
    pub(crate) fn finalize(&self) {
        debug_assert!(self.user.lock().is_none());
        self.reset();
        self.core().quota.destroy();
    }

    pub(crate) fn refresh_head_hint(&self, core: &PeerCore) {
        let hint = core
            .queue
            .peek()
            .map(|msg| msg.n_files() as u64 + 1)
            .unwrap_or(0);
        self.head_hint.store(hint, Ordering::Release);
    }

    /// Lock-free estimate of the committed head: `None` when nothing is
    /// receivable, otherwise the head's fd count. Racy by design; the
    /// receive path re-checks under the lock.
    pub(crate) fn head_hint(&self) -> Option<usize> {
        match self.head_hint.load(Ordering::Acquire) {
            0 => None,
            v => Some((v - 1) as usize),
        }
    }

    /// Look up or mint the caller's handle for a destination peer id.
    pub(crate) fn handle_for(&self, dest_id: u64) -> u64 {
        if let Some(&handle) = self.handles.read().by_node.get(&dest_id) {
            return handle;
        }

        let mut maps = self.handles.write();
        if let Some(&handle) = maps.by_node.get(&dest_id) {
            return handle;
        }
        let handle = self.handle_ids.fetch_add(1, Ordering::Relaxed) + 1;
        self.seqcount.fetch_add(1, Ordering::Release);
        maps.by_id.insert(handle, dest_id);
        maps.by_node.insert(dest_id, handle);
        self.seqcount.fetch_add(1, Ordering::Release);
        handle
    }

    /// Resolve an outgoing handle to its destination peer id, retrying
    /// across concurrent handle-map writes.
    pub(crate) fn resolve_handle(&self, handle: u64) -> Option<u64> {
        loop {
            let seq_before = self.seqcount.load(Ordering::Acquire);
            if seq_before % 2 == 1 {
                std::hint::spin_loop();
                continue;
            }
            let found = self.handles.read().by_id.get(&handle).copied();
            if self.seqcount.load(Ordering::Acquire) == seq_before {
                return found;
            }
        }
    }

    pub(crate) fn note_conveyed_error(&self) {
        self.conveyed_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_dropped(&self) {
        self.dropped_messages.fetch_add(1, Ordering::Relaxed);
    }

    /// Messages dropped after dequeue (pool-write failure).
    pub fn dropped_messages(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Delivery failures reported through the error channel.
    pub fn conveyed_errors(&self) -> u64 {
        self.conveyed_errors.load(Ordering::Relaxed)
    }
}

/// Point-in-time view of a peer's internals, for tests and debugging.
#[derive(Debug, Clone)]
pub struct PeerDiagnostics {
    pub queue_len: usize,
    pub pool_slices: usize,
    pub has_published: bool,
    pub n_names: usize,
    pub dropped_messages: u64,
    pub conveyed_errors: u64,
}

/// The externally visible peer handle.
pub struct Peer {
    /// Serializes CONNECT/DISCONNECT (exclusive) against the send-side
    /// commands (shared).
    rwlock: RwLock<()>,
    pub(crate) waitq: WaitQueue,
    pub(crate) active: ActiveGate,
    /// Installed at activation, pulled at cleanup. Mutation requires the
    /// domain lock; reads are stable while an active reference is held.
    info: RwLock<Option<Arc<PeerInfo>>>,
    /// Owned names, front to back. The list is exactly the set of this
    /// peer's entries in the domain name index.
    names: Mutex<Vec<Arc<[u8]>>>,
    /// Logical id in the domain's peer map; 0 when unlinked. Rebound on
    /// RESET so stale in-flight tags miss.
    id: AtomicU64,
    /// Back-reference for domain links and name entries.
    weak: Weak<Peer>,
}

impl Peer {
    /// Allocate a peer in state NEW, detached from any domain.
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            rwlock: RwLock::new(()),
            waitq: WaitQueue::new(),
            active: ActiveGate::new(),
            info: RwLock::new(None),
            names: Mutex::new(Vec::new()),
            id: AtomicU64::new(0),
            weak: weak.clone(),
        })
    }

    fn arc(&self) -> Arc<Peer> {
        self.weak.upgrade().expect("peer handle outlives its users")
    }

    /// Acquire an active reference. Fails while NEW or once deactivated.
    pub fn acquire(&self) -> bool {
        self.active.acquire()
    }

    /// Release an active reference acquired via `acquire`.
    pub fn release(&self) {
        self.active.release(&self.waitq);
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.active.is_active()
    }

    /// Current logical id; 0 while unlinked.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id.load(Ordering::Acquire)
    }

    /// Wake poll-style readers.
    pub(crate) fn wake(&self) {
        self.waitq.wake_all();
    }

    /// Get the peer's info object.
    ///
    /// The caller must hold an active reference (or the peer rwlock
    /// together with the domain lock) for the result to be stable.
    pub fn dereference(&self) -> BusResult<Arc<PeerInfo>> {
        self.info.read().clone().ok_or(BusError::Shutdown)
    }

    /// Snapshot of the owned names, front to back.
    pub fn names(&self) -> Vec<Vec<u8>> {
        self.names.lock().iter().map(|n| n.to_vec()).collect()
    }

    /// Block until a message is receivable, the peer is torn down, or
    /// the timeout expires. Returns true if a receive may succeed.
    pub fn wait_message(&self, timeout: Duration) -> bool {
        self.waitq.wait_until_timeout(
            || match &*self.info.read() {
                Some(info) => info.head_hint().is_some(),
                None => true,
            },
            timeout,
        ) && self.info.read().is_some()
    }

    /// Copy out of a published slice, the library rendition of reading
    /// the mapped pool at a published offset.
    pub fn read_published(&self, offset: u64, buf: &mut [u8]) -> BusResult<()> {
        let _shared = self.rwlock.read();
        if !self.acquire() {
            return Err(BusError::Shutdown);
        }
        let r = self
            .dereference()
            .and_then(|info| info.core().pool.read_published(offset, buf));
        self.release();
        r
    }

    /// Point-in-time diagnostics, or None while unconnected.
    pub fn diagnostics(&self) -> Option<PeerDiagnostics> {
        let info = self.info.read().clone()?;
        let core = info.core();
        Some(PeerDiagnostics {
            queue_len: core.queue.len(),
            pool_slices: core.pool.n_slices(),
            has_published: core.pool.has_published(),
            n_names: self.names.lock().len(),
            dropped_messages: info.dropped_messages(),
            conveyed_errors: info.conveyed_errors(),
        })
    }

    // ===== Teardown =====

    /// Caller-initiated teardown (DISCONNECT, or the last close of the
    /// handle). Deactivates the gate, drains in-flight operations, then
    /// cleans up under the domain lock with the writer sequence raised.
    /// A racing caller that loses the cleanup gets `Shutdown`.
    pub fn teardown(&self, domain: &Arc<Domain>) -> BusResult<()> {
        let _exclusive = self.rwlock.write();

        self.active.deactivate();
        self.active.drain(&self.waitq);

        let mut inner = domain.inner();
        domain.write_seq_begin();
        let mut removed_info = None;
        let won = {
            let mut tree = domain.names_write();
            // Draining on the waitq here would deadlock against the
            // domain lock; the drain above already completed, so pass no
            // wait-queue.
            self.active.cleanup(None, || {
                removed_info = self.cleanup_locked(&mut inner, &mut tree, true);
            })
        };
        domain.write_seq_end();
        drop(inner);

        // Free the info outside the domain lock.
        if let Some(info) = removed_info {
            info.finalize();
        }

        if won {
            tracing::debug!("peer torn down");
            Ok(())
        } else {
            Err(BusError::Shutdown)
        }
    }

    /// Domain-initiated teardown. The domain has already deactivated and
    /// drained this peer and holds its lock with the writer sequence
    /// raised. Peer-list removal is skipped; the domain resets its maps
    /// in one step after iterating. Safe to call multiple times.
    pub(crate) fn teardown_for_domain(&self, inner: &mut DomainInner, tree: &mut NameTree) {
        let mut removed_info = None;
        if self.active.cleanup(None, || {
            removed_info = self.cleanup_locked(inner, tree, false);
        }) {
            if let Some(info) = removed_info {
                info.finalize();
            }
        }
    }

    /// The once-only cleanup body. Runs under the domain lock with the
    /// writer sequence raised; pulls the info, unlinks every name, drops
    /// the user pin, and unlinks the peer from the domain.
    fn cleanup_locked(
        &self,
        inner: &mut DomainInner,
        tree: &mut NameTree,
        remove_from_list: bool,
    ) -> Option<Arc<PeerInfo>> {
        let info = self.info.write().take()?;

        for name in self.names.lock().drain(..) {
            tree.remove(name.as_ref());
        }

        // Users reference the domain's table; release under its lock.
        if let Some(user) = info.take_user() {
            inner.users.release(user);
        }

        let id = self.id.swap(0, Ordering::AcqRel);
        if remove_from_list {
            inner.map_peers.remove(&id);
            inner
                .peers
                .retain(|p| !std::ptr::eq(Arc::as_ptr(p), self as *const Peer));
        }

        Some(info)
    }

    // ===== Connect protocol =====

    fn connect_new(
        &self,
        domain: &Arc<Domain>,
        uid: u64,
        param: &CmdConnect,
        names_bytes: &[u8],
    ) -> BusResult<u64> {
        // A peer that is already connected compares parameters instead:
        // identical pool size and name set report ALREADY_CONNECTED,
        // anything else NAMES_DIFFER.
        if !self.active.is_new() {
            let info = self.dereference()?;
            if param.pool_size != info.pool_size() {
                return Err(BusError::NamesDiffer);
            }
            names_check(&self.names.lock(), names_bytes)?;
            return Err(BusError::AlreadyConnected);
        }

        debug_assert!(self.info.read().is_none());

        let info = PeerInfo::new(param.pool_size)?;

        // Pin the user object through the domain.
        {
            let mut inner = domain.inner();
            let user = inner.users.acquire(uid);
            info.set_user(user);
        }

        // Parse the name buffer into owned entries; the list order is the
        // reverse of the wire order, which is observable and stable.
        let names = match parse_names(names_bytes) {
            Ok(names) => names,
            Err(err) => {
                if let Some(user) = info.take_user() {
                    domain.inner().users.release(user);
                }
                return Err(err);
            }
        };

        let mut inner = domain.inner();
        domain.write_seq_begin();
        {
            let mut tree = domain.names_write();

            let mut inserted = 0usize;
            let mut conflict = false;
            for name in &names {
                if tree.contains_key(name.as_ref()) {
                    conflict = true;
                    break;
                }
                tree.insert(
                    name.clone(),
                    PeerName {
                        peer: self.weak.clone(),
                    },
                );
                inserted += 1;
            }

            if conflict {
                // Unwind the inserted prefix under the same write section
                // that installed it.
                for name in &names[..inserted] {
                    tree.remove(name.as_ref());
                }
                drop(tree);
                domain.write_seq_end();
                drop(inner);
                if let Some(user) = info.take_user() {
                    domain.inner().users.release(user);
                }
                return Err(BusError::NameExists);
            }

            *self.names.lock() = names;
            let id = inner.alloc_id();
            self.id.store(id, Ordering::Release);
            inner.peers.push(self.arc());
            inner.map_peers.insert(id, self.arc());
            *self.info.write() = Some(info);
            let activated = self.active.activate();
            debug_assert!(activated);
        }
        domain.write_seq_end();
        drop(inner);

        tracing::debug!(
            uid,
            pool_size = param.pool_size,
            id = self.id(),
            "peer connected"
        );
        Ok(param.pool_size)
    }

    fn connect_reset(
        &self,
        domain: &Arc<Domain>,
        param: &CmdConnect,
        names_len: usize,
    ) -> BusResult<u64> {
        if self.active.is_new() {
            return Err(BusError::NotConnected);
        }
        // The pool size must be unset and no names appended.
        if param.pool_size != 0 || names_len > 0 {
            return Err(BusError::InvalidArgument);
        }

        let info = self.dereference()?;
        let pool_size = info.pool_size();

        // Atomically rebind the logical id: in-flight operations tagged
        // with the old id observe the staleness at dereference and are
        // silently discarded.
        {
            let mut inner = domain.inner();
            domain.write_seq_begin();
            let old = self.id.load(Ordering::Acquire);
            inner.map_peers.remove(&old);
            let id = inner.alloc_id();
            inner.map_peers.insert(id, self.arc());
            self.id.store(id, Ordering::Release);
            domain.write_seq_end();
        }

        // Flushing queue and pool needs no domain lock; the peer rwlock
        // is still held exclusively.
        info.reset();

        tracing::debug!(id = self.id(), "peer reset");
        Ok(pool_size)
    }

    fn connect_query(&self) -> BusResult<u64> {
        if self.active.is_new() {
            return Err(BusError::NotConnected);
        }
        let info = self.dereference()?;
        Ok(info.pool_size())
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        debug_assert!(self.info.get_mut().is_none(), "peer dropped with live info");
        debug_assert!(self.names.get_mut().is_empty(), "peer dropped with names");
        debug_assert_eq!(*self.id.get_mut(), 0, "peer dropped while linked");
    }
}

// ===== Name handling =====

/// Parse a buffer of concatenated zero-terminated names into owned
/// entries, newest first (reverse wire order).
fn parse_names(mut bytes: &[u8]) -> BusResult<Vec<Arc<[u8]>>> {
    let mut names: Vec<Arc<[u8]>> = Vec::new();
    while !bytes.is_empty() {
        let len = bytes
            .iter()
            .position(|&b| b == 0)
            .ok_or(BusError::NameTooLong)?;
        // Terminator included, a name is 2..=NAME_MAX_SIZE bytes.
        if len == 0 || len + 1 > NAME_MAX_SIZE {
            return Err(BusError::NameTooLong);
        }
        names.push(Arc::from(&bytes[..len]));
        bytes = &bytes[len + 1..];
    }
    names.reverse();
    Ok(names)
}

/// Check one candidate against the peer's name list.
///
/// Returns `Err` if the candidate is not a name of the peer, `Ok(0)` if
/// it is but not the last one, and the total number of names when the
/// match is the tail.
fn name_check(names: &[Arc<[u8]>], candidate: &[u8]) -> Result<usize, ()> {
    let mut n_names = 0usize;
    for (idx, name) in names.iter().enumerate() {
        n_names += 1;
        if name.as_ref() == candidate {
            return if idx + 1 < names.len() {
                Ok(0)
            } else {
                Ok(n_names)
            };
        }
    }
    Err(())
}

/// Check that a name buffer matches the peer's names exactly: pointwise
/// equality, tail included. The caller's ordered view (wire order) must
/// agree with the peer's list, which iterates in reverse wire order, so
/// the k-th supplied name must be the k-th name from the back of the
/// list and the first supplied name must be the list tail.
fn names_check(names: &[Arc<[u8]>], mut buf: &[u8]) -> BusResult<()> {
    if buf.is_empty() && !names.is_empty() {
        return Err(BusError::NamesDiffer);
    }

    let mut n_seen = 0usize;
    let mut tail_count = 0usize;
    while !buf.is_empty() {
        let len = buf
            .iter()
            .position(|&b| b == 0)
            .ok_or(BusError::NameTooLong)?;
        if len == 0 {
            return Err(BusError::NameTooLong);
        }
        let candidate = &buf[..len];

        match name_check(names, candidate) {
            Err(()) => return Err(BusError::NamesDiffer),
            Ok(0) => {}
            Ok(count) => tail_count = count,
        }

        let expected = names
            .len()
            .checked_sub(n_seen + 1)
            .and_then(|idx| names.get(idx));
        if expected.map(|name| name.as_ref()) != Some(candidate) {
            return Err(BusError::NamesDiffer);
        }

        buf = &buf[len + 1..];
        n_seen += 1;
    }

    if n_seen != tail_count {
        return Err(BusError::NamesDiffer);
    }
    Ok(())
}

// ===== Command handlers =====

fn ioctl_connect(
    peer: &Arc<Peer>,
    domain: &Arc<Domain>,
    cred: &Credentials,
    mem: &mut dyn CallerMemory,
    arg: u64,
) -> BusResult<()> {
    let block = wire::import_dynamic(mem, arg, wire::CMD_CONNECT_SIZE)?;
    let (param, names_bytes) = CmdConnect::parse(&block)?;

    if param.flags & !connect_flags::KNOWN != 0 {
        return Err(BusError::InvalidArgument);
    }
    // The modes are mutually exclusive; QUERY combines with any of them.
    let n_modes = (param.flags & connect_flags::PEER != 0) as u32
        + (param.flags & connect_flags::MONITOR != 0) as u32
        + (param.flags & connect_flags::RESET != 0) as u32;
    if n_modes > 1 {
        return Err(BusError::InvalidArgument);
    }
    // Name claims require the admin capability in the domain's user
    // namespace.
    if !names_bytes.is_empty() && !cred.admin {
        return Err(BusError::PermissionDenied);
    }

    let pool_size = {
        let _exclusive = peer.rwlock.write();

        if peer.active.is_deactivated() {
            Err(BusError::Shutdown)
        } else if param.flags & (connect_flags::PEER | connect_flags::MONITOR) != 0 {
            peer.connect_new(domain, cred.uid, &param, names_bytes)
        } else if param.flags & connect_flags::RESET != 0 {
            peer.connect_reset(domain, &param, names_bytes.len())
        } else if param.flags & connect_flags::QUERY != 0 {
            peer.connect_query()
        } else {
            Err(BusError::InvalidArgument)
        }
    }?;

    // QUERY write-back: report the observed pool size. A copy-out fault
    // does not revert what was done; the caller just learns of it.
    if param.flags & connect_flags::QUERY != 0 {
        wire::write_u64(mem, arg + wire::CMD_CONNECT_POOL_SIZE_OFFSET, pool_size)
            .map_err(|_| BusError::Fault)?;
    }
    Ok(())
}

fn ioctl_resolve(
    peer: &Arc<Peer>,
    domain: &Arc<Domain>,
    mem: &mut dyn CallerMemory,
    arg: u64,
) -> BusResult<()> {
    let block = wire::import_dynamic(mem, arg, wire::CMD_RESOLVE_SIZE)?;
    let (param, name) = CmdResolve::parse(&block)?;

    if param.flags != 0 {
        return Err(BusError::InvalidArgument);
    }
    // The result field must be cleared by the caller.
    if param.id != 0 {
        return Err(BusError::InvalidArgument);
    }
    if name.len() < 2 || name.len() > NAME_MAX_SIZE {
        return Err(BusError::NoSuchEntry);
    }
    if name[name.len() - 1] != 0 {
        return Err(BusError::InvalidArgument);
    }

    // Lock-free lookup; only active owners resolve.
    let dest = domain
        .resolve_name(&name[..name.len() - 1])
        .filter(|p| p.active.is_active())
        .ok_or(BusError::NoSuchEntry)?;

    // Mint (or find) the caller's handle for the destination. The handle
    // tags the destination's current logical id; a later RESET makes it
    // go stale.
    if !peer.acquire() {
        return Err(if peer.active.is_new() {
            BusError::NotConnected
        } else {
            BusError::Shutdown
        });
    }
    let r = (|| {
        let info = peer.dereference()?;
        let dest_id = dest.id();
        if dest_id == 0 {
            return Err(BusError::NoSuchEntry);
        }
        let handle = info.handle_for(dest_id);
        // Side effects are kept on copy-out faults.
        wire::write_u64(mem, arg + wire::CMD_RESOLVE_ID_OFFSET, handle)
            .map_err(|_| BusError::Fault)
    })();
    peer.release();
    r
}

fn ioctl_slice_release(peer: &Arc<Peer>, mem: &dyn CallerMemory, arg: u64) -> BusResult<()> {
    let info = peer.dereference()?;
    let offset = wire::read_u64(mem, arg)?;
    let result = info.core().pool.release_user(offset);
    result
}

fn ioctl_send(
    peer: &Arc<Peer>,
    domain: &Arc<Domain>,
    mem: &dyn CallerMemory,
    fdt: &dyn FdTable,
    arg: u64,
) -> BusResult<()> {
    let param = CmdSend::read_from(mem, arg)?;

    if param.flags & !send_flags::KNOWN != 0 {
        return Err(BusError::InvalidArgument);
    }
    // Basic limits; avoids integer overflows later on.
    if param.n_vecs > wire::VEC_MAX || param.n_fds > wire::FD_MAX {
        return Err(BusError::InvalidArgument);
    }
    // Pointer round-trip checks for the platform word size.
    for ptr in [
        param.ptr_destinations,
        param.ptr_vecs,
        param.ptr_ids,
        param.ptr_fds,
    ] {
        if usize::try_from(ptr).is_err() {
            return Err(BusError::Fault);
        }
    }

    // The peer is pinned by the dispatch acquire; route the sending user
    // through the dereference.
    let info = peer.dereference()?;
    let user = info.user().ok_or(BusError::Shutdown)?;

    let mut tx = Transaction::new_from_caller(info, domain.clone(), &param, mem, fdt)?;

    if param.n_destinations == 1 {
        // Fastpath: unicast.
        let dest = wire::read_u64(mem, param.ptr_destinations)?;
        tx.commit_for_id(&user, dest)?;
    } else {
        for i in 0..param.n_destinations {
            // A fault reading a destination is always fatal to the whole
            // send; the transaction drop unwinds the staged prefix.
            let dest = wire::read_u64(mem, param.ptr_destinations + i * 8)?;
            tx.instantiate(&user, dest)?;
        }
        tx.commit();
    }
    Ok(())
}

fn ioctl_recv(
    peer: &Arc<Peer>,
    mem: &mut dyn CallerMemory,
    fdt: &mut dyn FdTable,
    arg: u64,
) -> BusResult<()> {
    let mut param = CmdRecv::read_from(mem, arg)?;

    if param.flags & !recv_flags::KNOWN != 0 {
        return Err(BusError::InvalidArgument);
    }
    if param.msg_offset != OFFSET_INVALID
        || param.msg_size != 0
        || param.msg_ids != 0
        || param.msg_fds != 0
    {
        return Err(BusError::InvalidArgument);
    }

    let info = peer.dereference()?;

    // Lock-free estimate of the head's fd count, so fds can be reserved
    // before the dequeue. Anyone might race us; re-checked under the
    // lock below.
    let Some(mut wanted_fds) = info.head_hint() else {
        return Err(BusError::Again);
    };

    if param.flags & recv_flags::PEEK != 0 {
        // Publish the head without dequeuing; no fds are installed, only
        // the count is reported.
        let mut guard = info.core();
        let core = &mut *guard;
        let Some(msg) = core.queue.peek() else {
            return Err(BusError::Again);
        };
        let (offset, size) = core.pool.publish(msg.slice);
        param.msg_offset = offset;
        param.msg_size = size;
        param.msg_fds = msg.n_files() as u64;
        drop(guard);

        return param.write_back(mem, arg).map_err(|_| BusError::Fault);
    }

    // Reconcile pre-allocated fd slots with the head's fd count, so fd
    // exhaustion can never drop a message after the dequeue.
    let mut reserved: Vec<i32> = Vec::new();
    let mut dequeued: Option<Arc<Message>> = None;
    loop {
        while reserved.len() < wanted_fds {
            match fdt.reserve() {
                Ok(slot) => reserved.push(slot),
                Err(err) => {
                    for slot in reserved {
                        fdt.unreserve(slot);
                    }
                    return Err(err);
                }
            }
        }

        let mut guard = info.core();
        let core = &mut *guard;
        match core.queue.peek() {
            None => break,
            Some(msg) if msg.n_files() > reserved.len() => {
                // Someone raced us and the head changed; grow the fd
                // array and retry.
                wanted_fds = msg.n_files();
                continue;
            }
            Some(_) => {
                let msg = core.queue.remove_front().expect("peeked head vanished");
                let (offset, size) = core.pool.publish(msg.slice);
                param.msg_offset = offset;
                param.msg_size = size;
                param.msg_fds = msg.n_files() as u64;
                // Fastpath: with no fds to install the slice's kernel
                // ref can be dropped under the same lock.
                if msg.n_files() == 0 {
                    msg.deallocate(&mut core.pool, &mut core.quota);
                }
                info.refresh_head_hint(core);
                dequeued = Some(msg);
                break;
            }
        }
    }

    let Some(msg) = dequeued else {
        for slot in reserved {
            fdt.unreserve(slot);
        }
        return Err(BusError::Again);
    };

    // Return surplus pre-allocated fds.
    while reserved.len() > msg.n_files() {
        let slot = reserved.pop().expect("surplus fd accounting");
        fdt.unreserve(slot);
    }

    if msg.n_files() > 0 {
        // Write the fd numbers into the tail of the published slice. The
        // only failure here is backing exhaustion; the queue cannot be
        // restored without breaking ordering, so the message is dropped.
        let mut words = Vec::with_capacity(reserved.len() * FD_WORD_SIZE);
        for slot in &reserved {
            words.extend_from_slice(&(*slot as usize).to_ne_bytes());
        }
        let tail_at = msg.slice.size - words.len() as u64;

        let mut guard = info.core();
        let core = &mut *guard;
        let wrote = core.pool.write(msg.slice, tail_at, &words);
        msg.deallocate(&mut core.pool, &mut core.quota);
        drop(guard);

        if let Err(err) = wrote {
            info.note_dropped();
            if msg.convey_errors {
                info.note_conveyed_error();
            }
            tracing::warn!(
                offset = param.msg_offset,
                n_files = msg.n_files(),
                "message dropped: pool write failed after dequeue"
            );
            for slot in reserved {
                fdt.unreserve(slot);
            }
            return Err(err);
        }

        // Install bottom-up into the caller's table.
        for (idx, slot) in reserved.iter().enumerate() {
            fdt.install(*slot, &msg.files[idx]);
        }
    }

    // Copy-out faults do not revert the receive.
    param.write_back(mem, arg).map_err(|_| BusError::Fault)
}

/// Dispatch one command on a peer.
///
/// CONNECT and RESOLVE lock against domain shutdown; DISCONNECT takes no
/// argument and behaves like the last close; the send-side commands hold
/// the peer rwlock shared plus an active reference, so they run
/// concurrently with each other but block teardown. Unknown codes fail
/// with `NoSuchIoctl`. Multiple commands can run in parallel just fine.
pub fn peer_command(
    peer: &Arc<Peer>,
    domain: &Arc<Domain>,
    cred: &Credentials,
    mem: &mut dyn CallerMemory,
    fdt: &mut dyn FdTable,
    command: u32,
    arg: u64,
) -> BusResult<()> {
    match command {
        cmd::CONNECT | cmd::RESOLVE => {
            if !domain.acquire() {
                return Err(BusError::Shutdown);
            }
            let r = if command == cmd::CONNECT {
                ioctl_connect(peer, domain, cred, mem, arg)
            } else {
                ioctl_resolve(peer, domain, mem, arg)
            };
            domain.release();
            r
        }

        cmd::DISCONNECT => {
            if arg != 0 {
                return Err(BusError::InvalidArgument);
            }
            peer.teardown(domain)
        }

        cmd::SLICE_RELEASE | cmd::SEND | cmd::RECV => {
            let _shared = peer.rwlock.read();
            if !peer.acquire() {
                return Err(BusError::Shutdown);
            }
            let r = match command {
                cmd::SLICE_RELEASE => ioctl_slice_release(peer, mem, arg),
                cmd::SEND => ioctl_send(peer, domain, mem, fdt, arg),
                _ => ioctl_recv(peer, mem, fdt, arg),
            };
            peer.release();
            r
        }

        _ => Err(BusError::NoSuchIoctl),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name_list(names: &[&[u8]]) -> Vec<Arc<[u8]>> {
        names.iter().map(|&n| Arc::from(n)).collect()
    }

    #[test]
    fn parse_names_reverses_wire_order() {
        let names = parse_names(b"a\0b\0c\0").unwrap();
        let got: Vec<&[u8]> = names.iter().map(|n| n.as_ref()).collect();
        assert_eq!(got, vec![b"c" as &[u8], b"b", b"a"]);
    }

    #[test]
    fn parse_names_rejects_malformed() {
        assert_eq!(parse_names(b"a\0\0").err(), Some(BusError::NameTooLong));
        assert_eq!(parse_names(b"unterminated").err(), Some(BusError::NameTooLong));

        let long = vec![b'x'; NAME_MAX_SIZE];
        let mut buf = long.clone();
        buf.push(0);
        assert_eq!(parse_names(&buf).err(), Some(BusError::NameTooLong));
    }

    #[test]
    fn name_check_tail_contract() {
        let names = name_list(&[b"b" as &[u8], b"a"]);

        // Tail match reports the total count.
        assert_eq!(name_check(&names, b"a"), Ok(2));
        // Non-tail match reports zero.
        assert_eq!(name_check(&names, b"b"), Ok(0));
        // Miss.
        assert_eq!(name_check(&names, b"c"), Err(()));
    }

    #[test]
    fn names_check_accepts_exact_set() {
        // Peer connected with wire "a\0b\0" holds [b, a]; re-checking the
        // same wire buffer must succeed.
        let names = name_list(&[b"b" as &[u8], b"a"]);
        assert!(names_check(&names, b"a\0b\0").is_ok());
    }

    #[test]
    fn names_check_rejects_tail_change() {
        let names = name_list(&[b"b" as &[u8], b"a"]);
        // Same set, different tail.
        assert_eq!(
            names_check(&names, b"b\0a\0").err(),
            Some(BusError::NamesDiffer)
        );
    }

    #[test]
    fn names_check_rejects_sub_and_supersets() {
        let names = name_list(&[b"b" as &[u8], b"a"]);
        assert_eq!(names_check(&names, b"a\0").err(), Some(BusError::NamesDiffer));
        assert_eq!(
            names_check(&names, b"a\0b\0c\0").err(),
            Some(BusError::NamesDiffer)
        );
        assert_eq!(names_check(&names, b"").err(), Some(BusError::NamesDiffer));

        let none = name_list(&[]);
        assert!(names_check(&none, b"").is_ok());
        assert_eq!(
            names_check(&none, b"a\0").err(),
            Some(BusError::NamesDiffer)
        );
    }

    #[test]
    fn names_check_rejects_malformed() {
        let names = name_list(&[b"a" as &[u8]]);
        assert_eq!(
            names_check(&names, b"a\0x").err(),
            Some(BusError::NameTooLong)
        );
        assert_eq!(
            names_check(&names, b"\0a\0").err(),
            Some(BusError::NameTooLong)
        );
    }

    #[test]
    fn handle_maps_are_stable() {
        let info = PeerInfo::new(crate::pool::PAGE_SIZE).unwrap();

        let h1 = info.handle_for(42);
        let h2 = info.handle_for(42);
        assert_eq!(h1, h2);

        let h3 = info.handle_for(43);
        assert_ne!(h1, h3);

        assert_eq!(info.resolve_handle(h1), Some(42));
        assert_eq!(info.resolve_handle(h3), Some(43));
        assert_eq!(info.resolve_handle(h3 + 100), None);
    }

    #[test]
    fn fresh_peer_state() {
        let peer = Peer::new();
        assert!(peer.active.is_new());
        assert!(!peer.is_connected());
        assert!(!peer.acquire());
        assert_eq!(peer.id(), 0);
        assert!(peer.dereference().is_err());
        assert!(peer.diagnostics().is_none());
    }

    #[test]
    fn recv_pool_write_failure_drops_message() {
        use crate::fd::TestFdTable;
        use crate::wire::VecMemory;
        use std::os::fd::OwnedFd;

        let domain = Domain::new();
        let peer = Peer::new();
        let info = PeerInfo::new(crate::pool::PAGE_SIZE).unwrap();
        *peer.info.write() = Some(info.clone());
        assert!(peer.active.activate());

        // Queue a committed message carrying one file, then make the pool
        // backing refuse the fd-tail write.
        let file = Arc::new(OwnedFd::from(std::fs::File::open("/dev/null").unwrap()));
        {
            let mut guard = info.core();
            let core = &mut *guard;
            core.quota.charge(1, crate::pool::PAGE_SIZE, 64, 1).unwrap();
            let slice = core.pool.alloc(64).unwrap();
            let msg = Arc::new(Message::new(slice, vec![file], 1, true));
            let (seq, epoch) = core.queue.stage(msg);
            assert!(core.queue.commit_node(seq, epoch, seq + 1, 0));
            info.refresh_head_hint(core);
            core.pool.fail_writes(true);
        }

        let mut mem = VecMemory::new(4096);
        let mut fdt = TestFdTable::new();
        let cred = Credentials {
            uid: 1,
            admin: false,
        };
        let input = CmdRecv::input(0);
        mem.write(0, &input.encode()).unwrap();

        let r = peer_command(&peer, &domain, &cred, &mut mem, &mut fdt, cmd::RECV, 0);
        assert_eq!(r.err(), Some(BusError::NoMemory));

        // The message is gone (ordering forbids requeue), the drop went
        // through the error channel, and no reserved fds leaked.
        assert_eq!(info.dropped_messages(), 1);
        assert_eq!(info.conveyed_errors(), 1);
        assert_eq!(fdt.n_reserved(), 0);
        assert!(info.core().queue.is_empty());

        *peer.info.write() = None;
        domain.teardown();
    }

    #[test]
    fn info_reset_flushes_everything() {
        let info = PeerInfo::new(crate::pool::PAGE_SIZE).unwrap();
        {
            let mut guard = info.core();
            let core = &mut *guard;
            core.quota.charge(1, crate::pool::PAGE_SIZE, 64, 1).unwrap();
            let slice = core.pool.alloc(64).unwrap();
            core.pool.publish(slice);
            let msg = Arc::new(Message::new(slice, Vec::new(), 1, false));
            let (seq, epoch) = core.queue.stage(msg);
            let committed = core.queue.commit_node(seq, epoch, seq + 1, 0);
            assert!(committed);
            info.refresh_head_hint(core);
        }
        assert!(info.head_hint().is_some());

        info.reset();

        let core = info.core();
        assert!(core.queue.is_empty());
        assert_eq!(core.pool.n_slices(), 0);
        assert!(!core.pool.has_published());
        drop(core);
        assert!(info.head_hint().is_none());
    }
}
