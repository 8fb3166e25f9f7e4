// src/transaction.rs

//! Multi-destination message transactions.
//!
//! A send builds one transaction: the payload vectors and file list are
//! gathered from caller memory once, then each destination is
//! *instantiated* (quota charged, a slice allocated and filled in the
//! destination pool, an uncommitted node staged in its queue) and
//! finally `commit` stamps one commit sequence across every staged node,
//! making the multicast visible atomically: before the commit no receiver
//! can observe the message (an uncommitted front node blocks the queue),
//! after it all of them can.
//!
//! A destination that was RESET between stage and commit has discarded
//! the staged node (and bumped its queue epoch); the commit observes that
//! and silently deallocates its copy. Dropping an uncommitted transaction
//! unwinds every staged destination the same way.

use std::os::fd::OwnedFd;
use std::sync::Arc;

use crate::domain::Domain;
use crate::error::{BusError, BusResult};
use crate::message::{Message, FD_WORD_SIZE};
use crate::peer::{Peer, PeerInfo};
use crate::user::User;
use crate::wire::{self, CallerMemory, CmdSend, SendVec};

/// Destinations held inline before the entry store spills to the heap.
pub(crate) const INLINE_DESTINATIONS: usize = 8;

struct TxEntry {
    peer: Arc<Peer>,
    info: Arc<PeerInfo>,
    msg: Arc<Message>,
    staged_seq: u64,
    epoch: u64,
    committed: bool,
}

/// Staged-entry storage: inline scratch for the common small multicast,
/// heap for large destination counts. The destroy path frees whichever
/// variant was chosen.
enum EntryStore {
    Inline {
        slots: [Option<TxEntry>; INLINE_DESTINATIONS],
        len: usize,
    },
    Heap(Vec<TxEntry>),
}

impl EntryStore {
    fn with_capacity(n: usize) -> Self {
        if n <= INLINE_DESTINATIONS {
            Self::Inline {
                slots: std::array::from_fn(|_| None),
                len: 0,
            }
        } else {
            Self::Heap(Vec::with_capacity(n))
        }
    }

    fn push(&mut self, entry: TxEntry) {
        match self {
            Self::Inline { slots, len } => {
                debug_assert!(*len < INLINE_DESTINATIONS);
                slots[*len] = Some(entry);
                *len += 1;
            }
            Self::Heap(vec) => vec.push(entry),
        }
    }

    fn iter_mut(&mut self) -> impl Iterator<Item = &mut TxEntry> {
        match self {
            Self::Inline { slots, len } => {
                EntryIterMut::Inline(slots[..*len].iter_mut())
            }
            Self::Heap(vec) => EntryIterMut::Heap(vec.iter_mut()),
        }
    }

    fn is_inline(&self) -> bool {
        matches!(self, Self::Inline { .. })
    }
}

enum EntryIterMut<'a> {
    Inline(std::slice::IterMut<'a, Option<TxEntry>>),
    Heap(std::slice::IterMut<'a, TxEntry>),
}

impl<'a> Iterator for EntryIterMut<'a> {
    type Item = &'a mut TxEntry;

    fn next(&mut self) -> Option<&'a mut TxEntry> {
        match self {
            Self::Inline(iter) => iter.next().map(|slot| {
                slot.as_mut().expect("inline slot below len is filled")
            }),
            Self::Heap(iter) => iter.next(),
        }
    }
}

/// One in-flight send.
pub struct Transaction {
    sender: Arc<PeerInfo>,
    domain: Arc<Domain>,
    flags: u64,
    payload: Vec<u8>,
    files: Vec<Arc<OwnedFd>>,
    entries: EntryStore,
}

impl Transaction {
    /// Build a transaction from a send parameter block.
    ///
    /// Gathers the payload vectors, reads the id array, and resolves the
    /// caller's fd numbers into owned files. Any caller-memory fault here
    /// is fatal to the whole send.
    pub fn new_from_caller(
        sender: Arc<PeerInfo>,
        domain: Arc<Domain>,
        param: &CmdSend,
        mem: &dyn CallerMemory,
        fdt: &dyn crate::fd::FdTable,
    ) -> BusResult<Self> {
        // Gather payload vectors.
        let mut payload = Vec::new();
        for i in 0..param.n_vecs {
            let vec = SendVec::read_from(mem, param.ptr_vecs + i * wire::SEND_VEC_SIZE)?;
            let len = usize::try_from(vec.len).map_err(|_| BusError::NoMemory)?;
            let start = payload.len();
            payload.try_reserve(len).map_err(|_| BusError::NoMemory)?;
            payload.resize(start + len, 0);
            mem.read(vec.ptr, &mut payload[start..])?;
        }

        // The id array must be readable; handle transfer itself lives in
        // the handle layer and is not part of the message body.
        for i in 0..param.n_ids {
            wire::read_u64(mem, param.ptr_ids + i * 8)?;
        }

        // Resolve files.
        let mut files = Vec::with_capacity(param.n_fds as usize);
        for i in 0..param.n_fds {
            let fd = wire::read_i32(mem, param.ptr_fds + i * 4)?;
            files.push(fdt.get(fd)?);
        }

        Ok(Self {
            sender,
            domain,
            flags: param.flags,
            payload,
            files,
            entries: EntryStore::with_capacity(param.n_destinations as usize),
        })
    }

    /// Build a transaction directly from parts. Used by in-process
    /// embedders and tests that bypass caller memory.
    pub fn new(
        sender: Arc<PeerInfo>,
        domain: Arc<Domain>,
        flags: u64,
        payload: Vec<u8>,
        files: Vec<Arc<OwnedFd>>,
        n_destinations: usize,
    ) -> Self {
        Self {
            sender,
            domain,
            flags,
            payload,
            files,
            entries: EntryStore::with_capacity(n_destinations),
        }
    }

    fn ignore_unknown(&self) -> bool {
        self.flags & wire::send_flags::IGNORE_UNKNOWN != 0
    }

    fn convey_errors(&self) -> bool {
        self.flags & wire::send_flags::CONVEY_ERRORS != 0
    }

    /// Stage the message at one destination handle.
    ///
    /// Unknown, stale, or torn-down destinations fail with `NoSuchEntry`
    /// unless IGNORE_UNKNOWN is set, in which case they are skipped.
    /// Resource failures at the destination are recorded on its error
    /// channel instead when CONVEY_ERRORS is set.
    pub fn instantiate(&mut self, user: &User, dest_handle: u64) -> BusResult<()> {
        let unknown = |tx: &Self| {
            if tx.ignore_unknown() {
                Ok(())
            } else {
                Err(BusError::NoSuchEntry)
            }
        };

        let Some(peer_id) = self.sender.resolve_handle(dest_handle) else {
            return unknown(self);
        };
        let Some(dest) = self.domain.peer_by_id(peer_id) else {
            return unknown(self);
        };
        if !dest.acquire() {
            return unknown(self);
        }

        let r = self.instantiate_at(&dest, peer_id, user);
        dest.release();

        match r {
            Ok(()) => Ok(()),
            Err(err) if err == BusError::NoMemory && self.convey_errors() => {
                // The destination missed a message; report through its
                // error channel and keep the multicast going.
                if let Ok(info) = dest.dereference() {
                    info.note_conveyed_error();
                }
                tracing::debug!(peer_id, "destination quota or pool exhausted, error conveyed");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn instantiate_at(&mut self, dest: &Arc<Peer>, peer_id: u64, user: &User) -> BusResult<()> {
        let info = dest.dereference()?;

        // The handle was minted against a logical id; a RESET since then
        // rebinds the peer and the stale tag must miss.
        if dest.id() != peer_id {
            return Err(BusError::NoSuchEntry);
        }

        let slice_size = (self.payload.len() + self.files.len() * FD_WORD_SIZE).max(1) as u64;

        let mut guard = info.core();
        let core = &mut *guard;
        core.quota
            .charge(user.uid(), info.pool_size(), slice_size, 1)?;

        let slice = match core.pool.alloc(slice_size) {
            Ok(slice) => slice,
            Err(err) => {
                core.quota.discharge(user.uid(), slice_size, 1);
                return Err(err);
            }
        };
        if let Err(err) = core.pool.write(slice, 0, &self.payload) {
            core.pool.release_kernel(slice);
            core.quota.discharge(user.uid(), slice_size, 1);
            return Err(err);
        }

        let msg = Arc::new(Message::new(
            slice,
            self.files.clone(),
            user.uid(),
            self.convey_errors(),
        ));
        let (staged_seq, epoch) = core.queue.stage(msg.clone());
        drop(guard);

        self.entries.push(TxEntry {
            peer: dest.clone(),
            info,
            msg,
            staged_seq,
            epoch,
            committed: false,
        });
        Ok(())
    }

    /// Publish every staged entry atomically.
    ///
    /// One commit sequence, ordered after every staged sequence, is
    /// stamped across all destinations; entries whose queue was flushed
    /// in the meantime are silently deallocated.
    pub fn commit(&mut self) {
        let mut max_staged = 0;
        for entry in self.entries.iter_mut() {
            max_staged = max_staged.max(entry.staged_seq);
        }
        if max_staged == 0 {
            return;
        }
        let commit_seq = max_staged + 1;

        for entry in self.entries.iter_mut() {
            let stamp = self.domain.next_stamp();
            let mut core = entry.info.core();
            let core_ref = &mut *core;
            if core_ref
                .queue
                .commit_node(entry.staged_seq, entry.epoch, commit_seq, stamp)
            {
                entry.committed = true;
                entry.info.refresh_head_hint(core_ref);
            } else {
                // Flushed under us: the unlink was the cancellation
                // signal, deallocate our copy.
                entry
                    .msg
                    .deallocate(&mut core_ref.pool, &mut core_ref.quota);
            }
            drop(core);

            if entry.committed {
                entry.peer.wake();
            }
        }
    }

    /// Unicast fastpath: stage one destination and commit immediately.
    pub fn commit_for_id(&mut self, user: &User, dest_handle: u64) -> BusResult<()> {
        self.instantiate(user, dest_handle)?;
        self.commit();
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn uses_inline_scratch(&self) -> bool {
        self.entries.is_inline()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        // Abort path: unstage whatever was never committed.
        for entry in self.entries.iter_mut() {
            if entry.committed {
                continue;
            }
            let mut core = entry.info.core();
            let core = &mut *core;
            let _ = core.queue.remove_staged(entry.staged_seq, entry.epoch);
            entry.msg.deallocate(&mut core.pool, &mut core.quota);
            entry.info.refresh_head_hint(core);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PAGE_SIZE;

    fn transaction_for(n_destinations: usize) -> Transaction {
        let sender = PeerInfo::new(PAGE_SIZE).unwrap();
        let domain = Domain::new();
        Transaction::new(sender, domain, 0, Vec::new(), Vec::new(), n_destinations)
    }

    #[test]
    fn small_multicasts_use_inline_scratch() {
        for n in 0..=INLINE_DESTINATIONS {
            assert!(transaction_for(n).uses_inline_scratch());
        }
        assert!(!transaction_for(INLINE_DESTINATIONS + 1).uses_inline_scratch());
    }

    #[test]
    fn empty_commit_is_a_noop() {
        let mut tx = transaction_for(4);
        tx.commit();
    }
}
