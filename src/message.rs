// src/message.rs

//! Message objects queued at a destination peer.
//!
//! A message owns a slice in the destination's pool (payload plus the
//! file-descriptor number tail written at receive time) and a list of
//! file references to install into the receiving caller's fd table. The
//! slice and the sender's quota charge are released together through
//! `deallocate`, exactly once, under the destination's info lock.

use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::pool::{Pool, SliceHandle};
use crate::user::UserQuota;

/// Width of one fd-number word in the published slice tail.
///
/// The receive path writes the installed fd numbers into the final
/// `n_files * FD_WORD_SIZE` bytes of the slice, native-endian, one
/// pointer-sized word per file.
pub const FD_WORD_SIZE: usize = std::mem::size_of::<usize>();

/// A queued message at one destination.
pub struct Message {
    /// Payload slice in the destination pool.
    pub slice: SliceHandle,
    /// Files to install on receive, in wire order.
    pub files: Vec<Arc<OwnedFd>>,
    /// Sending user, for quota discharge.
    pub sender_uid: u64,
    /// The send carried CONVEY_ERRORS; delivery failures are reported
    /// through the error channel instead of being silent.
    pub convey_errors: bool,
    released: AtomicBool,
}

impl Message {
    pub fn new(
        slice: SliceHandle,
        files: Vec<Arc<OwnedFd>>,
        sender_uid: u64,
        convey_errors: bool,
    ) -> Self {
        Self {
            slice,
            files,
            sender_uid,
            convey_errors,
            released: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn n_files(&self) -> usize {
        self.files.len()
    }

    /// Release the slice and the sender's quota charge.
    ///
    /// Idempotent; the first caller wins. Must run under the destination's
    /// info lock, which is why the pool and quota are passed in.
    pub fn deallocate(&self, pool: &mut Pool, quota: &mut UserQuota) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        pool.release_kernel(self.slice);
        quota.discharge(self.sender_uid, self.slice.size, 1);
    }

    /// Whether `deallocate` already ran.
    #[inline]
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("slice", &self.slice)
            .field("n_files", &self.files.len())
            .field("sender_uid", &self.sender_uid)
            .field("released", &self.is_released())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PAGE_SIZE;

    #[test]
    fn deallocate_is_idempotent() {
        let mut pool = Pool::new(PAGE_SIZE).unwrap();
        let mut quota = UserQuota::new();
        quota.charge(7, PAGE_SIZE, 64, 1).unwrap();

        let slice = pool.alloc(64).unwrap();
        let msg = Message::new(slice, Vec::new(), 7, false);

        msg.deallocate(&mut pool, &mut quota);
        assert!(msg.is_released());
        assert_eq!(pool.n_slices(), 0);

        // Second call must not touch the pool again.
        let other = pool.alloc(64).unwrap();
        assert_eq!(other.offset, slice.offset);
        msg.deallocate(&mut pool, &mut quota);
        assert_eq!(pool.n_slices(), 1);
    }
}
