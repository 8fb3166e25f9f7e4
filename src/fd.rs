// src/fd.rs

//! File-descriptor table seam.
//!
//! The receive path must pre-reserve fd slots before dequeuing a message
//! so that fd exhaustion can never drop a message after the dequeue, and
//! the send path must resolve caller fd numbers into owned files. Both
//! sides go through this trait, so embedders can route them at the real
//! process fd table or an in-memory one for tests.

use std::collections::{HashMap, HashSet};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use crate::error::{BusError, BusResult};

/// A caller's file-descriptor table.
pub trait FdTable {
    /// Resolve a caller fd number into an owned file reference
    /// (send side). Fails with `InvalidArgument` for unknown numbers.
    fn get(&self, fd: RawFd) -> BusResult<Arc<OwnedFd>>;

    /// Reserve an unused fd slot with close-on-exec set (receive side).
    /// Fails with `NoMemory` when the table is exhausted.
    fn reserve(&mut self) -> BusResult<RawFd>;

    /// Install a file into a previously reserved slot.
    fn install(&mut self, slot: RawFd, file: &Arc<OwnedFd>);

    /// Return a reserved slot that was not used.
    fn unreserve(&mut self, slot: RawFd);
}

/// Fd table backed by the calling process via libc.
///
/// `reserve` pins an fd number by opening `/dev/null` with close-on-exec;
/// `install` replaces the placeholder with a dup of the real file.
pub struct SystemFdTable;

impl FdTable for SystemFdTable {
    fn get(&self, fd: RawFd) -> BusResult<Arc<OwnedFd>> {
        let duped = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
        if duped < 0 {
            return Err(BusError::InvalidArgument);
        }
        // SAFETY: fcntl returned a fresh descriptor we now own.
        Ok(Arc::new(unsafe { OwnedFd::from_raw_fd(duped) }))
    }

    fn reserve(&mut self) -> BusResult<RawFd> {
        let fd = unsafe {
            libc::open(
                c"/dev/null".as_ptr(),
                libc::O_RDONLY | libc::O_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(BusError::NoMemory);
        }
        Ok(fd)
    }

    fn install(&mut self, slot: RawFd, file: &Arc<OwnedFd>) {
        let r = unsafe { libc::dup3(file.as_raw_fd(), slot, libc::O_CLOEXEC) };
        if r < 0 {
            tracing::warn!(slot, "fd install failed");
        }
    }

    fn unreserve(&mut self, slot: RawFd) {
        unsafe {
            libc::close(slot);
        }
    }
}

#[derive(Debug)]
struct TestFdEntry {
    file: Arc<OwnedFd>,
    cloexec: bool,
}

/// In-memory fd table for tests and embedders without a process table.
pub struct TestFdTable {
    entries: HashMap<RawFd, TestFdEntry>,
    reserved: HashSet<RawFd>,
    next: RawFd,
    reserve_budget: Option<usize>,
}

impl TestFdTable {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            reserved: HashSet::new(),
            next: 100,
            reserve_budget: None,
        }
    }

    /// Register a file under a fresh fd number, as if the caller had it
    /// open. Returns the number for use in a send parameter block.
    pub fn add_file(&mut self, file: Arc<OwnedFd>) -> RawFd {
        let fd = self.next;
        self.next += 1;
        self.entries.insert(
            fd,
            TestFdEntry {
                file,
                cloexec: false,
            },
        );
        fd
    }

    /// Make the next `n` reserves succeed and every one after fail, to
    /// exercise fd exhaustion.
    pub fn limit_reserves(&mut self, n: usize) {
        self.reserve_budget = Some(n);
    }

    /// The file installed at `fd`, if any.
    pub fn installed(&self, fd: RawFd) -> Option<&Arc<OwnedFd>> {
        self.entries.get(&fd).map(|e| &e.file)
    }

    /// Whether `fd` has close-on-exec set.
    pub fn is_cloexec(&self, fd: RawFd) -> bool {
        self.entries.get(&fd).map(|e| e.cloexec).unwrap_or(false)
    }

    /// Slots reserved but neither installed nor returned. Zero after any
    /// well-behaved receive.
    pub fn n_reserved(&self) -> usize {
        self.reserved.len()
    }
}

impl FdTable for TestFdTable {
    fn get(&self, fd: RawFd) -> BusResult<Arc<OwnedFd>> {
        self.entries
            .get(&fd)
            .map(|e| e.file.clone())
            .ok_or(BusError::InvalidArgument)
    }

    fn reserve(&mut self) -> BusResult<RawFd> {
        if let Some(budget) = &mut self.reserve_budget {
            if *budget == 0 {
                return Err(BusError::NoMemory);
            }
            *budget -= 1;
        }
        let fd = self.next;
        self.next += 1;
        self.reserved.insert(fd);
        Ok(fd)
    }

    fn install(&mut self, slot: RawFd, file: &Arc<OwnedFd>) {
        self.reserved.remove(&slot);
        self.entries.insert(
            slot,
            TestFdEntry {
                file: file.clone(),
                cloexec: true,
            },
        );
    }

    fn unreserve(&mut self, slot: RawFd) {
        self.reserved.remove(&slot);
    }
}
