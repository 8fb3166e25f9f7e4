//! Shared harness for integration tests.
//!
//! Drives the engine the way an embedder would: parameter blocks are
//! encoded into a flat `VecMemory` address space and dispatched through
//! `peer_command` with an in-memory fd table.

#![allow(dead_code)]

use std::sync::Arc;

use warren::wire::{self, cmd, connect_flags, CmdConnect, CmdRecv, CmdResolve, CmdSend, SendVec};
use warren::{
    peer_command, BusResult, CallerMemory, Credentials, Domain, Peer, TestFdTable, VecMemory,
};

/// Install the test log subscriber once; respects `RUST_LOG`.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Parameter block area.
pub const ARG: u64 = 0;
/// Destination id array.
pub const DESTS: u64 = 4096;
/// Scatter-gather vector array.
pub const VECS: u64 = 8192;
/// Payload bytes.
pub const DATA: u64 = 12288;
/// Fd number array.
pub const FDS: u64 = 16384;

/// One caller: its address space, fd table and credentials, bound to a
/// shared domain.
pub struct TestBus {
    pub domain: Arc<Domain>,
    pub mem: VecMemory,
    pub fdt: TestFdTable,
    pub cred: Credentials,
}

impl TestBus {
    pub fn new() -> Self {
        Self::with_domain(Domain::new())
    }

    pub fn with_domain(domain: Arc<Domain>) -> Self {
        Self {
            domain,
            mem: VecMemory::new(1 << 16),
            fdt: TestFdTable::new(),
            cred: Credentials {
                uid: 1000,
                admin: true,
            },
        }
    }

    pub fn command(&mut self, peer: &Arc<Peer>, command: u32, arg: u64) -> BusResult<()> {
        peer_command(
            peer,
            &self.domain,
            &self.cred,
            &mut self.mem,
            &mut self.fdt,
            command,
            arg,
        )
    }

    /// CONNECT with explicit flags; returns the pool size written back
    /// when QUERY was part of the flags.
    pub fn connect_raw(
        &mut self,
        peer: &Arc<Peer>,
        flags: u64,
        pool_size: u64,
        names: &[u8],
    ) -> BusResult<u64> {
        let block = CmdConnect::encode(flags, pool_size, names);
        self.mem.write(ARG, &block)?;
        self.command(peer, cmd::CONNECT, ARG)?;
        wire::read_u64(&self.mem, ARG + wire::CMD_CONNECT_POOL_SIZE_OFFSET)
    }

    /// Plain PEER connect.
    pub fn connect(&mut self, peer: &Arc<Peer>, pool_size: u64, names: &[u8]) -> BusResult<()> {
        self.connect_raw(peer, connect_flags::PEER, pool_size, names)
            .map(|_| ())
    }

    /// CONNECT(QUERY); returns the observed pool size.
    pub fn query(&mut self, peer: &Arc<Peer>) -> BusResult<u64> {
        self.connect_raw(peer, connect_flags::QUERY, 0, b"")
    }

    /// CONNECT(RESET | QUERY); returns the observed pool size.
    pub fn reset(&mut self, peer: &Arc<Peer>) -> BusResult<u64> {
        self.connect_raw(peer, connect_flags::RESET | connect_flags::QUERY, 0, b"")
    }

    /// RESOLVE a name (terminator appended here) to a handle id.
    pub fn resolve(&mut self, peer: &Arc<Peer>, name: &[u8]) -> BusResult<u64> {
        let mut wire_name = name.to_vec();
        wire_name.push(0);
        let block = CmdResolve::encode(0, &wire_name);
        self.mem.write(ARG, &block)?;
        self.command(peer, cmd::RESOLVE, ARG)?;
        wire::read_u64(&self.mem, ARG + wire::CMD_RESOLVE_ID_OFFSET)
    }

    /// SEND one payload to the given destination handles.
    pub fn send(
        &mut self,
        peer: &Arc<Peer>,
        dests: &[u64],
        payload: &[u8],
        fds: &[i32],
        flags: u64,
    ) -> BusResult<()> {
        for (i, dest) in dests.iter().enumerate() {
            self.mem.write(DESTS + i as u64 * 8, &dest.to_ne_bytes())?;
        }
        let n_vecs = if payload.is_empty() { 0 } else { 1 };
        if n_vecs == 1 {
            self.mem.write(DATA, payload)?;
            let vec = SendVec {
                ptr: DATA,
                len: payload.len() as u64,
            };
            self.mem.write(VECS, &vec.encode())?;
        }
        for (i, fd) in fds.iter().enumerate() {
            self.mem.write(FDS + i as u64 * 4, &fd.to_ne_bytes())?;
        }

        let param = CmdSend {
            flags,
            ptr_destinations: DESTS,
            n_destinations: dests.len() as u64,
            ptr_vecs: VECS,
            n_vecs,
            ptr_ids: 0,
            n_ids: 0,
            ptr_fds: FDS,
            n_fds: fds.len() as u64,
        };
        self.mem.write(ARG, &param.encode())?;
        self.command(peer, cmd::SEND, ARG)
    }

    /// RECV; returns the output block on success.
    pub fn recv(&mut self, peer: &Arc<Peer>, flags: u64) -> BusResult<CmdRecv> {
        let input = CmdRecv::input(flags);
        self.mem.write(ARG, &input.encode())?;
        self.command(peer, cmd::RECV, ARG)?;
        CmdRecv::read_from(&self.mem, ARG)
    }

    /// SLICE_RELEASE by offset.
    pub fn slice_release(&mut self, peer: &Arc<Peer>, offset: u64) -> BusResult<()> {
        self.mem.write(ARG, &offset.to_ne_bytes())?;
        self.command(peer, cmd::SLICE_RELEASE, ARG)
    }

    /// DISCONNECT.
    pub fn disconnect(&mut self, peer: &Arc<Peer>) -> BusResult<()> {
        self.command(peer, cmd::DISCONNECT, 0)
    }
}
