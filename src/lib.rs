//! Peer lifecycle and dispatch engine for a capability-based local IPC
//! bus.
//!
//! A *peer* is an addressable endpoint owned by a user identity, hosting
//! a private receive queue, a pool for message payloads, and an optional
//! set of well-known names registered in an enclosing *domain*. Callers
//! drive everything: there are no background threads, and every blocking
//! point (locks, the teardown drain barrier) is explicit.
//!
//! # Architecture
//!
//! ```text
//!                       ┌───────────────┐
//!                       │    Domain     │  name index · peer map
//!                       └───────┬───────┘  user table · shutdown
//!               ┌───────────────┼───────────────┐
//!               │               │               │
//!          ┌────┴────┐     ┌────┴────┐     ┌────┴────┐
//!          │  Peer   │     │  Peer   │     │  Peer   │   rwlock · waitq
//!          └────┬────┘     └────┬────┘     └────┬────┘   active-gate
//!               │               │               │
//!          ┌────┴────┐     ┌────┴────┐     ┌────┴────┐
//!          │PeerInfo │     │PeerInfo │     │PeerInfo │   queue · pool
//!          └─────────┘     └─────────┘     └─────────┘   quota · handles
//! ```
//!
//! Sends cross peers through a transaction: the payload is instantiated
//! at every destination or none, and one commit sequence makes the whole
//! multicast visible atomically. Receives dequeue with side effects
//! (slice publication into the pool, fd installation into the caller's
//! table), with peek semantics and pre-reserved fds so allocation
//! pressure never drops a message after the dequeue.
//!
//! # Usage
//!
//! ```ignore
//! use warren::{Domain, Peer, Credentials, peer_command, wire};
//!
//! let domain = Domain::new();
//! let peer = Peer::new();
//! let cred = Credentials { uid: 1000, admin: true };
//!
//! // CONNECT with a 4 KiB pool and one name.
//! let block = wire::CmdConnect::encode(
//!     wire::connect_flags::PEER, 4096, b"org.example.svc\0");
//! mem.write(0, &block)?;
//! peer_command(&peer, &domain, &cred, &mut mem, &mut fds,
//!              wire::cmd::CONNECT, 0)?;
//! ```

pub mod active;
pub mod domain;
pub mod error;
pub mod fd;
pub mod message;
pub mod peer;
pub mod pool;
pub mod queue;
pub mod transaction;
pub mod user;
pub mod wait;
pub mod wire;

// Re-export key types
pub use active::ActiveGate;
pub use domain::Domain;
pub use error::{BusError, BusResult};
pub use fd::{FdTable, SystemFdTable, TestFdTable};
pub use message::{Message, FD_WORD_SIZE};
pub use peer::{peer_command, Credentials, Peer, PeerDiagnostics, PeerInfo};
pub use pool::{Pool, SliceHandle, PAGE_SIZE};
pub use queue::Queue;
pub use transaction::Transaction;
pub use user::{User, UserQuota, UserRegistry};
pub use wait::WaitQueue;
pub use wire::{CallerMemory, VecMemory};
