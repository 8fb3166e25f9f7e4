// src/user.rs

//! User accounting: shared per-uid identity objects and per-peer quotas.
//!
//! Every connected peer pins one `User` for its uid; peers of the same
//! uid share the object. The domain owns the uid table and serializes
//! acquire/release under its lock. Each peer additionally tracks, per
//! *sending* user, how much of its pool and queue that user occupies;
//! the quota bounds what a single sender can pin at one destination.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use crate::error::{BusError, BusResult};

/// Fraction of a destination pool one sending user may occupy.
const QUOTA_POOL_SHARE: u64 = 4;

/// Maximum in-flight messages from one sending user at one destination.
const QUOTA_MSGS_MAX: u64 = 1024;

/// Shared per-uid accounting object.
#[derive(Debug)]
pub struct User {
    uid: u64,
}

impl User {
    #[inline]
    pub fn uid(&self) -> u64 {
        self.uid
    }
}

/// The domain's uid table. Entries are weak so a uid's accounting object
/// dies with its last peer.
#[derive(Debug, Default)]
pub struct UserRegistry {
    users: HashMap<u64, Weak<User>>,
}

impl UserRegistry {
    pub fn new() -> Self {
        Self {
            users: HashMap::new(),
        }
    }

    /// Pin the accounting object for `uid`, creating it on first use.
    ///
    /// Must run under the domain lock.
    pub fn acquire(&mut self, uid: u64) -> Arc<User> {
        if let Some(user) = self.users.get(&uid).and_then(Weak::upgrade) {
            return user;
        }
        let user = Arc::new(User { uid });
        self.users.insert(uid, Arc::downgrade(&user));
        user
    }

    /// Drop a pinned reference and garbage-collect the entry if this was
    /// the last peer of that uid. Must run under the domain lock.
    pub fn release(&mut self, user: Arc<User>) {
        let uid = user.uid;
        drop(user);
        if let Some(slot) = self.users.get(&uid) {
            if slot.strong_count() == 0 {
                self.users.remove(&uid);
            }
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.users.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct QuotaStats {
    bytes: u64,
    n_messages: u64,
}

/// Per-peer, per-sending-user resource tracking.
#[derive(Debug, Default)]
pub struct UserQuota {
    stats: HashMap<u64, QuotaStats>,
}

impl UserQuota {
    pub fn new() -> Self {
        Self {
            stats: HashMap::new(),
        }
    }

    /// Charge `bytes` and `n_messages` against `uid`'s share of a pool of
    /// `pool_size` bytes. Fails with `NoMemory` when the share would be
    /// exceeded; a failed charge changes nothing.
    pub fn charge(&mut self, uid: u64, pool_size: u64, bytes: u64, n_messages: u64) -> BusResult<()> {
        let current = self.stats.get(&uid).copied().unwrap_or_default();
        let new_bytes = current.bytes.checked_add(bytes).ok_or(BusError::NoMemory)?;
        let new_msgs = current
            .n_messages
            .checked_add(n_messages)
            .ok_or(BusError::NoMemory)?;

        if new_bytes > pool_size / QUOTA_POOL_SHARE || new_msgs > QUOTA_MSGS_MAX {
            return Err(BusError::NoMemory);
        }

        self.stats.insert(
            uid,
            QuotaStats {
                bytes: new_bytes,
                n_messages: new_msgs,
            },
        );
        Ok(())
    }

    /// Return a previous charge.
    pub fn discharge(&mut self, uid: u64, bytes: u64, n_messages: u64) {
        let Some(entry) = self.stats.get_mut(&uid) else {
            debug_assert!(false, "discharge without charge");
            return;
        };
        entry.bytes = entry.bytes.saturating_sub(bytes);
        entry.n_messages = entry.n_messages.saturating_sub(n_messages);
        if entry.bytes == 0 && entry.n_messages == 0 {
            self.stats.remove(&uid);
        }
    }

    /// Drop all tracking. Used when the owning peer info is destroyed.
    pub fn destroy(&mut self) {
        self.stats.clear();
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }
}
