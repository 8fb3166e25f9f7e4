// src/queue.rs

//! Ordered message queue of one peer.
//!
//! Nodes are keyed by a 64-bit sequence number plus a tiebreak stamp.
//! Staging inserts a node under an odd sequence number drawn from the
//! queue's local clock; committing re-keys it under the even commit
//! sequence chosen by the transaction (the maximum staged sequence across
//! all destinations, plus one). The queue clock is synced to every commit
//! sequence it observes, so later stages (and therefore later commits)
//! always order after earlier ones.
//!
//! An *uncommitted* node at the front is an ordering barrier: `peek`
//! refuses to return anything until the in-flight transaction either
//! commits or aborts. `post_flush` bumps the queue epoch; a transaction
//! that staged before the flush observes the epoch mismatch at commit
//! time and silently discards its node. The unlink is the cancellation
//! signal.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::message::Message;

#[derive(Debug)]
struct QueueNode {
    committed: bool,
    msg: Arc<Message>,
}

/// Ordered multiset of message nodes.
pub struct Queue {
    nodes: BTreeMap<(u64, u64), QueueNode>,
    clock: u64,
    epoch: u64,
}

impl Queue {
    pub fn new() -> Self {
        Self {
            nodes: BTreeMap::new(),
            clock: 0,
            epoch: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[inline]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Stage an uncommitted node.
    ///
    /// Returns the odd staging sequence and the current epoch; both are
    /// needed to commit or abort the node later.
    pub fn stage(&mut self, msg: Arc<Message>) -> (u64, u64) {
        self.clock += 2;
        let seq = self.clock - 1;
        self.nodes.insert(
            (seq, 0),
            QueueNode {
                committed: false,
                msg,
            },
        );
        (seq, self.epoch)
    }

    /// Current clock value, used by transactions to pick a commit
    /// sequence ordered after everything staged so far.
    #[inline]
    pub fn clock(&self) -> u64 {
        self.clock
    }

    /// Commit a staged node under its final sequence number.
    ///
    /// Returns false, and does nothing, if the queue was flushed since
    /// the stage (epoch mismatch) or the node is gone; the transaction
    /// must treat that as a silent discard.
    pub fn commit_node(&mut self, staged_seq: u64, epoch: u64, commit_seq: u64, stamp: u64) -> bool {
        debug_assert!(staged_seq % 2 == 1);
        debug_assert!(commit_seq % 2 == 0);

        if epoch != self.epoch {
            return false;
        }
        let Some(node) = self.nodes.remove(&(staged_seq, 0)) else {
            return false;
        };

        self.nodes.insert(
            (commit_seq, stamp),
            QueueNode {
                committed: true,
                msg: node.msg,
            },
        );
        if commit_seq > self.clock {
            self.clock = commit_seq;
        }
        true
    }

    /// Remove a staged node without committing it (transaction abort).
    ///
    /// Returns the message so the caller can deallocate its slice, or
    /// None if a flush already discarded the node.
    pub fn remove_staged(&mut self, staged_seq: u64, epoch: u64) -> Option<Arc<Message>> {
        if epoch != self.epoch {
            return None;
        }
        self.nodes.remove(&(staged_seq, 0)).map(|n| n.msg)
    }

    /// Return the front message only if it is committed.
    pub fn peek(&self) -> Option<Arc<Message>> {
        let (_, node) = self.nodes.iter().next()?;
        if node.committed {
            Some(node.msg.clone())
        } else {
            None
        }
    }

    /// Dequeue the committed front message.
    pub fn remove_front(&mut self) -> Option<Arc<Message>> {
        let (&key, node) = self.nodes.iter().next()?;
        if !node.committed {
            return None;
        }
        self.nodes.remove(&key).map(|n| n.msg)
    }

    /// Take every node out of the queue, front to back. The reset walk
    /// uses this to deallocate committed messages; uncommitted ones are
    /// discarded by the removal alone.
    pub fn drain_all(&mut self) -> Vec<(bool, Arc<Message>)> {
        let nodes = std::mem::take(&mut self.nodes);
        nodes
            .into_values()
            .map(|n| (n.committed, n.msg))
            .collect()
    }

    /// Invalidate every sequence number handed out so far.
    ///
    /// Discards whatever the reset walk left behind and bumps the epoch
    /// so in-flight transactions observe the flush.
    pub fn post_flush(&mut self) {
        self.nodes.clear();
        self.epoch += 1;
    }
}

impl Default for Queue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("len", &self.nodes.len())
            .field("clock", &self.clock)
            .field("epoch", &self.epoch)
            .finish()
    }
}
