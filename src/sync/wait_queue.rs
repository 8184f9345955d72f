//! Strict-FIFO wait queue shared by the primitives in this module.
//!
//! Each pending acquisition is one [`WaitNode`] carrying a per-primitive
//! tag (the lock's mode, a semaphore's requested permit count) and the
//! [`Signal`] handed back to the caller. Nodes are identified by a
//! monotonically assigned id so a waiter can withdraw itself without
//! holding a reference into the queue.
//!
//! The queue is only ever touched under the owning primitive's monitor.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::signal::Signal;

/// One pending acquisition.
#[derive(Debug)]
pub(crate) struct WaitNode<T> {
    id: u64,
    tag: T,
    signal: Arc<Signal>,
}

impl<T> WaitNode<T> {
    /// The per-primitive tag (lock mode, permit count, ...).
    pub(crate) const fn tag(&self) -> &T {
        &self.tag
    }

    /// The completion signal the waiter is parked on.
    pub(crate) const fn signal(&self) -> &Arc<Signal> {
        &self.signal
    }
}

/// FIFO queue of wait nodes with O(1) append and head removal.
///
/// Unlinking an arbitrary node takes the front fast path when possible
/// (grants and head expirations, the common case) and falls back to a
/// targeted scan that stops at the first match.
#[derive(Debug)]
pub(crate) struct WaitQueue<T> {
    nodes: VecDeque<WaitNode<T>>,
    next_id: u64,
}

impl<T> WaitQueue<T> {
    pub(crate) const fn new() -> Self {
        Self {
            nodes: VecDeque::new(),
            next_id: 0,
        }
    }

    /// Links a new node at the tail and returns its id.
    pub(crate) fn append(&mut self, tag: T, signal: Arc<Signal>) -> u64 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.nodes.push_back(WaitNode { id, tag, signal });
        id
    }

    /// Excises the node with `id` from wherever it sits.
    ///
    /// Returns false when the node is no longer linked (it was granted
    /// or drained concurrently with the caller deciding to withdraw).
    pub(crate) fn unlink(&mut self, id: u64) -> bool {
        if self.nodes.front().is_some_and(|node| node.id == id) {
            self.nodes.pop_front();
            return true;
        }
        if let Some(pos) = self.nodes.iter().position(|node| node.id == id) {
            self.nodes.remove(pos);
            return true;
        }
        false
    }

    /// Head inspection without removal.
    pub(crate) fn peek_head(&self) -> Option<&WaitNode<T>> {
        self.nodes.front()
    }

    /// Removes and returns the head node.
    pub(crate) fn pop_head(&mut self) -> Option<WaitNode<T>> {
        self.nodes.pop_front()
    }

    /// The node at `index` from the head, for drain walks that skip
    /// entries in place.
    pub(crate) fn get(&self, index: usize) -> Option<&WaitNode<T>> {
        self.nodes.get(index)
    }

    /// Removes the node at `index` from the head.
    pub(crate) fn remove_at(&mut self, index: usize) -> Option<WaitNode<T>> {
        self.nodes.remove(index)
    }

    /// Unlinks every node, for disposal.
    pub(crate) fn take_all(&mut self) -> VecDeque<WaitNode<T>> {
        std::mem::take(&mut self.nodes)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }
}
