//! Reconnection timer heap.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Instant;

use crate::domain::ConnectionId;

/// Deadline-ordered reconnection timers.
///
/// Entries are never removed in place: each arm stores a sequence number on
/// the owner side, and entries whose sequence no longer matches are dropped
/// when they reach the top of the heap.
#[derive(Debug, Default)]
pub(crate) struct TimerHeap {
    heap: BinaryHeap<Reverse<(Instant, u64, ConnectionId)>>,
    next_seq: u64,
}

impl TimerHeap {
    /// Arms a timer for `id` and returns the sequence number identifying it.
    pub(crate) fn arm(&mut self, id: ConnectionId, deadline: Instant) -> u64 {
        self.next_seq = self.next_seq.wrapping_add(1);
        self.heap.push(Reverse((deadline, self.next_seq, id)));
        self.next_seq
    }

    /// Pops every entry due at `now`, in deadline order.
    pub(crate) fn pop_due(&mut self, now: Instant) -> Vec<(ConnectionId, u64)> {
        let mut due = Vec::new();
        while let Some(Reverse((deadline, seq, id))) = self.heap.peek().copied() {
            if deadline > now {
                break;
            }
            let _ = self.heap.pop();
            due.push((id, seq));
        }
        due
    }

    pub(crate) fn clear(&mut self) {
        self.heap.clear();
    }
}
