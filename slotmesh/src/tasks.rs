//! Deferred actions keyed by deadline.
//!
//! A min-heap of `(deadline, seq, id, action)`. Cancellation is lazy: the id is
//! dropped from the live set and the entry is skipped when it surfaces.

use alloc::collections::BinaryHeap;
use alloc::vec::Vec;
use core::cmp::Ordering;

use hashbrown::HashSet;

use crate::time::Instant;

/// Identity of a scheduled task, used to cancel it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u32);

struct Scheduled<A> {
    deadline: Instant,
    seq: u32,
    id: TaskId,
    action: A,
}

impl<A> PartialEq for Scheduled<A> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl<A> Eq for Scheduled<A> {}

impl<A> PartialOrd for Scheduled<A> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<A> Ord for Scheduled<A> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap.
        match other.deadline.cmp(&self.deadline) {
            Ordering::Equal => other.seq.cmp(&self.seq),
            ord => ord,
        }
    }
}

/// Priority queue of delayed actions.
pub struct DelayedTasks<A> {
    heap: BinaryHeap<Scheduled<A>>,
    live: HashSet<TaskId>,
    next_seq: u32,
}

impl<A> Default for DelayedTasks<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> DelayedTasks<A> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            live: HashSet::new(),
            next_seq: 0,
        }
    }

    /// Run `action` at `deadline`.
    pub fn schedule(&mut self, deadline: Instant, action: A) -> TaskId {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        let id = TaskId(seq);
        self.live.insert(id);
        self.heap.push(Scheduled {
            deadline,
            seq,
            id,
            action,
        });
        id
    }

    /// Cancel a pending task. Returns false if it already ran or was cancelled.
    pub fn cancel(&mut self, id: TaskId) -> bool {
        self.live.remove(&id)
    }

    pub fn is_pending(&self, id: TaskId) -> bool {
        self.live.contains(&id)
    }

    /// Remove and return every task due at `now`, in deadline order.
    pub fn pop_due(&mut self, now: Instant) -> Vec<A> {
        let mut due = Vec::new();
        while let Some(top) = self.heap.peek() {
            if top.deadline > now {
                break;
            }
            if let Some(task) = self.heap.pop() {
                if self.live.remove(&task.id) {
                    due.push(task.action);
                }
            }
        }
        due
    }

    /// Earliest live deadline.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(top) = self.heap.peek() {
            if self.live.contains(&top.id) {
                return Some(top.deadline);
            }
            self.heap.pop();
        }
        None
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.live.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pop_due_in_deadline_order() {
        let mut tasks = DelayedTasks::new();
        tasks.schedule(Instant::from_millis(30), "c");
        tasks.schedule(Instant::from_millis(10), "a");
        tasks.schedule(Instant::from_millis(20), "b");

        assert!(tasks.pop_due(Instant::from_millis(5)).is_empty());
        assert_eq!(tasks.pop_due(Instant::from_millis(20)), ["a", "b"]);
        assert_eq!(tasks.next_deadline(), Some(Instant::from_millis(30)));
        assert_eq!(tasks.len(), 1);
    }

    #[test]
    fn test_same_deadline_keeps_insertion_order() {
        let mut tasks = DelayedTasks::new();
        for i in 0..5 {
            tasks.schedule(Instant::from_millis(10), i);
        }
        assert_eq!(tasks.pop_due(Instant::from_millis(10)), [0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_cancel_by_id() {
        let mut tasks = DelayedTasks::new();
        let keep = tasks.schedule(Instant::from_millis(10), 1);
        let drop = tasks.schedule(Instant::from_millis(5), 2);

        assert!(tasks.cancel(drop));
        assert!(!tasks.cancel(drop));
        assert!(tasks.is_pending(keep));
        assert_eq!(tasks.next_deadline(), Some(Instant::from_millis(10)));
        assert_eq!(tasks.pop_due(Instant::from_millis(100)), [1]);
        assert!(tasks.is_empty());
        assert!(!tasks.cancel(keep));
    }
}
