//! Timer queue ordered by monotonic deadline.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};
use std::time::{Duration, Instant};

/// Identifies a scheduled timer, for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

struct Entry<T> {
    due: Instant,
    id: TimerId,
    timer: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.id == other.id
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Ids grow with scheduling order: FIFO among equal deadlines
        (self.due, self.id).cmp(&(other.due, other.id))
    }
}

/// Pending timers carrying a protocol-defined payload `T`.
pub struct Scheduler<T> {
    heap: BinaryHeap<Reverse<Entry<T>>>,
    cancelled: HashSet<TimerId>,
    next_id: u64,
}

impl<T> Scheduler<T> {
    pub fn new() -> Self {
        Scheduler {
            heap: BinaryHeap::new(),
            cancelled: HashSet::new(),
            next_id: 0,
        }
    }

    /// Fire `timer` after `delay`.
    pub fn schedule(&mut self, delay: Duration, timer: T) -> TimerId {
        self.schedule_at(Instant::now() + delay, timer)
    }

    /// Fire `timer` at `due`.
    pub fn schedule_at(&mut self, due: Instant, timer: T) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.heap.push(Reverse(Entry { due, id, timer }));
        id
    }

    /// Cancel a pending timer. Unknown or already fired ids are ignored.
    pub fn cancel(&mut self, id: TimerId) {
        if self.heap.iter().any(|Reverse(entry)| entry.id == id) {
            self.cancelled.insert(id);
        }
    }

    /// Remove and return the earliest timer due at `now`, if any.
    pub fn pop_due(&mut self, now: Instant) -> Option<T> {
        self.skip_cancelled();
        if !self.heap.peek().is_some_and(|Reverse(entry)| entry.due <= now) {
            return None;
        }
        self.heap.pop().map(|Reverse(entry)| entry.timer)
    }

    /// Time left until the earliest pending timer; zero when overdue.
    pub fn next_delay(&mut self, now: Instant) -> Option<Duration> {
        self.skip_cancelled();
        self.heap
            .peek()
            .map(|Reverse(entry)| entry.due.saturating_duration_since(now))
    }

    /// Number of pending timers.
    pub fn len(&self) -> usize {
        self.heap.len() - self.cancelled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn skip_cancelled(&mut self) {
        while let Some(Reverse(entry)) = self.heap.peek() {
            if !self.cancelled.remove(&entry.id) {
                break;
            }
            self.heap.pop();
        }
    }
}

impl<T> Default for Scheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}
