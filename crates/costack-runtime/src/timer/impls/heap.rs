//! BinaryHeap-based timer backend
//!
//! # Complexity
//!
//! - Insert: O(log n)
//! - Cancel: O(1) (lazy cancellation)
//! - Poll expired: O(k log n) where k = number of expired timers
//! - Next deadline: O(1) amortized
//!
//! # Cancellation Strategy
//!
//! Live timers are tracked in `active`. Cancelling only removes the id from
//! that map; the heap entry stays put and is dropped when it reaches the top.

use std::cell::RefCell;
use std::collections::{BinaryHeap, HashMap};
use std::time::Instant;

use crate::timer::{ExpiredTimer, TimerBackend, TimerEntry, TimerId};

/// Wrapper for heap ordering (min-heap by deadline)
struct HeapEntry(TimerEntry);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.deadline == other.0.deadline && self.0.id == other.0.id
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed for a min-heap; equal deadlines fire in registration order
        match other.0.deadline.cmp(&self.0.deadline) {
            std::cmp::Ordering::Equal => other.0.id.cmp(&self.0.id),
            ord => ord,
        }
    }
}

struct HeapInner {
    heap: BinaryHeap<HeapEntry>,

    /// Live timers, value is "periodic"
    active: HashMap<TimerId, bool>,

    total_inserted: u64,
    total_fired: u64,
    total_cancelled: u64,
}

impl HeapInner {
    fn new(capacity: usize) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(capacity),
            active: HashMap::with_capacity(capacity),
            total_inserted: 0,
            total_fired: 0,
            total_cancelled: 0,
        }
    }

    /// Drop cancelled entries sitting at the top of the heap
    fn prune(&mut self) {
        while let Some(top) = self.heap.peek() {
            if self.active.contains_key(&top.0.id) {
                break;
            }
            self.heap.pop();
        }
    }
}

/// BinaryHeap-based timer backend
///
/// Owned by a single event loop, so interior mutability is a `RefCell`.
/// No callback ever runs while the cell is borrowed.
pub struct HeapTimerBackend {
    inner: RefCell<HeapInner>,
}

impl HeapTimerBackend {
    pub fn new() -> Self {
        Self::with_capacity(64)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: RefCell::new(HeapInner::new(capacity)),
        }
    }

    /// Get statistics snapshot
    pub fn stats(&self) -> HeapTimerStats {
        let inner = self.inner.borrow();
        HeapTimerStats {
            active: inner.active.len(),
            pending_cancellations: inner.heap.len().saturating_sub(inner.active.len()),
            total_inserted: inner.total_inserted,
            total_fired: inner.total_fired,
            total_cancelled: inner.total_cancelled,
        }
    }
}

impl Default for HeapTimerBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerBackend for HeapTimerBackend {
    fn insert(&self, entry: TimerEntry) -> TimerId {
        let id = entry.id;
        let mut inner = self.inner.borrow_mut();
        inner.active.insert(id, entry.kind.is_periodic());
        inner.heap.push(HeapEntry(entry));
        inner.total_inserted += 1;
        id
    }

    fn cancel(&self, id: TimerId) -> bool {
        let mut inner = self.inner.borrow_mut();
        let removed = inner.active.remove(&id).is_some();
        if removed {
            inner.total_cancelled += 1;
        }
        if inner.active.is_empty() {
            inner.heap.clear();
        }
        removed
    }

    fn poll_expired(&self, now: Instant) -> Vec<ExpiredTimer> {
        let mut inner = self.inner.borrow_mut();
        let mut expired = Vec::new();
        let mut to_reschedule = Vec::new();

        while let Some(top) = inner.heap.peek() {
            if top.0.deadline > now {
                break;
            }
            let Some(HeapEntry(entry)) = inner.heap.pop() else {
                break;
            };
            if !inner.active.contains_key(&entry.id) {
                continue;
            }
            if let Some(next) = entry.reschedule(now) {
                to_reschedule.push(next);
            }
            expired.push(ExpiredTimer {
                id: entry.id,
                callback: entry.callback,
            });
        }

        for entry in to_reschedule {
            inner.heap.push(HeapEntry(entry));
        }
        expired
    }

    fn take_due(&self, id: TimerId) -> bool {
        let mut inner = self.inner.borrow_mut();
        match inner.active.get(&id).copied() {
            Some(periodic) => {
                if !periodic {
                    inner.active.remove(&id);
                }
                inner.total_fired += 1;
                true
            }
            None => false,
        }
    }

    fn is_active(&self, id: TimerId) -> bool {
        self.inner.borrow().active.contains_key(&id)
    }

    fn next_deadline(&self) -> Option<Instant> {
        let mut inner = self.inner.borrow_mut();
        inner.prune();
        inner.heap.peek().map(|e| e.0.deadline)
    }

    fn len(&self) -> usize {
        self.inner.borrow().active.len()
    }

    fn name(&self) -> &'static str {
        "binary_heap"
    }
}

/// Statistics for HeapTimerBackend
#[derive(Debug, Clone)]
pub struct HeapTimerStats {
    /// Currently active (non-cancelled) timers
    pub active: usize,
    /// Cancelled but not yet removed from heap
    pub pending_cancellations: usize,
    /// Total timers inserted (lifetime)
    pub total_inserted: u64,
    /// Total timers that fired (lifetime)
    pub total_fired: u64,
    /// Total timers cancelled (lifetime)
    pub total_cancelled: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;
    use std::time::Duration;

    fn noop() -> crate::timer::TimerCallback {
        Rc::new(|| {})
    }

    fn fire_all(backend: &HeapTimerBackend, now: Instant) -> Vec<TimerId> {
        let mut fired = Vec::new();
        for t in backend.poll_expired(now) {
            if backend.take_due(t.id) {
                (t.callback)();
                fired.push(t.id);
            }
        }
        fired
    }

    #[test]
    fn test_insert_and_poll() {
        let backend = HeapTimerBackend::new();
        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        let id = backend.insert(TimerEntry::after(Duration::ZERO, Rc::new(move || h.set(h.get() + 1))));
        assert_eq!(backend.len(), 1);

        let fired = fire_all(&backend, Instant::now() + Duration::from_millis(1));
        assert_eq!(fired, vec![id]);
        assert_eq!(hits.get(), 1);
        assert!(!backend.is_active(id));
        assert!(backend.is_empty());
    }

    #[test]
    fn test_ordering_with_ties() {
        let backend = HeapTimerBackend::new();
        let now = Instant::now();

        let c = backend.insert(TimerEntry::at(now + Duration::from_millis(30), noop()));
        let a1 = backend.insert(TimerEntry::at(now + Duration::from_millis(10), noop()));
        let b = backend.insert(TimerEntry::at(now + Duration::from_millis(20), noop()));
        let a2 = backend.insert(TimerEntry::at(now + Duration::from_millis(10), noop()));

        let fired = fire_all(&backend, now + Duration::from_millis(50));
        assert_eq!(fired, vec![a1, a2, b, c]);
    }

    #[test]
    fn test_cancel() {
        let backend = HeapTimerBackend::new();
        let id = backend.insert(TimerEntry::after(Duration::from_secs(1), noop()));

        assert!(backend.cancel(id));
        assert_eq!(backend.len(), 0);
        assert!(fire_all(&backend, Instant::now() + Duration::from_secs(2)).is_empty());
    }

    #[test]
    fn test_cancel_after_fire_is_noop() {
        let backend = HeapTimerBackend::new();
        let id = backend.insert(TimerEntry::after(Duration::ZERO, noop()));
        fire_all(&backend, Instant::now() + Duration::from_millis(1));

        assert!(!backend.cancel(id));
        assert!(!backend.cancel(id));
        assert_eq!(backend.stats().total_cancelled, 0);
    }

    #[test]
    fn test_cancel_between_poll_and_fire() {
        let backend = HeapTimerBackend::new();
        let now = Instant::now();
        let first = backend.insert(TimerEntry::at(now, noop()));
        let second = backend.insert(TimerEntry::at(now, noop()));

        let due = backend.poll_expired(now);
        assert_eq!(due.len(), 2);
        assert!(backend.take_due(first));
        // The first callback cancels its sibling before it runs.
        assert!(backend.cancel(second));
        assert!(!backend.take_due(second));
    }

    #[test]
    fn test_periodic_reschedule() {
        let backend = HeapTimerBackend::new();
        let id = backend.insert(TimerEntry::every(Duration::from_millis(10), noop()));

        let now = Instant::now() + Duration::from_millis(15);
        assert_eq!(fire_all(&backend, now), vec![id]);
        assert_eq!(backend.len(), 1);
        assert!(backend.is_active(id));

        assert_eq!(fire_all(&backend, now + Duration::from_millis(15)), vec![id]);
        assert_eq!(backend.len(), 1);

        assert!(backend.cancel(id));
        assert!(fire_all(&backend, now + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn test_next_deadline_skips_cancelled() {
        let backend = HeapTimerBackend::new();
        let now = Instant::now();
        assert!(backend.next_deadline().is_none());

        let early = backend.insert(TimerEntry::at(now + Duration::from_millis(5), noop()));
        backend.insert(TimerEntry::at(now + Duration::from_millis(100), noop()));
        backend.cancel(early);

        assert_eq!(backend.next_deadline(), Some(now + Duration::from_millis(100)));
    }

    #[test]
    fn test_stats() {
        let backend = HeapTimerBackend::new();
        backend.insert(TimerEntry::after(Duration::ZERO, noop()));
        let later = backend.insert(TimerEntry::after(Duration::from_secs(10), noop()));

        fire_all(&backend, Instant::now() + Duration::from_millis(1));
        backend.cancel(later);

        let stats = backend.stats();
        assert_eq!(stats.total_inserted, 2);
        assert_eq!(stats.total_fired, 1);
        assert_eq!(stats.total_cancelled, 1);
        assert_eq!(stats.pending_cancellations, 0);
    }
}
