//! Timer entry and id types

use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Cancellable identity of a scheduled timer
///
/// Ids grow monotonically, so among timers with the same deadline a lower
/// id was registered first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(u64);

impl TimerId {
    /// Generate a new unique timer id
    #[inline]
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        TimerId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

/// What happens to a timer after it fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Fires once, then is gone
    Once,

    /// Re-armed `interval` after each firing until removed
    Periodic { interval: Duration },
}

impl TimerKind {
    #[inline]
    pub fn is_periodic(&self) -> bool {
        matches!(self, TimerKind::Periodic { .. })
    }
}

/// Timer callback, shared so periodic timers can re-arm it
pub type TimerCallback = Rc<dyn Fn()>;

/// Timer entry - stored in the timer backend
#[derive(Clone)]
pub struct TimerEntry {
    pub id: TimerId,
    pub deadline: Instant,
    pub kind: TimerKind,
    pub callback: TimerCallback,
}

impl TimerEntry {
    /// One-shot timer at an absolute deadline
    pub fn at(deadline: Instant, callback: TimerCallback) -> Self {
        Self {
            id: TimerId::next(),
            deadline,
            kind: TimerKind::Once,
            callback,
        }
    }

    /// One-shot timer `delay` from now
    #[inline]
    pub fn after(delay: Duration, callback: TimerCallback) -> Self {
        Self::at(Instant::now() + delay, callback)
    }

    /// Periodic timer, first firing one `interval` from now
    pub fn every(interval: Duration, callback: TimerCallback) -> Self {
        Self {
            id: TimerId::next(),
            deadline: Instant::now() + interval,
            kind: TimerKind::Periodic { interval },
            callback,
        }
    }

    #[inline]
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    /// Next occurrence of a periodic timer, keeping its id
    ///
    /// Returns None for one-shot timers.
    pub fn reschedule(&self, now: Instant) -> Option<Self> {
        match self.kind {
            TimerKind::Periodic { interval } => Some(Self {
                id: self.id,
                deadline: now + interval,
                kind: self.kind,
                callback: self.callback.clone(),
            }),
            TimerKind::Once => None,
        }
    }
}

impl fmt::Debug for TimerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerEntry")
            .field("id", &self.id)
            .field("deadline", &self.deadline)
            .field("kind", &self.kind)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> TimerCallback {
        Rc::new(|| {})
    }

    #[test]
    fn test_id_uniqueness() {
        let ids: Vec<_> = (0..1000).map(|_| TimerId::next()).collect();
        let unique: std::collections::HashSet<_> = ids.iter().collect();
        assert_eq!(ids.len(), unique.len());
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_periodic_reschedule_keeps_id() {
        let entry = TimerEntry::every(Duration::from_millis(100), noop());
        let now = Instant::now();
        let next = entry.reschedule(now).expect("should reschedule");
        assert_eq!(next.id, entry.id);
        assert_eq!(next.deadline, now + Duration::from_millis(100));
    }

    #[test]
    fn test_once_no_reschedule() {
        let entry = TimerEntry::after(Duration::from_millis(100), noop());
        assert!(!entry.kind.is_periodic());
        assert!(entry.reschedule(Instant::now()).is_none());
        assert!(!entry.is_expired(Instant::now()));
        assert!(entry.is_expired(entry.deadline));
    }
}
