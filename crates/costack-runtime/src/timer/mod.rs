//! Timers for the event loop
//!
//! The loop owns one `HeapTimerBackend` and drives it through the
//! `TimerBackend` trait once per turn:
//!
//! ```text
//!   run_after / run_every / run_at ──insert──►  TimerBackend
//!   remove_timer ───────────────────cancel──►       │
//!                                                   │ poll_expired(now)
//!   EventLoop::run_once ◄───── Vec<ExpiredTimer> ◄──┘
//!        │
//!        └─ take_due(id)? ──► callback()
//! ```
//!
//! `take_due` is checked right before each callback so that a timer
//! cancelled by an earlier callback of the same batch never runs.

mod entry;
pub mod impls;

pub use entry::{TimerCallback, TimerEntry, TimerId, TimerKind};
pub use impls::{HeapTimerBackend, HeapTimerStats};

use std::time::Instant;

/// A due timer handed back to the loop
pub struct ExpiredTimer {
    pub id: TimerId,
    pub callback: TimerCallback,
}

/// Core timer trait
///
/// Backends are owned by one event loop and never shared across threads.
pub trait TimerBackend {
    /// Insert a timer entry, returns its id for cancellation
    fn insert(&self, entry: TimerEntry) -> TimerId;

    /// Cancel a timer; false if it already fired or never existed
    fn cancel(&self, id: TimerId) -> bool;

    /// Pop every timer due at `now`, earliest first, re-arming periodic ones
    fn poll_expired(&self, now: Instant) -> Vec<ExpiredTimer>;

    /// Claim a polled timer right before running it
    ///
    /// False if it was cancelled after `poll_expired` returned it.
    fn take_due(&self, id: TimerId) -> bool;

    /// Check if the timer is still scheduled
    fn is_active(&self, id: TimerId) -> bool;

    /// When is the next timer due? None if nothing is scheduled
    fn next_deadline(&self) -> Option<Instant>;

    /// Number of live timers
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Backend name for debugging
    fn name(&self) -> &'static str {
        "unknown"
    }
}
