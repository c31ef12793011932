//! Coroutine and connection identifiers
//!
//! Both ids are allocated from process-wide monotonic counters, so an id is
//! never reused while the process lives. Tables in the orchestrator are keyed
//! by these ids instead of holding pointers to the objects themselves.

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_COROUTINE_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a coroutine
///
/// `u64::MAX` is reserved as a sentinel for "no coroutine".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct CoroutineId(u64);

impl CoroutineId {
    /// Sentinel value indicating no coroutine
    pub const NONE: CoroutineId = CoroutineId(u64::MAX);

    /// Allocate the next id
    #[inline]
    pub fn next() -> Self {
        CoroutineId(NEXT_COROUTINE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Create a CoroutineId from a raw value
    #[inline]
    pub const fn new(id: u64) -> Self {
        CoroutineId(id)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == u64::MAX
    }

    #[inline]
    pub const fn is_some(self) -> bool {
        self.0 != u64::MAX
    }
}

impl fmt::Debug for CoroutineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "CoroutineId(NONE)")
        } else {
            write!(f, "CoroutineId({})", self.0)
        }
    }
}

impl fmt::Display for CoroutineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "none")
        } else {
            write!(f, "co#{}", self.0)
        }
    }
}

impl Default for CoroutineId {
    fn default() -> Self {
        CoroutineId::NONE
    }
}

/// Identity of one connected socket wrapper
///
/// File descriptor numbers are recycled by the kernel as soon as a socket is
/// closed, so they cannot key the established-connection table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate the next id
    #[inline]
    pub fn next() -> Self {
        ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for ConnectionId {
    #[inline]
    fn from(id: u64) -> Self {
        ConnectionId(id)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}
