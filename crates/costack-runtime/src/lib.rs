//! # costack-runtime
//!
//! Platform-specific half of costack: the coroutine primitive and the
//! reactor that drives it.
//!
//! ```text
//!  ┌──────────────────────────────────────────────────────────┐
//!  │ coroutine body (runs on the shared stack)                │
//!  │   yield_now() / yield_with_timeout()                     │
//!  └───────────────┬──────────────────────────▲───────────────┘
//!                  │ switch_context           │ resume()
//!  ┌───────────────▼──────────────────────────┴───────────────┐
//!  │ EventLoop (thread stack)                                 │
//!  │   Poller (epoll) ─► EventHandle callbacks                │
//!  │   deferred queue ─► queued work, deferred destruction    │
//!  │   TimerBackend   ─► run_after / run_every / run_at       │
//!  └──────────────────────────────────────────────────────────┘
//! ```
//!
//! This crate provides:
//! - Context switching (architecture-specific assembly)
//! - The per-thread shared stack (mmap + guard page)
//! - `Coroutine` with stack save/restore
//! - epoll poller, event handles, timers, signal trapping
//! - Loop and network configuration

pub mod arch;
pub mod config;
pub mod coroutine;
pub mod event_handle;
pub mod event_loop;
pub mod poller;
pub mod signal;
pub mod stack;
pub mod timer;
pub mod tls;

// Re-exports
pub use config::{ConfigError, LoopConfig, NetConfig};
pub use coroutine::{yield_now, yield_with_timeout, Coroutine};
pub use event_handle::EventHandle;
pub use event_loop::{EventLoop, LoopStatus};
pub use poller::{Interest, Readiness};
pub use timer::{HeapTimerStats, TimerId};

#[cfg(not(target_os = "linux"))]
compile_error!("costack-runtime needs epoll and runs on Linux only");
