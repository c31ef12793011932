//! # costack-core
//!
//! Platform-agnostic building blocks shared by the costack crates.
//!
//! Nothing in here touches the OS beyond reading environment variables and
//! writing log lines to stderr. The coroutine switch, the reactor and the
//! socket layer live in `costack-runtime` and `costack-net`.
//!
//! ## Modules
//!
//! - `id` - Coroutine and connection identifiers
//! - `state` - Coroutine state and connection status enums
//! - `error` - Error types
//! - `kprint` - Kernel-style leveled logging macros
//! - `env` - Environment variable utilities

pub mod id;
pub mod state;
pub mod error;
pub mod kprint;
pub mod env;

// Re-exports for convenience
pub use id::{CoroutineId, ConnectionId};
pub use state::{CoroutineState, ConnStatus};
pub use error::{CoError, CoResult, StackError};
pub use env::{env_get, env_get_bool, env_get_ms, env_get_opt};

/// Fixed layout constants
///
/// Tunable defaults (stack size, buffer sizes, timeouts) are generated by
/// `costack-runtime`'s build script, see `costack_runtime::config`.
pub mod constants {
    /// Guard page size (4 KB)
    pub const GUARD_SIZE: usize = 4096;

    /// Smallest shared stack the runtime accepts (64 KB)
    pub const MIN_STACK_SIZE: usize = 64 * 1024;

    /// Largest shared stack the runtime accepts (64 MB)
    pub const MAX_STACK_SIZE: usize = 64 * 1024 * 1024;

    /// Scratch space used by `readv` when the read buffer is short (64 KB)
    pub const READ_SPILL_SIZE: usize = 64 * 1024;
}
