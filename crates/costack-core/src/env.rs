//! Environment variable utilities
//!
//! Every runtime knob in costack is a `COSTACK_*` variable read through these
//! helpers, falling back to the compiled-in default when the variable is
//! unset or does not parse.
//!
//! ```ignore
//! use costack_core::env::{env_get, env_get_bool, env_get_ms};
//!
//! let backlog: i32 = env_get("COSTACK_LISTEN_BACKLOG", 1024);
//! let connect = env_get_ms("COSTACK_CONNECT_TIMEOUT_MS", Duration::from_secs(5));
//! let flush = env_get_bool("COSTACK_FLUSH_EPRINT", false);
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Get environment variable parsed as type T, or return default
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Get environment variable as boolean
///
/// "1", "true", "yes", "on" (case-insensitive) are true; any other value is
/// false. Unset returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// `Some(T)` if the variable is set and parses, `None` otherwise
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Get a millisecond count as a `Duration`
#[inline]
pub fn env_get_ms(key: &str, default: Duration) -> Duration {
    env_get_opt::<u64>(key)
        .map(Duration::from_millis)
        .unwrap_or(default)
}
