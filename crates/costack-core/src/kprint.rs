//! Leveled stderr logging
//!
//! One line per call, prefixed with the level and, when a coroutine is on
//! the shared stack, `[co#<id>]`. The tag is set by the runtime's switch
//! code, so log lines from inside a coroutine body need no extra context.
//!
//! # Environment Variables
//!
//! - `COSTACK_LOG_LEVEL=<level>` - off/error/warn/info/debug/trace or 0-5 (default info)
//! - `COSTACK_FLUSH_EPRINT=1` - Flush stderr after every line
//!
//! # Usage
//!
//! ```ignore
//! use costack_core::{kdebug, kinfo, kerror};
//!
//! costack_core::kprint::init();
//! kinfo!("listening on {}", addr);
//! kdebug!("fd={} readable", fd);
//! kerror!("epoll_ctl failed: {}", err);
//! costack_core::kprint::shutdown();
//! ```

use std::cell::Cell;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use crate::env::env_get_bool;

/// Log levels, most severe first
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Off,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    /// Parse a level name or digit, `None` for anything else
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "off" | "0" => Some(LogLevel::Off),
            "error" | "1" => Some(LogLevel::Error),
            "warn" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    fn prefix(&self) -> &'static str {
        match self {
            LogLevel::Off => "",
            LogLevel::Error => "[ERROR]",
            LogLevel::Warn => "[WARN] ",
            LogLevel::Info => "[INFO] ",
            LogLevel::Debug => "[DEBUG]",
            LogLevel::Trace => "[TRACE]",
        }
    }
}

static FLUSH_ENABLED: AtomicBool = AtomicBool::new(false);
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

thread_local! {
    /// Raw id of the coroutine running on this thread, 0 when none
    static COROUTINE_TAG: Cell<u64> = const { Cell::new(0) };
}

/// Initialize logging from environment variables
///
/// Call once at program start. Logging before `init()` still works and
/// falls back to lazy initialization.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    FLUSH_ENABLED.store(env_get_bool("COSTACK_FLUSH_EPRINT", false), Ordering::Relaxed);

    let level = std::env::var("COSTACK_LOG_LEVEL")
        .ok()
        .and_then(|v| LogLevel::parse(v.trim()))
        .unwrap_or(LogLevel::Info);
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Flush pending stderr output
pub fn shutdown() {
    let _ = std::io::stderr().lock().flush();
}

#[inline]
fn flush_enabled() -> bool {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    FLUSH_ENABLED.load(Ordering::Relaxed)
}

/// Get current log level
#[inline]
pub fn log_level() -> LogLevel {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Override `COSTACK_LOG_LEVEL`
pub fn set_log_level(level: LogLevel) {
    init();
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Record the coroutine now running on this thread (0 = none)
///
/// Called by the coroutine switch code; shows up in every leveled line.
#[inline]
pub fn set_coroutine_tag(raw_id: u64) {
    COROUTINE_TAG.with(|t| t.set(raw_id));
}

#[inline]
pub fn coroutine_tag() -> u64 {
    COROUTINE_TAG.with(|t| t.get())
}

#[doc(hidden)]
pub fn _klog_impl(level: LogLevel, args: std::fmt::Arguments<'_>) {
    if level > log_level() {
        return;
    }
    let stderr = std::io::stderr();
    let mut handle = stderr.lock();
    let tag = coroutine_tag();
    if tag == 0 {
        let _ = write!(handle, "{} ", level.prefix());
    } else {
        let _ = write!(handle, "{} [co#{}] ", level.prefix(), tag);
    }
    let _ = handle.write_fmt(args);
    let _ = handle.write_all(b"\n");
    if flush_enabled() {
        let _ = handle.flush();
    }
}

#[doc(hidden)]
#[macro_export]
macro_rules! __klog {
    ($level:ident, $($arg:tt)*) => {{
        $crate::kprint::_klog_impl($crate::kprint::LogLevel::$level, format_args!($($arg)*));
    }};
}

/// Log at error level (shown unless logging is off)
#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => { $crate::__klog!(Error, $($arg)*) };
}

#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => { $crate::__klog!(Warn, $($arg)*) };
}

#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => { $crate::__klog!(Info, $($arg)*) };
}

#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => { $crate::__klog!(Debug, $($arg)*) };
}

/// Log at trace level: per-event reactor and switch detail
#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => { $crate::__klog!(Trace, $($arg)*) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_levels() {
        assert!(LogLevel::Error < LogLevel::Warn);
        assert!(LogLevel::Warn < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Debug);
        assert!(LogLevel::Debug < LogLevel::Trace);
    }

    #[test]
    fn test_level_parse() {
        assert_eq!(LogLevel::parse("DEBUG"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse("0"), Some(LogLevel::Off));
        assert_eq!(LogLevel::parse("loud"), None);
        assert_eq!(LogLevel::from_u8(LogLevel::Warn as u8), LogLevel::Warn);
    }

    #[test]
    fn test_coroutine_tag_is_thread_local() {
        set_coroutine_tag(9);
        assert_eq!(coroutine_tag(), 9);
        let other = std::thread::spawn(coroutine_tag).join().unwrap();
        assert_eq!(other, 0);
        set_coroutine_tag(0);
    }

    #[test]
    fn test_macros_compile() {
        set_log_level(LogLevel::Off);
        assert_eq!(log_level(), LogLevel::Off);

        kerror!("error {}", "msg");
        kwarn!("warn");
        kinfo!("info");
        kdebug!("debug");
        ktrace!("trace");
        shutdown();
    }
}
