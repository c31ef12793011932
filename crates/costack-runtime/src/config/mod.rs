//! costack configuration
//!
//! Compile-time defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder calls
//! 2. Environment variables (runtime)
//! 3. File named by `COSTACK_CONFIG_RS` (compile time)
//! 4. Library defaults
//!
//! # Example
//!
//! ```rust,ignore
//! use costack_runtime::config::{LoopConfig, NetConfig};
//!
//! let loop_config = LoopConfig::from_env().poll_timeout(Duration::from_millis(1));
//! let net_config = NetConfig::from_env().connect_timeout(Duration::from_millis(500));
//! ```

pub mod defaults;

use costack_core::constants::{MAX_STACK_SIZE, MIN_STACK_SIZE};
use costack_core::env::{env_get, env_get_ms};
use costack_core::kinfo;
use std::time::Duration;

/// Event loop and coroutine settings
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// epoll wait while the loop has had recent work
    pub poll_timeout: Duration,
    /// epoll wait after `idle_turns` empty turns
    pub idle_timeout: Duration,
    /// Empty turns before switching to `idle_timeout`
    pub idle_turns: u32,
    /// Initial epoll event array size; doubles when a poll fills it
    pub initial_events: usize,
    /// Shared stack size, i.e. the largest logical stack of one coroutine
    pub stack_size: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl LoopConfig {
    /// Create config from compile-time defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `COSTACK_POLL_TIMEOUT_MS`
    /// - `COSTACK_IDLE_TIMEOUT_MS`
    /// - `COSTACK_IDLE_TURNS`
    /// - `COSTACK_EPOLL_EVENTS`
    /// - `COSTACK_STACK_SIZE`
    pub fn from_env() -> Self {
        let defaults = Self::new();
        Self {
            poll_timeout: env_get_ms("COSTACK_POLL_TIMEOUT_MS", defaults.poll_timeout),
            idle_timeout: env_get_ms("COSTACK_IDLE_TIMEOUT_MS", defaults.idle_timeout),
            idle_turns: env_get("COSTACK_IDLE_TURNS", defaults.idle_turns),
            initial_events: env_get("COSTACK_EPOLL_EVENTS", defaults.initial_events),
            stack_size: env_get("COSTACK_STACK_SIZE", defaults.stack_size),
        }
    }

    /// Create config with compile-time defaults only (no env override).
    pub fn new() -> Self {
        Self {
            poll_timeout: Duration::from_millis(defaults::POLL_TIMEOUT_MS),
            idle_timeout: Duration::from_millis(defaults::IDLE_TIMEOUT_MS),
            idle_turns: defaults::IDLE_TURNS,
            initial_events: defaults::INITIAL_EPOLL_EVENTS,
            stack_size: defaults::STACK_SIZE,
        }
    }

    // Builder methods

    pub fn poll_timeout(mut self, d: Duration) -> Self {
        self.poll_timeout = d;
        self
    }

    pub fn idle_timeout(mut self, d: Duration) -> Self {
        self.idle_timeout = d;
        self
    }

    pub fn idle_turns(mut self, n: u32) -> Self {
        self.idle_turns = n;
        self
    }

    pub fn initial_events(mut self, n: usize) -> Self {
        self.initial_events = n;
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    /// Validate configuration and return errors if invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_events == 0 {
            return Err(ConfigError::InvalidValue("initial_events must be > 0"));
        }
        if self.stack_size < MIN_STACK_SIZE {
            return Err(ConfigError::InvalidValue("stack_size must be >= 64KB"));
        }
        if self.stack_size > MAX_STACK_SIZE {
            return Err(ConfigError::InvalidValue("stack_size must be <= 64MB"));
        }
        if self.idle_timeout < self.poll_timeout {
            return Err(ConfigError::InvalidValue("idle_timeout must be >= poll_timeout"));
        }
        Ok(())
    }

    /// Log the configuration at info level
    pub fn print(&self) {
        kinfo!("event loop configuration:");
        kinfo!("  poll_timeout:    {:?}", self.poll_timeout);
        kinfo!("  idle_timeout:    {:?}", self.idle_timeout);
        kinfo!("  idle_turns:      {}", self.idle_turns);
        kinfo!("  initial_events:  {}", self.initial_events);
        kinfo!("  stack_size:      {}", self.stack_size);
    }
}

/// Connection and client settings
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// Initial capacity of each connection buffer
    pub buffer_size: usize,
    /// Hard limit a connection buffer may grow to
    pub max_buffer_size: usize,
    /// Give up on a non-blocking connect after this long
    pub connect_timeout: Duration,
    /// Delay before an auto-reconnecting client retries
    pub reconnect_interval: Duration,
    pub listen_backlog: i32,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl NetConfig {
    /// Create config from compile-time defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `COSTACK_BUFFER_SIZE`
    /// - `COSTACK_MAX_BUFFER_SIZE`
    /// - `COSTACK_CONNECT_TIMEOUT_MS`
    /// - `COSTACK_RECONNECT_INTERVAL_MS`
    /// - `COSTACK_LISTEN_BACKLOG`
    pub fn from_env() -> Self {
        let defaults = Self::new();
        Self {
            buffer_size: env_get("COSTACK_BUFFER_SIZE", defaults.buffer_size),
            max_buffer_size: env_get("COSTACK_MAX_BUFFER_SIZE", defaults.max_buffer_size),
            connect_timeout: env_get_ms("COSTACK_CONNECT_TIMEOUT_MS", defaults.connect_timeout),
            reconnect_interval: env_get_ms(
                "COSTACK_RECONNECT_INTERVAL_MS",
                defaults.reconnect_interval,
            ),
            listen_backlog: env_get("COSTACK_LISTEN_BACKLOG", defaults.listen_backlog),
        }
    }

    /// Create config with compile-time defaults only (no env override).
    pub fn new() -> Self {
        Self {
            buffer_size: defaults::BUFFER_SIZE,
            max_buffer_size: defaults::MAX_BUFFER_SIZE,
            connect_timeout: Duration::from_millis(defaults::CONNECT_TIMEOUT_MS),
            reconnect_interval: Duration::from_millis(defaults::RECONNECT_INTERVAL_MS),
            listen_backlog: defaults::LISTEN_BACKLOG,
        }
    }

    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    pub fn max_buffer_size(mut self, size: usize) -> Self {
        self.max_buffer_size = size;
        self
    }

    pub fn connect_timeout(mut self, d: Duration) -> Self {
        self.connect_timeout = d;
        self
    }

    pub fn reconnect_interval(mut self, d: Duration) -> Self {
        self.reconnect_interval = d;
        self
    }

    pub fn listen_backlog(mut self, n: i32) -> Self {
        self.listen_backlog = n;
        self
    }

    /// Validate configuration and return errors if invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size == 0 {
            return Err(ConfigError::InvalidValue("buffer_size must be > 0"));
        }
        if self.max_buffer_size < self.buffer_size {
            return Err(ConfigError::InvalidValue("max_buffer_size must be >= buffer_size"));
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::InvalidValue("connect_timeout must be > 0"));
        }
        if self.listen_backlog <= 0 {
            return Err(ConfigError::InvalidValue("listen_backlog must be > 0"));
        }
        Ok(())
    }
}

/// Configuration error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidValue(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(LoopConfig::new().validate().is_ok());
        assert!(NetConfig::new().validate().is_ok());
        assert_eq!(LoopConfig::new().stack_size, 1024 * 1024);
        assert_eq!(NetConfig::new().buffer_size, 64 * 1024);
        assert_eq!(NetConfig::new().connect_timeout, Duration::from_millis(5000));
    }

    #[test]
    fn test_builder() {
        let config = LoopConfig::new()
            .poll_timeout(Duration::from_millis(1))
            .stack_size(256 * 1024);
        assert_eq!(config.poll_timeout, Duration::from_millis(1));
        assert_eq!(config.stack_size, 256 * 1024);

        let net = NetConfig::new().max_buffer_size(128 * 1024);
        assert_eq!(net.max_buffer_size, 128 * 1024);
    }

    #[test]
    fn test_validation() {
        assert!(LoopConfig::new().stack_size(4096).validate().is_err());
        assert!(LoopConfig::new().initial_events(0).validate().is_err());
        let err = NetConfig::new()
            .buffer_size(1024)
            .max_buffer_size(512)
            .validate()
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid config: max_buffer_size must be >= buffer_size"
        );
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("COSTACK_CONNECT_TIMEOUT_MS", "123");
        let config = NetConfig::from_env();
        std::env::remove_var("COSTACK_CONNECT_TIMEOUT_MS");
        assert_eq!(config.connect_timeout, Duration::from_millis(123));
    }
}
