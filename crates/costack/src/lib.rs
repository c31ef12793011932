//! # costack - coroutine-driven network I/O
//!
//! Write `connect`/`write`/`read_full`/`close` top to bottom; every call
//! that would block parks the calling coroutine and hands the thread back to
//! the event loop, which resumes it when the socket is ready or a timeout
//! fires.
//!
//! ## Features
//!
//! - **Shared stack**: every coroutine runs on one per-thread stack; a
//!   suspended coroutine keeps only the bytes it actually used
//! - **Reactor**: epoll, per-descriptor event handles, timers, a deferred
//!   queue and signal trapping on a single thread
//! - **Two TCP layers**: callback-driven `TcpConnection`/`TcpClient`/`TcpServer`
//!   and the blocking-style `AsyncTcpConnection`/`AsyncTcpClient` on top
//!
//! ## Quick Start
//!
//! ```ignore
//! use costack::{AsyncTcpClient, EventLoop, NetConfig};
//! use std::time::Duration;
//!
//! let event_loop = EventLoop::new()?;
//! let client = AsyncTcpClient::new(&event_loop, NetConfig::from_env());
//! client.run_in_coroutine(|client, co| {
//!     let Some(conn) = client.connect_to("127.0.0.1:9999".parse().unwrap(), co) else {
//!         return;
//!     };
//!     let mut reply = [0u8; 4];
//!     if conn.write(b"PING").is_ok() {
//!         let _ = conn.read_full(&mut reply, Some(Duration::from_secs(1)));
//!     }
//!     conn.close();
//!     client.event_loop().quit();
//! });
//! event_loop.run()?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Coroutine (application code)                │
//! │         connect_to(), write(), read_full(), close()         │
//! └─────────────────────────────────────────────────────────────┘
//!                   │ park                ▲ resume
//!                   ▼                     │
//! ┌─────────────────────────────────────────────────────────────┐
//! │          AsyncTcpClient  /  AsyncTcpConnection              │
//! │      pending connects, established table, status gate       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//!    ┌───────────┐      ┌─────────────┐     ┌───────────┐
//!    │ TcpClient │      │TcpConnection│     │ TcpServer │
//!    │ Connector │      │   buffers   │     │ Acceptor  │
//!    └───────────┘      └─────────────┘     └───────────┘
//!          │                   │                   │
//!          └───────────────────┼───────────────────┘
//!                              ▼
//!    ┌─────────────────────────────────────────────────────────┐
//!    │                       EventLoop                         │
//!    │     epoll, event handles, timers, deferred queue        │
//!    └─────────────────────────────────────────────────────────┘
//! ```

// Re-export core types
pub use costack_core::{
    ConnStatus,
    ConnectionId,
    CoError,
    CoResult,
    CoroutineId,
    CoroutineState,
    StackError,
};

// Re-export kprint macros for logging
pub use costack_core::{kerror, kwarn, kinfo, kdebug, ktrace};
pub use costack_core::kprint::{LogLevel, init as init_logging, shutdown as shutdown_logging, set_log_level};

// Re-export env utilities
pub use costack_core::{env_get, env_get_bool, env_get_ms, env_get_opt};

// Re-export runtime types
pub use costack_runtime::{
    ConfigError,
    Coroutine,
    EventHandle,
    EventLoop,
    Interest,
    LoopConfig,
    LoopStatus,
    NetConfig,
    Readiness,
    TimerId,
    yield_now,
    yield_with_timeout,
};
pub use costack_runtime::coroutine::{current, current_id, in_coroutine};

// Re-export networking
pub use costack_net::{
    AsyncTcpClient,
    AsyncTcpConnection,
    ConnState,
    ConnectionBuffer,
    TcpAcceptor,
    TcpClient,
    TcpConnection,
    TcpConnector,
    TcpServer,
};
