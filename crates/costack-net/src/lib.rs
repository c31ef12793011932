//! # costack-net
//!
//! TCP on top of the costack event loop, in two layers.
//!
//! ```text
//!  coroutine code                 AsyncTcpClient::run_in_coroutine
//!    conn.write() / conn.read_full() / conn.close()
//!            │ park (status)            ▲ resume
//!  ┌─────────▼──────────────────────────┴─────────────────────┐
//!  │ AsyncTcpConnection / AsyncTcpClient                      │
//!  ├──────────────────────────────────────────────────────────┤
//!  │ TcpClient ─ TcpConnector      TcpServer ─ TcpAcceptor    │
//!  │          └──── TcpConnection (buffers, callbacks) ───┘   │
//!  ├──────────────────────────────────────────────────────────┤
//!  │ EventLoop: EventHandle, timers, deferred queue           │
//!  └──────────────────────────────────────────────────────────┘
//! ```
//!
//! The lower layer is callback driven and never blocks. Its callbacks never
//! run from inside the call that caused them: close notifications go
//! through the deferred queue, reads and write completions come from the
//! poller. The upper layer turns those callbacks into coroutine resumes so
//! that application code reads top to bottom.

pub mod acceptor;
pub mod async_client;
pub mod async_conn;
pub mod buffer;
pub mod client;
pub mod connection;
pub mod connector;
pub mod server;
mod socket_ops;

// Re-exports
pub use acceptor::TcpAcceptor;
pub use async_client::AsyncTcpClient;
pub use async_conn::AsyncTcpConnection;
pub use buffer::ConnectionBuffer;
pub use client::TcpClient;
pub use connection::{ConnState, ConnectionCallback, TcpConnection};
pub use connector::TcpConnector;
pub use server::TcpServer;

#[cfg(not(target_os = "linux"))]
compile_error!("costack-net needs epoll and runs on Linux only");
