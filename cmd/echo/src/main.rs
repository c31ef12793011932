//! Echo server
//!
//! One thread, one event loop: every byte read is written straight back.
//!
//! Usage:
//!     cargo build --release -p costack-echo
//!     ./target/release/echo [port]
//!
//! Test with:
//!     echo "hello" | nc -q1 localhost 9999
//!
//! # Environment Variables
//!
//! - `COSTACK_LOG_LEVEL=debug` - Log level (off, error, warn, info, debug, trace)
//! - `COSTACK_FLUSH_EPRINT=1` - Flush every log line
//! - `COSTACK_BUFFER_SIZE`, `COSTACK_MAX_BUFFER_SIZE` - Per-connection buffers
//! - `COSTACK_LISTEN_BACKLOG` - listen(2) backlog
//! - `COSTACK_STATS_MS=5000` - Interval of the connection count line, 0 = off

use costack::{env_get, kerror, kinfo, EventLoop, LoopConfig, NetConfig, TcpServer};
use nix::sys::signal::Signal;
use std::cell::Cell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

const DEFAULT_PORT: u16 = 9999;

fn main() {
    costack::init_logging();
    if let Err(e) = run() {
        kerror!("echo: {}", e);
        costack::shutdown_logging();
        std::process::exit(1);
    }
    costack::shutdown_logging();
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let port = match std::env::args().nth(1) {
        Some(arg) => arg.parse::<u16>()?,
        None => DEFAULT_PORT,
    };

    let loop_config = LoopConfig::from_env();
    loop_config.validate()?;
    loop_config.print();
    let net_config = NetConfig::from_env();
    net_config.validate()?;

    let event_loop = EventLoop::with_config(loop_config)?;
    let server = TcpServer::new(&event_loop, net_config);

    let echoed = Rc::new(Cell::new(0u64));
    let bytes = echoed.clone();
    server.set_on_read(move |conn| {
        let data = conn.read_all();
        bytes.set(bytes.get() + data.len() as u64);
        if !conn.write(&data) {
            conn.close();
        }
    });
    server.set_on_new_connection(|conn| kinfo!("{} from {}", conn.id(), conn.peer_addr()));

    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let local = server.listen(addr)?;
    kinfo!("echo server on {}", local);

    let stats_ms: u64 = env_get("COSTACK_STATS_MS", 5000);
    if stats_ms > 0 {
        let weak = Rc::downgrade(&server);
        let bytes = echoed.clone();
        event_loop.run_every(Duration::from_millis(stats_ms), move || {
            if let Some(server) = weak.upgrade() {
                kinfo!("{} connections, {} bytes echoed", server.connection_count(), bytes.get());
            }
        });
    }

    for sig in [Signal::SIGINT, Signal::SIGTERM] {
        let el = Rc::downgrade(&event_loop);
        event_loop.trap_signal(sig, move || {
            if let Some(el) = el.upgrade() {
                el.quit();
            }
        })?;
    }

    event_loop.run()?;
    kinfo!("shutting down, {} bytes echoed", echoed.get());
    Ok(())
}
