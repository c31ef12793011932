//! Async client example
//!
//! Starts `COSTACK_CLIENTS` coroutines; each connects, sends the message,
//! reads the echo back with `read_full` and closes. Pair it with `echo`.
//!
//! Usage:
//!     ./target/release/async-client [addr] [message]
//!     ./target/release/async-client 127.0.0.1:9999 "hello costack"
//!
//! # Environment Variables
//!
//! - `COSTACK_LOG_LEVEL=debug` - Log level (off, error, warn, info, debug, trace)
//! - `COSTACK_CLIENTS=1` - Number of concurrent coroutines
//! - `COSTACK_READ_TIMEOUT_MS=3000` - Bound on each `read_full`
//! - `COSTACK_CONNECT_TIMEOUT_MS` - Connect timeout

use costack::{
    env_get, env_get_ms, kerror, kinfo, kwarn, AsyncTcpClient, Coroutine, EventLoop, LoopConfig,
    NetConfig,
};
use std::cell::Cell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

fn main() {
    costack::init_logging();
    let code = match run() {
        Ok(failed) if failed == 0 => 0,
        Ok(failed) => {
            kwarn!("{} clients failed", failed);
            2
        }
        Err(e) => {
            kerror!("async-client: {}", e);
            1
        }
    };
    costack::shutdown_logging();
    std::process::exit(code);
}

/// Returns how many clients did not get their echo back
fn run() -> Result<usize, Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let addr: SocketAddr = args.next().as_deref().unwrap_or("127.0.0.1:9999").parse()?;
    let message = Rc::new(args.next().unwrap_or_else(|| "hello costack".to_string()).into_bytes());

    let clients: usize = env_get("COSTACK_CLIENTS", 1);
    let read_timeout = env_get_ms("COSTACK_READ_TIMEOUT_MS", Duration::from_secs(3));

    let loop_config = LoopConfig::from_env();
    loop_config.validate()?;
    let net_config = NetConfig::from_env();
    net_config.validate()?;

    let event_loop = EventLoop::with_config(loop_config)?;
    let client = AsyncTcpClient::new(&event_loop, net_config);

    let finished = Rc::new(Cell::new(0usize));
    let failed = Rc::new(Cell::new(0usize));
    let started = Instant::now();

    for n in 0..clients {
        let message = message.clone();
        let finished = finished.clone();
        let failed = failed.clone();
        client.run_in_coroutine(move |client, co| {
            if !echo_once(client, co, addr, &message, read_timeout) {
                failed.set(failed.get() + 1);
            }
            finished.set(finished.get() + 1);
            kinfo!("client {} done", n);
            if finished.get() == clients {
                client.event_loop().quit();
            }
        });
    }

    if clients > 0 {
        event_loop.run()?;
    }
    kinfo!(
        "{} clients in {:?}, {} failed",
        clients,
        started.elapsed(),
        failed.get()
    );
    Ok(failed.get())
}

fn echo_once(
    client: &Rc<AsyncTcpClient>,
    co: &Rc<Coroutine>,
    addr: SocketAddr,
    message: &[u8],
    read_timeout: Duration,
) -> bool {
    let Some(conn) = client.connect_to(addr, co) else {
        kwarn!("connect to {} failed", addr);
        return false;
    };
    kinfo!("{} connected {} -> {}", conn.id(), conn.local_addr(), conn.peer_addr());

    if let Err(e) = conn.write(message) {
        kwarn!("{} write: {}", conn.id(), e);
        conn.close();
        return false;
    }

    let mut reply = vec![0u8; message.len()];
    let ok = match conn.read_full(&mut reply, Some(read_timeout)) {
        Ok(n) if n == reply.len() => {
            println!("{}", String::from_utf8_lossy(&reply));
            true
        }
        Ok(n) => {
            kwarn!("{} closed after {} of {} bytes", conn.id(), n, reply.len());
            false
        }
        Err(e) => {
            kwarn!("{} read: {}", conn.id(), e);
            false
        }
    };
    conn.close();
    ok
}
