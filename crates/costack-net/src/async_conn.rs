//! Blocking-style connection for code running inside a coroutine
//!
//! Every operation that cannot complete from the buffers parks the owning
//! coroutine: it records what it waits for in the connection status and
//! yields. `AsyncTcpClient` resumes the coroutine from the matching
//! reactor callback:
//!
//! | status             | resumed by                    |
//! |--------------------|-------------------------------|
//! | `WaitingMessage`   | read callback, close, timeout |
//! | `WaitingWriteDone` | write-done callback, close    |
//! | `WaitingClose`     | close callback                |
//! | `Idle`             | nothing                       |
//!
//! An operation always leaves the status `Idle` (or `Closed`) when it
//! returns, error or not, so a late callback never resumes a coroutine that
//! is no longer waiting.

use crate::connection::TcpConnection;
use costack_core::error::{CoError, CoResult};
use costack_core::id::{ConnectionId, CoroutineId};
use costack_core::state::ConnStatus;
use costack_core::ktrace;
use costack_runtime::coroutine::{self, yield_now, yield_with_timeout, Coroutine};
use costack_runtime::EventLoop;
use std::cell::Cell;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

pub struct AsyncTcpConnection {
    conn: Rc<TcpConnection>,
    event_loop: Rc<EventLoop>,
    co: Weak<Coroutine>,
    co_id: CoroutineId,
    status: Cell<ConnStatus>,
}

impl AsyncTcpConnection {
    pub(crate) fn new(conn: Rc<TcpConnection>, event_loop: Rc<EventLoop>, co: &Rc<Coroutine>) -> Self {
        Self {
            conn,
            event_loop,
            co: Rc::downgrade(co),
            co_id: co.id(),
            status: Cell::new(ConnStatus::Idle),
        }
    }

    #[inline]
    pub fn id(&self) -> ConnectionId {
        self.conn.id()
    }

    #[inline]
    pub fn status(&self) -> ConnStatus {
        self.status.get()
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.status.get() == ConnStatus::Closed
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.conn.local_addr()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.conn.peer_addr()
    }

    /// The non-blocking connection underneath
    pub fn connection(&self) -> &Rc<TcpConnection> {
        &self.conn
    }

    pub(crate) fn set_status(&self, status: ConnStatus) {
        ktrace!("{} status {} -> {}", self.conn.id(), self.status.get(), status);
        self.status.set(status);
    }

    /// The coroutine parked on this connection, if it still exists
    pub(crate) fn coroutine(&self) -> Option<Rc<Coroutine>> {
        self.co.upgrade()
    }

    /// Closed here or underneath; no more bytes will arrive
    fn is_done(&self) -> bool {
        self.is_closed() || self.conn.is_closed()
    }

    fn set_idle(&self) {
        if !self.is_closed() {
            self.status.set(ConnStatus::Idle);
        }
    }

    /// Park until a callback matching `status` resumes us, or `deadline`
    ///
    /// Returns true when woken by the deadline.
    fn park(&self, status: ConnStatus, deadline: Option<Instant>) -> bool {
        assert_eq!(
            coroutine::current_id(),
            self.co_id,
            "{} used outside its coroutine",
            self.conn.id()
        );
        self.set_status(status);
        match deadline {
            None => {
                yield_now();
                false
            }
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now());
                yield_with_timeout(&self.event_loop, left)
            }
        }
    }

    /// Write all of `data`, parking while the write buffer is full
    pub fn write(&self, data: &[u8]) -> CoResult<()> {
        if self.is_done() {
            return Err(CoError::Closed);
        }
        let mut rest = data;
        loop {
            let n = self.conn.bytes_can_write().min(rest.len());
            if n > 0 {
                if !self.conn.write(&rest[..n]) {
                    self.set_idle();
                    return Err(CoError::Closed);
                }
                rest = &rest[n..];
            }
            if rest.is_empty() {
                break;
            }
            self.park(ConnStatus::WaitingWriteDone, None);
            if self.is_done() {
                self.set_idle();
                return Err(CoError::Closed);
            }
        }
        self.set_idle();
        Ok(())
    }

    /// Park until everything written so far has reached the kernel
    pub fn wait_write_done(&self) -> CoResult<()> {
        if self.conn.pending_write_bytes() == 0 {
            return Ok(());
        }
        if self.is_done() {
            return Err(CoError::Closed);
        }
        self.park(ConnStatus::WaitingWriteDone, None);
        self.set_idle();
        if self.conn.pending_write_bytes() != 0 {
            return Err(CoError::Closed);
        }
        Ok(())
    }

    /// Fill `buf` completely
    ///
    /// `timeout` bounds the whole call. Returns fewer than `buf.len()` bytes
    /// only when the connection closed first. Bytes stay in the read buffer
    /// until the request can be satisfied, so a timed-out call loses
    /// nothing; the exception is a request larger than the read buffer's
    /// limit, which is drained as it fills.
    pub fn read_full(&self, buf: &mut [u8], timeout: Option<Duration>) -> CoResult<usize> {
        if self.is_done() && self.conn.cached_len() == 0 && !buf.is_empty() {
            return Err(CoError::Closed);
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut filled = 0;
        while filled < buf.len() {
            let need = buf.len() - filled;
            if self.conn.cached_len() >= need || self.conn.is_read_full() || self.is_done() {
                filled += self.conn.read(&mut buf[filled..]);
                if filled == buf.len() || self.is_done() {
                    break;
                }
            }
            if self.park(ConnStatus::WaitingMessage, deadline) {
                self.set_idle();
                return Err(CoError::Timeout);
            }
        }
        self.set_idle();
        Ok(filled)
    }

    /// Read exactly `n` bytes, or whatever is available (at least one
    /// byte) when `n == 0`
    ///
    /// Unlike `read_full`, a close before `n` bytes arrived is an error; the
    /// partial bytes remain available to `read_cached`.
    pub fn read(&self, n: usize, timeout: Option<Duration>) -> CoResult<Vec<u8>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let cached = self.conn.cached_len();
            if (n == 0 && cached > 0) || (n > 0 && cached >= n) {
                self.set_idle();
                return Ok(self.read_cached(n));
            }
            if self.is_done() {
                self.set_idle();
                return Err(CoError::Closed);
            }
            if self.conn.is_read_full() {
                self.set_idle();
                return Err(CoError::BufferFull);
            }
            if self.park(ConnStatus::WaitingMessage, deadline) {
                self.set_idle();
                return Err(CoError::Timeout);
            }
        }
    }

    /// Take up to `n` buffered bytes (all of them when `n == 0`); never parks
    pub fn read_cached(&self, n: usize) -> Vec<u8> {
        if n == 0 {
            return self.conn.read_all();
        }
        let mut out = vec![0; n.min(self.conn.cached_len())];
        let got = self.conn.read(&mut out);
        out.truncate(got);
        out
    }

    /// Copy up to `n` buffered bytes (all of them when `n == 0`) without
    /// consuming them; never parks
    pub fn peek_cached(&self, n: usize) -> Vec<u8> {
        let data = self.conn.peek();
        let n = if n == 0 { data.len() } else { n.min(data.len()) };
        data[..n].to_vec()
    }

    pub fn has_cached_data(&self) -> bool {
        self.conn.cached_len() != 0
    }

    pub fn cached_data_size(&self) -> usize {
        self.conn.cached_len()
    }

    /// Close after pending writes are flushed and park until the close
    /// callback has run; no-op when already closed
    pub fn close(&self) {
        if self.is_closed() {
            return;
        }
        self.conn.close();
        self.park(ConnStatus::WaitingClose, None);
    }
}
