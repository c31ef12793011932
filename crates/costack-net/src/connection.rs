//! One connected non-blocking TCP socket
//!
//! `TcpConnection` knows nothing about coroutines. It reads whatever the
//! kernel has into its read buffer and reports it through the read
//! callback, flushes its write buffer when the socket is writable and
//! reports an empty buffer through the write-done callback, and reports the
//! end of the connection through the close callback.
//!
//! ```text
//!   Connected ──close()──► Closing ──write buffer drained──► Closed
//!       │                     │
//!       └── peer EOF / error ─┴──────────────────────────► Closed
//! ```
//!
//! The close callback is always delivered through the loop's deferred
//! queue, exactly once, after the connection reached Closed. Reaching
//! Closed unregisters the event handle; dropping the last `Rc` closes the
//! descriptor.

use crate::buffer::ConnectionBuffer;
use crate::socket_ops;
use costack_core::constants::READ_SPILL_SIZE;
use costack_core::error::{CoError, CoResult};
use costack_core::id::ConnectionId;
use costack_core::{kdebug, kinfo, ktrace, kwarn};
use costack_runtime::{EventHandle, EventLoop, NetConfig};
use std::cell::{Cell, Ref, RefCell};
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};

pub type ConnectionCallback = Rc<dyn Fn(&Rc<TcpConnection>)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connected,
    /// Local close requested, flushing the write buffer
    Closing,
    Closed,
}

pub struct TcpConnection {
    id: ConnectionId,
    fd: RawFd,
    event_loop: Weak<EventLoop>,
    handle: Rc<EventHandle>,
    state: Cell<ConnState>,
    /// Reading was paused because the read buffer hit its limit
    read_paused: Cell<bool>,
    close_queued: Cell<bool>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    read_buffer: RefCell<ConnectionBuffer>,
    write_buffer: RefCell<ConnectionBuffer>,
    read_cb: RefCell<Option<ConnectionCallback>>,
    write_done_cb: RefCell<Option<ConnectionCallback>>,
    close_cb: RefCell<Option<ConnectionCallback>>,
    self_ref: Weak<TcpConnection>,
}

impl TcpConnection {
    /// Take ownership of a connected socket and start reading
    ///
    /// `peer` overrides `getpeername`, so a client connection reports the
    /// address it was asked to connect to. On failure the descriptor is
    /// closed.
    pub fn new(
        event_loop: &Rc<EventLoop>,
        fd: RawFd,
        peer: Option<SocketAddr>,
        config: &NetConfig,
    ) -> CoResult<Rc<Self>> {
        let handle = match event_loop.new_handle(fd) {
            Ok(h) => h,
            Err(e) => {
                socket_ops::close(fd);
                return Err(e);
            }
        };
        if let Err(e) = socket_ops::set_nodelay(fd) {
            kdebug!("TCP_NODELAY on fd {}: {}", fd, e);
        }
        let local_addr = socket_ops::local_addr(fd).unwrap_or_else(|_| socket_ops::unspecified_addr());
        let peer_addr = match peer {
            Some(addr) => addr,
            None => socket_ops::peer_addr(fd).unwrap_or_else(|_| socket_ops::unspecified_addr()),
        };

        let conn = Rc::new_cyclic(|weak| TcpConnection {
            id: ConnectionId::next(),
            fd,
            event_loop: Rc::downgrade(event_loop),
            handle,
            state: Cell::new(ConnState::Connected),
            read_paused: Cell::new(false),
            close_queued: Cell::new(false),
            local_addr,
            peer_addr,
            read_buffer: RefCell::new(ConnectionBuffer::with_limits(
                config.buffer_size,
                config.max_buffer_size,
            )),
            write_buffer: RefCell::new(ConnectionBuffer::with_limits(
                config.buffer_size,
                config.max_buffer_size,
            )),
            read_cb: RefCell::new(None),
            write_done_cb: RefCell::new(None),
            close_cb: RefCell::new(None),
            self_ref: weak.clone(),
        });

        let weak = Rc::downgrade(&conn);
        conn.handle.set_read_callback(move || {
            if let Some(conn) = weak.upgrade() {
                conn.read_from_peer();
            }
        });
        let weak = Rc::downgrade(&conn);
        conn.handle.set_write_callback(move || {
            if let Some(conn) = weak.upgrade() {
                conn.write_to_peer();
            }
        });
        let weak = Rc::downgrade(&conn);
        conn.handle.set_error_callback(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_error();
            }
        });
        conn.handle.enable_reading();

        kdebug!("{} established {} -> {}, fd {}", conn.id, local_addr, peer_addr, fd);
        Ok(conn)
    }

    #[inline]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[inline]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    #[inline]
    pub fn state(&self) -> ConnState {
        self.state.get()
    }

    /// True once `close()` was called or the peer went away
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.state.get() != ConnState::Connected
    }

    pub fn event_loop(&self) -> Option<Rc<EventLoop>> {
        self.event_loop.upgrade()
    }

    pub fn set_on_read<F: Fn(&Rc<TcpConnection>) + 'static>(&self, f: F) {
        *self.read_cb.borrow_mut() = Some(Rc::new(f));
    }

    pub fn set_on_write_done<F: Fn(&Rc<TcpConnection>) + 'static>(&self, f: F) {
        *self.write_done_cb.borrow_mut() = Some(Rc::new(f));
    }

    pub fn set_on_close<F: Fn(&Rc<TcpConnection>) + 'static>(&self, f: F) {
        *self.close_cb.borrow_mut() = Some(Rc::new(f));
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Queue `data` for sending
    ///
    /// Returns false, queueing nothing, when the connection is closing or
    /// the write buffer would pass its limit. Never calls back
    /// synchronously; write-done is reported from the loop.
    pub fn write(&self, data: &[u8]) -> bool {
        if self.is_closed() {
            kwarn!("{} write of {} bytes after close", self.id, data.len());
            return false;
        }
        if data.is_empty() {
            return true;
        }
        if !self.write_buffer.borrow_mut().append(data) {
            kwarn!(
                "{} write of {} bytes refused, peer {}",
                self.id,
                data.len(),
                self.peer_addr
            );
            return false;
        }
        self.handle.enable_writing();
        true
    }

    /// Bytes `write` accepts right now
    pub fn bytes_can_write(&self) -> usize {
        if self.is_closed() {
            return 0;
        }
        self.write_buffer.borrow().space_before_full()
    }

    /// Bytes accepted by `write` but not yet handed to the kernel
    pub fn pending_write_bytes(&self) -> usize {
        self.write_buffer.borrow().len()
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Peek at everything buffered
    pub fn peek(&self) -> Ref<'_, [u8]> {
        Ref::map(self.read_buffer.borrow(), |b| b.read())
    }

    /// Number of buffered inbound bytes
    pub fn cached_len(&self) -> usize {
        self.read_buffer.borrow().len()
    }

    /// Move up to `out.len()` buffered bytes into `out`
    pub fn read(&self, out: &mut [u8]) -> usize {
        let n = self.read_buffer.borrow_mut().read_and_clear(out);
        self.resume_reading();
        n
    }

    /// Take everything buffered
    pub fn read_all(&self) -> Vec<u8> {
        let data = {
            let mut buffer = self.read_buffer.borrow_mut();
            let data = buffer.read().to_vec();
            buffer.consume_bytes(data.len());
            data
        };
        self.resume_reading();
        data
    }

    /// Drop `n` buffered bytes
    ///
    /// # Panics
    ///
    /// If fewer than `n` bytes are buffered.
    pub fn consume_bytes(&self, n: usize) {
        self.read_buffer.borrow_mut().consume_bytes(n);
        self.resume_reading();
    }

    /// True when the read buffer is at its limit and reading is paused
    pub fn is_read_full(&self) -> bool {
        self.read_buffer.borrow().space_before_full() == 0
    }

    fn resume_reading(&self) {
        if self.read_paused.get() && self.state.get() == ConnState::Connected && !self.is_read_full() {
            self.read_paused.set(false);
            self.handle.enable_reading();
            ktrace!("{} reading resumed", self.id);
        }
    }

    // ------------------------------------------------------------------
    // Close
    // ------------------------------------------------------------------

    /// Stop reading and close once the write buffer has been flushed
    ///
    /// Idempotent. The close callback runs from the deferred queue.
    pub fn close(&self) {
        if self.state.get() != ConnState::Connected {
            ktrace!("{} close while {:?}", self.id, self.state.get());
            return;
        }
        self.handle.disable_reading();
        if self.write_buffer.borrow().is_empty() {
            self.finish_close();
        } else {
            kdebug!(
                "{} closing after {} pending bytes",
                self.id,
                self.write_buffer.borrow().len()
            );
            self.state.set(ConnState::Closing);
        }
    }

    fn finish_close(&self) {
        socket_ops::shutdown_write(self.fd);
        self.mark_closed();
    }

    /// Peer EOF or socket error
    fn close_by_peer(&self) {
        self.mark_closed();
    }

    fn mark_closed(&self) {
        self.state.set(ConnState::Closed);
        // Hang-ups are reported regardless of interest; stop hearing them.
        self.handle.remove();
        if self.close_queued.replace(true) {
            return;
        }
        kdebug!("{} closed, peer {}", self.id, self.peer_addr);

        let (Some(event_loop), Some(conn)) = (self.event_loop.upgrade(), self.self_ref.upgrade())
        else {
            return;
        };
        event_loop.queue_in_loop(move || {
            let cb = conn.close_cb.borrow().clone();
            if let Some(cb) = cb {
                cb(&conn);
            }
        });
    }

    // ------------------------------------------------------------------
    // Event handle callbacks
    // ------------------------------------------------------------------

    fn read_from_peer(&self) {
        let space = self.read_buffer.borrow().space_before_full();
        if space == 0 {
            kwarn!("{} read buffer full, pausing reads", self.id);
            self.read_paused.set(true);
            self.handle.disable_reading();
            return;
        }

        let mut spill = [0u8; READ_SPILL_SIZE];
        let nbytes = {
            let mut buffer = self.read_buffer.borrow_mut();
            let contiguous = buffer.contiguous_space();
            let spill_len = READ_SPILL_SIZE.min(space - contiguous);
            let nbytes = socket_ops::readv2(self.fd, buffer.write_slice(), &mut spill[..spill_len]);
            if nbytes > 0 {
                let nbytes = nbytes as usize;
                if nbytes <= contiguous {
                    buffer.add_bytes(nbytes);
                } else {
                    buffer.add_bytes(contiguous);
                    let ok = buffer.append(&spill[..nbytes - contiguous]);
                    debug_assert!(ok);
                }
            }
            nbytes
        };

        if nbytes == 0 {
            kinfo!("{} closed by peer {}", self.id, self.peer_addr);
            self.close_by_peer();
        } else if nbytes < 0 {
            let err = socket_ops::errno();
            if socket_ops::would_block(err) {
                return;
            }
            kwarn!("{} readv failed: {}", self.id, CoError::Os(err));
            self.close_by_peer();
        } else {
            ktrace!("{} read {} bytes", self.id, nbytes);
            self.notify(&self.read_cb);
        }
    }

    fn write_to_peer(&self) {
        let mut failed = None;
        let drained = {
            let mut buffer = self.write_buffer.borrow_mut();
            while !buffer.is_empty() {
                let n = socket_ops::write(self.fd, buffer.read());
                if n < 0 {
                    let err = socket_ops::errno();
                    if !socket_ops::would_block(err) {
                        failed = Some(err);
                    }
                    break;
                }
                ktrace!("{} wrote {} bytes", self.id, n);
                buffer.consume_bytes(n as usize);
            }
            buffer.is_empty()
        };

        if let Some(err) = failed {
            kwarn!("{} write to {} failed: {}", self.id, self.peer_addr, CoError::Os(err));
            self.close_by_peer();
            return;
        }
        if !drained {
            return;
        }
        self.notify(&self.write_done_cb);
        // The callback may have queued more bytes, and may have closed.
        if !self.write_buffer.borrow().is_empty() {
            return;
        }
        self.handle.disable_writing();
        if self.state.get() == ConnState::Closing {
            self.finish_close();
        }
    }

    fn handle_error(&self) {
        if self.state.get() == ConnState::Closed {
            return;
        }
        let err = socket_ops::take_error(self.fd);
        if err == libc::ECONNRESET || err == libc::ECONNREFUSED || err == 0 {
            kinfo!("{} error from {}: {}", self.id, self.peer_addr, CoError::Os(err));
        } else {
            kwarn!("{} error from {}: {}", self.id, self.peer_addr, CoError::Os(err));
        }
        self.close_by_peer();
    }

    fn notify(&self, slot: &RefCell<Option<ConnectionCallback>>) {
        let cb = slot.borrow().clone();
        if let (Some(cb), Some(conn)) = (cb, self.self_ref.upgrade()) {
            cb(&conn);
        }
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        kdebug!("{} destroyed, fd {}", self.id, self.fd);
        self.handle.remove();
        socket_ops::close(self.fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use costack_runtime::LoopConfig;
    use std::time::Duration;

    fn quiet_loop() -> Rc<EventLoop> {
        EventLoop::with_config(LoopConfig::new().poll_timeout(Duration::from_millis(2))).unwrap()
    }

    /// A connected non-blocking socket pair
    fn socket_pair() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        let ret = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
                fds.as_mut_ptr(),
            )
        };
        assert_eq!(ret, 0);
        (fds[0], fds[1])
    }

    fn turn(el: &Rc<EventLoop>, n: usize) {
        for _ in 0..n {
            el.run_once(Duration::from_millis(5)).unwrap();
        }
    }

    fn peer_read(fd: RawFd) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut _, buf.len()) };
            if n <= 0 {
                break;
            }
            out.extend_from_slice(&buf[..n as usize]);
        }
        out
    }

    #[test]
    fn test_read_callback_sees_bytes() {
        let el = quiet_loop();
        let (a, b) = socket_pair();
        let conn = TcpConnection::new(&el, a, Some(socket_ops::unspecified_addr()), &NetConfig::new()).unwrap();
        let got = Rc::new(RefCell::new(Vec::new()));
        let g = got.clone();
        conn.set_on_read(move |c| g.borrow_mut().extend(c.read_all()));

        socket_ops::write(b, b"hello");
        turn(&el, 2);
        assert_eq!(&*got.borrow(), b"hello");
        assert_eq!(conn.cached_len(), 0);
        socket_ops::close(b);
    }

    #[test]
    fn test_write_then_write_done() {
        let el = quiet_loop();
        let (a, b) = socket_pair();
        let conn = TcpConnection::new(&el, a, None, &NetConfig::new()).unwrap();
        let done = Rc::new(Cell::new(0));
        let d = done.clone();
        conn.set_on_write_done(move |_| d.set(d.get() + 1));

        assert!(conn.write(b"ping"));
        // Nothing is reported synchronously.
        assert_eq!(done.get(), 0);
        assert_eq!(conn.pending_write_bytes(), 4);
        turn(&el, 2);
        assert_eq!(done.get(), 1);
        assert_eq!(peer_read(b), b"ping");
        socket_ops::close(b);
    }

    #[test]
    fn test_close_flushes_pending_writes() {
        let el = quiet_loop();
        let (a, b) = socket_pair();
        let conn = TcpConnection::new(&el, a, None, &NetConfig::new()).unwrap();
        let closed = Rc::new(Cell::new(0));
        let c = closed.clone();
        conn.set_on_close(move |_| c.set(c.get() + 1));

        assert!(conn.write(b"last words"));
        conn.close();
        assert_eq!(conn.state(), ConnState::Closing);
        assert!(!conn.write(b"more"));
        conn.close();

        turn(&el, 3);
        assert_eq!(conn.state(), ConnState::Closed);
        assert_eq!(closed.get(), 1);
        assert_eq!(peer_read(b), b"last words");
        socket_ops::close(b);
    }

    #[test]
    fn test_close_from_write_done_flushes_new_bytes() {
        let el = quiet_loop();
        let (a, b) = socket_pair();
        let conn = TcpConnection::new(&el, a, None, &NetConfig::new()).unwrap();
        let rounds = Rc::new(Cell::new(0));
        let refilled = Rc::new(Cell::new(false));
        let r = rounds.clone();
        let f = refilled.clone();
        conn.set_on_write_done(move |c| {
            r.set(r.get() + 1);
            if r.get() == 1 {
                f.set(c.write(b"-second"));
                c.close();
            }
        });
        let closed = Rc::new(Cell::new(0));
        let c = closed.clone();
        conn.set_on_close(move |_| c.set(c.get() + 1));

        assert!(conn.write(b"first"));
        turn(&el, 4);
        assert!(refilled.get());
        assert_eq!(rounds.get(), 2);
        assert_eq!(conn.state(), ConnState::Closed);
        assert_eq!(conn.pending_write_bytes(), 0);
        assert_eq!(closed.get(), 1);
        assert_eq!(peer_read(b), b"first-second");

        // Write side shut down after the flush: the peer sees EOF.
        let mut byte = [0u8; 1];
        let n = unsafe { libc::read(b, byte.as_mut_ptr() as *mut _, 1) };
        assert_eq!(n, 0);
        socket_ops::close(b);
    }

    #[test]
    fn test_peer_close_reported_once() {
        let el = quiet_loop();
        let (a, b) = socket_pair();
        let conn = TcpConnection::new(&el, a, None, &NetConfig::new()).unwrap();
        let closed = Rc::new(Cell::new(0));
        let c = closed.clone();
        conn.set_on_close(move |_| c.set(c.get() + 1));

        socket_ops::close(b);
        turn(&el, 3);
        assert!(conn.is_closed());
        assert_eq!(closed.get(), 1);
        conn.close();
        turn(&el, 1);
        assert_eq!(closed.get(), 1);
    }

    #[test]
    fn test_drop_releases_handle() {
        let el = quiet_loop();
        let (a, b) = socket_pair();
        let conn = TcpConnection::new(&el, a, None, &NetConfig::new()).unwrap();
        assert_eq!(el.handle_count(), 1);
        drop(conn);
        turn(&el, 1);
        assert_eq!(el.handle_count(), 0);
        socket_ops::close(b);
    }

    #[test]
    fn test_full_read_buffer_pauses_reading() {
        let el = quiet_loop();
        let (a, b) = socket_pair();
        let config = NetConfig::new().buffer_size(16).max_buffer_size(16);
        let conn = TcpConnection::new(&el, a, None, &config).unwrap();

        socket_ops::write(b, &[1u8; 40]);
        turn(&el, 3);
        assert_eq!(conn.cached_len(), 16);
        assert!(conn.is_read_full());
        assert!(!conn.is_closed());

        let mut out = [0u8; 16];
        assert_eq!(conn.read(&mut out), 16);
        turn(&el, 2);
        assert_eq!(conn.cached_len(), 16);
        assert_eq!(conn.read_all().len(), 16);
        turn(&el, 2);
        assert_eq!(conn.read_all(), vec![1u8; 8]);
        socket_ops::close(b);
    }
}
