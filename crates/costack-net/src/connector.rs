//! Non-blocking connect
//!
//! `connect_to` reports exactly one of `on_connected(fd, addr)` or
//! `on_error(addr)` per call. Immediate outcomes are reported before
//! `connect_to` returns; callers that must not be called back synchronously
//! (anything running inside a coroutine) go through `TcpClient`, which runs
//! the connect from the loop's deferred queue.

use crate::socket_ops;
use costack_core::error::CoError;
use costack_core::{kdebug, kwarn};
use costack_runtime::{EventHandle, EventLoop, TimerId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::time::Duration;

pub type ConnectedCallback = Rc<dyn Fn(RawFd, SocketAddr)>;
pub type ConnectErrorCallback = Rc<dyn Fn(SocketAddr)>;

/// A connect waiting for writability
struct Connecting {
    addr: SocketAddr,
    handle: Rc<EventHandle>,
    timer: TimerId,
}

pub struct TcpConnector {
    event_loop: Rc<EventLoop>,
    connect_timeout: Duration,
    connecting: RefCell<HashMap<RawFd, Connecting>>,
    connected_cb: RefCell<Option<ConnectedCallback>>,
    error_cb: RefCell<Option<ConnectErrorCallback>>,
    self_ref: Weak<TcpConnector>,
}

impl TcpConnector {
    pub fn new(event_loop: &Rc<EventLoop>, connect_timeout: Duration) -> Rc<Self> {
        Rc::new_cyclic(|weak| TcpConnector {
            event_loop: event_loop.clone(),
            connect_timeout,
            connecting: RefCell::new(HashMap::new()),
            connected_cb: RefCell::new(None),
            error_cb: RefCell::new(None),
            self_ref: weak.clone(),
        })
    }

    /// Called with the connected descriptor; the callee owns it
    pub fn set_on_connected<F: Fn(RawFd, SocketAddr) + 'static>(&self, f: F) {
        *self.connected_cb.borrow_mut() = Some(Rc::new(f));
    }

    pub fn set_on_error<F: Fn(SocketAddr) + 'static>(&self, f: F) {
        *self.error_cb.borrow_mut() = Some(Rc::new(f));
    }

    /// Attempts still waiting for the kernel
    pub fn connecting_count(&self) -> usize {
        self.connecting.borrow().len()
    }

    pub fn connect_to(&self, addr: SocketAddr) {
        let fd = match socket_ops::stream_socket(&addr) {
            Ok(fd) => fd,
            Err(e) => {
                kwarn!("create socket for {} failed: {}", addr, e);
                self.report_error(addr);
                return;
            }
        };

        match socket_ops::connect(fd, &addr) {
            Ok(()) => {
                kdebug!("connected to {} immediately, fd {}", addr, fd);
                self.report_connected(fd, addr);
            }
            Err(err) if err == libc::EINPROGRESS => {
                kdebug!("connect to {} in progress, fd {}", addr, fd);
                if let Err(e) = self.watch(fd, addr) {
                    kwarn!("watch connect to {} failed: {}", addr, e);
                    socket_ops::close(fd);
                    self.report_error(addr);
                }
            }
            Err(err) => {
                socket_ops::close(fd);
                kwarn!("connect to {} failed: {}", addr, CoError::Os(err));
                self.report_error(addr);
            }
        }
    }

    fn watch(&self, fd: RawFd, addr: SocketAddr) -> Result<(), CoError> {
        let handle = self.event_loop.new_handle(fd)?;

        let weak = self.self_ref.clone();
        let on_ready = move || {
            if let Some(connector) = weak.upgrade() {
                connector.on_writable(fd);
            }
        };
        handle.set_write_callback(on_ready.clone());
        handle.set_error_callback(on_ready);
        handle.enable_writing();

        let weak = self.self_ref.clone();
        let timer = self.event_loop.run_after(self.connect_timeout, move || {
            if let Some(connector) = weak.upgrade() {
                connector.on_timeout(fd);
            }
        });

        self.connecting
            .borrow_mut()
            .insert(fd, Connecting { addr, handle, timer });
        Ok(())
    }

    fn take_connecting(&self, fd: RawFd) -> Option<Connecting> {
        let entry = self.connecting.borrow_mut().remove(&fd)?;
        entry.handle.remove();
        Some(entry)
    }

    fn on_writable(&self, fd: RawFd) {
        let Some(entry) = self.take_connecting(fd) else {
            return;
        };
        self.event_loop.remove_timer(entry.timer);

        let err = socket_ops::take_error(fd);
        if err == 0 {
            kdebug!("connected to {}, fd {}", entry.addr, fd);
            self.report_connected(fd, entry.addr);
        } else {
            socket_ops::close(fd);
            kwarn!("connect to {} failed: {}", entry.addr, CoError::Os(err));
            self.report_error(entry.addr);
        }
    }

    fn on_timeout(&self, fd: RawFd) {
        let Some(entry) = self.take_connecting(fd) else {
            return;
        };
        socket_ops::close(fd);
        kwarn!(
            "connect to {} timed out after {:?}",
            entry.addr,
            self.connect_timeout
        );
        self.report_error(entry.addr);
    }

    fn report_connected(&self, fd: RawFd, addr: SocketAddr) {
        let cb = self.connected_cb.borrow().clone();
        match cb {
            Some(cb) => cb(fd, addr),
            None => {
                kwarn!("no connected callback, dropping connection to {}", addr);
                socket_ops::close(fd);
            }
        }
    }

    fn report_error(&self, addr: SocketAddr) {
        let cb = self.error_cb.borrow().clone();
        if let Some(cb) = cb {
            cb(addr);
        }
    }
}

impl Drop for TcpConnector {
    fn drop(&mut self) {
        for (fd, entry) in self.connecting.get_mut().drain() {
            entry.handle.remove();
            self.event_loop.remove_timer(entry.timer);
            socket_ops::close(fd);
        }
    }
}
