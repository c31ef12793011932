//! Listening socket that hands accepted descriptors to a callback

use crate::socket_ops;
use costack_core::error::{CoError, CoResult};
use costack_core::{kdebug, kerror, kinfo, kwarn};
use costack_runtime::{EventHandle, EventLoop};
use std::cell::RefCell;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::rc::Rc;

pub type AcceptCallback = Rc<dyn Fn(RawFd, SocketAddr)>;

pub struct TcpAcceptor {
    fd: RawFd,
    handle: Rc<EventHandle>,
    local_addr: SocketAddr,
    accept_cb: RefCell<Option<AcceptCallback>>,
}

impl TcpAcceptor {
    /// Bind with SO_REUSEADDR and start listening
    ///
    /// Port 0 picks a free port; `local_addr()` reports it.
    pub fn bind(event_loop: &Rc<EventLoop>, addr: SocketAddr, backlog: i32) -> CoResult<Rc<Self>> {
        let fd = socket_ops::listen(&addr, backlog)?;
        let local_addr = match socket_ops::local_addr(fd) {
            Ok(a) => a,
            Err(e) => {
                socket_ops::close(fd);
                return Err(e);
            }
        };
        let handle = match event_loop.new_handle(fd) {
            Ok(h) => h,
            Err(e) => {
                socket_ops::close(fd);
                return Err(e);
            }
        };

        let acceptor = Rc::new(TcpAcceptor {
            fd,
            handle,
            local_addr,
            accept_cb: RefCell::new(None),
        });
        let weak = Rc::downgrade(&acceptor);
        acceptor.handle.set_read_callback(move || {
            if let Some(acceptor) = weak.upgrade() {
                acceptor.accept_pending();
            }
        });
        acceptor.handle.enable_reading();
        kinfo!("listening on {}", local_addr);
        Ok(acceptor)
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Called with each accepted descriptor; the callee owns it
    pub fn set_on_accept<F: Fn(RawFd, SocketAddr) + 'static>(&self, f: F) {
        *self.accept_cb.borrow_mut() = Some(Rc::new(f));
    }

    fn accept_pending(&self) {
        loop {
            match socket_ops::accept(self.fd) {
                Ok((fd, peer)) => {
                    kdebug!("accepted {} as fd {}", peer, fd);
                    let cb = self.accept_cb.borrow().clone();
                    match cb {
                        Some(cb) => cb(fd, peer),
                        None => socket_ops::close(fd),
                    }
                }
                Err(err) if socket_ops::would_block(err) => break,
                Err(err) if err == libc::ECONNABORTED => continue,
                Err(err) if err == libc::EMFILE || err == libc::ENFILE => {
                    kerror!("accept on {}: {}", self.local_addr, CoError::Os(err));
                    break;
                }
                Err(err) => {
                    kwarn!("accept on {}: {}", self.local_addr, CoError::Os(err));
                    break;
                }
            }
        }
    }
}

impl Drop for TcpAcceptor {
    fn drop(&mut self) {
        self.handle.remove();
        socket_ops::close(self.fd);
    }
}
