//! Per-descriptor event handle
//!
//! An `EventHandle` ties one descriptor to its interest set and to the
//! callbacks the loop invokes when the kernel reports it ready. It does not
//! own the descriptor; whoever created the descriptor closes it, after the
//! handle has been removed.
//!
//! A callback may disable or remove its own handle. The loop keeps the handle
//! alive for the rest of the dispatch and drops its reference through the
//! deferred queue.

use crate::event_loop::EventLoop;
use crate::poller::{Interest, Readiness};
use costack_core::{kerror, ktrace};
use std::cell::{Cell, RefCell};
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};

/// Callback fired on readiness
pub type EventCallback = Rc<dyn Fn()>;

pub struct EventHandle {
    fd: RawFd,
    token: u64,
    event_loop: Weak<EventLoop>,
    interest: Cell<Interest>,
    removed: Cell<bool>,
    read_cb: RefCell<Option<EventCallback>>,
    write_cb: RefCell<Option<EventCallback>>,
    error_cb: RefCell<Option<EventCallback>>,
}

impl EventHandle {
    pub(crate) fn new(fd: RawFd, token: u64, event_loop: Weak<EventLoop>) -> Self {
        Self {
            fd,
            token,
            event_loop,
            interest: Cell::new(Interest::NONE),
            removed: Cell::new(false),
            read_cb: RefCell::new(None),
            write_cb: RefCell::new(None),
            error_cb: RefCell::new(None),
        }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn token(&self) -> u64 {
        self.token
    }

    #[inline]
    pub fn interest(&self) -> Interest {
        self.interest.get()
    }

    #[inline]
    pub fn is_reading(&self) -> bool {
        self.interest.get().read
    }

    #[inline]
    pub fn is_writing(&self) -> bool {
        self.interest.get().write
    }

    #[inline]
    pub fn is_removed(&self) -> bool {
        self.removed.get()
    }

    pub fn set_read_callback<F: Fn() + 'static>(&self, f: F) {
        *self.read_cb.borrow_mut() = Some(Rc::new(f));
    }

    pub fn set_write_callback<F: Fn() + 'static>(&self, f: F) {
        *self.write_cb.borrow_mut() = Some(Rc::new(f));
    }

    /// Called on EPOLLERR, and on EPOLLHUP without pending input
    pub fn set_error_callback<F: Fn() + 'static>(&self, f: F) {
        *self.error_cb.borrow_mut() = Some(Rc::new(f));
    }

    pub fn enable_reading(&self) {
        self.update(Interest { read: true, ..self.interest.get() });
    }

    pub fn disable_reading(&self) {
        self.update(Interest { read: false, ..self.interest.get() });
    }

    pub fn enable_writing(&self) {
        self.update(Interest { write: true, ..self.interest.get() });
    }

    pub fn disable_writing(&self) {
        self.update(Interest { write: false, ..self.interest.get() });
    }

    pub fn disable_all(&self) {
        self.update(Interest::NONE);
    }

    /// Unregister from the loop
    ///
    /// Safe to call from inside this handle's own callback. Idempotent.
    pub fn remove(&self) {
        if self.removed.replace(true) {
            return;
        }
        self.interest.set(Interest::NONE);
        if let Some(event_loop) = self.event_loop.upgrade() {
            event_loop.remove_handle(self);
        }
    }

    fn update(&self, interest: Interest) {
        if self.removed.get() || interest == self.interest.get() {
            return;
        }
        self.interest.set(interest);
        if let Some(event_loop) = self.event_loop.upgrade() {
            event_loop.update_handle(self);
        }
    }

    /// Loop is going away; forget the registration without touching epoll
    pub(crate) fn detach(&self) {
        self.removed.set(true);
        self.interest.set(Interest::NONE);
    }

    /// Drop all callbacks so captured state can be freed
    pub(crate) fn clear_callbacks(&self) {
        self.read_cb.borrow_mut().take();
        self.write_cb.borrow_mut().take();
        self.error_cb.borrow_mut().take();
    }

    /// Dispatch one readiness report
    ///
    /// Each callback is cloned out before it runs, so it may replace
    /// callbacks or remove this handle.
    pub(crate) fn handle_event(&self, ready: Readiness) {
        ktrace!("fd {} ready {:?}", self.fd, ready);

        if (ready.hangup && !ready.readable) || ready.error {
            if !self.removed.get() {
                Self::fire(&self.error_cb);
            }
            if ready.error {
                return;
            }
        }
        if ready.readable && self.is_reading() && !self.removed.get() {
            Self::fire(&self.read_cb);
        }
        if ready.writable && self.is_writing() && !self.removed.get() {
            Self::fire(&self.write_cb);
        }
    }

    fn fire(slot: &RefCell<Option<EventCallback>>) {
        let cb = slot.borrow().clone();
        if let Some(cb) = cb {
            cb();
        }
    }
}

impl Drop for EventHandle {
    fn drop(&mut self) {
        if !self.removed.get() {
            kerror!("event handle for fd {} dropped while registered", self.fd);
        }
    }
}
