//! epoll readiness multiplexer
//!
//! Registrations carry a caller-chosen `u64` token as epoll user data. The
//! event loop hands out a fresh token per event handle, so readiness that
//! was queued for a descriptor number before it was closed and reused never
//! reaches the new owner.
//!
//! Level-triggered: a descriptor stays ready until it is drained or its
//! interest is dropped.

use costack_core::error::{CoError, CoResult};
use costack_core::{kdebug, ktrace};
use std::collections::HashSet;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Which readiness a descriptor wants to hear about
///
/// Errors and hang-ups are always reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
}

impl Interest {
    pub const NONE: Interest = Interest { read: false, write: false };
    pub const READ: Interest = Interest { read: true, write: false };
    pub const WRITE: Interest = Interest { read: false, write: true };
    pub const BOTH: Interest = Interest { read: true, write: true };

    #[inline]
    pub fn is_none(&self) -> bool {
        !self.read && !self.write
    }

    fn to_epoll(self) -> u32 {
        let mut events = 0u32;
        if self.read {
            events |= (libc::EPOLLIN | libc::EPOLLPRI | libc::EPOLLRDHUP) as u32;
        }
        if self.write {
            events |= libc::EPOLLOUT as u32;
        }
        events
    }
}

/// What the kernel reported for one descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub hangup: bool,
}

impl Readiness {
    fn from_epoll(events: u32) -> Self {
        let has = |flag: i32| events & flag as u32 != 0;
        Readiness {
            readable: has(libc::EPOLLIN) || has(libc::EPOLLPRI) || has(libc::EPOLLRDHUP),
            writable: has(libc::EPOLLOUT),
            error: has(libc::EPOLLERR),
            hangup: has(libc::EPOLLHUP),
        }
    }
}

pub struct Poller {
    epfd: RawFd,
    events: Vec<libc::epoll_event>,
    registered: HashSet<u64>,
}

impl Poller {
    /// Create an epoll instance fetching up to `initial_events` per poll
    pub fn new(initial_events: usize) -> CoResult<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(CoError::last_os_error());
        }
        kdebug!("epoll fd {} created", epfd);
        Ok(Self {
            epfd,
            events: vec![libc::epoll_event { events: 0, u64: 0 }; initial_events.max(1)],
            registered: HashSet::new(),
        })
    }

    /// Start watching `fd` under `token`
    ///
    /// # Panics
    ///
    /// If `token` is already registered.
    pub fn register(&mut self, fd: RawFd, token: u64, interest: Interest) -> CoResult<()> {
        assert!(
            self.registered.insert(token),
            "token {} registered twice (fd {})",
            token,
            fd
        );
        if let Err(e) = self.ctl(libc::EPOLL_CTL_ADD, fd, token, interest) {
            self.registered.remove(&token);
            return Err(e);
        }
        Ok(())
    }

    /// Change the interest set of a registered descriptor
    pub fn modify(&mut self, fd: RawFd, token: u64, interest: Interest) -> CoResult<()> {
        debug_assert!(self.registered.contains(&token));
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, interest)
    }

    /// Stop watching `fd`; unknown tokens are ignored
    pub fn deregister(&mut self, fd: RawFd, token: u64) -> CoResult<()> {
        if !self.registered.remove(&token) {
            return Ok(());
        }
        self.ctl(libc::EPOLL_CTL_DEL, fd, token, Interest::NONE)
    }

    #[inline]
    pub fn is_registered(&self, token: u64) -> bool {
        self.registered.contains(&token)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.registered.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.registered.is_empty()
    }

    fn ctl(&self, op: i32, fd: RawFd, token: u64, interest: Interest) -> CoResult<()> {
        let mut ev = libc::epoll_event {
            events: interest.to_epoll(),
            u64: token,
        };
        let ret = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if ret < 0 {
            return Err(CoError::last_os_error());
        }
        Ok(())
    }

    /// Wait up to `timeout` (forever when None) and append ready tokens to
    /// `ready` in the order the kernel reports them
    ///
    /// An interrupted wait returns `Ok(0)`.
    pub fn poll(&mut self, timeout: Option<Duration>, ready: &mut Vec<(u64, Readiness)>) -> CoResult<usize> {
        let timeout_ms = match timeout {
            None => -1,
            Some(d) => {
                // Round up so a 100us deadline does not busy-spin at 0ms.
                let ms = d.as_micros().div_ceil(1000);
                ms.min(i32::MAX as u128) as i32
            }
        };

        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                self.events.as_mut_ptr(),
                self.events.len() as i32,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = CoError::last_os_error();
            if err == CoError::Os(libc::EINTR) {
                return Ok(0);
            }
            return Err(err);
        }

        let n = n as usize;
        for ev in &self.events[..n] {
            // Copy out of the packed struct before use.
            let token = ev.u64;
            let events = ev.events;
            ready.push((token, Readiness::from_epoll(events)));
        }
        if n == self.events.len() {
            let grown = self.events.len() * 2;
            ktrace!("epoll event list full, growing to {}", grown);
            self.events.resize(grown, libc::epoll_event { events: 0, u64: 0 });
        }
        Ok(n)
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert_eq!(ret, 0);
        (fds[0], fds[1])
    }

    fn close(fd: RawFd) {
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_read_readiness() {
        let mut poller = Poller::new(4).unwrap();
        let (r, w) = pipe();
        poller.register(r, 7, Interest::READ).unwrap();

        let mut ready = Vec::new();
        assert_eq!(poller.poll(Some(Duration::ZERO), &mut ready).unwrap(), 0);

        unsafe { libc::write(w, b"x".as_ptr() as *const _, 1) };
        assert_eq!(poller.poll(Some(Duration::from_millis(100)), &mut ready).unwrap(), 1);
        assert_eq!(ready[0].0, 7);
        assert!(ready[0].1.readable);

        poller.deregister(r, 7).unwrap();
        assert!(poller.is_empty());
        close(r);
        close(w);
    }

    #[test]
    fn test_modify_to_write() {
        let mut poller = Poller::new(4).unwrap();
        let (r, w) = pipe();
        poller.register(w, 1, Interest::NONE).unwrap();

        let mut ready = Vec::new();
        assert_eq!(poller.poll(Some(Duration::ZERO), &mut ready).unwrap(), 0);

        poller.modify(w, 1, Interest::WRITE).unwrap();
        assert_eq!(poller.poll(Some(Duration::ZERO), &mut ready).unwrap(), 1);
        assert!(ready[0].1.writable);
        close(r);
        close(w);
    }

    #[test]
    fn test_event_list_grows() {
        let mut poller = Poller::new(1).unwrap();
        let (r1, w1) = pipe();
        let (r2, w2) = pipe();
        poller.register(w1, 1, Interest::WRITE).unwrap();
        poller.register(w2, 2, Interest::WRITE).unwrap();

        let mut ready = Vec::new();
        assert_eq!(poller.poll(Some(Duration::ZERO), &mut ready).unwrap(), 1);
        assert_eq!(poller.poll(Some(Duration::ZERO), &mut ready).unwrap(), 2);
        for fd in [r1, w1, r2, w2] {
            close(fd);
        }
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn test_double_register_panics() {
        let mut poller = Poller::new(4).unwrap();
        let (r, _w) = pipe();
        poller.register(r, 3, Interest::READ).unwrap();
        let _ = poller.register(r, 3, Interest::READ);
    }

    #[test]
    fn test_register_bad_fd_fails() {
        let mut poller = Poller::new(4).unwrap();
        let err = poller.register(-1, 9, Interest::READ).unwrap_err();
        assert_eq!(err, CoError::Os(libc::EBADF));
        assert!(!poller.is_registered(9));
    }
}
