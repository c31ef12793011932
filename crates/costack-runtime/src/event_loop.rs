//! Single-threaded event loop
//!
//! One turn of the loop:
//!
//! ```text
//!   pending signals ──► signal callbacks
//!   epoll_wait(timeout) ──► ready callbacks, in kernel order
//!   deferred queue (snapshot) ──► queued work
//!   timer backend ──► due timers, deadline order
//! ```
//!
//! The poll timeout is the configured wait, shortened to the next timer
//! deadline, and zero while deferred work is waiting. Everything, including
//! resumed coroutines, runs on the thread that owns the loop; `EventLoop` is
//! `!Send` by construction.
//!
//! A panic in any callback unwinds out of `run()`.

use crate::config::LoopConfig;
use crate::event_handle::EventHandle;
use crate::poller::{Poller, Readiness};
use crate::signal;
use crate::stack;
use crate::timer::{HeapTimerBackend, HeapTimerStats, TimerBackend, TimerEntry, TimerId};
use costack_core::error::CoResult;
use costack_core::{kdebug, kerror, kinfo, ktrace};
use nix::sys::signal::Signal;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

type Deferred = Box<dyn FnOnce()>;

/// What a cron callback reports about the application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStatus {
    /// More work is expected soon; poll with the short timeout
    Busy,
    /// Nothing to do; poll with the idle timeout
    Idle,
}

pub struct EventLoop {
    config: LoopConfig,
    poller: RefCell<Poller>,
    handles: RefCell<HashMap<u64, Rc<EventHandle>>>,
    next_token: Cell<u64>,
    deferred: RefCell<VecDeque<Deferred>>,
    timers: HeapTimerBackend,
    signals: RefCell<Vec<(Signal, Rc<dyn Fn()>)>>,
    cron: RefCell<Option<Rc<dyn Fn() -> LoopStatus>>>,
    quit: Cell<bool>,
    running: Cell<bool>,
    iteration: Cell<u64>,
    empty_turns: Cell<u32>,
    ready: RefCell<Vec<(u64, Readiness)>>,
    self_ref: Weak<EventLoop>,
}

impl EventLoop {
    /// Create a loop from compile-time defaults and `COSTACK_*` overrides
    pub fn new() -> CoResult<Rc<Self>> {
        Self::with_config(LoopConfig::from_env())
    }

    /// Also maps this thread's shared stack with `config.stack_size` if no
    /// coroutine has run on the thread yet.
    pub fn with_config(config: LoopConfig) -> CoResult<Rc<Self>> {
        stack::init_shared_stack(config.stack_size)?;
        let poller = Poller::new(config.initial_events)?;
        let timers = HeapTimerBackend::new();
        kdebug!("event loop created, timer backend {}", timers.name());

        Ok(Rc::new_cyclic(|weak| EventLoop {
            config,
            poller: RefCell::new(poller),
            handles: RefCell::new(HashMap::new()),
            next_token: Cell::new(1),
            deferred: RefCell::new(VecDeque::new()),
            timers,
            signals: RefCell::new(Vec::new()),
            cron: RefCell::new(None),
            quit: Cell::new(false),
            running: Cell::new(false),
            iteration: Cell::new(0),
            empty_turns: Cell::new(0),
            ready: RefCell::new(Vec::new()),
            self_ref: weak.clone(),
        }))
    }

    #[inline]
    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    /// Number of completed turns
    #[inline]
    pub fn iteration(&self) -> u64 {
        self.iteration.get()
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.get()
    }

    // ------------------------------------------------------------------
    // Event handles
    // ------------------------------------------------------------------

    /// Create a handle for `fd` and register it with no interest yet
    ///
    /// Registration failure is logged and returned; the descriptor cannot
    /// be used with this loop.
    pub fn new_handle(&self, fd: RawFd) -> CoResult<Rc<EventHandle>> {
        let token = self.next_token.get();
        self.next_token.set(token + 1);

        let handle = Rc::new(EventHandle::new(fd, token, self.self_ref.clone()));
        if let Err(e) = self.poller.borrow_mut().register(fd, token, handle.interest()) {
            kerror!("epoll register fd {} failed: {}", fd, e);
            handle.detach();
            return Err(e);
        }
        self.handles.borrow_mut().insert(token, handle.clone());
        ktrace!("fd {} registered as token {}", fd, token);
        Ok(handle)
    }

    /// Push the handle's interest set to epoll
    ///
    /// # Panics
    ///
    /// If epoll rejects the change; the descriptor is unusable after that.
    pub(crate) fn update_handle(&self, handle: &EventHandle) {
        let result = self
            .poller
            .borrow_mut()
            .modify(handle.fd(), handle.token(), handle.interest());
        if let Err(e) = result {
            kerror!("epoll modify fd {} failed: {}", handle.fd(), e);
            panic!("epoll modify fd {} failed: {}", handle.fd(), e);
        }
    }

    /// Unregister a handle; its last loop-side reference is dropped on the
    /// deferred queue, never inside the current callback
    pub(crate) fn remove_handle(&self, handle: &EventHandle) {
        if let Err(e) = self.poller.borrow_mut().deregister(handle.fd(), handle.token()) {
            kdebug!("epoll deregister fd {}: {}", handle.fd(), e);
        }
        let owned = self.handles.borrow_mut().remove(&handle.token());
        if let Some(owned) = owned {
            self.defer_destroy(owned);
        }
    }

    /// Number of registered handles
    pub fn handle_count(&self) -> usize {
        self.handles.borrow().len()
    }

    // ------------------------------------------------------------------
    // Deferred work
    // ------------------------------------------------------------------

    /// Run `f` after the ready callbacks of the current turn
    ///
    /// Work queued while the queue is draining runs on the next turn.
    pub fn queue_in_loop<F: FnOnce() + 'static>(&self, f: F) {
        self.deferred.borrow_mut().push_back(Box::new(f));
    }

    /// Drop `obj` on the deferred queue
    ///
    /// For objects whose callback may be on the stack right now.
    pub fn defer_destroy<T: 'static>(&self, obj: T) {
        self.queue_in_loop(move || drop(obj));
    }

    pub fn pending_deferred(&self) -> usize {
        self.deferred.borrow().len()
    }

    fn run_deferred(&self) -> usize {
        let batch: VecDeque<Deferred> = std::mem::take(&mut *self.deferred.borrow_mut());
        let n = batch.len();
        for f in batch {
            f();
        }
        n
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// Run `f` once at `deadline`
    pub fn run_at<F: Fn() + 'static>(&self, deadline: Instant, f: F) -> TimerId {
        self.timers.insert(TimerEntry::at(deadline, Rc::new(f)))
    }

    /// Run `f` once after `delay`
    pub fn run_after<F: Fn() + 'static>(&self, delay: Duration, f: F) -> TimerId {
        self.timers.insert(TimerEntry::after(delay, Rc::new(f)))
    }

    /// Run `f` every `interval` until the timer is removed
    pub fn run_every<F: Fn() + 'static>(&self, interval: Duration, f: F) -> TimerId {
        self.timers.insert(TimerEntry::every(interval, Rc::new(f)))
    }

    /// Cancel a timer; no-op if it already fired or was removed
    pub fn remove_timer(&self, id: TimerId) {
        if self.timers.cancel(id) {
            ktrace!("{} cancelled", id);
        }
    }

    /// True once a one-shot timer has fired or any timer was removed
    pub fn expired(&self, id: TimerId) -> bool {
        !self.timers.is_active(id)
    }

    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }

    /// Lifetime timer counters of this loop
    pub fn timer_stats(&self) -> HeapTimerStats {
        self.timers.stats()
    }

    fn run_timers(&self) -> usize {
        let due = self.timers.poll_expired(Instant::now());
        let mut fired = 0;
        for timer in due {
            if self.timers.take_due(timer.id) {
                (timer.callback)();
                fired += 1;
            }
        }
        fired
    }

    // ------------------------------------------------------------------
    // Signals and cron
    // ------------------------------------------------------------------

    /// Run `f` on the loop thread whenever `sig` is delivered
    pub fn trap_signal<F: Fn() + 'static>(&self, sig: Signal, f: F) -> CoResult<()> {
        signal::install(sig)?;
        let mut signals = self.signals.borrow_mut();
        signals.retain(|(s, _)| *s != sig);
        signals.push((sig, Rc::new(f)));
        kdebug!("trapping {}", sig);
        Ok(())
    }

    fn run_signals(&self) {
        let trapped: Vec<(Signal, Rc<dyn Fn()>)> = self.signals.borrow().clone();
        for (sig, cb) in trapped {
            if signal::take_pending(sig) {
                kinfo!("caught {}", sig);
                cb();
            }
        }
    }

    /// Install a per-turn callback that picks the next poll timeout
    pub fn set_cron<F: Fn() -> LoopStatus + 'static>(&self, f: F) {
        *self.cron.borrow_mut() = Some(Rc::new(f));
    }

    fn base_wait(&self) -> Duration {
        let cron = self.cron.borrow().clone();
        match cron.map(|c| c()) {
            Some(LoopStatus::Busy) => self.config.poll_timeout,
            Some(LoopStatus::Idle) => self.config.idle_timeout,
            None if self.empty_turns.get() >= self.config.idle_turns => self.config.idle_timeout,
            None => self.config.poll_timeout,
        }
    }

    // ------------------------------------------------------------------
    // Driving the loop
    // ------------------------------------------------------------------

    /// How long the next poll may block
    fn clamp_wait(&self, wait: Duration) -> Duration {
        if !self.deferred.borrow().is_empty() {
            return Duration::ZERO;
        }
        match self.timers.next_deadline() {
            Some(deadline) => wait.min(deadline.saturating_duration_since(Instant::now())),
            None => wait,
        }
    }

    /// One turn: poll for up to `timeout`, then ready callbacks, deferred
    /// work and due timers
    ///
    /// Returns the number of ready descriptors.
    pub fn run_once(&self, timeout: Duration) -> CoResult<usize> {
        self.run_signals();

        let wait = self.clamp_wait(timeout);
        let mut ready = std::mem::take(&mut *self.ready.borrow_mut());
        ready.clear();
        let n = self.poller.borrow_mut().poll(Some(wait), &mut ready)?;

        for (token, readiness) in ready.iter() {
            let handle = self.handles.borrow().get(token).cloned();
            match handle {
                Some(handle) => handle.handle_event(*readiness),
                None => ktrace!("stale readiness for token {}", token),
            }
        }
        *self.ready.borrow_mut() = ready;

        let deferred = self.run_deferred();
        let fired = self.run_timers();

        if n == 0 && deferred == 0 && fired == 0 {
            self.empty_turns.set(self.empty_turns.get().saturating_add(1));
        } else {
            self.empty_turns.set(0);
        }
        self.iteration.set(self.iteration.get() + 1);
        Ok(n)
    }

    /// Run turns until `quit()` is called
    pub fn run(&self) -> CoResult<()> {
        self.quit.set(false);
        self.running.set(true);
        kdebug!("event loop running");

        let result = loop {
            if self.quit.get() {
                break Ok(());
            }
            let wait = self.base_wait();
            if let Err(e) = self.run_once(wait) {
                kerror!("event loop poll failed: {}", e);
                break Err(e);
            }
        };

        self.running.set(false);
        let stats = self.timers.stats();
        kdebug!(
            "event loop stopped after {} turns, timers fired {} cancelled {}",
            self.iteration.get(),
            stats.total_fired,
            stats.total_cancelled
        );
        result
    }

    /// Stop `run()` at the end of the current turn
    pub fn quit(&self) {
        self.quit.set(true);
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        for handle in self.handles.get_mut().values() {
            handle.detach();
            handle.clear_callbacks();
        }
        for (sig, _) in self.signals.get_mut().iter() {
            let _ = signal::uninstall(*sig);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn quiet_loop() -> Rc<EventLoop> {
        EventLoop::with_config(LoopConfig::new().poll_timeout(Duration::from_millis(5))).unwrap()
    }

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert_eq!(ret, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn test_timers_fire_in_deadline_order() {
        let el = quiet_loop();
        let log = Rc::new(RefCell::new(Vec::new()));
        let now = Instant::now();
        for (tag, ms) in [(3, 30), (1, 10), (2, 20), (4, 10)] {
            let l = log.clone();
            el.run_at(now + Duration::from_millis(ms), move || l.borrow_mut().push(tag));
        }
        let e = el.clone();
        el.run_after(Duration::from_millis(40), move || e.quit());
        el.run().unwrap();
        assert_eq!(*log.borrow(), vec![1, 4, 2, 3]);
    }

    #[test]
    fn test_cancelled_timer_never_runs() {
        let el = quiet_loop();
        let hit = Rc::new(Cell::new(false));
        let h = hit.clone();
        let id = el.run_after(Duration::from_millis(5), move || h.set(true));
        el.remove_timer(id);
        assert!(el.expired(id));

        let e = el.clone();
        el.run_after(Duration::from_millis(20), move || e.quit());
        el.run().unwrap();
        assert!(!hit.get());
        // Removing again, or after firing, is harmless.
        el.remove_timer(id);
        let stats = el.timer_stats();
        assert_eq!(stats.total_inserted, 2);
        assert_eq!(stats.total_fired, 1);
        assert_eq!(stats.total_cancelled, 1);
    }

    #[test]
    fn test_timer_cancelled_by_earlier_sibling() {
        let el = quiet_loop();
        let deadline = Instant::now() + Duration::from_millis(5);
        let hit = Rc::new(Cell::new(false));

        let victim = Rc::new(Cell::new(None));
        let e = el.clone();
        let v = victim.clone();
        el.run_at(deadline, move || {
            if let Some(id) = v.get() {
                e.remove_timer(id);
            }
        });
        let h = hit.clone();
        victim.set(Some(el.run_at(deadline, move || h.set(true))));

        std::thread::sleep(Duration::from_millis(10));
        el.run_once(Duration::ZERO).unwrap();
        assert!(!hit.get());
    }

    #[test]
    fn test_run_every_until_removed() {
        let el = quiet_loop();
        let count = Rc::new(Cell::new(0));
        let id_cell = Rc::new(Cell::new(None));

        let c = count.clone();
        let e = el.clone();
        let idc = id_cell.clone();
        let id = el.run_every(Duration::from_millis(2), move || {
            c.set(c.get() + 1);
            if c.get() == 3 {
                if let Some(id) = idc.get() {
                    e.remove_timer(id);
                }
                e.quit();
            }
        });
        id_cell.set(Some(id));
        assert!(!el.expired(id));

        el.run().unwrap();
        assert_eq!(count.get(), 3);
        assert!(el.expired(id));
    }

    #[test]
    fn test_deferred_runs_after_ready_callbacks() {
        let el = quiet_loop();
        let (r, w) = pipe();
        let log = Rc::new(RefCell::new(Vec::new()));

        let handle = el.new_handle(r).unwrap();
        let l = log.clone();
        let e = el.clone();
        handle.set_read_callback(move || {
            l.borrow_mut().push("read");
            let l2 = l.clone();
            e.queue_in_loop(move || l2.borrow_mut().push("deferred"));
        });
        handle.enable_reading();

        let l = log.clone();
        el.queue_in_loop(move || l.borrow_mut().push("queued-before"));
        unsafe { libc::write(w, b"x".as_ptr() as *const _, 1) };

        el.run_once(Duration::from_millis(100)).unwrap();
        assert_eq!(*log.borrow(), vec!["read", "queued-before", "deferred"]);

        handle.remove();
        el.run_once(Duration::ZERO).unwrap();
        assert_eq!(el.handle_count(), 0);
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn test_queue_during_drain_waits_a_turn() {
        let el = quiet_loop();
        let log = Rc::new(RefCell::new(Vec::new()));
        let l = log.clone();
        let e = el.clone();
        el.queue_in_loop(move || {
            let l2 = l.clone();
            e.queue_in_loop(move || l2.borrow_mut().push(2));
            l.borrow_mut().push(1);
        });
        el.run_once(Duration::ZERO).unwrap();
        assert_eq!(*log.borrow(), vec![1]);
        assert_eq!(el.pending_deferred(), 1);
        el.run_once(Duration::ZERO).unwrap();
        assert_eq!(*log.borrow(), vec![1, 2]);
    }

    #[test]
    fn test_remove_inside_own_callback() {
        let el = quiet_loop();
        let (r, w) = pipe();
        let handle = el.new_handle(r).unwrap();
        let weak = Rc::downgrade(&handle);
        let fired = Rc::new(Cell::new(0));

        let f = fired.clone();
        handle.set_read_callback(move || {
            f.set(f.get() + 1);
            if let Some(h) = weak.upgrade() {
                h.remove();
            }
        });
        handle.enable_reading();
        let weak = Rc::downgrade(&handle);
        drop(handle);

        unsafe { libc::write(w, b"xy".as_ptr() as *const _, 2) };
        el.run_once(Duration::from_millis(100)).unwrap();
        assert_eq!(fired.get(), 1);
        // Destroyed by the deferred queue of the same turn.
        assert!(weak.upgrade().is_none());

        el.run_once(Duration::ZERO).unwrap();
        assert_eq!(fired.get(), 1);
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn test_poll_timeout_clamped_to_timer() {
        let el = quiet_loop();
        el.run_after(Duration::from_millis(10), || {});
        let start = Instant::now();
        el.run_once(Duration::from_secs(5)).unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_trap_signal() {
        let el = quiet_loop();
        let caught = Rc::new(Cell::new(0));
        let c = caught.clone();
        let e = el.clone();
        el.trap_signal(Signal::SIGUSR1, move || {
            c.set(c.get() + 1);
            e.quit();
        })
        .unwrap();
        el.run_after(Duration::from_millis(5), || {
            let _ = nix::sys::signal::raise(Signal::SIGUSR1);
        });
        let e = el.clone();
        el.run_after(Duration::from_secs(2), move || e.quit());
        el.run().unwrap();
        assert_eq!(caught.get(), 1);
    }

    #[test]
    fn test_cron_controls_wait() {
        let el = EventLoop::with_config(
            LoopConfig::new()
                .poll_timeout(Duration::from_millis(1))
                .idle_timeout(Duration::from_secs(10)),
        )
        .unwrap();
        el.set_cron(|| LoopStatus::Busy);
        let e = el.clone();
        el.queue_in_loop(move || e.quit());
        let start = Instant::now();
        el.run().unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(el.iteration() >= 1);
    }
}
