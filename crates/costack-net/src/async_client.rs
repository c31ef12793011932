//! Runs application code in coroutines and routes reactor callbacks back
//! to the coroutine waiting on them
//!
//! ```text
//!   run_in_coroutine(body) ──► Coroutine ──► body(client, co)
//!                                              │ connect_to(addr, co)
//!        pending: [(addr, co, outcome)] ◄──────┤ push, dial, yield
//!                                              │
//!   TcpClient ── on_connected / on_connect_error
//!        first pending record for addr ──► outcome, resume(co)
//!
//!   TcpConnection ── on_message / on_write_done / on_closed
//!        established[conn id] ──► status gate ──► resume(co)
//! ```
//!
//! The client owns the coroutines it spawned and both record tables.
//! Connections only point back at their coroutine through a `Weak`. A
//! finished coroutine is dropped from the deferred queue, never while its
//! stack is still in use, whoever resumed it last.
//!
//! Pending connects to the same address are matched first in, first out:
//! the N-th completion for an address goes to the N-th oldest waiter, no
//! matter which socket actually completed. This is a fairness policy, not a
//! promise that sockets finish in the order they were dialled.

use crate::async_conn::AsyncTcpConnection;
use crate::client::TcpClient;
use crate::connection::TcpConnection;
use costack_core::id::{ConnectionId, CoroutineId};
use costack_core::state::{ConnStatus, CoroutineState};
use costack_core::{kdebug, ktrace};
use costack_runtime::coroutine::{self, yield_now, Coroutine};
use costack_runtime::{EventLoop, NetConfig};
use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};

struct PendingConnect {
    addr: SocketAddr,
    co: CoroutineId,
    outcome: Option<Rc<AsyncTcpConnection>>,
}

struct Established {
    co: CoroutineId,
    conn: Rc<AsyncTcpConnection>,
}

pub struct AsyncTcpClient {
    event_loop: Rc<EventLoop>,
    tcp_client: Rc<TcpClient>,
    coroutines: RefCell<HashMap<CoroutineId, Rc<Coroutine>>>,
    pending: RefCell<Vec<PendingConnect>>,
    established: RefCell<HashMap<ConnectionId, Established>>,
    self_ref: Weak<AsyncTcpClient>,
}

impl AsyncTcpClient {
    pub fn new(event_loop: &Rc<EventLoop>, config: NetConfig) -> Rc<Self> {
        let tcp_client = TcpClient::new(event_loop, config);
        let client = Rc::new_cyclic(|weak| AsyncTcpClient {
            event_loop: event_loop.clone(),
            tcp_client,
            coroutines: RefCell::new(HashMap::new()),
            pending: RefCell::new(Vec::new()),
            established: RefCell::new(HashMap::new()),
            self_ref: weak.clone(),
        });

        let weak = Rc::downgrade(&client);
        client.tcp_client.set_on_connected(move |conn| {
            if let Some(client) = weak.upgrade() {
                client.on_connected(conn);
            }
        });
        let weak = Rc::downgrade(&client);
        client.tcp_client.set_on_connect_error(move |addr| {
            if let Some(client) = weak.upgrade() {
                client.on_connect_error(addr);
            }
        });
        let weak = Rc::downgrade(&client);
        client.tcp_client.set_on_close(move |conn| {
            if let Some(client) = weak.upgrade() {
                client.on_closed(conn);
            }
        });
        client
    }

    #[inline]
    pub fn event_loop(&self) -> &Rc<EventLoop> {
        &self.event_loop
    }

    /// Coroutines spawned and not yet reaped
    pub fn coroutine_count(&self) -> usize {
        self.coroutines.borrow().len()
    }

    /// Connects still waiting for an outcome
    pub fn pending_connects(&self) -> usize {
        self.pending.borrow().len()
    }

    /// Open connections handed out by `connect_to`
    pub fn established_connections(&self) -> usize {
        self.established.borrow().len()
    }

    /// Spawn a coroutine running `body` and resume it once
    ///
    /// Called from inside another coroutine, the first resume is deferred to
    /// the loop, since coroutines cannot resume each other directly.
    pub fn run_in_coroutine<F>(&self, body: F) -> CoroutineId
    where
        F: FnOnce(&Rc<AsyncTcpClient>, &Rc<Coroutine>) + 'static,
    {
        let weak = self.self_ref.clone();
        let co = Coroutine::new(move || {
            if let (Some(client), Some(co)) = (weak.upgrade(), coroutine::current()) {
                body(&client, &co);
                client.schedule_reap(co.id());
            }
        });
        let id = co.id();
        self.coroutines.borrow_mut().insert(id, co);
        kdebug!("{} spawned", id);

        if coroutine::in_coroutine() {
            let weak = self.self_ref.clone();
            self.event_loop.queue_in_loop(move || {
                if let Some(client) = weak.upgrade() {
                    client.start(id);
                }
            });
        } else {
            self.start(id);
        }
        id
    }

    /// Connect to `addr`, parking `co` until the attempt finishes
    ///
    /// Returns `None` when the connect failed or timed out.
    ///
    /// # Panics
    ///
    /// When not called from inside `co`.
    pub fn connect_to(&self, addr: SocketAddr, co: &Rc<Coroutine>) -> Option<Rc<AsyncTcpConnection>> {
        assert_eq!(
            coroutine::current_id(),
            co.id(),
            "connect_to for {} called from {}",
            co.id(),
            coroutine::current_id()
        );
        self.pending.borrow_mut().push(PendingConnect {
            addr,
            co: co.id(),
            outcome: None,
        });
        self.tcp_client.connect_to(addr, false);
        yield_now();

        let entry = {
            let mut pending = self.pending.borrow_mut();
            let Some(index) = pending.iter().position(|p| p.addr == addr) else {
                panic!("{} resumed with no pending connect to {}", co.id(), addr);
            };
            pending.remove(index)
        };
        assert_eq!(
            entry.co,
            co.id(),
            "pending connect to {} of {} taken by {}",
            addr,
            entry.co,
            co.id()
        );
        entry.outcome
    }

    // ------------------------------------------------------------------
    // Coroutine bookkeeping
    // ------------------------------------------------------------------

    fn start(&self, id: CoroutineId) {
        let co = self.coroutines.borrow().get(&id).cloned();
        let Some(co) = co else {
            panic!("start of unknown {}", id);
        };
        co.resume();
    }

    /// Resume a coroutine parked on one of our callbacks
    fn resume_waiting(&self, co: &Rc<Coroutine>) {
        assert_eq!(
            co.state(),
            CoroutineState::Suspended,
            "{} woken while {}",
            co.id(),
            co.state()
        );
        co.resume();
    }

    /// Drop a finished coroutine once its stack is no longer in use
    fn schedule_reap(&self, id: CoroutineId) {
        let weak = self.self_ref.clone();
        self.event_loop.queue_in_loop(move || {
            if let Some(client) = weak.upgrade() {
                client.reap(id);
            }
        });
    }

    fn reap(&self, id: CoroutineId) {
        let removed = self.coroutines.borrow_mut().remove(&id);
        if removed.is_none() {
            return;
        }
        let left_open: Vec<Rc<AsyncTcpConnection>> = self
            .established
            .borrow()
            .values()
            .filter(|e| e.co == id && !e.conn.is_closed())
            .map(|e| e.conn.clone())
            .collect();
        for conn in left_open {
            kdebug!("{} left {} open, closing", id, conn.id());
            conn.connection().close();
        }
        kdebug!("{} reaped", id);
    }

    fn coroutine_of(&self, id: CoroutineId) -> Rc<Coroutine> {
        let co = self.coroutines.borrow().get(&id).cloned();
        match co {
            Some(co) => co,
            None => panic!("no coroutine {}", id),
        }
    }

    // ------------------------------------------------------------------
    // Reactor callbacks
    // ------------------------------------------------------------------

    fn on_connected(&self, conn: &Rc<TcpConnection>) {
        let weak = self.self_ref.clone();
        conn.set_on_read(move |conn| {
            if let Some(client) = weak.upgrade() {
                client.on_message(conn);
            }
        });
        let weak = self.self_ref.clone();
        conn.set_on_write_done(move |conn| {
            if let Some(client) = weak.upgrade() {
                client.on_write_done(conn);
            }
        });

        let addr = conn.peer_addr();
        let (index, co_id) = {
            let pending = self.pending.borrow();
            let Some(index) = pending.iter().position(|p| p.addr == addr) else {
                panic!("connected to {} with no pending connect", addr);
            };
            (index, pending[index].co)
        };
        let co = self.coroutine_of(co_id);
        let async_conn = Rc::new(AsyncTcpConnection::new(
            conn.clone(),
            self.event_loop.clone(),
            &co,
        ));
        self.pending.borrow_mut()[index].outcome = Some(async_conn.clone());

        let previous = self.established.borrow_mut().insert(
            conn.id(),
            Established {
                co: co_id,
                conn: async_conn,
            },
        );
        assert!(previous.is_none(), "{} established twice", conn.id());
        kdebug!("{} connected to {} for {}", conn.id(), addr, co_id);
        self.resume_waiting(&co);
    }

    fn on_connect_error(&self, addr: SocketAddr) {
        let co_id = {
            let pending = self.pending.borrow();
            let Some(entry) = pending.iter().find(|p| p.addr == addr) else {
                panic!("connect error for {} with no pending connect", addr);
            };
            entry.co
        };
        kdebug!("connect to {} failed for {}", addr, co_id);
        let co = self.coroutine_of(co_id);
        self.resume_waiting(&co);
    }

    fn on_closed(&self, conn: &Rc<TcpConnection>) {
        let record = self.established.borrow_mut().remove(&conn.id());
        let Some(record) = record else {
            panic!("close of unknown {}", conn.id());
        };
        let previous = record.conn.status();
        record.conn.set_status(ConnStatus::Closed);
        if previous == ConnStatus::Idle {
            return;
        }
        self.wake(&record.conn);
    }

    fn on_message(&self, conn: &Rc<TcpConnection>) {
        let async_conn = self.lookup(conn);
        if async_conn.status() == ConnStatus::WaitingMessage {
            self.wake(&async_conn);
        } else {
            ktrace!("{} has {} bytes, nobody reading", conn.id(), conn.cached_len());
        }
    }

    fn on_write_done(&self, conn: &Rc<TcpConnection>) {
        let async_conn = self.lookup(conn);
        if async_conn.status() == ConnStatus::WaitingWriteDone {
            self.wake(&async_conn);
        }
    }

    fn lookup(&self, conn: &Rc<TcpConnection>) -> Rc<AsyncTcpConnection> {
        let found = self.established.borrow().get(&conn.id()).map(|e| e.conn.clone());
        match found {
            Some(async_conn) => async_conn,
            None => panic!("event for unknown {}", conn.id()),
        }
    }

    fn wake(&self, async_conn: &AsyncTcpConnection) {
        let Some(co) = async_conn.coroutine() else {
            panic!("{} waited on by a dropped coroutine", async_conn.id());
        };
        self.resume_waiting(&co);
    }
}
