//! TCP client: a connector plus ownership of the connections it made
//!
//! Connects are started from the loop's deferred queue, so `connect_to`
//! never calls back before it returns. With auto-reconnect an address is
//! dialled again `reconnect_interval` after a failed attempt or a close.

use crate::connection::{ConnectionCallback, TcpConnection};
use crate::connector::{ConnectErrorCallback, TcpConnector};
use costack_core::id::ConnectionId;
use costack_core::{kdebug, kinfo, kwarn};
use costack_runtime::{EventLoop, NetConfig, TimerId};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};

pub struct TcpClient {
    event_loop: Rc<EventLoop>,
    config: NetConfig,
    connector: Rc<TcpConnector>,
    connections: RefCell<HashMap<ConnectionId, Rc<TcpConnection>>>,
    auto_reconnect: RefCell<HashSet<SocketAddr>>,
    reconnect_timers: RefCell<HashMap<SocketAddr, TimerId>>,
    connected_cb: RefCell<Option<ConnectionCallback>>,
    close_cb: RefCell<Option<ConnectionCallback>>,
    connect_error_cb: RefCell<Option<ConnectErrorCallback>>,
}

impl TcpClient {
    pub fn new(event_loop: &Rc<EventLoop>, config: NetConfig) -> Rc<Self> {
        let connector = TcpConnector::new(event_loop, config.connect_timeout);
        let client = Rc::new(TcpClient {
            event_loop: event_loop.clone(),
            config,
            connector,
            connections: RefCell::new(HashMap::new()),
            auto_reconnect: RefCell::new(HashSet::new()),
            reconnect_timers: RefCell::new(HashMap::new()),
            connected_cb: RefCell::new(None),
            close_cb: RefCell::new(None),
            connect_error_cb: RefCell::new(None),
        });

        let weak = Rc::downgrade(&client);
        client.connector.set_on_connected(move |fd, addr| {
            if let Some(client) = weak.upgrade() {
                client.on_connected(fd, addr);
            }
        });
        let weak = Rc::downgrade(&client);
        client.connector.set_on_error(move |addr| {
            if let Some(client) = weak.upgrade() {
                client.on_connect_error(addr);
            }
        });
        client
    }

    pub fn set_on_connected<F: Fn(&Rc<TcpConnection>) + 'static>(&self, f: F) {
        *self.connected_cb.borrow_mut() = Some(Rc::new(f));
    }

    pub fn set_on_close<F: Fn(&Rc<TcpConnection>) + 'static>(&self, f: F) {
        *self.close_cb.borrow_mut() = Some(Rc::new(f));
    }

    pub fn set_on_connect_error<F: Fn(SocketAddr) + 'static>(&self, f: F) {
        *self.connect_error_cb.borrow_mut() = Some(Rc::new(f));
    }

    /// Dial `addr` on the next drain of the deferred queue
    ///
    /// Passing `auto_reconnect = false` also stops any reconnecting that an
    /// earlier call enabled for `addr`.
    pub fn connect_to(self: &Rc<Self>, addr: SocketAddr, auto_reconnect: bool) {
        let connector = Rc::downgrade(&self.connector);
        self.event_loop.queue_in_loop(move || {
            if let Some(connector) = connector.upgrade() {
                connector.connect_to(addr);
            }
        });
        if auto_reconnect {
            self.auto_reconnect.borrow_mut().insert(addr);
        } else {
            self.remove_auto_reconnect(addr);
        }
    }

    /// Number of open connections owned by this client
    pub fn connection_count(&self) -> usize {
        self.connections.borrow().len()
    }

    pub fn connections(&self) -> Vec<Rc<TcpConnection>> {
        self.connections.borrow().values().cloned().collect()
    }

    fn on_connected(self: &Rc<Self>, fd: RawFd, addr: SocketAddr) {
        let conn = match TcpConnection::new(&self.event_loop, fd, Some(addr), &self.config) {
            Ok(conn) => conn,
            Err(e) => {
                kwarn!("wrap connection to {} failed: {}", addr, e);
                self.on_connect_error(addr);
                return;
            }
        };

        let weak = Rc::downgrade(self);
        conn.set_on_close(move |conn| {
            if let Some(client) = weak.upgrade() {
                client.on_close(conn);
            }
        });
        let previous = self.connections.borrow_mut().insert(conn.id(), conn.clone());
        assert!(previous.is_none(), "{} registered twice", conn.id());

        let cb = self.connected_cb.borrow().clone();
        if let Some(cb) = cb {
            cb(&conn);
        }
    }

    fn on_close(self: &Rc<Self>, conn: &Rc<TcpConnection>) {
        let removed = self.connections.borrow_mut().remove(&conn.id());
        assert!(removed.is_some(), "close of unknown {}", conn.id());
        kdebug!("connection to {} closed", conn.peer_addr());

        let cb = self.close_cb.borrow().clone();
        if let Some(cb) = cb {
            cb(conn);
        }
        self.maybe_reconnect(conn.peer_addr());
    }

    fn on_connect_error(self: &Rc<Self>, addr: SocketAddr) {
        let cb = self.connect_error_cb.borrow().clone();
        if let Some(cb) = cb {
            cb(addr);
        }
        self.maybe_reconnect(addr);
    }

    fn maybe_reconnect(self: &Rc<Self>, addr: SocketAddr) {
        if !self.auto_reconnect.borrow().contains(&addr) {
            kdebug!("not reconnecting to {}", addr);
            return;
        }
        kinfo!("reconnecting to {} in {:?}", addr, self.config.reconnect_interval);
        let weak: Weak<TcpClient> = Rc::downgrade(self);
        let timer = self.event_loop.run_after(self.config.reconnect_interval, move || {
            if let Some(client) = weak.upgrade() {
                client.reconnect_timers.borrow_mut().remove(&addr);
                client.connect_to(addr, true);
            }
        });
        if let Some(old) = self.reconnect_timers.borrow_mut().insert(addr, timer) {
            self.event_loop.remove_timer(old);
        }
    }

    fn remove_auto_reconnect(&self, addr: SocketAddr) {
        if self.auto_reconnect.borrow_mut().remove(&addr) {
            kdebug!("auto reconnect to {} removed", addr);
        }
        if let Some(timer) = self.reconnect_timers.borrow_mut().remove(&addr) {
            self.event_loop.remove_timer(timer);
        }
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        for (_, timer) in self.reconnect_timers.get_mut().drain() {
            self.event_loop.remove_timer(timer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket_ops;
    use costack_runtime::LoopConfig;
    use std::cell::Cell;
    use std::time::Duration;

    fn quiet_loop() -> Rc<EventLoop> {
        EventLoop::with_config(LoopConfig::new().poll_timeout(Duration::from_millis(2))).unwrap()
    }

    fn dead_addr() -> SocketAddr {
        let listener = socket_ops::listen(&"127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let addr = socket_ops::local_addr(listener).unwrap();
        socket_ops::close(listener);
        addr
    }

    #[test]
    fn test_connect_is_deferred() {
        let el = quiet_loop();
        let client = TcpClient::new(&el, NetConfig::new());
        let errors = Rc::new(Cell::new(0));
        let e = errors.clone();
        client.set_on_connect_error(move |_| e.set(e.get() + 1));

        client.connect_to(dead_addr(), false);
        assert_eq!(errors.get(), 0);
        assert_eq!(el.pending_deferred(), 1);
        for _ in 0..20 {
            el.run_once(Duration::from_millis(5)).unwrap();
        }
        assert_eq!(errors.get(), 1);
    }

    #[test]
    fn test_owns_connection_until_close() {
        let el = quiet_loop();
        let listener = socket_ops::listen(&"127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let addr = socket_ops::local_addr(listener).unwrap();

        let client = TcpClient::new(&el, NetConfig::new());
        let closed = Rc::new(Cell::new(false));
        let c = closed.clone();
        client.set_on_close(move |_| c.set(true));
        client.set_on_connected(|conn| conn.close());
        client.connect_to(addr, false);

        for _ in 0..50 {
            if closed.get() {
                break;
            }
            el.run_once(Duration::from_millis(5)).unwrap();
        }
        assert!(closed.get());
        assert_eq!(client.connection_count(), 0);
        socket_ops::close(listener);
    }

    #[test]
    fn test_auto_reconnect_retries() {
        let el = quiet_loop();
        let config = NetConfig::new().reconnect_interval(Duration::from_millis(5));
        let client = TcpClient::new(&el, config);
        let attempts = Rc::new(Cell::new(0));
        let a = attempts.clone();
        let weak = Rc::downgrade(&client);
        let addr = dead_addr();
        client.set_on_connect_error(move |addr| {
            a.set(a.get() + 1);
            if a.get() == 3 {
                if let Some(client) = weak.upgrade() {
                    client.connect_to(addr, false);
                }
            }
        });

        client.connect_to(addr, true);
        let e = el.clone();
        el.run_after(Duration::from_millis(300), move || e.quit());
        el.run().unwrap();
        // The third failure turned reconnecting off; its extra dial fails once more.
        assert_eq!(attempts.get(), 4);
    }
}
