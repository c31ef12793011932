//! TCP server: an acceptor plus ownership of the accepted connections

use crate::acceptor::TcpAcceptor;
use crate::connection::{ConnectionCallback, TcpConnection};
use costack_core::error::CoResult;
use costack_core::id::ConnectionId;
use costack_core::{kdebug, kwarn};
use costack_runtime::{EventLoop, NetConfig};
use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::rc::Rc;

pub struct TcpServer {
    event_loop: Rc<EventLoop>,
    config: NetConfig,
    acceptor: RefCell<Option<Rc<TcpAcceptor>>>,
    connections: RefCell<HashMap<ConnectionId, Rc<TcpConnection>>>,
    new_connection_cb: RefCell<Option<ConnectionCallback>>,
    read_cb: RefCell<Option<ConnectionCallback>>,
    close_cb: RefCell<Option<ConnectionCallback>>,
}

impl TcpServer {
    pub fn new(event_loop: &Rc<EventLoop>, config: NetConfig) -> Rc<Self> {
        Rc::new(TcpServer {
            event_loop: event_loop.clone(),
            config,
            acceptor: RefCell::new(None),
            connections: RefCell::new(HashMap::new()),
            new_connection_cb: RefCell::new(None),
            read_cb: RefCell::new(None),
            close_cb: RefCell::new(None),
        })
    }

    pub fn set_on_new_connection<F: Fn(&Rc<TcpConnection>) + 'static>(&self, f: F) {
        *self.new_connection_cb.borrow_mut() = Some(Rc::new(f));
    }

    /// Installed on every accepted connection
    pub fn set_on_read<F: Fn(&Rc<TcpConnection>) + 'static>(&self, f: F) {
        *self.read_cb.borrow_mut() = Some(Rc::new(f));
    }

    pub fn set_on_close<F: Fn(&Rc<TcpConnection>) + 'static>(&self, f: F) {
        *self.close_cb.borrow_mut() = Some(Rc::new(f));
    }

    /// Bind and start accepting; returns the bound address
    pub fn listen(self: &Rc<Self>, addr: SocketAddr) -> CoResult<SocketAddr> {
        let acceptor = TcpAcceptor::bind(&self.event_loop, addr, self.config.listen_backlog)?;
        let weak = Rc::downgrade(self);
        acceptor.set_on_accept(move |fd, peer| {
            if let Some(server) = weak.upgrade() {
                server.on_accept(fd, peer);
            }
        });
        let local = acceptor.local_addr();
        *self.acceptor.borrow_mut() = Some(acceptor);
        Ok(local)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.acceptor.borrow().as_ref().map(|a| a.local_addr())
    }

    pub fn connection_count(&self) -> usize {
        self.connections.borrow().len()
    }

    fn on_accept(self: &Rc<Self>, fd: RawFd, peer: SocketAddr) {
        let conn = match TcpConnection::new(&self.event_loop, fd, Some(peer), &self.config) {
            Ok(conn) => conn,
            Err(e) => {
                kwarn!("wrap accepted connection from {} failed: {}", peer, e);
                return;
            }
        };

        if let Some(cb) = self.read_cb.borrow().clone() {
            conn.set_on_read(move |c| cb(c));
        }
        let weak = Rc::downgrade(self);
        conn.set_on_close(move |conn| {
            if let Some(server) = weak.upgrade() {
                server.on_close(conn);
            }
        });
        self.connections.borrow_mut().insert(conn.id(), conn.clone());

        let cb = self.new_connection_cb.borrow().clone();
        if let Some(cb) = cb {
            cb(&conn);
        }
    }

    fn on_close(&self, conn: &Rc<TcpConnection>) {
        let removed = self.connections.borrow_mut().remove(&conn.id());
        assert!(removed.is_some(), "close of unknown {}", conn.id());
        kdebug!("{} from {} closed", conn.id(), conn.peer_addr());

        let cb = self.close_cb.borrow().clone();
        if let Some(cb) = cb {
            cb(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::TcpClient;
    use costack_runtime::LoopConfig;
    use std::cell::Cell;
    use std::time::Duration;

    fn quiet_loop() -> Rc<EventLoop> {
        EventLoop::with_config(LoopConfig::new().poll_timeout(Duration::from_millis(2))).unwrap()
    }

    #[test]
    fn test_echo_round_trip() {
        let el = quiet_loop();
        let server = TcpServer::new(&el, NetConfig::new());
        server.set_on_read(|conn| {
            let data = conn.read_all();
            conn.write(&data);
        });
        let addr = server.listen("127.0.0.1:0".parse().unwrap()).unwrap();
        assert_eq!(server.local_addr(), Some(addr));
        assert_ne!(addr.port(), 0);

        let client = TcpClient::new(&el, NetConfig::new());
        let echoed = Rc::new(RefCell::new(Vec::new()));
        let got = echoed.clone();
        let e = el.clone();
        client.set_on_connected(move |conn| {
            conn.write(b"PING");
            let got = got.clone();
            let e = e.clone();
            conn.set_on_read(move |conn| {
                got.borrow_mut().extend(conn.read_all());
                if got.borrow().len() >= 4 {
                    e.quit();
                }
            });
        });
        client.connect_to(addr, false);

        let e = el.clone();
        el.run_after(Duration::from_secs(5), move || e.quit());
        el.run().unwrap();
        assert_eq!(&*echoed.borrow(), b"PING");
        assert_eq!(server.connection_count(), 1);
        assert_eq!(client.connection_count(), 1);
    }

    #[test]
    fn test_server_sees_client_close() {
        let el = quiet_loop();
        let server = TcpServer::new(&el, NetConfig::new());
        let accepted = Rc::new(Cell::new(0));
        let closed = Rc::new(Cell::new(0));
        let a = accepted.clone();
        server.set_on_new_connection(move |_| a.set(a.get() + 1));
        let c = closed.clone();
        let e = el.clone();
        server.set_on_close(move |_| {
            c.set(c.get() + 1);
            e.quit();
        });
        let addr = server.listen("127.0.0.1:0".parse().unwrap()).unwrap();

        let client = TcpClient::new(&el, NetConfig::new());
        client.set_on_connected(|conn| conn.close());
        client.connect_to(addr, false);

        let e = el.clone();
        el.run_after(Duration::from_secs(5), move || e.quit());
        el.run().unwrap();
        assert_eq!(accepted.get(), 1);
        assert_eq!(closed.get(), 1);
        assert_eq!(server.connection_count(), 0);
    }
}
