//! The accept loop and readiness scheduler (§4.D).
//!
//! One `mio::Poll`, one listener, one dense [`SlotTable`] of connections.
//! Token 0 belongs to the listener, token 1 to the single `Waker` shared by
//! every connection's pipe and child-exit helper threads (mio's own
//! contract wants at most one live `Waker` per `Poll`), and every
//! connection's socket token is derived from its stable identifier in
//! `Connection::accept` (`table.rs` explains why the identifier, not the
//! slot index, has to be the thing tokens are keyed on).

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, info, warn};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use socket2::{Domain, Socket, Type};

use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::table::SlotTable;

const LISTENER: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);
const CONN_BASE_TOKEN: usize = 2;
const EVENTS_CAPACITY: usize = 128;

pub struct Server {
    poll: Poll,
    listener: TcpListener,
    waker: Arc<Waker>,
    connections: SlotTable<Connection>,
    next_id: u64,
    recv_capacity: usize,
    send_capacity: usize,
}

impl Server {
    pub fn bind(config: &ServerConfig) -> io::Result<Server> {
        let addr: SocketAddr = (config.bind_addr, config.port).into();
        // mio's own `TcpListener::bind` doesn't expose a backlog; go through
        // socket2 (already in mio's own dependency tree for the same
        // purpose) to honor the protocol's stated backlog of 8.
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(config.backlog as i32)?;
        socket.set_nonblocking(true)?;
        let mut listener = TcpListener::from_std(socket.into());
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        info!(
            "ice9d listening on {addr}, max {} concurrent sessions",
            config.max_sessions
        );
        Ok(Server {
            poll,
            listener,
            waker,
            connections: SlotTable::new(config.max_sessions),
            next_id: 0,
            recv_capacity: config.recv_buffer_capacity,
            send_capacity: config.send_buffer_capacity,
        })
    }

    /// Runs the event loop forever. Only returns on a fatal `Poll::poll`
    /// error (e.g. the OS readiness facility itself failing).
    pub fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        loop {
            self.poll.poll(&mut events, None)?;

            let mut listener_ready = false;
            for event in events.iter() {
                if event.token() == LISTENER {
                    listener_ready = true;
                    continue;
                }
                if event.token() == WAKER_TOKEN {
                    // Carries no payload of its own; it exists purely to
                    // wake `poll` so the catch-up pass below notices
                    // whichever connection's helper thread finished.
                    continue;
                }
                if let Some(idx) = self
                    .connections
                    .position(|c| c.tokens().socket == event.token())
                {
                    let conn = self.connections.get_mut(idx).expect("index just found");
                    conn.on_socket_event(event.is_readable(), event.is_writable());
                }
            }

            if listener_ready {
                self.accept_ready();
            }

            self.service_connections();
        }
    }

    fn accept_ready(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.accept_one(stream, peer),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("accept failed: {e}");
                    return;
                }
            }
        }
    }

    fn accept_one(&mut self, stream: mio::net::TcpStream, peer: SocketAddr) {
        if self.connections.is_full() {
            // Capacity rejection (§4.D): accept then immediately close.
            warn!("rejecting connection from {peer}: at capacity ({} slots)", self.connections.capacity());
            drop(stream);
            return;
        }
        let id = self.next_id;
        self.next_id += 1;
        match Connection::accept(
            id,
            stream,
            self.poll.registry(),
            CONN_BASE_TOKEN,
            Arc::clone(&self.waker),
            self.recv_capacity,
            self.send_capacity,
        ) {
            Ok(conn) => {
                debug!("conn {id}: accepted from {peer}");
                self.connections.insert(conn);
            }
            Err(e) => warn!("conn {id}: failed to register with poll: {e}"),
        }
    }

    /// The per-tick fairness/backpressure-recovery sweep (§4.D): every
    /// connection gets a chance to make progress whether or not its own
    /// tokens fired this round, then destroyed slots are reaped and
    /// surviving sockets' registered interest is resynced.
    fn service_connections(&mut self) {
        for conn in self.connections.iter_mut() {
            conn.catch_up();
        }

        let mut i = 0;
        while i < self.connections.len() {
            if self.connections.get(i).expect("in bounds").ready_to_destroy() {
                let conn = self.connections.remove(i);
                debug!("conn {}: destroyed", conn.id());
                // conn drops here; its socket and (for a cleanly-drained
                // connection) already-idle pipe endpoints close normally.
            } else {
                i += 1;
            }
        }

        let registry = self.poll.registry();
        for conn in self.connections.iter_mut() {
            conn.sync_socket_interest(registry);
        }
    }
}
