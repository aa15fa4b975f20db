//! mio event loop.
//!
//! Readiness-based model: poll tells us when sockets are ready, then we
//! perform non-blocking read/write syscalls. Uses epoll on Linux, kqueue on
//! macOS.
//!
//! Everything runs on one thread. Sockets are edge-triggered: the listener
//! is drained until `accept` would block, and a connection until `read`
//! would block or its per-event budget runs out. Connections left with input
//! are resumed after the other events of the same pass, and the next poll
//! does not wait while any remain. Write interest is only registered while a
//! connection has a backlog.

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::runtime::relay::Relay;

const LISTENER_TOKEN: Token = Token(usize::MAX);
const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// Stops a running `Server` from another thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    requested: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.requested.store(true, Ordering::SeqCst);
        if let Err(e) = self.waker.wake() {
            error!(error = %e, "Failed to wake event loop");
        }
    }
}

/// The relay server: a listener, a poller and every connection.
pub struct Server {
    poll: Poll,
    listener: TcpListener,
    relay: Relay<TcpStream>,
    shutdown: ShutdownHandle,
    local_addr: SocketAddr,
    events_capacity: usize,
}

impl Server {
    /// Bind the listening socket and prepare the poller.
    pub fn bind(config: &Config) -> io::Result<Self> {
        let poll = Poll::new()?;

        let listener = create_listener(config.listen, config.backlog)?;
        let mut listener = TcpListener::from_std(listener);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let local_addr = listener.local_addr()?;

        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let shutdown = ShutdownHandle {
            requested: Arc::new(AtomicBool::new(false)),
            waker: Arc::new(waker),
        };

        info!(
            addr = %local_addr,
            max_clients = config.max_clients,
            max_message_len = config.max_message_len,
            max_name_len = config.max_name_len,
            "Listening"
        );

        Ok(Self {
            poll,
            listener,
            relay: Relay::new(config),
            shutdown,
            local_addr,
            events_capacity: config.events_capacity,
        })
    }

    /// Address actually bound, useful when listening on port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Serve until shutdown is requested.
    ///
    /// Only a failure of the poller itself ends the loop with an error;
    /// per-connection failures release that connection and nothing else.
    pub fn run(mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(self.events_capacity);

        loop {
            let timeout = if self.relay.has_ready() {
                Some(Duration::ZERO)
            } else {
                None
            };
            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_connections(),
                    WAKER_TOKEN => {
                        if self.shutdown.requested.load(Ordering::SeqCst) {
                            let closed = self.relay.shutdown();
                            self.sync_interest();
                            info!(connections = closed, "Shut down");
                            return Ok(());
                        }
                    }
                    Token(slot) => {
                        if event.is_readable() || event.is_read_closed() || event.is_error() {
                            self.relay.on_readable(slot);
                        }
                        if event.is_writable() {
                            self.relay.on_writable(slot);
                        }
                    }
                }
            }

            self.relay.resume_ready();
            self.sync_interest();
        }
    }

    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => match self.relay.admit(stream, Some(peer)) {
                    Ok(slot) => {
                        let Some(conn) = self.relay.registry_mut().get_mut(slot) else {
                            continue;
                        };
                        if let Err(e) = self.poll.registry().register(
                            conn.stream_mut(),
                            Token(slot),
                            Interest::READABLE,
                        ) {
                            self.relay.release(slot, e.into());
                        }
                    }
                    Err(e) => warn!(
                        peer = %peer,
                        clients = self.relay.registry().len(),
                        error = %e,
                        "Rejected connection"
                    ),
                },
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("Accept error: {}", e);
                    break;
                }
            }
        }
    }

    /// Apply the bookkeeping the relay left behind: write interest for
    /// connections whose backlog changed, deregistration for released ones.
    fn sync_interest(&mut self) {
        for slot in self.relay.take_dirty() {
            let Some(conn) = self.relay.registry_mut().get_mut(slot) else {
                continue;
            };
            let want_write = conn.has_pending_output();
            if want_write == conn.write_interest {
                continue;
            }
            let interest = if want_write {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            let result = self
                .poll
                .registry()
                .reregister(conn.stream_mut(), Token(slot), interest);
            match result {
                Ok(()) => conn.write_interest = want_write,
                Err(e) => self.relay.release(slot, e.into()),
            }
        }

        let closed = self.relay.take_closed();
        if closed.is_empty() {
            return;
        }
        for mut conn in closed {
            // Never registered if registration itself failed
            let _ = self.poll.registry().deregister(conn.stream_mut());
            debug!(conn_id = conn.id(), "Closed");
        }
        if self.relay.registry().is_empty() {
            debug!("No clients connected");
        }
    }
}

fn create_listener(addr: SocketAddr, backlog: u32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog.min(i32::MAX as u32) as i32)?;

    Ok(socket.into())
}
