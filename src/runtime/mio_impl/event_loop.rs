//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! ## Held bytes
//!
//! A read pulls at most one buffer's worth of bytes. When a read comes back
//! capped, the rest stays in the socket until the next readable edge, and
//! that edge drains it together with whatever the peer sent since. A peer
//! that shuts down its write half triggers a full drain as well.

use crate::config::Config;
use crate::runtime::{ConnSettings, Connection};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// One readiness event, copied out of `Events` before dispatch.
#[derive(Debug, Clone, Copy)]
struct Readiness {
    token: Token,
    readable: bool,
    writable: bool,
    /// Peer shut down its write half.
    read_closed: bool,
}

/// Watch set entry for one accepted connection.
struct MioConnection {
    conn: Connection<TcpStream>,
    peer: SocketAddr,
    /// Interest currently registered with the poll.
    interest: Interest,
}

/// Loop-level settings taken from `Config`.
#[derive(Debug, Clone, Copy)]
pub struct DispatcherSettings {
    pub conn: ConnSettings,
    /// Connection limit, 0 for unbounded.
    pub max_connections: usize,
    pub events_capacity: usize,
}

impl From<&Config> for DispatcherSettings {
    fn from(config: &Config) -> Self {
        Self {
            conn: ConnSettings {
                buffer_capacity: config.buffer_capacity,
                write_chunk: config.write_chunk,
            },
            max_connections: config.max_connections,
            events_capacity: config.events_capacity,
        }
    }
}

/// Stops a running dispatcher from another thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    /// Ask the loop to return; every open connection is dropped on exit.
    pub fn shutdown(&self) -> io::Result<()> {
        self.flag.store(true, Ordering::Release);
        self.waker.wake()
    }
}

/// Owns the listening socket, the readiness source and the watch set.
///
/// Built by the startup routine and torn down when `run` returns.
pub struct Dispatcher {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    connections: Slab<MioConnection>,
    settings: DispatcherSettings,
    shutdown: Arc<AtomicBool>,
    waker: Arc<Waker>,
    worker_id: usize,
}

impl Dispatcher {
    /// Bind a listener on `addr` and set up the poll.
    pub fn bind(addr: SocketAddr, settings: DispatcherSettings) -> io::Result<Self> {
        let listener = create_listener_with_reuseport(addr)?;
        Self::with_listener(TcpListener::from_std(listener), settings)
    }

    fn with_listener(mut listener: TcpListener, settings: DispatcherSettings) -> io::Result<Self> {
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        let initial = match settings.max_connections {
            0 => 1024,
            n => n.min(1024),
        };

        Ok(Self {
            poll,
            events: Events::with_capacity(settings.events_capacity),
            listener,
            connections: Slab::with_capacity(initial),
            settings,
            shutdown: Arc::new(AtomicBool::new(false)),
            waker,
            worker_id: 0,
        })
    }

    fn worker(mut self, worker_id: usize) -> Self {
        self.worker_id = worker_id;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: Arc::clone(&self.shutdown),
            waker: Arc::clone(&self.waker),
        }
    }

    /// Run until shut down. Only a failing poll ends the loop with an error.
    pub fn run(&mut self) -> io::Result<()> {
        info!(
            worker = self.worker_id,
            addr = %self.local_addr()?,
            buffer_capacity = self.settings.conn.buffer_capacity,
            "Worker started"
        );

        loop {
            if let Err(e) = self.poll.poll(&mut self.events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            let mut ready = Vec::with_capacity(self.events.iter().count());
            for event in self.events.iter() {
                ready.push(Readiness {
                    token: event.token(),
                    readable: event.is_readable(),
                    writable: event.is_writable(),
                    read_closed: event.is_read_closed(),
                });
            }

            for readiness in ready {
                match readiness.token {
                    LISTENER_TOKEN => self.accept_connections(),
                    WAKER_TOKEN => {}
                    Token(conn_id) => self.handle_connection_event(conn_id, readiness),
                }
            }

            if self.shutdown.load(Ordering::Acquire) {
                info!(
                    worker = self.worker_id,
                    open = self.connections.len(),
                    "Worker shutting down"
                );
                return Ok(());
            }
        }
    }

    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let max = self.settings.max_connections;
                    if max != 0 && self.connections.len() >= max {
                        warn!(worker = self.worker_id, peer = %peer, "Connection limit reached");
                        continue;
                    }

                    let entry = self.connections.vacant_entry();
                    let conn_id = entry.key();
                    let mut conn = Connection::new(stream, self.settings.conn);

                    if let Err(e) = self.poll.registry().register(
                        conn.stream_mut(),
                        Token(conn_id),
                        Interest::READABLE,
                    ) {
                        error!(peer = %peer, error = %e, "Failed to register connection");
                        continue;
                    }
                    conn.activate();

                    entry.insert(MioConnection {
                        conn,
                        peer,
                        interest: Interest::READABLE,
                    });

                    debug!(worker = self.worker_id, conn_id, peer = %peer, "Accepted connection");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("Accept error: {}", e);
                    break;
                }
            }
        }
    }

    fn handle_connection_event(&mut self, conn_id: usize, readiness: Readiness) {
        let Some(entry) = self.connections.get_mut(conn_id) else {
            return;
        };

        let mut result = Ok(());
        if readiness.writable {
            result = entry.conn.on_writable();
        }
        if readiness.readable && result.is_ok() {
            result = entry.conn.on_readable(readiness.read_closed);
        }

        self.after_progress(conn_id, result);
    }

    /// Reconcile the registration with the handler's new state.
    fn after_progress(&mut self, conn_id: usize, result: io::Result<()>) {
        if let Err(e) = result {
            debug!(conn_id, error = %e, "Connection error");
            self.close_connection(conn_id);
            return;
        }

        let Some(entry) = self.connections.get_mut(conn_id) else {
            return;
        };

        let Some(interest) = entry.conn.interest() else {
            self.close_connection(conn_id);
            return;
        };

        if interest != entry.interest {
            if let Err(e) =
                self.poll
                    .registry()
                    .reregister(entry.conn.stream_mut(), Token(conn_id), interest)
            {
                debug!(conn_id, error = %e, "Reregister failed");
                self.close_connection(conn_id);
                return;
            }
            entry.interest = interest;
        }
    }

    fn close_connection(&mut self, conn_id: usize) {
        if let Some(mut entry) = self.connections.try_remove(conn_id) {
            let _ = self.poll.registry().deregister(entry.conn.stream_mut());
            debug!(
                worker = self.worker_id,
                conn_id,
                peer = %entry.peer,
                state = ?entry.conn.state(),
                discarded = entry.conn.buffered(),
                "Connection closed"
            );
        }
    }
}

/// Run the mio-based server with `config.workers` event loops.
pub fn run(config: Config) -> io::Result<()> {
    let addr: SocketAddr = config
        .listen
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let settings = DispatcherSettings::from(&config);

    info!(
        workers = config.workers,
        addr = %addr,
        buffer_capacity = config.buffer_capacity,
        write_chunk = config.write_chunk,
        "Starting mio runtime"
    );

    // Bind up front so address errors surface before any thread starts
    let dispatchers = (0..config.workers)
        .map(|worker_id| Ok::<_, io::Error>(Dispatcher::bind(addr, settings)?.worker(worker_id)))
        .collect::<io::Result<Vec<_>>>()?;
    let shutdown: Vec<ShutdownHandle> = dispatchers
        .iter()
        .map(Dispatcher::shutdown_handle)
        .collect();

    let mut handles = Vec::with_capacity(config.workers);

    for mut dispatcher in dispatchers {
        let worker_id = dispatcher.worker_id;
        let peers = shutdown.clone();

        let handle = thread::Builder::new()
            .name(format!("worker-{worker_id}"))
            .spawn(move || {
                if let Err(e) = dispatcher.run() {
                    error!(worker = worker_id, error = %e, "Worker failed");
                    // A failed loop takes the remaining ones down with it
                    for peer in &peers {
                        let _ = peer.shutdown();
                    }
                }
            })?;

        handles.push(handle);
    }

    // Wait for all workers
    for handle in handles {
        let _ = handle.join();
    }

    Ok(())
}

/// Create a TCP listener with SO_REUSEPORT for kernel load balancing.
fn create_listener_with_reuseport(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}
