//! Task-per-connection backend on the tokio runtime.
//!
//! Every accepted socket gets its own task owning its own
//! `ConnectionBuffer`, so buffer operations of two connections can never
//! interleave. The task applies the same policy as the mio handler: read at
//! most the free space, write back in chunks of at most `write_chunk`, and
//! hold the tail of a capped burst until the peer sends again.

mod handler;

pub use handler::handle_connection;

use crate::config::Config;
use crate::runtime::ConnSettings;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Listener plus the policy applied to each accepted connection.
pub struct Server {
    listener: TcpListener,
    settings: ConnSettings,
    connection_limit: Option<Arc<Semaphore>>,
}

impl Server {
    /// Bind to `addr`. `max_connections` caps open connections across the
    /// whole runtime; 0 means unbounded.
    pub async fn bind(addr: &str, settings: ConnSettings, max_connections: usize) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let connection_limit = match max_connections {
            0 => None,
            n => Some(Arc::new(Semaphore::new(n))),
        };

        Ok(Self {
            listener,
            settings,
            connection_limit,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` resolves, then abort every
    /// connection task still running.
    pub async fn serve(self, shutdown: impl Future<Output = ()>) -> io::Result<()> {
        let mut tasks = JoinSet::new();
        tokio::pin!(shutdown);

        info!(addr = %self.local_addr()?, "Server listening");

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };

                    let permit = match &self.connection_limit {
                        Some(limit) => match Arc::clone(limit).try_acquire_owned() {
                            Ok(permit) => Some(permit),
                            Err(_) => {
                                warn!(peer = %peer, "Connection limit reached");
                                continue;
                            }
                        },
                        None => None,
                    };

                    debug!(peer = %peer, "Accepted connection");
                    let settings = self.settings;
                    tasks.spawn(async move {
                        if let Err(e) = handle_connection(stream, settings).await {
                            debug!(peer = %peer, error = %e, "Connection error");
                        } else {
                            debug!(peer = %peer, "Connection closed");
                        }
                        drop(permit);
                    });
                }
            }
        }

        info!(open = tasks.len(), "Server shutting down");
        tasks.shutdown().await;
        Ok(())
    }
}

/// Run the tokio backend with `config.workers` runtime threads until Ctrl-C.
pub fn run(config: Config) -> io::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.workers)
        .thread_name("relay-worker")
        .enable_all()
        .build()?;

    info!(
        workers = config.workers,
        addr = %config.listen,
        buffer_capacity = config.buffer_capacity,
        write_chunk = config.write_chunk,
        "Starting tokio runtime"
    );

    let settings = ConnSettings {
        buffer_capacity: config.buffer_capacity,
        write_chunk: config.write_chunk,
    };

    runtime.block_on(async {
        let server = Server::bind(&config.listen, settings, config.max_connections).await?;
        server
            .serve(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!(error = %e, "Failed to listen for Ctrl-C");
                    std::future::pending::<()>().await;
                }
            })
            .await
    })
}
