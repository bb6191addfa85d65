//! echo-relay: a bounded-buffer TCP echo service
//!
//! Every byte a client sends comes back to that client, in order. Each
//! connection owns a small fixed-capacity buffer, so bytes are relayed in
//! bounded chunks no matter how much the peer sends at once.
//!
//! Features:
//! - Readiness event loop (mio) or task-per-connection (tokio) backend
//! - Configurable per-connection buffer capacity and write chunk size
//! - Optional connection limit
//! - Configuration via CLI arguments or TOML file

mod config;
mod runtime;

use config::{Config, RuntimeType};
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    match config.log_file {
        Some(ref path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .init();
        }
    }

    info!(
        listen = %config.listen,
        runtime = ?config.runtime,
        workers = config.workers,
        buffer_capacity = config.buffer_capacity,
        write_chunk = config.write_chunk,
        max_connections = config.max_connections,
        "Starting echo-relay"
    );

    match config.runtime {
        RuntimeType::Mio => info!("Using mio runtime (epoll/kqueue)"),
        RuntimeType::Tokio => info!("Using tokio runtime (task per connection)"),
    }

    runtime::run(config)?;
    Ok(())
}
