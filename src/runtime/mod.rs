//! Connection runtime for the echo relay.
//!
//! Two interchangeable backends drive connections:
//! - `mio_impl`: readiness event loops (epoll/kqueue) with an explicit
//!   per-connection state machine, one loop per worker thread
//! - `tokio_impl`: one tokio task per connection
//!
//! Both share common abstractions:
//! - `ConnectionBuffer`: fixed-capacity FIFO owned by one connection
//! - `ConnSettings`: buffer capacity and write chunk size
//! - `Connection`: non-blocking handler and state machine (mio backend)

mod buffer;
mod connection;
pub mod mio_impl;
pub mod tokio_impl;

pub(crate) use buffer::ConnectionBuffer;
pub(crate) use connection::{ConnSettings, Connection};

use crate::config::{Config, RuntimeType};

/// Run the relay with the configured backend.
pub fn run(config: Config) -> std::io::Result<()> {
    match config.runtime {
        RuntimeType::Mio => mio_impl::run(config),
        RuntimeType::Tokio => tokio_impl::run(config),
    }
}
