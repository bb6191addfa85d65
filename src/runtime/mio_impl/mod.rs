//! mio-based event loop implementation.
//!
//! Readiness-based I/O using mio (epoll on Linux, kqueue on macOS).
//! Each worker thread runs its own `Dispatcher` with its own listener and
//! watch set; a connection stays on the loop that accepted it.

mod event_loop;

pub use event_loop::run;
