//! nxlite - a multi-process, event-driven HTTP/1.x server for static content.
//!
//! A master process binds the listening socket and forks one worker per
//! configured core; each worker runs its own single-threaded event loop,
//! memory pool, and response cache, and serves files straight off disk with
//! conditional-request and zero-copy support.
//!
//! # Process model
//!
//! - [`server::master`] binds, forks, and supervises workers, relaying
//!   `SIGHUP`/`SIGTERM` and respawning any worker that dies unexpectedly.
//! - [`server::worker`] runs one worker's accept loop and owns that
//!   worker's memory pool and response cache.
//! - the per-connection module inside [`server`] is the read/parse/handle/
//!   write state machine, one task per connection.
//!
//! # Ambient stack
//!
//! - [`config`] loads the `key=value` configuration file.
//! - [`logging`] wires up `tracing` and the access log.
//! - [`errors`] is the shared error taxonomy every fallible path reports
//!   through.

pub(crate) mod cache;
pub mod config;
pub(crate) mod errors;
pub(crate) mod file_service;
pub(crate) mod http {
    pub(crate) mod request;
    pub(crate) mod response;
    pub(crate) mod types;
}
pub mod logging;
pub(crate) mod pool;
pub mod server {
    pub(crate) mod connection;
    pub mod master;
    pub mod worker;
}

pub use crate::config::Configuration;
