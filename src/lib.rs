//! sluice is a forward HTTP/1.x proxy with a validating response cache.
//!
//! The proxy terminates client connections, resolves upstream hostnames on a
//! worker pool off the I/O path, opens (or reuses) an upstream connection,
//! streams the response back and opportunistically serves repeat requests
//! from a response cache revalidated against the origin with conditional
//! GETs. `CONNECT` requests switch the session into an opaque tunnel.
//!
//! Everything network-facing runs on one reactor thread built on [`mio`]:
//! socket readiness, one-shot idle timers and a cross-thread wake-up used by
//! the resolver workers to post their answers back. Sessions own their
//! sockets, parsers and write queues; no connection state is ever touched
//! from another thread.

pub mod buffer;
pub mod cache;
pub mod parser;
pub mod ready;
pub mod resolver;
pub mod server;
pub mod session;
pub mod socket;
pub mod timer;

use std::io;

use thiserror::Error;

/// Upper bound on state machine turns per event batch, to surface infinite
/// loop bugs instead of spinning forever.
pub const MAX_LOOP_ITERATIONS: usize = 100_000;

/// Read chunk size for both directions of a session.
pub const BUFFER_SIZE: usize = 16_384;

/// Errors that terminate the whole process, as opposed to a single session.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("could not create the event loop: {0}")]
    Poll(io::Error),
    #[error("could not bind and listen on {address}: {error}")]
    Listen { address: String, error: io::Error },
    #[error("could not create the resolver wake-up handle: {0}")]
    Waker(io::Error),
    #[error("event loop failure: {0}")]
    Run(io::Error),
}
