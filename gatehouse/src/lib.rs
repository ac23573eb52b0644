//! gatehouse — connection-multiplexing TCP endpoint for Linux.
//!
//! A server-side front end that accepts inbound connections, optionally
//! terminates TLS, and multiplexes tens of thousands of idle keep-alive
//! sockets across a small number of readiness queues. Ready sockets are
//! dispatched to a worker pool running an opaque [`Handler`]; the handler
//! may keep a socket open (keep-alive), close it, park it for later
//! resumption (async / long-poll), or hand it to the kernel-assisted
//! sendfile engine.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use gatehouse::{ConfigBuilder, Connection, Endpoint, Handler, SocketState, SocketStatus};
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     fn process(&self, conn: &mut Connection) -> SocketState {
//!         let mut buf = [0u8; 4096];
//!         match conn.read(&mut buf) {
//!             Ok(0) => SocketState::Closed,
//!             Ok(n) => {
//!                 let _ = conn.write(&buf[..n]);
//!                 SocketState::Open
//!             }
//!             Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => SocketState::Open,
//!             Err(_) => SocketState::Closed,
//!         }
//!     }
//!     fn event(&self, _conn: &mut Connection, _status: SocketStatus) -> SocketState {
//!         SocketState::Closed
//!     }
//!     fn release(&self, _conn: &mut Connection) {}
//! }
//!
//! fn main() -> Result<(), gatehouse::Error> {
//!     let config = ConfigBuilder::new().port(7878).build()?;
//!     let endpoint = Endpoint::new(config, Arc::new(Echo))?;
//!     endpoint.start()?;
//!     std::thread::park();
//!     Ok(())
//! }
//! ```
//!
//! # Platform
//!
//! Linux only: the acceptor uses `accept4`, the sendfile engine uses
//! `sendfile(2)`, and the readiness queues are epoll via mio.

// ── Internal modules ────────────────────────────────────────────────
pub(crate) mod acceptor;
pub(crate) mod metrics;
pub(crate) mod poller;
pub(crate) mod pool;
pub(crate) mod worker;

// ── Public modules ──────────────────────────────────────────────────
pub mod buffer;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod handler;
pub mod sendfile;
pub mod tls;

// ── Re-exports ──────────────────────────────────────────────────────

/// Endpoint configuration.
pub use config::Config;
/// Builder for [`Config`] with discoverable methods and `build()` validation.
pub use config::ConfigBuilder;
/// TLS material and policy.
pub use config::TlsSettings;
/// Client certificate verification mode.
pub use config::VerifyMode;
/// Stable handle to a connection slot.
pub use connection::ConnRef;
/// One accepted socket with its buffers, flags, and optional TLS engine.
pub use connection::Connection;
/// The endpoint itself: lifecycle, observables, async resumption.
pub use endpoint::Endpoint;
/// Endpoint errors.
pub use error::Error;
/// Crate-wide result alias.
pub use error::Result;
/// Protocol-layer contract consumed by the endpoint.
pub use handler::Handler;
/// Verdict returned by the handler for one invocation.
pub use handler::SocketState;
/// Why an event-mode invocation is being delivered.
pub use handler::SocketStatus;
/// One file range headed for one socket.
pub use sendfile::SendfileJob;
/// Outcome of a TLS wrap/unwrap step.
pub use tls::TlsStatus;
