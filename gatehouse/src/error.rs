use std::io;

use thiserror::Error;

/// Errors returned by the endpoint.
#[derive(Debug, Error)]
pub enum Error {
    /// Socket or file I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Readiness queue creation or rebuild failed.
    #[error("poller setup: {0}")]
    PollerSetup(String),
    /// TLS context construction from the configured material failed.
    #[error("TLS setup: {0}")]
    TlsSetup(String),
    /// TLS handshake with the peer failed. The connection is closed, no retry.
    #[error("TLS handshake failed")]
    HandshakeFailed,
    /// No free connection slots available.
    #[error("connection limit reached")]
    ConnectionLimitReached,
    /// The worker executor refused the task (queue full or shut down).
    /// Policy: the affected socket is closed.
    #[error("worker executor rejected the task")]
    WorkerRejected,
    /// Buffer pool byte cap exceeded or allocation refused.
    #[error("buffer allocation refused")]
    BufferExhausted,
    /// System resource limit too low (e.g., RLIMIT_NOFILE).
    #[error("{0}")]
    ResourceLimit(String),
    /// A read/write latch was used out of order.
    #[error("latch state: {0}")]
    LatchState(&'static str),
    /// Invalid configuration value.
    #[error("config: {0}")]
    Config(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
