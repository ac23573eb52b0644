use crate::connection::Connection;

/// Verdict returned by the protocol handler for one invocation.
///
/// The endpoint acts on this alone; it never inspects protocol bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// Keep-alive: re-arm the socket for read readiness.
    Open,
    /// Close the socket and recycle its resources.
    Closed,
    /// Long-poll / async: park the socket in the waiting set, no re-arm.
    /// The handler (or an external caller) resumes it later.
    Long,
    /// The async cycle ended; immediately re-dispatch with `Open` status.
    AsyncEnd,
}

/// Why an event-mode invocation is being delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketStatus {
    /// Readiness or explicit resume.
    Open,
    /// The endpoint is shutting down.
    Stop,
    /// The socket sat idle past its timeout.
    Timeout,
    /// The peer went away or a worker could not be scheduled.
    Disconnect,
    /// An unrecoverable socket error.
    Error,
}

/// Protocol-layer contract consumed by the endpoint.
///
/// One connection is never handed to two workers at once; every method
/// runs with exclusive access to the [`Connection`].
pub trait Handler: Send + Sync + 'static {
    /// Read-readiness dispatch with no status attached.
    fn process(&self, conn: &mut Connection) -> SocketState;

    /// Comet / event-mode dispatch.
    fn event(&self, conn: &mut Connection, status: SocketStatus) -> SocketState;

    /// Resumption of a parked async socket.
    ///
    /// Defaults to [`Handler::event`]; protocols that distinguish the
    /// async path override it.
    fn async_dispatch(&self, conn: &mut Connection, status: SocketStatus) -> SocketState {
        self.event(conn, status)
    }

    /// Release protocol-side resources when a socket is retired.
    fn release(&self, conn: &mut Connection);

    /// Drop any caches the handler keeps; called on memory pressure.
    fn release_caches(&self) {}
}
