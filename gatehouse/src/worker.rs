//! Worker dispatch.
//!
//! A bounded thread-pool executor runs [`SocketProcessor`] tasks. Each
//! task owns one connection for the duration of a handler invocation (the
//! per-slot mutex enforces this) and translates the returned
//! [`SocketState`] back into poller operations. The waiting-request set
//! and its sweeper implement the async parking protocol: whoever wins the
//! `remove` dispatches, nobody else.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::{debug, error, warn};

use crate::connection::{ops, ConnRef, Connection};
use crate::endpoint::Shared;
use crate::error::{Error, Result};
use crate::handler::{SocketState, SocketStatus};
use crate::metrics;
use crate::poller;

/// One unit of work: a connection plus an optional event status and the
/// readiness observed at dispatch time.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SocketProcessor {
    pub(crate) conn: ConnRef,
    pub(crate) status: Option<SocketStatus>,
    pub(crate) readable: bool,
    pub(crate) writable: bool,
}

impl SocketProcessor {
    pub(crate) fn run(self, shared: &Arc<Shared>) {
        let Some(slot) = shared.connections.slot(self.conn) else {
            return;
        };
        let mut guard = slot.state.lock();
        // The slot may have been recycled while this task sat in the queue.
        if shared.connections.slot(self.conn).is_none() {
            return;
        }
        self.run_locked(shared, &mut guard);
    }

    pub(crate) fn run_locked(self, shared: &Arc<Shared>, conn: &mut Connection) {
        // TLS handshake first; the handler only ever sees plaintext.
        let mut handshake = Ok(0);
        if let (Some(tls), Some(stream)) = (conn.tls.as_mut(), conn.stream.as_mut()) {
            if tls.is_handshaking() {
                handshake = tls.handshake(stream, self.readable, self.writable);
            }
        }
        match handshake {
            Ok(0) => {}
            Ok(needed) => {
                // The handshake is blocked on more I/O.
                if let Some(p) = shared.poller(conn.poller_id) {
                    p.add(self.conn, needed);
                }
                return;
            }
            Err(_) => {
                metrics::HANDSHAKE_FAILURES.increment();
                debug!(conn = self.conn.index, "TLS handshake failed");
                poller::cancelled_key_locked(shared, self.conn, conn, Some(SocketStatus::Disconnect));
                return;
            }
        }

        let state = match self.status {
            None => shared.handler.process(conn),
            Some(status) if conn.is_async() => shared.handler.async_dispatch(conn, status),
            Some(status) => shared.handler.event(conn, status),
        };

        let mut launch = false;
        match state {
            SocketState::Closed => {
                conn.set_comet(false);
                poller::cancelled_key_locked(shared, self.conn, conn, None);
            }
            SocketState::Open => {
                conn.set_async(false);
                if conn.sendfile.is_some() && shared.config.use_sendfile {
                    match crate::sendfile::add(shared, self.conn, conn) {
                        crate::sendfile::AddResult::Completed { keep_alive: true } => {
                            // Fully transmitted inline; rejoin keep-alive below.
                        }
                        crate::sendfile::AddResult::Completed { keep_alive: false } => {
                            conn.set_comet(false);
                            poller::cancelled_key_locked(shared, self.conn, conn, None);
                            return;
                        }
                        crate::sendfile::AddResult::Parked
                        | crate::sendfile::AddResult::Failed => return,
                    }
                }
                if conn.keep_alive_left > 0 {
                    conn.keep_alive_left -= 1;
                }
                if conn.keep_alive_left == 0 {
                    // Keep-alive budget exhausted.
                    conn.set_comet(false);
                    poller::cancelled_key_locked(shared, self.conn, conn, None);
                } else {
                    conn.access();
                    if let Some(p) = shared.poller(conn.poller_id) {
                        p.add(self.conn, ops::READ);
                    }
                }
            }
            SocketState::Long => {
                conn.set_async(true);
                conn.access();
                shared.waiting_requests.lock().insert(self.conn);
            }
            SocketState::AsyncEnd => {
                conn.access();
                launch = true;
            }
        }

        if launch {
            // Tail call through the executor; the relaunched task takes
            // the monitor once this invocation releases it.
            let next = SocketProcessor {
                conn: self.conn,
                status: Some(SocketStatus::Open),
                readable: false,
                writable: false,
            };
            if let Err(e) = shared.dispatch(next) {
                if shared.running() {
                    error!(conn = self.conn.index, "async relaunch failed: {e}");
                    poller::cancelled_key(shared, self.conn, Some(SocketStatus::Disconnect));
                }
            }
        }
    }
}

/// Submit a processor for `conn`. With `dispatch` the task goes through
/// the executor and a refusal is reported as `false`; without it the task
/// runs on the calling thread.
pub(crate) fn process_socket(
    shared: &Arc<Shared>,
    conn: ConnRef,
    status: Option<SocketStatus>,
    readable: bool,
    writable: bool,
    dispatch: bool,
) -> bool {
    let Some(slot) = shared.connections.slot(conn) else {
        return false;
    };
    // Will get set again on the next comet re-arm.
    slot.meta.set_comet_notify(false);
    let task = SocketProcessor {
        conn,
        status,
        readable,
        writable,
    };
    if dispatch {
        match shared.dispatch(task) {
            Ok(()) => true,
            Err(e) => {
                metrics::WORKER_REJECTIONS.increment();
                warn!(conn = conn.index, "socket processing request was rejected: {e}");
                false
            }
        }
    } else {
        task.run(shared);
        true
    }
}

/// Resume a parked async socket. Only the caller that wins the removal
/// from the waiting set dispatches; everybody else observes `false`.
pub(crate) fn process_socket_async(
    shared: &Arc<Shared>,
    conn: ConnRef,
    status: SocketStatus,
) -> bool {
    if !shared.waiting_requests.lock().remove(&conn) {
        return false;
    }
    if status == SocketStatus::Timeout {
        metrics::ASYNC_TIMEOUTS.increment();
    }
    let task = SocketProcessor {
        conn,
        status: Some(status),
        readable: false,
        writable: false,
    };
    match shared.dispatch(task) {
        Ok(()) => true,
        Err(e) => {
            metrics::WORKER_REJECTIONS.increment();
            warn!(conn = conn.index, "async resume rejected: {e}");
            poller::cancelled_key(shared, conn, Some(SocketStatus::Disconnect));
            false
        }
    }
}

// ── Executor ─────────────────────────────────────────────────────────

/// Bounded thread-pool executor. A full queue rejects the dispatch; the
/// caller closes the socket.
pub(crate) struct Executor {
    threads: Vec<JoinHandle<()>>,
}

impl Executor {
    /// Spawn `threads` workers draining a queue of depth `queue`. Returns
    /// the executor (owning the threads) and the submission handle stored
    /// in [`Shared`].
    pub(crate) fn start(
        shared: &Arc<Shared>,
        threads: usize,
        queue: usize,
    ) -> (Self, Sender<SocketProcessor>) {
        let (tx, rx) = bounded::<SocketProcessor>(queue);
        let mut handles = Vec::with_capacity(threads);
        for id in 0..threads {
            let shared = shared.clone();
            let rx: Receiver<SocketProcessor> = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("gatehouse-worker-{id}"))
                .spawn(move || {
                    while let Ok(task) = rx.recv() {
                        task.run(&shared);
                    }
                })
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }
        (Self { threads: handles }, tx)
    }

    /// Join all workers. The submission handle must have been dropped
    /// first so the queues drain and close.
    pub(crate) fn shutdown(self) {
        for handle in self.threads {
            let _ = handle.join();
        }
    }
}

/// Try to enqueue without blocking. A full queue and a torn-down
/// executor are both rejections; the caller closes the socket.
pub(crate) fn try_dispatch(tx: &Sender<SocketProcessor>, task: SocketProcessor) -> Result<()> {
    match tx.try_send(task) {
        Ok(()) => Ok(()),
        Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
            Err(Error::WorkerRejected)
        }
    }
}

// ── Async timeout sweeper ────────────────────────────────────────────

/// Background thread firing TIMEOUT on parked async sockets that sat idle
/// past their deadline.
pub(crate) fn run_async_timeout(shared: Arc<Shared>) {
    while shared.running() {
        thread::sleep(Duration::from_secs(1));
        let now = shared.connections.now_ms();
        let snapshot: Vec<ConnRef> = shared.waiting_requests.lock().iter().copied().collect();
        for conn in snapshot {
            let Some(slot) = shared.connections.slot(conn) else {
                // Recycled while parked; drop the stale entry.
                shared.waiting_requests.lock().remove(&conn);
                continue;
            };
            let timeout = shared.effective_timeout(slot.meta.timeout_ms());
            if timeout < 0 {
                continue;
            }
            if now.saturating_sub(slot.meta.last_access()) > timeout as u64 {
                process_socket_async(&shared, conn, SocketStatus::Timeout);
            }
        }
        while shared.paused() && shared.running() {
            thread::sleep(Duration::from_secs(1));
        }
    }
}
