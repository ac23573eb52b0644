//! Kernel-assisted file transmission.
//!
//! The fast path runs `sendfile(2)` inline until the range is exhausted
//! or the socket pushes back with EAGAIN; pushed-back jobs park on a
//! dedicated write-readiness poller. Completion with `keep_alive`
//! re-enters the primary poller with READ interest, rejoining the
//! keep-alive pool.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mio::{Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, error, trace};

use crate::connection::{ops, ConnRef, Connection, Registered};
use crate::endpoint::Shared;
use crate::handler::SocketStatus;
use crate::metrics;
use crate::poller::{cancelled_key, cancelled_key_locked, WAKE_TOKEN};

/// One file range headed for one socket. Created by the handler, consumed
/// by the engine; the descriptor closes when the job drops.
#[derive(Debug)]
pub struct SendfileJob {
    /// Path of the file to transmit.
    pub file_name: PathBuf,
    pub(crate) file: Option<File>,
    /// Current offset.
    pub pos: u64,
    /// One past the last byte to send.
    pub end: u64,
    /// Re-enter the keep-alive pool when the range completes.
    pub keep_alive: bool,
}

impl SendfileJob {
    pub fn new(file_name: impl Into<PathBuf>, start: u64, length: u64, keep_alive: bool) -> Self {
        Self {
            file_name: file_name.into(),
            file: None,
            pos: start,
            end: start + length,
            keep_alive,
        }
    }

    /// Bytes left to transmit.
    pub fn remaining(&self) -> u64 {
        self.end.saturating_sub(self.pos)
    }
}

enum Pump {
    Complete { keep_alive: bool },
    Again,
    NoJob,
    Error(io::Error),
}

/// Push file bytes at the socket until done or EAGAIN.
fn pump(conn: &mut Connection) -> Pump {
    let Some(job) = conn.sendfile.as_mut() else {
        return Pump::NoJob;
    };
    if job.file.is_none() {
        match File::open(&job.file_name) {
            Ok(file) => job.file = Some(file),
            Err(e) => return Pump::Error(e),
        }
    }
    let Some(stream) = conn.stream.as_ref() else {
        return Pump::Error(io::ErrorKind::NotConnected.into());
    };
    let sock_fd = stream.as_raw_fd();
    let file_fd = job.file.as_ref().map(|f| f.as_raw_fd()).unwrap_or(-1);
    let keep_alive = job.keep_alive;

    loop {
        let remaining = job.end.saturating_sub(job.pos);
        if remaining == 0 {
            break;
        }
        let mut offset = job.pos as libc::off_t;
        let sent = unsafe { libc::sendfile(sock_fd, file_fd, &mut offset, remaining as usize) };
        if sent > 0 {
            job.pos += sent as u64;
            continue;
        }
        if sent == 0 {
            return Pump::Error(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "file shorter than the sendfile range",
            ));
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EAGAIN) => return Pump::Again,
            Some(libc::EINTR) => continue,
            _ => return Pump::Error(err),
        }
    }
    conn.sendfile = None;
    Pump::Complete { keep_alive }
}

/// Outcome of the inline add.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AddResult {
    /// The whole range went out synchronously.
    Completed { keep_alive: bool },
    /// The socket pushed back; the job is parked on a sendfile poller.
    Parked,
    /// I/O failed; the connection has been cancelled.
    Failed,
}

/// Inline fast path: transmit as much as the socket takes, park the rest.
pub(crate) fn add(shared: &Arc<Shared>, conn_ref: ConnRef, conn: &mut Connection) -> AddResult {
    match pump(conn) {
        Pump::Complete { keep_alive } => {
            metrics::SENDFILE_COMPLETED.increment();
            AddResult::Completed { keep_alive }
        }
        Pump::NoJob => AddResult::Completed { keep_alive: true },
        Pump::Again => {
            conn.access();
            park(shared, conn_ref, conn);
            AddResult::Parked
        }
        Pump::Error(e) => {
            metrics::SENDFILE_ERRORS.increment();
            debug!(conn = conn_ref.index, "sendfile failed: {e}");
            cancelled_key_locked(shared, conn_ref, conn, Some(SocketStatus::Error));
            AddResult::Failed
        }
    }
}

/// Continuation driven by the primary poller when readiness fires on a
/// connection that still carries a job.
pub(crate) fn process_ready(
    shared: &Arc<Shared>,
    conn_ref: ConnRef,
    conn: &mut Connection,
    reg: bool,
    event: bool,
) {
    match pump(conn) {
        Pump::Complete { keep_alive } => {
            metrics::SENDFILE_COMPLETED.increment();
            trace!(conn = conn_ref.index, event, "sendfile complete");
            if keep_alive {
                if reg {
                    conn.access();
                    if let Some(poller) = shared.poller(conn.poller_id) {
                        poller.add(conn_ref, ops::READ);
                    }
                }
            } else {
                cancelled_key_locked(shared, conn_ref, conn, Some(SocketStatus::Stop));
            }
        }
        Pump::NoJob => {}
        Pump::Again => {
            conn.access();
            if reg {
                park(shared, conn_ref, conn);
            }
        }
        Pump::Error(e) => {
            metrics::SENDFILE_ERRORS.increment();
            debug!(conn = conn_ref.index, "sendfile failed: {e}");
            cancelled_key_locked(shared, conn_ref, conn, Some(SocketStatus::Error));
        }
    }
}

/// Move a pushed-back connection onto a sendfile poller.
fn park(shared: &Arc<Shared>, conn_ref: ConnRef, conn: &mut Connection) {
    let interest = conn.meta().interest();
    if conn.registered == Registered::Main {
        if let (Some(poller), Some(stream)) = (shared.poller(conn.poller_id), conn.stream.as_mut())
        {
            if let Err(e) = poller.deregister_stream(stream) {
                debug!(conn = conn_ref.index, "deregister before park failed: {e}");
            }
            poller.adjust_key_count(interest, 0);
        }
        conn.registered = Registered::No;
    } else if interest != 0 {
        if let Some(poller) = shared.poller(conn.poller_id) {
            poller.adjust_key_count(interest, 0);
        }
    }
    conn.meta().set_interest(0);

    let engine = shared.sendfile.read().clone();
    match engine {
        Some(engine) => engine.next().enqueue(conn_ref),
        None => {
            // use_sendfile is off and the handler attached a job anyway.
            error!(conn = conn_ref.index, "no sendfile poller available");
            cancelled_key_locked(shared, conn_ref, conn, Some(SocketStatus::Error));
        }
    }
}

/// Drop a connection's sendfile-poller registration during cancellation.
pub(crate) fn forget(shared: &Arc<Shared>, id: usize, conn_ref: ConnRef, conn: &mut Connection) {
    let engine = shared.sendfile.read().clone();
    let Some(engine) = engine else {
        return;
    };
    let Some(sp) = engine.pollers.get(id) else {
        return;
    };
    if let Some(stream) = conn.stream.as_mut() {
        if let Err(e) = sp.registry.read().deregister(stream) {
            debug!(conn = conn_ref.index, "sendfile deregister failed: {e}");
        }
    }
    if sp.attached.lock().remove(&conn_ref.index).is_some() {
        sp.count.fetch_sub(1, Ordering::AcqRel);
        metrics::SENDFILE_ACTIVE.decrement();
    }
}

// ── Sendfile pollers ─────────────────────────────────────────────────

pub(crate) struct SendfileEngine {
    pollers: Vec<Arc<SendfilePoller>>,
    rr: AtomicUsize,
}

impl SendfileEngine {
    pub(crate) fn new(pollers: Vec<Arc<SendfilePoller>>) -> Arc<Self> {
        Arc::new(Self {
            pollers,
            rr: AtomicUsize::new(0),
        })
    }

    fn next(&self) -> &Arc<SendfilePoller> {
        let i = self.rr.fetch_add(1, Ordering::AcqRel) % self.pollers.len();
        &self.pollers[i]
    }

    /// Jobs currently parked across all sendfile pollers.
    pub(crate) fn count(&self) -> usize {
        self.pollers.iter().map(|p| p.count()).sum()
    }

    pub(crate) fn destroy(&self) {
        for poller in &self.pollers {
            poller.destroy();
        }
    }
}

pub(crate) struct SendfilePoller {
    pub(crate) id: usize,
    add_queue: Mutex<Vec<ConnRef>>,
    cv: Condvar,
    close: AtomicBool,
    count: AtomicUsize,
    attached: Mutex<HashMap<u32, u32>>,
    registry: RwLock<Registry>,
    waker: RwLock<Arc<Waker>>,
    next_expiration: AtomicU64,
}

impl SendfilePoller {
    pub(crate) fn new(id: usize, poll: &Poll) -> io::Result<Arc<Self>> {
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        Ok(Arc::new(Self {
            id,
            add_queue: Mutex::new(Vec::new()),
            cv: Condvar::new(),
            close: AtomicBool::new(false),
            count: AtomicUsize::new(0),
            attached: Mutex::new(HashMap::new()),
            registry: RwLock::new(registry),
            waker: RwLock::new(Arc::new(waker)),
            next_expiration: AtomicU64::new(0),
        }))
    }

    pub(crate) fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    fn is_closing(&self) -> bool {
        self.close.load(Ordering::Acquire)
    }

    pub(crate) fn destroy(&self) {
        self.close.store(true, Ordering::Release);
        self.cv.notify_all();
        let _ = self.waker.read().wake();
    }

    fn enqueue(&self, conn: ConnRef) {
        self.add_queue.lock().push(conn);
        self.cv.notify_one();
        let _ = self.waker.read().wake();
    }

    fn register_parked(&self, shared: &Arc<Shared>, conn_ref: ConnRef) {
        let Some(slot) = shared.connections.slot(conn_ref) else {
            return;
        };
        let mut conn = slot.state.lock();
        let Some(stream) = conn.stream.as_mut() else {
            return;
        };
        let token = Token(conn_ref.index as usize);
        match self
            .registry
            .read()
            .register(stream, token, Interest::WRITABLE)
        {
            Ok(()) => {
                conn.registered = Registered::Sendfile(self.id);
                self.attached.lock().insert(conn_ref.index, conn_ref.generation);
                self.count.fetch_add(1, Ordering::AcqRel);
                metrics::SENDFILE_ACTIVE.increment();
            }
            Err(e) => {
                error!(conn = conn_ref.index, "sendfile register failed: {e}");
                cancelled_key_locked(shared, conn_ref, &mut conn, Some(SocketStatus::Error));
            }
        }
    }

    /// Write readiness on a parked job.
    fn process_parked(&self, shared: &Arc<Shared>, conn_ref: ConnRef) {
        let Some(slot) = shared.connections.slot(conn_ref) else {
            self.attached.lock().remove(&conn_ref.index);
            return;
        };
        let mut conn = slot.state.lock();
        match pump(&mut conn) {
            Pump::Complete { keep_alive } => {
                self.unregister(conn_ref, &mut conn);
                metrics::SENDFILE_COMPLETED.increment();
                if keep_alive {
                    // Rejoin the keep-alive pool on the primary poller.
                    if let Some(poller) = shared.poller(conn.poller_id) {
                        conn.access();
                        poller.add(conn_ref, ops::READ);
                    }
                } else {
                    cancelled_key_locked(shared, conn_ref, &mut conn, Some(SocketStatus::Stop));
                }
            }
            Pump::Again => {
                conn.access();
            }
            Pump::NoJob => {
                self.unregister(conn_ref, &mut conn);
            }
            Pump::Error(e) => {
                metrics::SENDFILE_ERRORS.increment();
                debug!(conn = conn_ref.index, "sendfile failed: {e}");
                cancelled_key_locked(shared, conn_ref, &mut conn, Some(SocketStatus::Error));
            }
        }
    }

    fn unregister(&self, conn_ref: ConnRef, conn: &mut Connection) {
        if let Some(stream) = conn.stream.as_mut() {
            if let Err(e) = self.registry.read().deregister(stream) {
                debug!(conn = conn_ref.index, "sendfile deregister failed: {e}");
            }
        }
        conn.registered = Registered::No;
        if self.attached.lock().remove(&conn_ref.index).is_some() {
            self.count.fetch_sub(1, Ordering::AcqRel);
            metrics::SENDFILE_ACTIVE.decrement();
        }
    }

    /// Expire parked jobs whose client stopped reading.
    fn maintain(&self, shared: &Arc<Shared>) {
        let now = shared.connections.now_ms();
        if now < self.next_expiration.load(Ordering::Acquire) {
            return;
        }
        self.next_expiration
            .store(now + shared.config.timeout_interval, Ordering::Release);
        let snapshot: Vec<ConnRef> = self
            .attached
            .lock()
            .iter()
            .map(|(&index, &generation)| ConnRef { index, generation })
            .collect();
        for conn_ref in snapshot {
            let Some(slot) = shared.connections.slot(conn_ref) else {
                self.attached.lock().remove(&conn_ref.index);
                continue;
            };
            let timeout = shared.effective_timeout(slot.meta.timeout_ms());
            if timeout < 0 {
                continue;
            }
            if now.saturating_sub(slot.meta.last_access()) > timeout as u64 {
                cancelled_key(shared, conn_ref, Some(SocketStatus::Timeout));
            }
        }
    }
}

/// The sendfile poller thread body: same event/timeout skeleton as the
/// primary poller, adapted to write readiness.
pub(crate) fn run_sendfile(shared: Arc<Shared>, sp: Arc<SendfilePoller>, mut poll: Poll) {
    let mut events = Events::with_capacity(256);
    loop {
        while shared.paused() && !sp.is_closing() {
            std::thread::sleep(Duration::from_secs(1));
        }
        if sp.is_closing() {
            break;
        }

        {
            let mut queue = sp.add_queue.lock();
            if queue.is_empty() && sp.count() == 0 && !sp.is_closing() {
                let _ = sp.cv.wait_for(&mut queue, Duration::from_secs(1));
            }
        }
        if sp.is_closing() {
            break;
        }

        let adds: Vec<ConnRef> = std::mem::take(&mut *sp.add_queue.lock());
        for conn_ref in adds {
            sp.register_parked(&shared, conn_ref);
        }

        match poll.poll(
            &mut events,
            Some(Duration::from_micros(shared.config.poll_time_us.max(1))),
        ) {
            Ok(()) => {
                for event in events.iter() {
                    if event.token() == WAKE_TOKEN {
                        continue;
                    }
                    // The sendfile poller registers WRITE only; observing
                    // read readiness here is a programming error.
                    debug_assert!(
                        !(event.is_readable() && event.is_writable()),
                        "sendfile poller saw READ+WRITE readiness"
                    );
                    let index = event.token().0 as u32;
                    let Some(generation) = sp.attached.lock().get(&index).copied() else {
                        continue;
                    };
                    sp.process_parked(&shared, ConnRef { index, generation });
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!(sendfile_poller = sp.id, "critical poll failure: {e}");
                metrics::POLLER_REBUILDS.increment();
                let snapshot: Vec<ConnRef> = sp
                    .attached
                    .lock()
                    .iter()
                    .map(|(&index, &generation)| ConnRef { index, generation })
                    .collect();
                for conn_ref in snapshot {
                    cancelled_key(&shared, conn_ref, Some(SocketStatus::Error));
                }
                sp.attached.lock().clear();
                match Poll::new() {
                    Ok(new_poll) => {
                        if let (Ok(registry), Ok(waker)) = (
                            new_poll.registry().try_clone(),
                            Waker::new(new_poll.registry(), WAKE_TOKEN),
                        ) {
                            *sp.registry.write() = registry;
                            *sp.waker.write() = Arc::new(waker);
                            poll = new_poll;
                        }
                    }
                    Err(e) => {
                        error!(sendfile_poller = sp.id, "rebuild failed: {e}");
                        break;
                    }
                }
                continue;
            }
        }

        sp.maintain(&shared);
    }

    // Close everything still parked or queued.
    let snapshot: Vec<ConnRef> = sp
        .attached
        .lock()
        .iter()
        .map(|(&index, &generation)| ConnRef { index, generation })
        .collect();
    for conn_ref in snapshot {
        cancelled_key(&shared, conn_ref, Some(SocketStatus::Stop));
    }
    for conn_ref in std::mem::take(&mut *sp.add_queue.lock()) {
        cancelled_key(&shared, conn_ref, Some(SocketStatus::Stop));
    }
    debug!(sendfile_poller = sp.id, "sendfile poller exited");
}
