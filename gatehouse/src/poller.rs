//! Readiness pollers.
//!
//! Each poller thread owns one OS readiness queue. All external mutations
//! of a socket's registration are queued as [`PollerEvent`]s and applied
//! on the poller thread; the queue is single-writer from the OS point of
//! view. The wake-up counter implements the "first submission wakes, the
//! rest don't" protocol: the poller parks the counter at −1 right before
//! a blocking wait, so exactly the submission that brings it back to 0
//! fires the waker.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_queue::SegQueue;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, trace};

use crate::connection::{ops, ConnRef, Connection, Registered};
use crate::endpoint::Shared;
use crate::handler::SocketStatus;
use crate::metrics;
use crate::sendfile;
use crate::worker;

/// Token reserved for the in-queue waker; never collides with slot
/// indices.
pub(crate) const WAKE_TOKEN: Token = Token(usize::MAX);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EventKind {
    Register,
    Rearm,
}

/// A deferred mutation of a socket's registration, applied on the poller
/// thread between readiness waits.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PollerEvent {
    pub(crate) conn: ConnRef,
    pub(crate) interest_ops: u32,
    pub(crate) kind: EventKind,
}

/// Map an ops bitset onto a mio interest. `None` = no OS registration.
fn mio_interest(ops_bits: u32) -> Option<Interest> {
    match (ops_bits & ops::READ != 0, ops_bits & ops::WRITE != 0) {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

/// The ops bitset corresponding to an observed readiness event.
fn ready_ops(readable: bool, writable: bool) -> u32 {
    let mut ops_bits = 0;
    if readable {
        ops_bits |= ops::READ;
    }
    if writable {
        ops_bits |= ops::WRITE;
    }
    ops_bits
}

/// Interest left on a key after dispatching the given readiness.
///
/// Comet sockets drop the whole mask so a second readiness cannot reach a
/// second worker; they re-arm through `comet_interest`. The read path
/// clears only the ops that actually fired.
fn remaining_interest(current: u32, ready: u32, comet: bool) -> u32 {
    if comet {
        0
    } else {
        current & !ready
    }
}

/// Whether the timeout sweep can be skipped this iteration. Activity or
/// an unexpired deadline skips; closing never skips.
fn should_skip_sweep(
    key_count: usize,
    has_events: bool,
    now: u64,
    next_expiration: u64,
    close: bool,
) -> bool {
    (key_count > 0 || has_events || now < next_expiration) && !close
}

/// Shared half of a poller: everything other threads touch. The `Poll`
/// itself lives on the poller thread.
pub(crate) struct Poller {
    pub(crate) id: usize,
    events: SegQueue<PollerEvent>,
    wakeup_counter: AtomicI64,
    close: AtomicBool,
    next_expiration: AtomicU64,
    key_count: AtomicUsize,
    /// Slot index → generation of every connection attached to this
    /// poller, whatever its current interest.
    attached: Mutex<HashMap<u32, u32>>,
    registry: RwLock<Registry>,
    waker: RwLock<Arc<Waker>>,
}

impl Poller {
    pub(crate) fn new(id: usize, poll: &Poll) -> io::Result<Arc<Self>> {
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        Ok(Arc::new(Self {
            id,
            events: SegQueue::new(),
            wakeup_counter: AtomicI64::new(0),
            close: AtomicBool::new(false),
            next_expiration: AtomicU64::new(0),
            key_count: AtomicUsize::new(0),
            attached: Mutex::new(HashMap::new()),
            registry: RwLock::new(registry),
            waker: RwLock::new(Arc::new(waker)),
        }))
    }

    /// Keys currently registered with READ interest — the keep-alive
    /// population of this poller.
    pub(crate) fn key_count(&self) -> usize {
        self.key_count.load(Ordering::Acquire)
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.close.load(Ordering::Acquire)
    }

    /// Ask the poller thread to expire everything and exit.
    pub(crate) fn destroy(&self) {
        self.close.store(true, Ordering::Release);
        self.wake();
    }

    pub(crate) fn wake(&self) {
        if let Err(e) = self.waker.read().wake() {
            debug!(poller = self.id, "waker failed: {e}");
        }
    }

    /// Submit a deferred registration mutation. The submission that moves
    /// the counter up from −1 wakes the blocked wait; later submissions
    /// before the next drain do not.
    pub(crate) fn add_event(&self, event: PollerEvent) {
        self.events.push(event);
        if self.wakeup_counter.fetch_add(1, Ordering::AcqRel) + 1 == 0 {
            self.wake();
        }
    }

    /// Merge `interest_ops` into the connection's registration.
    pub(crate) fn add(&self, conn: ConnRef, interest_ops: u32) {
        self.add_event(PollerEvent {
            conn,
            interest_ops,
            kind: EventKind::Rearm,
        });
    }

    /// Attach a fresh connection: seed READ interest and queue the OS
    /// registration. The keep-alive count moves at seed time so a cancel
    /// racing the REGISTER event stays balanced.
    pub(crate) fn register(&self, shared: &Shared, conn: ConnRef) {
        if let Some(slot) = shared.connections.slot(conn) {
            slot.meta.set_interest(ops::READ);
            slot.meta.access();
            self.adjust_key_count(0, ops::READ);
        }
        self.add_event(PollerEvent {
            conn,
            interest_ops: ops::REGISTER,
            kind: EventKind::Register,
        });
    }

    /// Re-arm a comet socket with its requested mask. A CALLBACK request
    /// forces an immediate sweep so the notify fires promptly.
    pub(crate) fn comet_interest(&self, shared: &Shared, conn: ConnRef) {
        if !shared.config.use_comet {
            return;
        }
        let Some(slot) = shared.connections.slot(conn) else {
            return;
        };
        let comet_ops = slot.state.lock().comet_ops;
        self.add(conn, comet_ops);
        if comet_ops & ops::CALLBACK != 0 {
            self.next_expiration.store(0, Ordering::Release);
            self.wake();
        }
    }

    pub(crate) fn attach(&self, conn: ConnRef) {
        self.attached.lock().insert(conn.index, conn.generation);
    }

    pub(crate) fn detach(&self, index: u32) {
        self.attached.lock().remove(&index);
    }

    fn attached_snapshot(&self) -> Vec<ConnRef> {
        self.attached
            .lock()
            .iter()
            .map(|(&index, &generation)| ConnRef { index, generation })
            .collect()
    }

    /// Track transitions of READ interest for the keep-alive count.
    pub(crate) fn adjust_key_count(&self, old_ops: u32, new_ops: u32) {
        let had = old_ops & ops::READ != 0;
        let has = new_ops & ops::READ != 0;
        if !had && has {
            self.key_count.fetch_add(1, Ordering::AcqRel);
            metrics::KEEPALIVE_CONNECTIONS.increment();
        } else if had && !has {
            self.key_count.fetch_sub(1, Ordering::AcqRel);
            metrics::KEEPALIVE_CONNECTIONS.decrement();
        }
    }

    pub(crate) fn deregister_stream(&self, stream: &mut TcpStream) -> io::Result<()> {
        self.registry.read().deregister(stream)
    }

    /// Apply a new interest mask to the OS registration, keeping the
    /// connection's recorded ops and the keep-alive count in step.
    /// Interest 0 deregisters; the connection stays attached for
    /// sweeping.
    fn apply_interest(
        &self,
        conn_ref: ConnRef,
        conn: &mut Connection,
        meta_interest_old: u32,
        new_ops: u32,
    ) -> io::Result<()> {
        let Some(stream) = conn.stream.as_mut() else {
            return Err(io::ErrorKind::NotConnected.into());
        };
        let token = Token(conn_ref.index as usize);
        let registry = self.registry.read();
        match (conn.registered, mio_interest(new_ops)) {
            (Registered::No, Some(interest)) => {
                registry.register(stream, token, interest)?;
                conn.registered = Registered::Main;
            }
            (Registered::Main, Some(interest)) => {
                registry.reregister(stream, token, interest)?;
            }
            (Registered::Main, None) => {
                registry.deregister(stream)?;
                conn.registered = Registered::No;
            }
            (Registered::No, None) => {}
            (Registered::Sendfile(_), _) => {
                // The sendfile poller owns the registration; recording the
                // ops is enough, it re-arms us on completion.
            }
        }
        drop(registry);
        conn.meta().set_interest(new_ops & (ops::READ | ops::WRITE));
        self.adjust_key_count(meta_interest_old, new_ops);
        Ok(())
    }
}

/// Execute one queued event on the poller thread.
fn run_event(shared: &Arc<Shared>, poller: &Arc<Poller>, event: PollerEvent) {
    let Some(slot) = shared.connections.slot(event.conn) else {
        // The connection died between submission and drain.
        return;
    };
    match event.kind {
        EventKind::Register => {
            let mut conn = slot.state.lock();
            conn.poller_id = poller.id;
            // The count already moved when the interest was seeded.
            let result = poller.apply_interest(event.conn, &mut conn, ops::READ, ops::READ);
            match result {
                Ok(()) => {
                    poller.attach(event.conn);
                    trace!(poller = poller.id, conn = event.conn.index, "registered");
                }
                Err(e) => {
                    error!(poller = poller.id, conn = event.conn.index, "register failed: {e}");
                    cancelled_key_locked(shared, event.conn, &mut conn, Some(SocketStatus::Error));
                }
            }
        }
        EventKind::Rearm => {
            let mut conn = slot.state.lock();
            let requested = event.interest_ops;
            if slot.meta.comet() && requested & ops::CALLBACK != 0 {
                slot.meta.set_comet_notify(true);
            } else {
                slot.meta.set_comet_notify(false);
            }
            let requested = requested & !ops::CALLBACK;
            slot.meta.access();
            let old_ops = slot.meta.interest();
            let merged = old_ops | (requested & (ops::READ | ops::WRITE));
            if let Err(e) = poller.apply_interest(event.conn, &mut conn, old_ops, merged) {
                debug!(poller = poller.id, conn = event.conn.index, "re-arm failed: {e}");
                cancelled_key_locked(
                    shared,
                    event.conn,
                    &mut conn,
                    Some(SocketStatus::Disconnect),
                );
            }
        }
    }
}

/// Drain the event queue; returns whether anything was processed.
fn drain_events(shared: &Arc<Shared>, poller: &Arc<Poller>) -> bool {
    let mut had_events = false;
    while let Some(event) = poller.events.pop() {
        had_events = true;
        run_event(shared, poller, event);
    }
    had_events
}

/// Dispatch one ready key.
fn process_key(shared: &Arc<Shared>, poller: &Arc<Poller>, conn_ref: ConnRef, readable: bool, writable: bool) {
    if poller.is_closing() {
        cancelled_key(shared, conn_ref, Some(SocketStatus::Stop));
        return;
    }
    let Some(slot) = shared.connections.slot(conn_ref) else {
        return;
    };
    let mut conn = slot.state.lock();
    if conn.sendfile.is_some() {
        sendfile::process_ready(shared, conn_ref, &mut conn, true, false);
        return;
    }
    let comet = slot.meta.comet() && shared.config.use_comet;
    let current = slot.meta.interest();
    let remaining = remaining_interest(current, ready_ops(readable, writable), comet);
    if let Err(e) = poller.apply_interest(conn_ref, &mut conn, current, remaining) {
        debug!(conn = conn_ref.index, "interest clear failed: {e}");
        cancelled_key_locked(shared, conn_ref, &mut conn, Some(SocketStatus::Error));
        return;
    }
    drop(conn);
    let status = if comet { Some(SocketStatus::Open) } else { None };
    if !worker::process_socket(shared, conn_ref, status, readable, writable, true) {
        cancelled_key(shared, conn_ref, Some(SocketStatus::Disconnect));
    }
}

/// Sweep attached connections for expired deadlines. Also drives comet
/// notifies and async timeouts, and cancels everything with STOP when the
/// poller is closing.
fn timeout_sweep(shared: &Arc<Shared>, poller: &Arc<Poller>, key_count: usize, has_events: bool) {
    let now = shared.connections.now_ms();
    let close = poller.is_closing();
    if should_skip_sweep(
        key_count,
        has_events,
        now,
        poller.next_expiration.load(Ordering::Acquire),
        close,
    ) {
        return;
    }
    poller
        .next_expiration
        .store(now + shared.config.timeout_interval, Ordering::Release);

    for conn_ref in poller.attached_snapshot() {
        let Some(slot) = shared.connections.slot(conn_ref) else {
            poller.detach(conn_ref.index);
            continue;
        };
        let meta = &slot.meta;
        if close {
            cancelled_key(shared, conn_ref, Some(SocketStatus::Stop));
            continue;
        }
        if meta.comet() && meta.comet_notify() {
            meta.set_comet_notify(false);
            {
                let mut conn = slot.state.lock();
                let current = meta.interest();
                // Zero the mask so the notify cannot double-dispatch; the
                // handler re-arms through comet_interest.
                let _ = poller.apply_interest(conn_ref, &mut conn, current, 0);
            }
            if !worker::process_socket(shared, conn_ref, Some(SocketStatus::Open), false, false, true) {
                worker::process_socket(
                    shared,
                    conn_ref,
                    Some(SocketStatus::Disconnect),
                    false,
                    false,
                    true,
                );
            }
            continue;
        }
        let interest = meta.interest();
        if interest & (ops::READ | ops::WRITE) != 0 {
            let timeout = shared.effective_timeout(meta.timeout_ms());
            if timeout < 0 {
                continue;
            }
            let delta = now.saturating_sub(meta.last_access());
            if delta > timeout as u64 {
                // Zero the interest first so a duplicate sweep cannot fire
                // a second TIMEOUT.
                {
                    let mut conn = slot.state.lock();
                    let _ = poller.apply_interest(conn_ref, &mut conn, interest, 0);
                }
                metrics::IDLE_TIMEOUTS.increment();
                cancelled_key(shared, conn_ref, Some(SocketStatus::Timeout));
            } else {
                let next = now + (timeout as u64 - delta);
                poller.next_expiration.fetch_min(next, Ordering::AcqRel);
            }
        } else if meta.is_async() {
            let timeout = shared.effective_timeout(meta.timeout_ms());
            if timeout >= 0 && now.saturating_sub(meta.last_access()) > timeout as u64 {
                worker::process_socket_async(shared, conn_ref, SocketStatus::Timeout);
            }
        }
    }
}

/// Tear the readiness queue down and start over after a critical poll
/// failure. Registered connections go through the destroy path.
fn rebuild(shared: &Arc<Shared>, poller: &Arc<Poller>, poll: &mut Poll) -> io::Result<()> {
    metrics::POLLER_REBUILDS.increment();
    for conn_ref in poller.attached_snapshot() {
        cancelled_key(shared, conn_ref, Some(SocketStatus::Error));
    }
    poller.attached.lock().clear();
    let new_poll = Poll::new()?;
    let new_registry = new_poll.registry().try_clone()?;
    let new_waker = Waker::new(new_poll.registry(), WAKE_TOKEN)?;
    *poller.registry.write() = new_registry;
    *poller.waker.write() = Arc::new(new_waker);
    *poll = new_poll;
    Ok(())
}

/// The poller thread body.
pub(crate) fn run(shared: Arc<Shared>, poller: Arc<Poller>, mut poll: Poll) {
    let capacity = shared.config.poller_size.clamp(16, 1024);
    let mut events = Events::with_capacity(capacity);
    loop {
        while shared.paused() && !poller.is_closing() {
            std::thread::sleep(Duration::from_millis(100));
        }
        let mut has_events = drain_events(&shared, &poller);
        if poller.is_closing() {
            timeout_sweep(&shared, &poller, 0, false);
            break;
        }

        let poll_result = if poller.wakeup_counter.load(Ordering::Acquire) > 0 {
            poll.poll(&mut events, Some(Duration::ZERO))
        } else {
            poller.wakeup_counter.store(-1, Ordering::Release);
            poll.poll(
                &mut events,
                Some(Duration::from_millis(shared.config.selector_timeout)),
            )
        };
        poller.wakeup_counter.store(0, Ordering::Release);

        let mut key_count = 0;
        match poll_result {
            Ok(()) => {
                key_count = events.iter().count();
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                continue;
            }
            Err(e) => {
                error!(poller = poller.id, "critical poll failure: {e}");
                if let Err(e) = rebuild(&shared, &poller, &mut poll) {
                    error!(poller = poller.id, "readiness queue rebuild failed: {e}");
                    poller.close.store(true, Ordering::Release);
                }
                continue;
            }
        }

        if poller.is_closing() {
            timeout_sweep(&shared, &poller, 0, false);
            break;
        }
        if key_count == 0 {
            has_events |= drain_events(&shared, &poller);
        }

        for event in events.iter() {
            if event.token() == WAKE_TOKEN {
                continue;
            }
            let index = event.token().0 as u32;
            let Some(generation) = poller.attached.lock().get(&index).copied() else {
                continue;
            };
            let conn_ref = ConnRef { index, generation };
            if let Some(slot) = shared.connections.slot(conn_ref) {
                slot.meta.access();
            }
            process_key(&shared, &poller, conn_ref, event.is_readable(), event.is_writable());
        }

        timeout_sweep(&shared, &poller, key_count, has_events);
        shared.check_parachute();
    }
    if let Some(latch) = shared.stop_latch.read().clone() {
        latch.count_down();
    }
    debug!(poller = poller.id, "poller exited");
}

// ── Cancellation ─────────────────────────────────────────────────────

/// Cancel a connection: detach, release, close, recycle. Idempotent; may
/// be called from the poller or a worker.
pub(crate) fn cancelled_key(shared: &Arc<Shared>, conn_ref: ConnRef, status: Option<SocketStatus>) {
    let Some(slot) = shared.connections.slot(conn_ref) else {
        return;
    };
    let mut conn = slot.state.lock();
    cancelled_key_locked(shared, conn_ref, &mut conn, status);
}

/// Cancellation body, with the per-connection monitor already held.
///
/// Errors here are swallowed and logged at debug level; cancellation
/// always completes.
pub(crate) fn cancelled_key_locked(
    shared: &Arc<Shared>,
    conn_ref: ConnRef,
    conn: &mut Connection,
    status: Option<SocketStatus>,
) {
    let Some(slot) = shared.connections.slot(conn_ref) else {
        return;
    };
    let meta = &slot.meta;
    if !meta.begin_cancel() {
        return;
    }

    // A comet socket gets a final event before release. TIMEOUT dispatches
    // and may rescue the socket; the other statuses are delivered inline.
    if meta.comet() {
        if let Some(status) = status {
            meta.set_comet(false);
            if status == SocketStatus::Timeout {
                meta.abort_cancel();
                if worker::process_socket(shared, conn_ref, Some(status), false, false, true) {
                    return;
                }
                if !meta.begin_cancel() {
                    return;
                }
            } else {
                let _ = shared.handler.event(conn, status);
            }
        }
    }

    let old_interest = meta.interest();
    meta.set_interest(0);
    if let Some(poller) = shared.poller(conn.poller_id) {
        poller.adjust_key_count(old_interest, 0);
        poller.detach(conn_ref.index);
    }
    shared.waiting_requests.lock().remove(&conn_ref);

    shared.handler.release(conn);

    if let (Some(tls), Some(stream)) = (conn.tls.as_mut(), conn.stream.as_mut()) {
        tls.send_close_notify(stream);
    }
    conn.tls = None;

    match conn.registered {
        Registered::Main => {
            if let (Some(poller), Some(stream)) = (shared.poller(conn.poller_id), conn.stream.as_mut()) {
                if let Err(e) = poller.deregister_stream(stream) {
                    debug!(conn = conn_ref.index, "deregister failed: {e}");
                }
            }
        }
        Registered::Sendfile(id) => {
            sendfile::forget(shared, id, conn_ref, conn);
        }
        Registered::No => {}
    }
    conn.registered = Registered::No;

    // Dropping the stream closes the socket; dropping the job closes the
    // file descriptor.
    conn.stream = None;
    conn.sendfile = None;

    if let Some(buffers) = conn.buffers.take() {
        shared.buffers.offer(buffers);
    }
    conn.reset(-1, -1);
    shared.connections.release(conn_ref);
    metrics::CONNECTIONS_CLOSED.increment();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interest_mapping_covers_all_masks() {
        assert!(mio_interest(0).is_none());
        assert_eq!(mio_interest(ops::READ), Some(Interest::READABLE));
        assert_eq!(mio_interest(ops::WRITE), Some(Interest::WRITABLE));
        assert_eq!(
            mio_interest(ops::READ | ops::WRITE),
            Some(Interest::READABLE | Interest::WRITABLE)
        );
    }

    #[test]
    fn read_path_clears_only_ready_ops() {
        let current = ops::READ | ops::WRITE;
        assert_eq!(
            remaining_interest(current, ops::READ, false),
            ops::WRITE,
            "write interest must survive a read dispatch"
        );
        assert_eq!(remaining_interest(ops::READ, ops::READ, false), 0);
    }

    #[test]
    fn comet_path_clears_the_whole_mask() {
        // The asymmetry is deliberate: comet re-arms via comet_interest,
        // so a second readiness must not reach a second worker.
        let current = ops::READ | ops::WRITE;
        assert_eq!(remaining_interest(current, ops::READ, true), 0);
    }

    #[test]
    fn sweep_skips_on_activity_or_unexpired_deadline() {
        // Ready keys this tick: skip.
        assert!(should_skip_sweep(3, false, 100, 50, false));
        // Events drained this tick: skip.
        assert!(should_skip_sweep(0, true, 100, 50, false));
        // Quiet but the deadline has not passed: skip.
        assert!(should_skip_sweep(0, false, 40, 50, false));
        // Quiet and expired: sweep.
        assert!(!should_skip_sweep(0, false, 100, 50, false));
        // Closing always sweeps.
        assert!(!should_skip_sweep(3, true, 40, 50, true));
    }

    #[test]
    fn ready_ops_reflects_event_bits() {
        assert_eq!(ready_ops(true, false), ops::READ);
        assert_eq!(ready_ops(false, true), ops::WRITE);
        assert_eq!(ready_ops(true, true), ops::READ | ops::WRITE);
        assert_eq!(ready_ops(false, false), 0);
    }
}
