//! Connection slot arena.
//!
//! Connections live in a fixed table of slots with generation counters, so
//! pollers, the waiting set, and in-flight work items hold small
//! [`ConnRef`] values instead of owning references. Fields the timeout
//! sweeps read without taking ownership (last access, timeout, interest,
//! mode flags) sit in out-of-lock atomics; everything else lives under the
//! per-slot mutex, which doubles as the "one worker at a time" monitor.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;
use mio::net::TcpStream;
use parking_lot::{Condvar, Mutex};

use crate::buffer::BufferPair;
use crate::error::{Error, Result};
use crate::sendfile::SendfileJob;
use crate::tls::TlsEngine;

/// Interest-ops bitset values.
///
/// `READ` and `WRITE` map onto the readiness queue; `REGISTER` and
/// `CALLBACK` are sentinels that only ever travel inside poller events.
pub mod ops {
    /// Read readiness.
    pub const READ: u32 = 0x01;
    /// Write readiness.
    pub const WRITE: u32 = 0x04;
    /// Sentinel: initial registration of a fresh connection.
    pub const REGISTER: u32 = 0x100;
    /// Sentinel: comet notify request; never reaches the OS queue.
    pub const CALLBACK: u32 = 0x200;
}

/// Stable handle to a connection slot. Stale handles (the slot was
/// recycled) fail generation validation and resolve to nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnRef {
    pub index: u32,
    pub generation: u32,
}

/// Which readiness queue, if any, a connection's stream is currently
/// registered with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Registered {
    No,
    /// The owning poller's queue.
    Main,
    /// A sendfile poller's queue, by sendfile poller id.
    Sendfile(usize),
}

/// A count-down latch for layering blocking helpers on nonblocking I/O.
pub struct Latch {
    count: Mutex<usize>,
    cv: Condvar,
}

impl Latch {
    pub fn new(count: usize) -> Self {
        Self {
            count: Mutex::new(count),
            cv: Condvar::new(),
        }
    }

    pub fn count(&self) -> usize {
        *self.count.lock()
    }

    pub fn count_down(&self) {
        let mut count = self.count.lock();
        if *count > 0 {
            *count -= 1;
            if *count == 0 {
                self.cv.notify_all();
            }
        }
    }

    /// Wait until the count reaches zero or the timeout elapses. Returns
    /// `true` when the latch opened.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let mut count = self.count.lock();
        while *count > 0 {
            if self.cv.wait_for(&mut count, timeout).timed_out() {
                return *count == 0;
            }
        }
        true
    }
}

/// Slot fields read by sweeps and the poller without taking the slot
/// mutex.
pub(crate) struct SlotMeta {
    index: u32,
    epoch: Instant,
    generation: AtomicU32,
    active: AtomicBool,
    cancelled: AtomicBool,
    last_access: AtomicU64,
    timeout_ms: AtomicI64,
    interest: AtomicU32,
    comet: AtomicBool,
    comet_notify: AtomicBool,
    is_async: AtomicBool,
}

impl SlotMeta {
    fn new(index: u32, epoch: Instant) -> Self {
        Self {
            index,
            epoch,
            generation: AtomicU32::new(0),
            active: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            last_access: AtomicU64::new(0),
            timeout_ms: AtomicI64::new(-1),
            interest: AtomicU32::new(0),
            comet: AtomicBool::new(false),
            comet_notify: AtomicBool::new(false),
            is_async: AtomicBool::new(false),
        }
    }

    pub(crate) fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub(crate) fn access(&self) {
        self.last_access.store(self.now_ms(), Ordering::Release);
    }

    pub(crate) fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Acquire)
    }

    pub(crate) fn timeout_ms(&self) -> i64 {
        self.timeout_ms.load(Ordering::Acquire)
    }

    pub(crate) fn set_timeout_ms(&self, ms: i64) {
        self.timeout_ms.store(ms, Ordering::Release);
    }

    pub(crate) fn interest(&self) -> u32 {
        self.interest.load(Ordering::Acquire)
    }

    pub(crate) fn set_interest(&self, ops: u32) {
        self.interest.store(ops, Ordering::Release);
    }

    pub(crate) fn comet(&self) -> bool {
        self.comet.load(Ordering::Acquire)
    }

    pub(crate) fn set_comet(&self, comet: bool) {
        self.comet.store(comet, Ordering::Release);
    }

    pub(crate) fn comet_notify(&self) -> bool {
        self.comet_notify.load(Ordering::Acquire)
    }

    pub(crate) fn set_comet_notify(&self, notify: bool) {
        self.comet_notify.store(notify, Ordering::Release);
    }

    pub(crate) fn is_async(&self) -> bool {
        self.is_async.load(Ordering::Acquire)
    }

    pub(crate) fn set_async(&self, v: bool) {
        self.is_async.store(v, Ordering::Release);
    }

    /// Latch the cancelled flag. Only the first caller wins.
    pub(crate) fn begin_cancel(&self) -> bool {
        !self.cancelled.swap(true, Ordering::AcqRel)
    }

    /// Undo a cancellation that decided to keep the socket alive (comet
    /// timeout rescue).
    pub(crate) fn abort_cancel(&self) {
        self.cancelled.store(false, Ordering::Release);
    }
}

/// One connection's mutex-guarded state. Holding `&mut Connection` is the
/// OWNED state of the slot lifecycle.
pub struct Connection {
    meta: Arc<SlotMeta>,
    pub(crate) stream: Option<TcpStream>,
    pub(crate) poller_id: usize,
    /// Which readiness queue the stream is currently registered with.
    pub(crate) registered: Registered,
    pub(crate) tls: Option<TlsEngine>,
    pub(crate) buffers: Option<BufferPair>,
    pub(crate) sendfile: Option<SendfileJob>,
    pub(crate) comet_ops: u32,
    pub(crate) keep_alive_left: i64,
    read_latch: Option<Arc<Latch>>,
    write_latch: Option<Arc<Latch>>,
}

impl Connection {
    fn new(meta: Arc<SlotMeta>) -> Self {
        Self {
            meta,
            stream: None,
            poller_id: 0,
            registered: Registered::No,
            tls: None,
            buffers: None,
            sendfile: None,
            comet_ops: ops::READ,
            keep_alive_left: -1,
            read_latch: None,
            write_latch: None,
        }
    }

    /// Refresh the last-access stamp to now.
    pub fn access(&self) {
        self.meta.access();
    }

    /// This connection's stable handle, usable for external resumption
    /// after the handler has returned [`SocketState::Long`].
    ///
    /// [`SocketState::Long`]: crate::handler::SocketState::Long
    pub fn conn_ref(&self) -> ConnRef {
        ConnRef {
            index: self.meta.index,
            generation: self.meta.generation.load(Ordering::Acquire),
        }
    }

    /// Per-socket timeout in ms; −1 means "use the endpoint default".
    pub fn timeout_ms(&self) -> i64 {
        self.meta.timeout_ms()
    }

    pub fn set_timeout_ms(&self, ms: i64) {
        self.meta.set_timeout_ms(ms);
    }

    /// Whether the socket is in comet (long-poll) mode.
    pub fn comet(&self) -> bool {
        self.meta.comet()
    }

    pub fn set_comet(&self, comet: bool) {
        self.meta.set_comet(comet);
    }

    /// Interest mask requested for the next comet re-arm.
    pub fn comet_ops(&self) -> u32 {
        self.comet_ops
    }

    pub fn set_comet_ops(&mut self, ops: u32) {
        self.comet_ops = ops;
    }

    /// Whether the socket is parked for async resumption.
    pub fn is_async(&self) -> bool {
        self.meta.is_async()
    }

    pub fn set_async(&self, v: bool) {
        self.meta.set_async(v);
    }

    /// Keep-alive requests remaining before the endpoint closes the
    /// socket. Negative = unlimited.
    pub fn keep_alive_left(&self) -> i64 {
        self.keep_alive_left
    }

    /// Attach a sendfile job; the engine consumes it on the next add.
    pub fn set_sendfile(&mut self, job: Option<SendfileJob>) {
        self.sendfile = job;
    }

    pub fn sendfile(&self) -> Option<&SendfileJob> {
        self.sendfile.as_ref()
    }

    /// The application buffer pair, if attached.
    pub fn buffers(&mut self) -> Option<&mut BufferPair> {
        self.buffers.as_mut()
    }

    /// Negotiated TLS engine, if this is a TLS connection.
    pub fn tls(&mut self) -> Option<&mut TlsEngine> {
        self.tls.as_mut()
    }

    /// Raw stream access for protocol handlers that bypass [`read`] /
    /// [`write`] (plaintext only).
    ///
    /// [`read`]: Connection::read
    /// [`write`]: Connection::write
    pub fn stream(&mut self) -> Option<&mut TcpStream> {
        self.stream.as_mut()
    }

    /// Read application bytes, decrypting when TLS is attached.
    /// Nonblocking: `WouldBlock` surfaces unchanged.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match (&mut self.tls, &mut self.stream) {
            (Some(tls), Some(stream)) => tls.read(stream, buf),
            (None, Some(stream)) => stream.read(buf),
            _ => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    /// Write application bytes, encrypting when TLS is attached.
    pub fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match (&mut self.tls, &mut self.stream) {
            (Some(tls), Some(stream)) => tls.write(stream, buf),
            (None, Some(stream)) => stream.write(buf),
            _ => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    // ── Latches ──────────────────────────────────────────────────────

    pub fn start_read_latch(&mut self, count: usize) -> Result<()> {
        Self::start_latch(&mut self.read_latch, count)
    }

    pub fn start_write_latch(&mut self, count: usize) -> Result<()> {
        Self::start_latch(&mut self.write_latch, count)
    }

    pub fn read_latch(&self) -> Option<Arc<Latch>> {
        self.read_latch.clone()
    }

    pub fn write_latch(&self) -> Option<Arc<Latch>> {
        self.write_latch.clone()
    }

    pub fn reset_read_latch(&mut self) -> Result<()> {
        Self::reset_latch(&mut self.read_latch)
    }

    pub fn reset_write_latch(&mut self) -> Result<()> {
        Self::reset_latch(&mut self.write_latch)
    }

    fn start_latch(slot: &mut Option<Arc<Latch>>, count: usize) -> Result<()> {
        match slot {
            Some(latch) if latch.count() > 0 => {
                Err(Error::LatchState("latch must be at count 0 or unset"))
            }
            _ => {
                *slot = Some(Arc::new(Latch::new(count)));
                Ok(())
            }
        }
    }

    fn reset_latch(slot: &mut Option<Arc<Latch>>) -> Result<()> {
        match slot {
            Some(latch) if latch.count() > 0 => Err(Error::LatchState("latch must be at count 0")),
            _ => {
                *slot = None;
                Ok(())
            }
        }
    }

    /// Return the slot to its freshly allocated shape. Never closes the
    /// stream; the caller separates return-to-pool from destroy.
    /// Idempotent.
    pub(crate) fn reset(&mut self, timeout_ms: i64, keep_alive_left: i64) {
        for latch in [&self.read_latch, &self.write_latch].into_iter().flatten() {
            while latch.count() > 0 {
                latch.count_down();
            }
        }
        self.read_latch = None;
        self.write_latch = None;
        self.sendfile = None;
        self.comet_ops = ops::READ;
        self.keep_alive_left = keep_alive_left;
        self.registered = Registered::No;
        self.meta.set_timeout_ms(timeout_ms);
        self.meta.set_comet(false);
        self.meta.set_comet_notify(false);
        self.meta.set_async(false);
        self.meta.set_interest(0);
        self.meta.access();
    }

    pub(crate) fn meta(&self) -> &SlotMeta {
        &self.meta
    }
}

pub(crate) struct Slot {
    pub(crate) meta: Arc<SlotMeta>,
    pub(crate) state: Mutex<Connection>,
}

/// Fixed table of connection slots with an MPMC free list.
pub struct ConnectionTable {
    slots: Vec<Slot>,
    free: SegQueue<u32>,
    free_len: AtomicUsize,
    epoch: Instant,
}

impl ConnectionTable {
    pub fn new(capacity: u32) -> Self {
        let epoch = Instant::now();
        let mut slots = Vec::with_capacity(capacity as usize);
        for index in 0..capacity {
            let meta = Arc::new(SlotMeta::new(index, epoch));
            slots.push(Slot {
                state: Mutex::new(Connection::new(meta.clone())),
                meta,
            });
        }
        let free = SegQueue::new();
        for idx in (0..capacity).rev() {
            free.push(idx);
        }
        Self {
            slots,
            free_len: AtomicUsize::new(capacity as usize),
            free,
            epoch,
        }
    }

    /// Milliseconds since the table was created; the time base for all
    /// last-access stamps.
    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Claim a free slot. `None` when the table is exhausted.
    pub fn allocate(&self) -> Option<ConnRef> {
        let index = self.free.pop()?;
        self.free_len.fetch_sub(1, Ordering::AcqRel);
        let meta = &self.slots[index as usize].meta;
        meta.cancelled.store(false, Ordering::Release);
        meta.active.store(true, Ordering::Release);
        meta.access();
        Some(ConnRef {
            index,
            generation: meta.generation.load(Ordering::Acquire),
        })
    }

    /// Release a slot back to the free list, bumping its generation so
    /// stale [`ConnRef`]s die. Idempotent.
    pub fn release(&self, conn: ConnRef) {
        let Some(slot) = self.slots.get(conn.index as usize) else {
            return;
        };
        if slot.meta.generation.load(Ordering::Acquire) != conn.generation {
            return;
        }
        if !slot.meta.active.swap(false, Ordering::AcqRel) {
            return;
        }
        slot.meta.generation.fetch_add(1, Ordering::AcqRel);
        self.free.push(conn.index);
        self.free_len.fetch_add(1, Ordering::AcqRel);
    }

    /// Resolve a reference, failing on stale generation or inactive slot.
    pub(crate) fn slot(&self, conn: ConnRef) -> Option<&Slot> {
        let slot = self.slots.get(conn.index as usize)?;
        if slot.meta.generation.load(Ordering::Acquire) == conn.generation
            && slot.meta.active.load(Ordering::Acquire)
        {
            Some(slot)
        } else {
            None
        }
    }

    pub fn active_count(&self) -> usize {
        self.slots.len() - self.free_len.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_release_round_trip() {
        let table = ConnectionTable::new(4);
        let a = table.allocate().unwrap();
        assert_eq!(table.active_count(), 1);
        assert!(table.slot(a).is_some());
        table.release(a);
        assert_eq!(table.active_count(), 0);
        assert!(table.slot(a).is_none(), "stale ref must not resolve");
    }

    #[test]
    fn release_is_idempotent() {
        let table = ConnectionTable::new(2);
        let a = table.allocate().unwrap();
        table.release(a);
        table.release(a);
        assert_eq!(table.active_count(), 0);
        // Both remaining slots can still be claimed exactly once each.
        assert!(table.allocate().is_some());
        assert!(table.allocate().is_some());
        assert!(table.allocate().is_none());
    }

    #[test]
    fn generation_invalidates_stale_refs() {
        let table = ConnectionTable::new(1);
        let a = table.allocate().unwrap();
        table.release(a);
        let b = table.allocate().unwrap();
        assert_eq!(a.index, b.index);
        assert_ne!(a.generation, b.generation);
        assert!(table.slot(a).is_none());
        assert!(table.slot(b).is_some());
    }

    #[test]
    fn exhaustion_returns_none() {
        let table = ConnectionTable::new(2);
        let _a = table.allocate().unwrap();
        let _b = table.allocate().unwrap();
        assert!(table.allocate().is_none());
    }

    #[test]
    fn reset_is_idempotent() {
        let table = ConnectionTable::new(1);
        let a = table.allocate().unwrap();
        let slot = table.slot(a).unwrap();
        let mut conn = slot.state.lock();
        conn.start_read_latch(2).unwrap();
        conn.set_comet(true);
        conn.set_async(true);
        conn.reset(5000, 10);
        let first_timeout = conn.timeout_ms();
        conn.reset(5000, 10);
        assert_eq!(conn.timeout_ms(), first_timeout);
        assert!(!conn.comet());
        assert!(!conn.is_async());
        assert!(conn.read_latch().is_none());
        assert_eq!(conn.keep_alive_left(), 10);
    }

    #[test]
    fn latch_opens_on_count_down() {
        let latch = Arc::new(Latch::new(2));
        let waiter = {
            let latch = latch.clone();
            std::thread::spawn(move || latch.wait_for(Duration::from_secs(2)))
        };
        latch.count_down();
        latch.count_down();
        assert!(waiter.join().unwrap());
        // Counting down an open latch is a no-op.
        latch.count_down();
        assert_eq!(latch.count(), 0);
    }

    #[test]
    fn latch_wait_times_out() {
        let latch = Latch::new(1);
        assert!(!latch.wait_for(Duration::from_millis(20)));
    }

    #[test]
    fn starting_a_live_latch_fails() {
        let table = ConnectionTable::new(1);
        let a = table.allocate().unwrap();
        let mut conn = table.slot(a).unwrap().state.lock();
        conn.start_read_latch(1).unwrap();
        assert!(conn.start_read_latch(1).is_err());
        assert!(conn.reset_read_latch().is_err());
        conn.read_latch().unwrap().count_down();
        assert!(conn.reset_read_latch().is_ok());
        assert!(conn.start_read_latch(1).is_ok());
    }
}
