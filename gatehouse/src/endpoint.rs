//! Endpoint lifecycle.
//!
//! `init` binds and listens, `start` brings up pools and threads, `pause`
//! holds new traffic without dropping connections, `stop` tears the
//! pollers down behind a shutdown latch, `destroy` closes the listener
//! and clears everything. All lifecycle methods are idempotent and
//! thread-safe.

use std::collections::HashSet;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Sender;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::acceptor;
use crate::config::{effective_poller_size, Config};
use crate::connection::{ConnRef, ConnectionTable, Latch};
use crate::error::{Error, Result};
use crate::handler::{Handler, SocketStatus};
use crate::metrics;
use crate::pool::{BufferPool, RunningGate};
use crate::poller::{self, Poller};
use crate::sendfile::{self, SendfileEngine, SendfilePoller};
use crate::tls::TlsContext;
use crate::worker::{self, try_dispatch, Executor, SocketProcessor};

/// State shared by every endpoint thread.
pub(crate) struct Shared {
    pub(crate) config: Config,
    pub(crate) handler: Arc<dyn Handler>,
    pub(crate) connections: ConnectionTable,
    pub(crate) poller_count: usize,
    pub(crate) buffers: BufferPool,
    pub(crate) gate: Arc<RunningGate>,
    pub(crate) pollers: RwLock<Vec<Arc<Poller>>>,
    pub(crate) sendfile: RwLock<Option<Arc<SendfileEngine>>>,
    pub(crate) waiting_requests: Mutex<HashSet<ConnRef>>,
    pub(crate) tls: RwLock<Option<Arc<TlsContext>>>,
    pub(crate) stop_latch: RwLock<Option<Arc<Latch>>>,
    executor: RwLock<Option<Sender<SocketProcessor>>>,
    running: AtomicBool,
    paused: AtomicBool,
    poller_rr: AtomicUsize,
    parachute: Mutex<Option<Vec<u8>>>,
    last_parachute_warn: AtomicU64,
}

impl Shared {
    pub(crate) fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub(crate) fn poller(&self, id: usize) -> Option<Arc<Poller>> {
        self.pollers.read().get(id).cloned()
    }

    /// Round-robin poller selection for fresh registrations.
    pub(crate) fn next_poller(&self) -> Option<Arc<Poller>> {
        let pollers = self.pollers.read();
        if pollers.is_empty() {
            return None;
        }
        let i = self.poller_rr.fetch_add(1, Ordering::AcqRel) % pollers.len();
        pollers.get(i).cloned()
    }

    /// Hand a task to the executor without blocking.
    pub(crate) fn dispatch(&self, task: SocketProcessor) -> Result<()> {
        match self.executor.read().as_ref() {
            Some(tx) => try_dispatch(tx, task),
            None => Err(Error::WorkerRejected),
        }
    }

    /// Resolve a per-connection timeout, falling back to the endpoint
    /// default for −1.
    pub(crate) fn effective_timeout(&self, per_conn: i64) -> i64 {
        if per_conn < 0 {
            self.config.so_timeout
        } else {
            per_conn
        }
    }

    pub(crate) fn keep_alive_count(&self) -> usize {
        self.pollers.read().iter().map(|p| p.key_count()).sum()
    }

    pub(crate) fn sendfile_count(&self) -> usize {
        self.sendfile.read().as_ref().map(|e| e.count()).unwrap_or(0)
    }

    /// Allocation failed somewhere: release the parachute slab and drop
    /// every cache so the allocator gets headroom.
    pub(crate) fn on_oom(&self) {
        metrics::PARACHUTE_RELEASED.increment();
        *self.parachute.lock() = None;
        self.release_caches();
        error!("allocation failure: parachute released, caches cleared");
    }

    pub(crate) fn release_caches(&self) {
        self.buffers.clear();
        self.handler.release_caches();
    }

    /// Re-arm the parachute once memory has recovered; called from the
    /// poller loops.
    pub(crate) fn check_parachute(&self) {
        let size = self.config.oom_parachute;
        if size == 0 {
            return;
        }
        let mut parachute = self.parachute.lock();
        if parachute.is_some() {
            return;
        }
        if free_memory_bytes() > 2 * size as u64 {
            *parachute = Some(vec![0u8; size]);
            info!("OOM parachute re-armed");
            return;
        }
        drop(parachute);
        let now = self.connections.now_ms();
        let last = self.last_parachute_warn.load(Ordering::Acquire);
        if now.saturating_sub(last) > 10_000
            && self
                .last_parachute_warn
                .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            error!("OOM parachute is gone and memory is still low");
        }
    }

    fn arm_parachute(&self) {
        if self.config.oom_parachute > 0 {
            let mut parachute = self.parachute.lock();
            if parachute.is_none() {
                *parachute = Some(vec![0u8; self.config.oom_parachute]);
            }
        }
    }
}

struct LifecycleState {
    initialized: bool,
    listen_fd: Option<RawFd>,
    bound_addr: Option<SocketAddr>,
    acceptors: Vec<JoinHandle<()>>,
    poller_threads: Vec<JoinHandle<()>>,
    sendfile_threads: Vec<JoinHandle<()>>,
    executor: Option<Executor>,
}

/// A connection-multiplexing TCP endpoint.
///
/// Accepts inbound connections, optionally terminates TLS, and dispatches
/// ready sockets to a worker pool running the configured [`Handler`].
pub struct Endpoint {
    shared: Arc<Shared>,
    state: Mutex<LifecycleState>,
}

impl Endpoint {
    /// Build an endpoint around a validated config and a protocol handler.
    pub fn new(config: Config, handler: Arc<dyn Handler>) -> Result<Self> {
        config.validate()?;
        let poller_count = if config.poller_threads == 0 {
            num_cpus()
        } else {
            config.poller_threads
        };
        let descriptor_limit = ensure_descriptor_limit(&config, poller_count)?;
        let per_poller = effective_poller_size(config.poller_size, descriptor_limit);
        if per_poller < config.poller_size {
            warn!(
                requested = config.poller_size,
                effective = per_poller,
                "poller size capped by the descriptor limit"
            );
        }
        let capacity = (per_poller * poller_count).min(u32::MAX as usize) as u32;
        let gate = RunningGate::new();
        let shared = Arc::new(Shared {
            connections: ConnectionTable::new(capacity),
            handler,
            poller_count,
            buffers: BufferPool::new(config.buffer_pool, config.buffer_pool_bytes, gate.clone()),
            gate,
            pollers: RwLock::new(Vec::new()),
            sendfile: RwLock::new(None),
            waiting_requests: Mutex::new(HashSet::new()),
            tls: RwLock::new(None),
            stop_latch: RwLock::new(None),
            executor: RwLock::new(None),
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            poller_rr: AtomicUsize::new(0),
            parachute: Mutex::new(None),
            last_parachute_warn: AtomicU64::new(0),
            config,
        });
        Ok(Self {
            shared,
            state: Mutex::new(LifecycleState {
                initialized: false,
                listen_fd: None,
                bound_addr: None,
                acceptors: Vec::new(),
                poller_threads: Vec::new(),
                sendfile_threads: Vec::new(),
                executor: None,
            }),
        })
    }

    /// Bind, listen, and build the TLS context. Idempotent.
    pub fn init(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.init_locked(&mut state)
    }

    fn init_locked(&self, state: &mut LifecycleState) -> Result<()> {
        if state.initialized {
            return Ok(());
        }
        let config = &self.shared.config;
        let fd = create_listener(config)?;
        let bound = local_addr_of(fd).map_err(|e| {
            unsafe { libc::close(fd) };
            Error::Io(e)
        })?;
        if let Some(settings) = &config.tls {
            match TlsContext::from_settings(settings) {
                Ok(ctx) => *self.shared.tls.write() = Some(Arc::new(ctx)),
                Err(e) => {
                    unsafe { libc::close(fd) };
                    return Err(e);
                }
            }
        }
        self.shared.arm_parachute();
        state.listen_fd = Some(fd);
        state.bound_addr = Some(bound);
        state.initialized = true;
        info!(addr = %bound, "endpoint initialized");
        Ok(())
    }

    /// Bring up pools and threads. Idempotent.
    pub fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.init_locked(&mut state)?;
        if self.shared.running() {
            return Ok(());
        }
        let shared = &self.shared;
        let config = &shared.config;
        shared.running.store(true, Ordering::Release);
        shared.paused.store(false, Ordering::Release);
        shared.gate.set(true);
        *shared.stop_latch.write() = Some(Arc::new(Latch::new(shared.poller_count)));

        // Worker executor.
        let worker_threads = if config.worker_threads == 0 {
            num_cpus()
        } else {
            config.worker_threads
        };
        let (executor, tx) = Executor::start(shared, worker_threads, config.worker_queue);
        *shared.executor.write() = Some(tx);
        state.executor = Some(executor);

        // Pollers.
        let mut pollers = Vec::with_capacity(shared.poller_count);
        let mut poller_threads = Vec::with_capacity(shared.poller_count);
        for id in 0..shared.poller_count {
            let poll = mio::Poll::new().map_err(|e| Error::PollerSetup(e.to_string()))?;
            let poller = Poller::new(id, &poll).map_err(|e| Error::PollerSetup(e.to_string()))?;
            let thread_shared = shared.clone();
            let thread_poller = poller.clone();
            let handle = thread::Builder::new()
                .name(format!("gatehouse-poller-{id}"))
                .spawn(move || poller::run(thread_shared, thread_poller, poll))
                .map_err(Error::Io)?;
            pollers.push(poller);
            poller_threads.push(handle);
        }
        *shared.pollers.write() = pollers;
        state.poller_threads = poller_threads;

        // Sendfile pollers.
        if config.use_sendfile {
            let threads = config.sendfile_threads.max(1);
            let mut sendfile_pollers = Vec::with_capacity(threads);
            for id in 0..threads {
                let poll = mio::Poll::new().map_err(|e| Error::PollerSetup(e.to_string()))?;
                let sp =
                    SendfilePoller::new(id, &poll).map_err(|e| Error::PollerSetup(e.to_string()))?;
                let thread_shared = shared.clone();
                let thread_sp = sp.clone();
                let handle = thread::Builder::new()
                    .name(format!("gatehouse-sendfile-{id}"))
                    .spawn(move || sendfile::run_sendfile(thread_shared, thread_sp, poll))
                    .map_err(Error::Io)?;
                sendfile_pollers.push(sp);
                state.sendfile_threads.push(handle);
            }
            *shared.sendfile.write() = Some(SendfileEngine::new(sendfile_pollers));
        }

        // Acceptors.
        let listen_fd = state.listen_fd.expect("initialized");
        for id in 0..config.acceptor_threads.max(1) {
            let thread_shared = shared.clone();
            let handle = thread::Builder::new()
                .name(format!("gatehouse-acceptor-{id}"))
                .spawn(move || acceptor::run_acceptor(thread_shared, listen_fd))
                .map_err(Error::Io)?;
            state.acceptors.push(handle);
        }

        // Async timeout sweeper. Exits on its own once running clears.
        {
            let thread_shared = shared.clone();
            let _ = thread::Builder::new()
                .name("gatehouse-async-timeout".to_string())
                .spawn(move || worker::run_async_timeout(thread_shared));
        }

        info!(
            pollers = shared.poller_count,
            workers = worker_threads,
            "endpoint started"
        );
        Ok(())
    }

    /// Hold new traffic. Existing connections are untouched.
    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::Release);
    }

    /// Resume after a pause.
    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::Release);
    }

    /// Stop processing: cancel every connection with STOP, tear down the
    /// pollers and the executor. The listener stays bound until
    /// [`destroy`](Endpoint::destroy).
    pub fn stop(&self) {
        let mut state = self.state.lock();
        if !self.shared.paused() {
            self.pause();
        }
        if self.shared.running() {
            self.shared.running.store(false, Ordering::Release);
            self.shared.gate.set(false);

            if let Some(addr) = state.bound_addr {
                unlock_accept(addr, state.acceptors.len());
            }
            for poller in self.shared.pollers.read().iter() {
                poller.destroy();
            }
            let grace = Duration::from_millis(self.shared.config.selector_timeout + 100);
            if let Some(latch) = self.shared.stop_latch.read().clone() {
                if !latch.wait_for(grace) {
                    warn!("pollers did not exit within the grace window");
                }
            }
            for handle in state.acceptors.drain(..) {
                let _ = handle.join();
            }
            if let Some(engine) = self.shared.sendfile.read().clone() {
                engine.destroy();
            }
            for handle in state.sendfile_threads.drain(..) {
                let _ = handle.join();
            }
            // Drop the submission handle, then join the workers.
            *self.shared.executor.write() = None;
            if let Some(executor) = state.executor.take() {
                executor.shutdown();
            }
            for handle in state.poller_threads.drain(..) {
                let _ = handle.join();
            }
            self.shared.pollers.write().clear();
            *self.shared.sendfile.write() = None;
            info!("endpoint stopped");
        }
        self.shared.buffers.clear();
        self.shared.waiting_requests.lock().clear();
    }

    /// Close the listening socket and release everything. Idempotent.
    pub fn destroy(&self) {
        if self.shared.running() {
            self.stop();
        }
        let mut state = self.state.lock();
        if let Some(fd) = state.listen_fd.take() {
            unsafe { libc::close(fd) };
        }
        state.bound_addr = None;
        *self.shared.tls.write() = None;
        *self.shared.parachute.lock() = None;
        self.shared.release_caches();
        if state.initialized {
            debug!("endpoint destroyed");
        }
        state.initialized = false;
    }

    /// The bound address, once initialized. With port 0 this is where the
    /// ephemeral port shows up.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state.lock().bound_addr
    }

    /// Idle keep-alive connections currently held in readiness queues,
    /// summed across pollers.
    pub fn keep_alive_count(&self) -> usize {
        self.shared.keep_alive_count()
    }

    /// Sendfile jobs currently parked on write readiness.
    pub fn sendfile_count(&self) -> usize {
        self.shared.sendfile_count()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running()
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused()
    }

    /// Resume a parked async connection. Dispatches the handler at most
    /// once per park; returns whether this call won the dispatch.
    pub fn process_socket_async(&self, conn: ConnRef, status: SocketStatus) -> bool {
        worker::process_socket_async(&self.shared, conn, status)
    }

    /// Re-arm a comet connection with its requested interest mask.
    pub fn comet_interest(&self, conn: ConnRef) {
        let Some(slot) = self.shared.connections.slot(conn) else {
            return;
        };
        let poller_id = slot.state.lock().poller_id;
        if let Some(poller) = self.shared.poller(poller_id) {
            poller.comet_interest(&self.shared, conn);
        }
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.destroy();
    }
}

// ── Listener plumbing ────────────────────────────────────────────────

/// Create the listening socket: SO_REUSEADDR and SO_KEEPALIVE, optional
/// TCP_DEFER_ACCEPT, configured backlog. Stays blocking for the
/// acceptors.
fn create_listener(config: &Config) -> Result<RawFd> {
    let addr = config.bind_addr();
    let domain = if addr.is_ipv4() {
        libc::AF_INET
    } else {
        libc::AF_INET6
    };

    let fd = unsafe { libc::socket(domain, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }

    let optval: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }

    if config.defer_accept {
        let secs: libc::c_int = 1;
        unsafe {
            libc::setsockopt(
                fd,
                libc::IPPROTO_TCP,
                libc::TCP_DEFER_ACCEPT,
                &secs as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
    }

    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let addr_len = acceptor::socket_addr_to_sockaddr(addr, &mut storage);
    let ret = unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, addr_len) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(Error::Io(err));
    }

    let ret = unsafe { libc::listen(fd, config.backlog) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(Error::Io(err));
    }

    Ok(fd)
}

fn local_addr_of(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let ret =
        unsafe { libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    acceptor::sockaddr_to_socket_addr(&storage)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unknown address family"))
}

/// Unblock the acceptors' blocking `accept` with self-connects. A byte of
/// payload goes along so TCP_DEFER_ACCEPT surfaces the connection.
fn unlock_accept(addr: SocketAddr, acceptors: usize) {
    let target = if addr.ip().is_unspecified() {
        let ip = if addr.is_ipv4() {
            std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)
        } else {
            std::net::IpAddr::V6(std::net::Ipv6Addr::LOCALHOST)
        };
        SocketAddr::new(ip, addr.port())
    } else {
        addr
    };
    for _ in 0..acceptors.max(1) {
        match std::net::TcpStream::connect_timeout(&target, Duration::from_millis(250)) {
            Ok(mut stream) => {
                let _ = stream.set_nodelay(true);
                let _ = stream.write_all(b"\0");
            }
            Err(e) => {
                debug!("unlock accept connect failed: {e}");
            }
        }
    }
}

fn free_memory_bytes() -> u64 {
    let mut info: libc::sysinfo = unsafe { std::mem::zeroed() };
    if unsafe { libc::sysinfo(&mut info) } == 0 {
        (info.freeram as u64).saturating_mul(info.mem_unit as u64)
    } else {
        u64::MAX
    }
}

/// Get the number of available CPU cores.
pub(crate) fn num_cpus() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if ret < 1 {
        1
    } else {
        ret as usize
    }
}

/// What to do about RLIMIT_NOFILE given the current limits, the
/// configured appetite (`wanted`), and the smallest table the degrade
/// chain can fall back to (`floor`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LimitPlan {
    /// The soft limit already covers the request.
    Keep(u64),
    /// Raise the soft limit to this value.
    Raise(u64),
    /// Even the degraded floor does not fit under the hard limit.
    TooLow,
}

fn plan_descriptor_limit(soft: u64, hard: u64, wanted: u64, floor: u64) -> LimitPlan {
    if soft >= wanted {
        return LimitPlan::Keep(soft);
    }
    if hard != libc::RLIM_INFINITY && hard < floor {
        return LimitPlan::TooLow;
    }
    let target = if hard == libc::RLIM_INFINITY {
        wanted
    } else {
        wanted.min(hard)
    };
    if target > soft {
        LimitPlan::Raise(target)
    } else {
        LimitPlan::Keep(soft)
    }
}

/// Make RLIMIT_NOFILE cover the connection table, raising the soft limit
/// when the hard limit allows. A hard limit below what the 62-per-poller
/// degrade floor needs cannot run the endpoint at all.
fn ensure_descriptor_limit(config: &Config, poller_count: usize) -> Result<usize> {
    let mut rlim: libc::rlimit = unsafe { std::mem::zeroed() };
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) } != 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }

    // Listener, wakers, stdio, plus a few fds per helper thread.
    let helper_threads =
        poller_count + config.acceptor_threads.max(1) + config.sendfile_threads.max(1);
    let overhead = 4 * helper_threads as u64 + 64;
    let wanted = config.poller_size as u64 * poller_count as u64 + overhead;
    let floor = 62 * poller_count as u64 + overhead;

    match plan_descriptor_limit(rlim.rlim_cur, rlim.rlim_max, wanted, floor) {
        LimitPlan::Keep(soft) => Ok(soft.min(usize::MAX as u64) as usize),
        LimitPlan::Raise(target) => {
            rlim.rlim_cur = target;
            if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &rlim) } != 0 {
                return Err(Error::Io(io::Error::last_os_error()));
            }
            Ok(target.min(usize::MAX as u64) as usize)
        }
        LimitPlan::TooLow => Err(Error::ResourceLimit(format!(
            "RLIMIT_NOFILE too low: need at least {} descriptors but the hard limit is {} \
             (soft: {}). Raise it with: ulimit -n {}",
            floor, rlim.rlim_max, rlim.rlim_cur, wanted
        ))),
    }
}
