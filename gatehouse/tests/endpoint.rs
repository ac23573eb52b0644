//! Integration tests: endpoint lifecycle, keep-alive, async parking, and
//! sendfile over real TCP connections.
//!
//! Each test starts an endpoint on an ephemeral loopback port, connects
//! with std TCP clients, and verifies the handler-observed transitions.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use gatehouse::{
    ConfigBuilder, ConnRef, Connection, Endpoint, Handler, SendfileJob, SocketState, SocketStatus,
};

// ── Helpers ─────────────────────────────────────────────────────────

fn test_config() -> ConfigBuilder {
    let mut builder = ConfigBuilder::new()
        .port(0)
        .acceptor_threads(1)
        .poller_threads(1)
        .worker_threads(2)
        .poller_size(256)
        .selector_timeout(200)
        .timeout_interval(100)
        .so_timeout(10_000)
        .keep_alive_timeout(10_000);
    builder.config_mut().oom_parachute = 0;
    builder
}

fn connect(endpoint: &Endpoint) -> TcpStream {
    let addr = endpoint.local_addr().expect("endpoint not initialized");
    let stream = TcpStream::connect(addr).expect("connect failed");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

fn round_trip(stream: &mut TcpStream, msg: &[u8]) -> Vec<u8> {
    stream.write_all(msg).unwrap();
    stream.flush().unwrap();
    let mut buf = vec![0u8; msg.len()];
    let mut total = 0;
    while total < msg.len() {
        match stream.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => panic!("read error: {e}"),
        }
    }
    buf.truncate(total);
    buf
}

fn read_eof(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; 16];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => return true,
            Ok(_) => continue,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => return false,
        }
    }
}

/// Spin until `check` holds or the deadline passes.
fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    check()
}

/// Echo handler that closes after `limit` requests.
struct CountingEcho {
    limit: usize,
    processed: AtomicUsize,
}

impl CountingEcho {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            processed: AtomicUsize::new(0),
        }
    }
}

impl Handler for CountingEcho {
    fn process(&self, conn: &mut Connection) -> SocketState {
        let mut buf = [0u8; 1024];
        match conn.read(&mut buf) {
            Ok(0) => SocketState::Closed,
            Ok(n) => {
                let _ = conn.write(&buf[..n]);
                let served = self.processed.fetch_add(1, Ordering::SeqCst) + 1;
                if served >= self.limit {
                    SocketState::Closed
                } else {
                    SocketState::Open
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => SocketState::Open,
            Err(_) => SocketState::Closed,
        }
    }

    fn event(&self, _conn: &mut Connection, _status: SocketStatus) -> SocketState {
        SocketState::Closed
    }

    fn release(&self, _conn: &mut Connection) {}
}

// ── Keep-alive ──────────────────────────────────────────────────────

#[test]
fn keep_alive_until_handler_closes() {
    let config = test_config().build().unwrap();
    let handler = Arc::new(CountingEcho::new(4));
    let endpoint = Endpoint::new(config, handler.clone()).unwrap();
    endpoint.start().unwrap();

    let mut stream = connect(&endpoint);
    // Three served with OPEN, the fourth answers then closes.
    for i in 0..4 {
        let msg = format!("ping-{i}\n");
        let echoed = round_trip(&mut stream, msg.as_bytes());
        assert_eq!(echoed, msg.as_bytes(), "request {i} was not echoed");
    }
    assert!(read_eof(&mut stream), "socket should close after request 4");
    assert_eq!(handler.processed.load(Ordering::SeqCst), 4);

    assert!(
        wait_until(Duration::from_secs(2), || endpoint.keep_alive_count() == 0),
        "keep-alive count should return to 0, got {}",
        endpoint.keep_alive_count()
    );

    endpoint.stop();
}

#[test]
fn keep_alive_count_tracks_idle_sockets() {
    let config = test_config().build().unwrap();
    let endpoint = Endpoint::new(config, Arc::new(CountingEcho::new(usize::MAX))).unwrap();
    endpoint.start().unwrap();

    let mut streams = Vec::new();
    for i in 0..8 {
        let mut stream = connect(&endpoint);
        let msg = format!("hello-{i}\n");
        assert_eq!(round_trip(&mut stream, msg.as_bytes()), msg.as_bytes());
        streams.push(stream);
    }
    assert!(
        wait_until(Duration::from_secs(2), || endpoint.keep_alive_count() == 8),
        "expected 8 idle keep-alive sockets, got {}",
        endpoint.keep_alive_count()
    );

    drop(streams);
    endpoint.stop();
}

#[test]
fn keep_alive_budget_closes_the_socket() {
    let mut builder = test_config().max_keep_alive_requests(2);
    builder.config_mut().use_sendfile = false;
    let config = builder.build().unwrap();
    let endpoint = Endpoint::new(config, Arc::new(CountingEcho::new(usize::MAX))).unwrap();
    endpoint.start().unwrap();

    let mut stream = connect(&endpoint);
    assert_eq!(round_trip(&mut stream, b"one\n"), b"one\n");
    assert_eq!(round_trip(&mut stream, b"two\n"), b"two\n");
    assert!(
        read_eof(&mut stream),
        "endpoint should close once the keep-alive budget is spent"
    );

    endpoint.stop();
}

// ── Idle timeout ────────────────────────────────────────────────────

#[test]
fn idle_keep_alive_socket_times_out() {
    let config = test_config()
        .so_timeout(400)
        .keep_alive_timeout(400)
        .build()
        .unwrap();
    let endpoint = Endpoint::new(config, Arc::new(CountingEcho::new(usize::MAX))).unwrap();
    endpoint.start().unwrap();

    let mut stream = connect(&endpoint);
    assert_eq!(round_trip(&mut stream, b"hi\n"), b"hi\n");
    // Go idle past the keep-alive timeout; the sweep cancels the socket.
    assert!(read_eof(&mut stream), "idle socket should be closed");
    assert!(wait_until(Duration::from_secs(2), || {
        endpoint.keep_alive_count() == 0
    }));

    endpoint.stop();
}

// ── Async parking ───────────────────────────────────────────────────

/// Parks the first request, records every event-mode status.
struct ParkingHandler {
    parked: Mutex<Option<ConnRef>>,
    statuses: Mutex<Vec<SocketStatus>>,
    resumed: AtomicUsize,
    on_resume: SocketState,
}

impl ParkingHandler {
    fn new(on_resume: SocketState) -> Self {
        Self {
            parked: Mutex::new(None),
            statuses: Mutex::new(Vec::new()),
            resumed: AtomicUsize::new(0),
            on_resume,
        }
    }

    fn statuses(&self) -> Vec<SocketStatus> {
        self.statuses.lock().unwrap().clone()
    }
}

impl Handler for ParkingHandler {
    fn process(&self, conn: &mut Connection) -> SocketState {
        let mut buf = [0u8; 1024];
        match conn.read(&mut buf) {
            Ok(0) => SocketState::Closed,
            Ok(_) => {
                *self.parked.lock().unwrap() = Some(conn.conn_ref());
                SocketState::Long
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => SocketState::Open,
            Err(_) => SocketState::Closed,
        }
    }

    fn event(&self, conn: &mut Connection, status: SocketStatus) -> SocketState {
        self.statuses.lock().unwrap().push(status);
        match status {
            SocketStatus::Timeout => SocketState::Closed,
            SocketStatus::Open => {
                let resumed = self.resumed.fetch_add(1, Ordering::SeqCst);
                if resumed == 0 && self.on_resume == SocketState::AsyncEnd {
                    SocketState::AsyncEnd
                } else {
                    let _ = conn.write(b"resumed\n");
                    SocketState::Closed
                }
            }
            _ => SocketState::Closed,
        }
    }

    fn release(&self, _conn: &mut Connection) {}
}

#[test]
fn parked_socket_times_out_exactly_once() {
    let config = test_config().so_timeout(400).build().unwrap();
    let handler = Arc::new(ParkingHandler::new(SocketState::Closed));
    let endpoint = Endpoint::new(config, handler.clone()).unwrap();
    endpoint.start().unwrap();

    let mut stream = connect(&endpoint);
    stream.write_all(b"park me\n").unwrap();

    // No readiness fires; TIMEOUT must be delivered exactly once.
    assert!(
        wait_until(Duration::from_secs(3), || !handler.statuses().is_empty()),
        "timeout was never delivered"
    );
    assert!(read_eof(&mut stream), "handler closed on timeout");
    std::thread::sleep(Duration::from_millis(600));
    let statuses = handler.statuses();
    assert_eq!(
        statuses,
        vec![SocketStatus::Timeout],
        "expected exactly one TIMEOUT, got {statuses:?}"
    );

    endpoint.stop();
}

#[test]
fn parked_socket_resumes_then_async_end_redispatches() {
    let config = test_config().build().unwrap();
    let handler = Arc::new(ParkingHandler::new(SocketState::AsyncEnd));
    let endpoint = Endpoint::new(config, handler.clone()).unwrap();
    endpoint.start().unwrap();

    let mut stream = connect(&endpoint);
    stream.write_all(b"park me\n").unwrap();

    let conn_ref = {
        assert!(wait_until(Duration::from_secs(2), || {
            handler.parked.lock().unwrap().is_some()
        }));
        handler.parked.lock().unwrap().unwrap()
    };

    // External resume before the timeout. The park happens right after
    // the handler returns LONG, so retry until the removal wins.
    assert!(
        wait_until(Duration::from_secs(2), || {
            endpoint.process_socket_async(conn_ref, SocketStatus::Open)
        }),
        "resume never won the waiting-set removal"
    );
    assert!(
        !endpoint.process_socket_async(conn_ref, SocketStatus::Open),
        "a second resume must lose the removal race"
    );

    let mut response = Vec::new();
    stream.read_to_end(&mut response).unwrap();
    assert_eq!(response, b"resumed\n");

    // OPEN from the resume, then OPEN again from the ASYNC_END relaunch.
    assert_eq!(
        handler.statuses(),
        vec![SocketStatus::Open, SocketStatus::Open]
    );

    endpoint.stop();
}

// ── Comet ───────────────────────────────────────────────────────────

/// Enters comet mode on the first request; later readiness arrives as
/// event-mode OPEN dispatches.
struct CometHandler {
    events: Mutex<Vec<SocketStatus>>,
}

impl Handler for CometHandler {
    fn process(&self, conn: &mut Connection) -> SocketState {
        let mut buf = [0u8; 1024];
        match conn.read(&mut buf) {
            Ok(0) => SocketState::Closed,
            Ok(_) => {
                conn.set_comet(true);
                let _ = conn.write(b"ack\n");
                SocketState::Open
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => SocketState::Open,
            Err(_) => SocketState::Closed,
        }
    }

    fn event(&self, conn: &mut Connection, status: SocketStatus) -> SocketState {
        self.events.lock().unwrap().push(status);
        if status == SocketStatus::Open {
            let mut buf = [0u8; 1024];
            match conn.read(&mut buf) {
                Ok(n) if n > 0 => {
                    let _ = conn.write(&buf[..n]);
                    conn.set_comet(false);
                    SocketState::Closed
                }
                _ => SocketState::Closed,
            }
        } else {
            SocketState::Closed
        }
    }

    fn release(&self, _conn: &mut Connection) {}
}

#[test]
fn comet_socket_gets_event_dispatch() {
    let config = test_config().build().unwrap();
    let handler = Arc::new(CometHandler {
        events: Mutex::new(Vec::new()),
    });
    let endpoint = Endpoint::new(config, handler.clone()).unwrap();
    endpoint.start().unwrap();

    let mut stream = connect(&endpoint);
    assert_eq!(round_trip(&mut stream, b"begin\n"), b"ack\n");
    // The socket is in comet mode now; the next bytes arrive as an
    // event-mode OPEN.
    assert_eq!(round_trip(&mut stream, b"data\n"), b"data\n");
    assert!(read_eof(&mut stream));
    assert_eq!(
        handler.events.lock().unwrap().as_slice(),
        &[SocketStatus::Open]
    );

    endpoint.stop();
}

// ── Sendfile ────────────────────────────────────────────────────────

/// Serves a file range for the first request, answers "done" afterwards.
struct FileServer {
    path: std::path::PathBuf,
    length: u64,
    requests: AtomicUsize,
}

impl Handler for FileServer {
    fn process(&self, conn: &mut Connection) -> SocketState {
        let mut buf = [0u8; 1024];
        match conn.read(&mut buf) {
            Ok(0) => SocketState::Closed,
            Ok(_) => {
                let request = self.requests.fetch_add(1, Ordering::SeqCst);
                if request == 0 {
                    conn.set_sendfile(Some(SendfileJob::new(&self.path, 0, self.length, true)));
                    SocketState::Open
                } else {
                    let _ = conn.write(b"done\n");
                    SocketState::Closed
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => SocketState::Open,
            Err(_) => SocketState::Closed,
        }
    }

    fn event(&self, _conn: &mut Connection, _status: SocketStatus) -> SocketState {
        SocketState::Closed
    }

    fn release(&self, _conn: &mut Connection) {}
}

#[test]
fn sendfile_large_range_reenters_keep_alive() {
    const LEN: usize = 8 * 1024 * 1024;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("payload.bin");
    let payload: Vec<u8> = (0..LEN).map(|i| (i % 251) as u8).collect();
    std::fs::write(&path, &payload).unwrap();

    let config = test_config().sendfile_threads(1).build().unwrap();
    let handler = Arc::new(FileServer {
        path,
        length: LEN as u64,
        requests: AtomicUsize::new(0),
    });
    let endpoint = Endpoint::new(config, handler).unwrap();
    endpoint.start().unwrap();

    let mut stream = connect(&endpoint);
    stream.write_all(b"GET payload\n").unwrap();
    // A slow client: let the socket buffers fill so the job parks on the
    // sendfile poller.
    std::thread::sleep(Duration::from_millis(300));

    let mut received = vec![0u8; LEN];
    stream.read_exact(&mut received).unwrap();
    assert_eq!(received, payload, "file bytes corrupted in flight");

    // Completion with keep_alive re-registers READ interest: a second
    // request must still be served.
    assert_eq!(round_trip(&mut stream, b"bye\n"), b"done\n");
    assert!(read_eof(&mut stream));
    assert_eq!(endpoint.sendfile_count(), 0);

    endpoint.stop();
}

#[test]
fn zero_length_sendfile_completes_synchronously() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("empty.bin");
    std::fs::write(&path, b"irrelevant").unwrap();

    let config = test_config().build().unwrap();
    let handler = Arc::new(FileServer {
        path,
        length: 0,
        requests: AtomicUsize::new(0),
    });
    let endpoint = Endpoint::new(config, handler).unwrap();
    endpoint.start().unwrap();

    let mut stream = connect(&endpoint);
    // The zero-length job completes inline; the socket stays keep-alive.
    stream.write_all(b"GET nothing\n").unwrap();
    assert_eq!(round_trip(&mut stream, b"bye\n"), b"done\n");
    assert!(read_eof(&mut stream));
    assert_eq!(endpoint.sendfile_count(), 0);

    endpoint.stop();
}

// ── Lifecycle ───────────────────────────────────────────────────────

/// Records every event-mode status; echoes forever otherwise.
struct RecordingEcho {
    statuses: Mutex<Vec<SocketStatus>>,
    processed: AtomicUsize,
}

impl Handler for RecordingEcho {
    fn process(&self, conn: &mut Connection) -> SocketState {
        self.processed.fetch_add(1, Ordering::SeqCst);
        let mut buf = [0u8; 1024];
        match conn.read(&mut buf) {
            Ok(0) => SocketState::Closed,
            Ok(n) => {
                let _ = conn.write(&buf[..n]);
                SocketState::Open
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => SocketState::Open,
            Err(_) => SocketState::Closed,
        }
    }

    fn event(&self, _conn: &mut Connection, status: SocketStatus) -> SocketState {
        self.statuses.lock().unwrap().push(status);
        SocketState::Closed
    }

    fn release(&self, _conn: &mut Connection) {}
}

#[test]
fn stop_cancels_idle_sockets_within_grace() {
    let config = test_config().build().unwrap();
    let handler = Arc::new(RecordingEcho {
        statuses: Mutex::new(Vec::new()),
        processed: AtomicUsize::new(0),
    });
    let endpoint = Endpoint::new(config, handler.clone()).unwrap();
    endpoint.start().unwrap();

    let mut streams = Vec::new();
    for i in 0..30 {
        let mut stream = connect(&endpoint);
        let msg = format!("warm-{i}\n");
        assert_eq!(round_trip(&mut stream, msg.as_bytes()), msg.as_bytes());
        streams.push(stream);
    }
    assert!(wait_until(Duration::from_secs(2), || {
        endpoint.keep_alive_count() == 30
    }));

    let began = Instant::now();
    endpoint.stop();
    assert!(
        began.elapsed() < Duration::from_secs(3),
        "stop took {:?}",
        began.elapsed()
    );
    assert!(!endpoint.is_running());
    assert_eq!(endpoint.keep_alive_count(), 0);

    for mut stream in streams {
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        assert!(read_eof(&mut stream), "socket survived stop");
    }
    // Idle plaintext sockets are torn down silently or with STOP; no
    // other status may reach the handler.
    for status in handler.statuses.lock().unwrap().iter() {
        assert_eq!(*status, SocketStatus::Stop);
    }
}

#[test]
fn lifecycle_is_idempotent_and_restartable() {
    let config = test_config().build().unwrap();
    let endpoint = Endpoint::new(config, Arc::new(CountingEcho::new(usize::MAX))).unwrap();

    endpoint.init().unwrap();
    endpoint.init().unwrap();
    endpoint.start().unwrap();
    endpoint.start().unwrap();

    let mut stream = connect(&endpoint);
    assert_eq!(round_trip(&mut stream, b"a\n"), b"a\n");
    drop(stream);

    endpoint.stop();
    endpoint.stop();
    assert!(!endpoint.is_running());

    // The listener survives stop; a fresh start serves again.
    endpoint.start().unwrap();
    let mut stream = connect(&endpoint);
    assert_eq!(round_trip(&mut stream, b"b\n"), b"b\n");
    drop(stream);

    endpoint.stop();
    endpoint.destroy();
    endpoint.destroy();
}

#[test]
fn paused_defer_accept_drops_without_processing() {
    let config = test_config().defer_accept(true).build().unwrap();
    let handler = Arc::new(RecordingEcho {
        statuses: Mutex::new(Vec::new()),
        processed: AtomicUsize::new(0),
    });
    let endpoint = Endpoint::new(config, handler.clone()).unwrap();
    endpoint.start().unwrap();
    endpoint.pause();
    assert!(endpoint.is_paused());

    let addr = endpoint.local_addr().unwrap();
    // Data pushes the connection through TCP_DEFER_ACCEPT; the acceptor
    // must drop it without any handler involvement.
    if let Ok(mut stream) = TcpStream::connect(addr) {
        let _ = stream.write_all(b"rubbish\n");
        stream
            .set_read_timeout(Some(Duration::from_secs(3)))
            .unwrap();
        let _ = read_eof(&mut stream);
    }
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(handler.processed.load(Ordering::SeqCst), 0);
    assert!(handler.statuses.lock().unwrap().is_empty());

    endpoint.resume();
    let mut stream = connect(&endpoint);
    assert_eq!(round_trip(&mut stream, b"alive\n"), b"alive\n");

    endpoint.stop();
}
