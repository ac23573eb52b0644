//! Endpoint runtime metrics.
//!
//! Counters for connection lifecycle, failure classes, timeouts, and the
//! sendfile engine, plus gauges for the keep-alive and sendfile pools.
//! Exposed through the metriken registry for Prometheus exposition by the
//! host.

use metriken::{metric, Counter, Gauge};

// ── Connection lifecycle ─────────────────────────────────────────

#[metric(
    name = "gatehouse/connections/accepted",
    description = "Total connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "gatehouse/connections/closed",
    description = "Total connections closed"
)]
pub static CONNECTIONS_CLOSED: Counter = Counter::new();

#[metric(
    name = "gatehouse/connections/keepalive",
    description = "Idle keep-alive connections currently held in readiness queues"
)]
pub static KEEPALIVE_CONNECTIONS: Gauge = Gauge::new();

// ── Failure classes ──────────────────────────────────────────────

#[metric(
    name = "gatehouse/accept/failures",
    description = "accept() errors outside shutdown"
)]
pub static ACCEPT_FAILURES: Counter = Counter::new();

#[metric(
    name = "gatehouse/poller/rebuilds",
    description = "Readiness queues rebuilt after a critical poll failure"
)]
pub static POLLER_REBUILDS: Counter = Counter::new();

#[metric(
    name = "gatehouse/workers/rejected",
    description = "Dispatches refused by the worker executor"
)]
pub static WORKER_REJECTIONS: Counter = Counter::new();

#[metric(
    name = "gatehouse/tls/handshake_failures",
    description = "TLS handshakes that failed"
)]
pub static HANDSHAKE_FAILURES: Counter = Counter::new();

#[metric(
    name = "gatehouse/oom/parachute_released",
    description = "Times the OOM parachute was released"
)]
pub static PARACHUTE_RELEASED: Counter = Counter::new();

// ── Timeouts ─────────────────────────────────────────────────────

#[metric(
    name = "gatehouse/timeouts/idle",
    description = "Keep-alive sockets cancelled by the sweep"
)]
pub static IDLE_TIMEOUTS: Counter = Counter::new();

#[metric(
    name = "gatehouse/timeouts/async",
    description = "TIMEOUT dispatches to parked async sockets"
)]
pub static ASYNC_TIMEOUTS: Counter = Counter::new();

// ── Sendfile ─────────────────────────────────────────────────────

#[metric(
    name = "gatehouse/sendfile/completed",
    description = "Sendfile jobs fully transmitted"
)]
pub static SENDFILE_COMPLETED: Counter = Counter::new();

#[metric(
    name = "gatehouse/sendfile/active",
    description = "Sendfile jobs currently parked on write readiness"
)]
pub static SENDFILE_ACTIVE: Gauge = Gauge::new();

#[metric(
    name = "gatehouse/sendfile/errors",
    description = "Sendfile jobs aborted on I/O error"
)]
pub static SENDFILE_ERRORS: Counter = Counter::new();
