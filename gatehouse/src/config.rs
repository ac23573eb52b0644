use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

/// Client certificate verification mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VerifyMode {
    /// No client certificate is requested.
    #[default]
    None,
    /// A certificate is requested; connections without one are allowed.
    Optional,
    /// A valid client certificate is mandatory.
    Require,
    /// A certificate is requested but CA chain failures are tolerated.
    OptionalNoCa,
}

/// TLS material and policy. All paths point at PEM files.
#[derive(Debug, Clone, Default)]
pub struct TlsSettings {
    /// Server certificate.
    pub certificate_file: PathBuf,
    /// Private key for the certificate.
    pub certificate_key_file: PathBuf,
    /// Optional intermediate chain appended to the leaf.
    pub certificate_chain_file: Option<PathBuf>,
    /// CA bundle used to verify client certificates.
    pub ca_certificate_file: Option<PathBuf>,
    /// Certificate revocation lists.
    pub revocation_file: Option<PathBuf>,
    /// Cipher suite names to enable. Empty = rustls defaults.
    pub cipher_suites: Vec<String>,
    /// Protocol versions to enable (e.g. "TLSv1.2", "TLSv1.3"). Empty = all.
    pub protocols: Vec<String>,
    /// Client verification mode.
    pub verify: VerifyMode,
    /// Maximum client chain depth.
    pub verify_depth: u32,
}

/// Endpoint configuration.
///
/// Plain values with a [`ConfigBuilder`] for discoverable construction and
/// `build()` validation. Durations are milliseconds unless suffixed.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to bind.
    pub address: IpAddr,
    /// Port to bind.
    pub port: u16,
    /// TCP listen backlog.
    pub backlog: i32,
    /// Acceptor threads. 0 = 1.
    pub acceptor_threads: usize,
    /// Poller threads. 0 = number of CPUs.
    pub poller_threads: usize,
    /// Maximum sockets per poller; capped at the OS descriptor limit and
    /// degraded to 1024, then 62, when the limit cannot honor it.
    pub poller_size: usize,
    /// Maximum concurrent sendfile jobs across sendfile pollers.
    pub sendfile_size: usize,
    /// Sendfile poller threads. 0 = 1.
    pub sendfile_threads: usize,
    /// Idle timeout for keep-alive sockets. −1 = use `so_timeout`.
    pub keep_alive_timeout: i64,
    /// Default per-socket timeout.
    pub so_timeout: i64,
    /// Minimum interval between full timeout sweeps.
    pub timeout_interval: u64,
    /// Upper bound on one blocking readiness wait.
    pub selector_timeout: u64,
    /// Sendfile poller wait, in microseconds.
    pub poll_time_us: u64,
    /// Requests served per connection before the endpoint closes it.
    /// −1 = unlimited.
    pub max_keep_alive_requests: i64,
    /// Set TCP_NODELAY on accepted sockets.
    pub tcp_nodelay: bool,
    /// Enable SO_LINGER on accepted sockets.
    pub so_linger_on: bool,
    /// SO_LINGER timeout, seconds. Only meaningful with `so_linger_on`.
    pub so_linger_time: i32,
    /// Use TCP_DEFER_ACCEPT on the listener.
    pub defer_accept: bool,
    /// Enable the kernel-assisted sendfile engine.
    pub use_sendfile: bool,
    /// Allow comet (long-poll) request handling.
    pub use_comet: bool,
    /// Worker executor threads. 0 = number of CPUs.
    pub worker_threads: usize,
    /// Bounded executor queue depth; a full queue rejects dispatch.
    pub worker_queue: usize,
    /// Read buffer size per connection.
    pub read_buffer_size: usize,
    /// Write buffer size per connection.
    pub write_buffer_size: usize,
    /// Max pooled buffer pairs. −1 = unbounded.
    pub buffer_pool: i64,
    /// Max total bytes held by the buffer pool. −1 = unbounded.
    pub buffer_pool_bytes: i64,
    /// OOM parachute slab size in bytes. 0 disables it.
    pub oom_parachute: usize,
    /// TLS termination. `None` = plaintext endpoint.
    pub tls: Option<TlsSettings>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            backlog: 100,
            acceptor_threads: 1,
            poller_threads: 0,
            poller_size: 8 * 1024,
            sendfile_size: 1024,
            sendfile_threads: 1,
            keep_alive_timeout: -1,
            so_timeout: 20_000,
            timeout_interval: 1000,
            selector_timeout: 1000,
            poll_time_us: 2000,
            max_keep_alive_requests: 100,
            tcp_nodelay: false,
            so_linger_on: false,
            so_linger_time: -1,
            defer_accept: false,
            use_sendfile: true,
            use_comet: true,
            worker_threads: 0,
            worker_queue: 1024,
            read_buffer_size: 8192,
            write_buffer_size: 8192,
            buffer_pool: 500,
            buffer_pool_bytes: 100 * 1024 * 1024,
            oom_parachute: 1024 * 1024,
            tls: None,
        }
    }
}

impl Config {
    /// Validate configuration values. Returns an error if any value is out
    /// of range.
    pub fn validate(&self) -> Result<(), crate::error::Error> {
        if self.poller_size == 0 {
            return Err(crate::error::Error::Config(
                "poller_size must be > 0".into(),
            ));
        }
        if self.worker_queue == 0 {
            return Err(crate::error::Error::Config(
                "worker_queue must be > 0".into(),
            ));
        }
        if self.read_buffer_size == 0 || self.write_buffer_size == 0 {
            return Err(crate::error::Error::Config(
                "buffer sizes must be > 0".into(),
            ));
        }
        if self.timeout_interval == 0 {
            return Err(crate::error::Error::Config(
                "timeout_interval must be > 0".into(),
            ));
        }
        if self.selector_timeout == 0 {
            return Err(crate::error::Error::Config(
                "selector_timeout must be > 0".into(),
            ));
        }
        if self.so_timeout < -1 || self.keep_alive_timeout < -1 {
            return Err(crate::error::Error::Config(
                "timeouts must be >= -1".into(),
            ));
        }
        if let Some(tls) = &self.tls {
            if tls.certificate_file.as_os_str().is_empty()
                || tls.certificate_key_file.as_os_str().is_empty()
            {
                return Err(crate::error::Error::Config(
                    "TLS requires certificate_file and certificate_key_file".into(),
                ));
            }
            if tls.verify == VerifyMode::Require && tls.ca_certificate_file.is_none() {
                return Err(crate::error::Error::Config(
                    "verify = Require needs ca_certificate_file".into(),
                ));
            }
        }
        Ok(())
    }

    /// The socket address this endpoint binds.
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// Effective idle timeout for freshly registered keep-alive sockets.
    pub fn effective_keep_alive_timeout(&self) -> i64 {
        if self.keep_alive_timeout < 0 {
            self.so_timeout
        } else {
            self.keep_alive_timeout
        }
    }
}

/// Cap a requested poller size by the descriptor limit, degrading through
/// the 1024 → 62 fallback chain when the limit cannot honor the request.
pub(crate) fn effective_poller_size(requested: usize, descriptor_limit: usize) -> usize {
    if requested <= descriptor_limit {
        requested
    } else if 1024 <= descriptor_limit {
        1024
    } else {
        62
    }
}

/// Builder for [`Config`] with discoverable methods and `build()` validation.
///
/// # Example
///
/// ```rust
/// use gatehouse::ConfigBuilder;
///
/// let config = ConfigBuilder::new()
///     .port(0)
///     .poller_threads(2)
///     .worker_threads(4)
///     .keep_alive_timeout(15_000)
///     .tcp_nodelay(true)
///     .build()
///     .expect("invalid config");
/// ```
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default config values.
    pub fn new() -> Self {
        Self::default()
    }

    // ── Listener settings ────────────────────────────────────────────

    /// Set the bind address.
    pub fn address(mut self, addr: IpAddr) -> Self {
        self.config.address = addr;
        self
    }

    /// Set the bind port. 0 = ephemeral.
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Set the TCP listen backlog.
    pub fn backlog(mut self, n: i32) -> Self {
        self.config.backlog = n;
        self
    }

    /// Use TCP_DEFER_ACCEPT on the listener.
    pub fn defer_accept(mut self, enable: bool) -> Self {
        self.config.defer_accept = enable;
        self
    }

    // ── Thread settings ──────────────────────────────────────────────

    /// Set the number of acceptor threads.
    pub fn acceptor_threads(mut self, n: usize) -> Self {
        self.config.acceptor_threads = n;
        self
    }

    /// Set the number of poller threads. 0 = number of CPUs.
    pub fn poller_threads(mut self, n: usize) -> Self {
        self.config.poller_threads = n;
        self
    }

    /// Set the number of worker executor threads. 0 = number of CPUs.
    pub fn worker_threads(mut self, n: usize) -> Self {
        self.config.worker_threads = n;
        self
    }

    /// Set the bounded executor queue depth.
    pub fn worker_queue(mut self, n: usize) -> Self {
        self.config.worker_queue = n;
        self
    }

    /// Set the number of sendfile poller threads.
    pub fn sendfile_threads(mut self, n: usize) -> Self {
        self.config.sendfile_threads = n;
        self
    }

    // ── Capacity settings ────────────────────────────────────────────

    /// Set the maximum sockets per poller.
    pub fn poller_size(mut self, n: usize) -> Self {
        self.config.poller_size = n;
        self
    }

    /// Set the maximum concurrent sendfile jobs.
    pub fn sendfile_size(mut self, n: usize) -> Self {
        self.config.sendfile_size = n;
        self
    }

    /// Set per-connection read/write buffer sizes.
    pub fn buffer_sizes(mut self, read: usize, write: usize) -> Self {
        self.config.read_buffer_size = read;
        self.config.write_buffer_size = write;
        self
    }

    /// Set the pooled-buffer caps: pair count and total bytes (−1 = unbounded).
    pub fn buffer_pool(mut self, pairs: i64, bytes: i64) -> Self {
        self.config.buffer_pool = pairs;
        self.config.buffer_pool_bytes = bytes;
        self
    }

    /// Set the OOM parachute slab size. 0 disables it.
    pub fn oom_parachute(mut self, bytes: usize) -> Self {
        self.config.oom_parachute = bytes;
        self
    }

    // ── Timing settings ──────────────────────────────────────────────

    /// Set the keep-alive idle timeout. −1 = use `so_timeout`.
    pub fn keep_alive_timeout(mut self, ms: i64) -> Self {
        self.config.keep_alive_timeout = ms;
        self
    }

    /// Set the default per-socket timeout.
    pub fn so_timeout(mut self, ms: i64) -> Self {
        self.config.so_timeout = ms;
        self
    }

    /// Set the minimum interval between timeout sweeps.
    pub fn timeout_interval(mut self, ms: u64) -> Self {
        self.config.timeout_interval = ms;
        self
    }

    /// Set the blocking readiness wait bound.
    pub fn selector_timeout(mut self, ms: u64) -> Self {
        self.config.selector_timeout = ms;
        self
    }

    /// Set the sendfile poller wait, in microseconds.
    pub fn poll_time_us(mut self, us: u64) -> Self {
        self.config.poll_time_us = us;
        self
    }

    /// Set the keep-alive request budget per connection. −1 = unlimited.
    pub fn max_keep_alive_requests(mut self, n: i64) -> Self {
        self.config.max_keep_alive_requests = n;
        self
    }

    // ── Socket properties ────────────────────────────────────────────

    /// Enable TCP_NODELAY on accepted sockets.
    pub fn tcp_nodelay(mut self, enable: bool) -> Self {
        self.config.tcp_nodelay = enable;
        self
    }

    /// Configure SO_LINGER on accepted sockets.
    pub fn so_linger(mut self, on: bool, seconds: i32) -> Self {
        self.config.so_linger_on = on;
        self.config.so_linger_time = seconds;
        self
    }

    // ── Feature toggles ──────────────────────────────────────────────

    /// Enable the kernel-assisted sendfile engine.
    pub fn use_sendfile(mut self, enable: bool) -> Self {
        self.config.use_sendfile = enable;
        self
    }

    /// Allow comet (long-poll) request handling.
    pub fn use_comet(mut self, enable: bool) -> Self {
        self.config.use_comet = enable;
        self
    }

    /// Terminate TLS with the given material.
    pub fn tls(mut self, settings: TlsSettings) -> Self {
        self.config.tls = Some(settings);
        self
    }

    // ── Escape hatch ─────────────────────────────────────────────────

    /// Mutable access to the underlying config for fields not covered by
    /// builder methods.
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    // ── Terminal ─────────────────────────────────────────────────────

    /// Validate and build the final [`Config`].
    pub fn build(self) -> Result<Config, crate::error::Error> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_poller_size() {
        let mut config = Config::default();
        config.poller_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn tls_requires_material() {
        let mut config = Config::default();
        config.tls = Some(TlsSettings::default());
        assert!(config.validate().is_err());
    }

    #[test]
    fn tls_require_needs_ca() {
        let mut config = Config::default();
        config.tls = Some(TlsSettings {
            certificate_file: "cert.pem".into(),
            certificate_key_file: "key.pem".into(),
            verify: VerifyMode::Require,
            ..Default::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn keep_alive_falls_back_to_so_timeout() {
        let config = ConfigBuilder::new()
            .so_timeout(7000)
            .keep_alive_timeout(-1)
            .build()
            .unwrap();
        assert_eq!(config.effective_keep_alive_timeout(), 7000);

        let config = ConfigBuilder::new()
            .so_timeout(7000)
            .keep_alive_timeout(3000)
            .build()
            .unwrap();
        assert_eq!(config.effective_keep_alive_timeout(), 3000);
    }

    #[test]
    fn poller_size_degrade_chain() {
        // Fits under the limit: untouched.
        assert_eq!(effective_poller_size(8192, 65536), 8192);
        // Over the limit, 1024 fits: degrade to 1024.
        assert_eq!(effective_poller_size(8192, 4096), 1024);
        // Even 1024 does not fit: degrade to 62.
        assert_eq!(effective_poller_size(8192, 512), 62);
        assert_eq!(effective_poller_size(2000, 100), 62);
    }
}
