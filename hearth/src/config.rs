use std::net::SocketAddr;
use std::time::Duration;

/// How the daemon schedules connection processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadingModel {
    /// No internal threads. The host drives the daemon through
    /// [`Daemon::get_fdset`](crate::Daemon::get_fdset),
    /// [`Daemon::get_timeout`](crate::Daemon::get_timeout) and
    /// [`Daemon::run_from_select`](crate::Daemon::run_from_select).
    ExternalEventLoop,
    /// One internal thread owning the poll loop and all connections.
    InternalThread,
    /// A designated acceptor plus `n` workers, each with its own poller and
    /// wake channel; accepted sockets are handed off round-robin.
    ThreadPool(usize),
    /// One joinable thread per accepted connection; the daemon thread only
    /// accepts.
    ThreadPerConnection,
}

/// Which readiness syscall the event loop blocks in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollBackend {
    /// epoll on Linux, poll elsewhere.
    Auto,
    /// `select(2)`. Rejects fds at or above `FD_SETSIZE`.
    Select,
    /// `poll(2)`.
    Poll,
    /// `epoll(7)` (Linux only). Readiness is drained fairly, FIFO.
    Epoll,
}

/// Default per-connection pool size.
pub const POOL_SIZE_DEFAULT: usize = 32 * 1024;

/// Default additive increment when growing the read buffer.
pub const BUF_INC_DEFAULT: usize = 1024;

/// Daemon configuration.
#[derive(Clone)]
pub struct Config {
    /// Address to listen on.
    pub bind: Option<SocketAddr>,
    /// `listen(2)` backlog.
    pub backlog: i32,
    /// Set SO_REUSEADDR on the listener.
    pub reuse_addr: bool,
    /// Set TCP_NODELAY on accepted connections.
    pub tcp_nodelay: bool,
    /// Threading model, see [`ThreadingModel`].
    pub threading: ThreadingModel,
    /// Readiness backend for the internal loops.
    pub poll_backend: PollBackend,
    /// Per-connection memory pool size in bytes. Bounds request line +
    /// headers + buffered body window + response header staging.
    pub connection_memory_limit: usize,
    /// Additive read-buffer growth step, strictly smaller than the pool.
    pub connection_memory_increment: usize,
    /// Idle timeout for connections. `None` disables eviction.
    pub connection_timeout: Option<Duration>,
    /// Maximum simultaneously open connections. 0 = unlimited.
    pub global_connection_limit: u32,
    /// Maximum simultaneously open connections per peer IP. 0 = unlimited.
    pub ip_connection_limit: u32,
    /// Maximum connection slots per event loop.
    pub max_connections: u32,
    /// Disable the optional `shutdown()` before close and read
    /// optimistically after accept, before the first poll.
    pub turbo: bool,
    /// Do not auto-inject the `Date:` response header.
    pub suppress_date: bool,
    /// Serve TLS with this rustls config on all accepted connections.
    #[cfg(feature = "tls")]
    pub tls: Option<std::sync::Arc<rustls::ServerConfig>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: None,
            backlog: 511,
            reuse_addr: true,
            tcp_nodelay: true,
            threading: ThreadingModel::InternalThread,
            poll_backend: PollBackend::Auto,
            connection_memory_limit: POOL_SIZE_DEFAULT,
            connection_memory_increment: BUF_INC_DEFAULT,
            connection_timeout: None,
            global_connection_limit: 0,
            ip_connection_limit: 0,
            max_connections: 16000,
            turbo: false,
            suppress_date: false,
            #[cfg(feature = "tls")]
            tls: None,
        }
    }
}

impl Config {
    /// Validate configuration values. Returns an error if any value is out
    /// of range or the combination cannot work.
    pub fn validate(&self) -> Result<(), crate::error::Error> {
        use crate::error::Error;
        if self.connection_memory_limit < 256 {
            return Err(Error::Config(
                "connection_memory_limit must be >= 256".into(),
            ));
        }
        if self.connection_memory_increment == 0
            || self.connection_memory_increment >= self.connection_memory_limit
        {
            return Err(Error::Config(
                "connection_memory_increment must be > 0 and < connection_memory_limit".into(),
            ));
        }
        if self.max_connections == 0 || self.max_connections >= (1 << 24) {
            return Err(Error::Config(
                "max_connections must be > 0 and < 2^24".into(),
            ));
        }
        if let ThreadingModel::ThreadPool(n) = self.threading {
            if n == 0 {
                return Err(Error::Config("thread pool size must be > 0".into()));
            }
        }
        #[cfg(not(target_os = "linux"))]
        if self.poll_backend == PollBackend::Epoll {
            return Err(Error::Config("epoll is only available on Linux".into()));
        }
        Ok(())
    }

    /// Resolve `Auto` to a concrete backend for this platform.
    pub(crate) fn resolved_backend(&self) -> PollBackend {
        match self.poll_backend {
            PollBackend::Auto => {
                if cfg!(target_os = "linux") {
                    PollBackend::Epoll
                } else {
                    PollBackend::Poll
                }
            }
            other => other,
        }
    }
}

/// Builder for [`Config`] with discoverable methods and `build()` validation.
///
/// # Example
///
/// ```rust
/// use hearth::{ConfigBuilder, ThreadingModel};
///
/// let config = ConfigBuilder::new()
///     .bind("127.0.0.1:8080".parse().unwrap())
///     .threading(ThreadingModel::ThreadPool(4))
///     .connection_timeout(std::time::Duration::from_secs(30))
///     .memory_limit(64 * 1024)
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

    /// Set the bind address for the TCP listener.
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.config.bind = Some(addr);
        self
    }

    /// Set the `listen(2)` backlog.
    pub fn backlog(mut self, n: i32) -> Self {
        self.config.backlog = n;
        self
    }

    /// Allow reusing the address:port combination when binding.
    pub fn reuse_addr(mut self, enable: bool) -> Self {
        self.config.reuse_addr = enable;
        self
    }

    /// Enable or disable TCP_NODELAY on accepted connections.
    pub fn tcp_nodelay(mut self, enable: bool) -> Self {
        self.config.tcp_nodelay = enable;
        self
    }

    // ── Scheduling settings ──────────────────────────────────────────

    /// Select the threading model.
    pub fn threading(mut self, model: ThreadingModel) -> Self {
        self.config.threading = model;
        self
    }

    /// Select the readiness syscall.
    pub fn poll_backend(mut self, backend: PollBackend) -> Self {
        self.config.poll_backend = backend;
        self
    }

    // ── Connection settings ──────────────────────────────────────────

    /// Per-connection memory pool size in bytes.
    pub fn memory_limit(mut self, bytes: usize) -> Self {
        self.config.connection_memory_limit = bytes;
        self
    }

    /// Additive read-buffer growth step in bytes.
    pub fn memory_increment(mut self, bytes: usize) -> Self {
        self.config.connection_memory_increment = bytes;
        self
    }

    /// Idle timeout after which a connection is evicted.
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_timeout = Some(timeout);
        self
    }

    /// Maximum simultaneously open connections. 0 = unlimited.
    pub fn global_connection_limit(mut self, n: u32) -> Self {
        self.config.global_connection_limit = n;
        self
    }

    /// Maximum simultaneously open connections per peer IP. 0 = unlimited.
    pub fn ip_connection_limit(mut self, n: u32) -> Self {
        self.config.ip_connection_limit = n;
        self
    }

    /// Maximum connection slots per event loop.
    pub fn max_connections(mut self, n: u32) -> Self {
        self.config.max_connections = n;
        self
    }

    // ── Behavior toggles ─────────────────────────────────────────────

    /// Enable turbo mode (skip optional `shutdown()`, optimistic reads).
    pub fn turbo(mut self, enable: bool) -> Self {
        self.config.turbo = enable;
        self
    }

    /// Suppress the auto-injected `Date:` response header.
    pub fn suppress_date(mut self, enable: bool) -> Self {
        self.config.suppress_date = enable;
        self
    }

    /// Serve TLS on all accepted connections.
    #[cfg(feature = "tls")]
    pub fn tls(mut self, config: std::sync::Arc<rustls::ServerConfig>) -> Self {
        self.config.tls = Some(config);
        self
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
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn tiny_pool_rejected() {
        let mut c = Config::default();
        c.connection_memory_limit = 64;
        assert!(c.validate().is_err());
    }

    #[test]
    fn increment_must_fit_under_limit() {
        let mut c = Config::default();
        c.connection_memory_increment = c.connection_memory_limit;
        assert!(c.validate().is_err());
        c.connection_memory_increment = 0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn empty_thread_pool_rejected() {
        let c = ConfigBuilder::new().threading(ThreadingModel::ThreadPool(0));
        assert!(c.build().is_err());
    }

    #[test]
    fn builder_round_trip() {
        let c = ConfigBuilder::new()
            .backlog(128)
            .turbo(true)
            .memory_limit(4096)
            .memory_increment(512)
            .ip_connection_limit(8)
            .build()
            .unwrap();
        assert_eq!(c.backlog, 128);
        assert!(c.turbo);
        assert_eq!(c.connection_memory_limit, 4096);
        assert_eq!(c.ip_connection_limit, 8);
    }
}
