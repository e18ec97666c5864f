use std::io;

use thiserror::Error;

/// Errors returned by the hearth daemon.
#[derive(Debug, Error)]
pub enum Error {
    /// Socket or file I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Listener setup failed (bad address, bind/listen failure).
    #[error("listener setup: {0}")]
    Bind(String),
    /// Configuration validation failed.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// No free connection slots available.
    #[error("connection limit reached")]
    ConnectionLimitReached,
    /// Invalid connection id (stale generation or out of range).
    #[error("invalid connection")]
    InvalidConnection,
    /// Per-connection memory pool could not satisfy an allocation.
    #[error("memory pool exhausted")]
    PoolExhausted,
    /// System resource limit too low (e.g. RLIMIT_NOFILE).
    #[error("{0}")]
    ResourceLimit(String),
    /// Operation is not available under the selected threading model.
    #[error("unsupported under this threading model: {0}")]
    UnsupportedModel(&'static str),
    /// TLS setup or handshake failure.
    #[cfg(feature = "tls")]
    #[error("TLS: {0}")]
    Tls(String),
}
