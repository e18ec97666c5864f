//! hearth — an embeddable HTTP/1.x server library.
//!
//! hearth is linked into a host application, which supplies a request
//! handler and optional policy callbacks; the library owns the listening
//! socket, the connection lifecycle, request parsing, and response
//! transmission. It is not a framework: no routing, no templating, no
//! middleware — only the byte-level mechanics of serving HTTP/1.0 and
//! HTTP/1.1 over TCP (optionally TLS via rustls) to many concurrent
//! clients in one process.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use hearth::{ConfigBuilder, Daemon, Response, RequestAction, RequestCtx, Upload};
//!
//! fn hello(req: &mut RequestCtx<'_>, upload: &mut Upload<'_>) -> RequestAction {
//!     if upload.is_last() || req.method() == "GET" {
//!         let body = format!("you asked for {}", req.url());
//!         req.queue_response(200, Response::from_buffer(body.into_bytes()));
//!     }
//!     upload.consume(upload.data().len());
//!     RequestAction::Continue
//! }
//!
//! fn main() -> Result<(), hearth::Error> {
//!     let config = ConfigBuilder::new()
//!         .bind("127.0.0.1:8080".parse().unwrap())
//!         .build()?;
//!     let daemon = Daemon::start(config, hello)?;
//!     std::thread::park();
//!     daemon.stop();
//!     Ok(())
//! }
//! ```
//!
//! # Threading models
//!
//! The daemon runs under one of four models, selected in the config: a
//! host-driven external event loop, one internal poll thread, an acceptor
//! plus worker pool, or one thread per connection. See
//! [`ThreadingModel`].

// ── Internal modules ────────────────────────────────────────────────
pub(crate) mod acceptor;
pub(crate) mod connection;
pub(crate) mod daemon;
pub(crate) mod date;
pub(crate) mod event_loop;
pub(crate) mod fsm;
pub(crate) mod headers;
pub(crate) mod itc;
pub(crate) mod lists;
pub(crate) mod pool;
pub(crate) mod poller;
pub(crate) mod request;
pub(crate) mod wire;

// ── Public modules ──────────────────────────────────────────────────
pub mod config;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod response;

// ── Re-exports: daemon control ──────────────────────────────────────

/// A running daemon; start, query, stop.
pub use daemon::Daemon;

// ── Re-exports: configuration ───────────────────────────────────────

/// Daemon configuration.
pub use config::Config;
/// Builder for [`Config`] with discoverable methods and `build()` validation.
pub use config::ConfigBuilder;
/// Which readiness syscall the internal loops block in.
pub use config::PollBackend;
/// How the daemon schedules connection processing.
pub use config::ThreadingModel;

// ── Re-exports: handler surface ─────────────────────────────────────

/// Connection lifecycle notification passed to [`Handler::on_connection`].
pub use handler::ConnEvent;
/// Opaque connection identifier for suspend/resume.
pub use handler::ConnId;
/// Why a request finished, passed to the termination callback.
pub use handler::CompletionReason;
/// Application callbacks.
pub use handler::Handler;
/// Handler verdict for one dispatch.
pub use handler::RequestAction;
/// Per-request view handed to the handler.
pub use handler::RequestCtx;
/// Upload-body window handed to the handler.
pub use handler::Upload;
/// Socket of an upgraded connection, owned by the application.
pub use handler::UpgradeStream;

// ── Re-exports: responses ───────────────────────────────────────────

/// Outcome of one pull-callback invocation.
pub use response::ContentRead;
/// Shared, reference-counted HTTP response.
pub use response::Response;
/// Sentinel for streamed bodies of unknown size.
pub use response::SIZE_UNKNOWN;

// ── Re-exports: headers and errors ──────────────────────────────────

/// Where in the protocol a request field came from.
pub use headers::FieldKind;

/// Errors returned by the daemon.
pub use error::Error;
