//! Host-facing callbacks and the per-request view handed to them.
//!
//! The library owns sockets, parsing, and transmission; the application
//! supplies a [`Handler`]. `on_request` is invoked once when the headers are
//! complete, then once per received slice of the upload body, then a final
//! time with an empty, last upload slice. The handler answers by queueing a
//! response (immediately or later, after suspending the connection).

use std::any::Any;
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use crate::connection::Connection;
use crate::headers::FieldKind;
use crate::response::Response;

/// Opaque connection identifier, stable for the life of one connection.
/// Stale ids (the slot was reused) are detected by generation and refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId {
    pub(crate) worker: u16,
    pub(crate) slot: u32,
    pub(crate) generation: u32,
}

/// Connection lifecycle notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnEvent {
    Started,
    Closed,
}

/// Why a request finished, reported to the response termination callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionReason {
    /// Response fully sent.
    Ok,
    /// Protocol or transport error tore the connection down.
    Error,
    /// Peer went away before the response completed.
    ClientAbort,
    /// Daemon shutdown forced the close.
    DaemonShutdown,
}

/// Handler verdict for one `on_request` invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestAction {
    /// Keep driving the request. A response may be queued now or later.
    Continue,
    /// Abort: close the connection without a response.
    Abort,
}

/// The upload-body window for one `on_request` call.
pub struct Upload<'a> {
    pub(crate) data: &'a [u8],
    pub(crate) consumed: usize,
    pub(crate) last: bool,
}

impl<'a> Upload<'a> {
    /// Decoded body bytes available in this call.
    pub fn data(&self) -> &[u8] {
        self.data
    }

    /// Mark `n` bytes as processed. Unconsumed bytes are presented again on
    /// the next call, together with newly arrived data. Calling this more
    /// than once accumulates.
    pub fn consume(&mut self, n: usize) {
        self.consumed = (self.consumed + n).min(self.data.len());
    }

    /// True on the final call: the whole upload (and any trailers) has been
    /// received and this window is empty.
    pub fn is_last(&self) -> bool {
        self.last
    }
}

/// Per-request view handed to [`Handler::on_request`].
pub struct RequestCtx<'a> {
    pub(crate) conn: &'a mut Connection,
}

impl<'a> RequestCtx<'a> {
    /// Request method, e.g. `GET`.
    pub fn method(&self) -> &str {
        self.conn.method_str()
    }

    /// Percent-decoded request path, query string removed.
    pub fn url(&self) -> &str {
        self.conn.url_str()
    }

    /// HTTP version string, e.g. `HTTP/1.1`.
    pub fn version(&self) -> &str {
        self.conn.version_str()
    }

    /// First header (or query argument, cookie, trailer) of `kind` named
    /// `name`, case-insensitive.
    pub fn value(&self, kind: FieldKind, name: &str) -> Option<&str> {
        self.conn.field_value(kind, name)
    }

    /// Shorthand for [`RequestCtx::value`] with [`FieldKind::Header`].
    pub fn header(&self, name: &str) -> Option<&str> {
        self.value(FieldKind::Header, name)
    }

    /// All received fields in insertion order as `(kind, name, value)`.
    pub fn fields(&self) -> impl Iterator<Item = (FieldKind, &str, &str)> {
        self.conn.fields_iter()
    }

    /// Peer address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.conn.peer_addr
    }

    /// Identifier for suspend/resume and out-of-band response queueing.
    pub fn connection_id(&self) -> ConnId {
        self.conn.id()
    }

    /// Application state carried across `on_request` calls of one request.
    pub fn context(&mut self) -> &mut Option<Box<dyn Any + Send>> {
        &mut self.conn.request.client_context
    }

    /// Queue the response. Returns false if one is already queued.
    pub fn queue_response(&mut self, status: u16, response: Arc<Response>) -> bool {
        self.conn.queue_response(status, response)
    }

    /// Stop dispatching events for this connection until
    /// [`Daemon::resume`](crate::Daemon::resume). The idle timeout does not
    /// run while suspended.
    pub fn suspend(&mut self) {
        self.conn.suspend_requested = true;
    }

    /// Override the idle timeout for this connection. `None` disables it.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.conn.connection_timeout = timeout;
        self.conn.timeout_dirty = true;
    }
}

/// The socket of an upgraded connection, handed to the upgrade handler
/// after the `101` response headers drain. Dropping it closes the socket.
pub struct UpgradeStream {
    /// The connection's socket, now owned by the application.
    pub stream: TcpStream,
    /// Bytes the daemon had already read past the end of the upgrade
    /// request; process these before reading from the stream.
    pub extra_in: Vec<u8>,
}

/// Application callbacks. All methods except [`Handler::on_request`] have
/// default no-op implementations.
pub trait Handler: Send + Sync + 'static {
    /// Called when headers complete, per upload window, and finally with an
    /// empty last window. See [`Upload`].
    fn on_request(&self, req: &mut RequestCtx<'_>, upload: &mut Upload<'_>) -> RequestAction;

    /// Accept or refuse a connection before any bytes are read.
    fn accept_policy(&self, _addr: &SocketAddr) -> bool {
        true
    }

    /// Observes the raw request target (before unescaping) as soon as the
    /// request line is parsed.
    fn uri_log(&self, _uri: &str, _conn: ConnId) {}

    /// Connection lifecycle notifications.
    fn on_connection(&self, _conn: ConnId, _event: ConnEvent) {}
}

/// Plain-closure handler for hosts that don't need the other callbacks.
impl<F> Handler for F
where
    F: Fn(&mut RequestCtx<'_>, &mut Upload<'_>) -> RequestAction + Send + Sync + 'static,
{
    fn on_request(&self, req: &mut RequestCtx<'_>, upload: &mut Upload<'_>) -> RequestAction {
        self(req, upload)
    }
}
