//! Shared, reference-counted HTTP responses.
//!
//! A response is built once and may be queued on many connections at the
//! same time, so it is handed around as `Arc<Response>`: every queue clones
//! the handle, connection cleanup drops it, and the content-reader free
//! callback runs when the last clone goes away. Interior state that
//! connections mutate concurrently (the pull-callback scratch window, the
//! header lists) sits behind one mutex; the pull callback itself is always
//! invoked with the lock released.

use std::fs::File;
use std::io;
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::handler::UpgradeStream;

/// Sentinel for "size not known in advance" on the wire: streamed bodies
/// are chunked on HTTP/1.1 and close-framed on HTTP/1.0.
pub const SIZE_UNKNOWN: u64 = u64::MAX;

/// Result of one pull-callback invocation.
pub enum ContentRead {
    /// `n` bytes were written to the front of the buffer.
    Data(usize),
    /// No data available right now; the connection blocks until the
    /// application resumes it.
    Pause,
    /// Body complete.
    EndOfStream,
    /// Abort the connection.
    Error,
}

/// Pull callback: `(position, buffer)` → outcome. Invoked without the
/// response lock held.
pub type ContentReader = dyn Fn(u64, &mut [u8]) -> ContentRead + Send + Sync;

pub(crate) enum Body {
    /// Complete body available up front.
    Buffer(Bytes),
    /// File-backed body; `sendfile` on plaintext wires, `read_at` fallback
    /// behind TLS.
    Fd { file: File, offset: u64 },
    /// Application pull callback.
    Callback(Box<ContentReader>),
    /// No body: the socket is handed to the upgrade handler after the
    /// `101` headers drain.
    Upgrade,
}

/// Scratch window for callback/file bodies, plus the mutable header lists.
struct Shared {
    headers: Vec<(String, String)>,
    trailers: Vec<(String, String)>,
    /// Byte position in the body stream where `data` starts.
    data_start: u64,
    /// Filled prefix of `data`.
    data_size: usize,
    data: Vec<u8>,
    upgrade: Option<Box<dyn FnOnce(UpgradeStream) + Send>>,
    termination_cb: Option<Arc<dyn Fn(crate::handler::CompletionReason) + Send + Sync>>,
}

pub struct Response {
    pub(crate) body: Body,
    /// Total body size, or [`SIZE_UNKNOWN`].
    pub(crate) total_size: u64,
    /// Respond with HTTP/1.0 framing even to HTTP/1.1 clients.
    pub(crate) v10_only: bool,
    shared: Mutex<Shared>,
}

/// Size of the pull-callback scratch window.
const SCRATCH_SIZE: usize = 8 * 1024;

impl Response {
    fn new(body: Body, total_size: u64) -> Arc<Response> {
        Arc::new(Response {
            body,
            total_size,
            v10_only: false,
            shared: Mutex::new(Shared {
                headers: Vec::new(),
                trailers: Vec::new(),
                data_start: 0,
                data_size: 0,
                data: Vec::new(),
                upgrade: None,
                termination_cb: None,
            }),
        })
    }

    /// Response with a complete in-memory body.
    pub fn from_buffer(data: impl Into<Bytes>) -> Arc<Response> {
        let data = data.into();
        let len = data.len() as u64;
        Self::new(Body::Buffer(data), len)
    }

    /// Empty-body response (status-only replies, errors, 204s).
    pub fn empty() -> Arc<Response> {
        Self::from_buffer(Bytes::new())
    }

    /// Response backed by an open file. `size` bytes starting at `offset`
    /// are sent; pass the file length for whole-file responses.
    pub fn from_fd(file: File, offset: u64, size: u64) -> Arc<Response> {
        Self::new(Body::Fd { file, offset }, size)
    }

    /// Response pulled from a callback. `total_size: None` streams with
    /// chunked framing on HTTP/1.1 and close-framing on HTTP/1.0.
    pub fn from_callback<F>(total_size: Option<u64>, reader: F) -> Arc<Response>
    where
        F: Fn(u64, &mut [u8]) -> ContentRead + Send + Sync + 'static,
    {
        Self::new(
            Body::Callback(Box::new(reader)),
            total_size.unwrap_or(SIZE_UNKNOWN),
        )
    }

    /// `101 Switching Protocols` response. Once its headers are on the
    /// wire the connection's socket is handed to `handler` and the daemon
    /// stops driving the request state machine.
    pub fn for_upgrade<F>(handler: F) -> Arc<Response>
    where
        F: FnOnce(UpgradeStream) + Send + 'static,
    {
        let resp = Self::new(Body::Upgrade, 0);
        resp.shared.lock().unwrap().upgrade = Some(Box::new(handler));
        resp
    }

    /// Add a response header. May be called from any thread until the
    /// response is queued.
    pub fn add_header(&self, name: impl Into<String>, value: impl Into<String>) {
        self.shared
            .lock()
            .unwrap()
            .headers
            .push((name.into(), value.into()));
    }

    /// Add a trailer, sent after the final chunk of a chunked response.
    /// Ignored for responses with known size.
    pub fn add_trailer(&self, name: impl Into<String>, value: impl Into<String>) {
        self.shared
            .lock()
            .unwrap()
            .trailers
            .push((name.into(), value.into()));
    }

    /// Respond with HTTP/1.0 framing regardless of the request version.
    /// Only effective before the response handle has been shared.
    pub fn set_v10_only(response: &mut Arc<Response>) {
        if let Some(inner) = Arc::get_mut(response) {
            inner.v10_only = true;
        }
    }

    /// Called once per request this response completes, with the reason.
    pub fn set_termination_callback<F>(&self, cb: F)
    where
        F: Fn(crate::handler::CompletionReason) + Send + Sync + 'static,
    {
        self.shared.lock().unwrap().termination_cb = Some(Arc::new(cb));
    }

    pub(crate) fn is_upgrade(&self) -> bool {
        matches!(self.body, Body::Upgrade)
    }

    /// Snapshot headers for serialization; whether any equals `name`.
    pub(crate) fn headers_snapshot(&self) -> Vec<(String, String)> {
        self.shared.lock().unwrap().headers.clone()
    }

    pub(crate) fn trailers_snapshot(&self) -> Vec<(String, String)> {
        self.shared.lock().unwrap().trailers.clone()
    }

    pub(crate) fn has_header(&self, name: &str) -> bool {
        self.shared
            .lock()
            .unwrap()
            .headers
            .iter()
            .any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// Any header of `name` carrying the comma-separated `token`.
    pub(crate) fn header_has_token(&self, name: &str, token: &str) -> bool {
        self.shared
            .lock()
            .unwrap()
            .headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .any(|(_, v)| crate::headers::has_token(v.as_bytes(), token))
    }

    pub(crate) fn take_upgrade_handler(&self) -> Option<Box<dyn FnOnce(UpgradeStream) + Send>> {
        self.shared.lock().unwrap().upgrade.take()
    }

    pub(crate) fn notify_completed(&self, reason: crate::handler::CompletionReason) {
        let cb = self.shared.lock().unwrap().termination_cb.clone();
        if let Some(cb) = cb {
            cb(reason);
        }
    }

    /// Direct slice access for buffer bodies.
    pub(crate) fn buffer(&self) -> Option<&Bytes> {
        match &self.body {
            Body::Buffer(b) => Some(b),
            _ => None,
        }
    }

    /// Read `want` bytes at `pos` into the caller's buffer, going through
    /// the scratch window for callback bodies so the pull callback is never
    /// invoked with the lock held.
    pub(crate) fn read_body_at(&self, pos: u64, out: &mut [u8]) -> ContentRead {
        match &self.body {
            Body::Buffer(data) => {
                if pos >= data.len() as u64 {
                    return ContentRead::EndOfStream;
                }
                let start = pos as usize;
                let n = out.len().min(data.len() - start);
                out[..n].copy_from_slice(&data[start..start + n]);
                ContentRead::Data(n)
            }
            Body::Fd { file, offset } => {
                use std::os::unix::fs::FileExt;
                if self.total_size != SIZE_UNKNOWN && pos >= self.total_size {
                    return ContentRead::EndOfStream;
                }
                let mut want = out.len();
                if self.total_size != SIZE_UNKNOWN {
                    want = want.min((self.total_size - pos) as usize);
                }
                match file.read_at(&mut out[..want], offset + pos) {
                    Ok(0) => ContentRead::EndOfStream,
                    Ok(n) => ContentRead::Data(n),
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => ContentRead::Pause,
                    Err(_) => ContentRead::Error,
                }
            }
            Body::Callback(reader) => {
                // Serve from the scratch window when it covers `pos`.
                {
                    let shared = self.shared.lock().unwrap();
                    if pos >= shared.data_start
                        && pos < shared.data_start + shared.data_size as u64
                    {
                        let off = (pos - shared.data_start) as usize;
                        let n = out.len().min(shared.data_size - off);
                        out[..n].copy_from_slice(&shared.data[off..off + n]);
                        return ContentRead::Data(n);
                    }
                }
                // Refill: take the scratch buffer out, call unlocked.
                let mut scratch = {
                    let mut shared = self.shared.lock().unwrap();
                    let mut buf = std::mem::take(&mut shared.data);
                    buf.resize(SCRATCH_SIZE, 0);
                    buf
                };
                let result = reader(pos, &mut scratch);
                let mut shared = self.shared.lock().unwrap();
                match result {
                    ContentRead::Data(n) => {
                        let n = n.min(scratch.len());
                        shared.data = scratch;
                        shared.data_start = pos;
                        shared.data_size = n;
                        let take = out.len().min(n);
                        out[..take].copy_from_slice(&shared.data[..take]);
                        ContentRead::Data(take)
                    }
                    other => {
                        shared.data = scratch;
                        shared.data_size = 0;
                        other
                    }
                }
            }
            Body::Upgrade => ContentRead::EndOfStream,
        }
    }

    /// File descriptor and base offset for the sendfile fast path.
    pub(crate) fn fd_body(&self) -> Option<(&File, u64)> {
        match &self.body {
            Body::Fd { file, offset } => Some((file, *offset)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn buffer_body_reads_in_order() {
        let resp = Response::from_buffer(&b"hello world"[..]);
        let mut buf = [0u8; 5];
        match resp.read_body_at(0, &mut buf) {
            ContentRead::Data(5) => assert_eq!(&buf, b"hello"),
            _ => panic!("expected data"),
        }
        match resp.read_body_at(6, &mut buf) {
            ContentRead::Data(5) => assert_eq!(&buf, b"world"),
            _ => panic!("expected data"),
        }
        assert!(matches!(
            resp.read_body_at(11, &mut buf),
            ContentRead::EndOfStream
        ));
    }

    #[test]
    fn callback_body_caches_window() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        let resp = Response::from_callback(Some(8), move |pos, buf| {
            counted.fetch_add(1, Ordering::SeqCst);
            if pos >= 8 {
                return ContentRead::EndOfStream;
            }
            let n = (8 - pos as usize).min(buf.len());
            for (i, b) in buf[..n].iter_mut().enumerate() {
                *b = b'a' + (pos as usize + i) as u8;
            }
            ContentRead::Data(n)
        });

        let mut buf = [0u8; 4];
        assert!(matches!(resp.read_body_at(0, &mut buf), ContentRead::Data(4)));
        assert_eq!(&buf, b"abcd");
        // Second read inside the cached window: no extra callback call.
        assert!(matches!(resp.read_body_at(4, &mut buf), ContentRead::Data(4)));
        assert_eq!(&buf, b"efgh");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn header_token_scan() {
        let resp = Response::empty();
        resp.add_header("Connection", "upgrade, close");
        assert!(resp.header_has_token("connection", "close"));
        assert!(!resp.header_has_token("connection", "keep-alive"));
        assert!(resp.has_header("CONNECTION"));
        assert!(!resp.has_header("Date"));
    }

    #[test]
    fn unknown_size_marks_streaming() {
        let resp = Response::from_callback(None, |_, _| ContentRead::EndOfStream);
        assert_eq!(resp.total_size, SIZE_UNKNOWN);
        let sized = Response::from_buffer(&b"xyz"[..]);
        assert_eq!(sized.total_size, 3);
    }
}
