//! Per-request state: the parse cursors, framing decisions, and the state
//! enum the connection's idle driver advances.
//!
//! One `Request` lives inside each connection and is re-initialized in place
//! (after a pool reset) when a keep-alive connection starts its next
//! request. Every string it references is a [`Block`] into the connection
//! pool.

use std::any::Any;
use std::sync::Arc;

use crate::headers::{self, Field, FieldKind};
use crate::pool::{Block, MemPool};
use crate::response::Response;

/// Sentinel: upload size not declared (chunked or close-framed).
pub(crate) const SIZE_UNKNOWN: u64 = u64::MAX;

/// The literal written for `Expect: 100-continue`.
pub(crate) const CONTINUE_MSG: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// States of the request automaton.
///
/// Ordinary progression is to the next state in declaration order. The two
/// non-linear transitions are `FootersSent -> Init` (keep-alive reset) and
/// any state `-> Closed` (fatal or peer closed). `Upgraded` is a sink
/// reachable from `HeadersSent` when the queued response is an upgrade.
///
/// Read-side transitions happen only after input is consumed; write-side
/// transitions happen once the data is staged in the write buffer (the
/// actual send may still be in flight), except that leaving `FootersSent`
/// requires the write to have completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum State {
    /// Waiting for the request line.
    Init,
    /// Request line parsed; waiting for a header line.
    UrlReceived,
    /// Got a header line that may still be folded; waiting for the next
    /// line to decide.
    HeaderPartReceived,
    /// Blank line seen: validate headers, compute framing and keep-alive.
    HeadersReceived,
    /// Application dispatched; decide on `100 Continue`.
    HeadersProcessed,
    /// Writing the `100 Continue` literal.
    ContinueSending,
    /// `100 Continue` sent (or skipped); reading the body.
    ContinueSent,
    /// Entire upload consumed.
    BodyReceived,
    /// Got a trailer line that may still be folded.
    FooterPartReceived,
    /// Trailers complete; waiting for a response to be queued.
    FootersReceived,
    /// Response status line + headers staged; draining.
    HeadersSending,
    /// Response headers on the wire; pick the body phase.
    HeadersSent,
    /// Identity body bytes available to send.
    NormalBodyReady,
    /// Identity body: pull source has no data yet; blocked on the app.
    NormalBodyUnready,
    /// Chunk staged in the write buffer.
    ChunkedBodyReady,
    /// Chunked body: pull source has no data yet; blocked on the app.
    ChunkedBodyUnready,
    /// Body complete; stage `0` chunk + trailers if chunked.
    BodySent,
    /// Draining trailers.
    FootersSending,
    /// Everything sent: close or reset for the next request.
    FootersSent,
    /// Tearing down the socket.
    Closed,
    /// Queued on the cleanup list; only to be freed.
    InCleanup,
    /// Socket handed to the application's upgrade handler.
    Upgraded,
}

/// What the connection is waiting for, published by the idle driver for the
/// event loop's interest set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EventLoopInfo {
    Read,
    Write,
    /// Blocked on the application (response or body not ready).
    Block,
    Cleanup,
    Upgrade,
}

/// Whether the connection may carry another request after this response.
/// Moves only toward `MustClose`; never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeepAlive {
    Unknown,
    KeepAlive,
    MustClose,
}

/// How the identity body is pushed onto the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RespSender {
    /// Read-then-send through a bounce buffer.
    Std,
    /// `sendfile(2)` from a file-backed body on a plaintext wire.
    Sendfile,
}

pub(crate) struct Request {
    pub state: State,
    pub event_loop_info: EventLoopInfo,
    pub keepalive: KeepAlive,

    pub method: Block,
    pub url: Block,
    /// Raw request target before query split and unescaping.
    pub raw_target: Block,
    pub version: Block,
    pub is_http11: bool,
    pub fields: Vec<Field>,

    /// Sliding window over unparsed input. `off` advances as lines and body
    /// bytes are consumed; `len` is the remaining capacity.
    pub read_buffer: Block,
    /// Filled prefix of `read_buffer`.
    pub read_buffer_offset: usize,

    /// Response status line + headers (and chunk framing) staging area.
    pub write_buffer: Block,
    pub write_buffer_send_offset: usize,
    pub write_buffer_append_offset: usize,

    /// Pending (possibly folded) header line.
    pub last: Option<Block>,
    /// Colon position inside `last`.
    pub colon: usize,
    /// Total size of the request head, recorded at `HeadersReceived`.
    pub header_size: usize,

    pub remaining_upload_size: u64,
    pub current_chunk_size: u64,
    pub current_chunk_offset: u64,
    pub have_chunked_upload: bool,
    /// Final zero-length handler dispatch already made.
    pub final_dispatch_done: bool,
    /// Response body goes out with chunk framing.
    pub chunked_response: bool,

    pub response: Option<Arc<Response>>,
    pub response_status: u16,
    pub response_write_position: u64,
    pub resp_sender: RespSender,
    pub continue_message_write_offset: usize,

    pub in_idle: bool,
    /// Handler has seen this request (gates the termination callback).
    pub client_aware: bool,
    pub client_context: Option<Box<dyn Any + Send>>,
}

impl Request {
    pub(crate) fn new() -> Self {
        Request {
            state: State::Init,
            event_loop_info: EventLoopInfo::Read,
            keepalive: KeepAlive::Unknown,
            method: Block::EMPTY,
            url: Block::EMPTY,
            raw_target: Block::EMPTY,
            version: Block::EMPTY,
            is_http11: false,
            fields: Vec::new(),
            read_buffer: Block::EMPTY,
            read_buffer_offset: 0,
            write_buffer: Block::EMPTY,
            write_buffer_send_offset: 0,
            write_buffer_append_offset: 0,
            last: None,
            colon: 0,
            header_size: 0,
            remaining_upload_size: 0,
            current_chunk_size: 0,
            current_chunk_offset: 0,
            have_chunked_upload: false,
            final_dispatch_done: false,
            chunked_response: false,
            response: None,
            response_status: 0,
            response_write_position: 0,
            resp_sender: RespSender::Std,
            continue_message_write_offset: 0,
            in_idle: false,
            client_aware: false,
            client_context: None,
        }
    }

    /// Keep-alive may only tighten. `MustClose` is final.
    pub(crate) fn tighten_keepalive(&mut self, next: KeepAlive) {
        if self.keepalive != KeepAlive::MustClose {
            self.keepalive = next;
        }
    }

    pub(crate) fn must_close(&mut self) {
        self.keepalive = KeepAlive::MustClose;
    }

    // ── Read-window management ───────────────────────────────────────

    /// Unconsumed input bytes.
    pub(crate) fn window<'p>(&self, pool: &'p MemPool) -> &'p [u8] {
        &pool.bytes(self.read_buffer)[..self.read_buffer_offset]
    }

    /// Advance the window past `n` consumed bytes. The bytes stay allocated
    /// in the pool (parsed spans keep pointing at them) until reset.
    pub(crate) fn consume_input(&mut self, n: usize) {
        debug_assert!(n <= self.read_buffer_offset);
        self.read_buffer = Block {
            off: self.read_buffer.off + n,
            len: self.read_buffer.len - n,
        };
        self.read_buffer_offset -= n;
    }

    /// Next complete line in the window: `(content, consumed)` where
    /// `content` is a pool span excluding the terminator and `consumed`
    /// includes it. Tolerates a bare LF.
    pub(crate) fn peek_line(&self, pool: &MemPool) -> Option<(Block, usize)> {
        let window = self.window(pool);
        let nl = window.iter().position(|&b| b == b'\n')?;
        let content_len = if nl > 0 && window[nl - 1] == b'\r' {
            nl - 1
        } else {
            nl
        };
        Some((self.read_buffer.slice(0, content_len), nl + 1))
    }

    /// Ensure at least one byte of read space, growing additively by
    /// `increment` while the pool lasts. Returns false when the pool is
    /// exhausted and the buffer is full.
    pub(crate) fn ensure_read_space(&mut self, pool: &mut MemPool, increment: usize) -> bool {
        if self.read_buffer.is_empty() {
            // First read on this request: start with half the free space.
            let initial = (pool.free() / 2).max(increment.min(pool.free()));
            match pool.alloc(initial) {
                Some(block) if block.len > 0 => {
                    self.read_buffer = block;
                    return true;
                }
                _ => return false,
            }
        }
        if self.read_buffer_offset < self.read_buffer.len {
            return true;
        }
        let want = (self.read_buffer.len + increment).min(self.read_buffer.len + pool.free());
        if want == self.read_buffer.len {
            return false;
        }
        match pool.realloc(self.read_buffer, want) {
            Some(block) => {
                self.read_buffer = block;
                true
            }
            None => false,
        }
    }

    // ── Request-line and header-line parsing ─────────────────────────

    /// Parse `METHOD SP target SP HTTP/x.y`. Populates method, url, version
    /// and query-argument fields. Returns the HTTP status to fail with on
    /// malformed input.
    pub(crate) fn parse_request_line(&mut self, pool: &mut MemPool, line: Block) -> Result<(), u16> {
        let (sp1, sp2) = {
            let bytes = pool.bytes(line);
            let sp1 = bytes.iter().position(|&b| b == b' ').ok_or(400u16)?;
            let sp2_rel = bytes[sp1 + 1..]
                .iter()
                .position(|&b| b == b' ')
                .ok_or(400u16)?;
            let sp2 = sp1 + 1 + sp2_rel;
            // Exactly one SP between tokens: no further space allowed.
            if bytes[sp2 + 1..].contains(&b' ') || sp1 == 0 || sp2 == sp1 + 1 {
                return Err(400);
            }
            (sp1, sp2)
        };
        self.method = line.slice(0, sp1);
        self.raw_target = line.slice(sp1 + 1, sp2);
        self.version = line.slice(sp2 + 1, line.len);

        {
            let version = pool.bytes(self.version);
            if !version.starts_with(b"HTTP/") {
                return Err(400);
            }
            let minor = &version[5..];
            if minor.len() != 3
                || !minor[0].is_ascii_digit()
                || minor[1] != b'.'
                || !minor[2].is_ascii_digit()
            {
                return Err(400);
            }
            // `HTTP/1.1` and beyond defaults to persistent connections.
            self.is_http11 = minor != b"1.0" && minor != b"0.9";
        }

        self.split_target(pool);
        Ok(())
    }

    /// Split the target at `?`, percent-decode the path in place, and file
    /// each query argument as a `GetArgument` field.
    fn split_target(&mut self, pool: &mut MemPool) {
        let target = self.raw_target;
        let qpos = pool.bytes(target).iter().position(|&b| b == b'?');
        let (path, query) = match qpos {
            Some(q) => (target.slice(0, q), Some(target.slice(q + 1, target.len))),
            None => (target, None),
        };
        self.url = headers::unescape_in_place(pool, path);
        if let Some(query) = query {
            self.parse_query(pool, query);
        }
    }

    fn parse_query(&mut self, pool: &mut MemPool, query: Block) {
        let mut start = 0;
        while start <= query.len {
            let rest = &pool.bytes(query)[start..];
            let end = rest
                .iter()
                .position(|&b| b == b'&')
                .map(|p| start + p)
                .unwrap_or(query.len);
            if end > start {
                let pair = query.slice(start, end);
                let eq = pool.bytes(pair).iter().position(|&b| b == b'=');
                let (name, value) = match eq {
                    Some(e) => (pair.slice(0, e), pair.slice(e + 1, pair.len)),
                    None => (pair, Block::EMPTY),
                };
                let name = headers::unescape_in_place(pool, name);
                let value = headers::unescape_in_place(pool, value);
                self.fields.push(Field {
                    kind: FieldKind::GetArgument,
                    name,
                    value,
                });
            }
            if end == query.len {
                break;
            }
            start = end + 1;
        }
    }

    /// Commit the pending header (or trailer) line: split at the colon,
    /// trim, and file the field. Cookie headers are additionally split into
    /// crumbs.
    pub(crate) fn commit_last(&mut self, pool: &MemPool, kind: FieldKind) -> Result<(), u16> {
        let Some(last) = self.last.take() else {
            return Ok(());
        };
        let colon = self.colon;
        let bytes = pool.bytes(last);
        debug_assert!(colon < bytes.len() && bytes[colon] == b':');

        let name_end = {
            let name = &bytes[..colon];
            // No whitespace inside the field name.
            if name.is_empty() || headers::trim_ascii(name).len() != name.len() {
                return Err(400);
            }
            colon
        };
        let value = {
            let raw = &bytes[colon + 1..];
            let trimmed = headers::trim_ascii(raw);
            let lead = trimmed.as_ptr() as usize - raw.as_ptr() as usize;
            last.slice(colon + 1 + lead, colon + 1 + lead + trimmed.len())
        };
        let name = last.slice(0, name_end);
        let field = Field { kind, name, value };
        self.fields.push(field);

        if kind == FieldKind::Header && headers::name_is(pool, &field, headers::name::COOKIE) {
            self.split_cookies(pool, value);
        }
        Ok(())
    }

    /// Split a `Cookie:` value on `;` into crumb fields.
    fn split_cookies(&mut self, pool: &MemPool, value: Block) {
        let mut start = 0;
        while start <= value.len {
            let rest = &pool.bytes(value)[start..];
            let end = rest
                .iter()
                .position(|&b| b == b';')
                .map(|p| start + p)
                .unwrap_or(value.len);
            if end > start {
                let crumb = value.slice(start, end);
                let bytes = pool.bytes(crumb);
                let trimmed = headers::trim_ascii(bytes);
                if !trimmed.is_empty() {
                    let lead = trimmed.as_ptr() as usize - bytes.as_ptr() as usize;
                    let crumb = crumb.slice(lead, lead + trimmed.len());
                    let eq = pool.bytes(crumb).iter().position(|&b| b == b'=');
                    let (name, value) = match eq {
                        Some(e) => (crumb.slice(0, e), crumb.slice(e + 1, crumb.len)),
                        None => (crumb, Block::EMPTY),
                    };
                    self.fields.push(Field {
                        kind: FieldKind::Cookie,
                        name,
                        value,
                    });
                }
            }
            if end == value.len {
                break;
            }
            start = end + 1;
        }
    }

    /// Start a pending header line. Returns 400 for a line without a colon.
    pub(crate) fn start_last(&mut self, pool: &MemPool, line: Block) -> Result<(), u16> {
        let colon = pool
            .bytes(line)
            .iter()
            .position(|&b| b == b':')
            .ok_or(400u16)?;
        self.last = Some(line);
        self.colon = colon;
        Ok(())
    }

    /// Fold a continuation line onto the pending header line, joined by a
    /// single space (RFC 7230 obs-fold).
    pub(crate) fn fold_into_last(&mut self, pool: &mut MemPool, cont: Block) -> Result<(), u16> {
        let Some(last) = self.last else {
            return Err(400);
        };
        let cont_bytes = {
            let trimmed = headers::trim_ascii(pool.bytes(cont));
            trimmed.to_vec()
        };
        let grown = pool
            .realloc(last, last.len + 1 + cont_bytes.len())
            .ok_or(431u16)?;
        let dst = pool.bytes_mut(grown);
        dst[last.len] = b' ';
        dst[last.len + 1..].copy_from_slice(&cont_bytes);
        self.last = Some(grown);
        Ok(())
    }

    // ── Framing and keep-alive decisions (at HeadersReceived) ────────

    /// Decide body framing: chunked beats content-length beats no body.
    /// Conflicting or malformed framing is a 400.
    pub(crate) fn decide_framing(&mut self, pool: &MemPool) -> Result<(), u16> {
        let chunked = headers::any_field_has_token(
            pool,
            &self.fields,
            FieldKind::Header,
            headers::name::TRANSFER_ENCODING,
            "chunked",
        );
        let content_length = headers::lookup(
            pool,
            &self.fields,
            FieldKind::Header,
            headers::name::CONTENT_LENGTH,
        )
        .copied();

        if chunked {
            if content_length.is_some() {
                return Err(400);
            }
            self.have_chunked_upload = true;
            self.remaining_upload_size = SIZE_UNKNOWN;
            return Ok(());
        }
        if let Some(field) = content_length {
            let text = pool.str_of(field.value);
            let n: u64 = text.parse().map_err(|_| 400u16)?;
            // Every duplicate must agree.
            for f in &self.fields {
                if f.kind == FieldKind::Header
                    && headers::name_is(pool, f, headers::name::CONTENT_LENGTH)
                    && pool.str_of(f.value) != text
                {
                    return Err(400);
                }
            }
            self.remaining_upload_size = n;
            return Ok(());
        }
        self.remaining_upload_size = 0;
        Ok(())
    }

    /// Request-side keep-alive default. The response side can only tighten
    /// further (handler-added `Connection: close`).
    pub(crate) fn decide_keepalive(&mut self, pool: &MemPool) {
        let close = headers::any_field_has_token(
            pool,
            &self.fields,
            FieldKind::Header,
            headers::name::CONNECTION,
            "close",
        );
        let keep = headers::any_field_has_token(
            pool,
            &self.fields,
            FieldKind::Header,
            headers::name::CONNECTION,
            "keep-alive",
        );
        // A close token wins over anything else it is combined with.
        if close {
            self.must_close();
        } else if self.is_http11 {
            self.tighten_keepalive(KeepAlive::KeepAlive);
        } else if keep {
            self.tighten_keepalive(KeepAlive::KeepAlive);
        } else {
            self.must_close();
        }
    }

    /// `Expect:` handling: `100-continue` on HTTP/1.1 means the continue
    /// literal goes out before the body; any other expectation is a 417.
    pub(crate) fn wants_continue(&self, pool: &MemPool) -> Result<bool, u16> {
        let Some(field) = headers::lookup(
            pool,
            &self.fields,
            FieldKind::Header,
            headers::name::EXPECT,
        ) else {
            return Ok(false);
        };
        if headers::has_token(pool.bytes(field.value), "100-continue") {
            Ok(self.is_http11)
        } else {
            Err(417)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Load raw input into a fresh request + pool pair.
    fn harness(input: &[u8]) -> (MemPool, Request) {
        let mut pool = MemPool::new(4096);
        let mut req = Request::new();
        assert!(req.ensure_read_space(&mut pool, 1024));
        let buf = req.read_buffer;
        pool.bytes_mut(buf)[..input.len()].copy_from_slice(input);
        req.read_buffer_offset = input.len();
        (pool, req)
    }

    fn take_line(pool: &MemPool, req: &mut Request) -> Block {
        let (line, consumed) = req.peek_line(pool).expect("line expected");
        req.consume_input(consumed);
        line
    }

    #[test]
    fn request_line_happy_path() {
        let (mut pool, mut req) = harness(b"GET /hello_world?a=%26&b=c HTTP/1.1\r\nrest");
        let line = take_line(&pool, &mut req);
        req.parse_request_line(&mut pool, line).unwrap();
        assert_eq!(pool.str_of(req.method), "GET");
        assert_eq!(pool.str_of(req.url), "/hello_world");
        assert_eq!(pool.str_of(req.version), "HTTP/1.1");
        assert!(req.is_http11);
        let args: Vec<(String, String)> = req
            .fields
            .iter()
            .filter(|f| f.kind == FieldKind::GetArgument)
            .map(|f| (pool.str_of(f.name).into(), pool.str_of(f.value).into()))
            .collect();
        assert_eq!(
            args,
            vec![("a".into(), "&".into()), ("b".into(), "c".into())]
        );
        assert_eq!(req.window(&pool), b"rest");
    }

    #[test]
    fn request_line_rejects_extra_spaces() {
        let (mut pool, mut req) = harness(b"GET  / HTTP/1.1\r\n");
        let line = take_line(&pool, &mut req);
        assert_eq!(req.parse_request_line(&mut pool, line), Err(400));
    }

    #[test]
    fn request_line_rejects_missing_version() {
        let (mut pool, mut req) = harness(b"GET /\r\n");
        let line = take_line(&pool, &mut req);
        assert_eq!(req.parse_request_line(&mut pool, line), Err(400));
    }

    #[test]
    fn http10_is_not_11() {
        let (mut pool, mut req) = harness(b"GET / HTTP/1.0\r\n");
        let line = take_line(&pool, &mut req);
        req.parse_request_line(&mut pool, line).unwrap();
        assert!(!req.is_http11);
    }

    #[test]
    fn bare_lf_line_terminator_tolerated() {
        let (pool, mut req) = harness(b"GET / HTTP/1.1\nX: y\n");
        let line = take_line(&pool, &mut req);
        assert_eq!(pool.bytes(line), b"GET / HTTP/1.1");
        let line2 = take_line(&pool, &mut req);
        assert_eq!(pool.bytes(line2), b"X: y");
    }

    #[test]
    fn header_commit_and_fold() {
        let (mut pool, mut req) = harness(b"");
        let line = pool.alloc(18).unwrap();
        pool.bytes_mut(line).copy_from_slice(b"X-Long: first part");
        req.start_last(&pool, line).unwrap();
        let cont = pool.alloc(8).unwrap();
        pool.bytes_mut(cont).copy_from_slice(b"  second");
        req.fold_into_last(&mut pool, cont).unwrap();
        req.commit_last(&pool, FieldKind::Header).unwrap();

        let f = &req.fields[0];
        assert_eq!(pool.str_of(f.name), "X-Long");
        assert_eq!(pool.str_of(f.value), "first part second");
    }

    #[test]
    fn header_line_without_colon_is_400() {
        let (mut pool, mut req) = harness(b"");
        let line = pool.alloc(7).unwrap();
        pool.bytes_mut(line).copy_from_slice(b"no-c0l0");
        assert_eq!(req.start_last(&pool, line), Err(400));
    }

    #[test]
    fn framing_chunked_wins_and_conflicts_reject() {
        let (mut pool, mut req) = harness(b"");
        let add = |pool: &mut MemPool, req: &mut Request, n: &str, v: &str| {
            let name = pool.alloc(n.len()).unwrap();
            pool.bytes_mut(name).copy_from_slice(n.as_bytes());
            let value = pool.alloc(v.len()).unwrap();
            pool.bytes_mut(value).copy_from_slice(v.as_bytes());
            req.fields.push(Field {
                kind: FieldKind::Header,
                name,
                value,
            });
        };
        add(&mut pool, &mut req, "Transfer-Encoding", "chunked");
        req.decide_framing(&pool).unwrap();
        assert!(req.have_chunked_upload);
        assert_eq!(req.remaining_upload_size, SIZE_UNKNOWN);

        add(&mut pool, &mut req, "Content-Length", "10");
        let mut conflicted = Request::new();
        conflicted.fields = req.fields.clone();
        assert_eq!(conflicted.decide_framing(&pool), Err(400));
    }

    #[test]
    fn framing_content_length_parsed() {
        let (mut pool, mut req) = harness(b"");
        let name = pool.alloc(14).unwrap();
        pool.bytes_mut(name).copy_from_slice(b"Content-Length");
        let value = pool.alloc(3).unwrap();
        pool.bytes_mut(value).copy_from_slice(b"123");
        req.fields.push(Field {
            kind: FieldKind::Header,
            name,
            value,
        });
        req.decide_framing(&pool).unwrap();
        assert_eq!(req.remaining_upload_size, 123);
    }

    #[test]
    fn keepalive_matrix() {
        let mk = |version11: bool, conn: Option<&str>| {
            let (mut pool, mut req) = harness(b"");
            req.is_http11 = version11;
            if let Some(v) = conn {
                let name = pool.alloc(10).unwrap();
                pool.bytes_mut(name).copy_from_slice(b"Connection");
                let value = pool.alloc(v.len()).unwrap();
                pool.bytes_mut(value).copy_from_slice(v.as_bytes());
                req.fields.push(Field {
                    kind: FieldKind::Header,
                    name,
                    value,
                });
            }
            req.decide_keepalive(&pool);
            req.keepalive
        };
        assert_eq!(mk(true, None), KeepAlive::KeepAlive);
        assert_eq!(mk(true, Some("close")), KeepAlive::MustClose);
        assert_eq!(mk(true, Some("close, keep-alive")), KeepAlive::MustClose);
        assert_eq!(mk(false, None), KeepAlive::MustClose);
        assert_eq!(mk(false, Some("keep-alive")), KeepAlive::KeepAlive);
        assert_eq!(mk(false, Some("keep-alive, close")), KeepAlive::MustClose);
    }

    #[test]
    fn keepalive_never_loosens() {
        let mut req = Request::new();
        req.must_close();
        req.tighten_keepalive(KeepAlive::KeepAlive);
        assert_eq!(req.keepalive, KeepAlive::MustClose);
    }

    #[test]
    fn expect_continue_only_for_http11() {
        let mk = |version11: bool, expect: &str| {
            let (mut pool, mut req) = harness(b"");
            req.is_http11 = version11;
            let name = pool.alloc(6).unwrap();
            pool.bytes_mut(name).copy_from_slice(b"Expect");
            let value = pool.alloc(expect.len()).unwrap();
            pool.bytes_mut(value).copy_from_slice(expect.as_bytes());
            req.fields.push(Field {
                kind: FieldKind::Header,
                name,
                value,
            });
            req.wants_continue(&pool)
        };
        assert_eq!(mk(true, "100-continue"), Ok(true));
        assert_eq!(mk(false, "100-continue"), Ok(false));
        assert_eq!(mk(true, "unsupported"), Err(417));
    }

    #[test]
    fn cookie_header_splits_into_crumbs() {
        let (mut pool, mut req) = harness(b"");
        let line = pool.alloc(26).unwrap();
        pool.bytes_mut(line).copy_from_slice(b"Cookie: a=1; b=2; lonely  ");
        req.start_last(&pool, line).unwrap();
        req.commit_last(&pool, FieldKind::Header).unwrap();
        let crumbs: Vec<(String, String)> = req
            .fields
            .iter()
            .filter(|f| f.kind == FieldKind::Cookie)
            .map(|f| (pool.str_of(f.name).into(), pool.str_of(f.value).into()))
            .collect();
        assert_eq!(
            crumbs,
            vec![
                ("a".into(), "1".into()),
                ("b".into(), "2".into()),
                ("lonely".into(), "".into())
            ]
        );
    }
}
