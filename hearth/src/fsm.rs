//! The idle driver: advances a connection's request automaton as far as the
//! buffered input, the staged output, and the application allow.
//!
//! `handle_idle` is not re-entrant on the same request (`in_idle` guard) and
//! runs to fixpoint: it keeps taking transitions until the current state's
//! exit condition is unmet or the write buffer backs up, then publishes what
//! the connection now waits for in `event_loop_info`. Byte movement lives in
//! `handle_read`/`handle_write`; everything here operates on the buffers.

use std::sync::Arc;

use crate::config::Config;
use crate::connection::Connection;
use crate::date::DateService;
use crate::handler::{Handler, RequestAction, RequestCtx, Upload};
use crate::headers::FieldKind;
use crate::metrics;
use crate::request::{EventLoopInfo, KeepAlive, Request, RespSender, State, SIZE_UNKNOWN};
use crate::response::{ContentRead, Response};

/// Ambient references the idle driver needs from its daemon.
pub(crate) struct Env<'a> {
    pub config: &'a Config,
    pub handler: &'a Arc<dyn Handler>,
    pub dates: &'a DateService,
}

/// Outcome of one upload-processing pass.
enum UploadStep {
    /// Need more input from the wire.
    NeedRead,
    /// Upload completely consumed.
    Done,
    /// Handler suspended the connection or a state change interrupted.
    Interrupted,
}

/// Largest chunk staged per write-buffer fill, framing included.
const CHUNK_STAGE_SIZE: usize = 8 * 1024;
/// Hex size digits + CRLFs around one chunk.
const CHUNK_OVERHEAD: usize = 16 + 4;

impl Connection {
    /// Advance the automaton to fixpoint and publish `event_loop_info`.
    pub(crate) fn handle_idle(&mut self, env: &Env<'_>) {
        if self.request.in_idle {
            return;
        }
        self.request.in_idle = true;

        loop {
            match self.request.state {
                State::Init => {
                    let Some((line, consumed)) = self.peek_line() else {
                        if self.read_stalled() {
                            self.fail_request(env, 431);
                            continue;
                        }
                        if self.read_closed {
                            self.request.state = State::Closed;
                            continue;
                        }
                        break;
                    };
                    self.request.consume_input(consumed);
                    if line.is_empty() {
                        // Tolerate blank lines ahead of the request line.
                        continue;
                    }
                    let pool = self.pool.as_mut().expect("pool exists once bytes arrived");
                    match self.request.parse_request_line(pool, line) {
                        Ok(()) => {
                            let raw = pool.str_of(self.request.raw_target).to_owned();
                            env.handler.uri_log(&raw, self.id());
                            self.request.state = State::UrlReceived;
                        }
                        Err(status) => self.fail_request(env, status),
                    }
                }

                State::UrlReceived => {
                    let Some((line, consumed)) = self.peek_line() else {
                        if self.read_stalled() {
                            self.fail_request(env, 431);
                            continue;
                        }
                        if self.read_closed {
                            self.request.state = State::Closed;
                            continue;
                        }
                        break;
                    };
                    self.request.consume_input(consumed);
                    if line.is_empty() {
                        self.request.state = State::HeadersReceived;
                        continue;
                    }
                    let pool = self.pool.as_ref().expect("pool exists");
                    match self.request.start_last(pool, line) {
                        Ok(()) => self.request.state = State::HeaderPartReceived,
                        Err(status) => self.fail_request(env, status),
                    }
                }

                State::HeaderPartReceived => {
                    let Some((line, consumed)) = self.peek_line() else {
                        if self.read_stalled() {
                            self.fail_request(env, 431);
                            continue;
                        }
                        if self.read_closed {
                            self.request.state = State::Closed;
                            continue;
                        }
                        break;
                    };
                    let pool = self.pool.as_mut().expect("pool exists");
                    let folded = !line.is_empty()
                        && matches!(pool.bytes(line).first(), Some(&b' ') | Some(&b'\t'));
                    if folded {
                        self.request.consume_input(consumed);
                        if let Err(status) = self.request.fold_into_last(pool, line) {
                            self.fail_request(env, status);
                        }
                        continue;
                    }
                    // Line not folded: the pending header is complete. The
                    // line itself is reprocessed from UrlReceived.
                    match self.request.commit_last(pool, FieldKind::Header) {
                        Ok(()) => self.request.state = State::UrlReceived,
                        Err(status) => self.fail_request(env, status),
                    }
                }

                State::HeadersReceived => {
                    let pool = self.pool.as_ref().expect("pool exists");
                    self.request.header_size =
                        self.request.read_buffer.off + self.request.read_buffer_offset;
                    if let Err(status) = self.request.decide_framing(pool) {
                        self.fail_request(env, status);
                        continue;
                    }
                    self.request.decide_keepalive(pool);
                    self.request.state = State::HeadersProcessed;
                }

                State::HeadersProcessed => {
                    if !self.request.client_aware {
                        self.request.client_aware = true;
                        let (_, action) = self.dispatch_handler(env, &[], false);
                        if action == RequestAction::Abort {
                            self.request.state = State::Closed;
                            continue;
                        }
                    }
                    if self.suspend_requested {
                        break;
                    }
                    if self.request.response.is_some() {
                        // Early response: any unread body cannot be skipped
                        // safely, so the connection must close afterwards.
                        if self.request.remaining_upload_size != 0 {
                            self.request.must_close();
                        }
                        self.request.state = State::FootersReceived;
                        continue;
                    }
                    let pool = self.pool.as_ref().expect("pool exists");
                    match self.request.wants_continue(pool) {
                        Ok(true) => self.request.state = State::ContinueSending,
                        Ok(false) => self.request.state = State::ContinueSent,
                        Err(status) => self.fail_request(env, status),
                    }
                }

                State::ContinueSending => {
                    if self.request.continue_message_write_offset
                        == crate::request::CONTINUE_MSG.len()
                    {
                        self.request.state = State::ContinueSent;
                        continue;
                    }
                    break;
                }

                State::ContinueSent => {
                    if self.request.response.is_some() {
                        // Response queued mid-upload: any unread body bytes
                        // are never consumed, so the connection cannot be
                        // reused.
                        if self.request.have_chunked_upload
                            || self.request.remaining_upload_size != 0
                        {
                            self.request.must_close();
                        }
                        self.request.state = State::FootersReceived;
                        continue;
                    }
                    let step = if self.request.have_chunked_upload {
                        self.process_chunked_upload(env)
                    } else {
                        self.process_identity_upload(env)
                    };
                    match step {
                        UploadStep::Done => self.request.state = State::BodyReceived,
                        UploadStep::NeedRead => {
                            if self.read_closed {
                                // Peer vanished mid-upload.
                                self.request.state = State::Closed;
                                continue;
                            }
                            break;
                        }
                        UploadStep::Interrupted => {
                            if self.suspend_requested && self.request.state == State::ContinueSent {
                                break;
                            }
                        }
                    }
                }

                State::BodyReceived => {
                    if !self.request.have_chunked_upload {
                        self.request.state = State::FootersReceived;
                        continue;
                    }
                    // Trailers mirror the header-line rules.
                    let Some((line, consumed)) = self.peek_line() else {
                        if self.read_stalled() {
                            self.fail_request(env, 413);
                            continue;
                        }
                        if self.read_closed {
                            self.request.state = State::Closed;
                            continue;
                        }
                        break;
                    };
                    self.request.consume_input(consumed);
                    if line.is_empty() {
                        self.request.state = State::FootersReceived;
                        continue;
                    }
                    let pool = self.pool.as_ref().expect("pool exists");
                    match self.request.start_last(pool, line) {
                        Ok(()) => self.request.state = State::FooterPartReceived,
                        Err(status) => self.fail_request(env, status),
                    }
                }

                State::FooterPartReceived => {
                    let Some((line, consumed)) = self.peek_line() else {
                        if self.read_stalled() {
                            self.fail_request(env, 413);
                            continue;
                        }
                        if self.read_closed {
                            self.request.state = State::Closed;
                            continue;
                        }
                        break;
                    };
                    let pool = self.pool.as_mut().expect("pool exists");
                    let folded = !line.is_empty()
                        && matches!(pool.bytes(line).first(), Some(&b' ') | Some(&b'\t'));
                    if folded {
                        self.request.consume_input(consumed);
                        if let Err(status) = self.request.fold_into_last(pool, line) {
                            self.fail_request(env, status);
                        }
                        continue;
                    }
                    match self.request.commit_last(pool, FieldKind::Footer) {
                        Ok(()) => self.request.state = State::BodyReceived,
                        Err(status) => self.fail_request(env, status),
                    }
                }

                State::FootersReceived => {
                    if !self.request.final_dispatch_done && self.request.response.is_none() {
                        self.request.final_dispatch_done = true;
                        let (_, action) = self.dispatch_handler(env, &[], true);
                        if action == RequestAction::Abort {
                            self.request.state = State::Closed;
                            continue;
                        }
                    }
                    if self.suspend_requested {
                        break;
                    }
                    if self.request.response.is_none() {
                        // Application will queue later (suspend/resume).
                        break;
                    }
                    if self.build_response_headers(env).is_err() {
                        self.request.state = State::Closed;
                        continue;
                    }
                    self.request.state = State::HeadersSending;
                }

                State::HeadersSending => {
                    if self.request.write_buffer_send_offset
                        >= self.request.write_buffer_append_offset
                    {
                        self.request.state = State::HeadersSent;
                        continue;
                    }
                    break;
                }

                State::HeadersSent => {
                    let resp = self.request.response.clone().expect("response queued");
                    if resp.is_upgrade() {
                        self.request.state = State::Upgraded;
                        continue;
                    }
                    let is_head = self.method_str() == "HEAD";
                    let bodyless = is_head
                        || !status_allows_body(self.request.response_status)
                        || resp.total_size == 0;
                    if bodyless {
                        // No body bytes at all, not even chunk framing.
                        self.request.chunked_response = false;
                        self.request.state = State::BodySent;
                    } else if self.request.chunked_response {
                        self.request.state = State::ChunkedBodyReady;
                    } else {
                        self.request.state = State::NormalBodyReady;
                        if resp.fd_body().is_some() && matches!(self.wire, crate::wire::Wire::Plain)
                        {
                            self.request.resp_sender = RespSender::Sendfile;
                        }
                    }
                }

                State::NormalBodyReady => {
                    let resp = self.request.response.clone().expect("response queued");
                    if resp.total_size != SIZE_UNKNOWN
                        && self.request.response_write_position >= resp.total_size
                    {
                        self.request.state = State::BodySent;
                        continue;
                    }
                    // Transmission happens in handle_write; a pull source
                    // with nothing to give moves the state to Unready there.
                    break;
                }

                State::ChunkedBodyReady => {
                    if self.request.write_buffer_send_offset
                        < self.request.write_buffer_append_offset
                    {
                        break; // previous chunk still draining
                    }
                    match self.stage_next_chunk() {
                        Ok(true) => break, // chunk staged, go write
                        Ok(false) => continue, // state changed
                        Err(()) => {
                            self.request.state = State::Closed;
                            continue;
                        }
                    }
                }

                State::NormalBodyUnready | State::ChunkedBodyUnready => {
                    // Only an application resume re-arms the body phase; the
                    // event loop flips the state back to Ready on resume.
                    break;
                }

                State::BodySent => {
                    if self.request.chunked_response {
                        if self.stage_chunk_terminator().is_err() {
                            self.request.state = State::Closed;
                            continue;
                        }
                        self.request.state = State::FootersSending;
                    } else {
                        self.request.state = State::FootersSent;
                    }
                }

                State::FootersSending => {
                    if self.request.write_buffer_send_offset
                        >= self.request.write_buffer_append_offset
                    {
                        self.request.state = State::FootersSent;
                        continue;
                    }
                    break;
                }

                State::FootersSent => {
                    metrics::REQUESTS_SERVED.increment();
                    if let Some(resp) = self.request.response.take() {
                        resp.notify_completed(crate::handler::CompletionReason::Ok);
                    }
                    if self.request.keepalive == KeepAlive::KeepAlive && !self.read_closed {
                        self.reset_for_next_request(env.config);
                        // Pipelined bytes may already hold the next request.
                        continue;
                    }
                    self.request.state = State::Closed;
                }

                State::Closed | State::InCleanup | State::Upgraded => break,
            }
        }

        self.request.in_idle = false;
        self.request.event_loop_info = self.info_for_state();
    }

    fn info_for_state(&self) -> EventLoopInfo {
        match self.request.state {
            State::Init
            | State::UrlReceived
            | State::HeaderPartReceived
            | State::ContinueSent
            | State::BodyReceived
            | State::FooterPartReceived => EventLoopInfo::Read,
            State::ContinueSending
            | State::HeadersSending
            | State::NormalBodyReady
            | State::ChunkedBodyReady
            | State::FootersSending => EventLoopInfo::Write,
            State::HeadersReceived
            | State::HeadersProcessed
            | State::FootersReceived
            | State::NormalBodyUnready
            | State::ChunkedBodyUnready
            | State::FootersSent => EventLoopInfo::Block,
            State::Closed | State::InCleanup => EventLoopInfo::Cleanup,
            State::Upgraded => EventLoopInfo::Upgrade,
            // Transitional states: the loop above always advances out of
            // them in the same iteration (no `break`), so they're never
            // the state observed when the idle driver exits.
            State::HeadersSent | State::BodySent => unreachable!(),
        }
    }

    // ── Input helpers ────────────────────────────────────────────────

    fn peek_line(&self) -> Option<(crate::pool::Block, usize)> {
        let pool = self.pool.as_ref()?;
        self.request.peek_line(pool)
    }

    /// Buffer full with no room left to grow: header/trailer parsing can
    /// make no progress.
    fn read_stalled(&self) -> bool {
        match &self.pool {
            Some(pool) => {
                !self.request.read_buffer.is_empty()
                    && self.request.read_buffer_offset == self.request.read_buffer.len
                    && pool.free() == 0
            }
            None => false,
        }
    }

    // ── Application dispatch ─────────────────────────────────────────

    /// Call the handler with one upload window. The window is copied out of
    /// the pool so the handler can borrow the connection freely.
    fn dispatch_handler(
        &mut self,
        env: &Env<'_>,
        data: &[u8],
        last: bool,
    ) -> (usize, RequestAction) {
        let mut upload = Upload {
            data,
            consumed: 0,
            last,
        };
        let handler = Arc::clone(env.handler);
        let action = handler.on_request(&mut RequestCtx { conn: self }, &mut upload);
        (upload.consumed, action)
    }

    fn process_identity_upload(&mut self, env: &Env<'_>) -> UploadStep {
        loop {
            if self.request.remaining_upload_size == 0 {
                return UploadStep::Done;
            }
            let window: Vec<u8> = {
                let pool = self.pool.as_ref().expect("pool exists");
                let window = self.request.window(pool);
                let avail = (self.request.remaining_upload_size as usize).min(window.len());
                window[..avail].to_vec()
            };
            if window.is_empty() {
                return UploadStep::NeedRead;
            }
            let (consumed, action) = self.dispatch_handler(env, &window, false);
            if action == RequestAction::Abort {
                self.request.state = State::Closed;
                return UploadStep::Interrupted;
            }
            self.request.consume_input(consumed);
            self.request.remaining_upload_size -= consumed as u64;
            if self.suspend_requested || self.request.response.is_some() {
                return UploadStep::Interrupted;
            }
            if consumed == 0 {
                if self.read_stalled() {
                    // Handler refuses the bytes and no more can be buffered.
                    self.request.state = State::Closed;
                    return UploadStep::Interrupted;
                }
                return UploadStep::NeedRead;
            }
        }
    }

    fn process_chunked_upload(&mut self, env: &Env<'_>) -> UploadStep {
        loop {
            // Between chunks: consume the CRLF trailing the chunk data.
            if self.request.current_chunk_size != 0
                && self.request.current_chunk_offset == self.request.current_chunk_size
            {
                let pool = self.pool.as_ref().expect("pool exists");
                let window = self.request.window(pool);
                let skip = if window.starts_with(b"\r\n") {
                    2
                } else if window.starts_with(b"\n") {
                    1
                } else if window.len() < 2 {
                    return UploadStep::NeedRead;
                } else {
                    self.fail_request(env, 400);
                    return UploadStep::Interrupted;
                };
                self.request.consume_input(skip);
                self.request.current_chunk_size = 0;
                self.request.current_chunk_offset = 0;
            }

            if self.request.current_chunk_size == 0 {
                // Awaiting a chunk-size line.
                let Some((line, consumed)) = self.peek_line() else {
                    if self.read_stalled() {
                        self.fail_request(env, 413);
                        return UploadStep::Interrupted;
                    }
                    return UploadStep::NeedRead;
                };
                let size = {
                    let pool = self.pool.as_ref().expect("pool exists");
                    parse_chunk_size(pool.bytes(line))
                };
                self.request.consume_input(consumed);
                let Some(size) = size else {
                    self.fail_request(env, 400);
                    return UploadStep::Interrupted;
                };
                if size == 0 {
                    return UploadStep::Done;
                }
                self.request.current_chunk_size = size;
                self.request.current_chunk_offset = 0;
                continue;
            }

            // Inside a chunk: hand decoded bytes to the application.
            let window: Vec<u8> = {
                let pool = self.pool.as_ref().expect("pool exists");
                let window = self.request.window(pool);
                let left = self.request.current_chunk_size - self.request.current_chunk_offset;
                let avail = (left as usize).min(window.len());
                window[..avail].to_vec()
            };
            if window.is_empty() {
                return UploadStep::NeedRead;
            }
            let (consumed, action) = self.dispatch_handler(env, &window, false);
            if action == RequestAction::Abort {
                self.request.state = State::Closed;
                return UploadStep::Interrupted;
            }
            self.request.consume_input(consumed);
            self.request.current_chunk_offset += consumed as u64;
            if self.suspend_requested || self.request.response.is_some() {
                return UploadStep::Interrupted;
            }
            if consumed == 0 {
                if self.read_stalled() {
                    self.request.state = State::Closed;
                    return UploadStep::Interrupted;
                }
                return UploadStep::NeedRead;
            }
        }
    }

    // ── Error path ───────────────────────────────────────────────────

    /// Queue a minimal error response, force close, and head for
    /// `HeadersSending`. Past the point where a response started going out,
    /// the connection is torn down instead.
    fn fail_request(&mut self, env: &Env<'_>, status: u16) {
        metrics::REQUESTS_PROTOCOL_ERRORS.increment();
        if self.request.state >= State::HeadersSending {
            self.request.state = State::Closed;
            return;
        }
        self.request.must_close();
        self.request.response_status = status;
        self.request.response = Some(error_response(status));
        if self.build_response_headers(env).is_err() {
            // Pool exhausted by the oversized request: nothing request-
            // scoped is needed for a canned error, so start the pool over.
            self.discard_request_allocations();
            if self.build_response_headers(env).is_err() {
                self.request.state = State::Closed;
                return;
            }
        }
        self.request.state = State::HeadersSending;
    }

    /// Drop every pool allocation of the current request (strings become
    /// unreachable; the canned error response does not need them).
    fn discard_request_allocations(&mut self) {
        if let Some(pool) = self.pool.as_mut() {
            pool.reset();
        }
        let req = &mut self.request;
        req.fields.clear();
        req.method = crate::pool::Block::EMPTY;
        req.url = crate::pool::Block::EMPTY;
        req.raw_target = crate::pool::Block::EMPTY;
        req.version = crate::pool::Block::EMPTY;
        req.last = None;
        req.read_buffer = crate::pool::Block::EMPTY;
        req.read_buffer_offset = 0;
        req.write_buffer = crate::pool::Block::EMPTY;
        req.write_buffer_send_offset = 0;
        req.write_buffer_append_offset = 0;
    }

    // ── Response serialization ───────────────────────────────────────

    /// Serialize status line + headers into the pool write buffer and pick
    /// the body framing.
    fn build_response_headers(&mut self, env: &Env<'_>) -> Result<(), ()> {
        let resp = self.request.response.clone().expect("response queued");
        let status = self.request.response_status;

        // Body framing: known size → Content-Length; unknown on HTTP/1.1 →
        // chunked; unknown on HTTP/1.0 → close-framed. HEAD responses carry
        // the same framing headers; only the body states are skipped.
        let streaming = resp.total_size == SIZE_UNKNOWN && !resp.is_upgrade();
        let chunked =
            streaming && self.request.is_http11 && !resp.v10_only && status_allows_body(status);
        if streaming && !chunked {
            self.request.must_close();
        }
        self.request.chunked_response = chunked;

        let version = if resp.v10_only { "HTTP/1.0" } else { "HTTP/1.1" };
        let mut head = String::with_capacity(256);
        head.push_str(version);
        head.push(' ');
        head.push_str(&status.to_string());
        head.push(' ');
        head.push_str(reason_phrase(status));
        head.push_str("\r\n");

        for (name, value) in resp.headers_snapshot() {
            head.push_str(&name);
            head.push_str(": ");
            head.push_str(&value);
            head.push_str("\r\n");
        }

        if !env.config.suppress_date && !resp.has_header(crate::headers::name::DATE) {
            head.push_str("Date: ");
            head.push_str(&env.dates.header_value());
            head.push_str("\r\n");
        }

        if status_allows_body(status) && !resp.is_upgrade() {
            if !streaming && !resp.has_header(crate::headers::name::CONTENT_LENGTH) {
                head.push_str("Content-Length: ");
                head.push_str(&resp.total_size.to_string());
                head.push_str("\r\n");
            } else if chunked && !resp.has_header(crate::headers::name::TRANSFER_ENCODING) {
                head.push_str("Transfer-Encoding: chunked\r\n");
            }
        }

        if self.request.keepalive == KeepAlive::MustClose {
            if !resp.header_has_token(crate::headers::name::CONNECTION, "close") {
                head.push_str("Connection: close\r\n");
            }
        } else if self.request.keepalive == KeepAlive::KeepAlive && !self.request.is_http11 {
            if !resp.has_header(crate::headers::name::CONNECTION) {
                head.push_str("Connection: Keep-Alive\r\n");
            }
        } else if resp.is_upgrade() && !resp.has_header(crate::headers::name::CONNECTION) {
            head.push_str("Connection: Upgrade\r\n");
        }
        head.push_str("\r\n");

        let pool = self.pool.as_mut().ok_or(())?;
        if !self.request.write_buffer.is_empty() {
            pool.free_tail(self.request.write_buffer);
        }
        let block = pool.alloc(head.len()).ok_or(())?;
        pool.bytes_mut(block).copy_from_slice(head.as_bytes());
        self.request.write_buffer = block;
        self.request.write_buffer_send_offset = 0;
        self.request.write_buffer_append_offset = head.len();
        Ok(())
    }

    // ── Chunked emission ─────────────────────────────────────────────

    /// Make sure the write buffer can stage one chunk. Returns usable data
    /// capacity.
    fn ensure_chunk_buffer(&mut self) -> Result<usize, ()> {
        let pool = self.pool.as_mut().ok_or(())?;
        let current = self.request.write_buffer;
        if current.len >= CHUNK_OVERHEAD + 128 {
            return Ok(current.len - CHUNK_OVERHEAD);
        }
        let want = CHUNK_STAGE_SIZE.min(current.len + pool.free());
        if want < CHUNK_OVERHEAD + 128 {
            return Err(());
        }
        let block = pool.realloc(current, want).ok_or(())?;
        self.request.write_buffer = block;
        Ok(want - CHUNK_OVERHEAD)
    }

    /// Pull the next chunk from the body source into the write buffer.
    /// `Ok(true)` means a chunk is staged and draining; `Ok(false)` means
    /// the state advanced (end of stream or unready source).
    fn stage_next_chunk(&mut self) -> Result<bool, ()> {
        let resp = self.request.response.clone().expect("response queued");
        let cap = self.ensure_chunk_buffer()?;
        let pos = self.request.response_write_position;

        let mut tmp = vec![0u8; cap.min(CHUNK_STAGE_SIZE)];
        match resp.read_body_at(pos, &mut tmp) {
            ContentRead::Data(n) => {
                let header = format!("{n:x}\r\n");
                let pool = self.pool.as_mut().ok_or(())?;
                let buf = pool.bytes_mut(self.request.write_buffer);
                debug_assert!(header.len() + n + 2 <= buf.len());
                buf[..header.len()].copy_from_slice(header.as_bytes());
                buf[header.len()..header.len() + n].copy_from_slice(&tmp[..n]);
                buf[header.len() + n..header.len() + n + 2].copy_from_slice(b"\r\n");
                self.request.write_buffer_send_offset = 0;
                self.request.write_buffer_append_offset = header.len() + n + 2;
                // Chunked positions advance at staging time: the bytes are
                // committed to the write buffer.
                self.request.response_write_position += n as u64;
                Ok(true)
            }
            ContentRead::Pause => {
                self.request.state = State::ChunkedBodyUnready;
                Ok(false)
            }
            ContentRead::EndOfStream => {
                self.request.state = State::BodySent;
                Ok(false)
            }
            ContentRead::Error => Err(()),
        }
    }

    /// Stage `0\r\n`, any trailers, and the final blank line.
    fn stage_chunk_terminator(&mut self) -> Result<(), ()> {
        let resp = self.request.response.clone().expect("response queued");
        let mut tail = String::from("0\r\n");
        for (name, value) in resp.trailers_snapshot() {
            tail.push_str(&name);
            tail.push_str(": ");
            tail.push_str(&value);
            tail.push_str("\r\n");
        }
        tail.push_str("\r\n");

        let pool = self.pool.as_mut().ok_or(())?;
        let current = self.request.write_buffer;
        let block = if current.len >= tail.len() {
            current
        } else {
            pool.realloc(current, tail.len()).ok_or(())?
        };
        pool.bytes_mut(block)[..tail.len()].copy_from_slice(tail.as_bytes());
        self.request.write_buffer = block;
        self.request.write_buffer_send_offset = 0;
        self.request.write_buffer_append_offset = tail.len();
        Ok(())
    }

    // ── Keep-alive reset ─────────────────────────────────────────────

    /// Reset the pool, carry pipelined bytes over, and re-initialize the
    /// request in place for the next round on this connection.
    pub(crate) fn reset_for_next_request(&mut self, _config: &Config) {
        let leftover_len = self.request.read_buffer_offset;
        let kept = match self.pool.as_mut() {
            Some(pool) => pool.reset_keeping(self.request.read_buffer, leftover_len),
            None => crate::pool::Block::EMPTY,
        };
        self.request = Request::new();
        self.request.read_buffer = kept;
        self.request.read_buffer_offset = kept.len;
    }

    /// Bytes buffered past the current request, handed to an upgrade
    /// handler as over-read input.
    pub(crate) fn take_overread(&mut self) -> Vec<u8> {
        match self.pool.as_ref() {
            Some(pool) => {
                let data = self.request.window(pool).to_vec();
                self.request.consume_input(data.len());
                data
            }
            None => Vec::new(),
        }
    }
}

/// Parse a chunk-size line: hex digits, optional `;extensions` ignored.
fn parse_chunk_size(line: &[u8]) -> Option<u64> {
    let end = line
        .iter()
        .position(|&b| b == b';')
        .unwrap_or(line.len());
    let digits = crate::headers::trim_ascii(&line[..end]);
    if digits.is_empty() || digits.len() > 16 {
        return None;
    }
    let mut value: u64 = 0;
    for &b in digits {
        let d = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            b'A'..=b'F' => b - b'A' + 10,
            _ => return None,
        };
        value = value << 4 | d as u64;
    }
    Some(value)
}

/// 1xx, 204 and 304 responses never carry a body.
fn status_allows_body(status: u16) -> bool {
    !(100..200).contains(&status) && status != 204 && status != 304
}

fn error_response(status: u16) -> Arc<Response> {
    let body: &'static str = match status {
        400 => "<html><body>Bad Request</body></html>",
        413 => "<html><body>Payload Too Large</body></html>",
        417 => "<html><body>Expectation Failed</body></html>",
        431 => "<html><body>Request Header Fields Too Large</body></html>",
        _ => "<html><body>Internal Server Error</body></html>",
    };
    let resp = Response::from_buffer(bytes::Bytes::from_static(body.as_bytes()));
    resp.add_header("Content-Type", "text/html");
    resp
}

/// Reason phrases for the statuses the daemon emits or hosts commonly use.
fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        411 => "Length Required",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        417 => "Expectation Failed",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}
