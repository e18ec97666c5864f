//! One accepted socket: its wire adapter, memory pool, in-flight request,
//! activity clock, and the embedded list links the daemon threads its
//! bookkeeping through. Also the slot table the daemon owns connections in.
//!
//! `handle_read` and `handle_write` move bytes; every state decision lives
//! in the idle driver (`fsm`). A connection belongs to exactly one IO-state
//! list (normal, suspended, cleanup) and at most one timeout list at any
//! moment.

use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::handler::ConnId;
use crate::headers::FieldKind;
use crate::lists::{LinkSlots, Links};
use crate::metrics;
use crate::pool::MemPool;
use crate::request::{Request, RespSender, State, SIZE_UNKNOWN};
use crate::response::{ContentRead, Response};
use crate::wire::{Wire, WireIo};

/// Which IO-state list the connection is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IoList {
    Normal,
    Suspended,
    Cleanup,
}

/// Which timeout list the connection is on, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimeoutList {
    /// Daemon-default timeout; ordered by activity (head = oldest).
    Normal,
    /// Per-connection override; scanned linearly.
    Manual,
}

/// Link domains threaded through the slot table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkDomain {
    Io,
    Timeout,
    Ready,
}

pub(crate) struct Connection {
    pub fd: RawFd,
    pub peer_addr: SocketAddr,
    pub wire: Wire,
    /// Created lazily on the first read, reset between keep-alive requests.
    pub pool: Option<MemPool>,
    pub request: Request,

    pub last_activity: Instant,
    /// `None` disables idle eviction for this connection.
    pub connection_timeout: Option<Duration>,
    /// Set when the application changed the timeout; the event loop then
    /// re-files the connection on the right timeout list.
    pub timeout_dirty: bool,

    pub suspended: bool,
    pub resuming: bool,
    /// Handler asked for suspension during the current dispatch.
    pub suspend_requested: bool,
    pub read_closed: bool,
    /// The socket was put in non-blocking mode at accept. The read/write
    /// handlers rely on it.
    pub sk_nonblck: bool,
    /// Socket ownership moved to an upgrade handler; cleanup must not close.
    pub socket_taken: bool,

    pub io_list: IoList,
    pub timeout_list: Option<TimeoutList>,
    pub io_links: Links,
    pub timeout_links: Links,
    pub ready_links: Links,
    /// Member of the epoll readiness EDLL.
    pub in_ready: bool,
    /// Interest currently registered with the poller `(read, write)`.
    pub registered: Option<(bool, bool)>,
    /// Readiness reported by the poller, consumed by the dispatch pass.
    pub readable: bool,
    pub writable: bool,

    pub slot: u32,
    pub generation: u32,
    pub worker: u16,
}

impl Connection {
    pub(crate) fn new(
        fd: RawFd,
        peer_addr: SocketAddr,
        wire: Wire,
        connection_timeout: Option<Duration>,
    ) -> Self {
        Connection {
            fd,
            peer_addr,
            wire,
            pool: None,
            request: Request::new(),
            last_activity: Instant::now(),
            connection_timeout,
            timeout_dirty: false,
            suspended: false,
            resuming: false,
            suspend_requested: false,
            read_closed: false,
            sk_nonblck: true,
            socket_taken: false,
            io_list: IoList::Normal,
            timeout_list: None,
            io_links: Links::default(),
            timeout_links: Links::default(),
            ready_links: Links::default(),
            in_ready: false,
            registered: None,
            readable: false,
            writable: false,
            slot: 0,
            generation: 0,
            worker: 0,
        }
    }

    pub(crate) fn id(&self) -> ConnId {
        ConnId {
            worker: self.worker,
            slot: self.slot,
            generation: self.generation,
        }
    }

    fn poke_activity(&mut self) {
        self.last_activity = Instant::now();
    }

    // ── Request string accessors (resolved through the pool) ─────────

    fn pool_str(&self, block: crate::pool::Block) -> &str {
        match &self.pool {
            Some(pool) => pool.str_of(block),
            None => "",
        }
    }

    pub(crate) fn method_str(&self) -> &str {
        self.pool_str(self.request.method)
    }

    pub(crate) fn url_str(&self) -> &str {
        self.pool_str(self.request.url)
    }

    pub(crate) fn version_str(&self) -> &str {
        self.pool_str(self.request.version)
    }

    pub(crate) fn field_value(&self, kind: FieldKind, name: &str) -> Option<&str> {
        let pool = self.pool.as_ref()?;
        crate::headers::lookup(pool, &self.request.fields, kind, name)
            .map(|f| pool.str_of(f.value))
    }

    pub(crate) fn fields_iter(&self) -> impl Iterator<Item = (FieldKind, &str, &str)> {
        self.request.fields.iter().filter_map(move |f| {
            let pool = self.pool.as_ref()?;
            Some((f.kind, pool.str_of(f.name), pool.str_of(f.value)))
        })
    }

    /// Attach the response. Returns false if one is queued already or the
    /// connection is past responding.
    pub(crate) fn queue_response(&mut self, status: u16, response: Arc<Response>) -> bool {
        if self.request.response.is_some()
            || matches!(
                self.request.state,
                State::Closed | State::InCleanup | State::Upgraded
            )
        {
            return false;
        }
        // A handler-supplied close token tightens keep-alive immediately.
        if response.header_has_token(crate::headers::name::CONNECTION, "close") {
            self.request.must_close();
        }
        self.request.response_status = status;
        self.request.response = Some(response);
        true
    }

    // ── Byte movement ────────────────────────────────────────────────

    /// Receive into the tail of the read buffer. State decisions happen in
    /// the idle driver afterwards.
    pub(crate) fn handle_read(&mut self, config: &Config) {
        if self.read_closed
            || matches!(
                self.request.state,
                State::Closed | State::InCleanup | State::Upgraded
            )
        {
            return;
        }
        if self.pool.is_none() {
            self.pool = Some(MemPool::new(config.connection_memory_limit));
        }
        debug_assert!(self.sk_nonblck);
        let Connection {
            wire,
            pool,
            request,
            fd,
            ..
        } = self;
        let pool = pool.as_mut().expect("pool created above");
        if !request.ensure_read_space(pool, config.connection_memory_increment) {
            // Buffer full and pool exhausted: the idle driver turns this
            // into 431/413 or drains the window; reading must pause.
            return;
        }
        let fd = *fd;
        let buf_block = request.read_buffer;
        let offset = request.read_buffer_offset;
        let dst = &mut pool.bytes_mut(buf_block)[offset..];
        debug_assert!(!dst.is_empty());
        match wire.recv(fd, dst) {
            WireIo::Bytes(n) => {
                request.read_buffer_offset += n;
                metrics::BYTES_RECEIVED.add(n as u64);
                self.poke_activity();
            }
            WireIo::Closed => {
                self.read_closed = true;
            }
            WireIo::WouldBlock => {}
            WireIo::Fatal(_) => {
                self.read_closed = true;
                self.request.state = State::Closed;
            }
        }
    }

    /// Transmit whatever the current state has staged: the `100 Continue`
    /// literal, the write buffer (headers, chunk frames, trailers), or the
    /// response body.
    pub(crate) fn handle_write(&mut self, _config: &Config) {
        match self.request.state {
            State::ContinueSending => self.send_continue(),
            State::HeadersSending | State::ChunkedBodyReady | State::FootersSending => {
                self.drain_write_buffer()
            }
            State::NormalBodyReady => self.send_normal_body(),
            _ => {}
        }
    }

    fn send_continue(&mut self) {
        let offset = self.request.continue_message_write_offset;
        let fd = self.fd;
        match self.wire.send(fd, &crate::request::CONTINUE_MSG[offset..]) {
            WireIo::Bytes(n) => {
                self.request.continue_message_write_offset += n;
                metrics::BYTES_SENT.add(n as u64);
                self.poke_activity();
            }
            WireIo::WouldBlock => {}
            WireIo::Closed | WireIo::Fatal(_) => self.request.state = State::Closed,
        }
    }

    fn drain_write_buffer(&mut self) {
        let Connection {
            wire,
            pool,
            request,
            fd,
            ..
        } = self;
        let Some(pool) = pool.as_ref() else { return };
        let send = request.write_buffer_send_offset;
        let append = request.write_buffer_append_offset;
        if send >= append {
            return;
        }
        let buf = &pool.bytes(request.write_buffer)[send..append];
        match wire.send(*fd, buf) {
            WireIo::Bytes(n) => {
                request.write_buffer_send_offset += n;
                metrics::BYTES_SENT.add(n as u64);
                self.poke_activity();
            }
            WireIo::WouldBlock => {}
            WireIo::Closed | WireIo::Fatal(_) => request.state = State::Closed,
        }
    }

    fn send_normal_body(&mut self) {
        let Some(resp) = self.request.response.clone() else {
            return;
        };
        let pos = self.request.response_write_position;
        let total = resp.total_size;
        if total != SIZE_UNKNOWN && pos >= total {
            return; // idle will transition to BodySent
        }

        if self.request.resp_sender == RespSender::Sendfile {
            self.sendfile_body(&resp, pos, total);
            return;
        }

        // Direct path for complete in-memory bodies: no copy.
        if let Some(data) = resp.buffer() {
            let fd = self.fd;
            let start = pos as usize;
            match self.wire.send(fd, &data[start..]) {
                WireIo::Bytes(n) => {
                    self.request.response_write_position += n as u64;
                    metrics::BYTES_SENT.add(n as u64);
                    self.poke_activity();
                }
                WireIo::WouldBlock => {}
                WireIo::Closed | WireIo::Fatal(_) => self.request.state = State::Closed,
            }
            return;
        }

        // Pull-callback and fallback file path: read into a bounce buffer,
        // send what the wire accepts. Re-reads are cheap: the response
        // scratch window covers the position until it advances.
        let mut tmp = [0u8; 8 * 1024];
        let want = if total != SIZE_UNKNOWN {
            ((total - pos) as usize).min(tmp.len())
        } else {
            tmp.len()
        };
        match resp.read_body_at(pos, &mut tmp[..want]) {
            ContentRead::Data(n) => {
                let fd = self.fd;
                match self.wire.send(fd, &tmp[..n]) {
                    WireIo::Bytes(sent) => {
                        self.request.response_write_position += sent as u64;
                        metrics::BYTES_SENT.add(sent as u64);
                        self.poke_activity();
                    }
                    WireIo::WouldBlock => {}
                    WireIo::Closed | WireIo::Fatal(_) => self.request.state = State::Closed,
                }
            }
            ContentRead::Pause => {
                self.request.state = State::NormalBodyUnready;
            }
            ContentRead::EndOfStream => {
                // Close-framed body ends here; sized bodies end by count.
                self.request.state = State::BodySent;
            }
            ContentRead::Error => self.request.state = State::Closed,
        }
    }

    /// Zero-copy file transmission. Falls back to the bounce-buffer path on
    /// kernels or filesystems that refuse sendfile for this pairing.
    fn sendfile_body(&mut self, resp: &Arc<Response>, pos: u64, total: u64) {
        use std::os::fd::{AsFd, BorrowedFd};

        let Some((file, base)) = resp.fd_body() else {
            self.request.resp_sender = RespSender::Std;
            return;
        };
        let remaining = if total != SIZE_UNKNOWN {
            (total - pos).min(1 << 20) as usize
        } else {
            1 << 20
        };
        let mut offset = (base + pos) as libc::off_t;
        let out = unsafe { BorrowedFd::borrow_raw(self.fd) };
        match nix::sys::sendfile::sendfile(out, file.as_fd(), Some(&mut offset), remaining) {
            Ok(0) => {
                self.request.state = State::BodySent;
            }
            Ok(n) => {
                self.request.response_write_position += n as u64;
                metrics::BYTES_SENT.add(n as u64);
                self.poke_activity();
            }
            Err(nix::errno::Errno::EAGAIN) | Err(nix::errno::Errno::EINTR) => {}
            Err(nix::errno::Errno::EINVAL) | Err(nix::errno::Errno::ENOSYS) => {
                self.request.resp_sender = RespSender::Std;
            }
            Err(_) => self.request.state = State::Closed,
        }
    }

    /// Shut the socket down and mark the connection for the cleanup list.
    /// With turbo enabled the optional `shutdown()` is skipped.
    pub(crate) fn initiate_close(&mut self, config: &Config) {
        if self.socket_taken {
            return;
        }
        self.wire.initiate_close(self.fd);
        if !config.turbo {
            unsafe {
                libc::shutdown(self.fd, libc::SHUT_WR);
            }
        }
    }
}

// ── Slot table ──────────────────────────────────────────────────────

struct Slot {
    conn: Option<Connection>,
    generation: u32,
}

/// Daemon-owned storage for connections, indexed by slot, with a free list
/// for O(1) allocation and a generation counter to invalidate stale ids.
pub(crate) struct ConnTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl ConnTable {
    pub(crate) fn new(max_connections: u32) -> Self {
        let mut slots = Vec::with_capacity(max_connections as usize);
        for _ in 0..max_connections {
            slots.push(Slot {
                conn: None,
                generation: 0,
            });
        }
        // Free list in reverse so pop hands out the lowest index first.
        let free: Vec<u32> = (0..max_connections).rev().collect();
        ConnTable { slots, free }
    }

    /// Place a connection, stamping its slot/generation/worker identity.
    pub(crate) fn insert(&mut self, mut conn: Connection, worker: u16) -> Option<u32> {
        let idx = self.free.pop()?;
        let slot = &mut self.slots[idx as usize];
        conn.slot = idx;
        conn.generation = slot.generation;
        conn.worker = worker;
        slot.conn = Some(conn);
        Some(idx)
    }

    /// Remove and return the connection, bumping the generation so stale
    /// [`ConnId`]s stop resolving.
    pub(crate) fn release(&mut self, idx: u32) -> Option<Connection> {
        let slot = self.slots.get_mut(idx as usize)?;
        let conn = slot.conn.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(idx);
        Some(conn)
    }

    pub(crate) fn get(&self, idx: u32) -> Option<&Connection> {
        self.slots.get(idx as usize)?.conn.as_ref()
    }

    pub(crate) fn get_mut(&mut self, idx: u32) -> Option<&mut Connection> {
        self.slots.get_mut(idx as usize)?.conn.as_mut()
    }

    /// Resolve a [`ConnId`], refusing stale generations.
    pub(crate) fn get_id_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        let conn = self.get_mut(id.slot)?;
        if conn.generation != id.generation {
            return None;
        }
        Some(conn)
    }

    pub(crate) fn active_count(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub(crate) fn indices(&self) -> impl Iterator<Item = u32> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.conn.is_some())
            .map(|(i, _)| i as u32)
    }

    /// Link-domain view for the intrusive list operations.
    pub(crate) fn domain(&mut self, domain: LinkDomain) -> DomainView<'_> {
        DomainView { table: self, domain }
    }
}

pub(crate) struct DomainView<'a> {
    table: &'a mut ConnTable,
    domain: LinkDomain,
}

impl LinkSlots for DomainView<'_> {
    fn links(&self, idx: u32) -> Links {
        let conn = self.table.get(idx).expect("linked connection exists");
        match self.domain {
            LinkDomain::Io => conn.io_links,
            LinkDomain::Timeout => conn.timeout_links,
            LinkDomain::Ready => conn.ready_links,
        }
    }

    fn links_mut(&mut self, idx: u32) -> &mut Links {
        let domain = self.domain;
        let conn = self.table.get_mut(idx).expect("linked connection exists");
        match domain {
            LinkDomain::Io => &mut conn.io_links,
            LinkDomain::Timeout => &mut conn.timeout_links,
            LinkDomain::Ready => &mut conn.ready_links,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lists::ListHead;

    fn dummy_conn() -> Connection {
        Connection::new(
            -1,
            "127.0.0.1:0".parse().unwrap(),
            Wire::Plain,
            None,
        )
    }

    #[test]
    fn insert_release_recycles_lowest_slot_first() {
        let mut table = ConnTable::new(4);
        let a = table.insert(dummy_conn(), 0).unwrap();
        let b = table.insert(dummy_conn(), 0).unwrap();
        assert_eq!((a, b), (0, 1));
        assert_eq!(table.active_count(), 2);

        table.release(a).unwrap();
        let c = table.insert(dummy_conn(), 0).unwrap();
        assert_eq!(c, 0);
    }

    #[test]
    fn stale_generation_refused() {
        let mut table = ConnTable::new(2);
        let idx = table.insert(dummy_conn(), 3).unwrap();
        let id = table.get(idx).unwrap().id();
        assert_eq!(id.worker, 3);
        assert!(table.get_id_mut(id).is_some());

        table.release(idx).unwrap();
        table.insert(dummy_conn(), 3).unwrap();
        assert!(table.get_id_mut(id).is_none(), "stale id must not resolve");
    }

    #[test]
    fn exhausted_table_refuses() {
        let mut table = ConnTable::new(1);
        table.insert(dummy_conn(), 0).unwrap();
        assert!(table.insert(dummy_conn(), 0).is_none());
    }

    #[test]
    fn domain_views_are_independent_lists() {
        let mut table = ConnTable::new(4);
        let a = table.insert(dummy_conn(), 0).unwrap();
        let b = table.insert(dummy_conn(), 0).unwrap();

        let mut io = ListHead::new();
        let mut timeout = ListHead::new();
        io.push_tail(&mut table.domain(LinkDomain::Io), a);
        io.push_tail(&mut table.domain(LinkDomain::Io), b);
        timeout.push_tail(&mut table.domain(LinkDomain::Timeout), b);
        timeout.push_tail(&mut table.domain(LinkDomain::Timeout), a);

        assert_eq!(io.head, Some(a));
        assert_eq!(timeout.head, Some(b));

        io.remove(&mut table.domain(LinkDomain::Io), a);
        // Timeout membership untouched by IO unlinking.
        assert_eq!(timeout.head, Some(b));
        assert_eq!(timeout.tail, Some(a));
    }
}
