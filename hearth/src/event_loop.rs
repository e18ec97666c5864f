//! The per-thread event loop driving many connections.
//!
//! One `EventLoop` owns a slot table of connections, the IO-state and
//! timeout lists threaded through it, a poller, and a wake channel. The
//! external-loop and internal-thread models run exactly one of these; the
//! thread-pool model runs one per worker with accepted sockets arriving
//! over a channel.
//!
//! The loop thread owns all connection state: cross-thread operations
//! (resume, out-of-band response queueing, shutdown) arrive as commands
//! drained at the top of each iteration after an ITC wake. The daemon mutex
//! protects only the command queue and the per-IP counters, never the
//! read/write path.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use std::net::SocketAddr;
use std::os::fd::RawFd;

use crate::acceptor;
use crate::connection::{ConnTable, Connection, IoList, LinkDomain, TimeoutList};
use crate::daemon::{Command, Shared};
use crate::fsm::Env;
use crate::handler::{CompletionReason, ConnEvent, UpgradeStream};
use crate::itc::WakeChannel;
use crate::lists::ListHead;
use crate::metrics;
use crate::poller::{Event, Poller};
use crate::request::{EventLoopInfo, State};

/// Poll token of the listening socket.
pub(crate) const TOKEN_LISTENER: u64 = u64::MAX;
/// Poll token of the wake channel.
pub(crate) const TOKEN_ITC: u64 = u64::MAX - 1;

pub(crate) struct EventLoop {
    pub worker: u16,
    pub shared: Arc<Shared>,
    pub itc: Arc<WakeChannel>,
    table: ConnTable,
    poller: Poller,
    /// IO-state lists: every connection is on exactly one.
    normal: ListHead,
    suspended: ListHead,
    cleanup: ListHead,
    /// Timeout lists: default-timeout connections ordered by activity,
    /// custom-timeout connections scanned linearly.
    timeout_normal: ListHead,
    timeout_manual: ListHead,
    /// Readiness FIFO: connections whose last poll event is undrained.
    ready: ListHead,
    /// Listening socket when this loop accepts directly.
    listener: Option<RawFd>,
    /// Accepted sockets handed over by the pool acceptor.
    accept_rx: Option<Receiver<(RawFd, SocketAddr)>>,
    events: Vec<Event>,
}

impl EventLoop {
    pub(crate) fn new(
        worker: u16,
        shared: Arc<Shared>,
        itc: Arc<WakeChannel>,
        listener: Option<RawFd>,
        accept_rx: Option<Receiver<(RawFd, SocketAddr)>>,
    ) -> Result<Self, crate::error::Error> {
        let mut poller = Poller::new(shared.config.resolved_backend())?;
        poller.register(itc.poll_fd(), TOKEN_ITC, true, false)?;
        if let Some(fd) = listener {
            poller.register(fd, TOKEN_LISTENER, true, false)?;
        }
        let table = ConnTable::new(shared.config.max_connections);
        Ok(EventLoop {
            worker,
            shared,
            itc,
            table,
            poller,
            normal: ListHead::new(),
            suspended: ListHead::new(),
            cleanup: ListHead::new(),
            timeout_normal: ListHead::new(),
            timeout_manual: ListHead::new(),
            ready: ListHead::new(),
            listener,
            accept_rx,
            events: Vec::new(),
        })
    }

    /// Run until shutdown completes. Used by the internal-thread and
    /// thread-pool models.
    pub(crate) fn run(&mut self) {
        loop {
            let timeout = self.next_timeout();
            if let Err(err) = self.poller_wait(timeout) {
                tracing::warn!(error = %err, "poll failed");
            }
            self.process_events();
            self.run_once();
            if self.shared.quiescing() && self.table.active_count() == 0 {
                break;
            }
        }
    }

    fn poller_wait(&mut self, timeout: Option<Duration>) -> std::io::Result<()> {
        let mut events = std::mem::take(&mut self.events);
        let result = self.poller.wait(timeout, &mut events);
        self.events = events;
        result
    }

    /// Translate poll results into readiness flags and the ready FIFO.
    fn process_events(&mut self) {
        let events = std::mem::take(&mut self.events);
        for event in &events {
            match event.token {
                TOKEN_ITC => self.itc.drain(),
                TOKEN_LISTENER => self.accept_burst(),
                token => {
                    let idx = token as u32;
                    let Some(conn) = self.table.get_mut(idx) else {
                        continue;
                    };
                    conn.readable = event.readable || event.error;
                    conn.writable = event.writable;
                    if !conn.in_ready {
                        conn.in_ready = true;
                        self.ready.push_tail(&mut self.table.domain(LinkDomain::Ready), idx);
                    }
                }
            }
        }
        self.events = events;
    }

    /// One maintenance pass: commands, accept handoffs, ready dispatch,
    /// timeouts, cleanup. The poll/select wait itself lives in the caller
    /// so the external-loop model can substitute the host's poll results.
    pub(crate) fn run_once(&mut self) {
        self.drain_commands();
        self.drain_accept_handoffs();
        self.dispatch_ready();
        self.evict_timed_out();
        self.process_cleanup();
        if self.shared.quiescing() {
            self.force_close_all();
            self.process_cleanup();
        }
    }

    // ── Cross-thread commands ────────────────────────────────────────

    fn drain_commands(&mut self) {
        let mine = self.shared.take_commands(self.worker);
        for command in mine {
            match command {
                Command::Resume(id) => {
                    if let Some(conn) = self.table.get_id_mut(id) {
                        conn.resuming = true;
                        self.apply_resume(id.slot);
                    }
                }
                Command::QueueResponse(id, status, response) => {
                    if let Some(conn) = self.table.get_id_mut(id) {
                        conn.queue_response(status, response);
                        conn.resuming = true;
                        self.apply_resume(id.slot);
                    }
                }
                Command::SetTimeout(id, timeout) => {
                    if let Some(conn) = self.table.get_id_mut(id) {
                        conn.connection_timeout = timeout;
                        conn.timeout_dirty = true;
                        self.refile_timeout(id.slot);
                    }
                }
            }
        }
    }

    /// Put a resumed connection back in play before the next poll returns.
    fn apply_resume(&mut self, idx: u32) {
        let Some(conn) = self.table.get_mut(idx) else {
            return;
        };
        if !conn.resuming {
            return;
        }
        conn.resuming = false;
        conn.suspend_requested = false;
        // Suspension time does not count against the idle timeout.
        conn.last_activity = Instant::now();
        // Blocked body sources re-arm on resume.
        match conn.request.state {
            State::NormalBodyUnready => conn.request.state = State::NormalBodyReady,
            State::ChunkedBodyUnready => conn.request.state = State::ChunkedBodyReady,
            _ => {}
        }
        if conn.suspended {
            conn.suspended = false;
            conn.io_list = IoList::Normal;
            self.suspended.remove(&mut self.table.domain(LinkDomain::Io), idx);
            self.normal.push_tail(&mut self.table.domain(LinkDomain::Io), idx);
            self.file_timeout(idx);
        }
        self.enqueue_ready(idx);
    }

    fn enqueue_ready(&mut self, idx: u32) {
        if let Some(conn) = self.table.get_mut(idx) {
            if !conn.in_ready {
                conn.in_ready = true;
                self.ready.push_tail(&mut self.table.domain(LinkDomain::Ready), idx);
            }
        }
    }

    // ── Accepting ────────────────────────────────────────────────────

    fn accept_burst(&mut self) {
        let Some(listen_fd) = self.listener else {
            return;
        };
        loop {
            match acceptor::accept_one(listen_fd, &self.shared) {
                Some((fd, addr)) => self.insert_connection(fd, addr),
                None => break,
            }
        }
    }

    fn drain_accept_handoffs(&mut self) {
        let Some(rx) = self.accept_rx.take() else {
            return;
        };
        while let Ok((fd, addr)) = rx.try_recv() {
            self.insert_connection(fd, addr);
        }
        self.accept_rx = Some(rx);
    }

    pub(crate) fn insert_connection(&mut self, fd: RawFd, addr: SocketAddr) {
        let wire = match self.shared.make_wire() {
            Ok(wire) => wire,
            Err(()) => {
                unsafe { libc::close(fd) };
                self.shared.release_peer(&addr);
                return;
            }
        };
        let conn = Connection::new(fd, addr, wire, self.shared.config.connection_timeout);
        let Some(idx) = self.table.insert(conn, self.worker) else {
            tracing::warn!("connection slots exhausted, refusing {addr}");
            metrics::CONNECTIONS_REFUSED.increment();
            unsafe { libc::close(fd) };
            self.shared.release_peer(&addr);
            return;
        };
        self.normal.push_tail(&mut self.table.domain(LinkDomain::Io), idx);
        self.file_timeout(idx);
        metrics::CONNECTIONS_ACCEPTED.increment();
        metrics::CONNECTIONS_ACTIVE.increment();
        let id = self.table.get(idx).expect("just inserted").id();
        self.shared.handler.on_connection(id, ConnEvent::Started);
        tracing::debug!(?addr, slot = idx, "connection accepted");

        if self.shared.config.turbo {
            // Optimistic read before the first poll.
            let config = self.shared.config.clone();
            if let Some(conn) = self.table.get_mut(idx) {
                conn.handle_read(&config);
            }
            self.drive(idx);
        } else {
            self.sync_interest(idx);
        }
    }

    /// File the connection on the right timeout list (if it has a timeout).
    fn file_timeout(&mut self, idx: u32) {
        let Some(conn) = self.table.get_mut(idx) else {
            return;
        };
        let kind = match conn.connection_timeout {
            None => None,
            Some(t) if Some(t) == self.shared.config.connection_timeout => {
                Some(TimeoutList::Normal)
            }
            Some(_) => Some(TimeoutList::Manual),
        };
        conn.timeout_list = kind;
        conn.timeout_dirty = false;
        match kind {
            Some(TimeoutList::Normal) => self
                .timeout_normal
                .push_tail(&mut self.table.domain(LinkDomain::Timeout), idx),
            Some(TimeoutList::Manual) => self
                .timeout_manual
                .push_tail(&mut self.table.domain(LinkDomain::Timeout), idx),
            None => {}
        }
    }

    fn unfile_timeout(&mut self, idx: u32) {
        let Some(conn) = self.table.get_mut(idx) else {
            return;
        };
        match conn.timeout_list.take() {
            Some(TimeoutList::Normal) => self
                .timeout_normal
                .remove(&mut self.table.domain(LinkDomain::Timeout), idx),
            Some(TimeoutList::Manual) => self
                .timeout_manual
                .remove(&mut self.table.domain(LinkDomain::Timeout), idx),
            None => {}
        }
    }

    fn refile_timeout(&mut self, idx: u32) {
        self.unfile_timeout(idx);
        let suspended = self.table.get(idx).map(|c| c.suspended).unwrap_or(true);
        if !suspended {
            self.file_timeout(idx);
        }
    }

    // ── Dispatch ─────────────────────────────────────────────────────

    fn dispatch_ready(&mut self) {
        while let Some(idx) = self.ready.pop_head(&mut self.table.domain(LinkDomain::Ready)) {
            if let Some(conn) = self.table.get_mut(idx) {
                conn.in_ready = false;
                if conn.suspended {
                    continue;
                }
            } else {
                continue;
            }
            self.drive(idx);
        }
    }

    /// Read, advance, write, advance; then apply whatever the automaton now
    /// asks for (interest change, suspension, list moves, upgrade, cleanup).
    fn drive(&mut self, idx: u32) {
        let config = self.shared.config.clone();
        let shared = Arc::clone(&self.shared);
        let env = Env {
            config: &config,
            handler: &shared.handler,
            dates: &shared.dates,
        };
        let Some(conn) = self.table.get_mut(idx) else {
            return;
        };
        let before_activity = conn.last_activity;
        if conn.readable {
            conn.readable = false;
            conn.handle_read(&config);
        }
        conn.handle_idle(&env);
        if conn.writable {
            conn.writable = false;
            conn.handle_write(&config);
            conn.handle_idle(&env);
        }

        let activity = conn.last_activity != before_activity;
        let suspend_requested = conn.suspend_requested;
        let timeout_dirty = conn.timeout_dirty;
        let info = conn.request.event_loop_info;
        let timeout_list = conn.timeout_list;

        if activity {
            match timeout_list {
                Some(TimeoutList::Normal) => self
                    .timeout_normal
                    .move_to_tail(&mut self.table.domain(LinkDomain::Timeout), idx),
                Some(TimeoutList::Manual) => self
                    .timeout_manual
                    .move_to_tail(&mut self.table.domain(LinkDomain::Timeout), idx),
                None => {}
            }
        }
        if timeout_dirty {
            self.refile_timeout(idx);
        }

        match info {
            EventLoopInfo::Cleanup => {
                self.move_to_cleanup(idx);
                return;
            }
            EventLoopInfo::Upgrade => {
                self.perform_upgrade(idx);
                return;
            }
            _ => {}
        }

        if suspend_requested {
            self.apply_suspend(idx);
            return;
        }
        self.sync_interest(idx);
    }

    fn apply_suspend(&mut self, idx: u32) {
        let Some(conn) = self.table.get_mut(idx) else {
            return;
        };
        if conn.suspended {
            return;
        }
        conn.suspended = true;
        conn.suspend_requested = false;
        conn.io_list = IoList::Suspended;
        let fd = conn.fd;
        self.normal.remove(&mut self.table.domain(LinkDomain::Io), idx);
        self.suspended
            .push_tail(&mut self.table.domain(LinkDomain::Io), idx);
        // Suspended connections leave the timeout domain entirely.
        self.unfile_timeout(idx);
        self.poller.deregister(fd);
        if let Some(conn) = self.table.get_mut(idx) {
            conn.registered = None;
        }
    }

    /// Register the poller interest the automaton asked for.
    fn sync_interest(&mut self, idx: u32) {
        let Some(conn) = self.table.get_mut(idx) else {
            return;
        };
        let want = match conn.request.event_loop_info {
            EventLoopInfo::Read => (true, false),
            EventLoopInfo::Write => (false, true),
            EventLoopInfo::Block | EventLoopInfo::Cleanup | EventLoopInfo::Upgrade => {
                (false, false)
            }
        };
        if conn.registered == Some(want) {
            return;
        }
        let fd = conn.fd;
        let token = idx as u64;
        conn.registered = Some(want);
        if let Err(err) = self.poller.register(fd, token, want.0, want.1) {
            tracing::warn!(error = %err, "poller registration failed");
            if let Some(conn) = self.table.get_mut(idx) {
                conn.request.state = State::Closed;
            }
            self.move_to_cleanup(idx);
        }
    }

    // ── Upgrade ──────────────────────────────────────────────────────

    fn perform_upgrade(&mut self, idx: u32) {
        use std::os::fd::FromRawFd;
        let Some(conn) = self.table.get_mut(idx) else {
            return;
        };
        let fd = conn.fd;
        let extra_in = conn.take_overread();
        conn.socket_taken = true;
        let handler = conn
            .request
            .response
            .as_ref()
            .and_then(|r| r.take_upgrade_handler());
        if let Some(response) = conn.request.response.take() {
            response.notify_completed(CompletionReason::Ok);
        }
        self.poller.deregister(fd);
        if let Some(handler) = handler {
            // Socket ownership transfers to the application.
            let stream = unsafe { std::net::TcpStream::from_raw_fd(fd) };
            handler(UpgradeStream { stream, extra_in });
        } else {
            // No handler to hand the socket to: close it ourselves.
            unsafe { libc::close(fd) };
        }
        if let Some(conn) = self.table.get_mut(idx) {
            conn.request.state = State::InCleanup;
        }
        self.move_to_cleanup(idx);
    }

    // ── Timeouts ─────────────────────────────────────────────────────

    /// Time until the oldest connection would expire.
    pub(crate) fn next_timeout(&self) -> Option<Duration> {
        let now = Instant::now();
        let mut earliest: Option<Duration> = None;
        let mut consider = |conn: &Connection| {
            if let Some(timeout) = conn.connection_timeout {
                let elapsed = now.duration_since(conn.last_activity);
                let left = timeout.checked_sub(elapsed).unwrap_or(Duration::ZERO);
                earliest = Some(match earliest {
                    Some(e) => e.min(left),
                    None => left,
                });
            }
        };
        // Head of the normal list is the oldest member.
        if let Some(head) = self.timeout_normal.head {
            if let Some(conn) = self.table.get(head) {
                consider(conn);
            }
        }
        let mut cur = self.timeout_manual.head;
        while let Some(idx) = cur {
            let conn = self.table.get(idx).expect("timeout member exists");
            consider(conn);
            cur = conn.timeout_links.next;
        }
        earliest
    }

    fn evict_timed_out(&mut self) {
        let now = Instant::now();
        // Normal list: ordered by activity, stop at the first survivor.
        loop {
            let Some(idx) = self.timeout_normal.head else {
                break;
            };
            let expired = {
                let conn = self.table.get(idx).expect("timeout member exists");
                match conn.connection_timeout {
                    Some(t) => now.duration_since(conn.last_activity) >= t,
                    None => false,
                }
            };
            if !expired {
                break;
            }
            self.expire(idx);
        }
        // Manual list: no ordering guarantee, scan every member.
        let mut cur = self.timeout_manual.head;
        while let Some(idx) = cur {
            let (next, expired) = {
                let conn = self.table.get(idx).expect("timeout member exists");
                let expired = match conn.connection_timeout {
                    Some(t) => now.duration_since(conn.last_activity) >= t,
                    None => false,
                };
                (conn.timeout_links.next, expired)
            };
            if expired {
                self.expire(idx);
            }
            cur = next;
        }
    }

    fn expire(&mut self, idx: u32) {
        tracing::debug!(slot = idx, "idle timeout");
        metrics::CONNECTIONS_TIMED_OUT.increment();
        if let Some(conn) = self.table.get_mut(idx) {
            conn.request.state = State::Closed;
        }
        self.move_to_cleanup(idx);
    }

    // ── Cleanup ──────────────────────────────────────────────────────

    fn move_to_cleanup(&mut self, idx: u32) {
        let Some(conn) = self.table.get_mut(idx) else {
            return;
        };
        if conn.io_list == IoList::Cleanup {
            return;
        }
        let from = conn.io_list;
        conn.io_list = IoList::Cleanup;
        match from {
            IoList::Normal => self.normal.remove(&mut self.table.domain(LinkDomain::Io), idx),
            IoList::Suspended => self
                .suspended
                .remove(&mut self.table.domain(LinkDomain::Io), idx),
            IoList::Cleanup => unreachable!(),
        }
        self.cleanup
            .push_tail(&mut self.table.domain(LinkDomain::Io), idx);
        self.unfile_timeout(idx);
        if let Some(conn) = self.table.get_mut(idx) {
            if conn.in_ready {
                conn.in_ready = false;
                self.ready
                    .remove(&mut self.table.domain(LinkDomain::Ready), idx);
            }
        }
    }

    fn process_cleanup(&mut self) {
        while let Some(idx) = self.cleanup.pop_head(&mut self.table.domain(LinkDomain::Io)) {
            self.destroy_connection(idx);
        }
    }

    /// Final teardown: callbacks, response release, pool, socket, slot.
    /// The socket closes before the pool is released so the peer sees the
    /// FIN while kernel buffers may still reference pool memory.
    fn destroy_connection(&mut self, idx: u32) {
        let Some(mut conn) = self.table.release(idx) else {
            return;
        };
        conn.io_list = IoList::Cleanup;
        let id = conn.id();

        let reason = if self.shared.quiescing() {
            CompletionReason::DaemonShutdown
        } else if conn.read_closed {
            CompletionReason::ClientAbort
        } else {
            CompletionReason::Error
        };
        if let Some(response) = conn.request.response.take() {
            if conn.request.client_aware {
                response.notify_completed(reason);
            }
            // Last reference may drop here, running the content-reader free
            // callback via Drop.
            drop(response);
        }

        self.poller.deregister(conn.fd);
        if !conn.socket_taken {
            conn.initiate_close(&self.shared.config);
            unsafe {
                libc::close(conn.fd);
            }
        }
        conn.pool = None;

        self.shared.handler.on_connection(id, ConnEvent::Closed);
        self.shared.release_peer(&conn.peer_addr);
        metrics::CONNECTIONS_CLOSED.increment();
        metrics::CONNECTIONS_ACTIVE.decrement();
        tracing::debug!(slot = idx, "connection destroyed");
    }

    fn force_close_all(&mut self) {
        let indices: Vec<u32> = self.table.indices().collect();
        for idx in indices {
            if let Some(conn) = self.table.get_mut(idx) {
                if conn.io_list != IoList::Cleanup {
                    conn.request.state = State::Closed;
                    self.move_to_cleanup(idx);
                }
            }
        }
    }

    // ── External-loop integration ────────────────────────────────────

    /// Fds and interests for the host's own select/poll.
    pub(crate) fn watched_fds(&self) -> (Vec<RawFd>, Vec<RawFd>) {
        let mut read = vec![self.itc.poll_fd()];
        let mut write = Vec::new();
        if let Some(fd) = self.listener {
            read.push(fd);
        }
        for idx in self.table.indices() {
            let conn = self.table.get(idx).expect("index exists");
            if conn.suspended {
                continue;
            }
            match conn.request.event_loop_info {
                EventLoopInfo::Read => read.push(conn.fd),
                EventLoopInfo::Write => write.push(conn.fd),
                _ => {}
            }
        }
        (read, write)
    }

    /// Feed back the host's select results, then run one maintenance pass.
    pub(crate) fn run_from_select(&mut self, readable: &[RawFd], writable: &[RawFd]) {
        if readable.contains(&self.itc.poll_fd()) {
            self.itc.drain();
        }
        if let Some(listen_fd) = self.listener {
            if readable.contains(&listen_fd) {
                self.accept_burst();
            }
        }
        let indices: Vec<u32> = self.table.indices().collect();
        for idx in indices {
            let Some(conn) = self.table.get_mut(idx) else {
                continue;
            };
            let fd = conn.fd;
            let is_readable = readable.contains(&fd);
            let is_writable = writable.contains(&fd);
            if is_readable || is_writable {
                conn.readable = is_readable;
                conn.writable = is_writable;
                self.enqueue_ready(idx);
            }
        }
        self.run_once();
    }

    pub(crate) fn active_count(&self) -> usize {
        self.table.active_count()
    }
}
