//! The daemon: listener ownership, threading-model dispatch, shared
//! admission state, and the host-facing control surface.
//!
//! Four models (see [`ThreadingModel`]): the host-driven external loop, one
//! internal event-loop thread, an acceptor plus worker pool, and one thread
//! per connection. The first three run [`EventLoop`]s; the last blocks in
//! `poll` on a single socket per thread.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::acceptor;
use crate::config::{Config, ThreadingModel};
use crate::connection::Connection;
use crate::date::DateService;
use crate::error::Error;
use crate::event_loop::EventLoop;
use crate::fsm::Env;
use crate::handler::{CompletionReason, ConnEvent, ConnId, Handler, UpgradeStream};
use crate::itc::WakeChannel;
use crate::metrics;
use crate::request::{EventLoopInfo, State};
use crate::response::Response;
use crate::wire::Wire;

/// Cross-thread operation, drained by the owning event loop after a wake.
pub(crate) enum Command {
    Resume(ConnId),
    QueueResponse(ConnId, u16, Arc<Response>),
    SetTimeout(ConnId, Option<Duration>),
}

/// State shared by every thread of one daemon. The mutex-guarded pieces are
/// touched only on accept, suspend/resume, and cleanup transitions.
pub(crate) struct Shared {
    pub config: Config,
    pub handler: Arc<dyn Handler>,
    pub dates: DateService,
    quiesce: AtomicBool,
    commands: Mutex<Vec<(u16, Command)>>,
    wakes: Vec<Arc<WakeChannel>>,
    ip_counts: Mutex<HashMap<IpAddr, u32>>,
    total_open: AtomicU32,
}

impl Shared {
    fn new(config: Config, handler: Arc<dyn Handler>, wakes: Vec<Arc<WakeChannel>>) -> Self {
        Shared {
            config,
            handler,
            dates: DateService::new(),
            quiesce: AtomicBool::new(false),
            commands: Mutex::new(Vec::new()),
            wakes,
            ip_counts: Mutex::new(HashMap::new()),
            total_open: AtomicU32::new(0),
        }
    }

    pub(crate) fn quiescing(&self) -> bool {
        self.quiesce.load(Ordering::Acquire)
    }

    fn begin_quiesce(&self) {
        self.quiesce.store(true, Ordering::Release);
        for wake in &self.wakes {
            wake.wake();
        }
    }

    /// Admission check under the daemon mutex: accept policy, global and
    /// per-IP limits. Counters are incremented on success and must be
    /// released with [`Shared::release_peer`].
    pub(crate) fn try_admit(&self, addr: &SocketAddr) -> bool {
        if self.quiescing() {
            return false;
        }
        if !self.handler.accept_policy(addr) {
            return false;
        }
        let mut ips = self.ip_counts.lock().unwrap();
        let limit = self.config.global_connection_limit;
        if limit != 0 && self.total_open.load(Ordering::Relaxed) >= limit {
            return false;
        }
        if self.config.ip_connection_limit != 0 {
            let count = ips.entry(addr.ip()).or_insert(0);
            if *count >= self.config.ip_connection_limit {
                return false;
            }
            *count += 1;
        }
        self.total_open.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub(crate) fn release_peer(&self, addr: &SocketAddr) {
        if self.config.ip_connection_limit != 0 {
            let mut ips = self.ip_counts.lock().unwrap();
            if let Some(count) = ips.get_mut(&addr.ip()) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    ips.remove(&addr.ip());
                }
            }
        }
        // Saturating: release is only ever paired with a successful admit.
        let _ = self
            .total_open
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            });
    }

    pub(crate) fn open_connections(&self) -> u32 {
        self.total_open.load(Ordering::Relaxed)
    }

    pub(crate) fn take_commands(&self, worker: u16) -> Vec<Command> {
        let mut queue = self.commands.lock().unwrap();
        let mut mine = Vec::new();
        let mut rest = Vec::new();
        for (target, command) in queue.drain(..) {
            if target == worker {
                mine.push(command);
            } else {
                rest.push((target, command));
            }
        }
        *queue = rest;
        mine
    }

    fn submit_command(&self, worker: u16, command: Command) -> Result<(), Error> {
        let Some(wake) = self.wakes.get(worker as usize) else {
            return Err(Error::InvalidConnection);
        };
        self.commands.lock().unwrap().push((worker, command));
        wake.wake();
        Ok(())
    }

    /// Build the transport for a freshly accepted socket.
    pub(crate) fn make_wire(&self) -> Result<Wire, ()> {
        #[cfg(feature = "tls")]
        if let Some(tls) = &self.config.tls {
            return crate::wire::TlsSession::new(Arc::clone(tls))
                .map(|s| Wire::Tls(Box::new(s)))
                .map_err(|_| ());
        }
        Ok(Wire::Plain)
    }
}

enum Model {
    External(Box<Mutex<EventLoop>>),
    Internal(Option<thread::JoinHandle<()>>),
    Pool {
        workers: Vec<thread::JoinHandle<()>>,
        acceptor: Option<thread::JoinHandle<()>>,
    },
    PerConnection {
        acceptor: Option<thread::JoinHandle<()>>,
        threads: Arc<Mutex<Vec<thread::JoinHandle<()>>>>,
    },
}

/// A running HTTP daemon. Construct with [`Daemon::start`], shut down with
/// [`Daemon::stop`].
pub struct Daemon {
    shared: Arc<Shared>,
    listen_fd: RawFd,
    local_addr: SocketAddr,
    listen_closed: AtomicBool,
    model: Model,
}

impl Daemon {
    /// Build the listener and launch the configured threading model.
    pub fn start<H: Handler>(config: Config, handler: H) -> Result<Daemon, Error> {
        config.validate()?;
        let bind = config
            .bind
            .ok_or_else(|| Error::Config("bind address required".into()))?;
        let handler: Arc<dyn Handler> = Arc::new(handler);

        let loops = match config.threading {
            ThreadingModel::ThreadPool(n) => n,
            _ => 1,
        };
        acceptor::ensure_nofile_limit(config.max_connections, loops)?;

        // Event-loop models poll the listener; the blocking acceptors of
        // the pool and thread-per-connection models park in accept4.
        let nonblock = matches!(
            config.threading,
            ThreadingModel::ExternalEventLoop | ThreadingModel::InternalThread
        );
        let (listen_fd, local_addr) =
            acceptor::create_listener(bind, config.backlog, config.reuse_addr, nonblock)?;

        let result = match config.threading {
            ThreadingModel::ExternalEventLoop => Self::start_external(config, handler, listen_fd),
            ThreadingModel::InternalThread => Self::start_internal(config, handler, listen_fd),
            ThreadingModel::ThreadPool(n) => Self::start_pool(config, handler, listen_fd, n),
            ThreadingModel::ThreadPerConnection => {
                Self::start_per_connection(config, handler, listen_fd)
            }
        };
        match result {
            Ok((shared, model)) => Ok(Daemon {
                shared,
                listen_fd,
                local_addr,
                listen_closed: AtomicBool::new(false),
                model,
            }),
            Err(err) => {
                unsafe { libc::close(listen_fd) };
                Err(err)
            }
        }
    }

    fn start_external(
        config: Config,
        handler: Arc<dyn Handler>,
        listen_fd: RawFd,
    ) -> Result<(Arc<Shared>, Model), Error> {
        let itc = Arc::new(WakeChannel::new()?);
        let shared = Arc::new(Shared::new(config, handler, vec![Arc::clone(&itc)]));
        let event_loop = EventLoop::new(0, Arc::clone(&shared), itc, Some(listen_fd), None)?;
        Ok((shared, Model::External(Box::new(Mutex::new(event_loop)))))
    }

    fn start_internal(
        config: Config,
        handler: Arc<dyn Handler>,
        listen_fd: RawFd,
    ) -> Result<(Arc<Shared>, Model), Error> {
        let itc = Arc::new(WakeChannel::new()?);
        let shared = Arc::new(Shared::new(config, handler, vec![Arc::clone(&itc)]));
        let mut event_loop = EventLoop::new(0, Arc::clone(&shared), itc, Some(listen_fd), None)?;
        let handle = thread::Builder::new()
            .name("hearth-loop".to_string())
            .spawn(move || event_loop.run())
            .map_err(Error::Io)?;
        Ok((shared, Model::Internal(Some(handle))))
    }

    fn start_pool(
        config: Config,
        handler: Arc<dyn Handler>,
        listen_fd: RawFd,
        workers: usize,
    ) -> Result<(Arc<Shared>, Model), Error> {
        let mut wakes = Vec::with_capacity(workers);
        let mut txs = Vec::with_capacity(workers);
        let mut rxs = Vec::with_capacity(workers);
        for _ in 0..workers {
            wakes.push(Arc::new(WakeChannel::new()?));
            let (tx, rx) = crossbeam_channel::unbounded::<(RawFd, SocketAddr)>();
            txs.push(tx);
            rxs.push(rx);
        }
        let shared = Arc::new(Shared::new(config, handler, wakes.clone()));

        let mut handles = Vec::with_capacity(workers);
        for (worker_id, rx) in rxs.into_iter().enumerate() {
            let mut event_loop = EventLoop::new(
                worker_id as u16,
                Arc::clone(&shared),
                Arc::clone(&wakes[worker_id]),
                None,
                Some(rx),
            )?;
            let handle = thread::Builder::new()
                .name(format!("hearth-worker-{worker_id}"))
                .spawn(move || event_loop.run())
                .map_err(Error::Io)?;
            handles.push(handle);
        }

        let acceptor_config = acceptor::AcceptorConfig {
            listen_fd,
            worker_channels: txs,
            worker_wakes: wakes,
            shared: Arc::clone(&shared),
        };
        let acceptor_handle = thread::Builder::new()
            .name("hearth-acceptor".to_string())
            .spawn(move || acceptor::run_acceptor(acceptor_config))
            .map_err(Error::Io)?;

        Ok((
            shared,
            Model::Pool {
                workers: handles,
                acceptor: Some(acceptor_handle),
            },
        ))
    }

    fn start_per_connection(
        config: Config,
        handler: Arc<dyn Handler>,
        listen_fd: RawFd,
    ) -> Result<(Arc<Shared>, Model), Error> {
        let shared = Arc::new(Shared::new(config, handler, Vec::new()));
        let threads: Arc<Mutex<Vec<thread::JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));

        let accept_shared = Arc::clone(&shared);
        let accept_threads = Arc::clone(&threads);
        let acceptor_handle = thread::Builder::new()
            .name("hearth-acceptor".to_string())
            .spawn(move || {
                run_blocking_acceptor(listen_fd, accept_shared, accept_threads);
            })
            .map_err(Error::Io)?;

        Ok((
            shared,
            Model::PerConnection {
                acceptor: Some(acceptor_handle),
                threads,
            },
        ))
    }

    /// The address the listener bound (resolves a requested port of 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Open connections right now. Observational only: under the threaded
    /// models the count can lag list transitions.
    pub fn active_connections(&self) -> u32 {
        self.shared.open_connections()
    }

    /// Re-queue a suspended (or body-blocked) connection before the next
    /// poll returns.
    pub fn resume(&self, id: ConnId) -> Result<(), Error> {
        self.for_worker(id, Command::Resume(id))
    }

    /// Queue a response for a connection currently blocked on the
    /// application, then resume it.
    pub fn queue_response(
        &self,
        id: ConnId,
        status: u16,
        response: Arc<Response>,
    ) -> Result<(), Error> {
        self.for_worker(id, Command::QueueResponse(id, status, response))
    }

    /// Override one connection's idle timeout.
    pub fn set_connection_timeout(
        &self,
        id: ConnId,
        timeout: Option<Duration>,
    ) -> Result<(), Error> {
        self.for_worker(id, Command::SetTimeout(id, timeout))
    }

    fn for_worker(&self, id: ConnId, command: Command) -> Result<(), Error> {
        match &self.model {
            Model::PerConnection { .. } => Err(Error::UnsupportedModel(
                "suspend/resume needs an event-loop model",
            )),
            Model::External(event_loop) => {
                self.shared.submit_command(id.worker, command)?;
                // The host may not be inside select right now; run the
                // maintenance pass if the loop is free.
                if let Ok(mut guard) = event_loop.try_lock() {
                    guard.run_once();
                }
                Ok(())
            }
            _ => self.shared.submit_command(id.worker, command),
        }
    }

    // ── External-loop integration ────────────────────────────────────

    /// Fds the host must select on: `(read set, write set)`.
    pub fn get_fdset(&self) -> Result<(Vec<RawFd>, Vec<RawFd>), Error> {
        match &self.model {
            Model::External(event_loop) => Ok(event_loop.lock().unwrap().watched_fds()),
            _ => Err(Error::UnsupportedModel("get_fdset is external-loop only")),
        }
    }

    /// How long the host may sleep before the earliest idle timeout.
    pub fn get_timeout(&self) -> Result<Option<Duration>, Error> {
        match &self.model {
            Model::External(event_loop) => Ok(event_loop.lock().unwrap().next_timeout()),
            _ => Err(Error::UnsupportedModel("get_timeout is external-loop only")),
        }
    }

    /// Dispatch the host's select results and run one maintenance pass.
    pub fn run_from_select(&self, readable: &[RawFd], writable: &[RawFd]) -> Result<(), Error> {
        match &self.model {
            Model::External(event_loop) => {
                event_loop.lock().unwrap().run_from_select(readable, writable);
                Ok(())
            }
            _ => Err(Error::UnsupportedModel(
                "run_from_select is external-loop only",
            )),
        }
    }

    // ── Shutdown ─────────────────────────────────────────────────────

    /// Graceful shutdown: stop accepting, force-close connections, join
    /// workers in reverse creation order, then the acceptor.
    pub fn stop(mut self) {
        tracing::info!("daemon stopping");
        self.shared.begin_quiesce();
        self.close_listener();
        match &mut self.model {
            Model::External(event_loop) => {
                event_loop.lock().unwrap().run_once();
            }
            Model::Internal(handle) => {
                if let Some(handle) = handle.take() {
                    let _ = handle.join();
                }
            }
            Model::Pool { workers, acceptor } => {
                while let Some(handle) = workers.pop() {
                    let _ = handle.join();
                }
                if let Some(handle) = acceptor.take() {
                    let _ = handle.join();
                }
            }
            Model::PerConnection { acceptor, threads } => {
                if let Some(handle) = acceptor.take() {
                    let _ = handle.join();
                }
                let drained: Vec<_> = std::mem::take(&mut *threads.lock().unwrap());
                for handle in drained {
                    let _ = handle.join();
                }
            }
        }
    }

    fn close_listener(&self) {
        if !self.listen_closed.swap(true, Ordering::AcqRel) {
            unsafe {
                libc::close(self.listen_fd);
            }
        }
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.shared.begin_quiesce();
        self.close_listener();
    }
}

// ── Thread-per-connection model ─────────────────────────────────────

fn run_blocking_acceptor(
    listen_fd: RawFd,
    shared: Arc<Shared>,
    threads: Arc<Mutex<Vec<thread::JoinHandle<()>>>>,
) {
    loop {
        if shared.quiescing() {
            return;
        }
        // Blocking accept; admission and socket options as everywhere else.
        let Some((fd, addr)) = acceptor::accept_one(listen_fd, &shared) else {
            // accept_one returns None for refused sockets and for fatal
            // accept errors (listener closed on shutdown). Distinguish by
            // checking the quiesce flag; otherwise keep accepting.
            if shared.quiescing() {
                return;
            }
            // Refused or transient failure: accept4 on a blocking socket
            // does not spin, so just continue.
            if !listener_alive(listen_fd) {
                return;
            }
            continue;
        };
        let conn_shared = Arc::clone(&shared);
        let spawn = thread::Builder::new()
            .name("hearth-conn".to_string())
            .spawn(move || run_per_connection(conn_shared, fd, addr));
        match spawn {
            Ok(handle) => threads.lock().unwrap().push(handle),
            Err(err) => {
                tracing::warn!(error = %err, "thread spawn failed");
                shared.release_peer(&addr);
                unsafe { libc::close(fd) };
            }
        }
    }
}

fn listener_alive(fd: RawFd) -> bool {
    let ret = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    ret >= 0
}

/// One connection serviced on its own thread: the same automaton, but the
/// thread blocks in `poll` on this socket alone. Suspend/resume is not
/// available here; handlers must queue their response during dispatch.
fn run_per_connection(shared: Arc<Shared>, fd: RawFd, addr: SocketAddr) {
    let config = shared.config.clone();
    let wire = match shared.make_wire() {
        Ok(wire) => wire,
        Err(()) => {
            shared.release_peer(&addr);
            unsafe { libc::close(fd) };
            return;
        }
    };
    let mut conn = Connection::new(fd, addr, wire, config.connection_timeout);
    conn.worker = u16::MAX;
    metrics::CONNECTIONS_ACCEPTED.increment();
    metrics::CONNECTIONS_ACTIVE.increment();
    shared.handler.on_connection(conn.id(), ConnEvent::Started);

    let env = Env {
        config: &config,
        handler: &shared.handler,
        dates: &shared.dates,
    };

    loop {
        conn.handle_idle(&env);
        if shared.quiescing() {
            conn.request.state = State::Closed;
        }
        match conn.request.event_loop_info {
            EventLoopInfo::Read | EventLoopInfo::Write => {
                let want_read = conn.request.event_loop_info == EventLoopInfo::Read;
                if timed_out(&conn) {
                    metrics::CONNECTIONS_TIMED_OUT.increment();
                    conn.request.state = State::Closed;
                    continue;
                }
                let mut pfd = libc::pollfd {
                    fd,
                    events: if want_read {
                        libc::POLLIN
                    } else {
                        libc::POLLOUT
                    },
                    revents: 0,
                };
                // Bounded wait so shutdown and timeouts are noticed.
                let ret = unsafe { libc::poll(&mut pfd, 1, 200) };
                if ret < 0 {
                    let err = std::io::Error::last_os_error();
                    if err.raw_os_error() != Some(libc::EINTR) {
                        conn.request.state = State::Closed;
                    }
                    continue;
                }
                if ret == 0 {
                    continue;
                }
                if pfd.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0 {
                    conn.handle_read(&config);
                }
                if pfd.revents & libc::POLLOUT != 0 {
                    conn.handle_write(&config);
                }
            }
            EventLoopInfo::Block => {
                // No event loop to resume this connection: a handler that
                // does not answer during dispatch cannot be serviced here.
                tracing::warn!("handler left request blocked in thread-per-connection model");
                conn.request.state = State::Closed;
            }
            EventLoopInfo::Upgrade => {
                use std::os::fd::FromRawFd;
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
                match handler {
                    Some(upgrade) => {
                        let stream = unsafe { std::net::TcpStream::from_raw_fd(fd) };
                        upgrade(UpgradeStream { stream, extra_in });
                    }
                    None => unsafe {
                        libc::close(fd);
                    },
                }
                break;
            }
            EventLoopInfo::Cleanup => break,
        }
    }

    // Teardown mirrors the event-loop cleanup ordering.
    let reason = if shared.quiescing() {
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
    }
    if !conn.socket_taken {
        conn.initiate_close(&config);
        unsafe {
            libc::close(conn.fd);
        }
    }
    conn.pool = None;
    shared.handler.on_connection(conn.id(), ConnEvent::Closed);
    shared.release_peer(&conn.peer_addr);
    metrics::CONNECTIONS_CLOSED.increment();
    metrics::CONNECTIONS_ACTIVE.decrement();
}

fn timed_out(conn: &Connection) -> bool {
    match conn.connection_timeout {
        Some(timeout) => conn.last_activity.elapsed() >= timeout,
        None => false,
    }
}
