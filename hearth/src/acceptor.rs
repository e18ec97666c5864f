//! Listener setup and the accept path.
//!
//! All models accept through [`accept_one`] (nonblocking, used inside an
//! event loop) or [`run_acceptor`] (blocking thread for the pool model,
//! distributing accepted sockets round-robin over per-worker channels with
//! an ITC wake per handoff).

use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::Arc;

use crossbeam_channel::Sender;

use crate::daemon::Shared;
use crate::itc::WakeChannel;
use crate::metrics;

/// Create the TCP listener. `nonblock` is set for event-loop models; the
/// pool acceptor blocks in `accept4` instead.
pub(crate) fn create_listener(
    addr: SocketAddr,
    backlog: i32,
    reuse_addr: bool,
    nonblock: bool,
) -> Result<(RawFd, SocketAddr), crate::error::Error> {
    let domain = if addr.is_ipv4() {
        libc::AF_INET
    } else {
        libc::AF_INET6
    };

    let mut sock_type = libc::SOCK_STREAM | libc::SOCK_CLOEXEC;
    if nonblock {
        sock_type |= libc::SOCK_NONBLOCK;
    }
    let fd = unsafe { libc::socket(domain, sock_type, 0) };
    if fd < 0 {
        return Err(crate::error::Error::Io(io::Error::last_os_error()));
    }

    if reuse_addr {
        let optval: libc::c_int = 1;
        unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &optval as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
    }

    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let addr_len = socket_addr_to_sockaddr(addr, &mut storage);
    let ret = unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, addr_len) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(crate::error::Error::Bind(format!("bind {addr}: {err}")));
    }

    let ret = unsafe { libc::listen(fd, backlog) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(crate::error::Error::Bind(format!("listen: {err}")));
    }

    let bound = local_addr_of(fd).unwrap_or(addr);
    Ok((fd, bound))
}

/// The address the listener actually bound (resolves port 0).
pub(crate) fn local_addr_of(fd: RawFd) -> Option<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let ret =
        unsafe { libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) };
    if ret < 0 {
        return None;
    }
    sockaddr_to_socket_addr(&storage)
}

/// Accept one connection, apply policy and limits, prep socket options.
/// `None` on would-block or when the socket was refused.
pub(crate) fn accept_one(listen_fd: RawFd, shared: &Arc<Shared>) -> Option<(RawFd, SocketAddr)> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut addr_len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

    let fd = unsafe {
        libc::accept4(
            listen_fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut addr_len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    };
    if fd < 0 {
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EAGAIN) | Some(libc::EINTR) => return None,
            Some(libc::EMFILE) | Some(libc::ENFILE) => {
                // Out of file descriptors: back off briefly, then let the
                // caller retry.
                tracing::warn!("accept failed: {err}");
                std::thread::sleep(std::time::Duration::from_millis(10));
                return None;
            }
            _ => return None,
        }
    }

    let peer_addr = sockaddr_to_socket_addr(&storage)
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));

    if !shared.try_admit(&peer_addr) {
        metrics::CONNECTIONS_REFUSED.increment();
        unsafe { libc::close(fd) };
        return None;
    }

    if shared.config.tcp_nodelay {
        let optval: libc::c_int = 1;
        unsafe {
            libc::setsockopt(
                fd,
                libc::IPPROTO_TCP,
                libc::TCP_NODELAY,
                &optval as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
    }

    Some((fd, peer_addr))
}

/// Configuration for the pool model's dedicated acceptor thread.
pub(crate) struct AcceptorConfig {
    pub listen_fd: RawFd,
    /// Per-worker channels for accepted (fd, peer) pairs.
    pub worker_channels: Vec<Sender<(RawFd, SocketAddr)>>,
    /// Per-worker wake channels, rung after each handoff.
    pub worker_wakes: Vec<Arc<WakeChannel>>,
    pub shared: Arc<Shared>,
}

/// Run the acceptor loop. Terminates on shutdown (listen fd closed) or when
/// every worker has exited.
///
/// Accepts via blocking `accept4` and distributes admitted sockets to
/// workers round-robin, waking each worker through its ITC.
pub(crate) fn run_acceptor(config: AcceptorConfig) {
    let num_workers = config.worker_channels.len();
    if num_workers == 0 {
        return;
    }

    let mut next_worker = 0usize;
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut alive = vec![true; num_workers];
    let mut alive_count = num_workers;

    loop {
        if config.shared.quiescing() {
            return;
        }
        let mut addr_len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let fd = unsafe {
            libc::accept4(
                config.listen_fd,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut addr_len,
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };

        if fd < 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EMFILE) | Some(libc::ENFILE) => {
                    tracing::warn!("accept failed: {err}");
                    std::thread::sleep(std::time::Duration::from_millis(10));
                    continue;
                }
                _ => {
                    // Listen fd closed (shutdown) or unrecoverable.
                    return;
                }
            }
        }

        let peer_addr = sockaddr_to_socket_addr(&storage)
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));

        if !config.shared.try_admit(&peer_addr) {
            metrics::CONNECTIONS_REFUSED.increment();
            unsafe { libc::close(fd) };
            continue;
        }

        if config.shared.config.tcp_nodelay {
            let optval: libc::c_int = 1;
            unsafe {
                libc::setsockopt(
                    fd,
                    libc::IPPROTO_TCP,
                    libc::TCP_NODELAY,
                    &optval as *const _ as *const libc::c_void,
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                );
            }
        }

        // Round-robin over live workers.
        let mut sent = false;
        for _ in 0..num_workers {
            let worker_idx = next_worker % num_workers;
            next_worker = next_worker.wrapping_add(1);
            if !alive[worker_idx] {
                continue;
            }
            if config.worker_channels[worker_idx]
                .send((fd, peer_addr))
                .is_err()
            {
                alive[worker_idx] = false;
                alive_count -= 1;
                if alive_count == 0 {
                    config.shared.release_peer(&peer_addr);
                    unsafe { libc::close(fd) };
                    return;
                }
                continue;
            }
            config.worker_wakes[worker_idx].wake();
            sent = true;
            break;
        }
        if !sent {
            config.shared.release_peer(&peer_addr);
            unsafe { libc::close(fd) };
            return;
        }
    }
}

/// Ensure RLIMIT_NOFILE can cover the configured connection count plus
/// per-loop overhead (poller fds, wake channels, listener, stdio). Raises
/// the soft limit toward the hard limit when possible.
pub(crate) fn ensure_nofile_limit(
    max_connections: u32,
    num_loops: usize,
) -> Result<(), crate::error::Error> {
    let mut rlim: libc::rlimit = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) };
    if ret != 0 {
        return Err(crate::error::Error::Io(io::Error::last_os_error()));
    }

    let per_loop_overhead: u64 = 4;
    let global_overhead: u64 = 64;
    let required =
        max_connections as u64 + per_loop_overhead * num_loops as u64 + global_overhead;

    let soft = rlim.rlim_cur;
    let hard = rlim.rlim_max;
    if soft >= required {
        return Ok(());
    }
    if hard >= required || hard == libc::RLIM_INFINITY {
        rlim.rlim_cur = if hard == libc::RLIM_INFINITY {
            required
        } else {
            required.min(hard)
        };
        let ret = unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &rlim) };
        if ret != 0 {
            return Err(crate::error::Error::Io(io::Error::last_os_error()));
        }
        Ok(())
    } else {
        Err(crate::error::Error::ResourceLimit(format!(
            "RLIMIT_NOFILE too low: need {} but hard limit is {} (soft: {})",
            required, hard, soft
        )))
    }
}

/// Convert a `sockaddr_storage` (from accept4/getsockname) to a Rust
/// `SocketAddr`.
pub(crate) fn sockaddr_to_socket_addr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sa = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = std::net::Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr));
            let port = u16::from_be(sa.sin_port);
            Some(SocketAddr::from((ip, port)))
        }
        libc::AF_INET6 => {
            let sa = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = std::net::Ipv6Addr::from(sa.sin6_addr.s6_addr);
            let port = u16::from_be(sa.sin6_port);
            Some(SocketAddr::from((ip, port)))
        }
        _ => None,
    }
}

/// Fill a `sockaddr_storage` from a Rust `SocketAddr`; returns the length.
pub(crate) fn socket_addr_to_sockaddr(
    addr: SocketAddr,
    storage: &mut libc::sockaddr_storage,
) -> libc::socklen_t {
    match addr {
        SocketAddr::V4(v4) => {
            let sa = unsafe { &mut *(storage as *mut _ as *mut libc::sockaddr_in) };
            sa.sin_family = libc::AF_INET as libc::sa_family_t;
            sa.sin_port = v4.port().to_be();
            sa.sin_addr.s_addr = u32::from(*v4.ip()).to_be();
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t
        }
        SocketAddr::V6(v6) => {
            let sa = unsafe { &mut *(storage as *mut _ as *mut libc::sockaddr_in6) };
            sa.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sa.sin6_port = v6.port().to_be();
            sa.sin6_addr.s6_addr = v6.ip().octets();
            sa.sin6_flowinfo = v6.flowinfo();
            sa.sin6_scope_id = v6.scope_id();
            std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sockaddr_round_trip_v4() {
        let addr: SocketAddr = "192.168.1.7:8080".parse().unwrap();
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        socket_addr_to_sockaddr(addr, &mut storage);
        assert_eq!(sockaddr_to_socket_addr(&storage), Some(addr));
    }

    #[test]
    fn sockaddr_round_trip_v6() {
        let addr: SocketAddr = "[2001:db8::1]:443".parse().unwrap();
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        socket_addr_to_sockaddr(addr, &mut storage);
        assert_eq!(sockaddr_to_socket_addr(&storage), Some(addr));
    }

    #[test]
    fn listener_binds_ephemeral_port() {
        let (fd, bound) =
            create_listener("127.0.0.1:0".parse().unwrap(), 16, true, true).unwrap();
        assert_ne!(bound.port(), 0);
        unsafe { libc::close(fd) };
    }

    #[test]
    fn nofile_check_passes_for_small_counts() {
        assert!(ensure_nofile_limit(16, 1).is_ok());
    }
}
