//! Readiness backends: one narrow interest-set interface over `select(2)`,
//! `poll(2)`, and `epoll(7)`.
//!
//! All three are level-triggered as used here; the event loop recomputes
//! interest from each connection's `event_loop_info` after every dispatch.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use crate::config::PollBackend;

/// One readiness report.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Event {
    pub token: u64,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}

pub(crate) enum Poller {
    Select(SelectPoller),
    Poll(PollPoller),
    #[cfg(target_os = "linux")]
    Epoll(EpollPoller),
}

impl Poller {
    pub(crate) fn new(backend: PollBackend) -> io::Result<Self> {
        match backend {
            PollBackend::Select => Ok(Poller::Select(SelectPoller::default())),
            PollBackend::Poll => Ok(Poller::Poll(PollPoller::default())),
            #[cfg(target_os = "linux")]
            PollBackend::Epoll | PollBackend::Auto => Ok(Poller::Epoll(EpollPoller::new()?)),
            #[cfg(not(target_os = "linux"))]
            PollBackend::Auto => Ok(Poller::Poll(PollPoller::default())),
            #[cfg(not(target_os = "linux"))]
            PollBackend::Epoll => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "epoll unavailable on this platform",
            )),
        }
    }

    /// Express interest in `fd`. Registering twice updates in place.
    pub(crate) fn register(
        &mut self,
        fd: RawFd,
        token: u64,
        read: bool,
        write: bool,
    ) -> io::Result<()> {
        match self {
            Poller::Select(p) => p.register(fd, token, read, write),
            Poller::Poll(p) => {
                p.register(fd, token, read, write);
                Ok(())
            }
            #[cfg(target_os = "linux")]
            Poller::Epoll(p) => p.register(fd, token, read, write),
        }
    }

    pub(crate) fn deregister(&mut self, fd: RawFd) {
        match self {
            Poller::Select(p) => {
                p.interest.remove(&fd);
            }
            Poller::Poll(p) => {
                p.interest.remove(&fd);
            }
            #[cfg(target_os = "linux")]
            Poller::Epoll(p) => p.deregister(fd),
        }
    }

    /// Block until readiness, timeout, or a wake. Events are appended to
    /// `out` (cleared first).
    pub(crate) fn wait(
        &mut self,
        timeout: Option<Duration>,
        out: &mut Vec<Event>,
    ) -> io::Result<()> {
        out.clear();
        match self {
            Poller::Select(p) => p.wait(timeout, out),
            Poller::Poll(p) => p.wait(timeout, out),
            #[cfg(target_os = "linux")]
            Poller::Epoll(p) => p.wait(timeout, out),
        }
    }
}

fn timeout_millis(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        Some(t) => {
            // Round up so a sub-millisecond deadline does not busy-spin.
            let mut ms = t.as_millis();
            if t.as_nanos() % 1_000_000 != 0 {
                ms += 1;
            }
            ms.min(i32::MAX as u128) as libc::c_int
        }
        None => -1,
    }
}

// ── select(2) ───────────────────────────────────────────────────────

#[derive(Default)]
pub(crate) struct SelectPoller {
    interest: HashMap<RawFd, (u64, bool, bool)>,
}

impl SelectPoller {
    fn register(&mut self, fd: RawFd, token: u64, read: bool, write: bool) -> io::Result<()> {
        if fd as usize >= libc::FD_SETSIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "fd exceeds FD_SETSIZE",
            ));
        }
        self.interest.insert(fd, (token, read, write));
        Ok(())
    }

    fn wait(&mut self, timeout: Option<Duration>, out: &mut Vec<Event>) -> io::Result<()> {
        let mut readfds: libc::fd_set = unsafe { std::mem::zeroed() };
        let mut writefds: libc::fd_set = unsafe { std::mem::zeroed() };
        let mut errfds: libc::fd_set = unsafe { std::mem::zeroed() };
        let mut nfds: RawFd = -1;
        unsafe {
            libc::FD_ZERO(&mut readfds);
            libc::FD_ZERO(&mut writefds);
            libc::FD_ZERO(&mut errfds);
            for (&fd, &(_, read, write)) in &self.interest {
                if read {
                    libc::FD_SET(fd, &mut readfds);
                }
                if write {
                    libc::FD_SET(fd, &mut writefds);
                }
                libc::FD_SET(fd, &mut errfds);
                nfds = nfds.max(fd);
            }
        }
        let mut tv;
        let tv_ptr = match timeout {
            Some(t) => {
                tv = libc::timeval {
                    tv_sec: t.as_secs() as libc::time_t,
                    tv_usec: t.subsec_micros() as libc::suseconds_t,
                };
                &mut tv as *mut libc::timeval
            }
            None => std::ptr::null_mut(),
        };
        let ret = unsafe {
            libc::select(nfds + 1, &mut readfds, &mut writefds, &mut errfds, tv_ptr)
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(());
            }
            return Err(err);
        }
        for (&fd, &(token, _, _)) in &self.interest {
            let readable = unsafe { libc::FD_ISSET(fd, &readfds) };
            let writable = unsafe { libc::FD_ISSET(fd, &writefds) };
            let error = unsafe { libc::FD_ISSET(fd, &errfds) };
            if readable || writable || error {
                out.push(Event {
                    token,
                    readable,
                    writable,
                    error,
                });
            }
        }
        Ok(())
    }
}

// ── poll(2) ─────────────────────────────────────────────────────────

#[derive(Default)]
pub(crate) struct PollPoller {
    interest: HashMap<RawFd, (u64, bool, bool)>,
    fds: Vec<libc::pollfd>,
}

impl PollPoller {
    fn register(&mut self, fd: RawFd, token: u64, read: bool, write: bool) {
        self.interest.insert(fd, (token, read, write));
    }

    fn wait(&mut self, timeout: Option<Duration>, out: &mut Vec<Event>) -> io::Result<()> {
        self.fds.clear();
        for (&fd, &(_, read, write)) in &self.interest {
            let mut events = 0;
            if read {
                events |= libc::POLLIN;
            }
            if write {
                events |= libc::POLLOUT;
            }
            self.fds.push(libc::pollfd {
                fd,
                events,
                revents: 0,
            });
        }
        let ret = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                timeout_millis(timeout),
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(());
            }
            return Err(err);
        }
        for pfd in &self.fds {
            if pfd.revents == 0 {
                continue;
            }
            let (token, _, _) = self.interest[&pfd.fd];
            out.push(Event {
                token,
                readable: pfd.revents & (libc::POLLIN | libc::POLLHUP) != 0,
                writable: pfd.revents & libc::POLLOUT != 0,
                error: pfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0,
            });
        }
        Ok(())
    }
}

// ── epoll(7) ────────────────────────────────────────────────────────

#[cfg(target_os = "linux")]
pub(crate) struct EpollPoller {
    epfd: RawFd,
    registered: HashMap<RawFd, ()>,
}

#[cfg(target_os = "linux")]
impl EpollPoller {
    fn new() -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(EpollPoller {
            epfd,
            registered: HashMap::new(),
        })
    }

    fn register(&mut self, fd: RawFd, token: u64, read: bool, write: bool) -> io::Result<()> {
        let mut events = 0u32;
        if read {
            events |= libc::EPOLLIN as u32;
        }
        if write {
            events |= libc::EPOLLOUT as u32;
        }
        let mut ev = libc::epoll_event { events, u64: token };
        let op = if self.registered.contains_key(&fd) {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        let ret = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        self.registered.insert(fd, ());
        Ok(())
    }

    fn deregister(&mut self, fd: RawFd) {
        if self.registered.remove(&fd).is_some() {
            unsafe {
                libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
            }
        }
    }

    fn wait(&mut self, timeout: Option<Duration>, out: &mut Vec<Event>) -> io::Result<()> {
        let mut events: [libc::epoll_event; 256] = unsafe { std::mem::zeroed() };
        let ret = unsafe {
            libc::epoll_wait(
                self.epfd,
                events.as_mut_ptr(),
                events.len() as libc::c_int,
                timeout_millis(timeout),
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(());
            }
            return Err(err);
        }
        for ev in events.iter().take(ret as usize) {
            out.push(Event {
                token: ev.u64,
                readable: ev.events & (libc::EPOLLIN | libc::EPOLLHUP) as u32 != 0,
                writable: ev.events & libc::EPOLLOUT as u32 != 0,
                error: ev.events & libc::EPOLLERR as u32 != 0,
            });
        }
        Ok(())
    }
}

#[cfg(target_os = "linux")]
impl Drop for EpollPoller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe_pair() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    fn close(fd: RawFd) {
        unsafe {
            libc::close(fd);
        }
    }

    fn check_backend(backend: PollBackend) {
        let (rd, wr) = pipe_pair();
        let mut poller = Poller::new(backend).unwrap();
        poller.register(rd, 7, true, false).unwrap();

        let mut events = Vec::new();
        poller
            .wait(Some(Duration::from_millis(10)), &mut events)
            .unwrap();
        assert!(events.is_empty(), "nothing written yet");

        assert_eq!(unsafe { libc::write(wr, b"x".as_ptr().cast(), 1) }, 1);
        poller
            .wait(Some(Duration::from_millis(1000)), &mut events)
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].token, 7);
        assert!(events[0].readable);

        poller.deregister(rd);
        close(rd);
        close(wr);
    }

    #[test]
    fn select_reports_readable() {
        check_backend(PollBackend::Select);
    }

    #[test]
    fn poll_reports_readable() {
        check_backend(PollBackend::Poll);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn epoll_reports_readable() {
        check_backend(PollBackend::Epoll);
    }

    #[test]
    fn select_rejects_fd_beyond_setsize() {
        let mut p = SelectPoller::default();
        assert!(p
            .register(libc::FD_SETSIZE as RawFd, 0, true, false)
            .is_err());
    }
}
