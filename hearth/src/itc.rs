//! Inter-thread wake channel.
//!
//! A level-triggered, pipe-like primitive registered with every poller so
//! that threads outside the event loop (resume, shutdown, accept handoff)
//! can knock a thread out of its blocking poll syscall. `eventfd` on Linux,
//! a non-blocking self-pipe elsewhere.

use std::io;
use std::os::fd::RawFd;

pub(crate) struct WakeChannel {
    /// Fd the poller watches for readability.
    read_fd: RawFd,
    /// Fd written to wake. Same as `read_fd` for eventfd.
    write_fd: RawFd,
}

// The channel is written from arbitrary threads and drained by the owning
// event thread; both operations are single syscalls on non-blocking fds.
unsafe impl Send for WakeChannel {}
unsafe impl Sync for WakeChannel {}

impl WakeChannel {
    #[cfg(target_os = "linux")]
    pub(crate) fn new() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(WakeChannel {
            read_fd: fd,
            write_fd: fd,
        })
    }

    #[cfg(not(target_os = "linux"))]
    pub(crate) fn new() -> io::Result<Self> {
        let mut fds = [0 as RawFd; 2];
        let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        for fd in fds {
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL);
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
                let fdflags = libc::fcntl(fd, libc::F_GETFD);
                libc::fcntl(fd, libc::F_SETFD, fdflags | libc::FD_CLOEXEC);
            }
        }
        Ok(WakeChannel {
            read_fd: fds[0],
            write_fd: fds[1],
        })
    }

    /// Fd to register with the poller (read interest).
    pub(crate) fn poll_fd(&self) -> RawFd {
        self.read_fd
    }

    /// Wake the owning thread. Safe from any thread; a full pipe/counter
    /// already guarantees a pending wake, so short writes are ignored.
    pub(crate) fn wake(&self) {
        let val: u64 = 1;
        unsafe {
            libc::write(
                self.write_fd,
                &val as *const u64 as *const libc::c_void,
                8,
            );
        }
    }

    /// Consume all pending wakes. Called by the event thread once the poller
    /// reports the channel readable.
    pub(crate) fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(self.read_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if n <= 0 {
                break;
            }
        }
    }
}

impl Drop for WakeChannel {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            if self.write_fd != self.read_fd {
                libc::close(self.write_fd);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_makes_channel_readable() {
        let itc = WakeChannel::new().unwrap();
        itc.wake();
        itc.wake();

        let mut pfd = libc::pollfd {
            fd: itc.poll_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let ready = unsafe { libc::poll(&mut pfd, 1, 0) };
        assert_eq!(ready, 1);
        assert!(pfd.revents & libc::POLLIN != 0);

        itc.drain();
        pfd.revents = 0;
        let ready = unsafe { libc::poll(&mut pfd, 1, 0) };
        assert_eq!(ready, 0);
    }

    #[test]
    fn wake_from_other_thread() {
        use std::sync::Arc;
        let itc = Arc::new(WakeChannel::new().unwrap());
        let writer = Arc::clone(&itc);
        std::thread::spawn(move || writer.wake()).join().unwrap();

        let mut pfd = libc::pollfd {
            fd: itc.poll_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let ready = unsafe { libc::poll(&mut pfd, 1, 1000) };
        assert_eq!(ready, 1);
    }
}
