//! Wire adapter: the narrow transport interface the state machine drives.
//!
//! Plaintext sockets and TLS sessions present the same two operations,
//! `recv` and `send`, with a four-way outcome. The state machine never
//! learns whether bytes crossed a TLS record layer; a handshake that needs
//! to read before it can write (or vice versa) surfaces as `WouldBlock`.

use std::io;
use std::os::fd::RawFd;

#[cfg(feature = "tls")]
use std::io::{Read, Write};

/// Outcome of one wire operation.
#[derive(Debug)]
pub(crate) enum WireIo {
    /// Bytes transferred.
    Bytes(usize),
    /// Peer closed the stream (recv) or sent close_notify.
    Closed,
    /// No progress possible now; retry on the next readiness event.
    WouldBlock,
    /// Unrecoverable transport error; tear the connection down.
    Fatal(io::Error),
}

pub(crate) enum Wire {
    Plain,
    #[cfg(feature = "tls")]
    Tls(Box<TlsSession>),
}

#[cfg(feature = "tls")]
pub(crate) struct TlsSession {
    pub session: rustls::ServerConnection,
    /// Ciphertext that hit a socket would-block mid-record; flushed before
    /// any further progress in either direction.
    deferred: Vec<u8>,
}

fn map_err(err: io::Error) -> WireIo {
    match err.raw_os_error() {
        Some(libc::EAGAIN) | Some(libc::EINTR) => WireIo::WouldBlock,
        #[allow(unreachable_patterns)] // EWOULDBLOCK == EAGAIN on Linux
        Some(libc::EWOULDBLOCK) => WireIo::WouldBlock,
        _ => WireIo::Fatal(err),
    }
}

fn raw_read(fd: RawFd, buf: &mut [u8]) -> WireIo {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n > 0 {
        WireIo::Bytes(n as usize)
    } else if n == 0 {
        WireIo::Closed
    } else {
        map_err(io::Error::last_os_error())
    }
}

fn raw_send(fd: RawFd, buf: &[u8]) -> WireIo {
    let flags = {
        #[cfg(target_os = "linux")]
        {
            libc::MSG_NOSIGNAL
        }
        #[cfg(not(target_os = "linux"))]
        {
            0
        }
    };
    let n = unsafe { libc::send(fd, buf.as_ptr() as *const libc::c_void, buf.len(), flags) };
    if n >= 0 {
        WireIo::Bytes(n as usize)
    } else {
        map_err(io::Error::last_os_error())
    }
}

impl Wire {
    /// Receive plaintext into `buf`.
    pub(crate) fn recv(&mut self, fd: RawFd, buf: &mut [u8]) -> WireIo {
        match self {
            Wire::Plain => raw_read(fd, buf),
            #[cfg(feature = "tls")]
            Wire::Tls(tls) => tls.recv(fd, buf),
        }
    }

    /// Transmit plaintext from `buf`.
    pub(crate) fn send(&mut self, fd: RawFd, buf: &[u8]) -> WireIo {
        match self {
            Wire::Plain => raw_send(fd, buf),
            #[cfg(feature = "tls")]
            Wire::Tls(tls) => tls.send(fd, buf),
        }
    }

    /// Best-effort close_notify before the socket is shut down.
    pub(crate) fn initiate_close(&mut self, fd: RawFd) {
        match self {
            Wire::Plain => {}
            #[cfg(feature = "tls")]
            Wire::Tls(tls) => {
                tls.session.send_close_notify();
                let _ = tls.flush_ciphertext(fd);
            }
        }
    }
}

#[cfg(feature = "tls")]
impl TlsSession {
    pub(crate) fn new(config: std::sync::Arc<rustls::ServerConfig>) -> Result<Self, rustls::Error> {
        Ok(TlsSession {
            session: rustls::ServerConnection::new(config)?,
            deferred: Vec::new(),
        })
    }

    /// Write pending ciphertext (handshake records, alerts, app data) to the
    /// socket. Returns `WouldBlock` if the socket backed up with records
    /// still pending.
    fn flush_ciphertext(&mut self, fd: RawFd) -> WireIo {
        let mut total = 0usize;
        while self.session.wants_write() {
            let mut out = Vec::with_capacity(4096);
            if let Err(e) = self.session.write_tls(&mut out) {
                return WireIo::Fatal(e);
            }
            let mut sent = 0;
            while sent < out.len() {
                match raw_send(fd, &out[sent..]) {
                    WireIo::Bytes(n) => sent += n,
                    WireIo::WouldBlock => {
                        // Unsent records stay queued in a deferred buffer so
                        // the next flush resumes where this one stopped.
                        self.deferred = out.split_off(sent);
                        return WireIo::WouldBlock;
                    }
                    other => return other,
                }
            }
            total += sent;
        }
        WireIo::Bytes(total)
    }

    fn recv(&mut self, fd: RawFd, buf: &mut [u8]) -> WireIo {
        // Drain records the handshake queued up before reading more.
        if !self.deferred.is_empty() {
            match self.flush_deferred(fd) {
                WireIo::WouldBlock => return WireIo::WouldBlock,
                WireIo::Fatal(e) => return WireIo::Fatal(e),
                _ => {}
            }
        }

        // Plaintext already decrypted from an earlier record batch.
        match self.session.reader().read(buf) {
            Ok(n) if n > 0 => return WireIo::Bytes(n),
            Ok(_) => return WireIo::Closed, // clean TLS closure
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return WireIo::Fatal(e),
        }

        // Pull ciphertext off the socket and run the record layer.
        let mut raw = [0u8; 16 * 1024];
        let n = match raw_read(fd, &mut raw) {
            WireIo::Bytes(n) => n,
            other => return other,
        };
        let mut cursor = io::Cursor::new(&raw[..n]);
        if let Err(e) = self.session.read_tls(&mut cursor) {
            return WireIo::Fatal(e);
        }
        let state = match self.session.process_new_packets() {
            Ok(state) => state,
            Err(e) => {
                // Flush the alert before reporting the failure.
                let _ = self.flush_ciphertext(fd);
                return WireIo::Fatal(io::Error::new(io::ErrorKind::InvalidData, e));
            }
        };

        // Handshake responses and session tickets go out immediately.
        if self.session.wants_write() {
            if let WireIo::Fatal(e) = self.flush_ciphertext(fd) {
                return WireIo::Fatal(e);
            }
        }

        if state.plaintext_bytes_to_read() > 0 {
            match self.session.reader().read(buf) {
                Ok(n) if n > 0 => return WireIo::Bytes(n),
                Ok(_) => return WireIo::Closed,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return WireIo::Fatal(e),
            }
        }
        if state.peer_has_closed() {
            return WireIo::Closed;
        }
        // Mid-handshake, or records consumed without plaintext yet.
        WireIo::WouldBlock
    }

    fn send(&mut self, fd: RawFd, buf: &[u8]) -> WireIo {
        // Ciphertext from a previous short write goes first; accepting more
        // plaintext while records are stuck would let rustls buffer without
        // bound.
        if !self.deferred.is_empty() {
            match self.flush_deferred(fd) {
                WireIo::WouldBlock => return WireIo::WouldBlock,
                WireIo::Fatal(e) => return WireIo::Fatal(e),
                _ => {}
            }
        }
        if self.session.is_handshaking() {
            return WireIo::WouldBlock;
        }
        let n = match self.session.writer().write(buf) {
            Ok(n) => n,
            Err(e) => return WireIo::Fatal(e),
        };
        match self.flush_ciphertext(fd) {
            WireIo::Fatal(e) => WireIo::Fatal(e),
            // Plaintext was accepted even if records are still queued; the
            // next send or recv resumes the flush.
            _ => WireIo::Bytes(n),
        }
    }

    fn flush_deferred(&mut self, fd: RawFd) -> WireIo {
        let mut sent = 0;
        while sent < self.deferred.len() {
            match raw_send(fd, &self.deferred[sent..]) {
                WireIo::Bytes(n) => sent += n,
                WireIo::WouldBlock => {
                    self.deferred.drain(..sent);
                    return WireIo::WouldBlock;
                }
                other => return other,
            }
        }
        self.deferred.clear();
        WireIo::Bytes(sent)
    }
}
