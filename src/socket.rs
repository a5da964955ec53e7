//! Socket Tap (component O, spec.md §2 "socket multiplexer"
//! collaborator, §4.G, §5): a Unix-domain socket listener whose
//! accepted connections behave like a second input/output pump —
//! bytes in are forwarded into the Command Interpreter exactly like
//! input-pump bytes, and post-render device bytes are broadcast back
//! out to every connected client.

use std::io::{Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};

pub struct SocketTap {
    listener: UnixListener,
    clients: Vec<UnixStream>,
}

impl SocketTap {
    pub fn bind(path: &str) -> std::io::Result<SocketTap> {
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path)?;
        listener.set_nonblocking(true)?;
        Ok(SocketTap {
            listener,
            clients: Vec::new(),
        })
    }

    pub fn listener_fd(&self) -> RawFd {
        self.listener.as_fd().as_raw_fd()
    }

    pub fn client_fds(&self) -> Vec<RawFd> {
        self.clients.iter().map(|c| c.as_fd().as_raw_fd()).collect()
    }

    /// Accepts any pending connections; call when the listener fd is
    /// readable.
    pub fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, _addr)) => {
                    let _ = stream.set_nonblocking(true);
                    self.clients.push(stream);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::warn!("socket tap: accept error: {e}");
                    break;
                }
            }
        }
    }

    /// Reads one byte from the client identified by `fd`, if any is
    /// ready. Returns `None` on EOF/error, dropping that client.
    pub fn read_byte_from(&mut self, fd: RawFd) -> Option<u8> {
        let idx = self.clients.iter().position(|c| c.as_fd().as_raw_fd() == fd)?;
        let mut buf = [0u8; 1];
        match self.clients[idx].read(&mut buf) {
            Ok(1) => Some(buf[0]),
            _ => {
                self.clients.remove(idx);
                None
            }
        }
    }

    /// Broadcasts post-render device bytes to every connected client
    /// (spec.md §4.G "device readable" fan-out).
    pub fn broadcast(&mut self, bytes: &[u8]) {
        self.clients.retain_mut(|c| c.write_all(bytes).is_ok());
    }

}

/// Helper so callers holding a `RawFd` from `poll` can build a
/// `BorrowedFd` without unsafe sprinkled through `event_loop.rs`.
pub fn borrow(fd: RawFd) -> BorrowedFd<'static> {
    unsafe { BorrowedFd::borrow_raw(fd) }
}
