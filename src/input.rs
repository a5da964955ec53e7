//! Input Pump (component C, spec.md §4.C): a dedicated thread that
//! reads the local input stream into a pipe the main event loop polls,
//! and that observes the hot-key mailbox used to abort blocking
//! transfers.

use std::io::Read;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;
use std::thread::JoinHandle;

use nix::unistd;

use crate::session::HotKey;

/// Owns the read end of the pump's pipe; the main event loop polls
/// this fd alongside the device and socket descriptors.
pub struct InputPump {
    pub read_end: OwnedFd,
    _handle: JoinHandle<()>,
}

impl InputPump {
    /// Spawns the pump thread for the life of the process (spec.md
    /// §4.C). `hot_key` is the one-slot mailbox shared with the
    /// transfer adapter.
    pub fn spawn(hot_key: Arc<HotKey>) -> std::io::Result<InputPump> {
        let (read_end, write_end) = unistd::pipe()?;

        let handle = std::thread::spawn(move || {
            pump_loop(write_end, hot_key);
        });

        Ok(InputPump {
            read_end,
            _handle: handle,
        })
    }
}

fn pump_loop(write_end: OwnedFd, hot_key: Arc<HotKey>) {
    let mut stdin = std::io::stdin();
    let mut buf = [0u8; libc::BUFSIZ as usize];
    loop {
        match stdin.read(&mut buf) {
            Ok(0) => {
                // EOF: closing our end of the pipe lets the main task
                // observe readable+zero-bytes and treat it as
                // end-of-input (spec.md §4.C).
                drop(write_end);
                return;
            }
            Ok(n) => {
                let mut forward = Vec::with_capacity(n);
                for &b in &buf[..n] {
                    if hot_key.try_store(b) {
                        continue;
                    }
                    forward.push(b);
                }
                if !forward.is_empty() {
                    if write_all(write_end.as_raw_fd(), &forward).is_err() {
                        return;
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::warn!("input pump: read error: {e}");
                return;
            }
        }
    }
}

fn write_all(fd: std::os::fd::RawFd, mut data: &[u8]) -> nix::Result<()> {
    use std::os::fd::BorrowedFd;
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    while !data.is_empty() {
        let n = unistd::write(borrowed, data)?;
        data = &data[n..];
    }
    Ok(())
}
