//! Terminal Console (component B, spec.md §4.B): puts the controlling
//! terminal into raw mode on entry, restores it on every exit path.

use std::io::IsTerminal;
use std::os::fd::{AsFd, BorrowedFd};

use nix::sys::termios::{self, LocalFlags, SetArg, Termios};

use crate::error::DeviceError;

pub struct Console {
    stdin_original: Option<Termios>,
    stdout_original: Option<Termios>,
    interactive: bool,
}

impl Console {
    /// Saves stdin/stdout termios once and switches both to raw. When
    /// stdin is piped (non-interactive), ISIG is re-enabled on stdout
    /// so ^C still terminates the process (spec.md §4.B).
    pub fn enter() -> Result<Console, DeviceError> {
        let stdin = std::io::stdin();
        let stdout = std::io::stdout();
        let interactive = stdin.is_terminal();

        let stdin_original = if interactive {
            let fd = stdin.as_fd();
            let original = termios::tcgetattr(fd).map_err(|e| DeviceError::GetAttr("stdin".into(), e))?;
            let mut raw = original.clone();
            termios::cfmakeraw(&mut raw);
            termios::tcsetattr(fd, SetArg::TCSANOW, &raw)
                .map_err(|e| DeviceError::SetAttr("stdin".into(), e))?;
            Some(original)
        } else {
            None
        };

        let stdout_original = if stdout.is_terminal() {
            let fd = stdout.as_fd();
            let original = termios::tcgetattr(fd).map_err(|e| DeviceError::GetAttr("stdout".into(), e))?;
            let mut raw = original.clone();
            termios::cfmakeraw(&mut raw);
            if !interactive {
                raw.local_flags |= LocalFlags::ISIG;
            }
            termios::tcsetattr(fd, SetArg::TCSANOW, &raw)
                .map_err(|e| DeviceError::SetAttr("stdout".into(), e))?;
            Some(original)
        } else {
            None
        };

        Ok(Console {
            stdin_original,
            stdout_original,
            interactive,
        })
    }

    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    /// Restores both terminals' termios. Called explicitly from every
    /// exit path in addition to `Drop`, so that restoration happens
    /// before any final status line is printed (spec.md §3 invariant ii).
    pub fn restore(&mut self) {
        if let Some(original) = self.stdin_original.take() {
            let fd: BorrowedFd = std::io::stdin().as_fd();
            let _ = termios::tcsetattr(fd, SetArg::TCSANOW, &original);
        }
        if let Some(original) = self.stdout_original.take() {
            let fd: BorrowedFd = std::io::stdout().as_fd();
            let _ = termios::tcsetattr(fd, SetArg::TCSANOW, &original);
        }
    }
}

impl Drop for Console {
    fn drop(&mut self) {
        self.restore();
    }
}
