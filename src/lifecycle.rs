//! Lifecycle & Recovery (component J, spec.md §4.J): wait-for-device,
//! connect, disconnect, reconnect and termios restoration, wiring the
//! Device Port, Console, Input Pump and Event Loop together for one
//! run of the program, and dispatching the Script Bridge's launch
//! policy across (re)connects.

use std::io::Read;
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::poll::{PollFd, PollFlags, PollTimeout};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

use crate::alert;
use crate::config::{Options, ScriptPolicy};
use crate::console::Console;
use crate::device::Device;
use crate::error::DeviceError;
use crate::event_loop::{EventLoop, ExitOutcome};
use crate::input::InputPump;
use crate::log_file::LogWriter;
use crate::session::Session;
use crate::socket::SocketTap;

/// Installs SIGINT/SIGTERM handling on a dedicated thread (spec.md
/// §5): both are treated as a request for a clean shutdown rather
/// than a raw process kill, so every exit path still restores termios
/// (invariant ii).
fn install_signal_handler() -> std::io::Result<Arc<AtomicBool>> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    let flag = shutdown.clone();
    std::thread::spawn(move || {
        if signals.forever().next().is_some() {
            flag.store(true, Ordering::SeqCst);
        }
    });
    Ok(shutdown)
}

/// Only `Open` failures caused by the device node not existing yet, or
/// not being accessible yet, are worth retrying forever; everything
/// else (not a tty, already locked, termios/RS-485 failure) is the
/// "device-present" class of error and is fatal (spec.md §7).
fn is_transient(e: &DeviceError) -> bool {
    matches!(
        e,
        DeviceError::Open(_, io_err)
            if matches!(
                io_err.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
            )
    )
}

fn open_errno(e: &DeviceError) -> i32 {
    match e {
        DeviceError::Open(_, io_err) => io_err.raw_os_error().unwrap_or(-1),
        _ => -1,
    }
}

/// Polls the input pump's pipe for up to 1 second; returns true only
/// once the pump thread has exited and closed its write end (piped
/// stdin reached EOF while we were still waiting for the device).
fn input_reached_eof(input_pump: &InputPump) -> bool {
    let fd = input_pump.read_end.as_fd();
    let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
    let Ok(n) = nix::poll::poll(&mut fds, PollTimeout::from(1000u16)) else {
        return false;
    };
    if n == 0 {
        return false;
    }
    let readable = fds[0]
        .revents()
        .map(|r| r.contains(PollFlags::POLLIN))
        .unwrap_or(false);
    if !readable {
        return false;
    }
    let Ok(dup) = input_pump.read_end.try_clone() else {
        return false;
    };
    let mut file = std::fs::File::from(dup);
    let mut buf = [0u8; 64];
    matches!(file.read(&mut buf), Ok(0))
}

/// Waits for the device to become openable, polling at ~1 Hz and
/// diagnosing each distinct errno only once (spec.md §4.J
/// "wait-for-device"). With interactive stdin, the input pump is also
/// watched so piped-EOF or a shutdown signal can break out of an
/// otherwise indefinite wait; `Ok(None)` means give up cleanly.
/// `Err` means the open failed for a non-retryable reason.
fn wait_for_device(
    opts: &Options,
    console: &Console,
    input_pump: &InputPump,
    shutdown: &Arc<AtomicBool>,
) -> Result<Option<Device>, DeviceError> {
    let mut last_errno: Option<i32> = None;
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return Ok(None);
        }
        match Device::open(opts) {
            Ok(device) => return Ok(Some(device)),
            Err(e) if is_transient(&e) => {
                let errno = open_errno(&e);
                if last_errno != Some(errno) {
                    crate::diag::info(opts.mute, "Waiting for tty device...");
                    last_errno = Some(errno);
                }
            }
            Err(e) => return Err(e),
        }
        if console.is_interactive() {
            if input_reached_eof(input_pump) {
                return Ok(None);
            }
        } else {
            std::thread::sleep(Duration::from_secs(1));
        }
    }
}

/// Runs the script bridge once, replacing the event loop's device for
/// the duration (spec.md §4.I). The device comes back either way,
/// restored by `script::run`'s error-tuple even when the script fails.
fn run_script(opts: &Options, device: Device, session: &Session) -> Device {
    let source = match (&opts.script_inline, &opts.script_file) {
        (Some(src), _) => src.clone(),
        (None, Some(path)) => match std::fs::read_to_string(path) {
            Ok(src) => src,
            Err(e) => {
                let err = crate::error::ScriptError::Load(path.clone(), e);
                crate::diag::warn(opts.mute, &err.to_string());
                return device;
            }
        },
        (None, None) => return device,
    };

    match crate::script::run(&source, device, opts.clone(), session.hot_key.clone()) {
        Ok(device) => device,
        Err((device, e)) => {
            crate::diag::warn(opts.mute, &format!("script error: {e}"));
            device
        }
    }
}

/// Runs the program to completion: wait-for-device, connect, optional
/// script launch, the event loop, and — on a recoverable failure with
/// auto-connect enabled — reconnect, looping until a clean exit, a
/// non-recoverable failure, or a shutdown signal (spec.md §4.J).
pub fn run(opts: Options) -> anyhow::Result<()> {
    let mut console = Console::enter()?;
    let shutdown = install_signal_handler()?;

    let session = Arc::new(Session::new());
    let mut input_pump = InputPump::spawn(session.hot_key.clone())?;

    let mut socket = match &opts.socket {
        Some(path) => match SocketTap::bind(path) {
            Ok(tap) => Some(tap),
            Err(e) => {
                crate::diag::error(opts.mute, &format!("failed to bind socket {path}: {e}"));
                None
            }
        },
        None => None,
    };

    let mut log = if opts.log {
        match &opts.log_filename {
            Some(path) => match LogWriter::open(path, opts.log_strip) {
                Ok(w) => Some(w),
                Err(e) => {
                    crate::diag::error(opts.mute, &format!("failed to open log file: {e}"));
                    None
                }
            },
            None => None,
        }
    } else {
        None
    };

    let mut script_ran_once = false;

    let result: anyhow::Result<()> = loop {
        if shutdown.load(Ordering::SeqCst) {
            break Ok(());
        }

        let device = match wait_for_device(&opts, &console, &input_pump, &shutdown) {
            Ok(Some(device)) => device,
            Ok(None) => break Ok(()),
            Err(e) => break Err(e.into()),
        };
        let device_path = device.path().to_string();
        crate::diag::info(opts.mute, &format!("connected to {device_path}"));
        alert::fire(opts.alert);

        let device = match opts.script_policy {
            ScriptPolicy::Never => device,
            ScriptPolicy::Always => run_script(&opts, device, &session),
            ScriptPolicy::Once if !script_ran_once => {
                script_ran_once = true;
                run_script(&opts, device, &session)
            }
            ScriptPolicy::Once => device,
        };

        let mut event_loop = EventLoop::new(
            opts.clone(),
            device,
            console,
            session.clone(),
            input_pump,
            socket,
            log,
        );
        let outcome = event_loop.run(&shutdown);
        let (c, ip, sk, lg) = event_loop.into_parts();
        console = c;
        input_pump = ip;
        socket = sk;
        log = lg;

        match outcome {
            Err(e) => break Err(e.into()),
            Ok(ExitOutcome::Success) => break Ok(()),
            // A response-wait timeout is a single-shot failure, not a
            // device disconnect: it must exit non-zero even with
            // auto-connect on, never loop back to wait-for-device
            // (spec.md §6, §8 scenario 6).
            Ok(ExitOutcome::ResponseTimeout) => {
                break Err(anyhow::anyhow!("response-wait timed out on {device_path}"));
            }
            Ok(ExitOutcome::Failure) => {
                alert::fire(opts.alert);
                crate::diag::warn(opts.mute, &format!("disconnected from {device_path}"));
                if !opts.auto_connect {
                    break Err(anyhow::anyhow!("device disconnected: {device_path}"));
                }
                // Auto-connect: loop back to wait-for-device.
            }
        }
    };

    // Restored explicitly (not just via `Console`'s `Drop`) so it
    // happens before any diagnostic this return path still prints.
    console.restore();
    result
}
