//! Event Loop (component G, spec.md §4.G): the multiplexed readiness
//! wait over the device, the input pipe, and the socket tap; dispatch
//! into the Command Interpreter, Transform Pipeline, log writer, and
//! socket broadcast.

use std::io::Write;
use std::os::fd::{AsFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use colored::Colorize;
use nix::poll::{PollFd, PollFlags, PollTimeout};

use crate::command::{Action, CommandState};
use crate::config::Options;
use crate::console::Console;
use crate::device::Device;
use crate::input::InputPump;
use crate::line;
use crate::log_file::LogWriter;
use crate::session::Session;
use crate::socket::SocketTap;
use crate::transform::{self, RenderState};

pub enum ExitOutcome {
    Success,
    Failure,
    /// Response-wait's per-select timeout fired with no CR/LF seen
    /// from the device (spec.md §6 "response-wait timeout"). Distinct
    /// from `Failure` so Lifecycle exits non-zero instead of treating
    /// it like a device-runtime disconnect and reconnecting forever.
    ResponseTimeout,
}

pub struct EventLoop {
    pub opts: Options,
    /// `None` only for the instant `run_script_action` has lent the
    /// device to the script bridge (rhai's closures need a `'static`,
    /// owned `Device`, not a borrow) — always restored to `Some`
    /// before control returns to `run()`.
    device_slot: Option<Device>,
    pub console: Console,
    pub session: Arc<Session>,
    pub input_pump: InputPump,
    pub socket: Option<SocketTap>,
    pub log: Option<LogWriter>,
    cmd_state: CommandState,
    render_state: RenderState,
}

impl EventLoop {
    pub fn new(
        opts: Options,
        device: Device,
        console: Console,
        session: Arc<Session>,
        input_pump: InputPump,
        socket: Option<SocketTap>,
        log: Option<LogWriter>,
    ) -> Self {
        EventLoop {
            opts,
            device_slot: Some(device),
            console,
            session,
            input_pump,
            socket,
            log,
            cmd_state: CommandState::new(),
            render_state: RenderState::new(),
        }
    }

    fn device(&self) -> &Device {
        self.device_slot.as_ref().expect("device present outside script bridge")
    }

    fn device_mut(&mut self) -> &mut Device {
        self.device_slot.as_mut().expect("device present outside script bridge")
    }

    /// Reclaims the collaborators that outlive any one connection
    /// attempt — the console, input pump, socket tap and log writer —
    /// so Lifecycle can hand them into the next `EventLoop` after a
    /// reconnect (spec.md §4.J). The device, command state and render
    /// state do not survive a reconnect and are dropped with `self`.
    pub fn into_parts(self) -> (Console, InputPump, Option<SocketTap>, Option<LogWriter>) {
        (self.console, self.input_pump, self.socket, self.log)
    }

    /// Runs until quit, EOF-on-input, a device error, or a
    /// response-wait timeout (spec.md §4.G). Returns the exit
    /// outcome; the caller (Lifecycle) decides whether to reconnect.
    pub fn run(&mut self, shutdown: &Arc<AtomicBool>) -> std::io::Result<ExitOutcome> {
        loop {
            if shutdown.load(Ordering::SeqCst) {
                self.device_mut().sync().ok();
                return Ok(ExitOutcome::Success);
            }

            let device_fd = self.device().as_fd();
            let input_fd = self.input_pump.read_end.as_fd();
            let mut poll_fds = vec![
                PollFd::new(device_fd, PollFlags::POLLIN),
                PollFd::new(input_fd, PollFlags::POLLIN),
            ];
            let listener_fd = self.socket.as_ref().map(|s| s.listener_fd());
            if let Some(fd) = listener_fd {
                poll_fds.push(PollFd::new(crate::socket::borrow(fd), PollFlags::POLLIN));
            }
            let client_fds: Vec<RawFd> = self
                .socket
                .as_ref()
                .map(|s| s.client_fds())
                .unwrap_or_default();
            for fd in &client_fds {
                poll_fds.push(PollFd::new(crate::socket::borrow(*fd), PollFlags::POLLIN));
            }

            let timeout = if self.opts.response_wait {
                PollTimeout::from(self.opts.response_timeout_ms.min(u16::MAX as u64) as u16)
            } else {
                PollTimeout::NONE
            };

            let n = nix::poll::poll(&mut poll_fds, timeout)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;

            if n == 0 {
                if self.opts.response_wait {
                    crate::diag::error(self.opts.mute, "response-wait timed out");
                    return Ok(ExitOutcome::ResponseTimeout);
                }
                continue;
            }

            // Copy readiness out of `poll_fds` into plain bools before
            // dropping it: each `PollFd` borrows the fd it was built
            // from, so holding onto the vector would keep `self`
            // borrowed immutably for the handlers below, which all
            // need `&mut self`.
            let readable: Vec<bool> = poll_fds
                .iter()
                .map(|pfd| {
                    pfd.revents()
                        .map(|r| r.contains(PollFlags::POLLIN))
                        .unwrap_or(false)
                })
                .collect();
            drop(poll_fds);

            if readable[0] {
                if let Some(outcome) = self.handle_device_readable()? {
                    return Ok(outcome);
                }
            }

            if readable[1] {
                if let Some(outcome) = self.handle_input_readable()? {
                    return Ok(outcome);
                }
            }

            let mut idx = 2;
            if listener_fd.is_some() {
                if readable[idx] {
                    if let Some(s) = self.socket.as_mut() {
                        s.accept_pending();
                    }
                }
                idx += 1;
            }
            for fd in &client_fds {
                if readable[idx] {
                    let byte = self.socket.as_mut().and_then(|s| s.read_byte_from(*fd));
                    if let Some(b) = byte {
                        self.process_local_byte(b)?;
                    }
                }
                idx += 1;
            }

            self.device_mut().sync().map_err(to_io)?;
        }
    }

    fn handle_device_readable(&mut self) -> std::io::Result<Option<ExitOutcome>> {
        let mut buf = [0u8; libc::BUFSIZ as usize];
        let n = match self.device_mut().read(&mut buf) {
            Ok(n) => n,
            Err(e) => {
                crate::diag::warn(self.opts.mute, &format!("device read error: {e}"));
                return Ok(Some(ExitOutcome::Failure));
            }
        };
        self.session.add_rx(n as u64);

        let mut rendered_total = Vec::new();
        for &b in &buf[..n] {
            let rendered = transform::render(b, &self.opts, &mut self.render_state);
            rendered_total.extend_from_slice(&rendered);

            if self.opts.response_wait && (b == b'\r' || b == b'\n') {
                std::io::stdout().write_all(&rendered_total)?;
                std::io::stdout().flush()?;
                if let Some(log) = self.log.as_mut() {
                    let _ = log.write(&rendered_total);
                }
                if let Some(s) = self.socket.as_mut() {
                    s.broadcast(&rendered_total);
                }
                return Ok(Some(ExitOutcome::Success));
            }
        }

        std::io::stdout().write_all(&rendered_total)?;
        std::io::stdout().flush()?;
        if let Some(log) = self.log.as_mut() {
            let _ = log.write(&rendered_total);
        }
        if let Some(s) = self.socket.as_mut() {
            s.broadcast(&rendered_total);
        }
        Ok(None)
    }

    fn handle_input_readable(&mut self) -> std::io::Result<Option<ExitOutcome>> {
        use std::io::Read;
        let mut file = std::fs::File::from(self.input_pump.read_end.try_clone()?);
        let mut buf = [0u8; libc::BUFSIZ as usize];
        let n = file.read(&mut buf)?;

        if n == 0 {
            self.device_mut().sync().map_err(to_io)?;
            return Ok(Some(ExitOutcome::Success));
        }

        for &b in &buf[..n] {
            if let Some(outcome) = self.process_local_byte(b)? {
                return Ok(Some(outcome));
            }
        }
        Ok(None)
    }

    /// Runs one locally-originated byte (from the input pump or a
    /// socket client) through the Command Interpreter and acts on the
    /// resulting `Action`.
    fn process_local_byte(&mut self, byte: u8) -> std::io::Result<Option<ExitOutcome>> {
        let action = self.cmd_state.handle_byte(byte, &self.opts);
        self.dispatch_action(action)
    }

    fn dispatch_action(&mut self, action: Action) -> std::io::Result<Option<ExitOutcome>> {
        match action {
            Action::None => {}
            Action::Forward(bytes) => self.forward_bytes(&bytes)?,
            Action::TransmitLine(mut line) => {
                self.echo(&line)?;
                self.write_device(&mut line)?;
                self.device_mut().sync().map_err(to_io)?;
            }
            Action::LineEditBackspace => {
                self.echo(b"\x08 \x08")?;
            }
            Action::HexInvalid => {
                self.echo(b"\x07")?;
            }
            Action::HexDigitEcho(digit) => {
                self.echo(&[digit])?;
            }
            Action::HexByteComplete { digit, byte } => {
                self.echo(&[digit])?;
                self.echo(b"\x08 \x08\x08 \x08")?;
                self.forward_bytes(&[byte])?;
            }
            Action::Help => self.print_help(),
            Action::SendBreak => {
                self.device_mut().send_break().map_err(to_io)?;
            }
            Action::PrintConfig => self.print_config(),
            Action::ToggleLocalEcho => self.opts.toggle_local_echo(),
            Action::ToggleLogFile => self.toggle_log_file(),
            Action::FlushIo => {
                self.device_mut().flush_both().map_err(to_io)?;
            }
            Action::ToggleHexOutput => self.opts.toggle_hex_output(),
            Action::CycleInputMode => self.opts.cycle_input_mode(),
            Action::CycleOutputMode => self.opts.cycle_output_mode(),
            Action::ClearScreen => {
                std::io::stdout().write_all(b"\x1bc")?;
                std::io::stdout().flush()?;
            }
            Action::PrintLineStates => self.print_line_states(),
            Action::ToggleMsb2Lsb => self.opts.toggle_msb2lsb(),
            Action::Quit => return Ok(Some(ExitOutcome::Success)),
            Action::RunScript => self.run_script_action(),
            Action::PrintStats => self.print_stats(),
            Action::CycleTimestamp => self.opts.cycle_timestamp_mode(),
            Action::ToggleOltu => self.opts.toggle_oltu(),
            Action::PrintVersion => {
                println!("tio {}", env!("CARGO_PKG_VERSION"));
            }
            Action::PrintEasterEgg => {
                println!("{}", easter_egg());
            }
            Action::LineToggle(mask) => {
                let fd = self.device().as_fd();
                line::toggle(fd, mask).map_err(to_io)?;
            }
            Action::LinePulse(mask) => {
                let ms = self.opts.line_pulse_duration_ms[mask as usize];
                let fd = self.device().as_fd();
                line::pulse(fd, mask, ms).map_err(to_io)?;
            }
            Action::StartXmodem(protocol) => self.start_transfer(protocol)?,
            Action::StartYmodem => self.start_ymodem()?,
            Action::PromptYmodemFilename => {
                println!("Filename: ");
            }
        }
        Ok(None)
    }

    fn forward_bytes(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        let mut out = Vec::with_capacity(bytes.len());
        let mut echo_extra = 0usize;
        for &b in bytes {
            let (action, echo_override) = transform::forward(b, &self.opts);
            match action {
                transform::ForwardAction::Write(mut data) => out.append(&mut data),
                transform::ForwardAction::Break => {
                    self.device_mut().send_break().map_err(to_io)?;
                }
            }
            if echo_override == transform::EchoOverride::TwiceCrLf {
                echo_extra += 1;
            }
        }
        if self.opts.local_echo || echo_extra > 0 {
            self.echo(&out)?;
            if echo_extra > 0 {
                self.echo(&out)?;
            }
        }
        self.write_device(&mut out)?;
        Ok(())
    }

    fn write_device(&mut self, data: &mut [u8]) -> std::io::Result<()> {
        transform::apply_oltu(data, &self.opts);
        if self.opts.output_delay_ms > 0 {
            self.device_mut()
                .write_delayed(data, self.opts.output_delay_ms, self.opts.output_line_delay_ms)
                .map_err(to_io)?;
            self.session.add_tx(data.len() as u64);
            Ok(())
        } else {
            self.device_mut().write_bytes(data).map_err(to_io)?;
            self.session.add_tx(data.len() as u64);
            Ok(())
        }
    }

    fn echo(&self, bytes: &[u8]) -> std::io::Result<()> {
        std::io::stdout().write_all(bytes)?;
        std::io::stdout().flush()
    }

    fn print_help(&self) {
        println!("{}", "tio key commands:".bold());
        println!("  ?  help        b  break        c  show config   e  toggle local echo");
        println!("  f  toggle log  F  flush io      g  line toggle    h  toggle hex out");
        println!("  i  input mode  o  output mode   l  clear screen   L  line states");
        println!("  m  toggle msb2lsb  p  line pulse  q  quit         r  run script");
        println!("  s  statistics  t  timestamp mode U  toggle oltu   v  version");
        println!("  x  xmodem send y  ymodem send    z  easter egg");
    }

    fn print_config(&self) {
        println!(
            "device: {} baud: {} databits: {} parity: {:?} stopbits: {}",
            self.opts.device, self.opts.baudrate, self.opts.databits, self.opts.parity, self.opts.stopbits
        );
    }

    fn print_stats(&self) {
        let (rx, tx) = self.session.totals();
        println!("rx: {rx} tx: {tx}");
    }

    fn print_line_states(&self) {
        let fd = self.device().as_fd();
        for mask in crate::config::LineMask::ALL {
            match line::is_high(fd, mask) {
                Ok(high) => println!("{}: {}", mask.name(), if high { "HIGH" } else { "LOW" }),
                Err(e) => crate::diag::warn(self.opts.mute, &format!("{}: {e}", mask.name())),
            }
        }
    }

    fn toggle_log_file(&mut self) {
        self.opts.toggle_log();
        if self.opts.log {
            if let Some(path) = self.opts.log_filename.clone() {
                match LogWriter::open(&path, self.opts.log_strip) {
                    Ok(w) => self.log = Some(w),
                    Err(e) => crate::diag::warn(self.opts.mute, &format!("could not open log file: {e}")),
                }
            }
        } else {
            self.log = None;
        }
    }

    fn run_script_action(&mut self) {
        let source = match (&self.opts.script_inline, &self.opts.script_file) {
            (Some(s), _) => s.clone(),
            (None, Some(path)) => match std::fs::read_to_string(path) {
                Ok(s) => s,
                Err(e) => {
                    let err = crate::error::ScriptError::Load(path.clone(), e);
                    crate::diag::warn(self.opts.mute, &err.to_string());
                    return;
                }
            },
            (None, None) => return,
        };

        // Scripts need an owned, `'static` `Device` (rhai's registered
        // closures can't borrow), so we lend it out of the slot for
        // the duration of the run and always put it back.
        let device = self.device_slot.take().expect("device present outside script bridge");
        match crate::script::run(&source, device, self.opts.clone(), self.session.hot_key.clone()) {
            Ok(device) => self.device_slot = Some(device),
            Err((device, e)) => {
                self.device_slot = Some(device);
                crate::diag::warn(self.opts.mute, &format!("script error: {e}"));
            }
        }
    }

    fn start_transfer(&mut self, protocol: crate::config::Protocol) -> std::io::Result<()> {
        let path = String::from_utf8_lossy(self.cmd_state.line_buffer()).into_owned();
        self.cmd_state.reset_sub();
        crate::transfer::send_file(self.device_mut(), protocol, &path, &self.session.hot_key, self.opts.mute)
            .map(|_| ())
    }

    fn start_ymodem(&mut self) -> std::io::Result<()> {
        let path = String::from_utf8_lossy(self.cmd_state.line_buffer()).into_owned();
        self.cmd_state.reset_sub();
        crate::transfer::send_file(
            self.device_mut(),
            crate::config::Protocol::Ymodem,
            &path,
            &self.session.hot_key,
            self.opts.mute,
        )
        .map(|_| ())
    }
}

fn to_io(e: crate::error::DeviceError) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
}

fn easter_egg() -> &'static str {
    r"
      _non serviam, I render in hex when I must._
         (tio)
"
}

