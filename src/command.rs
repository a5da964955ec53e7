//! Command Interpreter (component F, spec.md §4.F): the prefix-keyed
//! in-band state machine for interactive commands. A flat `match` on a
//! tagged `Sub` enum, never virtual dispatch (spec.md §9).

use crate::config::{LineMask, Options, Protocol};
use crate::transform::HexInputAccumulator;

/// What the caller (the event loop) should do in response to one
/// locally-originated byte. Keeping this a plain data enum is what
/// lets `handle_byte` stay pure and unit-testable: it never touches
/// the device, a file, or a transfer directly.
#[derive(Debug, PartialEq, Eq)]
pub enum Action {
    /// No externally visible effect (byte consumed into interpreter
    /// state: a sub-command digit, an accumulating hex nibble, a
    /// swallowed arrow-key escape sequence).
    None,
    /// Bytes ready to be mapped by `transform::forward` and written to
    /// the device.
    Forward(Vec<u8>),
    /// A complete line-input buffer, terminated by CR, ready to be
    /// transmitted verbatim (already includes the trailing `\r`).
    TransmitLine(Vec<u8>),
    /// The destructive-backspace echo for line-input mode.
    LineEditBackspace,
    /// Invalid hex digit in hex-input mode: bell, discard.
    HexInvalid,
    /// First digit of a hex-input pair: echo it verbatim (spec.md §4.D).
    HexDigitEcho(u8),
    /// Second digit completed a byte: echo the digit, erase the
    /// two-character prompt pair, then forward the combined byte
    /// (spec.md §4.D, §8 scenario 2).
    HexByteComplete { digit: u8, byte: u8 },
    Help,
    SendBreak,
    PrintConfig,
    ToggleLocalEcho,
    ToggleLogFile,
    FlushIo,
    ToggleHexOutput,
    CycleInputMode,
    CycleOutputMode,
    ClearScreen,
    PrintLineStates,
    ToggleMsb2Lsb,
    Quit,
    RunScript,
    PrintStats,
    CycleTimestamp,
    ToggleOltu,
    PrintVersion,
    PrintEasterEgg,
    LineToggle(LineMask),
    LinePulse(LineMask),
    StartXmodem(Protocol),
    PromptYmodemFilename,
    StartYmodem,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Sub {
    None,
    LineToggle,
    LinePulse,
    XmodemChoose,
    /// Collecting a filename with a minimal line editor for `y` or
    /// (after protocol selection) `x` (spec.md §4.F).
    Filename { protocol: Option<Protocol>, buf: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EscState {
    Idle,
    SawEsc,
    SawBracket,
}

pub struct CommandState {
    prev_byte: Option<u8>,
    sub: Sub,
    line_buf: Vec<u8>,
    hex_acc: HexInputAccumulator,
    esc: EscState,
}

impl CommandState {
    pub fn new() -> Self {
        CommandState {
            prev_byte: None,
            sub: Sub::None,
            line_buf: Vec::new(),
            hex_acc: HexInputAccumulator::new(),
            esc: EscState::Idle,
        }
    }

    /// Drains the completed filename, if any (used by the caller after
    /// receiving `PromptYmodemFilename`'s eventual `TransmitLine`-style
    /// completion via `take_filename_result`).
    pub fn reset_sub(&mut self) {
        self.sub = Sub::None;
    }

    pub fn line_buffer(&self) -> &[u8] {
        &self.line_buf
    }

    /// Processes one locally-originated byte (spec.md §4.F). `opts`
    /// supplies the prefix code/enabled flag, input mode, and line
    /// sub-command digit table.
    pub fn handle_byte(&mut self, byte: u8, opts: &Options) -> Action {
        // Sub-command consumption takes priority over everything else:
        // each sub-command consumes exactly one follow-up byte.
        match std::mem::replace(&mut self.sub, Sub::None) {
            Sub::None => {}
            Sub::LineToggle => return self.dispatch_line_digit(byte, false),
            Sub::LinePulse => return self.dispatch_line_digit(byte, true),
            Sub::XmodemChoose => {
                let protocol = match byte {
                    b'0' => Protocol::Xmodem1K,
                    b'1' => Protocol::XmodemCrc,
                    _ => return Action::None,
                };
                self.sub = Sub::Filename {
                    protocol: Some(protocol),
                    buf: String::new(),
                };
                return Action::None;
            }
            Sub::Filename { protocol, mut buf } => {
                return self.edit_filename(protocol, &mut buf, byte);
            }
        }

        if opts.prefix_enabled {
            if let Some(prev) = self.prev_byte {
                if prev == opts.prefix_code {
                    self.prev_byte = None;
                    return self.dispatch_command(byte, opts);
                }
            }
            if byte == opts.prefix_code {
                self.prev_byte = Some(byte);
                return Action::None;
            }
        }
        self.prev_byte = Some(byte);

        match opts.input_mode {
            crate::config::InputMode::Normal => Action::Forward(vec![byte]),
            crate::config::InputMode::Hex => match self.hex_acc.push(byte) {
                Ok(Some(b)) => Action::HexByteComplete { digit: byte, byte: b },
                Ok(None) => Action::HexDigitEcho(byte),
                Err(()) => Action::HexInvalid,
            },
            crate::config::InputMode::Line => self.line_input(byte),
        }
    }

    fn dispatch_command(&mut self, byte: u8, opts: &Options) -> Action {
        match byte {
            opts_prefix if opts.prefix_enabled && opts_prefix == opts.prefix_code => {
                Action::Forward(vec![opts.prefix_code])
            }
            b'?' => Action::Help,
            b'b' => Action::SendBreak,
            b'c' => Action::PrintConfig,
            b'e' => Action::ToggleLocalEcho,
            b'f' => Action::ToggleLogFile,
            b'F' => Action::FlushIo,
            b'g' => {
                self.sub = Sub::LineToggle;
                Action::None
            }
            b'h' => Action::ToggleHexOutput,
            b'i' => Action::CycleInputMode,
            b'o' => Action::CycleOutputMode,
            b'l' => Action::ClearScreen,
            b'L' => Action::PrintLineStates,
            b'm' => Action::ToggleMsb2Lsb,
            b'p' => {
                self.sub = Sub::LinePulse;
                Action::None
            }
            b'q' => Action::Quit,
            b'r' => Action::RunScript,
            b's' => Action::PrintStats,
            b't' => Action::CycleTimestamp,
            b'U' => Action::ToggleOltu,
            b'v' => Action::PrintVersion,
            b'x' => {
                self.sub = Sub::XmodemChoose;
                Action::None
            }
            b'y' => {
                self.sub = Sub::Filename {
                    protocol: None,
                    buf: String::new(),
                };
                Action::PromptYmodemFilename
            }
            b'z' => Action::PrintEasterEgg,
            _ => Action::None,
        }
    }

    fn dispatch_line_digit(&mut self, byte: u8, pulse: bool) -> Action {
        match LineMask::from_digit(byte) {
            Some(mask) => {
                if pulse {
                    Action::LinePulse(mask)
                } else {
                    Action::LineToggle(mask)
                }
            }
            None => Action::None,
        }
    }

    fn edit_filename(&mut self, protocol: Option<Protocol>, buf: &mut String, byte: u8) -> Action {
        match byte {
            b'\r' | b'\n' => {
                let filename = std::mem::take(buf);
                match protocol {
                    Some(p) => {
                        // The caller is responsible for opening
                        // `filename` and starting the transfer; we
                        // hand back the protocol via StartXmodem and
                        // stash the filename in `line_buf` for pickup.
                        self.line_buf = filename.into_bytes();
                        Action::StartXmodem(p)
                    }
                    None => {
                        self.line_buf = filename.into_bytes();
                        Action::StartYmodem
                    }
                }
            }
            0x08 | 127 => {
                buf.pop();
                self.sub = Sub::Filename {
                    protocol,
                    buf: buf.clone(),
                };
                Action::LineEditBackspace
            }
            b if (b' '..=b'~').contains(&b) => {
                buf.push(b as char);
                self.sub = Sub::Filename {
                    protocol,
                    buf: buf.clone(),
                };
                Action::Forward(vec![b])
            }
            _ => {
                self.sub = Sub::Filename {
                    protocol,
                    buf: buf.clone(),
                };
                Action::None
            }
        }
    }

    /// Accumulates bytes in line-input mode; arrow keys (`ESC [ A/B/C/D`)
    /// are recognized and swallowed (spec.md §4.F).
    fn line_input(&mut self, byte: u8) -> Action {
        match self.esc {
            EscState::Idle if byte == 0x1B => {
                self.esc = EscState::SawEsc;
                return Action::None;
            }
            EscState::SawEsc if byte == b'[' => {
                self.esc = EscState::SawBracket;
                return Action::None;
            }
            EscState::SawBracket => {
                self.esc = EscState::Idle;
                if matches!(byte, b'A' | b'B' | b'C' | b'D') {
                    return Action::None;
                }
                // Fall through: not a recognized arrow key, treat the
                // triggering bytes as ordinary input (lost, matching
                // the "swallowed" contract for the common case only).
                return Action::None;
            }
            _ => {
                self.esc = EscState::Idle;
            }
        }

        match byte {
            b'\r' | b'\n' => {
                let mut line = std::mem::take(&mut self.line_buf);
                line.push(b'\r');
                Action::TransmitLine(line)
            }
            0x08 | 127 => {
                if self.line_buf.pop().is_some() {
                    Action::LineEditBackspace
                } else {
                    Action::None
                }
            }
            _ => {
                const MAX_LINE: usize = 4096;
                if self.line_buf.len() >= MAX_LINE {
                    tracing::warn!("line-input buffer full, discarding byte");
                    Action::None
                } else {
                    self.line_buf.push(byte);
                    Action::Forward(vec![byte])
                }
            }
        }
    }
}

impl Default for CommandState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> Options {
        Options::default()
    }

    #[test]
    fn prefix_literal_forwards_single_byte() {
        let mut cs = CommandState::new();
        let o = opts();
        assert_eq!(cs.handle_byte(o.prefix_code, &o), Action::None);
        assert_eq!(
            cs.handle_byte(o.prefix_code, &o),
            Action::Forward(vec![o.prefix_code])
        );
        // Following byte is an ordinary byte, not consumed as a command.
        assert_eq!(cs.handle_byte(b'X', &o), Action::Forward(vec![b'X']));
    }

    #[test]
    fn prefix_then_q_quits() {
        let mut cs = CommandState::new();
        let o = opts();
        assert_eq!(cs.handle_byte(o.prefix_code, &o), Action::None);
        assert_eq!(cs.handle_byte(b'q', &o), Action::Quit);
    }

    #[test]
    fn line_toggle_subcommand_picks_mask() {
        let mut cs = CommandState::new();
        let o = opts();
        cs.handle_byte(o.prefix_code, &o);
        assert_eq!(cs.handle_byte(b'g', &o), Action::None);
        assert_eq!(cs.handle_byte(b'0', &o), Action::LineToggle(LineMask::Dtr));
    }

    #[test]
    fn line_pulse_subcommand_picks_mask() {
        let mut cs = CommandState::new();
        let o = opts();
        cs.handle_byte(o.prefix_code, &o);
        assert_eq!(cs.handle_byte(b'p', &o), Action::None);
        assert_eq!(cs.handle_byte(b'1', &o), Action::LinePulse(LineMask::Rts));
    }

    #[test]
    fn non_command_bytes_forward_in_normal_mode() {
        let mut cs = CommandState::new();
        let o = opts();
        assert_eq!(cs.handle_byte(b'h', &o), Action::Forward(vec![b'h']));
        assert_eq!(cs.handle_byte(b'i', &o), Action::Forward(vec![b'i']));
    }

    #[test]
    fn line_input_mode_accumulates_and_transmits_on_cr() {
        let mut cs = CommandState::new();
        let mut o = opts();
        o.input_mode = crate::config::InputMode::Line;
        cs.handle_byte(b'h', &o);
        cs.handle_byte(b'i', &o);
        assert_eq!(cs.handle_byte(b'\r', &o), Action::TransmitLine(b"hi\r".to_vec()));
    }

    #[test]
    fn line_input_mode_backspace_removes_last_byte() {
        let mut cs = CommandState::new();
        let mut o = opts();
        o.input_mode = crate::config::InputMode::Line;
        cs.handle_byte(b'h', &o);
        cs.handle_byte(b'i', &o);
        assert_eq!(cs.handle_byte(127, &o), Action::LineEditBackspace);
        assert_eq!(cs.handle_byte(b'\r', &o), Action::TransmitLine(b"h\r".to_vec()));
    }

    #[test]
    fn hex_input_mode_combines_nibbles() {
        let mut cs = CommandState::new();
        let mut o = opts();
        o.input_mode = crate::config::InputMode::Hex;
        assert_eq!(cs.handle_byte(b'4', &o), Action::HexDigitEcho(b'4'));
        assert_eq!(
            cs.handle_byte(b'1', &o),
            Action::HexByteComplete { digit: b'1', byte: 0x41 }
        );
    }

    #[test]
    fn hex_input_mode_rejects_invalid_digit() {
        let mut cs = CommandState::new();
        let mut o = opts();
        o.input_mode = crate::config::InputMode::Hex;
        assert_eq!(cs.handle_byte(b'z', &o), Action::HexInvalid);
    }

    #[test]
    fn xmodem_choose_then_filename_starts_transfer() {
        let mut cs = CommandState::new();
        let o = opts();
        cs.handle_byte(o.prefix_code, &o);
        assert_eq!(cs.handle_byte(b'x', &o), Action::None);
        assert_eq!(cs.handle_byte(b'0', &o), Action::None);
        cs.handle_byte(b'a', &o);
        assert_eq!(
            cs.handle_byte(b'\r', &o),
            Action::StartXmodem(Protocol::Xmodem1K)
        );
        assert_eq!(cs.line_buffer(), b"a");
    }
}
