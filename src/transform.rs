//! Transform Pipeline (component D, spec.md §4.D): the bidirectional,
//! order-sensitive byte mapping applied between the device and the
//! local terminal. Two free functions, `render()` (device→local) and
//! `forward()` (local→device), replace the teacher's OSC-8-hyperlink
//! `transform()` at this same position in the pipeline.

use crate::config::{MapFlags, Options, OutputMode, TimestampMode};

/// Tracks the one piece of cross-call state `render()` needs: whether
/// the last rendered byte ended a line, so a timestamp prefix can be
/// injected on the following non-newline byte (spec.md §4.D).
#[derive(Debug, Default)]
pub struct RenderState {
    after_newline: bool,
    session_start: Option<std::time::Instant>,
    last_byte: Option<std::time::Instant>,
}

impl RenderState {
    pub fn new() -> Self {
        RenderState {
            after_newline: true,
            session_start: None,
            last_byte: None,
        }
    }

    fn timestamp_prefix(&mut self, mode: TimestampMode) -> Option<String> {
        let now = std::time::Instant::now();
        let wall = chrono::Local::now();
        let text = match mode {
            TimestampMode::None => return None,
            TimestampMode::Hour24 => wall.format("%H:%M:%S.%3f ").to_string(),
            TimestampMode::Hour24Start => {
                let start = *self.session_start.get_or_insert(now);
                let elapsed = now.duration_since(start);
                format!(
                    "{:02}:{:02}:{:02}.{:03} ",
                    elapsed.as_secs() / 3600,
                    (elapsed.as_secs() / 60) % 60,
                    elapsed.as_secs() % 60,
                    elapsed.subsec_millis()
                )
            }
            TimestampMode::Hour24Delta => {
                let last = self.last_byte.unwrap_or(now);
                let elapsed = now.duration_since(last);
                format!(
                    "+{:02}:{:02}:{:02}.{:03} ",
                    elapsed.as_secs() / 3600,
                    (elapsed.as_secs() / 60) % 60,
                    elapsed.as_secs() % 60,
                    elapsed.subsec_millis()
                )
            }
            TimestampMode::Iso8601 => wall.to_rfc3339(),
        };
        self.last_byte = Some(now);
        self.session_start.get_or_insert(now);
        Some(text)
    }
}

/// One byte received from the device, transformed into the bytes that
/// should reach the local terminal/log/socket (spec.md §4.D
/// "Device→local (render)").
pub fn render(byte: u8, opts: &Options, state: &mut RenderState) -> Vec<u8> {
    let map = opts.map;
    let effective = if map.contains(MapFlags::MSB2LSB) {
        byte.reverse_bits()
    } else {
        byte
    };

    let mut out = Vec::new();

    let is_newline = effective == b'\n';
    if map.contains(MapFlags::INLCRNL) && is_newline && !map.contains(MapFlags::MSB2LSB) {
        out.push(b'\r');
        out.push(b'\n');
    } else if map.contains(MapFlags::IFFESCC) && effective == 0x0C && !map.contains(MapFlags::MSB2LSB)
    {
        out.push(0x1B);
        out.push(b'c');
    } else {
        match opts.output_mode {
            OutputMode::Normal => out.push(effective),
            OutputMode::Hex => out.extend_from_slice(format!("{effective:02x} ").as_bytes()),
        }
    }

    if opts.output_mode == OutputMode::Normal
        && opts.timestamp != TimestampMode::None
        && state.after_newline
        && !is_newline
    {
        if let Some(ts) = state.timestamp_prefix(opts.timestamp) {
            let mut prefixed = ts.into_bytes();
            prefixed.extend_from_slice(&out);
            out = prefixed;
        }
    }

    state.after_newline = is_newline;
    out
}

/// What the caller should do with one locally-originated byte after
/// `forward()` has mapped it (spec.md §4.D "Local→device (forward)").
#[derive(Debug, PartialEq, Eq)]
pub enum ForwardAction {
    /// Write these bytes to the device via the Device Port.
    Write(Vec<u8>),
    /// Send a break instead of writing (ONULBRK on a NUL byte).
    Break,
}

/// How many times (and what) the caller should locally echo, on top
/// of whatever `opts.local_echo` already calls for.
#[derive(Debug, PartialEq, Eq)]
pub enum EchoOverride {
    None,
    /// ONLCRNL expands one byte into a CRLF pair and echoes it twice.
    TwiceCrLf,
}

pub fn forward(byte: u8, opts: &Options) -> (ForwardAction, EchoOverride) {
    let map = opts.map;

    if byte == 0 && map.contains(MapFlags::ONULBRK) {
        return (ForwardAction::Break, EchoOverride::None);
    }

    if (byte == b'\n' || byte == b'\r') && map.contains(MapFlags::ONLCRNL) {
        return (
            ForwardAction::Write(vec![b'\r', b'\n']),
            EchoOverride::TwiceCrLf,
        );
    }

    if byte == 127 && map.contains(MapFlags::ODELBS) {
        return (ForwardAction::Write(vec![0x08]), EchoOverride::None);
    }

    if byte == b'\r' && map.contains(MapFlags::OCRNL) {
        return (ForwardAction::Write(vec![b'\n']), EchoOverride::None);
    }

    (ForwardAction::Write(vec![byte]), EchoOverride::None)
}

/// Upper-cases a whole outgoing buffer when OLTU is set. Applied
/// inside the Device Port's write path across the whole staged buffer
/// (spec.md §4.D), not per-byte in `forward()`.
pub fn apply_oltu(buf: &mut [u8], opts: &Options) {
    if opts.map.contains(MapFlags::OLTU) {
        for b in buf.iter_mut() {
            b.make_ascii_uppercase();
        }
    }
}

/// Accumulates hex digits typed in hex input mode: two consecutive
/// digits combine MSB-nibble, LSB-nibble into one output byte
/// (spec.md §4.D).
#[derive(Debug, Default)]
pub struct HexInputAccumulator {
    high_nibble: Option<u8>,
}

impl HexInputAccumulator {
    pub fn new() -> Self {
        HexInputAccumulator { high_nibble: None }
    }

    /// Returns `Some(byte)` once two valid hex digits have been
    /// accumulated, `None` while waiting for the second digit, or an
    /// error for a non-hex-digit byte (spec.md §4.D: "bell if invalid").
    pub fn push(&mut self, byte: u8) -> Result<Option<u8>, ()> {
        let Some(nibble) = (byte as char).to_digit(16) else {
            return Err(());
        };
        let nibble = nibble as u8;
        match self.high_nibble.take() {
            None => {
                self.high_nibble = Some(nibble);
                Ok(None)
            }
            Some(high) => Ok(Some((high << 4) | nibble)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;

    fn opts_with_map(map: MapFlags) -> Options {
        let mut o = Options::default();
        o.map = map;
        o
    }

    #[test]
    fn msb2lsb_applied_twice_is_identity() {
        for b in 0u8..=255 {
            assert_eq!(b.reverse_bits().reverse_bits(), b);
        }
    }

    #[test]
    fn render_inlcrnl_expands_newline() {
        let opts = opts_with_map(MapFlags::INLCRNL);
        let mut st = RenderState::new();
        assert_eq!(render(b'\n', &opts, &mut st), vec![b'\r', b'\n']);
    }

    #[test]
    fn render_iffescc_clears_screen_on_ff() {
        let opts = opts_with_map(MapFlags::IFFESCC);
        let mut st = RenderState::new();
        assert_eq!(render(0x0C, &opts, &mut st), vec![0x1B, b'c']);
    }

    #[test]
    fn render_plain_byte_passthrough() {
        let opts = Options::default();
        let mut st = RenderState::new();
        assert_eq!(render(b'A', &opts, &mut st), vec![b'A']);
    }

    #[test]
    fn render_hex_output_mode() {
        let mut opts = Options::default();
        opts.output_mode = OutputMode::Hex;
        let mut st = RenderState::new();
        assert_eq!(render(0x41, &opts, &mut st), b"41 ".to_vec());
    }

    #[test]
    fn forward_odelbs_maps_del_to_bs() {
        let opts = opts_with_map(MapFlags::ODELBS);
        let (action, echo) = forward(127, &opts);
        assert_eq!(action, ForwardAction::Write(vec![0x08]));
        assert_eq!(echo, EchoOverride::None);
    }

    #[test]
    fn forward_ocrnl_maps_cr_to_lf() {
        let opts = opts_with_map(MapFlags::OCRNL);
        let (action, _) = forward(b'\r', &opts);
        assert_eq!(action, ForwardAction::Write(vec![b'\n']));
    }

    #[test]
    fn forward_onlcrnl_expands_and_echoes_twice() {
        let opts = opts_with_map(MapFlags::ONLCRNL);
        let (action, echo) = forward(b'\n', &opts);
        assert_eq!(action, ForwardAction::Write(vec![b'\r', b'\n']));
        assert_eq!(echo, EchoOverride::TwiceCrLf);
    }

    #[test]
    fn forward_onulbrk_sends_break_for_nul() {
        let opts = opts_with_map(MapFlags::ONULBRK);
        let (action, _) = forward(0, &opts);
        assert_eq!(action, ForwardAction::Break);
    }

    #[test]
    fn forward_plain_byte_passthrough() {
        let opts = Options::default();
        let (action, _) = forward(b'x', &opts);
        assert_eq!(action, ForwardAction::Write(vec![b'x']));
    }

    #[test]
    fn oltu_uppercases_whole_buffer() {
        let opts = opts_with_map(MapFlags::OLTU);
        let mut buf = b"hello world".to_vec();
        apply_oltu(&mut buf, &opts);
        assert_eq!(buf, b"HELLO WORLD".to_vec());
    }

    #[test]
    fn hex_input_combines_two_nibbles() {
        let mut acc = HexInputAccumulator::new();
        assert_eq!(acc.push(b'4'), Ok(None));
        assert_eq!(acc.push(b'1'), Ok(Some(0x41)));
    }

    #[test]
    fn hex_input_rejects_non_hex_digit() {
        let mut acc = HexInputAccumulator::new();
        assert_eq!(acc.push(b'g'), Err(()));
    }
}
