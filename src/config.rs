//! The Options record (spec.md §3) and the INI config-file / CLI merge
//! that builds it (component N).

use std::collections::HashSet;
use std::path::PathBuf;

use ini::Ini;
use regex::Regex;

use crate::cli::Args;
use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    Odd,
    Even,
    None,
    Mark,
    Space,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Hard,
    Soft,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    Normal,
    Hex,
    Line,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Normal,
    Hex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampMode {
    None,
    Hour24,
    Hour24Start,
    Hour24Delta,
    Iso8601,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertMode {
    None,
    Bell,
    Blink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptPolicy {
    Never,
    Once,
    Always,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        const INLCR     = 1 << 0;
        const IGNCR     = 1 << 1;
        const ICRNL     = 1 << 2;
        const OCRNL     = 1 << 3;
        const ODELBS    = 1 << 4;
        const IFFESCC   = 1 << 5;
        const INLCRNL   = 1 << 6;
        const ONLCRNL   = 1 << 7;
        const OLTU      = 1 << 8;
        const ONULBRK   = 1 << 9;
        const MSB2LSB   = 1 << 10;
    }
}

impl MapFlags {
    pub fn parse_one(name: &str) -> Result<MapFlags, ConfigError> {
        Ok(match name {
            "INLCR" => MapFlags::INLCR,
            "IGNCR" => MapFlags::IGNCR,
            "ICRNL" => MapFlags::ICRNL,
            "OCRNL" => MapFlags::OCRNL,
            "ODELBS" => MapFlags::ODELBS,
            "IFFESCC" => MapFlags::IFFESCC,
            "INLCRNL" => MapFlags::INLCRNL,
            "ONLCRNL" => MapFlags::ONLCRNL,
            "OLTU" => MapFlags::OLTU,
            "ONULBRK" => MapFlags::ONULBRK,
            "MSB2LSB" => MapFlags::MSB2LSB,
            other => return Err(ConfigError::UnknownMapFlag(other.to_string())),
        })
    }

    pub fn parse_csv(csv: &str) -> Result<MapFlags, ConfigError> {
        let mut flags = MapFlags::empty();
        for part in csv.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            flags |= MapFlags::parse_one(part)?;
        }
        Ok(flags)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LineMask {
    Dtr,
    Rts,
    Cts,
    Dsr,
    Dcd,
    Ri,
}

impl LineMask {
    pub const ALL: [LineMask; 6] = [
        LineMask::Dtr,
        LineMask::Rts,
        LineMask::Cts,
        LineMask::Dsr,
        LineMask::Dcd,
        LineMask::Ri,
    ];

    pub fn from_digit(d: u8) -> Option<LineMask> {
        Some(match d {
            b'0' => LineMask::Dtr,
            b'1' => LineMask::Rts,
            b'2' => LineMask::Cts,
            b'3' => LineMask::Dsr,
            b'4' => LineMask::Dcd,
            b'5' => LineMask::Ri,
            _ => return None,
        })
    }

    pub fn from_name(s: &str) -> Option<LineMask> {
        Some(match s.to_ascii_uppercase().as_str() {
            "DTR" => LineMask::Dtr,
            "RTS" => LineMask::Rts,
            "CTS" => LineMask::Cts,
            "DSR" => LineMask::Dsr,
            "DCD" => LineMask::Dcd,
            "RI" => LineMask::Ri,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            LineMask::Dtr => "DTR",
            LineMask::Rts => "RTS",
            LineMask::Cts => "CTS",
            LineMask::Dsr => "DSR",
            LineMask::Dcd => "DCD",
            LineMask::Ri => "RI",
        }
    }

    /// The TIOCM_* bit this line corresponds to.
    pub fn tiocm_bit(self) -> libc::c_int {
        match self {
            LineMask::Dtr => libc::TIOCM_DTR,
            LineMask::Rts => libc::TIOCM_RTS,
            LineMask::Cts => libc::TIOCM_CTS,
            LineMask::Dsr => libc::TIOCM_DSR,
            LineMask::Dcd => libc::TIOCM_CD,
            LineMask::Ri => libc::TIOCM_RI,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Xmodem1K,
    XmodemCrc,
    Ymodem,
}

#[derive(Debug, Clone)]
pub struct Options {
    pub device: String,
    pub baudrate: u32,
    pub databits: u8,
    pub parity: Parity,
    pub stopbits: u8,
    pub flow: Flow,

    pub output_delay_ms: u32,
    pub output_line_delay_ms: u32,
    pub line_pulse_duration_ms: [u32; 6],

    pub map: MapFlags,

    pub prefix_code: u8,
    pub prefix_name: String,
    pub prefix_enabled: bool,

    pub input_mode: InputMode,
    pub output_mode: OutputMode,
    pub timestamp: TimestampMode,
    pub local_echo: bool,
    pub log: bool,
    pub log_filename: Option<String>,
    pub log_strip: bool,
    pub color: Option<String>,
    pub alert: AlertMode,
    pub response_wait: bool,
    pub response_timeout_ms: u64,
    pub rs485: bool,
    pub rs485_config: Option<String>,
    pub auto_connect: bool,
    pub mute: bool,

    pub socket: Option<String>,

    pub script_policy: ScriptPolicy,
    pub script_file: Option<String>,
    pub script_inline: Option<String>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            device: String::new(),
            baudrate: 115200,
            databits: 8,
            parity: Parity::None,
            stopbits: 1,
            flow: Flow::None,
            output_delay_ms: 0,
            output_line_delay_ms: 0,
            line_pulse_duration_ms: [100; 6],
            map: MapFlags::empty(),
            prefix_code: 0x14, // ctrl-t
            prefix_name: "ctrl-t".to_string(),
            prefix_enabled: true,
            input_mode: InputMode::Normal,
            output_mode: OutputMode::Normal,
            timestamp: TimestampMode::None,
            local_echo: false,
            log: false,
            log_filename: None,
            log_strip: false,
            color: None,
            alert: AlertMode::None,
            response_wait: false,
            response_timeout_ms: 0,
            rs485: false,
            rs485_config: None,
            auto_connect: true,
            mute: false,
            socket: None,
            script_policy: ScriptPolicy::Never,
            script_file: None,
            script_inline: None,
        }
    }
}

impl Options {
    /// Toggle local echo (command `e`). Publishes the whole field atomically.
    pub fn toggle_local_echo(&mut self) {
        self.local_echo = !self.local_echo;
    }

    pub fn toggle_hex_output(&mut self) {
        self.output_mode = match self.output_mode {
            OutputMode::Normal => OutputMode::Hex,
            OutputMode::Hex => OutputMode::Normal,
        };
    }

    pub fn cycle_input_mode(&mut self) {
        self.input_mode = match self.input_mode {
            InputMode::Normal => InputMode::Hex,
            InputMode::Hex => InputMode::Line,
            InputMode::Line => InputMode::Normal,
        };
    }

    pub fn cycle_output_mode(&mut self) {
        self.toggle_hex_output();
    }

    pub fn cycle_timestamp_mode(&mut self) {
        self.timestamp = match self.timestamp {
            TimestampMode::None => TimestampMode::Hour24,
            TimestampMode::Hour24 => TimestampMode::Hour24Start,
            TimestampMode::Hour24Start => TimestampMode::Hour24Delta,
            TimestampMode::Hour24Delta => TimestampMode::Iso8601,
            TimestampMode::Iso8601 => TimestampMode::None,
        };
    }

    pub fn toggle_msb2lsb(&mut self) {
        self.map.toggle(MapFlags::MSB2LSB);
    }

    pub fn toggle_oltu(&mut self) {
        self.map.toggle(MapFlags::OLTU);
    }

    pub fn toggle_log(&mut self) {
        self.log = !self.log;
    }
}

fn parse_parity(s: &str) -> Result<Parity, ConfigError> {
    Ok(match s.to_ascii_lowercase().as_str() {
        "odd" => Parity::Odd,
        "even" => Parity::Even,
        "none" => Parity::None,
        "mark" => Parity::Mark,
        "space" => Parity::Space,
        _ => return Err(ConfigError::InvalidParity(s.to_string())),
    })
}

fn parse_flow(s: &str) -> Result<Flow, ConfigError> {
    Ok(match s.to_ascii_lowercase().as_str() {
        "hard" => Flow::Hard,
        "soft" => Flow::Soft,
        "none" => Flow::None,
        _ => return Err(ConfigError::InvalidFlow(s.to_string())),
    })
}

fn parse_databits(s: u8) -> Result<u8, ConfigError> {
    match s {
        5 | 6 | 7 | 8 => Ok(s),
        _ => Err(ConfigError::InvalidDataBits(s.to_string())),
    }
}

fn parse_stopbits(s: u8) -> Result<u8, ConfigError> {
    match s {
        1 | 2 => Ok(s),
        _ => Err(ConfigError::InvalidStopBits(s.to_string())),
    }
}

fn parse_timestamp_format(s: &str) -> Result<TimestampMode, ConfigError> {
    Ok(match s {
        "24hour" => TimestampMode::Hour24,
        "24hour-start" => TimestampMode::Hour24Start,
        "24hour-delta" => TimestampMode::Hour24Delta,
        "iso8601" => TimestampMode::Iso8601,
        other => {
            return Err(ConfigError::BadPattern(format!(
                "unknown timestamp format '{other}'"
            )))
        }
    })
}

fn parse_alert(s: &str) -> Result<AlertMode, ConfigError> {
    Ok(match s.to_ascii_lowercase().as_str() {
        "bell" => AlertMode::Bell,
        "blink" => AlertMode::Blink,
        "none" => AlertMode::None,
        _ => return Err(ConfigError::BadPattern(format!("unknown alert '{s}'"))),
    })
}

/// Parses `LINE=ms,LINE=ms,...`.
fn parse_line_pulse_durations(s: &str) -> Result<[u32; 6], ConfigError> {
    let mut out = [100u32; 6];
    for item in s.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (name, ms) = item
            .split_once('=')
            .ok_or_else(|| ConfigError::InvalidLineName(item.to_string()))?;
        let mask = LineMask::from_name(name)
            .ok_or_else(|| ConfigError::InvalidLineName(name.to_string()))?;
        let ms: u32 = ms
            .parse()
            .map_err(|_| ConfigError::InvalidLineName(item.to_string()))?;
        out[mask as usize] = ms;
    }
    Ok(out)
}

/// Locates the first existing tiorc path per spec.md §6.
fn tiorc_path() -> Option<PathBuf> {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        let p = PathBuf::from(xdg).join("tio/tiorc");
        if p.exists() {
            return Some(p);
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        let p = PathBuf::from(&home).join(".config/tio/tiorc");
        if p.exists() {
            return Some(p);
        }
        let p = PathBuf::from(&home).join(".tiorc");
        if p.exists() {
            return Some(p);
        }
    }
    None
}

/// Resolves the positional argument against tiorc sections: literal
/// `pattern=` match first, then extended-regex match with capture-group
/// substitution into that section's `tty` value (spec.md §6).
fn resolve_device_from_ini(ini: &Ini, positional: &str) -> Result<Option<(String, PathBuf)>, ConfigError> {
    // Literal match first.
    for (section_name, props) in ini.iter() {
        let Some(section_name) = section_name else {
            continue;
        };
        if let Some(pattern) = props.get("pattern") {
            if pattern == positional {
                if let Some(tty) = props.get("tty") {
                    return Ok(Some((section_name.to_string(), PathBuf::from(tty))));
                }
            }
        }
    }
    // Regex match with capture substitution.
    for (section_name, props) in ini.iter() {
        let Some(section_name) = section_name else {
            continue;
        };
        if let Some(pattern) = props.get("pattern") {
            let re = Regex::new(pattern)
                .map_err(|e| ConfigError::BadPattern(format!("{pattern}: {e}")))?;
            if let Some(caps) = re.captures(positional) {
                if let Some(tty_template) = props.get("tty") {
                    let capture = caps.get(1).map(|m| m.as_str()).unwrap_or("");
                    let resolved = tty_template.replace("%s", capture);
                    return Ok(Some((section_name.to_string(), PathBuf::from(resolved))));
                }
            }
        }
    }
    Ok(None)
}

/// Applies the default (unnamed) section of the tiorc file onto `opts`.
fn apply_ini_defaults(ini: &Ini, opts: &mut Options) -> Result<(), ConfigError> {
    let Some(section) = ini.general_section_opt() else {
        return Ok(());
    };
    apply_ini_section(section, opts)
}

fn apply_ini_section(props: &ini::Properties, opts: &mut Options) -> Result<(), ConfigError> {
    if let Some(v) = props.get("baudrate") {
        opts.baudrate = v
            .parse()
            .map_err(|_| ConfigError::InvalidBaudRate(v.to_string()))?;
    }
    if let Some(v) = props.get("databits") {
        opts.databits = parse_databits(
            v.parse()
                .map_err(|_| ConfigError::InvalidDataBits(v.to_string()))?,
        )?;
    }
    if let Some(v) = props.get("stopbits") {
        opts.stopbits = parse_stopbits(
            v.parse()
                .map_err(|_| ConfigError::InvalidStopBits(v.to_string()))?,
        )?;
    }
    if let Some(v) = props.get("parity") {
        opts.parity = parse_parity(v)?;
    }
    if let Some(v) = props.get("flow") {
        opts.flow = parse_flow(v)?;
    }
    if let Some(v) = props.get("map") {
        opts.map = MapFlags::parse_csv(v)?;
    }
    if let Some(v) = props.get("output-delay") {
        opts.output_delay_ms = v.parse().unwrap_or(0);
    }
    if let Some(v) = props.get("output-line-delay") {
        opts.output_line_delay_ms = v.parse().unwrap_or(0);
    }
    if let Some(v) = props.get("line-pulse-duration") {
        opts.line_pulse_duration_ms = parse_line_pulse_durations(v)?;
    }
    if let Some(v) = props.get("socket") {
        opts.socket = Some(v.to_string());
    }
    if let Some(v) = props.get("log") {
        opts.log = v == "true" || v == "1";
    }
    if let Some(v) = props.get("log-file") {
        opts.log_filename = Some(v.to_string());
    }
    if let Some(v) = props.get("alert") {
        opts.alert = parse_alert(v)?;
    }
    if let Some(v) = props.get("no-autoconnect") {
        opts.auto_connect = !(v == "true" || v == "1");
    }
    Ok(())
}

/// Merges CLI args over an optionally-present tiorc file into one
/// `Options` record. CLI flags always win over file-sourced values.
pub fn build_options(args: &Args) -> Result<Options, ConfigError> {
    let mut opts = Options::default();

    if let Some(path) = tiorc_path() {
        let ini = Ini::load_from_file(&path)?;
        apply_ini_defaults(&ini, &mut opts)?;

        if let Some(positional) = &args.device {
            if let Some((section_name, tty)) = resolve_device_from_ini(&ini, positional)? {
                opts.device = tty.to_string_lossy().into_owned();
                if let Some(section) = ini.section(Some(section_name.as_str())) {
                    apply_ini_section(section, &mut opts)?;
                }
            } else {
                opts.device = positional.clone();
            }
        }
    } else if let Some(positional) = &args.device {
        opts.device = positional.clone();
    }

    if opts.device.is_empty() && !args.list_devices {
        return Err(ConfigError::NoDevice);
    }

    if let Some(v) = args.baudrate {
        opts.baudrate = v;
    }
    if let Some(v) = args.databits {
        opts.databits = parse_databits(v)?;
    }
    if let Some(v) = args.stopbits {
        opts.stopbits = parse_stopbits(v)?;
    }
    if let Some(v) = &args.parity {
        opts.parity = parse_parity(v)?;
    }
    if let Some(v) = &args.flow {
        opts.flow = parse_flow(v)?;
    }
    if let Some(v) = args.output_delay {
        opts.output_delay_ms = v;
    }
    if let Some(v) = args.output_line_delay {
        opts.output_line_delay_ms = v;
    }
    if let Some(v) = &args.line_pulse_duration {
        opts.line_pulse_duration_ms = parse_line_pulse_durations(v)?;
    }
    if args.no_autoconnect {
        opts.auto_connect = false;
    }
    if args.local_echo {
        opts.local_echo = true;
    }
    if args.timestamp {
        opts.timestamp = TimestampMode::Hour24;
    }
    if let Some(v) = &args.timestamp_format {
        opts.timestamp = parse_timestamp_format(v)?;
    }
    if args.log {
        opts.log = true;
    }
    if let Some(v) = &args.log_file {
        opts.log = true;
        opts.log_filename = Some(v.clone());
    }
    if args.log_strip {
        opts.log_strip = true;
    }
    if let Some(v) = &args.map {
        opts.map = MapFlags::parse_csv(v)?;
    }
    if let Some(v) = &args.color {
        validate_color(v)?;
        opts.color = Some(v.clone());
    }
    if let Some(v) = &args.socket {
        opts.socket = Some(v.clone());
    }
    if args.hexadecimal {
        opts.output_mode = OutputMode::Hex;
    }
    if args.response_wait {
        opts.response_wait = true;
    }
    if let Some(v) = args.response_timeout {
        opts.response_timeout_ms = v;
    }
    if args.rs485 {
        opts.rs485 = true;
    }
    if let Some(v) = &args.rs485_config {
        opts.rs485 = true;
        opts.rs485_config = Some(v.clone());
    }
    if let Some(v) = &args.alert {
        opts.alert = parse_alert(v)?;
    }
    if args.mute {
        opts.mute = true;
    }
    if let Some(v) = &args.script_file {
        opts.script_policy = ScriptPolicy::Once;
        opts.script_file = Some(v.clone());
    }
    if let Some(v) = &args.script {
        opts.script_policy = ScriptPolicy::Once;
        opts.script_inline = Some(v.clone());
    }

    Ok(opts)
}

fn validate_color(v: &str) -> Result<(), ConfigError> {
    match v {
        "bold" | "none" | "list" => Ok(()),
        n => {
            let code: u16 = n
                .parse()
                .map_err(|_| ConfigError::InvalidColor(n.to_string()))?;
            if code <= 255 {
                Ok(())
            } else {
                Err(ConfigError::InvalidColor(n.to_string()))
            }
        }
    }
}

/// The standard set of baud rates the host termios layer can set
/// directly via `cfsetspeed`; anything else needs the arbitrary-speed
/// ioctl path (spec.md §4.A).
pub fn standard_baud_rates() -> &'static HashSet<u32> {
    use std::sync::OnceLock;
    static RATES: OnceLock<HashSet<u32>> = OnceLock::new();
    RATES.get_or_init(|| {
        [
            50, 75, 110, 134, 150, 200, 300, 600, 1200, 1800, 2400, 4800, 9600, 19200, 38400,
            57600, 115200, 230400, 460800, 500000, 576000, 921600, 1000000, 1152000, 1500000,
            2000000, 2500000, 3000000, 3500000, 4000000,
        ]
        .into_iter()
        .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_flags_parse_csv_combines_bits() {
        let flags = MapFlags::parse_csv("INLCRNL, ODELBS").unwrap();
        assert!(flags.contains(MapFlags::INLCRNL));
        assert!(flags.contains(MapFlags::ODELBS));
        assert!(!flags.contains(MapFlags::OLTU));
    }

    #[test]
    fn map_flags_parse_csv_rejects_unknown_flag() {
        assert!(matches!(
            MapFlags::parse_csv("BOGUS"),
            Err(ConfigError::UnknownMapFlag(_))
        ));
    }

    #[test]
    fn resolve_device_from_ini_prefers_literal_match_over_regex() {
        let ini = Ini::load_from_str(
            "[literal-device]\npattern = foo\ntty = /dev/literal\n\n[regex-device]\npattern = fo(.)\ntty = /dev/regex-%s\n",
        )
        .unwrap();
        let (section, tty) = resolve_device_from_ini(&ini, "foo").unwrap().unwrap();
        assert_eq!(section, "literal-device");
        assert_eq!(tty, PathBuf::from("/dev/literal"));
    }

    #[test]
    fn resolve_device_from_ini_substitutes_regex_capture() {
        let ini = Ini::load_from_str("[board]\npattern = board-(\\d+)\ntty = /dev/ttyBOARD%s\n").unwrap();
        let (section, tty) = resolve_device_from_ini(&ini, "board-3").unwrap().unwrap();
        assert_eq!(section, "board");
        assert_eq!(tty, PathBuf::from("/dev/ttyBOARD3"));
    }

    /// Regression test: a positional argument that resolves the device
    /// path via the *regex* branch must still pick up that section's
    /// other settings (baudrate, map, ...), not just the `tty` value.
    #[test]
    fn build_options_applies_regex_matched_section_settings() {
        let ini = Ini::load_from_str(
            "[board]\npattern = board-(\\d+)\ntty = /dev/ttyBOARD%s\nbaudrate = 57600\nmap = OLTU\n",
        )
        .unwrap();
        let mut opts = Options::default();
        let (section_name, tty) = resolve_device_from_ini(&ini, "board-7").unwrap().unwrap();
        opts.device = tty.to_string_lossy().into_owned();
        let section = ini.section(Some(section_name.as_str())).unwrap();
        apply_ini_section(section, &mut opts).unwrap();

        assert_eq!(opts.device, "/dev/ttyBOARD7");
        assert_eq!(opts.baudrate, 57600);
        assert!(opts.map.contains(MapFlags::OLTU));
    }
}
