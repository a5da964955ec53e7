//! Command-line surface (component N), mirroring spec.md §6.

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "tio", version, about = "A simple serial device terminal")]
pub struct Args {
    /// Device path or named tiorc sub-configuration.
    pub device: Option<String>,

    #[arg(short = 'b', long = "baudrate")]
    pub baudrate: Option<u32>,

    #[arg(short = 'd', long = "databits")]
    pub databits: Option<u8>,

    #[arg(short = 'f', long = "flow")]
    pub flow: Option<String>,

    #[arg(short = 's', long = "stopbits")]
    pub stopbits: Option<u8>,

    #[arg(short = 'p', long = "parity")]
    pub parity: Option<String>,

    #[arg(short = 'o', long = "output-delay")]
    pub output_delay: Option<u32>,

    #[arg(short = 'O', long = "output-line-delay")]
    pub output_line_delay: Option<u32>,

    /// `LINE=ms,LINE=ms,...` over {DTR,RTS,CTS,DSR,DCD,RI}
    #[arg(long = "line-pulse-duration")]
    pub line_pulse_duration: Option<String>,

    #[arg(short = 'n', long = "no-autoconnect")]
    pub no_autoconnect: bool,

    #[arg(short = 'e', long = "local-echo")]
    pub local_echo: bool,

    #[arg(short = 't', long = "timestamp")]
    pub timestamp: bool,

    #[arg(long = "timestamp-format")]
    pub timestamp_format: Option<String>,

    #[arg(short = 'L', long = "list-devices")]
    pub list_devices: bool,

    #[arg(short = 'l', long = "log")]
    pub log: bool,

    #[arg(long = "log-file")]
    pub log_file: Option<String>,

    #[arg(long = "log-strip")]
    pub log_strip: bool,

    #[arg(short = 'm', long = "map")]
    pub map: Option<String>,

    #[arg(short = 'c', long = "color")]
    pub color: Option<String>,

    #[arg(short = 'S', long = "socket")]
    pub socket: Option<String>,

    #[arg(short = 'x', long = "hexadecimal")]
    pub hexadecimal: bool,

    #[arg(short = 'r', long = "response-wait")]
    pub response_wait: bool,

    #[arg(long = "response-timeout")]
    pub response_timeout: Option<u64>,

    #[arg(long = "rs-485")]
    pub rs485: bool,

    #[arg(long = "rs-485-config")]
    pub rs485_config: Option<String>,

    #[arg(long = "alert")]
    pub alert: Option<String>,

    #[arg(long = "mute")]
    pub mute: bool,

    #[arg(long = "script")]
    pub script: Option<String>,

    #[arg(long = "script-file")]
    pub script_file: Option<String>,
}
