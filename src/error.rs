//! Error taxonomy, one enum per fallible boundary (spec.md §7).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid baud rate: {0}")]
    InvalidBaudRate(String),
    #[error("invalid data bits: {0} (expected 5, 6, 7 or 8)")]
    InvalidDataBits(String),
    #[error("invalid stop bits: {0} (expected 1 or 2)")]
    InvalidStopBits(String),
    #[error("invalid parity: {0} (expected odd, even, none, mark or space)")]
    InvalidParity(String),
    #[error("invalid flow control: {0} (expected hard, soft or none)")]
    InvalidFlow(String),
    #[error("unknown map flag: {0}")]
    UnknownMapFlag(String),
    #[error("invalid color: {0}")]
    InvalidColor(String),
    #[error("invalid line name in --line-pulse-duration: {0}")]
    InvalidLineName(String),
    #[error("malformed tiorc section pattern: {0}")]
    BadPattern(String),
    #[error("no device argument given and no matching tiorc section")]
    NoDevice,
    #[error("io error reading config: {0}")]
    Io(#[from] std::io::Error),
    #[error("ini parse error: {0}")]
    Ini(#[from] ini::Error),
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("{0}: not a tty device")]
    NotATty(String),
    #[error("{0}: device is locked by another process")]
    AlreadyLocked(String),
    #[error("failed to open {0}: {1}")]
    Open(String, std::io::Error),
    #[error("failed to read terminal attributes of {0}: {1}")]
    GetAttr(String, nix::Error),
    #[error("failed to set terminal attributes of {0}: {1}")]
    SetAttr(String, nix::Error),
    #[error("failed to set baud rate on {0}: {1}")]
    SetSpeed(String, nix::Error),
    #[error("ioctl failed on {0}: {1}")]
    Ioctl(String, nix::Error),
    #[error("device read error: {0}")]
    Read(std::io::Error),
    #[error("device closed (EOF)")]
    Eof,
}

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("failed to read script file {0}: {1}")]
    Load(String, std::io::Error),
    #[error("script compile error: {0}")]
    Compile(String),
    #[error("script runtime error: {0}")]
    Runtime(String),
    #[error("invalid regular expression in expect(): {0}")]
    BadPattern(#[from] regex::Error),
}
