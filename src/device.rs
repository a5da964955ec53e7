//! Device Port (component A, spec.md §4.A): owns the serial file
//! descriptor, its exclusive advisory lock, raw-mode termios, and the
//! staged, drain-on-demand write path.

use std::io::Read;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

use nix::fcntl::{self, FlockArg, OFlag};
use nix::sys::stat::Mode;
use nix::sys::termios::{self, BaudRate, SetArg, SpecialCharacterIndices, Termios};
use nix::unistd;

use crate::config::{Flow, Options, Parity};
use crate::error::DeviceError;

/// `2 * BUFSIZ`, matching the data model's write-staging capacity
/// (spec.md §3).
const STAGING_CAPACITY: usize = 2 * libc::BUFSIZ as usize;

// `libc` does not expose the RS-485 ioctl ABI; these are the fixed
// Linux kernel request/flag numbers (`include/uapi/linux/serial.h`).
#[cfg(target_os = "linux")]
const TIOCGRS485: libc::c_ulong = 0x542E;
#[cfg(target_os = "linux")]
const TIOCSRS485: libc::c_ulong = 0x542F;
#[cfg(target_os = "linux")]
const SER_RS485_ENABLED: u32 = 1 << 0;
#[cfg(target_os = "linux")]
const SER_RS485_RTS_ON_SEND: u32 = 1 << 1;
#[cfg(target_os = "linux")]
const SER_RS485_RTS_AFTER_SEND: u32 = 1 << 2;
#[cfg(target_os = "linux")]
const SER_RS485_RX_DURING_TX: u32 = 1 << 4;
#[cfg(target_os = "linux")]
const SER_RS485_TERMINATE_BUS: u32 = 1 << 5;

#[cfg(target_os = "linux")]
#[repr(C)]
struct SerialRs485 {
    flags: u32,
    delay_rts_before_send: u32,
    delay_rts_after_send: u32,
    padding: [u32; 5],
}

#[cfg(target_os = "linux")]
fn set_rs485_flag(flags: &mut u32, bit: u32, on: bool) {
    if on {
        *flags |= bit;
    } else {
        *flags &= !bit;
    }
}

pub struct Device {
    fd: OwnedFd,
    path: String,
    original_termios: Termios,
    staging: Vec<u8>,
}

impl Device {
    /// Opens `path`, verifies it is a tty, takes the exclusive lock,
    /// flushes stale data, and applies the termios derived from
    /// `opts` (spec.md §4.A, §4.J "connect").
    pub fn open(opts: &Options) -> Result<Device, DeviceError> {
        let path = opts.device.clone();

        let fd = fcntl::open(
            path.as_str(),
            OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_NONBLOCK,
            Mode::empty(),
        )
        .map_err(|e| DeviceError::Open(path.clone(), std::io::Error::from(e)))?;

        if !unistd::isatty(&fd).unwrap_or(false) {
            return Err(DeviceError::NotATty(path));
        }

        fcntl::flock(fd.as_raw_fd(), FlockArg::LockExclusiveNonblock)
            .map_err(|_| DeviceError::AlreadyLocked(path.clone()))?;

        // Flush stale in/out data immediately after open.
        let _ = termios::tcflush(&fd, termios::FlushArg::TCIOFLUSH);

        let original = termios::tcgetattr(&fd).map_err(|e| DeviceError::GetAttr(path.clone(), e))?;

        let mut device = Device {
            fd,
            path,
            original_termios: original.clone(),
            staging: Vec::with_capacity(STAGING_CAPACITY),
        };

        device.apply_termios(opts)?;
        if opts.rs485 {
            device.configure_rs485(opts.rs485_config.as_deref())?;
        }
        Ok(device)
    }

    fn apply_termios(&mut self, opts: &Options) -> Result<(), DeviceError> {
        let mut t = self.original_termios.clone();

        t.input_flags = termios::InputFlags::empty();
        t.output_flags = termios::OutputFlags::empty();
        t.local_flags = termios::LocalFlags::empty();
        t.control_flags = termios::ControlFlags::CLOCAL | termios::ControlFlags::CREAD;

        t.control_flags |= databits_flag(opts.databits);
        match opts.parity {
            Parity::None => {}
            Parity::Even => t.control_flags |= termios::ControlFlags::PARENB,
            Parity::Odd => {
                t.control_flags |= termios::ControlFlags::PARENB | termios::ControlFlags::PARODD
            }
            // mark/space parity has no portable termios representation; approximate
            // with odd/even plus CMSPAR where the platform exposes it.
            Parity::Mark => {
                t.control_flags |= termios::ControlFlags::PARENB | termios::ControlFlags::PARODD
            }
            Parity::Space => t.control_flags |= termios::ControlFlags::PARENB,
        }
        if opts.stopbits == 2 {
            t.control_flags |= termios::ControlFlags::CSTOPB;
        }
        match opts.flow {
            Flow::None => {}
            Flow::Soft => t.input_flags |= termios::InputFlags::IXON | termios::InputFlags::IXOFF,
            Flow::Hard => t.control_flags |= termios::ControlFlags::CRTSCTS,
        }

        t.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
        t.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;

        if let Some(rate) = standard_baud_rate(opts.baudrate) {
            termios::cfsetspeed(&mut t, rate)
                .map_err(|e| DeviceError::SetSpeed(self.path.clone(), e))?;
        }

        termios::tcsetattr(&self.fd, SetArg::TCSANOW, &t)
            .map_err(|e| DeviceError::SetAttr(self.path.clone(), e))?;

        if standard_baud_rate(opts.baudrate).is_none() {
            self.set_arbitrary_baud(opts.baudrate)?;
        }

        Ok(())
    }

    /// Platform-specific arbitrary-speed path for baud rates outside
    /// the host's standard set (spec.md §4.A). ispeed/ospeed must be
    /// copied from the already-saved termios first per the spec note.
    #[cfg(target_os = "linux")]
    fn set_arbitrary_baud(&mut self, baud: u32) -> Result<(), DeviceError> {
        use std::mem;
        unsafe {
            let mut t2: libc::termios2 = mem::zeroed();
            if libc::ioctl(self.fd.as_raw_fd(), libc::TCGETS2, &mut t2) != 0 {
                return Err(DeviceError::Ioctl(
                    self.path.clone(),
                    nix::errno::Errno::last(),
                ));
            }
            t2.c_cflag &= !libc::CBAUD;
            t2.c_cflag |= libc::BOTHER;
            t2.c_ispeed = baud;
            t2.c_ospeed = baud;
            if libc::ioctl(self.fd.as_raw_fd(), libc::TCSETS2, &t2) != 0 {
                return Err(DeviceError::Ioctl(
                    self.path.clone(),
                    nix::errno::Errno::last(),
                ));
            }
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn set_arbitrary_baud(&mut self, _baud: u32) -> Result<(), DeviceError> {
        Err(DeviceError::SetSpeed(
            self.path.clone(),
            nix::errno::Errno::EOPNOTSUPP,
        ))
    }

    /// Enables RS-485 transceiver-direction control via `TIOCSRS485`
    /// (spec.md §4.A, §4.J "optional RS-485 enable"). `config` is the
    /// `key=val,key=val` string from `--rs-485-config`; unrecognized
    /// keys are ignored.
    #[cfg(target_os = "linux")]
    pub fn configure_rs485(&mut self, config: Option<&str>) -> Result<(), DeviceError> {
        unsafe {
            let mut rs485: SerialRs485 = std::mem::zeroed();
            if libc::ioctl(self.fd.as_raw_fd(), TIOCGRS485 as libc::c_ulong, &mut rs485) != 0 {
                return Err(DeviceError::Ioctl(self.path.clone(), nix::errno::Errno::last()));
            }
            rs485.flags |= SER_RS485_ENABLED;
            if let Some(config) = config {
                for item in config.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                    let (key, val) = item.split_once('=').unwrap_or((item, "1"));
                    let on = val != "0";
                    match key {
                        "rts-on-send" => set_rs485_flag(&mut rs485.flags, SER_RS485_RTS_ON_SEND, on),
                        "rts-after-send" => {
                            set_rs485_flag(&mut rs485.flags, SER_RS485_RTS_AFTER_SEND, on)
                        }
                        "rx-during-tx" => set_rs485_flag(&mut rs485.flags, SER_RS485_RX_DURING_TX, on),
                        "terminate-bus" => set_rs485_flag(&mut rs485.flags, SER_RS485_TERMINATE_BUS, on),
                        "delay-rts-before-send" => {
                            rs485.delay_rts_before_send = val.parse().unwrap_or(0)
                        }
                        "delay-rts-after-send" => {
                            rs485.delay_rts_after_send = val.parse().unwrap_or(0)
                        }
                        _ => {}
                    }
                }
            }
            if libc::ioctl(self.fd.as_raw_fd(), TIOCSRS485 as libc::c_ulong, &rs485) != 0 {
                return Err(DeviceError::Ioctl(self.path.clone(), nix::errno::Errno::last()));
            }
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    pub fn configure_rs485(&mut self, _config: Option<&str>) -> Result<(), DeviceError> {
        Err(DeviceError::Ioctl(
            self.path.clone(),
            nix::errno::Errno::EOPNOTSUPP,
        ))
    }

    pub fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Reads available bytes into `buf`. Called only after `poll`
    /// reports the fd readable, so a `Ok(0)` is a real EOF (the device
    /// went away), not "no data yet" — surfaced as its own error
    /// variant so the caller can't mistake it for a short read
    /// (spec.md §4.J "On read error or EOF from device").
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, DeviceError> {
        let dup = self
            .fd
            .try_clone()
            .map_err(|e| DeviceError::Open(self.path.clone(), e))?;
        let mut file = std::fs::File::from(dup);
        match file.read(buf) {
            Ok(0) => Err(DeviceError::Eof),
            Ok(n) => Ok(n),
            Err(e) => Err(DeviceError::Read(e)),
        }
    }

    /// Stages `n` bytes for later draining. Flushes first if the
    /// staging buffer would overflow (spec.md §4.A).
    pub fn write_bytes(&mut self, data: &[u8]) -> Result<(), DeviceError> {
        if self.staging.len() + data.len() > self.staging.capacity() {
            self.sync()?;
        }
        self.staging.extend_from_slice(data);
        Ok(())
    }

    /// Writes one byte at a time with per-byte/per-line delay,
    /// bypassing the staging buffer entirely (spec.md §4.A).
    pub fn write_delayed(
        &mut self,
        data: &[u8],
        byte_delay_ms: u32,
        line_delay_ms: u32,
    ) -> Result<(), DeviceError> {
        for &b in data {
            self.raw_write(&[b])?;
            if byte_delay_ms > 0 {
                std::thread::sleep(std::time::Duration::from_millis(byte_delay_ms as u64));
            }
            if b == b'\n' && line_delay_ms > 0 {
                std::thread::sleep(std::time::Duration::from_millis(line_delay_ms as u64));
            }
        }
        Ok(())
    }

    /// Loops until all of `data` has been written: `write(2)` is not
    /// guaranteed to consume a whole large buffer in one call even on
    /// a blocking fd.
    fn raw_write(&self, mut data: &[u8]) -> Result<(), DeviceError> {
        while !data.is_empty() {
            let n = unistd::write(&self.fd, data)
                .map_err(|e| DeviceError::Read(std::io::Error::from(e)))?;
            data = &data[n..];
        }
        Ok(())
    }

    /// Drains the staging buffer to the fd, calling fsync+tcdrain
    /// between chunks as spec.md §4.A directs (invariant iii).
    pub fn sync(&mut self) -> Result<(), DeviceError> {
        if self.staging.is_empty() {
            return Ok(());
        }
        let chunk = std::mem::take(&mut self.staging);
        self.raw_write(&chunk)?;
        let _ = unistd::fsync(self.fd.as_raw_fd());
        let _ = termios::tcdrain(&self.fd);
        self.staging = Vec::with_capacity(STAGING_CAPACITY);
        Ok(())
    }

    pub fn staged_len(&self) -> usize {
        self.staging.len()
    }

    pub fn send_break(&self) -> Result<(), DeviceError> {
        termios::tcsendbreak(&self.fd, 0).map_err(|e| DeviceError::Ioctl(self.path.clone(), e))
    }

    pub fn flush_both(&mut self) -> Result<(), DeviceError> {
        self.staging.clear();
        termios::tcflush(&self.fd, termios::FlushArg::TCIOFLUSH)
            .map_err(|e| DeviceError::Ioctl(self.path.clone(), e))
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        let _ = self.sync();
        let _ = termios::tcsetattr(&self.fd, SetArg::TCSANOW, &self.original_termios);
        let _ = fcntl::flock(self.fd.as_raw_fd(), FlockArg::Unlock);
    }
}

fn databits_flag(bits: u8) -> termios::ControlFlags {
    use termios::ControlFlags as CF;
    match bits {
        5 => CF::CS5,
        6 => CF::CS6,
        7 => CF::CS7,
        _ => CF::CS8,
    }
}

fn standard_baud_rate(baud: u32) -> Option<BaudRate> {
    if !crate::config::standard_baud_rates().contains(&baud) {
        return None;
    }
    // `nix::sys::termios::BaudRate` only names the rates the platform's
    // termios ABI can express directly via cfsetspeed.
    Some(match baud {
        50 => BaudRate::B50,
        75 => BaudRate::B75,
        110 => BaudRate::B110,
        134 => BaudRate::B134,
        150 => BaudRate::B150,
        200 => BaudRate::B200,
        300 => BaudRate::B300,
        600 => BaudRate::B600,
        1200 => BaudRate::B1200,
        1800 => BaudRate::B1800,
        2400 => BaudRate::B2400,
        4800 => BaudRate::B4800,
        9600 => BaudRate::B9600,
        19200 => BaudRate::B19200,
        38400 => BaudRate::B38400,
        57600 => BaudRate::B57600,
        115200 => BaudRate::B115200,
        230400 => BaudRate::B230400,
        #[cfg(target_os = "linux")]
        460800 => BaudRate::B460800,
        #[cfg(target_os = "linux")]
        500000 => BaudRate::B500000,
        #[cfg(target_os = "linux")]
        576000 => BaudRate::B576000,
        #[cfg(target_os = "linux")]
        921600 => BaudRate::B921600,
        #[cfg(target_os = "linux")]
        1000000 => BaudRate::B1000000,
        #[cfg(target_os = "linux")]
        1152000 => BaudRate::B1152000,
        #[cfg(target_os = "linux")]
        1500000 => BaudRate::B1500000,
        #[cfg(target_os = "linux")]
        2000000 => BaudRate::B2000000,
        #[cfg(target_os = "linux")]
        2500000 => BaudRate::B2500000,
        #[cfg(target_os = "linux")]
        3000000 => BaudRate::B3000000,
        #[cfg(target_os = "linux")]
        3500000 => BaudRate::B3500000,
        #[cfg(target_os = "linux")]
        4000000 => BaudRate::B4000000,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn databits_map_to_cs_flags() {
        assert_eq!(databits_flag(5), termios::ControlFlags::CS5);
        assert_eq!(databits_flag(8), termios::ControlFlags::CS8);
        assert_eq!(databits_flag(3), termios::ControlFlags::CS8);
    }

    #[test]
    fn staging_capacity_matches_data_model() {
        assert_eq!(STAGING_CAPACITY, 2 * libc::BUFSIZ as usize);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn rs485_flag_toggles_independently() {
        let mut flags = 0u32;
        set_rs485_flag(&mut flags, SER_RS485_RTS_ON_SEND, true);
        set_rs485_flag(&mut flags, SER_RS485_RX_DURING_TX, true);
        assert_eq!(flags, SER_RS485_RTS_ON_SEND | SER_RS485_RX_DURING_TX);
        set_rs485_flag(&mut flags, SER_RS485_RTS_ON_SEND, false);
        assert_eq!(flags, SER_RS485_RX_DURING_TX);
    }

    /// Builds a `Device` over a PTY slave instead of a real serial
    /// node, the way SPEC_FULL.md §8 directs for logic that only
    /// needs "some tty" (`isatty` is true for a PTY slave too, so
    /// `apply_termios`/`sync`/`send_break` exercise the exact code
    /// path `open()` would, without a hardware port).
    fn device_over_pty() -> (Device, OwnedFd) {
        let pty = nix::pty::openpty(None, None).expect("openpty");
        let original = termios::tcgetattr(&pty.slave).expect("tcgetattr on pty slave");
        let device = Device {
            fd: pty.slave,
            path: "pty-slave".to_string(),
            original_termios: original,
            staging: Vec::with_capacity(STAGING_CAPACITY),
        };
        (device, pty.master)
    }

    #[test]
    fn apply_termios_sets_raw_mode_and_databits() {
        let (mut device, _master) = device_over_pty();
        let mut opts = Options::default();
        opts.databits = 7;
        opts.parity = Parity::Even;
        opts.stopbits = 2;
        device.apply_termios(&opts).expect("apply_termios");

        let t = termios::tcgetattr(&device.fd).expect("tcgetattr after apply");
        assert!(t.control_flags.contains(termios::ControlFlags::CS7));
        assert!(t.control_flags.contains(termios::ControlFlags::PARENB));
        assert!(!t.control_flags.contains(termios::ControlFlags::PARODD));
        assert!(t.control_flags.contains(termios::ControlFlags::CSTOPB));
        assert!(t.local_flags.is_empty());
        assert_eq!(t.control_chars[SpecialCharacterIndices::VMIN as usize], 1);
        assert_eq!(t.control_chars[SpecialCharacterIndices::VTIME as usize], 0);
    }

    #[test]
    fn sync_drains_staging_and_data_reaches_the_other_end() {
        let (mut device, master) = device_over_pty();
        device.apply_termios(&Options::default()).expect("apply_termios");

        device.write_bytes(b"hello").expect("write_bytes");
        assert_eq!(device.staged_len(), 5);
        device.sync().expect("sync");
        assert_eq!(device.staged_len(), 0);

        let mut master_file = std::fs::File::from(master);
        let mut buf = [0u8; 5];
        master_file.read_exact(&mut buf).expect("read from pty master");
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn write_bytes_flushes_before_overflowing_staging_capacity() {
        let (mut device, master) = device_over_pty();
        device.apply_termios(&Options::default()).expect("apply_termios");

        // A kernel pty buffer is far smaller than `STAGING_CAPACITY`
        // (2*BUFSIZ), so a thread drains the master end concurrently
        // with the writes below — otherwise the flush's blocking
        // `write(2)` could stall waiting for buffer space that only
        // a reader frees up.
        let drain = std::thread::spawn(move || {
            let mut master_file = std::fs::File::from(master);
            let mut collected = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                match master_file.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        collected.extend_from_slice(&buf[..n]);
                        if collected.len() >= STAGING_CAPACITY - 1 + 2 {
                            break;
                        }
                    }
                }
            }
            collected
        });

        let chunk = vec![b'x'; STAGING_CAPACITY - 1];
        device.write_bytes(&chunk).expect("first chunk stages without overflow");
        assert_eq!(device.staged_len(), STAGING_CAPACITY - 1);

        // This second write would overflow the staging buffer, so it
        // must flush the first chunk before staging the new bytes
        // (spec.md §4.A "if the staging buffer would overflow, it is
        // flushed first").
        device.write_bytes(b"yz").expect("second write triggers a flush");
        assert_eq!(device.staged_len(), 2);
        device.sync().expect("final sync");

        let received = drain.join().expect("drain thread");
        assert_eq!(received.len(), STAGING_CAPACITY - 1 + 2);
        assert_eq!(&received[..STAGING_CAPACITY - 1], chunk.as_slice());
        assert_eq!(&received[STAGING_CAPACITY - 1..], b"yz");
    }
}
