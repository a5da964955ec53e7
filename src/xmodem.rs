//! Transfer Framing (component Q, spec.md §2 "the XMODEM/YMODEM
//! framing implementation, treated as a blocking byte-pump
//! primitive"): the concrete block framing, checksum/CRC, and
//! YMODEM batch header/EOT handshake behind the Transfer Adapter.

use std::io::Read;
use std::os::fd::AsFd;
use std::time::{Duration, Instant};

use nix::poll::{PollFd, PollFlags, PollTimeout};

use crate::config::Protocol;
use crate::device::Device;
use crate::session::HotKey;

const SOH: u8 = 0x01;
const STX: u8 = 0x02;
const EOT: u8 = 0x04;
const ACK: u8 = 0x06;
const NAK: u8 = 0x15;
const CAN: u8 = 0x18;
const SUB: u8 = 0x1A;
const CRC_CHALLENGE: u8 = b'C';

const BLOCK_TIMEOUT_MS: u64 = 10_000;
const MAX_RETRIES: u32 = 10;

#[derive(Debug, PartialEq, Eq)]
pub enum TransferOutcome {
    Done,
    Aborted,
}

/// Sends `data` (the whole file contents) as one XMODEM/YMODEM
/// transfer over `device`. `hot_key` is polled between blocks so any
/// keystroke captured by the input pump aborts the transfer (spec.md
/// §4.H, §5).
pub fn send(
    device: &mut Device,
    protocol: Protocol,
    filename: &str,
    data: &[u8],
    hot_key: &HotKey,
) -> std::io::Result<TransferOutcome> {
    hot_key.arm();
    let result = match protocol {
        Protocol::Ymodem => send_ymodem(device, filename, data, hot_key),
        Protocol::Xmodem1K => send_xmodem(device, data, hot_key, 1024),
        Protocol::XmodemCrc => send_xmodem(device, data, hot_key, 128),
    };
    hot_key.disarm();
    result
}

fn send_ymodem(
    device: &mut Device,
    filename: &str,
    data: &[u8],
    hot_key: &HotKey,
) -> std::io::Result<TransferOutcome> {
    // Block 0: null-padded "filename\0filesize" header.
    let mut header = Vec::new();
    header.extend_from_slice(filename.as_bytes());
    header.push(0);
    header.extend_from_slice(data.len().to_string().as_bytes());

    if !wait_for_crc_challenge(device, hot_key)? {
        return Ok(TransferOutcome::Aborted);
    }
    match send_block(device, 0, &pad(&header, 128), hot_key)? {
        TransferOutcome::Done => {}
        TransferOutcome::Aborted => return Ok(TransferOutcome::Aborted),
    }

    if !wait_for_crc_challenge(device, hot_key)? {
        return Ok(TransferOutcome::Aborted);
    }
    match send_xmodem_data(device, data, hot_key, 1024)? {
        TransferOutcome::Done => {}
        TransferOutcome::Aborted => return Ok(TransferOutcome::Aborted),
    }

    // Final null block closes the batch.
    if !wait_for_crc_challenge(device, hot_key)? {
        return Ok(TransferOutcome::Aborted);
    }
    send_block(device, 0, &[0u8; 128], hot_key)
}

fn send_xmodem(
    device: &mut Device,
    data: &[u8],
    hot_key: &HotKey,
    block_size: usize,
) -> std::io::Result<TransferOutcome> {
    if !wait_for_crc_challenge(device, hot_key)? {
        return Ok(TransferOutcome::Aborted);
    }
    send_xmodem_data(device, data, hot_key, block_size)
}

fn send_xmodem_data(
    device: &mut Device,
    data: &[u8],
    hot_key: &HotKey,
    block_size: usize,
) -> std::io::Result<TransferOutcome> {
    let mut block_num: u8 = 1;
    for chunk in data.chunks(block_size.max(1)).collect::<Vec<_>>().into_iter() {
        let padded = pad(chunk, block_size);
        match send_block(device, block_num, &padded, hot_key)? {
            TransferOutcome::Done => {}
            TransferOutcome::Aborted => return Ok(TransferOutcome::Aborted),
        }
        block_num = block_num.wrapping_add(1);
    }
    if data.is_empty() {
        // Degenerate empty file still needs one block per XMODEM convention.
        match send_block(device, block_num, &pad(&[], block_size), hot_key)? {
            TransferOutcome::Done => {}
            TransferOutcome::Aborted => return Ok(TransferOutcome::Aborted),
        }
    }

    for attempt in 0..MAX_RETRIES {
        if hot_key.take().is_some() {
            return Ok(TransferOutcome::Aborted);
        }
        write_byte(device, EOT)?;
        match read_byte_timeout(device, BLOCK_TIMEOUT_MS)? {
            Some(ACK) => return Ok(TransferOutcome::Done),
            Some(_) if attempt + 1 == MAX_RETRIES => break,
            _ => continue,
        }
    }
    Ok(TransferOutcome::Aborted)
}

fn pad(chunk: &[u8], block_size: usize) -> Vec<u8> {
    let mut v = chunk.to_vec();
    v.resize(block_size, SUB);
    v
}

fn send_block(
    device: &mut Device,
    block_num: u8,
    payload: &[u8],
    hot_key: &HotKey,
) -> std::io::Result<TransferOutcome> {
    let header = if payload.len() > 128 { STX } else { SOH };
    let crc = crc16(payload);

    let mut frame = Vec::with_capacity(payload.len() + 5);
    frame.push(header);
    frame.push(block_num);
    frame.push(!block_num);
    frame.extend_from_slice(payload);
    frame.push((crc >> 8) as u8);
    frame.push((crc & 0xFF) as u8);

    for _ in 0..MAX_RETRIES {
        if hot_key.take().is_some() {
            return Ok(TransferOutcome::Aborted);
        }
        write_all(device, &frame)?;
        match read_byte_timeout(device, BLOCK_TIMEOUT_MS)? {
            Some(ACK) => return Ok(TransferOutcome::Done),
            Some(CAN) => return Ok(TransferOutcome::Aborted),
            Some(NAK) | None => continue,
            Some(_) => continue,
        }
    }
    Ok(TransferOutcome::Aborted)
}

fn wait_for_crc_challenge(device: &mut Device, hot_key: &HotKey) -> std::io::Result<bool> {
    let deadline = Instant::now() + Duration::from_secs(60);
    while Instant::now() < deadline {
        if hot_key.take().is_some() {
            return Ok(false);
        }
        if let Some(b) = read_byte_timeout(device, 1000)? {
            if b == CRC_CHALLENGE || b == NAK {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

fn write_byte(device: &mut Device, b: u8) -> std::io::Result<()> {
    write_all(device, &[b])
}

fn write_all(device: &mut Device, data: &[u8]) -> std::io::Result<()> {
    device
        .write_bytes(data)
        .and_then(|_| device.sync())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
}

fn read_byte_timeout(device: &mut Device, timeout_ms: u64) -> std::io::Result<Option<u8>> {
    let fd = device.as_fd();
    let mut fds = [PollFd::new(fd.as_fd(), PollFlags::POLLIN)];
    let timeout = PollTimeout::from(timeout_ms.min(u16::MAX as u64) as u16);
    let n = nix::poll::poll(&mut fds, timeout)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
    if n == 0 {
        return Ok(None);
    }
    let mut buf = [0u8; 1];
    match device.read(&mut buf) {
        Ok(1) => Ok(Some(buf[0])),
        _ => Ok(None),
    }
}

/// CRC-16/XMODEM (polynomial 0x1021, initial value 0).
fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &b in data {
        crc ^= (b as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc16_of_empty_is_zero() {
        assert_eq!(crc16(&[]), 0);
    }

    #[test]
    fn crc16_known_vector() {
        // CRC-16/XMODEM of "123456789" is 0x31C3 (well-known test vector).
        assert_eq!(crc16(b"123456789"), 0x31C3);
    }

    #[test]
    fn pad_fills_with_sub_byte() {
        let padded = pad(b"hi", 8);
        assert_eq!(padded, vec![b'h', b'i', SUB, SUB, SUB, SUB, SUB, SUB]);
    }
}
