//! Per-run session state (spec.md §3, "Session state"): counters, the
//! rolling receive window used by the script bridge's `expect()`, and
//! the one-slot hot-key mailbox shared between the input pump and the
//! transfer adapter (spec.md §5, §9).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

/// Sentinel written into the hot-key mailbox when it is "armed" (a
/// transfer is in progress) and no key has been captured yet.
pub const HOTKEY_NONE: u8 = 0xFF;

/// Sentinel meaning "not armed": no transfer is running, so the input
/// pump's pre-filter never claims a byte and everything is forwarded
/// normally (spec.md §4.C, §4.H).
const HOTKEY_DISARMED: u8 = 0xFE;

/// The rolling receive window never holds more than this many bytes
/// (spec.md §3 invariant vi).
pub const RECV_WINDOW_CAPACITY: usize = 2000;

/// One-slot mailbox: the input pump writes the first byte it sees
/// while the slot is "none"; the transfer adapter's blocking loop
/// polls it to detect an abort keystroke (spec.md §9).
#[derive(Debug, Default)]
pub struct HotKey(AtomicU8);

impl HotKey {
    pub fn new() -> Self {
        HotKey(AtomicU8::new(HOTKEY_DISARMED))
    }

    /// Arms the mailbox for the duration of a blocking transfer: every
    /// subsequent input byte is swallowed and offered to `take()` until
    /// `disarm()` is called (spec.md §4.C, §4.H).
    pub fn arm(&self) {
        self.0.store(HOTKEY_NONE, Ordering::SeqCst);
    }

    pub fn disarm(&self) {
        self.0.store(HOTKEY_DISARMED, Ordering::SeqCst);
    }

    /// Stores `byte` only if the slot is armed and currently empty.
    /// Returns true if this call claimed the slot (i.e. the byte
    /// should be swallowed rather than forwarded).
    pub fn try_store(&self, byte: u8) -> bool {
        self.0
            .compare_exchange(HOTKEY_NONE, byte, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Takes the captured byte, if any, and re-arms the slot so the
    /// next keystroke can be captured too.
    pub fn take(&self) -> Option<u8> {
        let v = self.0.swap(HOTKEY_NONE, Ordering::SeqCst);
        if v == HOTKEY_NONE || v == HOTKEY_DISARMED {
            None
        } else {
            Some(v)
        }
    }
}

/// A bounded FIFO of the most recent device-emitted bytes, consulted
/// by the script bridge's `expect()` regex matcher (spec.md §3
/// invariant vi, §4.I).
#[derive(Debug, Default)]
pub struct RecvWindow {
    buf: VecDeque<u8>,
}

impl RecvWindow {
    pub fn new() -> Self {
        RecvWindow {
            buf: VecDeque::with_capacity(RECV_WINDOW_CAPACITY),
        }
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn push(&mut self, byte: u8) {
        if self.buf.len() == RECV_WINDOW_CAPACITY {
            self.buf.pop_front();
        }
        self.buf.push_back(byte);
    }

    /// Contiguous snapshot of the window's current contents, suitable
    /// for regex matching.
    pub fn as_bytes(&self) -> Vec<u8> {
        self.buf.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Statistics and cross-task shared state for one run (spec.md §3,
/// §5). `rx_total`/`tx_total` are atomics so the `s` command can read
/// them without taking a lock, even though only the main task ever
/// writes them (spec.md §8 "Statistics monotonicity").
#[derive(Debug)]
pub struct Session {
    pub rx_total: AtomicU64,
    pub tx_total: AtomicU64,
    pub hot_key: Arc<HotKey>,
}

impl Session {
    pub fn new() -> Self {
        Session {
            rx_total: AtomicU64::new(0),
            tx_total: AtomicU64::new(0),
            hot_key: Arc::new(HotKey::new()),
        }
    }

    pub fn add_rx(&self, n: u64) {
        self.rx_total.fetch_add(n, Ordering::SeqCst);
    }

    pub fn add_tx(&self, n: u64) {
        self.tx_total.fetch_add(n, Ordering::SeqCst);
    }

    pub fn totals(&self) -> (u64, u64) {
        (
            self.rx_total.load(Ordering::SeqCst),
            self.tx_total.load(Ordering::SeqCst),
        )
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hot_key_disarmed_never_captures() {
        let hk = HotKey::new();
        assert!(!hk.try_store(b'x'));
    }

    #[test]
    fn hot_key_first_writer_wins_once_armed() {
        let hk = HotKey::new();
        hk.arm();
        assert!(hk.try_store(b'x'));
        assert!(!hk.try_store(b'y'));
        assert_eq!(hk.take(), Some(b'x'));
        assert_eq!(hk.take(), None);
    }

    #[test]
    fn recv_window_caps_at_capacity() {
        let mut w = RecvWindow::new();
        for i in 0..RECV_WINDOW_CAPACITY + 10 {
            w.push((i % 256) as u8);
        }
        assert_eq!(w.len(), RECV_WINDOW_CAPACITY);
        assert_eq!(*w.as_bytes().last().unwrap(), ((RECV_WINDOW_CAPACITY + 9) % 256) as u8);
    }

    #[test]
    fn recv_window_clears() {
        let mut w = RecvWindow::new();
        w.push(1);
        w.push(2);
        w.clear();
        assert!(w.is_empty());
    }

    #[test]
    fn statistics_are_monotonic() {
        let s = Session::new();
        s.add_rx(5);
        s.add_rx(3);
        s.add_tx(2);
        assert_eq!(s.totals(), (8, 2));
    }
}
