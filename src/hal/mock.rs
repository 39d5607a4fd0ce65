//! Scripted test doubles for the [`hal`](crate::hal) seams.
//!
//! [`MockChannel`] behaves like a modem on the wire: replies are queued up
//! front and each one is released into the read direction when the next
//! command line (terminated by `\r\n`) goes out. Raw writes (SMS terminator,
//! uplink payload) release nothing, matching a real modem's timing closely
//! enough for the protocol tests.

use core::cell::Cell;
use core::convert::Infallible;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::digital::v2::InputPin;
use heapless::{Deque, Vec};

use super::{ByteChannel, Clock, FlagStore, HardReset};
use crate::DATA_MODE_KEY;

type Reply = Vec<u8, 512>;

pub struct MockChannel {
    rx: Deque<u8, 1024>,
    replies: Deque<Reply, 16>,
    tx: Vec<u8, 2048>,
}

impl MockChannel {
    pub fn new() -> Self {
        Self {
            rx: Deque::new(),
            replies: Deque::new(),
            tx: Vec::new(),
        }
    }

    /// Queue the reply released by the next outgoing command line.
    pub fn push_reply(&mut self, bytes: &[u8]) {
        let mut reply = Reply::new();
        assert!(reply.extend_from_slice(bytes).is_ok(), "reply too long");
        assert!(self.replies.push_back(reply).is_ok(), "too many replies");
    }

    /// The next outgoing command line gets no answer (timeout path).
    pub fn push_silence(&mut self) {
        self.push_reply(b"");
    }

    /// Make bytes readable immediately, without waiting for a command.
    pub fn queue_rx(&mut self, bytes: &[u8]) {
        for &b in bytes {
            assert!(self.rx.push_back(b).is_ok(), "rx queue full");
        }
    }

    /// Everything written to the channel so far.
    pub fn sent(&self) -> &[u8] {
        &self.tx
    }

    pub fn clear_sent(&mut self) {
        self.tx.clear();
    }
}

impl Default for MockChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteChannel for MockChannel {
    fn read(&mut self) -> nb::Result<u8, Infallible> {
        self.rx.pop_front().ok_or(nb::Error::WouldBlock)
    }

    fn write(&mut self, bytes: &[u8]) {
        assert!(self.tx.extend_from_slice(bytes).is_ok(), "tx capture full");
        if bytes == b"\r\n" {
            if let Some(reply) = self.replies.pop_front() {
                for &b in &reply {
                    assert!(self.rx.push_back(b).is_ok(), "rx queue full");
                }
            }
        }
    }
}

/// Clock that steps forward on every read, so timeout loops terminate.
pub struct MockClock {
    now: Cell<u32>,
    step: u32,
}

impl MockClock {
    pub fn new(step: u32) -> Self {
        Self {
            now: Cell::new(0),
            step,
        }
    }

    pub fn set(&self, ms: u32) {
        self.now.set(ms);
    }

    pub fn advance(&self, ms: u32) {
        self.now.set(self.now.get().wrapping_add(ms));
    }
}

impl Clock for MockClock {
    fn now_ms(&self) -> u32 {
        let now = self.now.get();
        self.now.set(now.wrapping_add(self.step));
        now
    }
}

#[derive(Default)]
pub struct MockDelay {
    pub total_ms: u32,
}

impl DelayMs<u32> for MockDelay {
    fn delay_ms(&mut self, ms: u32) {
        self.total_ms = self.total_ms.wrapping_add(ms);
    }
}

/// Ring-indicator line, active low.
pub struct MockRing {
    pub low: Cell<bool>,
}

impl MockRing {
    pub fn idle() -> Self {
        Self {
            low: Cell::new(false),
        }
    }
}

impl InputPin for &MockRing {
    type Error = Infallible;

    fn is_high(&self) -> Result<bool, Self::Error> {
        Ok(!self.low.get())
    }

    fn is_low(&self) -> Result<bool, Self::Error> {
        Ok(self.low.get())
    }
}

#[derive(Default)]
pub struct MockResetLine {
    pub pulses: Cell<u32>,
}

impl HardReset for MockResetLine {
    fn hard_reset(&mut self) {
        self.pulses.set(self.pulses.get() + 1);
    }
}

impl HardReset for &MockResetLine {
    fn hard_reset(&mut self) {
        self.pulses.set(self.pulses.get() + 1);
    }
}

/// Flag store holding only the data-mode flag.
#[derive(Default)]
pub struct MockStore {
    pub data_mode: bool,
}

impl FlagStore for MockStore {
    fn load(&mut self, key: u16) -> bool {
        key == DATA_MODE_KEY && self.data_mode
    }

    fn store(&mut self, key: u16, value: bool) {
        if key == DATA_MODE_KEY {
            self.data_mode = value;
        }
    }
}
