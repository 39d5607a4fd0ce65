//! Hardware seams the tracker core depends on.
//!
//! The core never touches a peripheral directly: the scheduling loop supplies
//! implementations of these traits (plus `embedded_hal`'s `InputPin` for the
//! ring-indicator line and `DelayMs` for settle delays) and the core stays
//! target-agnostic.

use core::convert::Infallible;

pub mod mock;

/// Duplex byte channel, typically a UART.
///
/// `read` is non-blocking: `WouldBlock` means nothing is pending. All
/// bounded waiting lives above this trait, in the protocol engine.
pub trait ByteChannel {
    fn read(&mut self) -> nb::Result<u8, Infallible>;
    fn write(&mut self, bytes: &[u8]);
}

/// Monotonic millisecond clock. Wraps at 2^32 ms (about 49.7 days).
pub trait Clock {
    fn now_ms(&self) -> u32;
}

/// Persistent boolean store (EEPROM, flash page, backup register).
pub trait FlagStore {
    fn load(&mut self, key: u16) -> bool;
    fn store(&mut self, key: u16, value: bool);
}

/// A hard reset line: one implementation pulses the modem enable pin, another
/// restarts the whole MCU (the uplink watchdog path).
pub trait HardReset {
    fn hard_reset(&mut self);
}

impl<T: ByteChannel> ByteChannel for &mut T {
    fn read(&mut self) -> nb::Result<u8, Infallible> {
        T::read(self)
    }

    fn write(&mut self, bytes: &[u8]) {
        T::write(self, bytes)
    }
}

impl<T: Clock> Clock for &T {
    fn now_ms(&self) -> u32 {
        T::now_ms(self)
    }
}

impl<T: FlagStore> FlagStore for &mut T {
    fn load(&mut self, key: u16) -> bool {
        T::load(self, key)
    }

    fn store(&mut self, key: u16, value: bool) {
        T::store(self, key, value)
    }
}

impl<T: HardReset> HardReset for &mut T {
    fn hard_reset(&mut self) {
        T::hard_reset(self)
    }
}
