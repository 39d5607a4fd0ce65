//! GPS fix acquisition and ranking.
//!
//! During its slice of the shared channel the tracker pumps raw receiver
//! bytes into the external NMEA decoder and keeps the best solution seen in
//! that window; good recent fixes are ranked into a small quality history
//! that the LIST command and telemetry read back.

use embedded_hal::blocking::delay::DelayMs;

use crate::debug;
use crate::hal::{ByteChannel, Clock};
use crate::modem::link::Link;
use crate::timer::Deadline;

pub const HISTORY_DEPTH: usize = 5;

/// Sentinel the per-window best starts from; any valid solution beats it.
const WORST_HDOP: u16 = 9_999;
/// A window's best fix only enters the history while it is this fresh.
const MAX_REPORT_AGE_SECS: u16 = 10;
/// History entries older than this are evicted before each window.
const HISTORY_MAX_AGE_MS: u32 = 30 * 60 * 1_000;

/// One position sample with quality and motion attributes.
#[derive(Clone, Copy, Debug, PartialEq, defmt::Format)]
pub struct Fix {
    pub timestamp_ms: u32,
    pub latitude: f64,
    pub longitude: f64,
    /// Horizontal dilution of precision, ×100. Lower is better.
    pub hdop: u16,
    pub course_deg: f64,
    pub speed_mps: f64,
    pub satellites: u8,
}

impl Fix {
    pub fn age_secs(&self, now_ms: u32) -> u16 {
        (now_ms.wrapping_sub(self.timestamp_ms) / 1_000) as u16
    }

    const fn sentinel() -> Self {
        Self {
            timestamp_ms: 0,
            latitude: 0.0,
            longitude: 0.0,
            hdop: WORST_HDOP,
            course_deg: 0.0,
            speed_mps: 0.0,
            satellites: 0,
        }
    }
}

/// A complete solution reported by the external sentence decoder.
#[derive(Clone, Copy, Debug, defmt::Format)]
pub struct DecodedFix {
    pub latitude: f64,
    pub longitude: f64,
    /// Horizontal dilution of precision, ×100.
    pub hdop: u16,
    /// Milliseconds since this solution was decoded.
    pub age_ms: u32,
    pub course_deg: f64,
    pub speed_mps: f64,
    pub satellites: u8,
}

/// The external NMEA decoder: fed raw bytes, reports complete solutions.
/// `snapshot` returns `None` until both location and quality are valid.
pub trait FixDecoder {
    fn feed(&mut self, byte: u8);
    fn snapshot(&self) -> Option<DecodedFix>;
}

/// Fixed-capacity top-K ranking, hdop-sorted ascending with no gaps in the
/// occupied prefix.
#[derive(Default)]
struct FixHistory {
    slots: [Option<Fix>; HISTORY_DEPTH],
}

impl FixHistory {
    /// Insertion-sort a candidate in by quality. A candidate worse than a
    /// full board is dropped; otherwise the worst resident falls off the end.
    fn insert(&mut self, fix: Fix) {
        for i in 0..HISTORY_DEPTH {
            match &self.slots[i] {
                None => {
                    self.slots[i] = Some(fix);
                    return;
                }
                Some(resident) if resident.hdop > fix.hdop => {
                    for j in (i + 1..HISTORY_DEPTH).rev() {
                        self.slots[j] = self.slots[j - 1];
                    }
                    self.slots[i] = Some(fix);
                    return;
                }
                Some(_) => {}
            }
        }
    }

    fn prune(&mut self, now_ms: u32, max_age_ms: u32) {
        let mut i = 0;
        while i < HISTORY_DEPTH {
            let expired = matches!(
                self.slots[i],
                Some(fix) if now_ms.wrapping_sub(fix.timestamp_ms) > max_age_ms
            );
            if expired {
                self.remove(i);
            } else {
                i += 1;
            }
        }
    }

    fn remove(&mut self, index: usize) {
        for j in index..HISTORY_DEPTH - 1 {
            self.slots[j] = self.slots[j + 1];
        }
        self.slots[HISTORY_DEPTH - 1] = None;
    }

    fn get(&self, index: usize) -> Option<&Fix> {
        self.slots.get(index).and_then(|slot| slot.as_ref())
    }

    fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}

pub struct GpsTracker {
    current: Fix,
    has_fix: bool,
    history: FixHistory,
}

impl GpsTracker {
    pub fn new() -> Self {
        Self {
            current: Fix::sentinel(),
            has_fix: false,
            history: FixHistory::default(),
        }
    }

    /// Consume one time slice of the shared channel.
    ///
    /// Prunes the history, then pumps receiver bytes into the decoder for
    /// `budget_ms`, keeping the strictly best solution of the window. A valid
    /// best that is still fresh at the end of the window is ranked into the
    /// history.
    pub fn run_window<S, C, D, F>(
        &mut self,
        link: &mut Link<S, C, D>,
        decoder: &mut F,
        budget_ms: u32,
    ) where
        S: ByteChannel,
        C: Clock,
        D: DelayMs<u32>,
        F: FixDecoder,
    {
        self.history.prune(link.now_ms(), HISTORY_MAX_AGE_MS);

        self.has_fix = false;
        self.current.hdop = WORST_HDOP;

        let mut window = Deadline::start(link.now_ms(), budget_ms);
        loop {
            while let Some(byte) = link.poll_byte() {
                decoder.feed(byte);
            }

            if let Some(decoded) = decoder.snapshot() {
                if decoded.hdop < self.current.hdop {
                    self.current = Fix {
                        timestamp_ms: link.now_ms().wrapping_sub(decoded.age_ms),
                        latitude: decoded.latitude,
                        longitude: decoded.longitude,
                        hdop: decoded.hdop,
                        course_deg: decoded.course_deg,
                        speed_mps: decoded.speed_mps,
                        satellites: decoded.satellites,
                    };
                    self.has_fix = true;
                }
            }

            if window.poll(link.now_ms()) {
                break;
            }
        }

        if self.has_fix && self.current.age_secs(link.now_ms()) < MAX_REPORT_AGE_SECS {
            debug!("ranking window best, hdop {=u16}", self.current.hdop);
            self.history.insert(self.current);
        }
    }

    /// The best fix of the last window, if one was found.
    pub fn current(&self) -> Option<&Fix> {
        if self.has_fix {
            Some(&self.current)
        } else {
            None
        }
    }

    /// Indexed read of the quality history, best first.
    pub fn history(&self, index: usize) -> Option<&Fix> {
        self.history.get(index)
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }
}

impl Default for GpsTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(target_os = "none")))]
impl GpsTracker {
    pub(crate) fn force_fix(&mut self, fix: Fix) {
        self.current = fix;
        self.has_fix = true;
    }
}
