#![cfg_attr(not(test), no_std)]

//! Core logic for a standalone GSM/GPS location tracker.
//!
//! The tracker shares one half-duplex serial channel between a GPS receiver
//! and a SIM800-class modem, time-division multiplexed by the (external)
//! scheduling loop: each cycle the [`gps::GpsTracker`] consumes a slice of the
//! channel to hunt for a fix, then the channel is handed to the
//! [`modem::Modem`] to service calls, SMS, battery and the data uplink.
//!
//! All hardware access goes through the seams in [`hal`]; nothing in this
//! crate touches a peripheral directly, so the whole crate runs under the
//! host test harness against [`hal::mock`].

pub mod commands;
pub mod gps;
pub mod hal;
mod log_macros;
pub mod modem;
pub mod telemetry;
pub mod timer;

pub use commands::{CommandRouter, SubscriberList};
pub use gps::{DecodedFix, Fix, FixDecoder, GpsTracker, HISTORY_DEPTH};
pub use modem::link::{FieldEnd, FieldSpec, Link, DEFAULT_TIMEOUT_MS};
pub use modem::sms::Dispatch;
pub use modem::uplink::{Uplink, UplinkConfig};
pub use modem::{BatteryStatus, Modem, ModemConfig};
pub use telemetry::TelemetryPacket;
pub use timer::Deadline;

use defmt::Format;

/// Store key of the data-uplink-enabled flag.
pub const DATA_MODE_KEY: u16 = 0x10;

#[derive(Format, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The channel produced no usable byte within the allowed window.
    ChannelTimeout,
    /// The response did not match the expected token or prefix.
    UnexpectedToken,
    /// A field did not fit its destination buffer.
    FieldOverflow,
    /// The packet bearer could not be confirmed open.
    BearerUnavailable,
    /// The TCP session failed mid-exchange and was torn down.
    SessionFailure,
    /// Three consecutive modem setup attempts failed.
    FatalInit,
}
