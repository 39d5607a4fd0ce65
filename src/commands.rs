//! SMS command routing and reply formatting.
//!
//! The router is rebuilt each cycle as a view over the long-lived tracker
//! state and handed to the modem as its [`Dispatch`] capability. Commands are
//! already uppercased by the dispatcher.

use core::fmt::Write as _;

use embedded_hal::blocking::delay::DelayMs;
use heapless::{String, Vec};

use crate::gps::{GpsTracker, HISTORY_DEPTH};
use crate::hal::{ByteChannel, Clock};
use crate::modem::link::Link;
use crate::modem::sms::Dispatch;
use crate::modem::BatteryStatus;
use crate::{debug, info, warn, Error};

pub const MAX_SUBSCRIBERS: usize = 4;
const MAX_PHONE_LEN: usize = 29;
/// One text-mode SMS.
const REPLY_LEN: usize = 160;

type Phone = String<MAX_PHONE_LEN>;

/// Bounded list of periodic-report recipients.
#[derive(Default)]
pub struct SubscriberList {
    entries: Vec<Phone, MAX_SUBSCRIBERS>,
}

impl SubscriberList {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if the number is on the list afterwards.
    pub fn add(&mut self, number: &str) -> bool {
        if self.entries.iter().any(|entry| entry.as_str() == number) {
            return true;
        }
        let mut entry = Phone::new();
        if entry.push_str(number).is_err() {
            return false;
        }
        self.entries.push(entry).is_ok()
    }

    /// True if the number was on the list.
    pub fn remove(&mut self, number: &str) -> bool {
        match self
            .entries
            .iter()
            .position(|entry| entry.as_str() == number)
        {
            Some(index) => {
                self.entries.swap_remove(index);
                true
            }
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Per-cycle view routing inbound commands and calls to their replies.
pub struct CommandRouter<'a> {
    gps: &'a GpsTracker,
    battery: Option<BatteryStatus>,
    subscribers: &'a mut SubscriberList,
}

impl<'a> CommandRouter<'a> {
    pub fn new(
        gps: &'a GpsTracker,
        battery: Option<BatteryStatus>,
        subscribers: &'a mut SubscriberList,
    ) -> Self {
        Self {
            gps,
            battery,
            subscribers,
        }
    }

    /// Position report to every subscriber; the scheduling loop drives this
    /// on its own timer.
    pub fn broadcast_position<S, C, D>(&self, link: &mut Link<S, C, D>)
    where
        S: ByteChannel,
        C: Clock,
        D: DelayMs<u32>,
    {
        for number in self.subscribers.iter() {
            if let Err(err) = self.send_position(link, number) {
                warn!("report to {=str} failed: {}", number, err);
            }
        }
    }

    fn send_position<S, C, D>(&self, link: &mut Link<S, C, D>, to: &str) -> Result<(), Error>
    where
        S: ByteChannel,
        C: Clock,
        D: DelayMs<u32>,
    {
        let mut reply: String<REPLY_LEN> = String::new();
        match self.gps.current() {
            Some(fix) => write!(
                reply,
                "maps.google.com/?q={:.6}+{:.6}\nHDOP: {:.2}\nAge: {}\n",
                fix.latitude,
                fix.longitude,
                f64::from(fix.hdop) / 100.0,
                fix.age_secs(link.now_ms()),
            ),
            None => reply.push_str("No GPS fix\n").map_err(|_| core::fmt::Error),
        }
        .map_err(|_| Error::FieldOverflow)?;

        let battery = self.battery.unwrap_or_default();
        write!(reply, "Bat: {}% ({:.2}V)\n", battery.percent, battery.voltage)
            .map_err(|_| Error::FieldOverflow)?;

        link.send_sms(to, &reply)
    }

    fn send_history<S, C, D>(&self, link: &mut Link<S, C, D>, to: &str) -> Result<(), Error>
    where
        S: ByteChannel,
        C: Clock,
        D: DelayMs<u32>,
    {
        let mut reply: String<REPLY_LEN> = String::new();
        for index in 0..HISTORY_DEPTH {
            let fix = match self.gps.history(index) {
                Some(fix) => fix,
                None => break,
            };
            let mut line: String<40> = String::new();
            write!(
                line,
                "{:.6},{:.6},{:.2},{}\n",
                fix.latitude,
                fix.longitude,
                f64::from(fix.hdop) / 100.0,
                fix.age_secs(link.now_ms()),
            )
            .map_err(|_| Error::FieldOverflow)?;

            if reply.push_str(&line).is_err() {
                debug!("history reply full after {=usize} lines", index);
                break;
            }
        }
        link.send_sms(to, &reply)
    }

    fn subscribe<S, C, D>(&mut self, link: &mut Link<S, C, D>, from: &str) -> Result<(), Error>
    where
        S: ByteChannel,
        C: Clock,
        D: DelayMs<u32>,
    {
        if self.subscribers.add(from) {
            info!("subscribed {=str}", from);
            link.send_sms(from, "Subscribed!")
        } else {
            warn!("subscriber list full");
            link.send_sms(from, "Subscriber list full")
        }
    }

    fn unsubscribe<S, C, D>(&mut self, link: &mut Link<S, C, D>, from: &str) -> Result<(), Error>
    where
        S: ByteChannel,
        C: Clock,
        D: DelayMs<u32>,
    {
        if self.subscribers.remove(from) {
            info!("unsubscribed {=str}", from);
            link.send_sms(from, "Stopped.")
        } else {
            link.send_sms(from, "Not subscribed")
        }
    }
}

impl<'a, S, C, D> Dispatch<S, C, D> for CommandRouter<'a>
where
    S: ByteChannel,
    C: Clock,
    D: DelayMs<u32>,
{
    fn handle_sms(&mut self, link: &mut Link<S, C, D>, from: &str, body: &str) -> bool {
        match body.trim() {
            "STATUS" => self.send_position(link, from).is_ok(),
            "LIST" => self.send_history(link, from).is_ok(),
            "SUBSCRIBE" => self.subscribe(link, from).is_ok(),
            "STOP" => self.unsubscribe(link, from).is_ok(),
            other => {
                debug!("unknown command {=str}", other);
                false
            }
        }
    }

    fn handle_call(&mut self, link: &mut Link<S, C, D>, from: &str) -> bool {
        self.send_position(link, from).is_ok()
    }
}
