//! GPRS bearer and TCP session lifecycle for the telemetry uplink.

use core::fmt::Write as _;

use embedded_hal::blocking::delay::DelayMs;
use heapless::String;

use super::link::{FieldSpec, Link, DEFAULT_TIMEOUT_MS};
use super::BatteryStatus;
use crate::gps::GpsTracker;
use crate::hal::{ByteChannel, Clock, FlagStore, HardReset};
use crate::telemetry::TelemetryPacket;
use crate::timer::Deadline;
use crate::{debug, error, info, warn, Error, DATA_MODE_KEY};

const UPLINK_POLL_MS: u32 = 10_000;
/// No successful send for this long while data mode is on forces a restart.
const WATCHDOG_WINDOW_MS: u32 = 60_000;
/// Bearer activation negotiates with the network.
const BEARER_OPEN_TIMEOUT_MS: u32 = 30_000;
const CONNECT_TIMEOUT_MS: u32 = 10_000;
const SHUTDOWN_TIMEOUT_MS: u32 = 5_000;
const SEND_CONFIRM_TIMEOUT_MS: u32 = 10_000;

#[derive(Clone, Copy, Debug)]
pub struct UplinkConfig {
    pub apn: &'static str,
    pub host: &'static str,
    pub port: u16,
}

/// Telemetry uplink: lazily opened TCP session over the GPRS bearer, gated
/// by the persisted data-mode flag and watched by a hard-reset watchdog.
pub struct Uplink<R> {
    config: UplinkConfig,
    reset: R,
    timer: Deadline,
    session_active: bool,
    last_activity_ms: u32,
}

impl<R: HardReset> Uplink<R> {
    pub fn new(config: UplinkConfig, reset: R, now_ms: u32) -> Self {
        Self {
            config,
            reset,
            timer: Deadline::start(now_ms, UPLINK_POLL_MS),
            session_active: false,
            last_activity_ms: now_ms,
        }
    }

    pub fn session_active(&self) -> bool {
        self.session_active
    }

    /// One uplink round, driven by the poll timer.
    ///
    /// With data mode off any leftover session and the bearer are released.
    /// With data mode on, a telemetry packet is sent if possible, and the
    /// watchdog fires regardless of this round's outcome.
    pub fn service<S, C, D, F>(
        &mut self,
        link: &mut Link<S, C, D>,
        store: &mut F,
        gps: &GpsTracker,
        battery: Option<BatteryStatus>,
    ) where
        S: ByteChannel,
        C: Clock,
        D: DelayMs<u32>,
        F: FlagStore,
    {
        if !self.timer.poll(link.now_ms()) {
            return;
        }

        if !store.load(DATA_MODE_KEY) {
            if self.session_active {
                info!("data mode disabled, releasing session and bearer");
                self.teardown(link);
                self.release_bearer(link);
            }
            return;
        }

        if let Err(err) = self.try_send(link, gps, battery) {
            warn!("uplink attempt failed: {}", err);
        }

        if link.now_ms().wrapping_sub(self.last_activity_ms) > WATCHDOG_WINDOW_MS {
            error!("no uplink activity within the watchdog window, restarting");
            self.reset.hard_reset();
            // The reset normally never returns; rearm so an implementation
            // that does return is not restarted again on every tick.
            self.last_activity_ms = link.now_ms();
        }
    }

    fn try_send<S, C, D>(
        &mut self,
        link: &mut Link<S, C, D>,
        gps: &GpsTracker,
        battery: Option<BatteryStatus>,
    ) -> Result<(), Error>
    where
        S: ByteChannel,
        C: Clock,
        D: DelayMs<u32>,
    {
        self.ensure_bearer(link)?;

        let fix = match gps.current() {
            Some(fix) => fix,
            None => {
                debug!("no fix to report, skipping uplink");
                return Ok(());
            }
        };
        let packet = TelemetryPacket::from_parts(fix, link.now_ms(), battery.unwrap_or_default());

        self.ensure_session(link)?;
        match self.transmit(link, &packet.encode()) {
            Ok(()) => {
                self.last_activity_ms = link.now_ms();
                debug!("telemetry sent");
                Ok(())
            }
            Err(err) => {
                // Session state is unknown after a half-finished send; tear
                // down so the next attempt reopens from scratch.
                warn!("send failed: {}", err);
                self.teardown(link);
                Err(Error::SessionFailure)
            }
        }
    }

    /// `AT+SAPBR=2,1` → `+SAPBR: 1,<status>,...`; status 1 means open.
    fn bearer_open<S, C, D>(&mut self, link: &mut Link<S, C, D>) -> Result<bool, Error>
    where
        S: ByteChannel,
        C: Clock,
        D: DelayMs<u32>,
    {
        let mut status = [0u8; 1];
        let mut specs = [FieldSpec::new(1, &mut status).until(b',')];
        link.command_and_capture("AT+SAPBR=2,1", b"+SAPBR", &mut specs, DEFAULT_TIMEOUT_MS)?;
        Ok(specs[0].bytes() == b"1")
    }

    fn ensure_bearer<S, C, D>(&mut self, link: &mut Link<S, C, D>) -> Result<(), Error>
    where
        S: ByteChannel,
        C: Clock,
        D: DelayMs<u32>,
    {
        if self.bearer_open(link)? {
            return Ok(());
        }

        info!("opening bearer, apn {=str}", self.config.apn);
        link.command("AT+SAPBR=3,1,\"Contype\",\"GPRS\"", DEFAULT_TIMEOUT_MS)?;

        let mut cmd: String<80> = String::new();
        write!(cmd, "AT+SAPBR=3,1,\"APN\",\"{}\"", self.config.apn)
            .map_err(|_| Error::FieldOverflow)?;
        link.command(&cmd, DEFAULT_TIMEOUT_MS)?;

        link.command("AT+SAPBR=1,1", BEARER_OPEN_TIMEOUT_MS)?;

        if !self.bearer_open(link)? {
            warn!("bearer did not come up");
            return Err(Error::BearerUnavailable);
        }
        Ok(())
    }

    fn ensure_session<S, C, D>(&mut self, link: &mut Link<S, C, D>) -> Result<(), Error>
    where
        S: ByteChannel,
        C: Clock,
        D: DelayMs<u32>,
    {
        if self.session_active {
            return Ok(());
        }

        let mut cmd: String<96> = String::new();
        write!(
            cmd,
            "AT+CIPSTART=\"TCP\",\"{}\",\"{}\"",
            self.config.host, self.config.port
        )
        .map_err(|_| Error::FieldOverflow)?;
        link.command_expect(&cmd, b"CONNECT OK", CONNECT_TIMEOUT_MS)?;

        self.session_active = true;
        info!("session open to {=str}", self.config.host);
        Ok(())
    }

    fn transmit<S, C, D>(&mut self, link: &mut Link<S, C, D>, payload: &[u8]) -> Result<(), Error>
    where
        S: ByteChannel,
        C: Clock,
        D: DelayMs<u32>,
    {
        link.announce_payload(payload.len() as u16)?;
        link.send_raw(payload);
        link.await_token(b"SEND", SEND_CONFIRM_TIMEOUT_MS)?;
        link.await_token(b"OK", DEFAULT_TIMEOUT_MS)?;
        Ok(())
    }

    fn teardown<S, C, D>(&mut self, link: &mut Link<S, C, D>)
    where
        S: ByteChannel,
        C: Clock,
        D: DelayMs<u32>,
    {
        if let Err(err) = link.command_expect("AT+CIPSHUT", b"SHUT OK", SHUTDOWN_TIMEOUT_MS) {
            warn!("session shutdown not confirmed: {}", err);
        }
        self.session_active = false;
    }

    fn release_bearer<S, C, D>(&mut self, link: &mut Link<S, C, D>)
    where
        S: ByteChannel,
        C: Clock,
        D: DelayMs<u32>,
    {
        if let Err(err) = link.command("AT+SAPBR=0,1", DEFAULT_TIMEOUT_MS) {
            warn!("bearer release not confirmed: {}", err);
        }
    }
}
