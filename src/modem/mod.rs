//! SIM800-class modem driver: device bring-up, call/SMS/battery servicing.

pub mod link;
pub mod sms;
pub mod uplink;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::digital::v2::InputPin;

use self::link::{FieldSpec, Link, DEFAULT_TIMEOUT_MS, DRAIN_SETTLE_MS};
use self::sms::Dispatch;
use crate::hal::{ByteChannel, Clock, HardReset};
use crate::timer::Deadline;
use crate::{debug, error, info, warn, Error};

const SETUP_ATTEMPTS: u32 = 3;
/// The module needs a moment after a reset pulse before it answers.
const RESET_SETTLE_MS: u32 = 2_000;
/// Network registration after `AT+CFUN=1` takes seconds.
const FUNC_SETTLE_MS: u32 = 5_000;
/// Purging stored messages is slow on a full SIM.
const PURGE_TIMEOUT_MS: u32 = 10_000;
const BATTERY_POLL_MS: u32 = 5_000;
const SMS_POLL_MS: u32 = 5_000;
const RING_CLEAR_TIMEOUT_MS: u32 = 5_000;
const CALLER_ID_LEN: usize = 19;

#[derive(Clone, Copy, Debug)]
pub struct ModemConfig {
    pub disable_echo: bool,
    /// Log outbound SMS instead of transmitting them (bench bring-up).
    pub sms_dry_run: bool,
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            disable_echo: true,
            sms_dry_run: false,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, defmt::Format)]
pub struct BatteryStatus {
    pub percent: u8,
    pub voltage: f64,
}

/// The modem device. Owns the protocol engine plus the dispatcher state;
/// constructed only once the setup sequence has succeeded.
pub struct Modem<S, C, D, P> {
    link: Link<S, C, D>,
    ring: P,
    in_call: bool,
    battery: Option<BatteryStatus>,
    battery_timer: Deadline,
    sms_timer: Deadline,
}

impl<S, C, D, P> Modem<S, C, D, P>
where
    S: ByteChannel,
    C: Clock,
    D: DelayMs<u32>,
    P: InputPin,
{
    /// Bring the module up: reset pulse, settle, then the setup exchanges.
    /// Up to three attempts; afterwards the device is unusable and the caller
    /// must escalate.
    pub fn init(
        mut link: Link<S, C, D>,
        reset: &mut impl HardReset,
        ring: P,
        config: ModemConfig,
    ) -> Result<Self, Error> {
        link.set_sms_dry_run(config.sms_dry_run);

        let mut attempt = 0;
        loop {
            attempt += 1;
            info!("modem setup attempt {=u32}", attempt);
            reset.hard_reset();
            link.delay_ms(RESET_SETTLE_MS);

            match first_setup(&mut link, &config) {
                Ok(()) => break,
                Err(err) => {
                    warn!("setup attempt {=u32} failed: {}", attempt, err);
                    if attempt >= SETUP_ATTEMPTS {
                        error!("modem did not come up");
                        return Err(Error::FatalInit);
                    }
                }
            }
        }

        info!("modem ready");
        let now = link.now_ms();
        Ok(Self {
            link,
            ring,
            in_call: false,
            battery: None,
            battery_timer: Deadline::start(now, BATTERY_POLL_MS),
            sms_timer: Deadline::start(now, SMS_POLL_MS),
        })
    }

    /// Service one bounded slice of modem work: call detection, then the
    /// battery and SMS timers, draining the channel between rounds.
    pub fn service<H>(&mut self, handler: &mut H, budget_ms: u32)
    where
        H: Dispatch<S, C, D>,
    {
        let mut slice = Deadline::start(self.link.now_ms(), budget_ms);
        loop {
            self.poll_call(handler);

            if self.battery_timer.poll(self.link.now_ms()) {
                match self.query_battery() {
                    Ok(status) => self.battery = Some(status),
                    Err(err) => {
                        warn!("battery query failed: {}", err);
                    }
                }
            }

            if self.sms_timer.poll(self.link.now_ms()) {
                if let Err(err) = sms::poll_inbox(&mut self.link, handler) {
                    debug!("inbox poll ended: {}", err);
                }
            }

            self.link.drain(DRAIN_SETTLE_MS);

            if slice.poll(self.link.now_ms()) {
                break;
            }
        }
    }

    /// Latest battery reading, if one has succeeded yet.
    pub fn battery(&self) -> Option<BatteryStatus> {
        self.battery
    }

    /// The protocol engine, for the GPS slice and the uplink session.
    pub fn link_mut(&mut self) -> &mut Link<S, C, D> {
        &mut self.link
    }

    /// `AT+CBC` → charge state, percent, millivolts.
    pub fn query_battery(&mut self) -> Result<BatteryStatus, Error> {
        let mut percent = [0u8; 2];
        let mut millivolts = [0u8; 4];
        let mut specs = [
            FieldSpec::new(1, &mut percent).until(b','),
            FieldSpec::new(2, &mut millivolts),
        ];
        self.link
            .command_and_capture("AT+CBC", b"+CBC", &mut specs, DEFAULT_TIMEOUT_MS)?;

        let percent =
            lexical_core::parse::<u8>(specs[0].bytes()).map_err(|_| Error::UnexpectedToken)?;
        let millivolts =
            lexical_core::parse::<u16>(specs[1].bytes()).map_err(|_| Error::UnexpectedToken)?;

        Ok(BatteryStatus {
            percent,
            voltage: f64::from(millivolts) / 1_000.0,
        })
    }

    /// Sample the ring indicator; on a new call, capture the caller id, hang
    /// up unconditionally, and only then dispatch the call.
    fn poll_call<H>(&mut self, handler: &mut H)
    where
        H: Dispatch<S, C, D>,
    {
        let ringing = self.ring.is_low().unwrap_or(false);
        if !ringing {
            self.in_call = false;
            return;
        }
        if self.in_call {
            return;
        }
        self.in_call = true;
        info!("incoming call");

        let mut caller = [0u8; CALLER_ID_LEN];
        let captured = self.query_caller_id(&mut caller);
        self.hangup();

        match captured {
            Ok(len) => {
                if let Ok(from) = core::str::from_utf8(&caller[..len]) {
                    handler.handle_call(&mut self.link, from);
                }
            }
            Err(err) => {
                warn!("caller id failed: {}", err);
            }
        }
    }

    /// `AT+CLCC` → the quoted number in field 5.
    fn query_caller_id(&mut self, out: &mut [u8]) -> Result<usize, Error> {
        let mut specs = [FieldSpec::new(5, out).quoted()];
        self.link
            .command_and_capture("AT+CLCC", b"+CLCC", &mut specs, DEFAULT_TIMEOUT_MS)?;
        Ok(specs[0].bytes().len())
    }

    pub fn hangup(&mut self) {
        self.link.drain(DRAIN_SETTLE_MS);
        if let Err(err) = self.link.command("ATH", DEFAULT_TIMEOUT_MS) {
            warn!("hangup not confirmed: {}", err);
        }
        self.link.drain(DRAIN_SETTLE_MS);

        let mut timeout = Deadline::start(self.link.now_ms(), RING_CLEAR_TIMEOUT_MS);
        while self.ring.is_low().unwrap_or(false) {
            if timeout.poll(self.link.now_ms()) {
                warn!("ring line did not clear");
                break;
            }
        }
        info!("hung up");
    }
}

fn first_setup<S, C, D>(link: &mut Link<S, C, D>, config: &ModemConfig) -> Result<(), Error>
where
    S: ByteChannel,
    C: Clock,
    D: DelayMs<u32>,
{
    // Liveness probe first: everything else is pointless if nobody answers.
    link.command("AT", DEFAULT_TIMEOUT_MS)?;
    link.drain(DRAIN_SETTLE_MS);

    if config.disable_echo {
        link.command("ATE0", DEFAULT_TIMEOUT_MS)?;
    }

    link.command("AT+CFUN=1", DEFAULT_TIMEOUT_MS)?;
    link.delay_ms(FUNC_SETTLE_MS);

    // Purge stored messages so old commands are not replayed.
    link.command("AT+CMGD=1,4", PURGE_TIMEOUT_MS)?;

    Ok(())
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::hal::mock::{MockChannel, MockClock, MockDelay, MockResetLine, MockRing};

    struct Recorder {
        sms: Vec<(String, String)>,
        calls: Vec<String>,
    }

    impl Recorder {
        fn new() -> Self {
            Self {
                sms: Vec::new(),
                calls: Vec::new(),
            }
        }
    }

    impl<S, C, D> Dispatch<S, C, D> for Recorder
    where
        S: ByteChannel,
        C: Clock,
        D: DelayMs<u32>,
    {
        fn handle_sms(&mut self, _link: &mut Link<S, C, D>, from: &str, body: &str) -> bool {
            self.sms.push((from.into(), body.into()));
            true
        }

        fn handle_call(&mut self, _link: &mut Link<S, C, D>, from: &str) -> bool {
            self.calls.push(from.into());
            true
        }
    }

    fn script_setup(chan: &mut MockChannel) {
        chan.push_reply(b"\r\nOK\r\n"); // AT
        chan.push_reply(b"\r\nOK\r\n"); // ATE0
        chan.push_reply(b"\r\nOK\r\n"); // AT+CFUN=1
        chan.push_reply(b"\r\nOK\r\n"); // AT+CMGD=1,4
    }

    #[test]
    fn init_runs_the_setup_sequence_once() {
        let mut chan = MockChannel::new();
        script_setup(&mut chan);
        let clock = MockClock::new(1);
        let ring = MockRing::idle();
        let mut reset = MockResetLine::default();

        let link = Link::new(&mut chan, &clock, MockDelay::default());
        let modem = Modem::init(link, &mut reset, &ring, ModemConfig::default());
        assert!(modem.is_ok());
        assert_eq!(reset.pulses.get(), 1);

        let sent = core::str::from_utf8(chan.sent()).unwrap();
        assert!(sent.contains("AT\r\n"));
        assert!(sent.contains("ATE0\r\n"));
        assert!(sent.contains("AT+CFUN=1\r\n"));
        assert!(sent.contains("AT+CMGD=1,4\r\n"));
    }

    #[test]
    fn init_keeps_echo_when_configured() {
        let mut chan = MockChannel::new();
        chan.push_reply(b"\r\nOK\r\n"); // AT
        chan.push_reply(b"\r\nOK\r\n"); // AT+CFUN=1
        chan.push_reply(b"\r\nOK\r\n"); // AT+CMGD=1,4
        let clock = MockClock::new(1);
        let ring = MockRing::idle();
        let mut reset = MockResetLine::default();

        let config = ModemConfig {
            disable_echo: false,
            ..ModemConfig::default()
        };
        let link = Link::new(&mut chan, &clock, MockDelay::default());
        assert!(Modem::init(link, &mut reset, &ring, config).is_ok());
        assert!(!core::str::from_utf8(chan.sent()).unwrap().contains("ATE0"));
    }

    #[test]
    fn init_gives_up_after_three_attempts() {
        let mut chan = MockChannel::new();
        let clock = MockClock::new(1);
        let ring = MockRing::idle();
        let mut reset = MockResetLine::default();

        let link = Link::new(&mut chan, &clock, MockDelay::default());
        let result = Modem::init(link, &mut reset, &ring, ModemConfig::default());
        assert_eq!(result.err(), Some(Error::FatalInit));
        assert_eq!(reset.pulses.get(), 3);
    }

    #[test]
    fn init_retries_after_a_failed_attempt() {
        let mut chan = MockChannel::new();
        chan.push_silence(); // AT, attempt 1: no answer
        script_setup(&mut chan); // attempt 2 succeeds
        let clock = MockClock::new(1);
        let ring = MockRing::idle();
        let mut reset = MockResetLine::default();

        let link = Link::new(&mut chan, &clock, MockDelay::default());
        let modem = Modem::init(link, &mut reset, &ring, ModemConfig::default());
        assert!(modem.is_ok());
        assert_eq!(reset.pulses.get(), 2);
    }

    #[test]
    fn battery_percent_and_voltage_are_parsed() {
        let mut chan = MockChannel::new();
        script_setup(&mut chan);
        chan.push_reply(b"\r\n+CBC: 0,73,3950\r\n\r\nOK\r\n");
        let clock = MockClock::new(1);
        let ring = MockRing::idle();
        let mut reset = MockResetLine::default();

        let link = Link::new(&mut chan, &clock, MockDelay::default());
        let mut modem = Modem::init(link, &mut reset, &ring, ModemConfig::default()).unwrap();

        let status = modem.query_battery().unwrap();
        assert_eq!(status.percent, 73);
        assert!((status.voltage - 3.95).abs() < 1e-9);
    }

    #[test]
    fn malformed_battery_reply_is_an_error() {
        let mut chan = MockChannel::new();
        script_setup(&mut chan);
        chan.push_reply(b"\r\n+CBC: 0,,\r\n\r\nOK\r\n");
        let clock = MockClock::new(1);
        let ring = MockRing::idle();
        let mut reset = MockResetLine::default();

        let link = Link::new(&mut chan, &clock, MockDelay::default());
        let mut modem = Modem::init(link, &mut reset, &ring, ModemConfig::default()).unwrap();

        assert_eq!(modem.query_battery(), Err(Error::UnexpectedToken));
    }

    #[test]
    fn incoming_call_is_hung_up_and_dispatched() {
        let mut chan = MockChannel::new();
        script_setup(&mut chan);
        chan.push_reply(b"\r\n+CLCC: 1,1,4,0,0,\"+4917012345\",145\r\n\r\nOK\r\n");
        chan.push_reply(b"\r\nOK\r\n"); // ATH
        let clock = MockClock::new(1);
        let ring = MockRing::idle();
        let mut reset = MockResetLine::default();

        let link = Link::new(&mut chan, &clock, MockDelay::default());
        let mut modem = Modem::init(link, &mut reset, &ring, ModemConfig::default()).unwrap();

        ring.low.set(true);
        let mut handler = Recorder::new();
        modem.poll_call(&mut handler);

        assert_eq!(handler.calls, ["+4917012345"]);
        assert!(core::str::from_utf8(chan.sent()).unwrap().contains("ATH\r\n"));
    }

    #[test]
    fn call_without_caller_id_is_hung_up_but_not_dispatched() {
        let mut chan = MockChannel::new();
        script_setup(&mut chan);
        chan.push_silence(); // AT+CLCC: no answer
        chan.push_reply(b"\r\nOK\r\n"); // ATH
        let clock = MockClock::new(1);
        let ring = MockRing::idle();
        let mut reset = MockResetLine::default();

        let link = Link::new(&mut chan, &clock, MockDelay::default());
        let mut modem = Modem::init(link, &mut reset, &ring, ModemConfig::default()).unwrap();

        ring.low.set(true);
        let mut handler = Recorder::new();
        modem.poll_call(&mut handler);

        assert!(handler.calls.is_empty());
        assert!(core::str::from_utf8(chan.sent()).unwrap().contains("ATH\r\n"));
    }

    #[test]
    fn stuck_ring_line_does_not_redispatch() {
        let mut chan = MockChannel::new();
        script_setup(&mut chan);
        chan.push_reply(b"\r\n+CLCC: 1,1,4,0,0,\"+4917012345\",145\r\n\r\nOK\r\n");
        chan.push_reply(b"\r\nOK\r\n"); // ATH
        let clock = MockClock::new(1);
        let ring = MockRing::idle();
        let mut reset = MockResetLine::default();

        let link = Link::new(&mut chan, &clock, MockDelay::default());
        let mut modem = Modem::init(link, &mut reset, &ring, ModemConfig::default()).unwrap();

        ring.low.set(true);
        let mut handler = Recorder::new();
        modem.poll_call(&mut handler);
        modem.poll_call(&mut handler); // line still low: same call, no repeat

        assert_eq!(handler.calls.len(), 1);
    }

    #[test]
    fn service_polls_battery_on_its_timer() {
        let mut chan = MockChannel::new();
        script_setup(&mut chan);
        chan.push_reply(b"\r\n+CBC: 0,73,3950\r\n\r\nOK\r\n"); // AT+CBC
        chan.push_silence(); // AT+CMGF=1 (sms poll, times out)
        let clock = MockClock::new(1);
        let ring = MockRing::idle();
        let mut reset = MockResetLine::default();

        let link = Link::new(&mut chan, &clock, MockDelay::default());
        let mut modem = Modem::init(link, &mut reset, &ring, ModemConfig::default()).unwrap();

        clock.advance(BATTERY_POLL_MS + 1);
        let mut handler = Recorder::new();
        modem.service(&mut handler, 50);

        let status = modem.battery().unwrap();
        assert_eq!(status.percent, 73);
        assert!(core::str::from_utf8(chan.sent()).unwrap().contains("AT+CBC\r\n"));
    }
}
