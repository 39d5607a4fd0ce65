//! Byte-level protocol engine for the modem channel.
//!
//! Every blocking wait here is bounded by an explicit timeout and returns an
//! error instead of hanging; the half-duplex channel is only ever driven by
//! one caller at a time (the scheduling loop hands it between the GPS slice
//! and the modem slice).

use core::fmt::Write as _;

use embedded_hal::blocking::delay::DelayMs;
use heapless::String;
use lexical_core::FormattedSize;

use crate::hal::{ByteChannel, Clock};
use crate::timer::Deadline;
use crate::{debug, info, trace, warn, Error};

pub const DEFAULT_TIMEOUT_MS: u32 = 1_000;

/// Settle time before discarding whatever the modem is still sending.
pub(crate) const DRAIN_SETTLE_MS: u32 = 500;
/// The `>` body prompt can take a while on a busy modem.
const SMS_PROMPT_TIMEOUT_MS: u32 = 3_000;
/// Ctrl-Z, ends an SMS body.
const SMS_TERMINATOR: u8 = 0x1A;

/// How a field read ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format)]
pub enum FieldEnd {
    /// The end delimiter was seen (and consumed).
    Delimiter,
    /// The destination buffer filled up first.
    Capacity,
}

/// One field to pull out of a comma-delimited response line.
pub struct FieldSpec<'a> {
    index: u8,
    out: &'a mut [u8],
    start_delim: Option<u8>,
    end_delim: u8,
    written: usize,
}

impl<'a> FieldSpec<'a> {
    /// Field at `index`, read until carriage return or until `out` is full.
    pub fn new(index: u8, out: &'a mut [u8]) -> Self {
        Self {
            index,
            out,
            start_delim: None,
            end_delim: b'\r',
            written: 0,
        }
    }

    /// Stop at `delim` instead of carriage return.
    pub fn until(mut self, delim: u8) -> Self {
        self.end_delim = delim;
        self
    }

    /// The field value is wrapped in double quotes.
    pub fn quoted(mut self) -> Self {
        self.start_delim = Some(b'"');
        self.end_delim = b'"';
        self
    }

    /// Bytes captured by the last extraction.
    pub fn bytes(&self) -> &[u8] {
        &self.out[..self.written]
    }
}

/// The protocol engine. Owns the shared channel, the clock and a delay
/// provider; everything above it (device setup, SMS, uplink) is expressed in
/// terms of these primitives.
pub struct Link<S, C, D> {
    chan: S,
    clock: C,
    delay: D,
    sms_dry_run: bool,
}

impl<S, C, D> Link<S, C, D>
where
    S: ByteChannel,
    C: Clock,
    D: DelayMs<u32>,
{
    pub fn new(chan: S, clock: C, delay: D) -> Self {
        Self {
            chan,
            clock,
            delay,
            sms_dry_run: false,
        }
    }

    /// Log outbound SMS instead of transmitting them (bench bring-up).
    pub fn set_sms_dry_run(&mut self, dry_run: bool) {
        self.sms_dry_run = dry_run;
    }

    pub fn now_ms(&self) -> u32 {
        self.clock.now_ms()
    }

    pub fn delay_ms(&mut self, ms: u32) {
        self.delay.delay_ms(ms);
    }

    /// Non-blocking read of the next pending byte.
    pub fn poll_byte(&mut self) -> Option<u8> {
        match self.chan.read() {
            Ok(byte) => {
                #[cfg(feature = "rtt-print-traffic")]
                rtt_target::rprint!("{}", byte as char);

                Some(byte)
            }
            Err(nb::Error::WouldBlock) => None,
            Err(nb::Error::Other(infallible)) => match infallible {},
        }
    }

    /// Let the modem finish talking, then discard everything pending.
    pub fn drain(&mut self, settle_ms: u32) {
        if settle_ms > 0 {
            self.delay.delay_ms(settle_ms);
        }
        while self.poll_byte().is_some() {}
    }

    pub fn send_raw(&mut self, bytes: &[u8]) {
        #[cfg(feature = "rtt-print-traffic")]
        rtt_target::rprint!(">{}", core::str::from_utf8(bytes).unwrap_or("…"));

        self.chan.write(bytes);
    }

    pub fn send_line(&mut self, line: &str) {
        trace!("sending {=str}", line);
        self.send_raw(line.as_bytes());
        self.send_raw(b"\r\n");
    }

    /// Wait for one specific byte, discarding everything else.
    pub fn await_byte(&mut self, expected: u8, timeout_ms: u32) -> Result<(), Error> {
        let mut timeout = Deadline::start(self.clock.now_ms(), timeout_ms);
        loop {
            if let Some(byte) = self.poll_byte() {
                if byte == expected {
                    return Ok(());
                }
            }
            if timeout.poll(self.clock.now_ms()) {
                return Err(Error::ChannelTimeout);
            }
        }
    }

    /// Wait for `token` to appear as contiguous bytes.
    ///
    /// The match is incremental: bytes before the first token byte are
    /// discarded, but a mismatch after a partial match fails the wait
    /// outright — the stream is not rescanned from the offending byte.
    pub fn await_token(&mut self, token: &[u8], timeout_ms: u32) -> Result<(), Error> {
        if token.is_empty() {
            return Ok(());
        }
        let mut matched = 0;
        let mut timeout = Deadline::start(self.clock.now_ms(), timeout_ms);
        loop {
            if let Some(byte) = self.poll_byte() {
                if byte == token[matched] {
                    matched += 1;
                    if matched == token.len() {
                        return Ok(());
                    }
                } else if matched > 0 {
                    debug!("token broken after {=usize} bytes", matched);
                    return Err(Error::UnexpectedToken);
                }
            }
            if timeout.poll(self.clock.now_ms()) {
                return Err(Error::ChannelTimeout);
            }
        }
    }

    /// Read bytes into `out` until the end delimiter or until `out` is full.
    /// With a start delimiter, everything up to and including it is skipped
    /// first. Returns the number of bytes captured and how the read ended.
    pub fn read_field(
        &mut self,
        out: &mut [u8],
        start_delim: Option<u8>,
        end_delim: u8,
        timeout_ms: u32,
    ) -> Result<(usize, FieldEnd), Error> {
        let mut timeout = Deadline::start(self.clock.now_ms(), timeout_ms);

        if let Some(start) = start_delim {
            loop {
                if let Some(byte) = self.poll_byte() {
                    if byte == start {
                        break;
                    }
                }
                if timeout.poll(self.clock.now_ms()) {
                    warn!("timed out seeking field start");
                    return Err(Error::ChannelTimeout);
                }
            }
        }

        if out.is_empty() {
            return Ok((0, FieldEnd::Capacity));
        }

        let mut written = 0;
        loop {
            if let Some(byte) = self.poll_byte() {
                if byte == end_delim {
                    return Ok((written, FieldEnd::Delimiter));
                }
                out[written] = byte;
                written += 1;
                if written == out.len() {
                    return Ok((written, FieldEnd::Capacity));
                }
            }
            if timeout.poll(self.clock.now_ms()) {
                warn!("timed out reading field");
                return Err(Error::ChannelTimeout);
            }
        }
    }

    /// Consume exactly `count` commas, discarding everything in between.
    pub fn skip_delimiters(&mut self, count: u8, timeout_ms: u32) -> Result<(), Error> {
        let mut remaining = count;
        if remaining == 0 {
            return Ok(());
        }
        let mut timeout = Deadline::start(self.clock.now_ms(), timeout_ms);
        loop {
            if let Some(byte) = self.poll_byte() {
                if byte == b',' {
                    remaining -= 1;
                    if remaining == 0 {
                        return Ok(());
                    }
                }
            }
            if timeout.poll(self.clock.now_ms()) {
                return Err(Error::ChannelTimeout);
            }
        }
    }

    /// Pull the given fields, in order, out of the response stream.
    ///
    /// The cursor tracks how many commas have been consumed so far; a field
    /// that ends on the comma delimiter itself advances it by one. Fails on
    /// the first field that cannot be read.
    pub fn extract_fields(
        &mut self,
        specs: &mut [FieldSpec<'_>],
        timeout_ms: u32,
    ) -> Result<(), Error> {
        let mut cursor = 0u8;
        for spec in specs {
            debug_assert!(spec.index >= cursor, "field specs must be ordered");
            self.skip_delimiters(spec.index.saturating_sub(cursor), timeout_ms)?;
            cursor = spec.index;

            let (written, end) =
                self.read_field(spec.out, spec.start_delim, spec.end_delim, timeout_ms)?;
            spec.written = written;

            if end == FieldEnd::Delimiter && spec.end_delim == b',' {
                cursor += 1;
            }
        }
        Ok(())
    }

    /// Send a command line and wait for the `OK` confirmation.
    pub fn command(&mut self, cmd: &str, timeout_ms: u32) -> Result<(), Error> {
        self.command_expect(cmd, b"OK", timeout_ms)
    }

    /// Send a command line and wait for a specific confirmation token.
    pub fn command_expect(
        &mut self,
        cmd: &str,
        token: &[u8],
        timeout_ms: u32,
    ) -> Result<(), Error> {
        self.send_line(cmd);
        self.await_token(token, timeout_ms)
    }

    /// Send a command, wait for the response prefix, extract fields, then
    /// require the trailing `OK`.
    ///
    /// The trailing confirmation is awaited even when extraction failed, so
    /// the channel is not left in the middle of a response.
    pub fn command_and_capture(
        &mut self,
        cmd: &str,
        prefix: &[u8],
        specs: &mut [FieldSpec<'_>],
        timeout_ms: u32,
    ) -> Result<(), Error> {
        self.command_expect(cmd, prefix, timeout_ms)?;
        let captured = self.extract_fields(specs, timeout_ms);
        let confirmed = self.await_token(b"OK", timeout_ms);
        captured?;
        confirmed
    }

    /// Text-mode SMS send: `AT+CMGS="<to>"`, body prompt, body, Ctrl-Z.
    pub fn send_sms(&mut self, to: &str, body: &str) -> Result<(), Error> {
        self.command("AT+CMGF=1", DEFAULT_TIMEOUT_MS)?;

        info!("sms to {=str}: {=str}", to, body);
        self.drain(DRAIN_SETTLE_MS);

        if self.sms_dry_run {
            return Ok(());
        }

        let mut cmd: String<48> = String::new();
        write!(cmd, "AT+CMGS=\"{}\"", to).map_err(|_| Error::FieldOverflow)?;
        self.send_line(&cmd);
        self.await_byte(b'>', SMS_PROMPT_TIMEOUT_MS)?;

        self.send_line(body);
        self.send_raw(&[SMS_TERMINATOR]);

        self.drain(DRAIN_SETTLE_MS);
        self.drain(DRAIN_SETTLE_MS);
        Ok(())
    }

    /// Announce `payload.len()` with `AT+CIPSEND=`, then the caller streams
    /// the raw bytes once the `>` prompt arrives.
    pub(crate) fn announce_payload(&mut self, len: u16) -> Result<(), Error> {
        let mut digits = [0u8; u16::FORMATTED_SIZE_DECIMAL];
        let digits = lexical_core::write(len, &mut digits);
        self.send_raw(b"AT+CIPSEND=");
        self.send_raw(digits);
        self.send_raw(b"\r\n");
        self.await_byte(b'>', SMS_PROMPT_TIMEOUT_MS)
    }
}
