//! Inbox polling and command dispatch.

use embedded_hal::blocking::delay::DelayMs;

use super::link::{FieldEnd, FieldSpec, Link, DEFAULT_TIMEOUT_MS};
use crate::hal::{ByteChannel, Clock};
use crate::{debug, info, warn, Error};

/// Longest sender number we accept from a message list entry.
const SENDER_BUF_LEN: usize = 29;
/// A text-mode body plus slack for concatenation headers.
const BODY_BUF_LEN: usize = 199;

/// Capability the command router hands to the modem: react to an inbound
/// message or call, with the protocol engine available for replies.
pub trait Dispatch<S, C, D> {
    /// Returns whether the message was recognized and handled.
    fn handle_sms(&mut self, link: &mut Link<S, C, D>, from: &str, body: &str) -> bool;
    /// Returns whether the call was handled.
    fn handle_call(&mut self, link: &mut Link<S, C, D>, from: &str) -> bool;
}

/// List stored messages and dispatch each {sender, body} pair.
///
/// A field-extraction failure is the only end-of-list signal the reply format
/// offers: a timeout while seeking the next entry is the list running out and
/// ends the poll quietly; any failure mid-entry is a malformed stream and is
/// reported.
pub(crate) fn poll_inbox<S, C, D, H>(
    link: &mut Link<S, C, D>,
    handler: &mut H,
) -> Result<(), Error>
where
    S: ByteChannel,
    C: Clock,
    D: DelayMs<u32>,
    H: Dispatch<S, C, D>,
{
    link.command("AT+CMGF=1", DEFAULT_TIMEOUT_MS)?;
    link.command_expect("AT+CMGL", b"+CMGL", DEFAULT_TIMEOUT_MS)?;

    loop {
        let mut sender = [0u8; SENDER_BUF_LEN];
        let mut specs = [FieldSpec::new(2, &mut sender).quoted()];
        match link.extract_fields(&mut specs, DEFAULT_TIMEOUT_MS) {
            Ok(()) => {}
            Err(Error::ChannelTimeout) => {
                debug!("message list exhausted");
                return Ok(());
            }
            Err(err) => {
                warn!("malformed message list: {}", err);
                return Err(err);
            }
        }

        // Rest of the header line, then the body on its own line.
        link.await_byte(b'\r', DEFAULT_TIMEOUT_MS)?;
        link.await_byte(b'\n', DEFAULT_TIMEOUT_MS)?;

        let mut body = [0u8; BODY_BUF_LEN];
        let (len, end) = link.read_field(&mut body, None, b'\r', DEFAULT_TIMEOUT_MS)?;
        if end == FieldEnd::Capacity {
            warn!("message body overflowed");
            return Err(Error::FieldOverflow);
        }

        // Commands are matched case-insensitively: uppercase once here.
        body[..len].make_ascii_uppercase();

        let from =
            core::str::from_utf8(specs[0].bytes()).map_err(|_| Error::UnexpectedToken)?;
        let text = core::str::from_utf8(&body[..len]).map_err(|_| Error::UnexpectedToken)?;
        info!("sms from {=str}: {=str}", from, text);

        if !handler.handle_sms(link, from, text) {
            debug!("unhandled sms: {=str}", text);
        }
    }
}
