//! # FRAME
//! **Wire format: STOMP 1.0**
//!
//! A [Frame] is the immutable unit of exchange between client and server:
//! a command line, a block of headers, a blank line, and a body, the whole
//! thing terminated on the wire by a single NUL byte. This module only
//! knows how to serialize a [Frame] to bytes and parse bytes (already split
//! on a NUL boundary) back into one — framing the byte *stream* into
//! individual frames is [Transport]'s job.
//!
//! [Frame]:     Frame
//! [Transport]: crate::transport::Transport

use indexmap::IndexMap;

use crate::error::StompError;

/// Ordered header map. Duplicate keys on parse keep the first occurrence;
/// order of insertion is preserved for wire serialization.
pub type Headers = IndexMap<String, String>;

// Client -> server commands.
pub const CMD_CONNECT: &str = "CONNECT";
pub const CMD_SEND: &str = "SEND";
pub const CMD_SUBSCRIBE: &str = "SUBSCRIBE";
pub const CMD_UNSUBSCRIBE: &str = "UNSUBSCRIBE";
pub const CMD_ACK: &str = "ACK";
pub const CMD_BEGIN: &str = "BEGIN";
pub const CMD_COMMIT: &str = "COMMIT";
pub const CMD_ABORT: &str = "ABORT";
pub const CMD_DISCONNECT: &str = "DISCONNECT";

// Server -> client commands.
pub const CMD_CONNECTED: &str = "CONNECTED";
pub const CMD_MESSAGE: &str = "MESSAGE";
pub const CMD_RECEIPT: &str = "RECEIPT";
pub const CMD_ERROR: &str = "ERROR";

// Internal pseudo-commands, never seen on the wire, used to drive listener
// dispatch for lifecycle and synthetic events.
pub const CMD_CONNECTING: &str = "CONNECTING";
pub const CMD_DISCONNECTED: &str = "DISCONNECTED";
pub const CMD_BEFORE_MESSAGE: &str = "BEFORE_MESSAGE";
pub const CMD_RECEIVER_LOOP_COMPLETED: &str = "RECEIVER_LOOP_COMPLETED";
pub const CMD_HEARTBEAT_TIMEOUT: &str = "HEARTBEAT_TIMEOUT";
pub const CMD_HEARTBEAT: &str = "HEARTBEAT";

pub const HEADER_ACCEPT_VERSION: &str = "accept-version";
pub const HEADER_ACK: &str = "ack";
pub const HEADER_CONTENT_LENGTH: &str = "content-length";
pub const HEADER_CONTENT_TYPE: &str = "content-type";
pub const HEADER_DESTINATION: &str = "destination";
pub const HEADER_ID: &str = "id";
pub const HEADER_MESSAGE_ID: &str = "message-id";
pub const HEADER_LOGIN: &str = "login";
pub const HEADER_PASSCODE: &str = "passcode";
pub const HEADER_RECEIPT: &str = "receipt";
pub const HEADER_RECEIPT_ID: &str = "receipt-id";
pub const HEADER_TRANSACTION: &str = "transaction";

/// ## FRAME
///
/// An immutable `(command, headers, body)` triple. Frames are produced
/// either by [`Frame::parse`] (inbound) or by [`Protocol`] (outbound), and
/// are "immutable after dispatch" except during the `BEFORE_MESSAGE`
/// pre-processing window (see [`Transport::process_frame`]).
///
/// [`Protocol`]: crate::protocol::Protocol
/// [`Transport::process_frame`]: crate::transport::Transport::process_frame
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub command: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn new(command: impl Into<String>, headers: Headers, body: Vec<u8>) -> Self {
        Self { command: command.into(), headers, body }
    }

    /// A frame with no headers and an empty body, useful for the internal
    /// pseudo-commands (`CONNECTING`, `DISCONNECTED`, ...).
    pub fn pseudo(command: &str) -> Self {
        Self::new(command, Headers::new(), Vec::new())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Serialize to the STOMP 1.0 wire form: `COMMAND\n`, each header as
    /// `key:value\n` in insertion order, a blank line, then the body. The
    /// terminating NUL is appended by [`Transport::transmit`], not here.
    ///
    /// [`Transport::transmit`]: crate::transport::Transport::transmit
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.command.len() + self.body.len() + 64);
        out.extend_from_slice(self.command.as_bytes());
        out.push(b'\n');
        for (key, value) in &self.headers {
            out.extend_from_slice(key.as_bytes());
            out.push(b':');
            out.extend_from_slice(value.as_bytes());
            out.push(b'\n');
        }
        out.push(b'\n');
        out.extend_from_slice(&self.body);
        out
    }

    /// Parse a single frame from bytes already split on its NUL
    /// terminator (`input` contains neither the NUL nor any surrounding
    /// whitespace).
    ///
    /// Fails with [`StompError::MalformedFrame`] when the input is empty,
    /// a header line has no `:`, or no blank-line separator is found.
    pub fn parse(input: &[u8]) -> Result<Self, StompError> {
        if input.is_empty() {
            return Err(StompError::MalformedFrame("empty frame".into()));
        }

        let mut lines = input.split(|&b| b == b'\n');

        let command = lines
            .next()
            .ok_or_else(|| StompError::MalformedFrame("missing command line".into()))?;
        let command = String::from_utf8_lossy(command).into_owned();
        if command.is_empty() {
            return Err(StompError::MalformedFrame("empty command".into()));
        }

        let mut headers = Headers::new();
        let mut body: Option<Vec<u8>> = None;
        let mut remaining = lines;
        loop {
            let Some(line) = remaining.next() else {
                return Err(StompError::MalformedFrame("missing header/body separator".into()));
            };
            if line.is_empty() {
                // Blank line: everything else is body. Rejoin on '\n' since
                // the body itself may legitimately contain newlines.
                let rest: Vec<&[u8]> = remaining.collect();
                body = Some(rest.join(&b'\n'));
                break;
            }
            let colon = line
                .iter()
                .position(|&b| b == b':')
                .ok_or_else(|| StompError::MalformedFrame("header line missing ':'".into()))?;
            let key = String::from_utf8_lossy(&line[..colon]).into_owned();
            let value = String::from_utf8_lossy(&line[colon + 1..]).into_owned();
            headers.entry(key).or_insert(value);
        }

        Ok(Frame { command, headers, body: body.unwrap_or_default() })
    }
}
