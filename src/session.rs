//! RELP session state machine.
//!
//! A [`RelpSession`] owns one [`FrameStreamParser`] per connection, interprets
//! decoded frames according to the session state and queues two kinds of
//! output: serialized response frames for the transport and decoded log
//! messages for the storage sink. It never performs I/O itself.
//!
//! ```text
//!  UNINITIALIZED ──open──► OPEN ──close──► CLOSED
//!                           │ ▲
//!                           └─┘ syslog
//! ```
//!
//! # Example
//!
//! ```
//! use relp_gateway::session::{RelpSession, SessionState};
//!
//! let mut session = RelpSession::new();
//! session.on_client_data(b"1 open 14 relp_version=0\n").unwrap();
//! assert_eq!(session.state(), SessionState::Open);
//!
//! session.on_client_data(b"2 syslog 6 foobar\n").unwrap();
//! let messages = session.drain_messages();
//! assert_eq!(messages[0].txid, 2);
//!
//! session.ack_msg(2);
//! assert_eq!(&session.drain_outbound()[1][..], b"2 rsp 6 200 OK\n");
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{RelpError, Result};
use crate::protocol::{
    build_frame, commands, find_offer, keys, parse_offers, serialize_offers, FrameStreamParser,
    Offer, RawFrame, RelpVersion, MAX_DATALEN,
};

/// Payload of a successful acknowledgement.
pub const ACK_OK: &[u8] = b"200 OK";

/// Default `relp_software` value sent in the open response.
pub const DEFAULT_SOFTWARE: &str = "relp-gateway";

/// Protocol state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Only `open` is accepted.
    Uninitialized,
    /// Accepts `syslog` and `close`.
    Open,
    /// Terminal; every further frame is rejected.
    Closed,
}

/// A decoded log record waiting for the storage sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelpMessage {
    /// Transaction number to acknowledge once stored.
    pub txid: u64,
    /// Opaque record bytes (usually a syslog line).
    pub payload: Bytes,
}

impl RelpMessage {
    pub fn new(txid: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            txid,
            payload: payload.into(),
        }
    }
}

/// Per-session settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Sent as `relp_software` in the open response.
    pub software: String,
    /// Datalen cap; clamped to [`MAX_DATALEN`].
    pub max_datalen: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            software: DEFAULT_SOFTWARE.to_string(),
            max_datalen: MAX_DATALEN,
        }
    }
}

/// Server side of one RELP connection.
#[derive(Debug)]
pub struct RelpSession {
    state: SessionState,
    version: Option<RelpVersion>,
    parser: FrameStreamParser,
    config: SessionConfig,
    outbound: Vec<Bytes>,
    messages: Vec<RelpMessage>,
}

impl RelpSession {
    /// Create a session with default settings.
    pub fn new() -> Self {
        Self::with_config(SessionConfig::default())
    }

    /// Create a session with custom settings.
    pub fn with_config(config: SessionConfig) -> Self {
        Self {
            state: SessionState::Uninitialized,
            version: None,
            parser: FrameStreamParser::with_max_datalen(config.max_datalen),
            config,
            outbound: Vec::new(),
            messages: Vec::new(),
        }
    }

    /// Current protocol state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// True once a `close` frame has been handled.
    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    /// Version negotiated by `open`, if any.
    pub fn version(&self) -> Option<RelpVersion> {
        self.version
    }

    /// Number of serialized frames waiting for the transport.
    pub fn pending_outbound(&self) -> usize {
        self.outbound.len()
    }

    /// Number of decoded messages waiting for the storage sink.
    pub fn pending_messages(&self) -> usize {
        self.messages.len()
    }

    /// Bytes received but not yet part of a complete frame.
    pub fn buffered_len(&self) -> usize {
        self.parser.len()
    }

    /// Feed bytes received from the client.
    ///
    /// Every frame completed by `data` is handled in arrival order.
    ///
    /// # Errors
    ///
    /// Returns [`RelpError::FrameParse`], [`RelpError::Version`] or
    /// [`RelpError::Protocol`]. All three are fatal for the connection. On
    /// error both output queues are emptied so nothing from a broken
    /// connection is delivered; the state of the rejecting frame is left
    /// unchanged.
    pub fn on_client_data(&mut self, data: &[u8]) -> Result<()> {
        let result = self.process(data);
        if let Err(e) = &result {
            warn!(
                state = ?self.state,
                dropped_frames = self.outbound.len(),
                dropped_messages = self.messages.len(),
                error = %e,
                "rejecting client data"
            );
            self.outbound.clear();
            self.messages.clear();
        }
        result
    }

    /// Queue the acknowledgement for a stored message.
    ///
    /// Called by the storage side once the message with `txid` has been
    /// durably recorded; receiving a `syslog` frame never acknowledges it.
    pub fn ack_msg(&mut self, txid: u64) {
        debug!(txid, "acknowledging message");
        self.queue_response(txid, ACK_OK);
    }

    /// Take all queued response frames, oldest first.
    pub fn drain_outbound(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.outbound)
    }

    /// Take all queued messages, oldest first.
    pub fn drain_messages(&mut self) -> Vec<RelpMessage> {
        std::mem::take(&mut self.messages)
    }

    fn process(&mut self, data: &[u8]) -> Result<()> {
        for frame in self.parser.push(data)? {
            self.handle_frame(frame)?;
        }
        Ok(())
    }

    fn handle_frame(&mut self, frame: RawFrame) -> Result<()> {
        match (self.state, frame.command.as_str()) {
            (SessionState::Uninitialized, commands::OPEN) => self.on_open(&frame),
            (SessionState::Uninitialized, command) => Err(RelpError::Protocol(format!(
                "unexpected command {} before open",
                command
            ))),
            (SessionState::Open, commands::SYSLOG) => {
                debug!(txid = frame.txid, len = frame.payload.len(), "syslog message");
                self.messages
                    .push(RelpMessage::new(frame.txid, frame.payload));
                Ok(())
            }
            (SessionState::Open, commands::CLOSE) => {
                debug!(txid = frame.txid, "session closed by client");
                self.state = SessionState::Closed;
                self.queue_response(frame.txid, b"");
                Ok(())
            }
            (SessionState::Open, command) => Err(RelpError::Protocol(format!(
                "unknown or unexpected command: {}",
                command
            ))),
            (SessionState::Closed, command) => Err(RelpError::Protocol(format!(
                "got data after session was closed (command {})",
                command
            ))),
        }
    }

    fn on_open(&mut self, frame: &RawFrame) -> Result<()> {
        let offers = parse_offers(&frame.payload);

        let version = match find_offer(&offers, keys::RELP_VERSION).and_then(|o| o.value()) {
            Some(value) => RelpVersion::from_offer_value(value)?,
            None => {
                return Err(RelpError::Version(
                    "open offers carry no relp_version".to_string(),
                ))
            }
        };

        let software = find_offer(&offers, keys::RELP_SOFTWARE)
            .and_then(|o| o.value())
            .map(String::from_utf8_lossy);
        let client_commands = find_offer(&offers, keys::COMMANDS)
            .and_then(|o| o.value())
            .map(String::from_utf8_lossy);
        info!(
            txid = frame.txid,
            %version,
            software = software.as_deref().unwrap_or("-"),
            commands = client_commands.as_deref().unwrap_or("-"),
            "session opened"
        );

        self.state = SessionState::Open;
        self.version = Some(version);

        let response = [
            Offer::new(keys::RELP_VERSION, version.to_string()),
            Offer::new(keys::RELP_SOFTWARE, self.config.software.clone()),
            Offer::new(keys::COMMANDS, commands::SYSLOG),
        ];
        let payload = serialize_offers(version, &response);
        self.queue_response(frame.txid, &payload);
        Ok(())
    }

    fn queue_response(&mut self, txid: u64, payload: &[u8]) {
        self.outbound
            .push(Bytes::from(build_frame(txid, commands::RSP, payload)));
    }
}

impl Default for RelpSession {
    fn default() -> Self {
        Self::new()
    }
}
