//! Frame value type and serializer.
//!
//! Represents a complete RELP frame: txid, command and payload.
//! Uses `bytes::Bytes` for zero-copy payload sharing.
//!
//! # Example
//!
//! ```
//! use relp_gateway::protocol::RawFrame;
//!
//! let frame = RawFrame::new(2, "syslog", &b"foobar"[..]);
//! assert_eq!(&frame.serialize()[..], b"2 syslog 6 foobar\n");
//! ```

use bytes::Bytes;

use super::wire_format::{is_valid_command, Header, SP, TRAILER};

/// A complete protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    /// Transaction number.
    pub txid: u64,
    /// Command token, e.g. `open`, `syslog`, `close`, `rsp`.
    pub command: String,
    /// Payload bytes; length equals the declared datalen.
    pub payload: Bytes,
}

impl RawFrame {
    /// Create a new frame.
    pub fn new(txid: u64, command: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            txid,
            command: command.into(),
            payload: payload.into(),
        }
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Get the payload length (the frame's datalen).
    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Check the command token.
    #[inline]
    pub fn is_command(&self, command: &str) -> bool {
        self.command == command
    }

    /// Header describing this frame.
    pub fn header(&self) -> Header {
        Header::new(self.txid, self.command.clone(), self.payload.len())
    }

    /// Serialize the frame to its wire form.
    pub fn serialize(&self) -> Bytes {
        Bytes::from(build_frame(self.txid, &self.command, &self.payload))
    }
}

/// Build a complete frame as a single byte vector.
///
/// Produces `<txid> <command> <datalen> <payload>\n`, or
/// `<txid> <command> 0\n` when the payload is empty.
///
/// # Example
///
/// ```
/// use relp_gateway::protocol::build_frame;
///
/// assert_eq!(build_frame(3, "rsp", b""), b"3 rsp 0\n");
/// assert_eq!(build_frame(2, "rsp", b"200 OK"), b"2 rsp 6 200 OK\n");
/// ```
pub fn build_frame(txid: u64, command: &str, payload: &[u8]) -> Vec<u8> {
    debug_assert!(is_valid_command(command), "invalid command {:?}", command);
    let header = Header::new(txid, command, payload.len());
    let mut buf = Vec::with_capacity(24 + command.len() + payload.len());
    header.encode_into(&mut buf);
    if !payload.is_empty() {
        buf.push(SP);
        buf.extend_from_slice(payload);
    }
    buf.push(TRAILER);
    buf
}
