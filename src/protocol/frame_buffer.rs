//! Incremental frame parser for a chunked byte stream.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management.
//! Implements a state machine for handling fragmented frames:
//! - `WaitingForHeader`: need `<txid> <command> <datalen>` plus its separator
//! - `WaitingForData`: header parsed, need `datalen` bytes plus the trailing LF
//!
//! A whole short frame arriving in one chunk and a frame split across any
//! number of reads go through the same two states, so the decoded output
//! does not depend on where the transport split the bytes.
//!
//! # Example
//!
//! ```
//! use relp_gateway::protocol::FrameStreamParser;
//!
//! let mut parser = FrameStreamParser::new();
//!
//! assert!(parser.push(b"2 syslog 6 foo").unwrap().is_empty());
//! let frames = parser.push(b"bar\n").unwrap();
//!
//! assert_eq!(frames[0].txid, 2);
//! assert_eq!(frames[0].payload(), b"foobar");
//! ```

use bytes::{Buf, Bytes, BytesMut};

use super::wire_format::{Header, MAX_DATALEN, TRAILER};
use super::RawFrame;
use crate::error::{RelpError, Result};

/// Initial receive buffer capacity.
const DEFAULT_CAPACITY: usize = 8 * 1024;

/// State machine for frame parsing.
#[derive(Debug, Clone)]
enum State {
    /// Waiting for a complete header.
    WaitingForHeader,
    /// Header parsed, waiting for data bytes and the trailer.
    WaitingForData { header: Header },
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
///
/// Bytes belonging to a frame that is not yet complete are kept until
/// the rest arrives.
#[derive(Debug)]
pub struct FrameStreamParser {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Maximum allowed datalen.
    max_datalen: usize,
}

impl FrameStreamParser {
    /// Create a new parser with the protocol's datalen cap.
    pub fn new() -> Self {
        Self::with_max_datalen(MAX_DATALEN)
    }

    /// Create a new parser with a lower datalen cap.
    ///
    /// Values above [`MAX_DATALEN`] are clamped to it.
    pub fn with_max_datalen(max_datalen: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(DEFAULT_CAPACITY),
            state: State::WaitingForHeader,
            max_datalen: max_datalen.min(MAX_DATALEN),
        }
    }

    /// The datalen cap in effect.
    pub fn max_datalen(&self) -> usize {
        self.max_datalen
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Returns the frames completed by this chunk, in arrival order. Empty
    /// chunks are allowed.
    ///
    /// # Errors
    ///
    /// Returns [`RelpError::FrameParse`] if a header is malformed, a declared
    /// datalen exceeds the cap, or a payload is not followed by LF. The
    /// parser must not be reused after an error.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<RawFrame>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();

        while let Some(frame) = self.try_extract_one()? {
            frames.push(frame);
        }

        Ok(frames)
    }

    /// Try to extract a single frame from the buffer.
    ///
    /// Returns:
    /// - `Ok(Some(frame))` if a complete frame was extracted
    /// - `Ok(None)` if more data is needed
    /// - `Err(...)` on a framing violation
    fn try_extract_one(&mut self) -> Result<Option<RawFrame>> {
        let header = match std::mem::replace(&mut self.state, State::WaitingForHeader) {
            State::WaitingForHeader => {
                let decoded = match Header::decode(&self.buffer, self.max_datalen)? {
                    Some(decoded) => decoded,
                    None => return Ok(None),
                };

                self.buffer.advance(decoded.consumed);

                if !decoded.expects_data {
                    let header = decoded.header;
                    return Ok(Some(RawFrame::new(header.txid, header.command, Bytes::new())));
                }

                decoded.header
            }
            State::WaitingForData { header } => header,
        };

        // Data plus the trailing LF.
        if self.buffer.len() < header.datalen + 1 {
            self.state = State::WaitingForData { header };
            return Ok(None);
        }

        if self.buffer[header.datalen] != TRAILER {
            return Err(RelpError::FrameParse(format!(
                "frame {} is not terminated by a newline after {} data bytes",
                header.txid, header.datalen
            )));
        }

        let payload = self.buffer.split_to(header.datalen).freeze();
        self.buffer.advance(1);

        Ok(Some(RawFrame::new(header.txid, header.command, payload)))
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForHeader;
    }

    /// Get the current state for debugging.
    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::WaitingForHeader => "WaitingForHeader",
            State::WaitingForData { .. } => "WaitingForData",
        }
    }
}

impl Default for FrameStreamParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::build_frame;

    const LIBRELP_OPEN_FRAME: &[u8] = b"1 open 86 relp_version=0\nrelp_software=librelp,1.2.12,http://librelp.adiscon.com\ncommands=syslog\n";

    fn open_frame() -> RawFrame {
        RawFrame::new(
            1,
            "open",
            &b"relp_version=0\nrelp_software=librelp,1.2.12,http://librelp.adiscon.com\ncommands=syslog"[..],
        )
    }

    #[test]
    fn test_single_complete_frame() {
        let mut parser = FrameStreamParser::new();

        let frames = parser.push(LIBRELP_OPEN_FRAME).unwrap();

        assert_eq!(frames, vec![open_frame()]);
        assert!(parser.is_empty());
    }

    #[test]
    fn test_fragmented_frame_with_trailing_bytes() {
        let mut parser = FrameStreamParser::new();

        assert!(parser.push(b"").unwrap().is_empty());
        assert!(parser.push(&LIBRELP_OPEN_FRAME[0..10]).unwrap().is_empty());
        assert!(parser.push(&LIBRELP_OPEN_FRAME[10..20]).unwrap().is_empty());
        assert!(parser.push(&LIBRELP_OPEN_FRAME[20..50]).unwrap().is_empty());

        let mut rest = LIBRELP_OPEN_FRAME[50..].to_vec();
        rest.extend_from_slice(b"2 sys");
        let frames = parser.push(&rest).unwrap();

        assert_eq!(frames, vec![open_frame()]);
        assert_eq!(parser.len(), 5);
        assert_eq!(parser.state_name(), "WaitingForHeader");
    }

    #[test]
    fn test_garbage_after_frame_rejected() {
        let mut parser = FrameStreamParser::new();
        let mut data = LIBRELP_OPEN_FRAME.to_vec();
        data.extend_from_slice(b"foobar");

        let err = parser.push(&data).unwrap_err();
        assert!(err.is_frame_parse());
    }

    #[test]
    fn test_two_frames_in_one_push() {
        let mut parser = FrameStreamParser::new();
        let doubled = [LIBRELP_OPEN_FRAME, LIBRELP_OPEN_FRAME].concat();

        let frames = parser.push(&doubled).unwrap();

        assert_eq!(frames, vec![open_frame(), open_frame()]);
        assert!(parser.is_empty());
    }

    #[test]
    fn test_empty_frame() {
        let mut parser = FrameStreamParser::new();

        let frames = parser.push(b"1 foo 0\n").unwrap();

        assert_eq!(frames, vec![RawFrame::new(1, "foo", Bytes::new())]);
    }

    #[test]
    fn test_empty_frame_with_separator() {
        let mut parser = FrameStreamParser::new();

        let frames = parser.push(b"1 foo 0 \n").unwrap();

        assert_eq!(frames, vec![RawFrame::new(1, "foo", Bytes::new())]);
    }

    #[test]
    fn test_max_datalen_split_header_form() {
        let mut parser = FrameStreamParser::new();
        let err = parser.push(b"1 open 1000000 ").unwrap_err();
        assert!(err.is_frame_parse());
    }

    #[test]
    fn test_max_datalen_inline_form() {
        let mut parser = FrameStreamParser::new();
        let err = parser.push(b"1 open 1000000\n").unwrap_err();
        assert!(err.is_frame_parse());
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_custom_max_datalen() {
        let mut parser = FrameStreamParser::with_max_datalen(4);
        assert!(parser.push(b"1 syslog 4 abcd\n").is_ok());
        assert!(parser.push(b"2 syslog 5 ").is_err());
    }

    #[test]
    fn test_max_datalen_is_clamped() {
        let parser = FrameStreamParser::with_max_datalen(usize::MAX);
        assert_eq!(parser.max_datalen(), MAX_DATALEN);
    }

    #[test]
    fn test_fragmented_data() {
        let mut parser = FrameStreamParser::new();
        let payload = b"this is a longer payload that will be fragmented";
        let bytes = build_frame(42, "syslog", payload);

        let frames = parser.push(&bytes[..20]).unwrap();
        assert!(frames.is_empty());
        assert_eq!(parser.state_name(), "WaitingForData");

        let frames = parser.push(&bytes[20..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload(), payload);
        assert!(parser.is_empty());
    }

    #[test]
    fn test_waits_for_trailer() {
        let mut parser = FrameStreamParser::new();

        assert!(parser.push(b"2 syslog 6 foobar").unwrap().is_empty());
        assert_eq!(parser.state_name(), "WaitingForData");

        let frames = parser.push(b"\n").unwrap();
        assert_eq!(frames, vec![RawFrame::new(2, "syslog", &b"foobar"[..])]);
    }

    #[test]
    fn test_missing_trailer_rejected() {
        let mut parser = FrameStreamParser::new();
        let err = parser.push(b"2 syslog 6 foobarX").unwrap_err();
        assert!(err.is_frame_parse());
    }

    #[test]
    fn test_large_payload() {
        let mut parser = FrameStreamParser::new();
        let payload = vec![b'x'; MAX_DATALEN];
        let bytes = build_frame(1, "syslog", &payload);

        let frames = parser.push(&bytes).unwrap();

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload_len(), MAX_DATALEN);
    }

    #[test]
    fn test_clear_resets_state() {
        let mut parser = FrameStreamParser::new();

        parser.push(b"2 syslog 6 foo").unwrap();
        assert_eq!(parser.state_name(), "WaitingForData");
        assert_eq!(parser.len(), 3);

        parser.clear();

        assert_eq!(parser.state_name(), "WaitingForHeader");
        assert!(parser.is_empty());
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut parser = FrameStreamParser::new();
        let mut all_frames = Vec::new();

        for byte in LIBRELP_OPEN_FRAME.iter().chain(b"3 close 0\n") {
            all_frames.extend(parser.push(&[*byte]).unwrap());
        }

        assert_eq!(
            all_frames,
            vec![open_frame(), RawFrame::new(3, "close", Bytes::new())]
        );
    }
}
