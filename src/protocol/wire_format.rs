//! Wire format encoding and decoding.
//!
//! Implements the RELP frame header:
//! ```text
//! <txid> SP <command> SP <datalen> [SP <data>] LF
//! ┌────────────┬──────────────┬────────────┬──────────────────┐
//! │ txid       │ command      │ datalen    │ data             │
//! │ 1-9 digits │ 1-32 letters │ 1-9 digits │ exactly datalen  │
//! └────────────┴──────────────┴────────────┴──────────────────┘
//! ```
//!
//! The trailing LF is not counted in `datalen`. A frame without data is
//! written `<txid> <command> 0\n`.

use crate::error::{RelpError, Result};

/// Hard cap on the declared data length of a single frame.
pub const MAX_DATALEN: usize = 128_000;

/// Maximum number of digits in a txid.
pub const MAX_TXID_DIGITS: usize = 9;

/// Maximum length of a command token.
pub const MAX_COMMAND_LEN: usize = 32;

/// Maximum number of digits in a datalen field.
pub const MAX_DATALEN_DIGITS: usize = 9;

/// Field separator.
pub const SP: u8 = b' ';

/// Frame trailer.
pub const TRAILER: u8 = b'\n';

/// Command tokens recognised by the gateway.
pub mod commands {
    /// Client → server, session start with offers.
    pub const OPEN: &str = "open";
    /// Client → server, one log record.
    pub const SYSLOG: &str = "syslog";
    /// Client → server, graceful shutdown request.
    pub const CLOSE: &str = "close";
    /// Server → client, response to any txid.
    pub const RSP: &str = "rsp";
}

/// Decoded frame header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Peer-chosen transaction number, echoed back in responses.
    pub txid: u64,
    /// Command token (ASCII letters only).
    pub command: String,
    /// Declared data length in bytes.
    pub datalen: usize,
}

/// Result of decoding a complete header from the front of a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedHeader {
    /// The header fields.
    pub header: Header,
    /// Bytes consumed from the buffer, including the separator after datalen.
    pub consumed: usize,
    /// `false` when the header was terminated by LF (`datalen == 0`), i.e.
    /// the frame is already complete.
    pub expects_data: bool,
}

impl Header {
    /// Create a new header.
    pub fn new(txid: u64, command: impl Into<String>, datalen: usize) -> Self {
        Self {
            txid,
            command: command.into(),
            datalen,
        }
    }

    /// Encode `<txid> <command> <datalen>` (no trailing separator).
    ///
    /// # Example
    ///
    /// ```
    /// use relp_gateway::protocol::Header;
    ///
    /// let header = Header::new(1, "rsp", 6);
    /// assert_eq!(header.encode(), b"1 rsp 6");
    /// ```
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MAX_TXID_DIGITS + MAX_COMMAND_LEN + 12);
        self.encode_into(&mut buf);
        buf
    }

    /// Append the encoded header to an existing buffer.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(format!("{} {} {}", self.txid, self.command, self.datalen).as_bytes());
    }

    /// Decode a header from the front of `buf`.
    ///
    /// Returns `Ok(None)` if more bytes are needed. Fails as soon as a
    /// buffered byte makes the header invalid, and as soon as the datalen
    /// digits received so far exceed `max_datalen`.
    pub fn decode(buf: &[u8], max_datalen: usize) -> Result<Option<DecodedHeader>> {
        let (txid, pos) =
            match scan_token(buf, 0, MAX_TXID_DIGITS, u8::is_ascii_digit, "txid")? {
                Token::Incomplete(_) => return Ok(None),
                Token::Complete { value, delimiter } => {
                    expect_space(delimiter, "txid")?;
                    (parse_decimal(value), value.len() + 1)
                }
            };

        let (command, pos) =
            match scan_token(buf, pos, MAX_COMMAND_LEN, u8::is_ascii_alphabetic, "command")? {
                Token::Incomplete(_) => return Ok(None),
                Token::Complete { value, delimiter } => {
                    expect_space(delimiter, "command")?;
                    // Letters only, so this is valid UTF-8.
                    let command = String::from_utf8_lossy(value).into_owned();
                    (command, pos + value.len() + 1)
                }
            };

        let (datalen, delimiter, pos) =
            match scan_token(buf, pos, MAX_DATALEN_DIGITS, u8::is_ascii_digit, "datalen")? {
                Token::Incomplete(digits) => {
                    if !digits.is_empty() {
                        check_datalen(parse_decimal(digits), max_datalen)?;
                    }
                    return Ok(None);
                }
                Token::Complete { value, delimiter } => {
                    (parse_decimal(value), delimiter, pos + value.len() + 1)
                }
            };
        let datalen = check_datalen(datalen, max_datalen)?;

        let header = Header::new(txid, command, datalen);
        match delimiter {
            SP => Ok(Some(DecodedHeader {
                header,
                consumed: pos,
                expects_data: true,
            })),
            TRAILER if datalen == 0 => Ok(Some(DecodedHeader {
                header,
                consumed: pos,
                expects_data: false,
            })),
            TRAILER => Err(RelpError::FrameParse(format!(
                "datalen {} is followed by a newline instead of a space",
                datalen
            ))),
            other => Err(RelpError::FrameParse(format!(
                "unexpected byte 0x{:02x} after datalen",
                other
            ))),
        }
    }
}

/// Check whether `command` is a legal command token.
pub fn is_valid_command(command: &str) -> bool {
    !command.is_empty()
        && command.len() <= MAX_COMMAND_LEN
        && command.bytes().all(|b| b.is_ascii_alphabetic())
}

enum Token<'a> {
    /// Every remaining byte is valid for the field; more may follow.
    Incomplete(&'a [u8]),
    /// Field ended at `delimiter`, which is not part of `value`.
    Complete { value: &'a [u8], delimiter: u8 },
}

fn scan_token<'a>(
    buf: &'a [u8],
    start: usize,
    max_len: usize,
    valid: fn(&u8) -> bool,
    field: &str,
) -> Result<Token<'a>> {
    let rest = buf.get(start..).unwrap_or_default();
    match rest.iter().position(|b| !valid(b)) {
        None if rest.len() > max_len => Err(field_too_long(field, max_len)),
        None => Ok(Token::Incomplete(rest)),
        Some(0) => Err(RelpError::FrameParse(format!(
            "invalid {} field: unexpected byte 0x{:02x}",
            field, rest[0]
        ))),
        Some(n) if n > max_len => Err(field_too_long(field, max_len)),
        Some(n) => Ok(Token::Complete {
            value: &rest[..n],
            delimiter: rest[n],
        }),
    }
}

fn field_too_long(field: &str, max_len: usize) -> RelpError {
    RelpError::FrameParse(format!("{} field is longer than {} bytes", field, max_len))
}

fn expect_space(delimiter: u8, field: &str) -> Result<()> {
    if delimiter == SP {
        Ok(())
    } else {
        Err(RelpError::FrameParse(format!(
            "expected space after {}, got byte 0x{:02x}",
            field, delimiter
        )))
    }
}

// Callers only pass runs of at most 9 ASCII digits.
fn parse_decimal(digits: &[u8]) -> u64 {
    digits
        .iter()
        .fold(0u64, |acc, d| acc * 10 + u64::from(d - b'0'))
}

fn check_datalen(datalen: u64, max_datalen: usize) -> Result<usize> {
    match usize::try_from(datalen) {
        Ok(len) if len <= max_datalen => Ok(len),
        _ => Err(RelpError::FrameParse(format!(
            "datalen {} exceeds maximum {}",
            datalen, max_datalen
        ))),
    }
}
