//! Offer lists exchanged in `open` frames and their responses.
//!
//! An offer list is a sequence of LF-joined lines, each either a bare
//! `key` (a flag) or `key=value`. Keys and values are raw bytes with no
//! escaping; order is preserved because peers observe it.

use std::fmt;

use bytes::Bytes;

use crate::error::{RelpError, Result};

/// Offer keys used during negotiation.
pub mod keys {
    /// Protocol version requested by the client and echoed by the server.
    pub const RELP_VERSION: &[u8] = b"relp_version";
    /// Free-form software identification.
    pub const RELP_SOFTWARE: &[u8] = b"relp_software";
    /// Comma-separated list of supported commands.
    pub const COMMANDS: &[u8] = b"commands";
}

/// Negotiated protocol version.
///
/// The two versions differ only in how an offer list is prefixed on the
/// wire, see [`serialize_offers`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelpVersion {
    V0,
    V1,
}

impl RelpVersion {
    /// Numeric value as sent in the `relp_version` offer.
    pub fn as_u8(self) -> u8 {
        match self {
            RelpVersion::V0 => 0,
            RelpVersion::V1 => 1,
        }
    }

    /// Bytes written in front of a serialized offer list.
    pub fn offer_prefix(self) -> &'static [u8] {
        match self {
            // librelp 0.x (e.g. Debian 9) expects no prefix.
            RelpVersion::V0 => b"",
            RelpVersion::V1 => b"\n",
        }
    }

    /// Parse the value of a `relp_version` offer.
    ///
    /// The value is an ASCII decimal number, so `01` means version 1.
    ///
    /// # Errors
    ///
    /// Returns [`RelpError::Version`] if the value is not a number or names
    /// a version other than 0 or 1.
    pub fn from_offer_value(value: &[u8]) -> Result<Self> {
        let not_a_number = || {
            RelpError::Version(format!(
                "relp_version {:?} is not a number",
                String::from_utf8_lossy(value)
            ))
        };

        if value.is_empty() || !value.iter().all(u8::is_ascii_digit) {
            return Err(not_a_number());
        }
        let number = value
            .iter()
            .try_fold(0u64, |acc, d| {
                acc.checked_mul(10)?.checked_add(u64::from(d - b'0'))
            })
            .ok_or_else(not_a_number)?;

        Self::try_from(number)
    }
}

impl TryFrom<u64> for RelpVersion {
    type Error = RelpError;

    fn try_from(value: u64) -> Result<Self> {
        match value {
            0 => Ok(RelpVersion::V0),
            1 => Ok(RelpVersion::V1),
            other => Err(RelpError::Version(format!(
                "RELP version {} is not supported",
                other
            ))),
        }
    }
}

impl fmt::Display for RelpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

/// A single negotiable capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Offer {
    /// Offer name; never contains `=` or LF.
    pub key: Bytes,
    /// `None` for a bare flag, possibly empty otherwise.
    pub value: Option<Bytes>,
}

impl Offer {
    /// Create a `key=value` offer.
    pub fn new(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
        }
    }

    /// Create a bare flag offer.
    pub fn flag(key: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: None,
        }
    }

    #[inline]
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    #[inline]
    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }
}

/// Parse an offer list.
///
/// Empty lines are skipped. Each line is split on its first `=`.
///
/// # Example
///
/// ```
/// use relp_gateway::protocol::{parse_offers, Offer};
///
/// let offers = parse_offers(b"relp_version=0\ncommands=syslog\n");
/// assert_eq!(offers[0], Offer::new(&b"relp_version"[..], &b"0"[..]));
/// ```
pub fn parse_offers(payload: &[u8]) -> Vec<Offer> {
    payload
        .split(|&b| b == b'\n')
        .filter(|line| !line.is_empty())
        .map(|line| match line.iter().position(|&b| b == b'=') {
            Some(eq) => Offer::new(
                Bytes::copy_from_slice(&line[..eq]),
                Bytes::copy_from_slice(&line[eq + 1..]),
            ),
            None => Offer::flag(Bytes::copy_from_slice(line)),
        })
        .collect()
}

/// Serialize an offer list for a peer speaking `version`.
///
/// Offers are LF-joined in the given order, bare flags as `key` and the
/// rest as `key=value`, behind the version's prefix (nothing for version 0,
/// a single LF for version 1).
pub fn serialize_offers(version: RelpVersion, offers: &[Offer]) -> Vec<u8> {
    let mut buf = version.offer_prefix().to_vec();
    for (i, offer) in offers.iter().enumerate() {
        if i > 0 {
            buf.push(b'\n');
        }
        buf.extend_from_slice(&offer.key);
        if let Some(value) = &offer.value {
            buf.push(b'=');
            buf.extend_from_slice(value);
        }
    }
    buf
}

/// Find an offer by key. The last occurrence wins.
pub fn find_offer<'a>(offers: &'a [Offer], key: &[u8]) -> Option<&'a Offer> {
    offers.iter().rev().find(|offer| offer.key() == key)
}
