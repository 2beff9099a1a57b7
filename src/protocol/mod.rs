//! Protocol module - wire format, framing, offers and frame types.
//!
//! This module implements the RELP framing layer:
//! - `<txid> <command> <datalen> [<data>]\n` header encoding/decoding
//! - Incremental parser for accumulating partial reads
//! - Offer lists exchanged during the `open` handshake

mod frame;
mod frame_buffer;
mod offers;
mod wire_format;

pub use frame::{build_frame, RawFrame};
pub use frame_buffer::FrameStreamParser;
pub use offers::{find_offer, keys, parse_offers, serialize_offers, Offer, RelpVersion};
pub use wire_format::{
    commands, is_valid_command, DecodedHeader, Header,
    MAX_COMMAND_LEN, MAX_DATALEN, MAX_DATALEN_DIGITS, MAX_TXID_DIGITS,
};
