//! # relp-gateway
//!
//! Server side of RELP, the Reliable Event Logging Protocol.
//!
//! RELP carries syslog records over a persistent TCP connection. Every
//! record is a frame with a transaction number that the server
//! acknowledges once the record has been stored.
//!
//! ## Architecture
//!
//! - **Protocol** ([`protocol`]): incremental frame parser and offer codec,
//!   independent of session semantics
//! - **Session** ([`session`]): per-connection state machine
//!   (`open` → `syslog`* → `close`) that queues responses and decoded messages
//!   and performs no I/O
//! - **Sink** ([`sink`]): durable storage of decoded messages
//! - **Server** ([`server`]): tokio TCP listener driving one session per
//!   connection
//!
//! ## Example
//!
//! ```
//! use relp_gateway::RelpSession;
//!
//! let mut session = RelpSession::new();
//! session.on_client_data(b"1 open 14 relp_version=0\n2 syslog 5 hello\n").unwrap();
//!
//! for message in session.drain_messages() {
//!     // persist message.payload, then:
//!     session.ack_msg(message.txid);
//! }
//!
//! let outbound = session.drain_outbound();
//! assert_eq!(&outbound[1][..], b"2 rsp 6 200 OK\n");
//! ```

pub mod error;
pub mod protocol;
pub mod server;
pub mod session;
pub mod sink;

pub use error::{RelpError, Result};
pub use server::{serve_connection, RelpServer, ServerBuilder, ServerConfig};
pub use session::{RelpMessage, RelpSession, SessionConfig, SessionState};
pub use sink::{JsonLinesSink, MemorySink, MessageSink};
