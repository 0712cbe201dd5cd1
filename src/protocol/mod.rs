//! Protocol module - Defines the wire protocol between the build client and deploy servers
//!
//! Every connection carries exactly one exchange:
//! - 1 byte operation code
//! - An operation-specific body made of length-prefixed fields (big-endian)
//!
//! The width of each length prefix is fixed per field, which bounds how much a
//! peer can make the other side allocate for that field.

mod codec;
mod message;

pub use codec::*;
pub use message::*;

/// Default port for the deploy server
pub const DEFAULT_PORT: u16 = 2030;

/// ALPN identifier negotiated during the TLS handshake
pub const ALPN_PROTOCOL: &[u8] = b"pushbuild";

/// Server name both sides expect in the server certificate unless configured otherwise
pub const DEFAULT_SERVER_NAME: &str = "pushbuild";
