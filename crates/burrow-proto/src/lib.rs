//! Wire protocol for burrow tunnels
//!
//! The control channel between client and server is a single WebSocket
//! carrying interleaved JSON text frames ([`ControlMessage`]) and raw binary
//! frames, each binary frame belonging to the most recent announcing message.

pub mod framing;
pub mod messages;
pub mod subdomain;

pub use framing::{decode_text, CodecError, Frame};
pub use messages::{ControlMessage, Headers};
