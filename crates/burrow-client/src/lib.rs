//! burrow client library
//!
//! Holds one authenticated control connection to a burrow server and
//! forwards every public request to an HTTP server on the loopback, with
//! streaming, compression and WebSocket passthrough. The binary in
//! `main.rs` is a thin clap wrapper around [`supervisor::run`].

pub mod backoff;
pub mod compress;
pub mod config;
pub mod events;
pub mod handler;
pub mod local_ws;
pub mod session;
pub mod supervisor;

pub use config::{ClientConfig, ConfigStore};
pub use events::{ConnectionState, EventBus, RequestKind, TunnelEvent};
pub use session::SessionError;
pub use supervisor::SupervisorOptions;
