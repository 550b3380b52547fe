//! Server-side tunnel state
//!
//! [`Tunnel`] owns everything multiplexed over one control connection;
//! [`TunnelRegistry`] maps subdomains to live tunnels for the dispatcher.

pub mod registry;
pub mod tunnel;

pub use registry::{RegistryError, TunnelRegistry};
pub use tunnel::{
    Outgoing, ResponseBody, SocketFrame, StreamAbort, Tunnel, TunnelClosed, TunnelResponse,
    UpgradeResult,
};
