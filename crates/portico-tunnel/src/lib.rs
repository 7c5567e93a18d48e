//! portico-tunnel — reverse tunnel from a public relay to the local gateway
//!
//! The relay assigns a public URL to a registered server name and forwards
//! requests for it over a WebSocket the [`TunnelClient`] keeps open. The
//! [`TunnelManager`] runs one client per name and proxies the relay's
//! permission API.

pub mod client;
pub mod error;
pub mod log;
pub mod manager;
pub mod protocol;
pub mod relay;

pub use client::{
    NamePrompt, Registration, StdinPrompt, TunnelClient, TunnelOptions, TunnelState, TunnelStatus,
};
pub use error::{RelayError, TunnelError};
pub use log::{ConnectionLog, LogEntry, LogLevel};
pub use manager::{StartedTunnel, TunnelInfo, TunnelManager, TunnelSettings};
pub use protocol::TunnelFrame;
pub use relay::{
    NewPermissions, PermissionGrant, PermissionRecord, PermissionStatus, PermissionUpdate, RelayApi,
    server_key_for,
};
