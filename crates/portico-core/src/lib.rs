//! portico-core — the contract every hosted tool service implements
//!
//! Services are opaque to the gateway: it only sees identity, capability
//! flags, tool descriptors, and (for resource-capable services) resources.

pub mod config;
pub mod error;
pub mod service;

pub use config::{Config, GatewayConfig, ServiceConfig, TunnelConfig, expand_home, load_config};
pub use error::ToolError;
pub use service::{
    HostedService, ResourceContents, ResourceDescriptor, ResourceProvider, ServerInfo,
    ServiceCapabilities, ToolCallResult, ToolContent, ToolDescriptor, ToolService, json_schema,
};
