//! MCP (Model Context Protocol) dispatch for Portico
//!
//! Translates one decoded JSON-RPC request into one response by delegating
//! to a hosted tool service. Transports live in `portico-gateway`.

pub mod dispatcher;
pub mod protocol;

pub use dispatcher::{handle, should_reply};
pub use protocol::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, PROTOCOL_VERSION};
