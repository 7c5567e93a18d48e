//! portico-gateway — local HTTP endpoint for hosted MCP tool services
//!
//! Routes each enabled service onto an event-stream transport
//! (`GET /<svc>/sse` + `POST /<svc>/message`), a bidirectional NDJSON
//! transport (`POST /<svc>`), and plain REST tool endpoints.

pub mod admin;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod sse;
pub mod stream;

pub use error::GatewayError;
pub use registry::{ServiceRegistration, ServiceRegistry};
pub use server::{GatewayServer, GatewayState};
pub use session::SessionRegistry;
