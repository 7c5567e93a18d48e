//! REST and discovery bodies served by the gateway

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::registry::ServiceRegistration;

/// `POST /<svc>/tools/call` body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallBody {
    pub tool: String,
    #[serde(default)]
    pub arguments: Value,
}

/// Paths a client can use for one service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceEndpoints {
    pub sse: String,
    pub message: String,
    pub stream: String,
    pub tools: String,
    pub call: String,
}

impl ServiceEndpoints {
    pub fn for_service(name: &str) -> Self {
        Self {
            sse: format!("/{}/sse", name),
            message: format!("/{}/message", name),
            stream: format!("/{}", name),
            tools: format!("/{}/tools", name),
            call: format!("/{}/tools/call", name),
        }
    }
}

/// One entry in the root directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceListing {
    pub name: String,
    pub description: String,
    pub endpoints: ServiceEndpoints,
}

impl From<ServiceRegistration> for ServiceListing {
    fn from(reg: ServiceRegistration) -> Self {
        Self {
            endpoints: ServiceEndpoints::for_service(&reg.name),
            name: reg.name,
            description: reg.description,
        }
    }
}

/// `GET /` body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Directory {
    pub name: String,
    pub version: String,
    pub services: Vec<ServiceListing>,
}
