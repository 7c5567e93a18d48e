//! Tool service contract
//!
//! A service always exposes tools. Resource support is optional and is
//! resolved once, when the service is wrapped in a [`HostedService`], rather
//! than checked on every request.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::error::ToolError;

/// Identity reported in the `initialize` handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

impl ServerInfo {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

/// Capability flags a service advertises
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceCapabilities {
    pub tools: bool,
    pub resources: bool,
}

impl ServiceCapabilities {
    pub fn tools_only() -> Self {
        Self {
            tools: true,
            resources: false,
        }
    }

    pub fn with_resources() -> Self {
        Self {
            tools: true,
            resources: true,
        }
    }

    /// MCP `capabilities` object for the initialize result
    pub fn to_json(&self) -> Value {
        let mut caps = serde_json::Map::new();
        if self.tools {
            caps.insert("tools".into(), serde_json::json!({ "listChanged": false }));
        }
        if self.resources {
            caps.insert(
                "resources".into(),
                serde_json::json!({ "subscribe": false, "listChanged": false }),
            );
        }
        Value::Object(caps)
    }
}

/// Tool definition as listed by `tools/list`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// Resource definition as listed by `resources/list`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub uri: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "mimeType", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Body of a `resources/read` result entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceContents {
    pub uri: String,
    #[serde(rename = "mimeType", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub text: String,
}

/// MCP tool call result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub content: Vec<ToolContent>,
    #[serde(rename = "isError", skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

/// MCP tool content block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolContent {
    #[serde(rename = "type")]
    pub content_type: String,
    pub text: String,
}

impl ToolCallResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent {
                content_type: "text".to_string(),
                text: text.into(),
            }],
            is_error: None,
        }
    }

    pub fn error_text(text: impl Into<String>) -> Self {
        Self {
            is_error: Some(true),
            ..Self::text(text)
        }
    }
}

/// A hosted tool service.
///
/// `call_tool` is invoked concurrently for different calls; the gateway never
/// serializes access, so implementations must guard their own state.
#[async_trait]
pub trait ToolService: Send + Sync {
    fn server_info(&self) -> ServerInfo;

    fn capabilities(&self) -> ServiceCapabilities {
        ServiceCapabilities::tools_only()
    }

    fn list_tools(&self) -> Vec<ToolDescriptor>;

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolCallResult, ToolError>;

    /// Lifecycle hook run before the first tool call
    async fn initialize(&self) -> Result<(), ToolError> {
        Ok(())
    }

    /// Lifecycle hook run when the gateway shuts down
    async fn cleanup(&self) {}
}

/// Optional resource capability
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>, ToolError>;
    async fn read_resource(&self, uri: &str) -> Result<ResourceContents, ToolError>;
}

/// A service as the gateway holds it: the tool implementation plus its
/// resource provider, if it has one. Cheap to clone.
#[derive(Clone)]
pub struct HostedService {
    tools: Arc<dyn ToolService>,
    resources: Option<Arc<dyn ResourceProvider>>,
    initialized: Arc<OnceCell<()>>,
}

impl HostedService {
    /// Wrap a service that only exposes tools
    pub fn basic<S: ToolService + 'static>(service: Arc<S>) -> Self {
        Self {
            tools: service,
            resources: None,
            initialized: Arc::new(OnceCell::new()),
        }
    }

    /// Wrap a service that also exposes resources
    pub fn with_resources<S: ToolService + ResourceProvider + 'static>(service: Arc<S>) -> Self {
        Self {
            tools: service.clone(),
            resources: Some(service as Arc<dyn ResourceProvider>),
            initialized: Arc::new(OnceCell::new()),
        }
    }

    pub fn tools(&self) -> &dyn ToolService {
        self.tools.as_ref()
    }

    pub fn resources(&self) -> Option<&dyn ResourceProvider> {
        self.resources.as_deref()
    }

    pub fn server_info(&self) -> ServerInfo {
        self.tools.server_info()
    }

    /// Capabilities as advertised, with the resource flag forced to match
    /// whether a provider was actually attached.
    pub fn capabilities(&self) -> ServiceCapabilities {
        ServiceCapabilities {
            resources: self.resources.is_some(),
            ..self.tools.capabilities()
        }
    }

    /// Run the service's `initialize` hook once. A failed attempt is not
    /// cached, so the next call retries it.
    pub async fn ensure_initialized(&self) -> Result<(), ToolError> {
        self.initialized
            .get_or_try_init(|| async {
                debug!("Initializing service {}", self.tools.server_info().name);
                self.tools.initialize().await
            })
            .await
            .map(|_| ())
            .inspect_err(|e| {
                warn!(
                    "Service {} failed to initialize: {}",
                    self.tools.server_info().name,
                    e
                )
            })
    }

    pub async fn cleanup(&self) {
        self.tools.cleanup().await;
    }
}

/// Helper to create a JSON schema for tool input
pub fn json_schema(properties: Value, required: Vec<&str>) -> Value {
    serde_json::json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}
