//! Built-in `system` service: host facts and a connectivity check

use std::time::Instant;

use async_trait::async_trait;
use portico_core::{ServerInfo, ToolCallResult, ToolDescriptor, ToolError, ToolService, json_schema};
use serde_json::Value;

pub struct SystemService {
    started: Instant,
}

impl SystemService {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    fn system_info(&self) -> Value {
        serde_json::json!({
            "os": std::env::consts::OS,
            "arch": std::env::consts::ARCH,
            "family": std::env::consts::FAMILY,
            "pid": std::process::id(),
            "uptime_secs": self.started.elapsed().as_secs(),
            "gateway_version": env!("CARGO_PKG_VERSION"),
            "time": chrono::Utc::now().to_rfc3339(),
        })
    }
}

impl Default for SystemService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolService for SystemService {
    fn server_info(&self) -> ServerInfo {
        ServerInfo::new("system", env!("CARGO_PKG_VERSION"))
    }

    fn list_tools(&self) -> Vec<ToolDescriptor> {
        vec![
            ToolDescriptor {
                name: "system_info".to_string(),
                description: "Report the host OS, architecture, and gateway uptime.".to_string(),
                input_schema: json_schema(serde_json::json!({}), vec![]),
            },
            ToolDescriptor {
                name: "echo".to_string(),
                description: "Return the given text unchanged.".to_string(),
                input_schema: json_schema(
                    serde_json::json!({
                        "text": { "type": "string", "description": "Text to echo" }
                    }),
                    vec!["text"],
                ),
            },
        ]
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolCallResult, ToolError> {
        match name {
            "system_info" => {
                let info = serde_json::to_string_pretty(&self.system_info())
                    .map_err(|e| ToolError::failed(e.to_string()))?;
                Ok(ToolCallResult::text(info))
            }
            "echo" => {
                let text = arguments
                    .get("text")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| ToolError::invalid("Missing 'text' parameter"))?;
                Ok(ToolCallResult::text(text))
            }
            other => Err(ToolError::NotFound(other.to_string())),
        }
    }
}
