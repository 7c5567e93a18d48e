//! JSON-RPC dispatcher
//!
//! Stateless: one request in, one response out. Every failure, including a
//! panicking tool, comes back as an error response rather than escaping.

use std::panic::AssertUnwindSafe;

use futures_util::FutureExt;
use portico_core::{HostedService, ToolError};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::protocol::*;

/// Handle a single JSON-RPC request against a hosted service
pub async fn handle(service: &HostedService, request: JsonRpcRequest) -> JsonRpcResponse {
    let id = request.id.clone().unwrap_or(Value::Null);

    match request.method.as_str() {
        methods::INITIALIZE => {
            let info = service.server_info();
            JsonRpcResponse::success(
                id,
                serde_json::json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": service.capabilities().to_json(),
                    "serverInfo": info,
                }),
            )
        }

        methods::INITIALIZED => {
            info!("MCP client initialized ({})", service.server_info().name);
            JsonRpcResponse::success(id, serde_json::json!({}))
        }

        methods::TOOLS_LIST => {
            let tools = service.tools().list_tools();
            debug!("MCP tools/list: returning {} tools", tools.len());
            JsonRpcResponse::success(id, serde_json::json!({ "tools": tools }))
        }

        methods::TOOLS_CALL => call_tool(service, id, &request.params).await,

        methods::RESOURCES_LIST => match service.resources() {
            Some(provider) => match guarded(provider.list_resources()).await {
                Ok(resources) => {
                    JsonRpcResponse::success(id, serde_json::json!({ "resources": resources }))
                }
                Err(e) => internal_error(id, "Failed to list resources", e),
            },
            None => JsonRpcResponse::success(id, serde_json::json!({ "resources": [] })),
        },

        methods::RESOURCES_READ => {
            let Some(provider) = service.resources() else {
                return internal_error(id, "Resource read failed", ToolError::Unsupported("Resources".into()));
            };
            let Some(uri) = request.params.get("uri").and_then(|v| v.as_str()) else {
                return JsonRpcResponse::error(id, INVALID_PARAMS, "Missing 'uri' parameter");
            };
            match guarded(provider.read_resource(uri)).await {
                Ok(contents) => {
                    JsonRpcResponse::success(id, serde_json::json!({ "contents": [contents] }))
                }
                Err(e) => internal_error(id, "Resource read failed", e),
            }
        }

        methods::PING => JsonRpcResponse::success(id, serde_json::json!({})),

        _ => {
            warn!("MCP unknown method: {}", request.method);
            JsonRpcResponse::error(
                id,
                METHOD_NOT_FOUND,
                format!("Method not found: {}", request.method),
            )
        }
    }
}

/// Whether a transport should write the dispatcher's response back.
///
/// Notifications get no correlated response, except the initialized
/// acknowledgement which clients expect even without an id.
pub fn should_reply(request: &JsonRpcRequest) -> bool {
    !request.is_notification() || request.method == methods::INITIALIZED
}

async fn call_tool(service: &HostedService, id: Value, params: &Value) -> JsonRpcResponse {
    let name = params.get("name").and_then(|v| v.as_str()).unwrap_or("");
    if name.is_empty() {
        return JsonRpcResponse::error(id, INVALID_PARAMS, "Missing 'name' parameter");
    }
    let arguments = params
        .get("arguments")
        .cloned()
        .unwrap_or_else(|| serde_json::json!({}));

    if let Err(e) = service.ensure_initialized().await {
        return internal_error(id, "Service initialization failed", e);
    }

    info!("MCP tools/call: {} ({})", name, service.server_info().name);
    match guarded(service.tools().call_tool(name, arguments)).await {
        Ok(result) => match serde_json::to_value(result) {
            Ok(value) => JsonRpcResponse::success(id, value),
            Err(e) => internal_error(id, "Tool execution failed", ToolError::failed(e.to_string())),
        },
        Err(e) => {
            warn!("Tool {} failed: {}", name, e);
            internal_error(id, "Tool execution failed", e)
        }
    }
}

/// Await a service future, turning a panic into a `ToolError`
async fn guarded<T, F>(fut: F) -> Result<T, ToolError>
where
    F: std::future::Future<Output = Result<T, ToolError>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(ToolError::failed(format!("service panicked: {}", msg)))
        }
    }
}

fn internal_error(id: Value, context: &str, err: ToolError) -> JsonRpcResponse {
    let detail = err.to_string();
    JsonRpcResponse::error_with_data(id, INTERNAL_ERROR, format!("{}: {}", context, detail), detail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use portico_core::{
        ResourceContents, ResourceDescriptor, ResourceProvider, ServerInfo, ToolCallResult,
        ToolDescriptor, ToolService, json_schema,
    };
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct TestService {
        init_calls: AtomicUsize,
    }

    #[async_trait]
    impl ToolService for TestService {
        fn server_info(&self) -> ServerInfo {
            ServerInfo::new("test-service", "1.2.3")
        }

        fn list_tools(&self) -> Vec<ToolDescriptor> {
            vec![
                ToolDescriptor {
                    name: "echo".into(),
                    description: "Echo the input".into(),
                    input_schema: json_schema(serde_json::json!({"text": {"type": "string"}}), vec!["text"]),
                },
                ToolDescriptor {
                    name: "explode".into(),
                    description: "Always fails".into(),
                    input_schema: json_schema(serde_json::json!({}), vec![]),
                },
            ]
        }

        async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolCallResult, ToolError> {
            match name {
                "echo" => Ok(ToolCallResult::text(
                    arguments["text"].as_str().unwrap_or_default().to_string(),
                )),
                "explode" => Err(ToolError::failed("kaboom")),
                "panic" => panic!("tool went sideways"),
                other => Err(ToolError::NotFound(other.to_string())),
            }
        }

        async fn initialize(&self) -> Result<(), ToolError> {
            self.init_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl ResourceProvider for TestService {
        async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>, ToolError> {
            Ok(vec![ResourceDescriptor {
                uri: "mem://greeting".into(),
                name: "greeting".into(),
                description: None,
                mime_type: Some("text/plain".into()),
            }])
        }

        async fn read_resource(&self, uri: &str) -> Result<ResourceContents, ToolError> {
            Ok(ResourceContents {
                uri: uri.to_string(),
                mime_type: Some("text/plain".into()),
                text: "hello".into(),
            })
        }
    }

    fn request(id: i64, method: &str, params: Value) -> JsonRpcRequest {
        JsonRpcRequest::new(Some(serde_json::json!(id)), method, params)
    }

    fn basic() -> HostedService {
        HostedService::basic(Arc::new(TestService::default()))
    }

    #[tokio::test]
    async fn test_initialize() {
        let resp = handle(&basic(), request(1, "initialize", Value::Null)).await;
        let result = resp.result.unwrap();
        assert_eq!(result["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(result["serverInfo"]["name"], "test-service");
        assert_eq!(result["serverInfo"]["version"], "1.2.3");
        assert!(result["capabilities"]["tools"].is_object());
        assert!(result["capabilities"].get("resources").is_none());
    }

    #[tokio::test]
    async fn test_tools_list_is_unmodified() {
        let service = basic();
        let resp = handle(&service, request(2, "tools/list", serde_json::json!({}))).await;
        let listed: Vec<ToolDescriptor> =
            serde_json::from_value(resp.result.unwrap()["tools"].clone()).unwrap();
        assert_eq!(listed, service.tools().list_tools());
    }

    #[tokio::test]
    async fn test_tools_call_success_runs_initialize_once() {
        let inner = Arc::new(TestService::default());
        let service = HostedService::basic(inner.clone());
        for i in 0..3 {
            let resp = handle(
                &service,
                request(i, "tools/call", serde_json::json!({"name": "echo", "arguments": {"text": "hi"}})),
            )
            .await;
            assert_eq!(resp.result.unwrap()["content"][0]["text"], "hi");
        }
        assert_eq!(inner.init_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_tools_call_missing_name() {
        let resp = handle(&basic(), request(3, "tools/call", serde_json::json!({}))).await;
        assert_eq!(resp.error.unwrap().code, INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_tools_call_error_is_wrapped() {
        let resp = handle(&basic(), request(4, "tools/call", serde_json::json!({"name": "explode"}))).await;
        let err = resp.error.unwrap();
        assert_eq!(err.code, INTERNAL_ERROR);
        assert!(err.message.contains("kaboom"));
        assert_eq!(err.data, Some(Value::String("kaboom".into())));
        assert_eq!(resp.id, serde_json::json!(4));
    }

    #[tokio::test]
    async fn test_tools_call_panic_is_contained() {
        let resp = handle(&basic(), request(5, "tools/call", serde_json::json!({"name": "panic"}))).await;
        let err = resp.error.unwrap();
        assert_eq!(err.code, INTERNAL_ERROR);
        assert!(err.message.contains("tool went sideways"));
    }

    #[tokio::test]
    async fn test_resources_without_support() {
        let service = basic();
        let list = handle(&service, request(6, "resources/list", Value::Null)).await;
        assert_eq!(list.result.unwrap()["resources"], serde_json::json!([]));

        let read = handle(&service, request(7, "resources/read", serde_json::json!({"uri": "x"}))).await;
        let err = read.error.unwrap();
        assert_eq!(err.code, INTERNAL_ERROR);
        assert!(err.message.contains("not supported"));
    }

    #[tokio::test]
    async fn test_resources_with_support() {
        let service = HostedService::with_resources(Arc::new(TestService::default()));
        let list = handle(&service, request(8, "resources/list", Value::Null)).await;
        assert_eq!(list.result.unwrap()["resources"][0]["uri"], "mem://greeting");

        let read = handle(&service, request(9, "resources/read", serde_json::json!({"uri": "mem://greeting"}))).await;
        assert_eq!(read.result.unwrap()["contents"][0]["text"], "hello");

        let missing = handle(&service, request(10, "resources/read", serde_json::json!({}))).await;
        assert_eq!(missing.error.unwrap().code, INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_ping_and_initialized() {
        let service = basic();
        let pong = handle(&service, request(11, "ping", Value::Null)).await;
        assert_eq!(pong.result.unwrap(), serde_json::json!({}));

        let ack = handle(&service, JsonRpcRequest::new(None, "notifications/initialized", Value::Null)).await;
        assert_eq!(ack.result.unwrap(), serde_json::json!({}));
        assert_eq!(ack.id, Value::Null);
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let resp = handle(&basic(), request(12, "unknown/method", Value::Null)).await;
        assert_eq!(resp.error.unwrap().code, METHOD_NOT_FOUND);
    }

    #[test]
    fn test_should_reply() {
        assert!(should_reply(&request(1, "tools/list", Value::Null)));
        assert!(should_reply(&JsonRpcRequest::new(None, "notifications/initialized", Value::Null)));
        assert!(!should_reply(&JsonRpcRequest::new(None, "notifications/cancelled", Value::Null)));
    }
}
