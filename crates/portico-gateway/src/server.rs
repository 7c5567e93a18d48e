//! Gateway HTTP server with routing, discovery, REST tool endpoints and CORS

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use portico_core::GatewayConfig;
use portico_mcp::{JsonRpcRequest, handle};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info};

use crate::admin;
use crate::error::GatewayError;
use crate::protocol::{Directory, ServiceListing, ToolCallBody};
use crate::registry::ServiceRegistry;
use crate::session::SessionRegistry;
use crate::sse::{self, SseSettings};
use crate::stream;

/// Shared handler state
#[derive(Clone)]
pub struct GatewayState {
    pub registry: Arc<ServiceRegistry>,
    pub sessions: Arc<SessionRegistry>,
    pub sse: SseSettings,
}

/// The local gateway listener
pub struct GatewayServer {
    config: GatewayConfig,
    state: GatewayState,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig, registry: Arc<ServiceRegistry>) -> Self {
        let sse = SseSettings {
            keepalive: Duration::from_secs(config.sse_keepalive_secs),
            delivery_timeout: Duration::from_secs(config.sse_delivery_timeout_secs),
            ..SseSettings::default()
        };
        Self {
            config,
            state: GatewayState {
                registry,
                sessions: Arc::new(SessionRegistry::new()),
                sse,
            },
        }
    }

    pub fn with_sse_settings(mut self, sse: SseSettings) -> Self {
        self.state.sse = sse;
        self
    }

    pub fn state(&self) -> &GatewayState {
        &self.state
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.state.registry
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.state.sessions
    }

    /// Build the router. Every path, including unknown ones, gets CORS
    /// headers and an answered `OPTIONS` preflight.
    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Router::new()
            .route("/", get(directory))
            .route("/health", get(health))
            .route("/admin/services", get(admin::list_services))
            .route("/admin/services/{service}/enable", post(admin::enable_service))
            .route("/admin/services/{service}/disable", post(admin::disable_service))
            .route("/{service}", post(stream::open_stream))
            .route("/{service}/sse", get(sse::open_stream))
            .route("/{service}/message", post(sse::post_message))
            .route("/{service}/tools", get(list_tools))
            .route("/{service}/tools/call", post(call_tool))
            .with_state(self.state.clone())
            .layer(cors)
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = self.config.bind_string();
        TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind gateway to {}", addr))
    }

    /// Serve until `shutdown` is cancelled, then close event streams and run
    /// every service's cleanup hook
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let addr = listener.local_addr()?;
        info!(
            "Gateway listening on http://{} ({} services, {} enabled)",
            addr,
            self.state.registry.len(),
            self.state.registry.enabled().len()
        );

        let sessions = self.state.sessions.clone();
        let app = self.router().into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                info!("Gateway shutting down");
                sessions.close_all();
            })
            .await
            .context("Gateway server error")?;

        for (name, service) in self.state.registry.services() {
            debug!("Cleaning up service {}", name);
            service.cleanup().await;
        }
        Ok(())
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await
    }
}

/// `GET /`: enabled services only
async fn directory(State(state): State<GatewayState>) -> Json<Directory> {
    Json(Directory {
        name: "portico".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        services: state
            .registry
            .enabled()
            .into_iter()
            .map(ServiceListing::from)
            .collect(),
    })
}

async fn health(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "services": state.registry.enabled().len(),
        "sessions": state.sessions.count(),
    }))
}

/// `GET /<svc>/tools`
async fn list_tools(
    State(state): State<GatewayState>,
    Path(service): Path<String>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let hosted = state.registry.resolve(&service)?;
    Ok(Json(serde_json::json!({
        "success": true,
        "serverName": service,
        "tools": hosted.tools().list_tools(),
    })))
}

/// `POST /<svc>/tools/call` runs through the dispatcher so tool failures
/// and panics are handled the same way as on the streaming transports
async fn call_tool(
    State(state): State<GatewayState>,
    Path(service): Path<String>,
    body: Bytes,
) -> Result<Response, GatewayError> {
    let hosted = state.registry.resolve(&service)?;
    let call: ToolCallBody = serde_json::from_slice(&body)
        .map_err(|e| GatewayError::BadRequest(format!("Invalid tool call body: {}", e)))?;

    let arguments = if call.arguments.is_null() {
        serde_json::json!({})
    } else {
        call.arguments
    };
    let request = JsonRpcRequest::new(
        Some(serde_json::json!(1)),
        "tools/call",
        serde_json::json!({ "name": call.tool, "arguments": arguments }),
    );

    let response = handle(&hosted, request).await;
    Ok(match (response.result, response.error) {
        (Some(result), _) => Json(serde_json::json!({ "success": true, "result": result })).into_response(),
        (None, Some(err)) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "success": false, "error": err.message })),
        )
            .into_response(),
        (None, None) => Json(serde_json::json!({ "success": true, "result": null })).into_response(),
    })
}
