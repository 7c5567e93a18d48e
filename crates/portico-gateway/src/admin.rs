//! Runtime service administration
//!
//! `POST /admin/services/{svc}/enable` and `/disable` flip a service's
//! enabled flag on the running gateway; the next routed request sees the new
//! state. Only peers on the loopback interface may call these. Requests
//! relayed through the tunnel never reach them (the tunnel client refuses
//! `/admin` paths).

use std::net::SocketAddr;

use axum::Json;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::Extensions;
use serde::Serialize;
use tracing::warn;

use crate::error::GatewayError;
use crate::registry::ServiceRegistration;
use crate::server::GatewayState;

/// Path prefix reserved for administration
pub const ADMIN_PREFIX: &str = "/admin";

#[derive(Debug, Serialize)]
pub struct ServiceState {
    pub success: bool,
    #[serde(rename = "serverName")]
    pub server_name: String,
    pub enabled: bool,
}

/// Refuse callers that are not on this machine. A request without a peer
/// address (in-process) is local by definition.
fn require_local(extensions: &Extensions) -> Result<(), GatewayError> {
    match extensions.get::<ConnectInfo<SocketAddr>>() {
        Some(ConnectInfo(peer)) if !peer.ip().is_loopback() => {
            warn!("Refusing service administration from {}", peer);
            Err(GatewayError::AdminForbidden)
        }
        _ => Ok(()),
    }
}

/// `GET /admin/services`: every registration with its enabled flag
pub async fn list_services(
    State(state): State<GatewayState>,
    extensions: Extensions,
) -> Result<Json<Vec<ServiceRegistration>>, GatewayError> {
    require_local(&extensions)?;
    Ok(Json(state.registry.list()))
}

/// `POST /admin/services/{svc}/enable`
pub async fn enable_service(
    State(state): State<GatewayState>,
    Path(service): Path<String>,
    extensions: Extensions,
) -> Result<Json<ServiceState>, GatewayError> {
    set_enabled(&state, &service, true, &extensions)
}

/// `POST /admin/services/{svc}/disable`
pub async fn disable_service(
    State(state): State<GatewayState>,
    Path(service): Path<String>,
    extensions: Extensions,
) -> Result<Json<ServiceState>, GatewayError> {
    set_enabled(&state, &service, false, &extensions)
}

fn set_enabled(
    state: &GatewayState,
    service: &str,
    enabled: bool,
    extensions: &Extensions,
) -> Result<Json<ServiceState>, GatewayError> {
    require_local(extensions)?;
    state.registry.set_enabled(service, enabled)?;
    Ok(Json(ServiceState {
        success: true,
        server_name: service.to_string(),
        enabled,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_local() {
        let mut ext = Extensions::new();
        assert!(require_local(&ext).is_ok());

        ext.insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 4000))));
        assert!(require_local(&ext).is_ok());

        ext.insert(ConnectInfo(SocketAddr::from(([0, 0, 0, 0, 0, 0, 0, 1], 4000))));
        assert!(require_local(&ext).is_ok());

        ext.insert(ConnectInfo(SocketAddr::from(([192, 168, 1, 20], 4000))));
        assert!(matches!(require_local(&ext), Err(GatewayError::AdminForbidden)));
    }
}
