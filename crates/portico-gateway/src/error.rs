//! Gateway errors that surface before the JSON-RPC layer

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(
        "Server '{0}' is not enabled. Enable it with the enable-server operation (`portico enable {0}`, or POST /admin/services/{0}/enable on the gateway) and retry."
    )]
    ServiceDisabled(String),

    #[error("Service administration is only available from the local machine")]
    AdminForbidden,

    #[error("Server '{0}' not found")]
    UnknownService(String),

    #[error("Server '{0}' is already registered")]
    DuplicateService(String),

    #[error("{0}")]
    BadRequest(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::ServiceDisabled(_) | Self::AdminForbidden => StatusCode::FORBIDDEN,
            Self::UnknownService(_) => StatusCode::NOT_FOUND,
            Self::DuplicateService(_) => StatusCode::CONFLICT,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    fn server_name(&self) -> Option<&str> {
        match self {
            Self::ServiceDisabled(name) | Self::UnknownService(name) | Self::DuplicateService(name) => {
                Some(name)
            }
            Self::AdminForbidden | Self::BadRequest(_) => None,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let mut body = serde_json::json!({
            "success": false,
            "error": self.to_string(),
        });
        if let Some(name) = self.server_name() {
            body["serverName"] = serde_json::Value::String(name.to_string());
        }
        (self.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_response_shape() {
        let resp = GatewayError::ServiceDisabled("gmail".into()).into_response();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["serverName"], "gmail");
        let msg = body["error"].as_str().unwrap();
        assert!(msg.contains("not enabled"));
        assert!(msg.contains("portico enable gmail"));
        assert!(msg.contains("/admin/services/gmail/enable"));
    }

    #[tokio::test]
    async fn test_bad_request_has_no_server_name() {
        let resp = GatewayError::BadRequest("nope".into()).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(body.get("serverName").is_none());
    }
}
