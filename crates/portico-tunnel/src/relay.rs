//! Relay REST client for server registration and access permissions

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::RelayError;

static NON_ALNUM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9]+").expect("valid regex"));

/// Deterministic relay key for a server name: lowercased, runs of
/// non-alphanumerics collapsed to `-`, no leading or trailing `-`
pub fn server_key_for(name: &str) -> String {
    let lower = name.to_lowercase();
    NON_ALNUM
        .replace_all(&lower, "-")
        .trim_matches('-')
        .to_string()
}

/// `POST /register` body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub server_key: String,
    pub connection_url: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_email: Option<String>,
}

impl RegisterRequest {
    pub fn new(name: &str, connection_url: &str, description: &str, owner_email: Option<String>) -> Self {
        Self {
            name: name.to_string(),
            server_key: server_key_for(name),
            connection_url: connection_url.to_string(),
            description: description.to_string(),
            owner_email,
        }
    }
}

/// Successful registration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationRecord {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub owner_permission_added: Option<bool>,
}

/// The record that already holds a name (409 body `existing_record`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExistingRegistration {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub server_key: Option<String>,
    #[serde(default)]
    pub owner_email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConflictBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    existing_record: Option<ExistingRegistration>,
}

/// Permission lifecycle on the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionStatus {
    Pending,
    Active,
    Revoked,
    Expired,
}

impl std::fmt::Display for PermissionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Revoked => "revoked",
            Self::Expired => "expired",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for PermissionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "revoked" => Ok(Self::Revoked),
            "expired" => Ok(Self::Expired),
            other => Err(format!("Unknown permission status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRecord {
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_key: Option<String>,
    pub email: String,
    pub status: PermissionStatus,
    /// Relay-defined access tier, e.g. `read_only`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

/// Optional attributes applied to every email in a grant
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermissionGrant {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// `POST /permissions` body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPermissions {
    pub server_key: String,
    pub emails: Vec<String>,
    #[serde(flatten)]
    pub grant: PermissionGrant,
}

/// `PATCH /permissions/{id}` body
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermissionUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PermissionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl PermissionUpdate {
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.access_level.is_none()
            && self.expires_at.is_none()
            && self.notes.is_none()
    }
}

/// Client for the relay's REST API
#[derive(Clone)]
pub struct RelayApi {
    http: Client,
    base_url: String,
}

impl RelayApi {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("failed to build HTTP client"),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Register a server name. A 409 becomes [`RelayError::NameTaken`].
    pub async fn register(&self, request: &RegisterRequest) -> Result<RegistrationRecord, RelayError> {
        if request.name.trim().is_empty() || request.server_key.is_empty() {
            return Err(RelayError::Validation(
                "Server name must contain at least one letter or digit".to_string(),
            ));
        }

        debug!("Registering '{}' (key {}) with relay", request.name, request.server_key);
        let resp = self.http.post(self.url("/register")).json(request).send().await?;

        if resp.status() == StatusCode::CONFLICT {
            let body = resp.text().await.unwrap_or_default();
            let conflict: Option<ConflictBody> = serde_json::from_str(&body).ok();
            let (message, existing) = match conflict {
                Some(c) => (c.message.unwrap_or_else(|| "name taken".to_string()), c.existing_record),
                None => (body, None),
            };
            return Err(RelayError::NameTaken {
                name: request.name.clone(),
                message,
                existing,
            });
        }

        let record: RegistrationRecord = Self::json(resp).await?;
        info!("Registered '{}' with relay", request.name);
        Ok(record)
    }

    pub async fn add_permissions(&self, request: &NewPermissions) -> Result<Vec<PermissionRecord>, RelayError> {
        if request.server_key.trim().is_empty() {
            return Err(RelayError::Validation("server_key is required".to_string()));
        }
        if request.emails.is_empty() || request.emails.iter().any(|e| !e.contains('@')) {
            return Err(RelayError::Validation(
                "At least one valid email address is required".to_string(),
            ));
        }

        let resp = self.http.post(self.url("/permissions")).json(request).send().await?;
        let value: Value = Self::json(resp).await?;
        permission_list(value)
    }

    pub async fn get_permissions(&self, server_key: &str) -> Result<Vec<PermissionRecord>, RelayError> {
        if server_key.trim().is_empty() {
            return Err(RelayError::Validation("server_key is required".to_string()));
        }
        let resp = self
            .http
            .get(self.url(&format!("/permissions/{}", server_key)))
            .send()
            .await?;
        let value: Value = Self::json(resp).await?;
        permission_list(value)
    }

    pub async fn update_permission(
        &self,
        id: &str,
        update: &PermissionUpdate,
    ) -> Result<PermissionRecord, RelayError> {
        if id.trim().is_empty() {
            return Err(RelayError::Validation("Permission id is required".to_string()));
        }
        if update.is_empty() {
            return Err(RelayError::Validation(
                "Nothing to update: set a status, access level, expiry, or notes".to_string(),
            ));
        }
        let resp = self
            .http
            .patch(self.url(&format!("/permissions/{}", id)))
            .json(update)
            .send()
            .await?;
        let mut value: Value = Self::json(resp).await?;
        if let Some(inner) = value.get_mut("permission") {
            value = inner.take();
        }
        decode(value)
    }

    pub async fn revoke_permission(&self, id: &str) -> Result<(), RelayError> {
        if id.trim().is_empty() {
            return Err(RelayError::Validation("Permission id is required".to_string()));
        }
        let resp = self
            .http
            .delete(self.url(&format!("/permissions/{}", id)))
            .send()
            .await?;
        Self::check(resp).await?;
        info!("Revoked permission {}", id);
        Ok(())
    }

    async fn check(resp: Response) -> Result<Response, RelayError> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        Err(RelayError::Http { status, body })
    }

    async fn json<T: DeserializeOwned>(resp: Response) -> Result<T, RelayError> {
        let resp = Self::check(resp).await?;
        Ok(resp.json().await?)
    }
}

/// Permission lists come back bare or wrapped as `{permissions: [...]}`
fn permission_list(mut value: Value) -> Result<Vec<PermissionRecord>, RelayError> {
    if let Some(inner) = value.get_mut("permissions") {
        value = inner.take();
    }
    decode(value)
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, RelayError> {
    serde_json::from_value(value)
        .map_err(|e| RelayError::Validation(format!("Unexpected relay response: {}", e)))
}
