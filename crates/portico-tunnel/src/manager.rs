//! Tunnel manager — one tunnel client per public server name, plus relay
//! permission pass-throughs

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use portico_core::TunnelConfig;
use serde::Serialize;
use tracing::{info, warn};

use crate::client::{NamePrompt, Registration, TunnelClient, TunnelOptions, TunnelStatus};
use crate::error::{RelayError, TunnelError};
use crate::log::LogEntry;
use crate::relay::{
    ExistingRegistration, NewPermissions, PermissionGrant, PermissionRecord, PermissionUpdate,
    RelayApi, server_key_for,
};

/// Relay endpoints and timing shared by every managed tunnel
#[derive(Debug, Clone)]
pub struct TunnelSettings {
    pub relay_ws_url: String,
    pub relay_api_url: String,
    pub description: String,
    pub owner_email: Option<String>,
    pub reconnect_delay: Duration,
    pub connect_timeout: Duration,
    pub poll_interval: Duration,
}

impl From<&TunnelConfig> for TunnelSettings {
    fn from(config: &TunnelConfig) -> Self {
        Self {
            relay_ws_url: config.relay_ws_url.clone(),
            relay_api_url: config.relay_api_url.clone(),
            description: config.description.clone(),
            owner_email: config.owner_email.clone(),
            reconnect_delay: Duration::from_secs(config.reconnect_delay_secs),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Result of `start_tunnel`
#[derive(Debug, Clone, Serialize)]
pub struct StartedTunnel {
    pub status: TunnelStatus,
    /// Set when the tunnel was already connected and nothing was done
    pub warning: Option<String>,
}

/// Status plus the recent connection log
#[derive(Debug, Clone, Serialize)]
pub struct TunnelInfo {
    pub status: TunnelStatus,
    pub log: Vec<LogEntry>,
}

pub struct TunnelManager {
    settings: TunnelSettings,
    tunnels: DashMap<String, TunnelClient>,
}

impl TunnelManager {
    pub fn new(settings: TunnelSettings) -> Self {
        Self {
            settings,
            tunnels: DashMap::new(),
        }
    }

    pub fn settings(&self) -> &TunnelSettings {
        &self.settings
    }

    /// Register `name`, start its tunnel to `local_url`, and wait until the
    /// relay has assigned a public URL
    pub async fn start_tunnel(&self, name: &str, local_url: &str) -> Result<StartedTunnel, TunnelError> {
        let existing = self.tunnels.get(name).map(|c| c.value().clone());
        if let Some(client) = existing {
            if client.is_connected() {
                let warning = format!("Tunnel '{}' is already connected", name);
                warn!("{}", warning);
                return Ok(StartedTunnel {
                    status: client.status(),
                    warning: Some(warning),
                });
            }
            info!("Replacing disconnected tunnel '{}'", name);
            client.stop().await;
            self.tunnels.remove(name);
        }

        let options = TunnelOptions::new(local_url, &self.settings.relay_ws_url, &self.settings.relay_api_url)
            .with_name(name)
            .with_description(self.settings.description.clone())
            .with_owner_email(self.settings.owner_email.clone())
            .with_reconnect_delay(self.settings.reconnect_delay)
            .with_registration(Registration::Skip);

        let relay = RelayApi::new(&self.settings.relay_api_url);
        match relay.register(&options.registration_request(name)).await {
            Ok(_) => info!("Registered '{}' with relay", name),
            Err(RelayError::NameTaken { existing, .. })
                if same_owner(existing.as_ref(), self.settings.owner_email.as_deref()) =>
            {
                info!("'{}' is already registered to this owner", name);
            }
            Err(e) => return Err(e.into()),
        }

        let client = TunnelClient::new(options);
        client.start().await?;
        self.tunnels.insert(name.to_string(), client.clone());
        self.wait_connected(name, client).await
    }

    /// Prompt for a public name until one registers, then start its tunnel
    pub async fn start_tunnel_interactive(
        &self,
        local_url: &str,
        prompt: Arc<dyn NamePrompt>,
    ) -> Result<StartedTunnel, TunnelError> {
        let options = TunnelOptions::new(local_url, &self.settings.relay_ws_url, &self.settings.relay_api_url)
            .with_description(self.settings.description.clone())
            .with_owner_email(self.settings.owner_email.clone())
            .with_reconnect_delay(self.settings.reconnect_delay)
            .with_registration(Registration::Interactive(prompt));

        let client = TunnelClient::new(options);
        client.start().await?;
        let name = client.name().unwrap_or_default();
        if let Some(previous) = self.tunnels.insert(name.clone(), client.clone()) {
            previous.stop().await;
        }
        self.wait_connected(&name, client).await
    }

    /// Poll until the relay has assigned a public URL; on timeout stop the
    /// client and report its last error and log
    async fn wait_connected(&self, name: &str, client: TunnelClient) -> Result<StartedTunnel, TunnelError> {
        let deadline = tokio::time::Instant::now() + self.settings.connect_timeout;
        loop {
            if client.is_connected() {
                info!(
                    "Tunnel '{}' is live at {}",
                    name,
                    client.public_url().unwrap_or_default()
                );
                return Ok(StartedTunnel {
                    status: client.status(),
                    warning: None,
                });
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }

        let last_error = client
            .last_error()
            .unwrap_or_else(|| "none reported".to_string());
        let log = client.connection_log();
        client.stop().await;
        self.tunnels.remove(name);
        warn!("Tunnel '{}' failed to connect: {}", name, last_error);
        Err(TunnelError::Timeout {
            name: name.to_string(),
            waited_secs: self.settings.connect_timeout.as_secs(),
            last_error,
            log,
        })
    }

    /// Stop and forget a tunnel. Returns whether one existed.
    pub async fn stop_tunnel(&self, name: &str) -> bool {
        match self.tunnels.remove(name) {
            Some((_, client)) => {
                client.stop().await;
                info!("Tunnel '{}' stopped", name);
                true
            }
            None => false,
        }
    }

    pub fn get_tunnel_status(&self, name: &str) -> Option<TunnelStatus> {
        self.tunnels.get(name).map(|c| c.status())
    }

    pub fn get_tunnel_info(&self, name: &str) -> Option<TunnelInfo> {
        self.tunnels.get(name).map(|c| TunnelInfo {
            status: c.status(),
            log: c.connection_log(),
        })
    }

    pub fn get_active_tunnels(&self) -> Vec<TunnelStatus> {
        let mut list: Vec<TunnelStatus> = self.tunnels.iter().map(|c| c.status()).collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    pub async fn stop_all_tunnels(&self) {
        let names: Vec<String> = self.tunnels.iter().map(|e| e.key().clone()).collect();
        for name in names {
            self.stop_tunnel(&name).await;
        }
    }

    // ── Permissions (no local state; each call uses a fresh relay client) ──

    pub async fn add_permissions(
        &self,
        server_name: &str,
        emails: Vec<String>,
        grant: PermissionGrant,
    ) -> Result<Vec<PermissionRecord>, RelayError> {
        let emails: Vec<String> = emails
            .into_iter()
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty())
            .collect();
        self.relay()
            .add_permissions(&NewPermissions {
                server_key: server_key_for(server_name),
                emails,
                grant,
            })
            .await
    }

    pub async fn get_permissions(&self, server_name: &str) -> Result<Vec<PermissionRecord>, RelayError> {
        self.relay().get_permissions(&server_key_for(server_name)).await
    }

    pub async fn update_permission(
        &self,
        id: &str,
        update: PermissionUpdate,
    ) -> Result<PermissionRecord, RelayError> {
        self.relay().update_permission(id, &update).await
    }

    pub async fn revoke_permission(&self, id: &str) -> Result<(), RelayError> {
        self.relay().revoke_permission(id).await
    }

    fn relay(&self) -> RelayApi {
        RelayApi::new(&self.settings.relay_api_url)
    }
}

/// A name conflict is a re-registration only when the existing record names
/// an owner and it is ours (compared case-insensitively). Without an owner on
/// both sides there is nothing to prove ownership with.
fn same_owner(existing: Option<&ExistingRegistration>, owner_email: Option<&str>) -> bool {
    let theirs = existing
        .and_then(|e| e.owner_email.as_deref())
        .map(str::trim)
        .filter(|e| !e.is_empty());
    let ours = owner_email.map(str::trim).filter(|e| !e.is_empty());
    match (theirs, ours) {
        (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
        _ => false,
    }
}
