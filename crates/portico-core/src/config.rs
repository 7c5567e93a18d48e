//! Application configuration loaded from `config.toml`

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// Per-service settings keyed by service name
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
    #[serde(default)]
    pub tunnel: TunnelConfig,
}

/// Local HTTP listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Interval between `: keepalive` comments on event streams
    #[serde(default = "default_keepalive")]
    pub sse_keepalive_secs: u64,
    /// How long a posted message waits for a push connection before it is dropped
    #[serde(default = "default_delivery_timeout")]
    pub sse_delivery_timeout_secs: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_keepalive() -> u64 {
    30
}
fn default_delivery_timeout() -> u64 {
    20
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            sse_keepalive_secs: default_keepalive(),
            sse_delivery_timeout_secs: default_delivery_timeout(),
        }
    }
}

impl GatewayConfig {
    pub fn bind_string(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Loopback URL the tunnel uses to reach this gateway
    pub fn local_url(&self) -> String {
        let host = match self.host.as_str() {
            "0.0.0.0" | "::" | "[::]" => "127.0.0.1",
            other => other,
        };
        format!("http://{}:{}", host, self.port)
    }
}

/// Settings for one hosted service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Service-specific keys (e.g. `root` for the filesystem service)
    #[serde(flatten)]
    pub settings: BTreeMap<String, toml::Value>,
}

fn default_true() -> bool {
    true
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            settings: BTreeMap::new(),
        }
    }
}

impl ServiceConfig {
    pub fn setting_str(&self, key: &str) -> Option<&str> {
        self.settings.get(key).and_then(|v| v.as_str())
    }
}

/// Public relay settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Public server name; prompted for interactively when unset
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_relay_ws_url")]
    pub relay_ws_url: String,
    #[serde(default = "default_relay_api_url")]
    pub relay_api_url: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub owner_email: Option<String>,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_relay_ws_url() -> String {
    "wss://relay.example.com/tunnel".to_string()
}
fn default_relay_api_url() -> String {
    "https://relay.example.com/api".to_string()
}
fn default_reconnect_delay() -> u64 {
    5
}
fn default_connect_timeout() -> u64 {
    90
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            name: None,
            relay_ws_url: default_relay_ws_url(),
            relay_api_url: default_relay_api_url(),
            description: String::new(),
            owner_email: None,
            reconnect_delay_secs: default_reconnect_delay(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl Config {
    /// Settings for a service, falling back to defaults (enabled, no keys)
    pub fn service(&self, name: &str) -> ServiceConfig {
        self.services.get(name).cloned().unwrap_or_default()
    }
}

/// `<config dir>/portico/config.toml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("portico").join("config.toml"))
}

/// Load configuration from `path`, or from the default location.
/// A missing file yields the default configuration.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = match path {
        Some(p) => expand_home(&p.to_string_lossy()),
        None => match default_config_path() {
            Some(p) => p,
            None => return Ok(Config::default()),
        },
    };

    if !path.exists() {
        debug!("No config file at {}, using defaults", path.display());
        return Ok(Config::default());
    }

    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    info!("Loaded config from {}", path.display());
    Ok(config)
}

/// Expand a leading `~/` against the home directory
pub fn expand_home(s: &str) -> PathBuf {
    if s == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    if let Some(rest) = s.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    PathBuf::from(s)
}
