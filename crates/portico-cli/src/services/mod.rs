//! Built-in tool services and registry assembly

pub mod filesystem;
pub mod system;

use std::sync::Arc;

use anyhow::Result;
use portico_core::{Config, HostedService};
use portico_gateway::ServiceRegistry;
use tracing::{info, warn};

pub use filesystem::FilesystemService;
pub use system::SystemService;

/// Names of every service this binary can host
pub const BUILTIN: &[&str] = &["filesystem", "system"];

/// Construct the built-in services and register them with the enabled
/// flags from `config`
pub fn build_registry(config: &Config) -> Result<ServiceRegistry> {
    let registry = ServiceRegistry::new();

    let fs_config = config.service("filesystem");
    let root = fs_config.setting_str("root").unwrap_or("~").to_string();
    let filesystem = Arc::new(FilesystemService::new(&root));
    info!("filesystem service rooted at {}", filesystem.root().display());
    registry.register(
        "filesystem",
        "Browse and read local files",
        HostedService::with_resources(filesystem),
        fs_config.enabled,
    )?;

    registry.register(
        "system",
        "Host information and connectivity check",
        HostedService::basic(Arc::new(SystemService::new())),
        config.service("system").enabled,
    )?;

    for name in config.services.keys() {
        if !BUILTIN.contains(&name.as_str()) {
            warn!("Ignoring configuration for unknown service '{}'", name);
        }
    }

    Ok(registry)
}
