//! portico — host MCP tool services locally and expose them through a relay
//!
//! Usage:
//!   portico serve [--port 8080] [--enable <svc>] [--disable <svc>] [--tunnel <name>]
//!   portico services
//!   portico enable <service> | portico disable <service>
//!   portico permissions list <server>

mod services;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use portico_core::{Config, load_config};
use portico_gateway::GatewayServer;
use portico_tunnel::{
    PermissionGrant, PermissionStatus, PermissionUpdate, StdinPrompt, TunnelManager, TunnelSettings,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "portico", version, about = "Local MCP tool gateway with a public relay tunnel")]
struct Cli {
    /// Config file (default: <config dir>/portico/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway (and the tunnel, if configured)
    Serve(ServeArgs),
    /// List hosted services and whether they are enabled
    Services,
    /// Enable a service on the running gateway
    Enable { service: String },
    /// Disable a service on the running gateway
    Disable { service: String },
    /// Manage who may reach a server through the relay
    Permissions {
        #[command(subcommand)]
        action: PermissionAction,
    },
}

#[derive(Args, Default)]
struct ServeArgs {
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    /// Enable a service (repeatable)
    #[arg(long = "enable", value_name = "SERVICE")]
    enable: Vec<String>,
    /// Disable a service (repeatable)
    #[arg(long = "disable", value_name = "SERVICE")]
    disable: Vec<String>,
    /// Open a relay tunnel under this public name
    #[arg(long, value_name = "NAME")]
    tunnel: Option<String>,
}

#[derive(Subcommand)]
enum PermissionAction {
    /// Show permissions for a server
    List { server: String },
    /// Grant access to one or more email addresses
    Add {
        server: String,
        #[arg(required = true)]
        emails: Vec<String>,
        /// Relay access tier, e.g. read_only
        #[arg(long)]
        access_level: Option<String>,
        #[arg(long)]
        expires_at: Option<String>,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Change a permission's status, access level, expiry, or notes
    Update {
        id: String,
        #[arg(long)]
        status: Option<PermissionStatus>,
        #[arg(long)]
        access_level: Option<String>,
        #[arg(long)]
        expires_at: Option<String>,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Revoke a permission
    Revoke { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = load_config(cli.config.as_deref())?;
    match cli.command {
        Commands::Serve(args) => {
            apply_overrides(&mut config, &args);
            serve(config).await
        }
        Commands::Services => list_services(&config),
        Commands::Enable { service } => set_service_enabled(&config, &service, true).await,
        Commands::Disable { service } => set_service_enabled(&config, &service, false).await,
        Commands::Permissions { action } => permissions(&config, action).await,
    }
}

/// Log to stderr; `RUST_LOG` wins unless `--verbose` is given
fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn apply_overrides(config: &mut Config, args: &ServeArgs) {
    if let Some(host) = &args.host {
        config.gateway.host = host.clone();
    }
    if let Some(port) = args.port {
        config.gateway.port = port;
    }
    for name in &args.enable {
        config.services.entry(name.clone()).or_default().enabled = true;
    }
    for name in &args.disable {
        config.services.entry(name.clone()).or_default().enabled = false;
    }
    if let Some(name) = &args.tunnel {
        config.tunnel.enabled = true;
        config.tunnel.name = Some(name.clone());
    }
}

async fn serve(config: Config) -> Result<()> {
    let registry = Arc::new(services::build_registry(&config)?);
    let server = GatewayServer::new(config.gateway.clone(), registry);
    let listener = server.bind().await?;
    let local_url = config.gateway.local_url();

    let shutdown = CancellationToken::new();
    let mut gateway = tokio::spawn(server.serve(listener, shutdown.clone()));
    println!("Portico gateway running at {}", local_url);

    let manager = Arc::new(TunnelManager::new(TunnelSettings::from(&config.tunnel)));
    if config.tunnel.enabled {
        let manager = manager.clone();
        let name = config.tunnel.name.clone();
        let local_url = local_url.clone();
        tokio::spawn(async move {
            let started = match name {
                Some(name) => manager.start_tunnel(&name, &local_url).await,
                None => {
                    manager
                        .start_tunnel_interactive(&local_url, Arc::new(StdinPrompt))
                        .await
                }
            };
            match started {
                Ok(started) => {
                    if let Some(warning) = started.warning {
                        warn!("{}", warning);
                    }
                    if let Some(url) = started.status.public_url {
                        println!("Public URL: {}", url);
                    }
                }
                Err(e) => error!("Tunnel failed to start: {}", e),
            }
        });
    }

    tokio::select! {
        _ = shutdown_signal() => info!("Shutdown requested"),
        result = &mut gateway => {
            manager.stop_all_tunnels().await;
            return result.context("Gateway task failed")?;
        }
    }

    manager.stop_all_tunnels().await;
    shutdown.cancel();
    gateway.await.context("Gateway task failed")??;
    info!("Portico stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn list_services(config: &Config) -> Result<()> {
    let registry = services::build_registry(config)?;
    for service in registry.list() {
        println!(
            "{:<12} {:<9} {}",
            service.name,
            if service.enabled { "enabled" } else { "disabled" },
            service.description
        );
    }
    Ok(())
}

fn admin_url(config: &Config, service: &str, enabled: bool) -> String {
    format!(
        "{}/admin/services/{}/{}",
        config.gateway.local_url(),
        service,
        if enabled { "enable" } else { "disable" }
    )
}

/// Flip a service on the gateway that is already running from this config
async fn set_service_enabled(config: &Config, service: &str, enabled: bool) -> Result<()> {
    let url = admin_url(config, service, enabled);
    let resp = reqwest::Client::new()
        .post(&url)
        .send()
        .await
        .with_context(|| format!("Gateway not reachable at {} (is `portico serve` running?)", url))?;

    let status = resp.status();
    let body: serde_json::Value = resp.json().await.unwrap_or_default();
    if !status.is_success() {
        let message = body["error"].as_str().unwrap_or("unknown error");
        anyhow::bail!("Gateway refused ({}): {}", status, message);
    }
    println!(
        "{} {}",
        service,
        if enabled { "enabled" } else { "disabled" }
    );
    Ok(())
}

async fn permissions(config: &Config, action: PermissionAction) -> Result<()> {
    let manager = TunnelManager::new(TunnelSettings::from(&config.tunnel));
    let output = match action {
        PermissionAction::List { server } => {
            serde_json::to_value(manager.get_permissions(&server).await?)?
        }
        PermissionAction::Add {
            server,
            emails,
            access_level,
            expires_at,
            notes,
        } => {
            let grant = PermissionGrant {
                access_level,
                expires_at,
                notes,
            };
            serde_json::to_value(manager.add_permissions(&server, emails, grant).await?)?
        }
        PermissionAction::Update {
            id,
            status,
            access_level,
            expires_at,
            notes,
        } => {
            let update = PermissionUpdate {
                status,
                access_level,
                expires_at,
                notes,
            };
            serde_json::to_value(manager.update_permission(&id, update).await?)?
        }
        PermissionAction::Revoke { id } => {
            manager.revoke_permission(&id).await?;
            serde_json::json!({ "revoked": id })
        }
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
