// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Dev Tunnel Provisioner Contributors

// Dev Tunnel Provisioner - CLI
// Provisions dev tunnels and hosts them until interrupted

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use comfy_table::{Attribute, Cell, Color, ContentArrangement, Table};
use dialoguer::Confirm;
use futures::future::join_all;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use devtunnel_common::{
    obfuscate_token, AccessMode, PortSpec, ProvisionEvent, ProvisionerConfig, TunnelDeclaration,
    TunnelSummary,
};
use devtunnel_provisioner::{
    AgentRunner, HostEvent, LifecycleBinder, ProcessRunner, TunnelProvider, TunnelResource,
    ENV_AUTH_TOKEN, MAKE_PUBLIC_CONFIRMATION,
};

/// Printed by `host` once the relay accepts connections
const HOST_READY_MARKER: &str = "Ready to accept connections";

#[derive(Parser)]
#[command(name = "tunnel-provisioner")]
#[command(about = "Provision and host dev tunnels", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (default: user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision tunnels and host them until Ctrl+C
    Up {
        /// Tunnel name (all configured tunnels if omitted)
        name: Option<String>,

        /// Port to forward, as PORT or PORT:PROTOCOL (http, https, tcp)
        #[arg(short = 'p', long = "port")]
        ports: Vec<PortSpec>,

        /// Allow anonymous connections
        #[arg(long)]
        anonymous: bool,
    },

    /// Print a connect token for a tunnel
    Token {
        /// Tunnel name
        name: String,
    },

    /// Allow anonymous connections to a tunnel
    MakePublic {
        /// Tunnel name
        name: String,

        /// Skip the confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// Require a connect token for a tunnel again
    MakePrivate {
        /// Tunnel name
        name: String,
    },

    /// List tunnels owned by the signed-in user
    List,

    /// Show what the agent knows about a tunnel
    Status {
        /// Tunnel name
        name: String,
    },

    /// Show the configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "devtunnel_provisioner=info,tunnel_provisioner=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let (config, config_path) = config::load(cli.config.as_deref())?;
    let config = Arc::new(config);
    let runner: Arc<dyn ProcessRunner> = Arc::new(AgentRunner::new());

    match cli.command {
        Commands::Up {
            name,
            ports,
            anonymous,
        } => {
            let declarations = config::select_tunnels(&config, name.as_deref(), &ports, anonymous)?;
            up(runner, config, declarations).await?;
        }
        Commands::Token { name } => {
            print_token(runner, config, name).await?;
        }
        Commands::MakePublic { name, yes } => {
            make_public(runner, config, name, yes).await?;
        }
        Commands::MakePrivate { name } => {
            make_private(runner, config, name).await?;
        }
        Commands::List => {
            list_tunnels(runner, config).await?;
        }
        Commands::Status { name } => {
            show_status(runner, config, name).await?;
        }
        Commands::Config => {
            show_config(&config, &config_path)?;
        }
    }

    Ok(())
}

fn new_provider(runner: &Arc<dyn ProcessRunner>, config: &Arc<ProvisionerConfig>) -> TunnelProvider {
    TunnelProvider::new(runner.clone(), config.clone())
}

fn spinner(message: String) -> Result<ProgressBar> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?);
    spinner.set_message(message);
    spinner.enable_steady_tick(Duration::from_millis(100));
    Ok(spinner)
}

async fn up(
    runner: Arc<dyn ProcessRunner>,
    config: Arc<ProvisionerConfig>,
    declarations: Vec<TunnelDeclaration>,
) -> Result<()> {
    let mut binders = Vec::new();
    for declaration in declarations {
        let provider = Arc::new(new_provider(&runner, &config));
        let resource = TunnelResource::declare(declaration, provider)?;
        binders.push(Arc::new(LifecycleBinder::new(Arc::new(resource))));
    }

    let shutdown = CancellationToken::new();
    let signal_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = wait_for_shutdown().await {
                error!("Failed to listen for shutdown signals: {}", e);
            }
            shutdown.cancel();
        })
    };

    let names: Vec<&str> = binders.iter().map(|b| b.resource().name()).collect();
    let progress = spinner(format!("Provisioning {}...", names.join(", ")))?;

    let results = join_all(binders.iter().map(|binder| {
        binder.dispatch(HostEvent::BeforeStart {
            cancel: shutdown.child_token(),
        })
    }))
    .await;
    progress.finish_and_clear();

    let mut running = Vec::new();
    for (binder, result) in binders.iter().zip(results) {
        let name = binder.resource().name();
        match result {
            Ok(()) => {
                println!(
                    "{}",
                    format!("✓ Tunnel '{}' is hosting", name).green().bold()
                );
                print_resource(binder.resource(), &shutdown).await;
                watch_host(binder.clone());
                running.push(binder.clone());
            }
            Err(e) if e.is_cancelled() => {
                println!("{}", format!("Provisioning of '{}' cancelled", name).yellow());
            }
            Err(e) => {
                eprintln!("{}", format!("✗ Tunnel '{}' failed: {}", name, e).red());
            }
        }
    }

    if running.is_empty() {
        signal_task.abort();
        anyhow::bail!("No tunnel could be started");
    }

    println!();
    println!("{}", "Tunnels are running. Press Ctrl+C to stop".dimmed());

    shutdown.cancelled().await;

    println!();
    println!("{}", "Stopping tunnels...".yellow());
    let results = join_all(running.iter().map(|binder| binder.dispatch(HostEvent::Stop))).await;
    for (binder, result) in running.iter().zip(results) {
        match result {
            Ok(()) => println!("  {} {}", "✓".green(), binder.resource().name()),
            Err(e) => eprintln!(
                "  {} {}: {}",
                "✗".red(),
                binder.resource().name(),
                e.to_string().red()
            ),
        }
    }

    Ok(())
}

/// Print URLs and the environment for dependent processes
async fn print_resource(resource: &TunnelResource, cancel: &CancellationToken) {
    for url in resource.urls().await {
        println!("  {:<12} {}", url.display_text.bold(), url.url.cyan());
    }

    match resource.environment(cancel).await {
        Ok(env) => {
            println!("  {}", "Environment:".dimmed());
            for (key, value) in env {
                let value = if key == ENV_AUTH_TOKEN {
                    obfuscate_token(&value)
                } else {
                    value
                };
                println!("    {}={}", key, value.dimmed());
            }
        }
        Err(e) => warn!("Failed to build environment for {}: {}", resource.name(), e),
    }
}

/// Refresh metadata once the host session reports it is accepting
/// connections, and print the URIs that appeared
fn watch_host(binder: Arc<LifecycleBinder>) {
    let mut events = binder.resource().subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ProvisionEvent::HostOutput { line }) if line.contains(HOST_READY_MARKER) => {
                    if let Err(e) = binder.dispatch(HostEvent::Started).await {
                        warn!("Failed to refresh {}: {}", binder.resource().name(), e);
                        continue;
                    }
                    for url in binder.resource().urls().await {
                        info!("{} available at {}", url.display_text, url.url);
                    }
                }
                Ok(ProvisionEvent::Stopped) | Err(RecvError::Closed) => break,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
            }
        }
    });
}

async fn print_token(
    runner: Arc<dyn ProcessRunner>,
    config: Arc<ProvisionerConfig>,
    name: String,
) -> Result<()> {
    let provider = new_provider(&runner, &config);
    let cancel = CancellationToken::new();

    provider
        .ensure_tunnel(&name, &cancel)
        .await
        .with_context(|| format!("Failed to resolve tunnel '{}'", name))?;
    let token = provider
        .access_token(&cancel)
        .await
        .context("Failed to get access token")?;

    println!("{}", token.as_str());
    Ok(())
}

async fn make_public(
    runner: Arc<dyn ProcessRunner>,
    config: Arc<ProvisionerConfig>,
    name: String,
    yes: bool,
) -> Result<()> {
    if !yes {
        let confirm = Confirm::new()
            .with_prompt(MAKE_PUBLIC_CONFIRMATION)
            .default(false)
            .interact()?;
        if !confirm {
            println!("{}", "Cancelled".dimmed());
            return Ok(());
        }
    }

    let provider = new_provider(&runner, &config);
    let cancel = CancellationToken::new();

    let identity = provider
        .ensure_tunnel(&name, &cancel)
        .await
        .with_context(|| format!("Failed to resolve tunnel '{}'", name))?;
    provider
        .grant_access(AccessMode::Anonymous, &cancel)
        .await
        .context("Failed to grant anonymous access")?;

    println!(
        "{}",
        format!("✓ Tunnel '{}' ({}) is now public", name, identity.id)
            .green()
            .bold()
    );
    Ok(())
}

async fn make_private(
    runner: Arc<dyn ProcessRunner>,
    config: Arc<ProvisionerConfig>,
    name: String,
) -> Result<()> {
    let provider = new_provider(&runner, &config);
    let cancel = CancellationToken::new();

    let identity = provider
        .ensure_tunnel(&name, &cancel)
        .await
        .with_context(|| format!("Failed to resolve tunnel '{}'", name))?;
    provider
        .revoke_anonymous_access(&cancel)
        .await
        .context("Failed to reset tunnel access")?;

    println!(
        "{}",
        format!("✓ Tunnel '{}' ({}) is now private", name, identity.id)
            .green()
            .bold()
    );
    Ok(())
}

async fn list_tunnels(
    runner: Arc<dyn ProcessRunner>,
    config: Arc<ProvisionerConfig>,
) -> Result<()> {
    let provider = new_provider(&runner, &config);
    let tunnels = provider
        .list_tunnels(&CancellationToken::new())
        .await
        .context("Failed to list tunnels")?;

    if tunnels.is_empty() {
        println!("{}", "No tunnels found".yellow());
        return Ok(());
    }

    println!();
    println!("{}", tunnel_table(&tunnels));
    println!();
    println!("{} tunnel(s)", tunnels.len());
    Ok(())
}

fn tunnel_table(tunnels: &[TunnelSummary]) -> Table {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Tunnel ID").add_attribute(Attribute::Bold).fg(Color::Cyan),
        Cell::new("Host Connections").add_attribute(Attribute::Bold).fg(Color::Cyan),
        Cell::new("Client Connections").add_attribute(Attribute::Bold).fg(Color::Cyan),
        Cell::new("Ports").add_attribute(Attribute::Bold).fg(Color::Cyan),
        Cell::new("Expiration").add_attribute(Attribute::Bold).fg(Color::Cyan),
    ]);
    for tunnel in tunnels {
        let hosting = if tunnel.host_connections > 0 {
            Color::Green
        } else {
            Color::DarkGrey
        };
        table.add_row(vec![
            Cell::new(&tunnel.tunnel_id).fg(Color::Green),
            Cell::new(tunnel.host_connections).fg(hosting),
            Cell::new(tunnel.client_connections),
            Cell::new(tunnel.port_count),
            Cell::new(tunnel.expiration.as_deref().unwrap_or("-")).fg(Color::DarkGrey),
        ]);
    }
    table
}

async fn show_status(
    runner: Arc<dyn ProcessRunner>,
    config: Arc<ProvisionerConfig>,
    name: String,
) -> Result<()> {
    let provider = new_provider(&runner, &config);
    let tunnel = provider
        .describe(&name, &CancellationToken::new())
        .await
        .with_context(|| format!("Failed to look up tunnel '{}'", name))?;

    let Some(tunnel) = tunnel else {
        println!("{}", format!("Tunnel '{}' not found", name).yellow());
        return Ok(());
    };

    println!();
    println!("{}", format!("Tunnel: {}", name).bold().green());
    println!("  ID:                 {}", tunnel.tunnel_id);
    println!(
        "  URL:                {}",
        format!("https://{}.{}", tunnel.tunnel_id, config.agent_domain).cyan()
    );
    println!("  Host connections:   {}", tunnel.host_connections);
    println!("  Client connections: {}", tunnel.client_connections);
    if let Some(expiration) = &tunnel.expiration {
        println!("  Expiration:         {}", expiration);
    }

    if tunnel.ports.is_empty() {
        println!();
        println!("{}", "No ports bound".dimmed());
        return Ok(());
    }

    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Port").add_attribute(Attribute::Bold).fg(Color::Cyan),
        Cell::new("Protocol").add_attribute(Attribute::Bold).fg(Color::Cyan),
        Cell::new("URI").add_attribute(Attribute::Bold).fg(Color::Cyan),
    ]);
    for port in &tunnel.ports {
        table.add_row(vec![
            Cell::new(port.port_number).fg(Color::Green),
            Cell::new(port.protocol.as_deref().unwrap_or("-")),
            Cell::new(port.port_uri.as_deref().unwrap_or("-")).fg(Color::DarkGrey),
        ]);
    }

    println!();
    println!("{}", table);
    println!();
    Ok(())
}

fn show_config(config: &ProvisionerConfig, path: &std::path::Path) -> Result<()> {
    println!("{} {}", "Configuration:".bold(), path.display().to_string().dimmed());
    println!();
    println!(
        "{}",
        toml::to_string_pretty(config).context("Failed to serialize configuration")?
    );
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("Failed to install SIGTERM handler")?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl+C")?;
                info!("Received Ctrl+C, shutting down");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C, shutting down");
    }

    Ok(())
}
