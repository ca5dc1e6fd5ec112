// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Dev Tunnel Provisioner Contributors

// Dev Tunnel Provisioner - Tunnel Resource
// A declared tunnel and the operations a host exposes for it

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::try_join_all;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use devtunnel_common::{
    authorization_value, AccessMode, Error, PortBinding, ProvisionEvent, Result,
    TunnelDeclaration, TunnelStatus,
};

use crate::provider::TunnelProvider;

pub const ENV_TUNNEL_URL: &str = "DEV_TUNNEL_URL";
pub const ENV_AUTH_HEADER: &str = "DEV_TUNNEL_AUTH_HEADER";
pub const ENV_AUTH_TOKEN: &str = "DEV_TUNNEL_AUTH_TOKEN";

pub const COMMAND_MAKE_PUBLIC: &str = "make-public";
pub const COMMAND_GET_TOKEN: &str = "get-token";

pub const MAKE_PUBLIC_CONFIRMATION: &str =
    "Are you sure you want to make the dev tunnel publicly available?";

/// `DEV_TUNNEL_PORT_{port}_URL`
pub fn port_env_name(port: u16) -> String {
    format!("DEV_TUNNEL_PORT_{}_URL", port)
}

/// A URL worth showing for the resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceUrl {
    pub display_text: String,
    pub url: String,
}

/// Operator command offered by a resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceCommand {
    pub name: &'static str,
    pub display_name: &'static str,
    /// Ask before running when set
    pub confirmation: Option<&'static str>,
    pub enabled: bool,
}

/// What an executed command produced
pub enum CommandOutcome {
    Completed,
    Token(Zeroizing<String>),
}

impl std::fmt::Debug for CommandOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandOutcome::Completed => f.write_str("Completed"),
            CommandOutcome::Token(token) => f
                .debug_tuple("Token")
                .field(&devtunnel_common::obfuscate_token(token))
                .finish(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy(String),
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Tunnel resource: an immutable declaration bound to its provider
#[derive(Debug)]
pub struct TunnelResource {
    id: Uuid,
    declaration: TunnelDeclaration,
    provider: Arc<TunnelProvider>,
}

impl TunnelResource {
    /// Validate `declaration` and bind it to `provider`
    pub fn declare(declaration: TunnelDeclaration, provider: Arc<TunnelProvider>) -> Result<Self> {
        declaration.validate()?;
        Ok(Self {
            id: Uuid::new_v4(),
            declaration,
            provider,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.declaration.name
    }

    pub fn declaration(&self) -> &TunnelDeclaration {
        &self.declaration
    }

    pub fn provider(&self) -> &Arc<TunnelProvider> {
        &self.provider
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProvisionEvent> {
        self.provider.subscribe()
    }

    pub async fn status(&self) -> TunnelStatus {
        self.provider.status().await
    }

    /// Bring the remote tunnel in line with the declaration and host it
    ///
    /// Ports are ensured concurrently; the first failure aborts the rest.
    pub async fn initialize(&self, cancel: &CancellationToken) -> Result<()> {
        let name = self.name();
        info!(
            "Initializing tunnel {} ({} port(s), {} access)",
            name,
            self.declaration.ports.len(),
            self.declaration.access
        );

        self.provider.ensure_tunnel(name, cancel).await?;

        try_join_all(
            self.declaration
                .ports
                .iter()
                .map(|spec| self.provider.ensure_port(spec.port, spec.protocol, cancel)),
        )
        .await?;

        self.provider
            .grant_access(self.declaration.access, cancel)
            .await?;
        self.provider.start(cancel).await?;

        // Port URIs are only reported once hosting
        if let Err(e) = self.provider.refresh(cancel).await {
            warn!("Failed to refresh metadata for {}: {}", name, e);
        }

        if let Some(url) = self.provider.url().await {
            info!("Tunnel ready: {}", url);
        }
        Ok(())
    }

    pub async fn refresh(&self, cancel: &CancellationToken) -> Result<()> {
        self.provider.refresh(cancel).await
    }

    pub async fn url(&self) -> Option<String> {
        self.provider.url().await
    }

    pub async fn port_uri(&self, port: u16) -> Option<String> {
        self.provider.port_uri(port).await
    }

    pub async fn ports(&self) -> Vec<PortBinding> {
        self.provider.ports().await
    }

    pub async fn access_token(&self, cancel: &CancellationToken) -> Result<Zeroizing<String>> {
        self.provider.access_token(cancel).await
    }

    /// Allow anonymous connections
    pub async fn make_public(&self, cancel: &CancellationToken) -> Result<()> {
        self.provider
            .grant_access(AccessMode::Anonymous, cancel)
            .await?;
        info!("Tunnel {} is now publicly available", self.name());
        Ok(())
    }

    /// Drop anonymous access; clients need a connect token again
    pub async fn make_private(&self, cancel: &CancellationToken) -> Result<()> {
        self.provider.revoke_anonymous_access(cancel).await?;
        info!("Tunnel {} is now private", self.name());
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        self.provider.stop().await
    }

    /// Variables to hand to dependent processes
    ///
    /// Values may include the connect token.
    pub async fn environment(
        &self,
        cancel: &CancellationToken,
    ) -> Result<BTreeMap<String, String>> {
        let url = self.provider.url().await.ok_or_else(|| {
            Error::InvalidState(format!("tunnel {} is not initialized", self.name()))
        })?;

        let mut env = BTreeMap::new();
        env.insert(ENV_TUNNEL_URL.to_string(), url);

        for binding in self.provider.ports().await {
            if let Some(uri) = binding.uri {
                env.insert(port_env_name(binding.port_number), uri);
            }
        }

        if self.provider.access_mode().await == AccessMode::Private {
            let token = self.provider.access_token(cancel).await?;
            env.insert(
                ENV_AUTH_HEADER.to_string(),
                self.provider.config().auth_header.clone(),
            );
            env.insert(ENV_AUTH_TOKEN.to_string(), authorization_value(&token));
        }

        Ok(env)
    }

    /// Tunnel URL first, then every port with a known URI
    pub async fn urls(&self) -> Vec<ResourceUrl> {
        let mut urls = Vec::new();
        if let Some(url) = self.provider.url().await {
            urls.push(ResourceUrl {
                display_text: self.name().to_string(),
                url,
            });
        }
        for binding in self.provider.ports().await {
            if let Some(uri) = binding.uri {
                urls.push(ResourceUrl {
                    display_text: binding.port_number.to_string(),
                    url: uri,
                });
            }
        }
        urls
    }

    pub async fn commands(&self) -> Vec<ResourceCommand> {
        let hosting = self.provider.status().await == TunnelStatus::Hosting;
        let private = self.provider.access_mode().await == AccessMode::Private;

        vec![
            ResourceCommand {
                name: COMMAND_MAKE_PUBLIC,
                display_name: "Make Endpoint Public",
                confirmation: Some(MAKE_PUBLIC_CONFIRMATION),
                enabled: hosting,
            },
            ResourceCommand {
                name: COMMAND_GET_TOKEN,
                display_name: "Get Connect Token",
                confirmation: None,
                enabled: hosting && private,
            },
        ]
    }

    /// Run a command by name. Disabled commands are refused.
    pub async fn execute_command(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<CommandOutcome> {
        let command = self
            .commands()
            .await
            .into_iter()
            .find(|command| command.name == name)
            .ok_or_else(|| Error::InvalidState(format!("Unknown command: {}", name)))?;

        if !command.enabled {
            return Err(Error::InvalidState(format!(
                "Command '{}' is not available while the tunnel is {}",
                command.display_name,
                self.provider.status().await
            )));
        }

        match command.name {
            COMMAND_MAKE_PUBLIC => {
                self.make_public(cancel).await?;
                Ok(CommandOutcome::Completed)
            }
            _ => Ok(CommandOutcome::Token(self.access_token(cancel).await?)),
        }
    }

    pub async fn health(&self) -> HealthStatus {
        match self.provider.status().await {
            TunnelStatus::Hosting if self.provider.is_session_alive().await => HealthStatus::Healthy,
            TunnelStatus::Hosting => {
                HealthStatus::Unhealthy("host session exited unexpectedly".to_string())
            }
            status => HealthStatus::Unhealthy(format!("tunnel is {}", status)),
        }
    }
}
