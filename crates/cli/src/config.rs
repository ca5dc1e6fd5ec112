// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Dev Tunnel Provisioner Contributors

// Dev Tunnel Provisioner - CLI Config Module
// Loads the provisioner configuration and picks the tunnels to work on

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use devtunnel_common::{AccessMode, PortSpec, ProvisionerConfig, TunnelDeclaration};

/// Load the configuration from `path`, or from the default location
/// (creating it there if missing). Returns the path actually used.
pub fn load(path: Option<&Path>) -> Result<(ProvisionerConfig, PathBuf)> {
    match path {
        Some(path) => {
            let config = ProvisionerConfig::load_from(path)
                .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
            Ok((config, path.to_path_buf()))
        }
        None => {
            let config = ProvisionerConfig::load().context("Failed to load configuration")?;
            Ok((config, ProvisionerConfig::config_path()?))
        }
    }
}

/// Tunnels `up` should bring up
///
/// Without a name every configured tunnel is used. A name picks the
/// configured tunnel, with `ports`/`anonymous` overriding its settings, or
/// declares an ad-hoc tunnel when the name is not configured.
pub fn select_tunnels(
    config: &ProvisionerConfig,
    name: Option<&str>,
    ports: &[PortSpec],
    anonymous: bool,
) -> Result<Vec<TunnelDeclaration>> {
    let Some(name) = name else {
        if !ports.is_empty() || anonymous {
            anyhow::bail!("A tunnel name is required with --port or --anonymous");
        }
        if config.tunnels.is_empty() {
            anyhow::bail!(
                "No tunnels configured. Pass a tunnel name or declare tunnels in the config file"
            );
        }
        return Ok(config.tunnels.clone());
    };

    let mut declaration = config
        .tunnel(name)
        .cloned()
        .unwrap_or_else(|| TunnelDeclaration::new(name, Vec::new(), AccessMode::Private));
    if !ports.is_empty() {
        declaration.ports = ports.to_vec();
    }
    if anonymous {
        declaration.access = AccessMode::Anonymous;
    }

    declaration
        .validate()
        .with_context(|| format!("Invalid tunnel '{}'", name))?;
    Ok(vec![declaration])
}
