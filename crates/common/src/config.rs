// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Dev Tunnel Provisioner Contributors

// Configuration structures for Dev Tunnel Provisioner

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::types::{AccessMode, Protocol};

/// Longest accepted token refresh margin (30 days)
pub const MAX_TOKEN_REFRESH_MARGIN_SECS: u64 = 30 * 24 * 60 * 60;

/// A local port the tunnel should forward
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortSpec {
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
}

impl PortSpec {
    pub fn new(port: u16, protocol: Protocol) -> Self {
        Self { port, protocol }
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.port, self.protocol)
    }
}

/// Parses `8080`, `8080:http` or `8080/tcp`; protocol defaults to https
impl FromStr for PortSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (port, protocol) = match s.split_once([':', '/']) {
            Some((port, protocol)) => (port, protocol.parse()?),
            None => (s, Protocol::default()),
        };
        let port = port
            .trim()
            .parse::<u16>()
            .map_err(|_| Error::Config(format!("Invalid port: {}", s)))?;
        Ok(Self { port, protocol })
    }
}

/// Desired configuration of one tunnel, fixed at declaration time
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TunnelDeclaration {
    /// Tunnel name passed to every agent invocation
    pub name: String,
    /// Ports to bind, in declaration order
    #[serde(default)]
    pub ports: Vec<PortSpec>,
    /// Access policy
    #[serde(default)]
    pub access: AccessMode,
}

impl TunnelDeclaration {
    pub fn new(name: impl Into<String>, ports: Vec<PortSpec>, access: AccessMode) -> Self {
        Self {
            name: name.into(),
            ports,
            access,
        }
    }

    /// Validate the declaration
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Config("Tunnel name cannot be empty".to_string()));
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(Error::Config(format!(
                "Tunnel name '{}' may only contain letters, digits, '-' and '_'",
                self.name
            )));
        }

        let mut seen = HashSet::new();
        for spec in &self.ports {
            if spec.port == 0 {
                return Err(Error::Config("Port must be greater than 0".to_string()));
            }
            if !seen.insert(spec.port) {
                return Err(Error::Config(format!(
                    "Port {} is declared more than once for tunnel '{}'",
                    spec.port, self.name
                )));
            }
        }

        Ok(())
    }
}

/// Provisioner configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProvisionerConfig {
    /// Agent executable (name looked up in PATH, or a path; `~` is expanded)
    #[serde(default = "default_agent_binary")]
    pub agent_binary: String,

    /// Domain the agent publishes tunnels under
    #[serde(default = "default_agent_domain")]
    pub agent_domain: String,

    /// Bound for read-only queries (show, port show, version and login checks)
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,

    /// Bound for create/add/grant invocations
    #[serde(default = "default_mutation_timeout_secs")]
    pub mutation_timeout_secs: u64,

    /// Cached tokens expiring within this window are refreshed
    #[serde(default = "default_token_refresh_margin_secs")]
    pub token_refresh_margin_secs: u64,

    /// Time the hosted session gets to exit after SIGTERM before SIGKILL
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,

    /// Header name clients put the connect token in
    #[serde(default = "default_auth_header")]
    pub auth_header: String,

    /// Declared tunnels
    #[serde(default)]
    pub tunnels: Vec<TunnelDeclaration>,
}

fn default_agent_binary() -> String {
    "devtunnel".to_string()
}

fn default_agent_domain() -> String {
    "devtunnels.ms".to_string()
}

fn default_query_timeout_secs() -> u64 {
    10
}

fn default_mutation_timeout_secs() -> u64 {
    60
}

fn default_token_refresh_margin_secs() -> u64 {
    300 // 5 minutes
}

fn default_stop_grace_secs() -> u64 {
    5
}

fn default_auth_header() -> String {
    "X-Tunnel-Authorization".to_string()
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            agent_binary: default_agent_binary(),
            agent_domain: default_agent_domain(),
            query_timeout_secs: default_query_timeout_secs(),
            mutation_timeout_secs: default_mutation_timeout_secs(),
            token_refresh_margin_secs: default_token_refresh_margin_secs(),
            stop_grace_secs: default_stop_grace_secs(),
            auth_header: default_auth_header(),
            tunnels: Vec::new(),
        }
    }
}

impl ProvisionerConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub fn mutation_timeout(&self) -> Duration {
        Duration::from_secs(self.mutation_timeout_secs)
    }

    /// Capped at [`MAX_TOKEN_REFRESH_MARGIN_SECS`] for configs that skipped validation
    pub fn token_refresh_margin(&self) -> chrono::Duration {
        let secs = self
            .token_refresh_margin_secs
            .min(MAX_TOKEN_REFRESH_MARGIN_SECS);
        chrono::Duration::seconds(secs as i64)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    /// Agent executable with `~` expanded
    pub fn agent_program(&self) -> String {
        shellexpand::tilde(&self.agent_binary).to_string()
    }

    /// Find a declared tunnel by name
    pub fn tunnel(&self, name: &str) -> Option<&TunnelDeclaration> {
        self.tunnels.iter().find(|t| t.name == name)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.agent_binary.trim().is_empty() {
            return Err(Error::Config("agent_binary cannot be empty".to_string()));
        }
        if self.agent_domain.trim().is_empty() {
            return Err(Error::Config("agent_domain cannot be empty".to_string()));
        }
        if self.query_timeout_secs == 0 || self.mutation_timeout_secs == 0 {
            return Err(Error::Config(
                "Timeouts must be greater than 0 seconds".to_string(),
            ));
        }
        if self.token_refresh_margin_secs > MAX_TOKEN_REFRESH_MARGIN_SECS {
            return Err(Error::Config(format!(
                "token_refresh_margin_secs cannot exceed {} seconds",
                MAX_TOKEN_REFRESH_MARGIN_SECS
            )));
        }
        if self.auth_header.trim().is_empty() {
            return Err(Error::Config("auth_header cannot be empty".to_string()));
        }

        let mut names = HashSet::new();
        for tunnel in &self.tunnels {
            tunnel.validate()?;
            if !names.insert(tunnel.name.as_str()) {
                return Err(Error::Config(format!(
                    "Tunnel '{}' is declared more than once",
                    tunnel.name
                )));
            }
        }

        Ok(())
    }

    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            info!("No configuration found, using defaults");
            info!("Configuration will be saved to: {}", config_path.display());
            let config = Self::default();
            config.save_to(&config_path)?;
            return Ok(config);
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific file
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;

        config.validate()?;

        info!("Loaded configuration from: {}", path.display());
        Ok(config)
    }

    /// Save configuration to a specific file
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize configuration: {}", e)))?;
        fs::write(path, contents)?;

        // Set restrictive permissions on config file (Unix only)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }

        info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the path to the configuration file
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| Error::Config("Could not determine config directory".to_string()))?;
        Ok(config_dir.join("devtunnel-provisioner").join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn declaration(name: &str, ports: &[u16]) -> TunnelDeclaration {
        TunnelDeclaration::new(
            name,
            ports
                .iter()
                .map(|p| PortSpec::new(*p, Protocol::Https))
                .collect(),
            AccessMode::Private,
        )
    }

    #[test]
    fn test_port_spec_parsing() {
        assert_eq!(
            "8080".parse::<PortSpec>().unwrap(),
            PortSpec::new(8080, Protocol::Https)
        );
        assert_eq!(
            "8080:http".parse::<PortSpec>().unwrap(),
            PortSpec::new(8080, Protocol::Http)
        );
        assert_eq!(
            "5432/tcp".parse::<PortSpec>().unwrap(),
            PortSpec::new(5432, Protocol::Tcp)
        );
        assert!("70000".parse::<PortSpec>().is_err());
        assert!("8080:udp".parse::<PortSpec>().is_err());
        assert!("abc".parse::<PortSpec>().is_err());
    }

    #[test]
    fn test_declaration_validation() {
        assert!(declaration("api", &[8080, 8443]).validate().is_ok());
        assert!(declaration("my_api-2", &[]).validate().is_ok());
    }

    #[test]
    fn test_declaration_rejects_empty_name() {
        assert!(declaration("", &[8080]).validate().is_err());
    }

    #[test]
    fn test_declaration_rejects_shell_characters() {
        let err = declaration("api; rm -rf /", &[8080]).validate().unwrap_err();
        assert!(err.to_string().contains("may only contain"));
    }

    #[test]
    fn test_declaration_rejects_duplicate_ports() {
        let err = declaration("api", &[8080, 8080]).validate().unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_declaration_rejects_port_zero() {
        assert!(declaration("api", &[0]).validate().is_err());
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = ProvisionerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.agent_binary, "devtunnel");
        assert_eq!(config.token_refresh_margin(), chrono::Duration::minutes(5));
    }

    #[test]
    fn test_config_rejects_duplicate_tunnels() {
        let config = ProvisionerConfig {
            tunnels: vec![declaration("api", &[8080]), declaration("api", &[9090])],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_rejects_zero_timeout() {
        let config = ProvisionerConfig {
            query_timeout_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_rejects_huge_refresh_margin() {
        let config = ProvisionerConfig {
            token_refresh_margin_secs: u64::MAX,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("token_refresh_margin_secs"));
        assert_eq!(
            config.token_refresh_margin(),
            chrono::Duration::seconds(MAX_TOKEN_REFRESH_MARGIN_SECS as i64)
        );

        let config = ProvisionerConfig {
            token_refresh_margin_secs: MAX_TOKEN_REFRESH_MARGIN_SECS,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_config_with_defaults() {
        let toml = r#"
            agent_domain = "example.test"

            [[tunnels]]
            name = "api"
            access = "anonymous"
            ports = [{ port = 8080 }, { port = 5432, protocol = "tcp" }]
        "#;
        let config: ProvisionerConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.agent_binary, "devtunnel");
        assert_eq!(config.agent_domain, "example.test");
        assert_eq!(config.mutation_timeout_secs, 60);

        let api = config.tunnel("api").unwrap();
        assert_eq!(api.access, AccessMode::Anonymous);
        assert_eq!(
            api.ports,
            vec![
                PortSpec::new(8080, Protocol::Https),
                PortSpec::new(5432, Protocol::Tcp)
            ]
        );
        assert!(config.tunnel("web").is_none());
    }

    #[test]
    fn test_save_and_load_config() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("config.toml");

        let config = ProvisionerConfig {
            tunnels: vec![declaration("api", &[8080])],
            ..Default::default()
        };
        config.save_to(&path).unwrap();

        let loaded = ProvisionerConfig::load_from(&path).unwrap();
        assert_eq!(loaded.tunnels, config.tunnels);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_load_rejects_invalid_config() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        fs::write(&path, "agent_binary = \"\"\n").unwrap();

        assert!(ProvisionerConfig::load_from(&path).is_err());
    }
}
