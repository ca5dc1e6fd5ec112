// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Dev Tunnel Provisioner Contributors

// Response shapes printed by the agent with `--json`
// Unknown fields are ignored and missing ones default, so newer agent
// releases that add fields keep decoding.

use serde::{Deserialize, Serialize};

/// `show <tunnel> --json` / `create <tunnel> --json`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TunnelEnvelope {
    pub tunnel: Option<TunnelDescriptor>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TunnelDescriptor {
    pub tunnel_id: String,
    #[serde(alias = "tunnelExpiration")]
    pub expiration: Option<String>,
    pub host_connections: u32,
    pub client_connections: u32,
    pub ports: Vec<ActivePortDescriptor>,
}

/// Port entry nested in a tunnel descriptor
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ActivePortDescriptor {
    pub port_number: u16,
    pub protocol: Option<String>,
    #[serde(alias = "uri")]
    pub port_uri: Option<String>,
}

/// `port show` / `port create` with `--json`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PortEnvelope {
    pub port: Option<PortDescriptor>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PortDescriptor {
    pub tunnel_id: String,
    pub port_number: u16,
    pub protocol: Option<String>,
    pub client_connections: u32,
    #[serde(alias = "portUri")]
    pub uri: Option<String>,
}

/// `list --json`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TunnelListEnvelope {
    pub tunnels: Vec<TunnelSummary>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TunnelSummary {
    pub tunnel_id: String,
    pub description: Option<String>,
    #[serde(alias = "tunnelExpiration")]
    pub expiration: Option<String>,
    pub host_connections: u32,
    pub client_connections: u32,
    pub port_count: u32,
    pub labels: Vec<String>,
}

/// `access list <tunnel> --json`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AccessListEnvelope {
    #[serde(alias = "entries")]
    pub access_control_entries: Vec<AccessControlEntry>,
}

impl AccessListEnvelope {
    /// Whether anyone may connect without a token
    pub fn allows_anonymous_connect(&self) -> bool {
        self.access_control_entries
            .iter()
            .any(AccessControlEntry::grants_anonymous_connect)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AccessControlEntry {
    #[serde(rename = "type")]
    pub kind: String,
    pub is_deny: bool,
    pub is_inherited: bool,
    pub subjects: Vec<String>,
    pub scopes: Vec<String>,
}

impl AccessControlEntry {
    pub fn grants_anonymous_connect(&self) -> bool {
        !self.is_deny
            && self.kind.eq_ignore_ascii_case("anonymous")
            && self
                .scopes
                .iter()
                .any(|scope| scope.eq_ignore_ascii_case("connect"))
    }
}

/// `token <tunnel> --scopes connect --json`
#[derive(Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AccessDescriptor {
    pub tunnel_id: String,
    pub scope: Option<String>,
    #[serde(alias = "lifeTime")]
    pub lifetime: Option<String>,
    pub expiration: Option<String>,
    pub token: String,
}

impl std::fmt::Debug for AccessDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessDescriptor")
            .field("tunnel_id", &self.tunnel_id)
            .field("scope", &self.scope)
            .field("lifetime", &self.lifetime)
            .field("expiration", &self.expiration)
            .field("token", &crate::secret::obfuscate_token(&self.token))
            .finish()
    }
}

/// `user show --json`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct UserDescriptor {
    pub status: Option<String>,
    pub provider: Option<String>,
    pub username: Option<String>,
    pub tenant_id: Option<String>,
    pub object_id: Option<String>,
}

impl UserDescriptor {
    pub fn is_logged_in(&self) -> bool {
        self.username
            .as_deref()
            .map(|u| !u.trim().is_empty())
            .unwrap_or(false)
    }
}
