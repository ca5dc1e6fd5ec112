// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Dev Tunnel Provisioner Contributors

// Common types for Dev Tunnel Provisioner

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::Error;
use crate::secret::obfuscate_token;

/// Protocol the tunnel uses to forward a local port
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    #[default]
    Https,
    Tcp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::Tcp => "tcp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(Protocol::Http),
            "https" => Ok(Protocol::Https),
            "tcp" => Ok(Protocol::Tcp),
            other => Err(Error::Config(format!("Unknown protocol: {}", other))),
        }
    }
}

/// Who may connect to the tunnel
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    /// Connecting requires a bearer token
    #[default]
    Private,
    /// Anyone with the URL may connect
    Anonymous,
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessMode::Private => f.write_str("private"),
            AccessMode::Anonymous => f.write_str("anonymous"),
        }
    }
}

/// Lifecycle of a single provisioned tunnel
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TunnelStatus {
    #[default]
    Uninitialized, // identity not resolved yet
    Resolving,     // probing the agent, looking up or creating the tunnel
    Ready,         // identity resolved, ports and access may be configured
    Hosting,       // `host` session running
    Stopped,       // terminal
}

impl TunnelStatus {
    /// Identity is resolved and the tunnel accepts port/access operations
    pub fn is_ready(&self) -> bool {
        matches!(self, TunnelStatus::Ready | TunnelStatus::Hosting)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TunnelStatus::Stopped)
    }
}

impl fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TunnelStatus::Uninitialized => "uninitialized",
            TunnelStatus::Resolving => "resolving",
            TunnelStatus::Ready => "ready",
            TunnelStatus::Hosting => "hosting",
            TunnelStatus::Stopped => "stopped",
        };
        f.write_str(text)
    }
}

/// Identity of a tunnel registered with the remote service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TunnelIdentity {
    /// Assigned by the agent
    pub id: String,
    /// Assigned by the caller
    pub name: String,
}

/// A local port forwarded by the tunnel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortBinding {
    pub port_number: u16,
    pub protocol: Protocol,
    /// Public URI, only known once the agent reports an active binding
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}

/// Current access policy of a tunnel
#[derive(Clone, Default)]
pub struct AccessGrant {
    pub mode: AccessMode,
    token: Option<Zeroizing<String>>,
    pub token_expiry: Option<DateTime<Utc>>,
}

impl AccessGrant {
    pub fn private(token: String, token_expiry: Option<DateTime<Utc>>) -> Self {
        Self {
            mode: AccessMode::Private,
            token: Some(Zeroizing::new(token)),
            token_expiry,
        }
    }

    /// Anonymous access has no token
    pub fn anonymous() -> Self {
        Self {
            mode: AccessMode::Anonymous,
            token: None,
            token_expiry: None,
        }
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_ref().map(|t| t.as_str())
    }

    /// Token usable without a refresh: present, with a known expiry further
    /// away than `margin`
    pub fn fresh_token(&self, now: DateTime<Utc>, margin: Duration) -> Option<&str> {
        match (self.token(), self.token_expiry) {
            (Some(token), Some(expiry)) if expiry - margin > now => Some(token),
            _ => None,
        }
    }
}

// Manual Debug impl so the token never reaches logs verbatim
impl fmt::Debug for AccessGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessGrant")
            .field("mode", &self.mode)
            .field("token", &self.token().map(obfuscate_token))
            .field("token_expiry", &self.token_expiry)
            .finish()
    }
}

/// Events emitted by a tunnel provider
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProvisionEvent {
    /// Tunnel identity resolved (adopted or created)
    Resolved {
        name: String,
        id: String,
        created: bool,
    },

    PortBound { port: u16, created: bool },

    AccessGranted { mode: AccessMode },

    /// `host` session started
    Hosting { pid: Option<u32> },

    /// Line printed by the `host` session
    HostOutput { line: String },

    Stopped,
}

/// State of a tunnel resource as reported to the host
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    #[default]
    NotStarted,
    Starting,
    Running,
    FailedToStart(String),
    Stopped,
}

impl ResourceState {
    pub fn is_running(&self) -> bool {
        matches!(self, ResourceState::Running)
    }
}
