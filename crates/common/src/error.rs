// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Dev Tunnel Provisioner Contributors

// Error types for Dev Tunnel Provisioner

use std::time::Duration;

use thiserror::Error;

use crate::types::Protocol;

#[derive(Error, Debug)]
pub enum Error {
    /// The agent is not installed or the user is not signed in
    #[error("{message}. {remediation}")]
    Precondition { message: String, remediation: String },

    #[error("Agent executable not found: {0}")]
    AgentNotFound(String),

    #[error("Provisioning error: {0}")]
    Provisioning(String),

    #[error(
        "Port {port} is already bound with protocol {existing}, refusing to rebind it as {requested}"
    )]
    PortConflict {
        port: u16,
        existing: Protocol,
        requested: Protocol,
    },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("'{command}' did not finish within {after:?}")]
    Timeout { command: String, after: Duration },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Decode(err.to_string())
    }
}

impl Error {
    pub fn precondition(message: impl Into<String>, remediation: impl Into<String>) -> Self {
        Error::Precondition {
            message: message.into(),
            remediation: remediation.into(),
        }
    }

    /// Check if the error is a cooperative cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
