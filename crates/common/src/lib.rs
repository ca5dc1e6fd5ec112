// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Dev Tunnel Provisioner Contributors

// Dev Tunnel Provisioner - Common Library
// Shared types, agent response shapes, and configuration structures

pub mod config;
pub mod descriptor;
pub mod error;
pub mod secret;
pub mod types;

pub use config::{PortSpec, ProvisionerConfig, TunnelDeclaration};
pub use descriptor::{
    AccessControlEntry, AccessDescriptor, AccessListEnvelope, ActivePortDescriptor,
    PortDescriptor, PortEnvelope, TunnelDescriptor, TunnelEnvelope, TunnelListEnvelope,
    TunnelSummary, UserDescriptor,
};
pub use error::{Error, Result};
pub use secret::{authorization_value, obfuscate_token};
pub use types::{
    AccessGrant, AccessMode, PortBinding, Protocol, ProvisionEvent, ResourceState,
    TunnelIdentity, TunnelStatus,
};

// Re-export commonly used external types
pub use chrono::{DateTime, Utc};
