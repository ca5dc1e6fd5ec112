// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Dev Tunnel Provisioner Contributors

// Dev Tunnel Provisioner - Provisioning Engine
// Drives the dev tunnel CLI to create, expose and host tunnels idempotently

pub mod decoder;
pub mod lifecycle;
pub mod provider;
pub mod resource;
pub mod runner;

#[cfg(test)]
pub(crate) mod testing;

pub use lifecycle::{HostEvent, LifecycleBinder};
pub use provider::TunnelProvider;
pub use resource::{
    port_env_name, CommandOutcome, HealthStatus, ResourceCommand, ResourceUrl, TunnelResource,
    COMMAND_GET_TOKEN, COMMAND_MAKE_PUBLIC, ENV_AUTH_HEADER, ENV_AUTH_TOKEN, ENV_TUNNEL_URL,
    MAKE_PUBLIC_CONFIRMATION,
};
pub use runner::{AgentRunner, HostedSession, Invocation, LineCallback, ProcessOutput, ProcessRunner};

pub use tokio_util::sync::CancellationToken;
