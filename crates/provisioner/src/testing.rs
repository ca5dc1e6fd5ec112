// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Dev Tunnel Provisioner Contributors

// Scripted stand-in for the dev tunnel CLI, keeping tunnels in memory

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use devtunnel_common::{Error, Result};

use crate::runner::{HostedSession, Invocation, LineCallback, ProcessOutput, ProcessRunner};

struct FakeTunnel {
    id: String,
    /// port -> protocol
    ports: BTreeMap<u16, String>,
    /// Access control entry types, in creation order
    acl: Vec<String>,
    hosting: bool,
}

impl FakeTunnel {
    fn new(name: &str) -> Self {
        Self {
            id: tunnel_id(name),
            ports: BTreeMap::new(),
            acl: Vec::new(),
            hosting: false,
        }
    }

    fn is_anonymous(&self) -> bool {
        self.acl.iter().any(|kind| kind == "Anonymous")
    }
}

/// A `run` as the agent saw it
#[derive(Debug, Clone)]
pub(crate) struct RecordedCall {
    pub(crate) args: Vec<String>,
    pub(crate) timeout: Option<Duration>,
}

impl RecordedCall {
    fn starts_with(&self, prefix: &[&str]) -> bool {
        self.args.len() >= prefix.len() && self.args.iter().zip(prefix).all(|(a, p)| a == p)
    }
}

struct FakeState {
    installed: bool,
    logged_in: bool,
    fail_create: bool,
    fail_port_create: bool,
    garbage_show: bool,
    delay: Duration,
    token_ttl: chrono::Duration,
    tokens_issued: u32,
    tunnels: HashMap<String, FakeTunnel>,
    calls: Vec<RecordedCall>,
    host_timeouts: Vec<Option<Duration>>,
    sessions: Vec<Arc<AtomicBool>>,
}

pub(crate) struct FakeAgent {
    state: Mutex<FakeState>,
}

impl FakeAgent {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeState {
                installed: true,
                logged_in: true,
                fail_create: false,
                fail_port_create: false,
                garbage_show: false,
                delay: Duration::ZERO,
                token_ttl: chrono::Duration::hours(24),
                tokens_issued: 0,
                tunnels: HashMap::new(),
                calls: Vec::new(),
                host_timeouts: Vec::new(),
                sessions: Vec::new(),
            }),
        })
    }

    fn with<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub(crate) fn set_installed(&self, installed: bool) {
        self.with(|s| s.installed = installed);
    }

    pub(crate) fn set_logged_in(&self, logged_in: bool) {
        self.with(|s| s.logged_in = logged_in);
    }

    pub(crate) fn set_fail_create(&self, fail: bool) {
        self.with(|s| s.fail_create = fail);
    }

    pub(crate) fn set_fail_port_create(&self, fail: bool) {
        self.with(|s| s.fail_port_create = fail);
    }

    pub(crate) fn set_garbage_show(&self, garbage: bool) {
        self.with(|s| s.garbage_show = garbage);
    }

    /// Every `run` sleeps this long before answering
    pub(crate) fn set_delay(&self, delay: Duration) {
        self.with(|s| s.delay = delay);
    }

    pub(crate) fn set_token_ttl(&self, ttl: chrono::Duration) {
        self.with(|s| s.token_ttl = ttl);
    }

    /// Pre-existing remote tunnel
    pub(crate) fn add_tunnel(&self, name: &str, ports: &[(u16, &str)]) {
        self.with(|s| {
            s.tunnels.insert(
                name.to_string(),
                FakeTunnel {
                    ports: ports
                        .iter()
                        .map(|(port, protocol)| (*port, protocol.to_string()))
                        .collect(),
                    ..FakeTunnel::new(name)
                },
            );
        });
    }

    /// Anonymous access granted out of band
    pub(crate) fn allow_anonymous(&self, name: &str) {
        self.with(|s| {
            if let Some(tunnel) = s.tunnels.get_mut(name) {
                tunnel.acl.push("Anonymous".to_string());
            }
        });
    }

    /// Every hosted session dies without being terminated
    pub(crate) fn crash_sessions(&self) {
        self.with(|s| {
            for exited in &s.sessions {
                exited.store(true, Ordering::SeqCst);
            }
        });
    }

    pub(crate) fn calls(&self) -> Vec<RecordedCall> {
        self.with(|s| s.calls.clone())
    }

    /// Number of `run` calls whose arguments start with `prefix`
    pub(crate) fn count(&self, prefix: &[&str]) -> usize {
        self.with(|s| s.calls.iter().filter(|call| call.starts_with(prefix)).count())
    }

    /// Timeouts of the `run` calls whose arguments start with `prefix`
    pub(crate) fn timeouts(&self, prefix: &[&str]) -> Vec<Option<Duration>> {
        self.with(|s| {
            s.calls
                .iter()
                .filter(|call| call.starts_with(prefix))
                .map(|call| call.timeout)
                .collect()
        })
    }

    pub(crate) fn host_calls(&self) -> usize {
        self.with(|s| s.host_timeouts.len())
    }

    pub(crate) fn host_timeouts(&self) -> Vec<Option<Duration>> {
        self.with(|s| s.host_timeouts.clone())
    }

    pub(crate) fn is_anonymous(&self, name: &str) -> bool {
        self.with(|s| s.tunnels.get(name).map(FakeTunnel::is_anonymous).unwrap_or(false))
    }

    /// Access control entries on the remote tunnel
    pub(crate) fn acl_len(&self, name: &str) -> usize {
        self.with(|s| s.tunnels.get(name).map(|t| t.acl.len()).unwrap_or(0))
    }

    pub(crate) fn has_tunnel(&self, name: &str) -> bool {
        self.with(|s| s.tunnels.contains_key(name))
    }

    pub(crate) fn all_sessions_terminated(&self) -> bool {
        self.with(|s| s.sessions.iter().all(|exited| exited.load(Ordering::SeqCst)))
    }

    fn respond(&self, program: &str, args: &[String]) -> Result<ProcessOutput> {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;

        if !state.installed {
            return Err(Error::AgentNotFound(program.to_string()));
        }

        let output = match args.as_slice() {
            ["--version"] => ProcessOutput::ok(
                "Tunnel CLI version: 1.0.1435+fake\n\nTunnel service URI: https://global.rel.tunnels.api.visualstudio.com/\n",
            ),
            ["user", "show", "--json"] => {
                if state.logged_in {
                    ProcessOutput::ok(
                        json!({"status": "Logged in", "provider": "github", "username": "dev"})
                            .to_string(),
                    )
                } else {
                    ProcessOutput::ok(json!({"status": "Not logged in"}).to_string())
                }
            }
            ["show", name, "--json"] => {
                if state.garbage_show {
                    return Ok(ProcessOutput::ok("Welcome to dev tunnels!"));
                }
                match state.tunnels.get(*name) {
                    Some(tunnel) => ProcessOutput::ok(tunnel_json(name, tunnel).to_string()),
                    None => ProcessOutput::failed(1, "Tunnel not found"),
                }
            }
            ["create", name, "--json"] => {
                if state.fail_create {
                    return Ok(ProcessOutput::failed(1, "Tunnel quota exceeded"));
                }
                if state.tunnels.contains_key(*name) {
                    return Ok(ProcessOutput::failed(1, "Conflict: tunnel already exists"));
                }
                let tunnel = FakeTunnel::new(name);
                let body = tunnel_json(name, &tunnel).to_string();
                state.tunnels.insert(name.to_string(), tunnel);
                ProcessOutput::ok(body)
            }
            ["port", "show", name, "--port-number", port, "--json"] => {
                let port: u16 = port.parse().unwrap();
                match state.tunnels.get(*name) {
                    Some(tunnel) if tunnel.ports.contains_key(&port) => {
                        ProcessOutput::ok(port_json(name, tunnel, port).to_string())
                    }
                    _ => ProcessOutput::failed(1, "Port not found"),
                }
            }
            ["port", "create", name, "--port-number", port, "--protocol", protocol, "--json"] => {
                if state.fail_port_create {
                    return Ok(ProcessOutput::failed(1, "Port creation rejected"));
                }
                let port: u16 = port.parse().unwrap();
                match state.tunnels.get_mut(*name) {
                    Some(tunnel) if tunnel.ports.contains_key(&port) => {
                        ProcessOutput::failed(1, "Conflict: port already exists")
                    }
                    Some(tunnel) => {
                        tunnel.ports.insert(port, protocol.to_string());
                        ProcessOutput::ok(port_json(name, tunnel, port).to_string())
                    }
                    None => ProcessOutput::failed(1, "Tunnel not found"),
                }
            }
            ["list", "--json"] => {
                let mut names: Vec<&String> = state.tunnels.keys().collect();
                names.sort();
                let tunnels: Vec<serde_json::Value> = names
                    .into_iter()
                    .map(|name| {
                        let tunnel = &state.tunnels[name];
                        json!({
                            "tunnelId": tunnel.id,
                            "hostConnections": if tunnel.hosting { 1 } else { 0 },
                            "clientConnections": 0,
                            "portCount": tunnel.ports.len(),
                            "tunnelExpiration": "30 days",
                        })
                    })
                    .collect();
                ProcessOutput::ok(json!({ "tunnels": tunnels }).to_string())
            }
            ["access", "list", name, "--json"] => match state.tunnels.get(*name) {
                Some(tunnel) => {
                    let entries: Vec<serde_json::Value> = tunnel
                        .acl
                        .iter()
                        .map(|kind| {
                            json!({"type": kind, "isDeny": false, "subjects": [], "scopes": ["connect"]})
                        })
                        .collect();
                    ProcessOutput::ok(
                        json!({"tunnelId": tunnel.id, "accessControlEntries": entries}).to_string(),
                    )
                }
                None => ProcessOutput::failed(1, "Tunnel not found"),
            },
            // Appends even when an equal entry exists, like the real agent
            ["access", "create", name, "--anonymous"] => match state.tunnels.get_mut(*name) {
                Some(tunnel) => {
                    tunnel.acl.push("Anonymous".to_string());
                    ProcessOutput::ok("Created access control entry: +Anonymous [connect]")
                }
                None => ProcessOutput::failed(1, "Tunnel not found"),
            },
            ["access", "reset", name] => match state.tunnels.get_mut(*name) {
                Some(tunnel) => {
                    tunnel.acl.clear();
                    ProcessOutput::ok("Reset access control entries")
                }
                None => ProcessOutput::failed(1, "Tunnel not found"),
            },
            ["token", name, "--scopes", "connect", "--json"] => {
                if !state.tunnels.contains_key(*name) {
                    return Ok(ProcessOutput::failed(1, "Tunnel not found"));
                }
                state.tokens_issued += 1;
                let expiration = Utc::now() + state.token_ttl;
                ProcessOutput::ok(
                    json!({
                        "tunnelId": tunnel_id(name),
                        "scope": "connect",
                        "lifetime": "1.00:00:00",
                        "expiration": expiration.to_rfc3339(),
                        "token": format!("token-{}", state.tokens_issued),
                    })
                    .to_string(),
                )
            }
            _ => ProcessOutput::failed(2, format!("Unrecognized command: {}", args.join(" "))),
        };
        Ok(output)
    }
}

#[async_trait]
impl ProcessRunner for FakeAgent {
    async fn run(
        &self,
        invocation: &Invocation,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let delay = self.with(|s| {
            s.calls.push(RecordedCall {
                args: invocation.args.clone(),
                timeout: invocation.timeout,
            });
            s.delay
        });
        if !delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        self.respond(&invocation.program, &invocation.args)
    }

    async fn host(
        &self,
        invocation: &Invocation,
        on_line: LineCallback,
    ) -> Result<Box<dyn HostedSession>> {
        let name = match invocation.args.as_slice() {
            [host, name] if host == "host" => name.clone(),
            other => panic!("unexpected host invocation: {:?}", other),
        };

        let exited = Arc::new(AtomicBool::new(false));
        self.with(|s| {
            s.host_timeouts.push(invocation.timeout);
            s.sessions.push(exited.clone());
            if let Some(tunnel) = s.tunnels.get_mut(&name) {
                tunnel.hosting = true;
            }
        });

        on_line(&format!("Hosting port(s) for tunnel {}", name));
        on_line("Ready to accept connections for tunnel");
        Ok(Box::new(FakeSession { exited }))
    }
}

struct FakeSession {
    exited: Arc<AtomicBool>,
}

#[async_trait]
impl HostedSession for FakeSession {
    fn pid(&self) -> Option<u32> {
        Some(4242)
    }

    fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    async fn terminate(&mut self, _grace: Duration) -> Result<()> {
        self.exited.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn tunnel_id(name: &str) -> String {
    format!("{}.usw2", name)
}

fn port_uri(name: &str, port: u16) -> String {
    format!("https://{}-{}.usw2.devtunnels.ms/", name, port)
}

fn tunnel_json(name: &str, tunnel: &FakeTunnel) -> serde_json::Value {
    let ports: Vec<serde_json::Value> = tunnel
        .ports
        .iter()
        .map(|(port, protocol)| {
            let mut value = json!({"portNumber": port, "protocol": protocol});
            if tunnel.hosting {
                value["portUri"] = json!(port_uri(name, *port));
            }
            value
        })
        .collect();

    json!({
        "tunnel": {
            "tunnelId": tunnel.id,
            "hostConnections": if tunnel.hosting { 1 } else { 0 },
            "clientConnections": 0,
            "expiration": "30 days",
            "ports": ports,
        }
    })
}

fn port_json(name: &str, tunnel: &FakeTunnel, port: u16) -> serde_json::Value {
    let mut value = json!({
        "port": {
            "tunnelId": tunnel.id,
            "portNumber": port,
            "protocol": tunnel.ports.get(&port),
            "clientConnections": 0,
        }
    });
    if tunnel.hosting {
        value["port"]["portUri"] = json!(port_uri(name, port));
    }
    value
}
