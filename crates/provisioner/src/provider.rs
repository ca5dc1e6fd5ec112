// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Dev Tunnel Provisioner Contributors

// Dev Tunnel Provisioner - Tunnel Provider
// Reconciles one tunnel's remote state with the desired configuration

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, Mutex, OnceCell, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use devtunnel_common::{
    obfuscate_token, AccessGrant, AccessMode, Error, PortBinding, PortDescriptor, Protocol,
    ProvisionEvent, ProvisionerConfig, Result, TunnelDescriptor, TunnelIdentity, TunnelStatus,
    TunnelSummary,
};

use crate::decoder;
use crate::runner::{HostedSession, Invocation, LineCallback, ProcessOutput, ProcessRunner};

const INSTALL_HINT: &str = "Please install it from https://learn.microsoft.com/en-us/azure/developer/dev-tunnels/get-started";

/// Mutable state of the tunnel, owned by the provider
#[derive(Debug, Default)]
struct TunnelState {
    identity: Option<TunnelIdentity>,
    ports: BTreeMap<u16, PortBinding>,
    access: AccessGrant,
    initialized: bool,
    status: TunnelStatus,
}

impl TunnelState {
    /// Merge by port number. A known URI is never replaced by an unknown one.
    fn merge_port(&mut self, binding: PortBinding) -> PortBinding {
        let merged = match self.ports.get(&binding.port_number) {
            Some(existing) => PortBinding {
                uri: binding.uri.or_else(|| existing.uri.clone()),
                ..binding
            },
            None => binding,
        };
        self.ports.insert(merged.port_number, merged.clone());
        merged
    }
}

/// Drives the agent to create, bind, expose and host one tunnel
///
/// Every mutation is preceded by a read-only lookup, so repeating any
/// operation (or the whole sequence after a restart) never duplicates
/// remote resources.
pub struct TunnelProvider {
    runner: Arc<dyn ProcessRunner>,
    config: Arc<ProvisionerConfig>,
    state: RwLock<TunnelState>,
    /// Held for the whole of ensure_tunnel
    resolve_lock: Mutex<()>,
    /// One lock per port number so the same port is never added twice
    port_locks: Mutex<HashMap<u16, Arc<Mutex<()>>>>,
    token_lock: Mutex<()>,
    /// Also serializes start against stop
    session: Mutex<Option<Box<dyn HostedSession>>>,
    /// Agent version, set once both precondition checks passed
    preconditions: OnceCell<String>,
    event_tx: broadcast::Sender<ProvisionEvent>,
}

impl std::fmt::Debug for TunnelProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelProvider")
            .field("agent", &self.config.agent_binary)
            .field("preconditions_verified", &self.preconditions.initialized())
            .finish()
    }
}

impl TunnelProvider {
    pub fn new(runner: Arc<dyn ProcessRunner>, config: Arc<ProvisionerConfig>) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            runner,
            config,
            state: RwLock::new(TunnelState::default()),
            resolve_lock: Mutex::new(()),
            port_locks: Mutex::new(HashMap::new()),
            token_lock: Mutex::new(()),
            session: Mutex::new(None),
            preconditions: OnceCell::new(),
            event_tx,
        }
    }

    /// Subscribe to provisioning events
    pub fn subscribe(&self) -> broadcast::Receiver<ProvisionEvent> {
        self.event_tx.subscribe()
    }

    pub fn config(&self) -> &ProvisionerConfig {
        &self.config
    }

    /// Resolve the tunnel's identity, adopting an existing tunnel or
    /// creating a new one
    pub async fn ensure_tunnel(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<TunnelIdentity> {
        if name.is_empty() {
            return Err(Error::Config("Tunnel name cannot be empty".to_string()));
        }

        let _resolving = self.resolve_lock.lock().await;

        let previous = {
            let mut state = self.state.write().await;
            if state.status.is_terminal() {
                return Err(Error::InvalidState("tunnel has been stopped".to_string()));
            }
            if let Some(identity) = &state.identity {
                if identity.name != name {
                    return Err(Error::InvalidState(format!(
                        "provider is bound to tunnel '{}', cannot resolve '{}'",
                        identity.name, name
                    )));
                }
            }
            let previous = state.status;
            if previous == TunnelStatus::Uninitialized {
                state.status = TunnelStatus::Resolving;
            }
            previous
        };

        match self.resolve(name, cancel).await {
            Ok((identity, created, ports)) => {
                {
                    let mut state = self.state.write().await;
                    state.identity = Some(identity.clone());
                    state.initialized = true;
                    for binding in ports {
                        state.merge_port(binding);
                    }
                    if state.status == TunnelStatus::Resolving {
                        state.status = TunnelStatus::Ready;
                    }
                }
                self.emit(ProvisionEvent::Resolved {
                    name: identity.name.clone(),
                    id: identity.id.clone(),
                    created,
                });
                Ok(identity)
            }
            Err(e) => {
                let mut state = self.state.write().await;
                if state.status == TunnelStatus::Resolving {
                    state.status = previous;
                }
                Err(e)
            }
        }
    }

    async fn resolve(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<(TunnelIdentity, bool, Vec<PortBinding>)> {
        self.verify_preconditions(cancel).await?;

        if let Some(tunnel) = self.find_tunnel(name, cancel).await? {
            info!(
                "Tunnel {} already exists ({}), skipping creation",
                name, tunnel.tunnel_id
            );
            let ports = active_ports(&tunnel);
            let identity = TunnelIdentity {
                id: tunnel.tunnel_id,
                name: name.to_string(),
            };
            return Ok((identity, false, ports));
        }

        let output = self
            .run(&self.mutation(["create", name, "--json"]), cancel)
            .await?;
        if !output.success() {
            return Err(Error::Provisioning(format!(
                "tunnel creation failed: {}",
                failure_detail(&output)
            )));
        }

        let tunnel = decoder::decode_tunnel(&output.stdout)?.ok_or_else(|| {
            Error::Provisioning("tunnel creation failed: agent returned no tunnel id".to_string())
        })?;

        info!("Tunnel created: {} ({})", name, tunnel.tunnel_id);
        let ports = active_ports(&tunnel);
        let identity = TunnelIdentity {
            id: tunnel.tunnel_id,
            name: name.to_string(),
        };
        Ok((identity, true, ports))
    }

    /// Look up a tunnel without changing anything, remote or local
    pub async fn describe(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<TunnelDescriptor>> {
        self.verify_preconditions(cancel).await?;
        self.find_tunnel(name, cancel).await
    }

    /// Make sure `port` is forwarded by the tunnel
    pub async fn ensure_port(
        &self,
        port: u16,
        protocol: Protocol,
        cancel: &CancellationToken,
    ) -> Result<PortBinding> {
        if port == 0 {
            return Err(Error::Config("Port must be greater than 0".to_string()));
        }
        let name = self.require_ready().await?;

        let lock = self.port_lock(port).await;
        let _port_guard = lock.lock().await;

        let (binding, created) = match self.find_port(&name, port, cancel).await? {
            Some(existing) => {
                if let Some(Ok(existing_protocol)) =
                    existing.protocol.as_deref().map(str::parse::<Protocol>)
                {
                    if existing_protocol != protocol {
                        return Err(Error::PortConflict {
                            port,
                            existing: existing_protocol,
                            requested: protocol,
                        });
                    }
                }
                info!(
                    "Port {} already exists for tunnel {}, skipping addition",
                    port, name
                );
                let binding = PortBinding {
                    port_number: port,
                    protocol,
                    uri: existing.uri,
                };
                (binding, false)
            }
            None => {
                let port_arg = port.to_string();
                let output = self
                    .run(
                        &self.mutation([
                            "port",
                            "create",
                            name.as_str(),
                            "--port-number",
                            port_arg.as_str(),
                            "--protocol",
                            protocol.as_str(),
                            "--json",
                        ]),
                        cancel,
                    )
                    .await?;
                if !output.success() {
                    return Err(Error::Provisioning(format!(
                        "failed to add port {}: {}",
                        port,
                        failure_detail(&output)
                    )));
                }

                let added = decoder::decode_port(&output.stdout)?
                    .filter(|added| added.port_number == port)
                    .ok_or_else(|| {
                        Error::Provisioning(format!(
                            "failed to add port {}: agent did not confirm the binding",
                            port
                        ))
                    })?;

                info!("Port added to tunnel {}: {}/{}", name, port, protocol);
                let binding = PortBinding {
                    port_number: port,
                    protocol,
                    uri: added.uri,
                };
                (binding, true)
            }
        };

        let binding = self.state.write().await.merge_port(binding);
        self.emit(ProvisionEvent::PortBound { port, created });
        Ok(binding)
    }

    /// Apply an access policy to the tunnel
    ///
    /// Anonymous access adds an access-control entry, unless the tunnel
    /// already has one, and clears any token. Private access only issues a
    /// connect token.
    pub async fn grant_access(&self, mode: AccessMode, cancel: &CancellationToken) -> Result<()> {
        let name = self.require_ready().await?;

        match mode {
            AccessMode::Anonymous => {
                if self.allows_anonymous(&name, cancel).await? {
                    info!("Tunnel {} already allows anonymous access", name);
                } else {
                    let output = self
                        .run(
                            &self.mutation(["access", "create", name.as_str(), "--anonymous"]),
                            cancel,
                        )
                        .await?;
                    if !output.success() {
                        return Err(Error::Provisioning(format!(
                            "failed to grant anonymous access: {}",
                            failure_detail(&output)
                        )));
                    }
                    info!("Anonymous access granted for tunnel {}", name);
                }
                self.state.write().await.access = AccessGrant::anonymous();
            }
            AccessMode::Private => {
                let _token_guard = self.token_lock.lock().await;
                let grant = self.fetch_token(&name, cancel).await?;
                self.state.write().await.access = grant;
            }
        }

        self.emit(ProvisionEvent::AccessGranted { mode });
        Ok(())
    }

    /// Remove every access-control entry and go back to token access
    pub async fn revoke_anonymous_access(&self, cancel: &CancellationToken) -> Result<()> {
        let name = self.require_ready().await?;
        let _token_guard = self.token_lock.lock().await;

        let output = self
            .run(&self.mutation(["access", "reset", name.as_str()]), cancel)
            .await?;
        if !output.success() {
            return Err(Error::Provisioning(format!(
                "failed to reset access: {}",
                failure_detail(&output)
            )));
        }
        info!("Access control reset for tunnel {}", name);

        let grant = self.fetch_token(&name, cancel).await?;
        self.state.write().await.access = grant;
        self.emit(ProvisionEvent::AccessGranted {
            mode: AccessMode::Private,
        });
        Ok(())
    }

    /// Tunnels owned by the signed-in user
    pub async fn list_tunnels(&self, cancel: &CancellationToken) -> Result<Vec<TunnelSummary>> {
        self.verify_preconditions(cancel).await?;

        let output = self.run(&self.query(["list", "--json"]), cancel).await?;
        if !output.success() {
            return Err(Error::Provisioning(format!(
                "failed to list tunnels: {}",
                failure_detail(&output)
            )));
        }
        decoder::decode_tunnel_list(&output.stdout)
    }

    /// Connect token for a private tunnel, refreshed when close to expiry
    pub async fn access_token(&self, cancel: &CancellationToken) -> Result<Zeroizing<String>> {
        let name = self.require_ready().await?;
        let _token_guard = self.token_lock.lock().await;

        {
            let state = self.state.read().await;
            if state.access.mode != AccessMode::Private {
                return Err(Error::InvalidState(
                    "tunnel allows anonymous access and has no connect token".to_string(),
                ));
            }
            if let Some(token) = state
                .access
                .fresh_token(Utc::now(), self.config.token_refresh_margin())
            {
                debug!("Using cached connect token for {}", name);
                return Ok(Zeroizing::new(token.to_string()));
            }
        }

        let grant = self.fetch_token(&name, cancel).await?;
        let token = Zeroizing::new(grant.token().unwrap_or_default().to_string());

        let mut state = self.state.write().await;
        // Made public while the token was being fetched
        if state.access.mode == AccessMode::Private {
            state.access = grant;
        }
        Ok(token)
    }

    async fn fetch_token(&self, name: &str, cancel: &CancellationToken) -> Result<AccessGrant> {
        let output = self
            .run(
                &self.mutation(["token", name, "--scopes", "connect", "--json"]),
                cancel,
            )
            .await?;
        if !output.success() {
            return Err(Error::Provisioning(format!(
                "failed to get access token: {}",
                failure_detail(&output)
            )));
        }

        let access = decoder::decode_access(&output.stdout)?
            .filter(|access| !access.token.trim().is_empty())
            .ok_or_else(|| {
                Error::Provisioning("failed to get access token: agent returned no token".to_string())
            })?;

        let expiry = decoder::token_expiry(&access, Utc::now());
        if expiry.is_none() {
            warn!(
                "Connect token for {} has no readable expiry, it will not be cached",
                name
            );
        }
        info!(
            "Connect token issued for {}: {} (expires {:?})",
            name,
            obfuscate_token(&access.token),
            expiry
        );

        Ok(AccessGrant::private(access.token.clone(), expiry))
    }

    /// Start the long-running `host` session
    pub async fn start(&self, cancel: &CancellationToken) -> Result<()> {
        let mut session = self.session.lock().await;

        let (name, status, port_count) = {
            let state = self.state.read().await;
            let name = state.identity.as_ref().map(|i| i.name.clone());
            (name, state.status, state.ports.len())
        };

        let session_alive = session
            .as_ref()
            .map(|hosted| !hosted.has_exited())
            .unwrap_or(false);

        let name = match (status, name) {
            (TunnelStatus::Hosting, _) if session_alive => {
                debug!("Tunnel is already hosting, ignoring start");
                return Ok(());
            }
            (TunnelStatus::Hosting, Some(name)) => {
                warn!("Hosted session for {} has exited, starting a new one", name);
                *session = None;
                name
            }
            (TunnelStatus::Stopped, _) => {
                return Err(Error::InvalidState("tunnel has been stopped".to_string()));
            }
            (TunnelStatus::Ready, Some(name)) => name,
            _ => {
                return Err(Error::InvalidState(
                    "tunnel must be initialized before hosting; call ensure_tunnel first"
                        .to_string(),
                ));
            }
        };

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        if port_count == 0 {
            warn!("Hosting tunnel {} with no bound ports", name);
        }

        let event_tx = self.event_tx.clone();
        let on_line: LineCallback = Arc::new(move |line: &str| {
            info!("[host] {}", line);
            let _ = event_tx.send(ProvisionEvent::HostOutput {
                line: line.to_string(),
            });
        });

        let hosted = self
            .runner
            .host(&Invocation::new(self.program()).args(["host", name.as_str()]), on_line)
            .await?;
        let pid = hosted.pid();
        *session = Some(hosted);

        self.state.write().await.status = TunnelStatus::Hosting;
        info!("Tunnel {} is hosting (pid {:?})", name, pid);
        self.emit(ProvisionEvent::Hosting { pid });
        Ok(())
    }

    /// End the hosted session, if any. The provider cannot be used afterwards.
    pub async fn stop(&self) -> Result<()> {
        let mut session = self.session.lock().await;

        let result = match session.take() {
            Some(mut hosted) => {
                info!("Stopping hosted session (pid {:?})", hosted.pid());
                hosted.terminate(self.config.stop_grace()).await
            }
            None => {
                debug!("No hosted session to stop");
                Ok(())
            }
        };

        let was_stopped = {
            let mut state = self.state.write().await;
            let was_stopped = state.status.is_terminal();
            state.status = TunnelStatus::Stopped;
            was_stopped
        };
        if !was_stopped {
            self.emit(ProvisionEvent::Stopped);
        }

        result
    }

    /// Re-read the tunnel and merge the port URIs the agent reports
    pub async fn refresh(&self, cancel: &CancellationToken) -> Result<()> {
        let name = self.require_ready().await?;

        match self.find_tunnel(&name, cancel).await? {
            Some(tunnel) => {
                let mut state = self.state.write().await;
                for binding in active_ports(&tunnel) {
                    state.merge_port(binding);
                }
            }
            None => {
                warn!("Tunnel {} was not found while refreshing", name);
            }
        }
        Ok(())
    }

    pub async fn status(&self) -> TunnelStatus {
        self.state.read().await.status
    }

    pub async fn is_initialized(&self) -> bool {
        self.state.read().await.initialized
    }

    pub async fn identity(&self) -> Option<TunnelIdentity> {
        self.state.read().await.identity.clone()
    }

    /// Public base URL, once the identity is resolved
    pub async fn url(&self) -> Option<String> {
        self.state
            .read()
            .await
            .identity
            .as_ref()
            .map(|identity| format!("https://{}.{}", identity.id, self.config.agent_domain))
    }

    /// URI of a bound port, only once the agent has reported one
    pub async fn port_uri(&self, port: u16) -> Option<String> {
        self.state
            .read()
            .await
            .ports
            .get(&port)
            .and_then(|binding| binding.uri.clone())
    }

    pub async fn ports(&self) -> Vec<PortBinding> {
        self.state.read().await.ports.values().cloned().collect()
    }

    pub async fn access_mode(&self) -> AccessMode {
        self.state.read().await.access.mode
    }

    /// Whether a `host` session was started and is still running
    pub async fn is_session_alive(&self) -> bool {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|session| !session.has_exited())
            .unwrap_or(false)
    }

    /// Agent installed and user signed in; checked once per provider
    async fn verify_preconditions(&self, cancel: &CancellationToken) -> Result<()> {
        self.preconditions
            .get_or_try_init(|| async move {
                let version = self.check_version(cancel).await?;
                self.check_session(cancel).await?;
                Ok::<_, Error>(version)
            })
            .await?;
        Ok(())
    }

    async fn check_version(&self, cancel: &CancellationToken) -> Result<String> {
        let program = self.program();
        let output = match self.run(&self.query(["--version"]), cancel).await {
            Ok(output) => output,
            Err(Error::AgentNotFound(program)) => {
                return Err(Error::precondition(
                    format!("Dev tunnel CLI '{}' is not installed", program),
                    INSTALL_HINT,
                ));
            }
            Err(e) => return Err(e),
        };

        match decoder::parse_cli_version(&output.stdout) {
            Some(version) if output.success() => {
                debug!("Agent version: {}", version);
                Ok(version)
            }
            _ => Err(Error::precondition(
                format!("'{}' did not report a dev tunnel CLI version", program),
                INSTALL_HINT,
            )),
        }
    }

    async fn check_session(&self, cancel: &CancellationToken) -> Result<()> {
        let output = self
            .run(&self.query(["user", "show", "--json"]), cancel)
            .await?;

        let user = if output.success() {
            decoder::decode_user(&output.stdout)?
        } else {
            None
        };

        match user {
            Some(user) if user.is_logged_in() => {
                info!(
                    "Logged in user: {}",
                    user.username.as_deref().unwrap_or_default()
                );
                Ok(())
            }
            _ => Err(Error::precondition(
                "User is not logged in",
                format!(
                    "Please log in using '{} user login'",
                    self.config.agent_binary
                ),
            )),
        }
    }

    async fn allows_anonymous(&self, name: &str, cancel: &CancellationToken) -> Result<bool> {
        let output = self
            .run(&self.query(["access", "list", name, "--json"]), cancel)
            .await?;
        if !output.success() {
            return Err(Error::Provisioning(format!(
                "failed to read access control: {}",
                failure_detail(&output)
            )));
        }
        Ok(decoder::decode_access_list(&output.stdout)?.allows_anonymous_connect())
    }

    /// `None` when the agent reports nothing or fails: no distinction
    /// between "not found" and other errors is available from the exit code.
    async fn find_tunnel(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<TunnelDescriptor>> {
        let output = self
            .run(&self.query(["show", name, "--json"]), cancel)
            .await?;
        if !output.success() {
            debug!("Tunnel {} not found: {}", name, failure_detail(&output));
            return Ok(None);
        }

        let tunnel = decoder::decode_tunnel(&output.stdout)?;
        if let Some(tunnel) = &tunnel {
            debug!("Found tunnel {}: {}", name, tunnel.tunnel_id);
        }
        Ok(tunnel)
    }

    async fn find_port(
        &self,
        name: &str,
        port: u16,
        cancel: &CancellationToken,
    ) -> Result<Option<PortDescriptor>> {
        let port_arg = port.to_string();
        let output = self
            .run(
                &self.query([
                    "port",
                    "show",
                    name,
                    "--port-number",
                    port_arg.as_str(),
                    "--json",
                ]),
                cancel,
            )
            .await?;
        if !output.success() {
            debug!(
                "Port {} not found on {}: {}",
                port,
                name,
                failure_detail(&output)
            );
            return Ok(None);
        }

        decoder::decode_port(&output.stdout)
    }

    async fn require_ready(&self) -> Result<String> {
        let state = self.state.read().await;
        match (&state.identity, state.status) {
            (_, TunnelStatus::Stopped) => {
                Err(Error::InvalidState("tunnel has been stopped".to_string()))
            }
            (Some(identity), status) if status.is_ready() => Ok(identity.name.clone()),
            _ => Err(Error::InvalidState(
                "tunnel must be initialized first; call ensure_tunnel before configuring ports or access"
                    .to_string(),
            )),
        }
    }

    async fn port_lock(&self, port: u16) -> Arc<Mutex<()>> {
        self.port_locks
            .lock()
            .await
            .entry(port)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn run(&self, invocation: &Invocation, cancel: &CancellationToken) -> Result<ProcessOutput> {
        let output = self.runner.run(invocation, cancel).await?;
        if !output.success() {
            debug!(
                "'{}' exited with {}: {}",
                invocation,
                output.exit_code,
                output.stderr.trim()
            );
        }
        Ok(output)
    }

    fn program(&self) -> String {
        self.config.agent_program()
    }

    fn query<const N: usize>(&self, args: [&str; N]) -> Invocation {
        Invocation::new(self.program())
            .args(args)
            .timeout(self.config.query_timeout())
    }

    fn mutation<const N: usize>(&self, args: [&str; N]) -> Invocation {
        Invocation::new(self.program())
            .args(args)
            .timeout(self.config.mutation_timeout())
    }

    fn emit(&self, event: ProvisionEvent) {
        if let Err(e) = self.event_tx.send(event) {
            debug!("No subscribers for provisioning event: {:?}", e.0);
        }
    }
}

/// Port bindings reported inside a tunnel descriptor
fn active_ports(tunnel: &TunnelDescriptor) -> Vec<PortBinding> {
    tunnel
        .ports
        .iter()
        .filter(|port| port.port_number > 0)
        .map(|port| PortBinding {
            port_number: port.port_number,
            protocol: port
                .protocol
                .as_deref()
                .and_then(|p| p.parse().ok())
                .unwrap_or_default(),
            uri: port.port_uri.clone().filter(|uri| !uri.is_empty()),
        })
        .collect()
}

fn failure_detail(output: &ProcessOutput) -> String {
    match output.stderr.lines().map(str::trim).find(|l| !l.is_empty()) {
        Some(line) => format!("{} (exit code {})", line, output.exit_code),
        None => format!("exit code {}", output.exit_code),
    }
}
