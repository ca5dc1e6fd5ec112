// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Dev Tunnel Provisioner Contributors

// Dev Tunnel Provisioner - Lifecycle Binder
// Maps host lifecycle events onto a tunnel resource

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use devtunnel_common::{ResourceState, Result};

use crate::resource::TunnelResource;

/// Lifecycle notifications from the hosting application
#[derive(Debug, Clone)]
pub enum HostEvent {
    /// The resource is about to start; may fire more than once
    BeforeStart { cancel: CancellationToken },
    /// The resource has started
    Started,
    /// The host is shutting the resource down
    Stop,
}

/// Runs a resource's initialization exactly once per instance and reports
/// its state to the host
pub struct LifecycleBinder {
    resource: Arc<TunnelResource>,
    /// Set while an initialization is running or has succeeded
    initialized: AtomicBool,
    state_tx: watch::Sender<ResourceState>,
    /// Cancels work started by this binder on stop
    shutdown: CancellationToken,
}

impl LifecycleBinder {
    pub fn new(resource: Arc<TunnelResource>) -> Self {
        let (state_tx, _) = watch::channel(ResourceState::NotStarted);
        Self {
            resource,
            initialized: AtomicBool::new(false),
            state_tx,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn resource(&self) -> &Arc<TunnelResource> {
        &self.resource
    }

    pub fn state(&self) -> ResourceState {
        self.state_tx.borrow().clone()
    }

    /// Watch state changes
    pub fn watch(&self) -> watch::Receiver<ResourceState> {
        self.state_tx.subscribe()
    }

    pub async fn dispatch(&self, event: HostEvent) -> Result<()> {
        match event {
            HostEvent::BeforeStart { cancel } => self.on_before_start(&cancel).await,
            HostEvent::Started => self.on_started().await,
            HostEvent::Stop => self.on_stop().await,
        }
    }

    /// Initialize the resource unless an earlier event already did
    ///
    /// The work is cancelled by either `cancel` or a later stop. Once stopped,
    /// the outcome is no longer published.
    pub async fn on_before_start(&self, cancel: &CancellationToken) -> Result<()> {
        let name = self.resource.name();

        if self
            .initialized
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!("Tunnel {} is already initialized, skipping", name);
            return Ok(());
        }

        self.publish(ResourceState::Starting);

        let linked = self.shutdown.child_token();
        let forward = tokio::spawn({
            let cancel = cancel.clone();
            let linked = linked.clone();
            async move {
                tokio::select! {
                    _ = cancel.cancelled() => linked.cancel(),
                    _ = linked.cancelled() => {}
                }
            }
        });
        let result = self.resource.initialize(&linked).await;
        forward.abort();

        if self.shutdown.is_cancelled() {
            info!("Tunnel {} was stopped during initialization", name);
            return result;
        }

        match result {
            Ok(()) => {
                self.publish(ResourceState::Running);
                Ok(())
            }
            Err(e) => {
                // Let the host retry
                self.initialized.store(false, Ordering::SeqCst);
                error!("Failed to initialize tunnel {}: {}", name, e);
                self.publish(ResourceState::FailedToStart(e.to_string()));
                Err(e)
            }
        }
    }

    /// Pick up port URIs that only appear once the tunnel is hosted
    pub async fn on_started(&self) -> Result<()> {
        if !self.state().is_running() {
            warn!(
                "Tunnel {} reported started but is {:?}, not refreshing",
                self.resource.name(),
                self.state()
            );
            return Ok(());
        }
        self.resource.refresh(&self.shutdown).await
    }

    pub async fn on_stop(&self) -> Result<()> {
        self.shutdown.cancel();
        let result = self.resource.stop().await;
        self.publish(ResourceState::Stopped);
        info!("Tunnel {} stopped", self.resource.name());
        result
    }

    fn publish(&self, state: ResourceState) {
        self.state_tx.send_replace(state);
    }
}

impl std::fmt::Debug for LifecycleBinder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleBinder")
            .field("resource", &self.resource.name())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::TunnelProvider;
    use crate::testing::FakeAgent;
    use devtunnel_common::{
        AccessMode, PortSpec, Protocol, ProvisionerConfig, TunnelDeclaration, TunnelStatus,
    };
    use std::time::Duration;

    fn binder(agent: &Arc<FakeAgent>) -> LifecycleBinder {
        let provider = Arc::new(TunnelProvider::new(
            agent.clone(),
            Arc::new(ProvisionerConfig::default()),
        ));
        let declaration = TunnelDeclaration::new(
            "api",
            vec![PortSpec::new(8080, Protocol::Https)],
            AccessMode::Private,
        );
        LifecycleBinder::new(Arc::new(
            TunnelResource::declare(declaration, provider).unwrap(),
        ))
    }

    fn before_start() -> HostEvent {
        HostEvent::BeforeStart {
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_before_start_initializes_once() {
        let agent = FakeAgent::new();
        let binder = binder(&agent);

        binder.dispatch(before_start()).await.unwrap();
        binder.dispatch(before_start()).await.unwrap();

        assert_eq!(agent.count(&["--version"]), 1);
        assert_eq!(agent.count(&["show"]), 2); // discovery + post-start refresh
        assert_eq!(agent.host_calls(), 1);
        assert_eq!(binder.state(), ResourceState::Running);
    }

    #[tokio::test]
    async fn test_concurrent_before_start_initializes_once() {
        let agent = FakeAgent::new();
        agent.set_delay(Duration::from_millis(10));
        let binder = binder(&agent);

        let (a, b) = tokio::join!(
            binder.dispatch(before_start()),
            binder.dispatch(before_start())
        );
        a.unwrap();
        b.unwrap();

        assert_eq!(agent.count(&["create"]), 1);
        assert_eq!(agent.host_calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_initialization_is_never_running() {
        let agent = FakeAgent::new();
        agent.set_logged_in(false);
        let binder = binder(&agent);
        let mut states = binder.watch();

        assert!(binder.dispatch(before_start()).await.is_err());

        match binder.state() {
            ResourceState::FailedToStart(reason) => assert!(reason.contains("not logged in")),
            other => panic!("unexpected state: {:?}", other),
        }
        assert!(states.has_changed().unwrap());
        assert!(!states.borrow_and_update().is_running());
        assert_eq!(agent.host_calls(), 0);
    }

    #[tokio::test]
    async fn test_failed_initialization_can_be_retried() {
        let agent = FakeAgent::new();
        agent.set_logged_in(false);
        let binder = binder(&agent);

        assert!(binder.dispatch(before_start()).await.is_err());
        agent.set_logged_in(true);
        binder.dispatch(before_start()).await.unwrap();

        assert_eq!(binder.state(), ResourceState::Running);
        assert_eq!(agent.count(&["create"]), 1);
    }

    #[tokio::test]
    async fn test_started_refreshes_metadata() {
        let agent = FakeAgent::new();
        let binder = binder(&agent);
        binder.dispatch(before_start()).await.unwrap();
        let shows = agent.count(&["show"]);

        binder.dispatch(HostEvent::Started).await.unwrap();

        assert_eq!(agent.count(&["show"]), shows + 1);
    }

    #[tokio::test]
    async fn test_started_before_initialization_is_ignored() {
        let agent = FakeAgent::new();
        let binder = binder(&agent);

        binder.dispatch(HostEvent::Started).await.unwrap();

        assert!(agent.calls().is_empty());
    }

    #[tokio::test]
    async fn test_stop_cancels_running_initialization() {
        let agent = FakeAgent::new();
        agent.set_delay(Duration::from_millis(200));
        let binder = Arc::new(binder(&agent));

        let starting = tokio::spawn({
            let binder = binder.clone();
            async move { binder.dispatch(before_start()).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        binder.dispatch(HostEvent::Stop).await.unwrap();

        let result = starting.await.unwrap();
        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(agent.count(&["create"]), 0);
        assert_eq!(agent.host_calls(), 0);
        assert_eq!(binder.state(), ResourceState::Stopped);
    }

    #[tokio::test]
    async fn test_host_cancellation_aborts_initialization() {
        let agent = FakeAgent::new();
        agent.set_delay(Duration::from_millis(200));
        let binder = binder(&agent);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = binder
            .dispatch(HostEvent::BeforeStart { cancel })
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(agent.count(&["create"]), 0);
        assert!(matches!(binder.state(), ResourceState::FailedToStart(_)));
    }

    #[tokio::test]
    async fn test_stop() {
        let agent = FakeAgent::new();
        let binder = binder(&agent);
        binder.dispatch(before_start()).await.unwrap();

        binder.dispatch(HostEvent::Stop).await.unwrap();

        assert_eq!(binder.state(), ResourceState::Stopped);
        assert_eq!(binder.resource().status().await, TunnelStatus::Stopped);
        assert!(agent.all_sessions_terminated());
    }
}
