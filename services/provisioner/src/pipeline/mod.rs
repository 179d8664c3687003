//! Deployment pipelines.
//!
//! A backend turns a [`NodeConfiguration`] into a running grid node through a
//! fixed sequence of steps. Steps run strictly in order on one job. A failing
//! critical step ends the pipeline; a failing optional step is logged and
//! skipped. The steps themselves move the node through its states.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::channel::{ChannelFactory, CommandOutput, RemoteChannel};
use crate::configuration::NodeConfiguration;
use crate::context::ContextManager;
use crate::credentials::CredentialRegistry;
use crate::error::{ConfigurationError, DeploymentStepError, StepFailure};
use crate::ids::{NodeId, SessionId};
use crate::management::{ManagementClient, ShutdownPolicy};
use crate::node::{BackendKind, BackendPayload, NodeCell, NodeState};

pub mod batch;
pub mod cloud;
pub mod local;
pub mod render;

pub use batch::{BatchBackend, BatchSettings};
pub use cloud::{CloudBackend, CloudSettings};
pub use local::{LocalBackend, LocalSettings};

/// Process-wide collaborators every pipeline may use.
pub struct Environment {
    pub session: SessionId,
    pub contexts: ContextManager,
    pub credentials: Arc<CredentialRegistry>,
    pub channels: Arc<dyn ChannelFactory>,
    pub management: Option<Arc<dyn ManagementClient>>,
    pub shutdown_policy: ShutdownPolicy,
    /// Driver address used when a node configuration does not name one.
    pub driver_address: Option<String>,
}

// =============================================================================
// Steps
// =============================================================================

/// Runs the steps of one job, checking for cancellation in between.
#[derive(Clone)]
pub struct StepRunner {
    node: NodeCell,
    node_id: NodeId,
    cancel: watch::Receiver<bool>,
}

impl StepRunner {
    pub fn new(node: NodeCell, node_id: NodeId, cancel: watch::Receiver<bool>) -> Self {
        Self {
            node,
            node_id,
            cancel,
        }
    }

    fn check_cancelled(&self, step: &'static str) -> Result<(), DeploymentStepError> {
        if *self.cancel.borrow() {
            warn!(node_id = %self.node_id, step, "Deployment cancelled");
            return Err(DeploymentStepError::Cancelled { step });
        }
        Ok(())
    }

    /// Run a step whose failure ends the pipeline.
    pub async fn critical<T, E, F>(&self, step: &'static str, work: F) -> Result<T, DeploymentStepError>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<StepFailure>,
    {
        self.check_cancelled(step)?;
        debug!(node_id = %self.node_id, step, "Running step");
        work.await.map_err(|e| {
            let source = e.into();
            warn!(node_id = %self.node_id, step, error = %source, "Step failed");
            DeploymentStepError::Failed { step, source }
        })
    }

    /// Run a step whose failure is logged and ignored.
    pub async fn optional<T, E, F>(&self, step: &'static str, work: F) -> Result<Option<T>, DeploymentStepError>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<StepFailure>,
    {
        self.check_cancelled(step)?;
        debug!(node_id = %self.node_id, step, "Running optional step");
        match work.await {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                let error: StepFailure = e.into();
                warn!(node_id = %self.node_id, step, error = %error, "Optional step failed, continuing");
                Ok(None)
            }
        }
    }

    /// Move the node to `next`.
    pub async fn advance(&self, next: NodeState) -> Result<(), DeploymentStepError> {
        if self.node.transition(next).await {
            info!(node_id = %self.node_id, state = %next, "Node advanced");
            Ok(())
        } else {
            let current = self.node.state().await;
            Err(DeploymentStepError::Failed {
                step: "advance",
                source: StepFailure::Invalid(format!("illegal transition {current} -> {next}")),
            })
        }
    }
}

/// One pipeline run over one node.
pub struct DeploymentJob {
    pub node: NodeCell,
    pub node_id: NodeId,
    pub config: Arc<NodeConfiguration>,
    pub env: Arc<Environment>,
    /// Open channel, if the pipeline has one. Always disconnected when the
    /// job ends.
    pub channel: Option<Box<dyn RemoteChannel>>,
    pub steps: StepRunner,
}

impl DeploymentJob {
    pub fn new(
        node: NodeCell,
        node_id: NodeId,
        config: Arc<NodeConfiguration>,
        env: Arc<Environment>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        let steps = StepRunner::new(node.clone(), node_id, cancel);
        Self {
            node,
            node_id,
            config,
            env,
            channel: None,
            steps,
        }
    }

    /// Borrow the open channel.
    pub fn channel(&mut self) -> Result<&mut Box<dyn RemoteChannel>, StepFailure> {
        self.channel
            .as_mut()
            .ok_or_else(|| StepFailure::Invalid("no channel opened".to_string()))
    }

    /// Connect the open channel.
    pub async fn connect(&mut self) -> Result<(), StepFailure> {
        Ok(self.channel()?.connect().await?)
    }

    /// Run a command on the open channel.
    pub async fn exec(&mut self, command: &str) -> Result<CommandOutput, StepFailure> {
        Ok(self.channel()?.execute(command).await?)
    }

    /// Upload onto the open channel.
    pub async fn upload(
        &mut self,
        data: &mut (dyn AsyncRead + Send + Unpin),
        remote_path: &str,
    ) -> Result<u64, StepFailure> {
        Ok(self.channel()?.upload(data, remote_path).await?)
    }

    /// Disconnect and drop the channel. Safe to call repeatedly.
    pub async fn release_channel(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            channel.disconnect().await;
        }
    }

    pub async fn payload(&self) -> BackendPayload {
        self.node.read(|n| n.payload.clone()).await
    }

    /// Driver address to render: the configuration's, else the
    /// orchestrator-wide one, else `localhost`.
    pub fn driver_address(&self) -> String {
        render::resolve_driver_address(self.config.driver_address(), self.env.driver_address.as_deref())
    }
}

// =============================================================================
// Backends
// =============================================================================

/// A provisioning mechanism.
#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Reject requests this backend cannot serve before anything is provisioned.
    async fn validate(
        &self,
        config: &NodeConfiguration,
        env: &Environment,
    ) -> Result<(), ConfigurationError>;

    /// Allocate the node's sequence number and ports.
    fn reserve(&self, config: &NodeConfiguration, session: &SessionId) -> BackendPayload;

    /// Take the node from `Requested` to `Running`.
    async fn deploy(&self, job: &mut DeploymentJob) -> Result<(), DeploymentStepError>;

    /// Release whatever a failed deployment left behind. Best effort.
    async fn abandon(&self, job: &mut DeploymentJob);

    /// Stop a running node and release its resources.
    async fn stop(&self, job: &mut DeploymentJob) -> Result<(), DeploymentStepError>;

    /// Run cleanup hooks when the orchestrator shuts down.
    async fn shutdown(&self) {}
}

/// Backends available to the orchestrator, by kind.
#[derive(Default)]
pub struct BackendRegistry {
    backends: HashMap<BackendKind, Arc<dyn Backend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `backend`, replacing any backend of the same kind.
    pub fn register(&mut self, backend: Arc<dyn Backend>) -> &mut Self {
        let kind = backend.kind();
        if self.backends.insert(kind, backend).is_some() {
            warn!(backend = %kind, "Replaced registered backend");
        }
        self
    }

    pub fn get(&self, kind: BackendKind) -> Result<Arc<dyn Backend>, ConfigurationError> {
        self.backends
            .get(&kind)
            .cloned()
            .ok_or(ConfigurationError::BackendUnavailable(kind))
    }

    pub fn kinds(&self) -> Vec<BackendKind> {
        let mut kinds: Vec<_> = self.backends.keys().copied().collect();
        kinds.sort();
        kinds
    }

    pub async fn shutdown_all(&self) {
        for kind in self.kinds() {
            if let Some(backend) = self.backends.get(&kind) {
                debug!(backend = %kind, "Running backend cleanup");
                backend.shutdown().await;
            }
        }
    }
}
