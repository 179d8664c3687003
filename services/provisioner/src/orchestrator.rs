//! Process-wide owner of every provisioning collaborator.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use crate::channel::{ChannelFactory, SystemChannelFactory};
use crate::configuration::NodeConfiguration;
use crate::context::{ContextFactory, ContextKind, ContextManager};
use crate::credentials::CredentialRegistry;
use crate::error::{ConfigurationError, RegistryError, ShutdownReport};
use crate::ids::{NodeId, SessionId};
use crate::lifecycle::LifecycleController;
use crate::management::{ManagementClient, ShutdownPolicy};
use crate::node::NodeDescriptor;
use crate::pipeline::{Backend, BackendRegistry, Environment};
use crate::registry::{NodeHandle, NodeRegistry};

pub const DEFAULT_MAX_PARALLEL_DEPLOYMENTS: usize = 16;

/// Builder for [`Orchestrator`].
pub struct OrchestratorBuilder {
    factory: Arc<dyn ContextFactory>,
    session: SessionId,
    credentials: Arc<CredentialRegistry>,
    channels: Arc<dyn ChannelFactory>,
    management: Option<Arc<dyn ManagementClient>>,
    shutdown_policy: ShutdownPolicy,
    driver_address: Option<String>,
    backends: BackendRegistry,
    max_parallel_deployments: usize,
}

impl OrchestratorBuilder {
    pub fn session(mut self, session: SessionId) -> Self {
        self.session = session;
        self
    }

    pub fn credentials(mut self, credentials: Arc<CredentialRegistry>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn channels(mut self, channels: Arc<dyn ChannelFactory>) -> Self {
        self.channels = channels;
        self
    }

    pub fn management(mut self, client: Arc<dyn ManagementClient>) -> Self {
        self.management = Some(client);
        self
    }

    pub fn shutdown_policy(mut self, policy: ShutdownPolicy) -> Self {
        self.shutdown_policy = policy;
        self
    }

    pub fn driver_address(mut self, address: impl Into<String>) -> Self {
        self.driver_address = Some(address.into());
        self
    }

    pub fn backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backends.register(backend);
        self
    }

    pub fn max_parallel_deployments(mut self, limit: usize) -> Self {
        self.max_parallel_deployments = limit;
        self
    }

    pub fn build(self) -> Orchestrator {
        let contexts = ContextManager::new(self.factory);
        let env = Arc::new(Environment {
            session: self.session.clone(),
            contexts: contexts.clone(),
            credentials: self.credentials.clone(),
            channels: self.channels,
            management: self.management,
            shutdown_policy: self.shutdown_policy,
            driver_address: self.driver_address,
        });
        let backends = Arc::new(self.backends);
        let controller = LifecycleController::new(backends.clone(), env);
        let nodes = NodeRegistry::new(controller, self.max_parallel_deployments);
        info!(session = %self.session, backends = ?backends.kinds(), "Orchestrator ready");

        Orchestrator {
            session: self.session,
            contexts,
            credentials: self.credentials,
            backends,
            nodes,
            shut_down: AtomicBool::new(false),
        }
    }
}

/// Owns the context manager, credentials, backends and nodes of one session.
pub struct Orchestrator {
    session: SessionId,
    contexts: ContextManager,
    credentials: Arc<CredentialRegistry>,
    backends: Arc<BackendRegistry>,
    nodes: NodeRegistry,
    shut_down: AtomicBool,
}

impl Orchestrator {
    pub fn builder(factory: Arc<dyn ContextFactory>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            factory,
            session: SessionId::new(),
            credentials: Arc::new(CredentialRegistry::new()),
            channels: Arc::new(SystemChannelFactory),
            management: None,
            shutdown_policy: ShutdownPolicy::default(),
            driver_address: None,
            backends: BackendRegistry::new(),
            max_parallel_deployments: DEFAULT_MAX_PARALLEL_DEPLOYMENTS,
        }
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    pub fn contexts(&self) -> &ContextManager {
        &self.contexts
    }

    pub fn credentials(&self) -> &Arc<CredentialRegistry> {
        &self.credentials
    }

    pub fn backends(&self) -> &BackendRegistry {
        &self.backends
    }

    pub fn nodes(&self) -> &NodeRegistry {
        &self.nodes
    }

    /// Merge the provider's generated key pairs into the credential registry.
    pub async fn import_generated_credentials(&self) -> Result<usize, ConfigurationError> {
        let context = self
            .contexts
            .get_context(ContextKind::CredentialStore)
            .await
            .map_err(|e| ConfigurationError::Provider {
                operation: "open the credential store",
                source: e.into(),
            })?;
        let store = context
            .credential_store()
            .map_err(|e| ConfigurationError::Provider {
                operation: "open the credential store",
                source: e.into(),
            })?;
        self.credentials.merge_generated(store.as_ref()).await
    }

    /// Request a node. See [`NodeRegistry::add`].
    pub async fn provision(&self, config: Arc<NodeConfiguration>) -> Result<NodeHandle, RegistryError> {
        self.nodes.add(config).await
    }

    /// Stop and forget a node. See [`NodeRegistry::remove`].
    pub async fn terminate(&self, id: NodeId) -> Result<NodeDescriptor, RegistryError> {
        self.nodes.remove(id).await
    }

    pub async fn nodes_snapshot(&self) -> Vec<NodeDescriptor> {
        self.nodes.snapshot().await
    }

    /// Stop every node, run backend cleanup and tear down the contexts.
    ///
    /// Only the first call does anything; later calls return an empty report.
    pub async fn shutdown(&self) -> ShutdownReport {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return ShutdownReport::default();
        }
        info!(session = %self.session, "Shutting down orchestrator");

        let report = self.nodes.close_all().await;
        self.backends.shutdown_all().await;
        let failed_contexts = self.contexts.close().await;
        if !failed_contexts.is_empty() {
            warn!(kinds = ?failed_contexts, "Some contexts failed to tear down");
        }
        info!(report = %report, "Orchestrator shut down");
        report
    }
}
