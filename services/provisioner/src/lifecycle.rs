//! Node lifecycle controller.
//!
//! The controller:
//! - Validates a configuration against its backend before anything is acquired
//! - Runs the backend pipeline that takes a node from `Requested` to `Running`
//! - Records failures on the node and cleans up after them
//! - Stops running nodes, gracefully first when a management client is set

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::configuration::NodeConfiguration;
use crate::error::{ConfigurationError, NodeError, ProvisionError};
use crate::ids::NodeId;
use crate::management::ManagementEndpoint;
use crate::node::{BackendKind, Node, NodeCell, NodeDescriptor, NodeState};
use crate::pipeline::{Backend, BackendRegistry, DeploymentJob, Environment};

/// Drives nodes through their state machine.
#[derive(Clone)]
pub struct LifecycleController {
    backends: Arc<BackendRegistry>,
    env: Arc<Environment>,
}

impl LifecycleController {
    pub fn new(backends: Arc<BackendRegistry>, env: Arc<Environment>) -> Self {
        Self { backends, env }
    }

    pub fn environment(&self) -> &Arc<Environment> {
        &self.env
    }

    /// Check `config` and return the backend that will deploy it.
    pub async fn validate(
        &self,
        config: &NodeConfiguration,
    ) -> Result<Arc<dyn Backend>, ConfigurationError> {
        let backend = self.backends.get(config.backend_kind())?;
        backend.validate(config, &self.env).await?;
        Ok(backend)
    }

    /// Create the node record in `Requested`, with its backend slot reserved.
    pub fn prepare(&self, id: NodeId, config: &NodeConfiguration, backend: &dyn Backend) -> NodeCell {
        let payload = backend.reserve(config, &self.env.session);
        debug!(
            node_id = %id,
            backend = %backend.kind(),
            sequence = payload.sequence(),
            management_port = payload.management_port(),
            "Reserved node slot"
        );
        NodeCell::new(Node::new(id, config.node_type(), payload))
    }

    /// Deploy a prepared node.
    ///
    /// Resolves with the `Running` descriptor, or with the error recorded on
    /// the node after it moved to `Failed`.
    pub async fn provision(
        &self,
        node: NodeCell,
        config: Arc<NodeConfiguration>,
        backend: Arc<dyn Backend>,
        cancel: watch::Receiver<bool>,
    ) -> Result<NodeDescriptor, NodeError> {
        let id = node.read(|n| n.id).await;
        let mut job = DeploymentJob::new(node.clone(), id, config, self.env.clone(), cancel);
        info!(node_id = %id, backend = %backend.kind(), "Provisioning node");

        let result = backend.deploy(&mut job).await;
        if let Err(e) = result {
            error!(node_id = %id, step = e.step(), error = %e, "Node deployment failed");
            backend.abandon(&mut job).await;
            job.release_channel().await;
            let failure = NodeError::new(id, e);
            node.fail(failure.clone()).await;
            return Err(failure);
        }
        job.release_channel().await;

        let descriptor = node.descriptor().await;
        info!(
            node_id = %id,
            provider_id = ?descriptor.provider_id,
            "Node running"
        );
        Ok(descriptor)
    }

    /// Stop a running node.
    ///
    /// The stop channel is always released, even when the stop command fails.
    pub async fn stop(
        &self,
        node: &NodeCell,
        config: Arc<NodeConfiguration>,
    ) -> Result<NodeDescriptor, NodeError> {
        let (id, state, kind) = node.read(|n| (n.id, n.state, n.backend())).await;
        if state != NodeState::Running {
            return Err(NodeError::new(
                id,
                ProvisionError::InvalidState {
                    operation: "stop",
                    state,
                },
            ));
        }
        let backend = self
            .backends
            .get(kind)
            .map_err(|e| NodeError::new(id, e))?;

        node.transition(NodeState::Stopping).await;
        info!(node_id = %id, "Stopping node");
        self.request_shutdown(node, &config).await;

        let (_never_cancelled, cancel) = watch::channel(false);
        let mut job = DeploymentJob::new(node.clone(), id, config, self.env.clone(), cancel);
        let result = backend.stop(&mut job).await;
        job.release_channel().await;

        match result {
            Ok(()) => {
                node.transition(NodeState::Terminated).await;
                info!(node_id = %id, "Node terminated");
                Ok(node.descriptor().await)
            }
            Err(e) => {
                warn!(node_id = %id, step = e.step(), error = %e, "Failed to stop node");
                let failure = NodeError::new(id, e);
                node.fail(failure.clone()).await;
                Err(failure)
            }
        }
    }

    /// UUID the grid runtime gave the node, if it can be asked.
    pub async fn node_uuid(
        &self,
        node: &NodeCell,
        config: &NodeConfiguration,
    ) -> Result<Option<String>, NodeError> {
        let Some(client) = &self.env.management else {
            return Ok(None);
        };
        let (id, endpoint) = node.read(|n| (n.id, management_endpoint(n, config))).await;
        let Some(endpoint) = endpoint else {
            return Ok(None);
        };
        client
            .node_uuid(&endpoint)
            .await
            .map(Some)
            .map_err(|e| NodeError::new(id, ProvisionError::Management(e)))
    }

    /// Ask the node to shut itself down. Failure only delays the hard stop.
    async fn request_shutdown(&self, node: &NodeCell, config: &NodeConfiguration) {
        let Some(client) = &self.env.management else {
            return;
        };
        let (id, endpoint) = node.read(|n| (n.id, management_endpoint(n, config))).await;
        let Some(endpoint) = endpoint else {
            debug!(node_id = %id, "No management endpoint, skipping graceful shutdown");
            return;
        };
        let policy = self.env.shutdown_policy;
        match client
            .shutdown(&endpoint, policy.grace, policy.force_after)
            .await
        {
            Ok(()) => info!(node_id = %id, %endpoint, "Requested graceful shutdown"),
            Err(e) => warn!(node_id = %id, %endpoint, error = %e, "Graceful shutdown refused"),
        }
    }
}

/// Management endpoint of a node: configured host, else the node's address,
/// else localhost for local processes.
pub fn management_endpoint(node: &Node, config: &NodeConfiguration) -> Option<ManagementEndpoint> {
    let host = config
        .management_host()
        .or_else(|| node.reachable_address())
        .or((node.backend() == BackendKind::Local).then_some("localhost"))?;
    Some(ManagementEndpoint {
        host: host.to_string(),
        port: node.payload.management_port(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::BackendConfig;
    use crate::ids::SessionId;
    use crate::node::{BackendPayload, NodeType};

    fn node(kind: BackendKind) -> Node {
        let payload = BackendPayload::pending(kind, &SessionId::new(), 0, 12001);
        Node::new(NodeId::new(), NodeType::Worker, payload)
    }

    #[test]
    fn test_local_endpoint_defaults_to_localhost() {
        let config = NodeConfiguration::builder(NodeType::Worker, BackendConfig::Local)
            .build()
            .unwrap();

        let endpoint = management_endpoint(&node(BackendKind::Local), &config).unwrap();

        assert_eq!(endpoint.to_string(), "localhost:12001");
    }

    #[test]
    fn test_batch_endpoint_needs_a_host() {
        let config = NodeConfiguration::builder(NodeType::Worker, BackendConfig::Batch { slots: 1 })
            .build()
            .unwrap();

        assert_eq!(management_endpoint(&node(BackendKind::Batch), &config), None);
    }

    #[test]
    fn test_endpoint_prefers_public_address() {
        let config = NodeConfiguration::builder(
            NodeType::Worker,
            BackendConfig::Cloud {
                profile: "small".into(),
                credentials: "ops".into(),
            },
        )
        .build()
        .unwrap();
        let mut node = node(BackendKind::Cloud);
        node.private_addresses.insert("10.0.0.4".into());
        node.public_addresses.insert("203.0.113.4".into());

        let endpoint = management_endpoint(&node, &config).unwrap();

        assert_eq!(endpoint.host, "203.0.113.4");
    }
}
