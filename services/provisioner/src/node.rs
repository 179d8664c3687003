//! Node record and lifecycle states.
//!
//! A node is created in `Requested` when the registry reserves its slot and
//! is mutated only by the lifecycle controller that owns it. Everyone else
//! reads [`NodeDescriptor`] snapshots.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::NodeError;
use crate::ids::{NodeId, SessionId};

/// Role of a node in the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    /// Coordinator that workers connect to.
    Driver,
    /// Processing node.
    Worker,
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Driver => f.write_str("driver"),
            Self::Worker => f.write_str("worker"),
        }
    }
}

/// Provisioning mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Local,
    Cloud,
    Batch,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Cloud => f.write_str("cloud"),
            Self::Batch => f.write_str("batch"),
        }
    }
}

/// Lifecycle state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Requested,
    Provisioning,
    Configuring,
    Starting,
    /// Start command accepted; health is confirmed out of band.
    Running,
    Stopping,
    Terminated,
    Failed,
}

impl NodeState {
    /// No further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated | Self::Failed)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: NodeState) -> bool {
        use NodeState::*;
        match (self, next) {
            (Terminated | Failed, _) => false,
            (_, Failed) => true,
            (Requested, Provisioning)
            | (Provisioning, Configuring)
            | (Configuring, Starting)
            | (Starting, Running)
            | (Running, Stopping)
            | (Stopping, Terminated) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Provisioning => "provisioning",
            Self::Configuring => "configuring",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Terminated => "terminated",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend-specific fields, tagged by backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum BackendPayload {
    Local {
        /// Temporary directory holding the unpacked bundle.
        install_dir: Option<PathBuf>,
        /// OS process id of the spawned node.
        pid: Option<u32>,
        sequence: u32,
        management_port: u16,
    },
    Cloud {
        /// Provider instance id.
        instance_id: Option<String>,
        /// Install directory relative to the login user's home.
        install_dir: Option<String>,
        sequence: u32,
        session: String,
        management_port: u16,
    },
    Batch {
        /// Job id issued by the scheduler.
        job_id: Option<String>,
        /// Config file name inside the deployed bundle.
        config_file: Option<String>,
        sequence: u32,
        session: String,
        management_port: u16,
        server_port: u16,
    },
}

impl BackendPayload {
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Local { .. } => BackendKind::Local,
            Self::Cloud { .. } => BackendKind::Cloud,
            Self::Batch { .. } => BackendKind::Batch,
        }
    }

    pub fn sequence(&self) -> u32 {
        match self {
            Self::Local { sequence, .. }
            | Self::Cloud { sequence, .. }
            | Self::Batch { sequence, .. } => *sequence,
        }
    }

    pub fn management_port(&self) -> u16 {
        match self {
            Self::Local {
                management_port, ..
            }
            | Self::Cloud {
                management_port, ..
            }
            | Self::Batch {
                management_port, ..
            } => *management_port,
        }
    }

    /// Initial payload for a node of the given backend, before any resource exists.
    pub fn pending(kind: BackendKind, session: &SessionId, sequence: u32, management_port: u16) -> Self {
        match kind {
            BackendKind::Local => Self::Local {
                install_dir: None,
                pid: None,
                sequence,
                management_port,
            },
            BackendKind::Cloud => Self::Cloud {
                instance_id: None,
                install_dir: None,
                sequence,
                session: session.to_string(),
                management_port,
            },
            BackendKind::Batch => Self::Batch {
                job_id: None,
                config_file: None,
                sequence,
                session: session.to_string(),
                management_port,
                server_port: 0,
            },
        }
    }
}

/// Mutable node record. Owned by the lifecycle controller.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub node_type: NodeType,
    pub state: NodeState,
    /// Provider or scheduler identifier once issued.
    pub provider_id: Option<String>,
    pub public_addresses: BTreeSet<String>,
    pub private_addresses: BTreeSet<String>,
    pub payload: BackendPayload,
    pub error: Option<NodeError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Node {
    pub fn new(id: NodeId, node_type: NodeType, payload: BackendPayload) -> Self {
        let now = Utc::now();
        Self {
            id,
            node_type,
            state: NodeState::Requested,
            provider_id: None,
            public_addresses: BTreeSet::new(),
            private_addresses: BTreeSet::new(),
            payload,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn backend(&self) -> BackendKind {
        self.payload.kind()
    }

    pub fn descriptor(&self) -> NodeDescriptor {
        NodeDescriptor {
            id: self.id,
            provider_id: self.provider_id.clone(),
            node_type: self.node_type,
            backend: self.backend(),
            state: self.state,
            public_addresses: self.public_addresses.clone(),
            private_addresses: self.private_addresses.clone(),
            payload: self.payload.clone(),
            error: self.error.as_ref().map(|e| e.source.to_string()),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    /// Preferred address for reaching the node from the provisioner.
    pub fn reachable_address(&self) -> Option<&str> {
        self.public_addresses
            .iter()
            .next()
            .or_else(|| self.private_addresses.iter().next())
            .map(String::as_str)
    }
}

/// Read-only view of a node handed to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeDescriptor {
    pub id: NodeId,
    pub provider_id: Option<String>,
    pub node_type: NodeType,
    pub backend: BackendKind,
    pub state: NodeState,
    pub public_addresses: BTreeSet<String>,
    pub private_addresses: BTreeSet<String>,
    pub payload: BackendPayload,
    /// Rendered error of a failed node.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Shared cell around a node record.
///
/// The registry keeps one clone for snapshots; the controller keeps the other
/// and is the only writer.
#[derive(Debug, Clone)]
pub struct NodeCell(Arc<RwLock<Node>>);

impl NodeCell {
    pub fn new(node: Node) -> Self {
        Self(Arc::new(RwLock::new(node)))
    }

    pub async fn descriptor(&self) -> NodeDescriptor {
        self.0.read().await.descriptor()
    }

    pub async fn state(&self) -> NodeState {
        self.0.read().await.state
    }

    /// Read a value out of the node.
    pub async fn read<T>(&self, f: impl FnOnce(&Node) -> T) -> T {
        let node = self.0.read().await;
        f(&node)
    }

    /// Mutate fields other than the state.
    pub async fn update(&self, f: impl FnOnce(&mut Node)) {
        let mut node = self.0.write().await;
        f(&mut node);
        node.updated_at = Utc::now();
    }

    /// Move to `next` if the state machine allows it.
    ///
    /// Returns false (and leaves the node untouched) for an illegal move.
    pub async fn transition(&self, next: NodeState) -> bool {
        let mut node = self.0.write().await;
        if !node.state.can_transition_to(next) {
            warn!(
                node_id = %node.id,
                from = %node.state,
                to = %next,
                "Rejected illegal node state transition"
            );
            return false;
        }
        debug!(node_id = %node.id, from = %node.state, to = %next, "Node state transition");
        node.state = next;
        node.updated_at = Utc::now();
        true
    }

    /// Absorb the node into `Failed`, recording the error.
    ///
    /// Terminal nodes are left alone, so a failed node keeps its first error.
    pub async fn fail(&self, error: NodeError) {
        let mut node = self.0.write().await;
        if node.state.is_terminal() {
            warn!(
                node_id = %node.id,
                state = %node.state,
                error = %error,
                "Ignoring failure of a node that already finished"
            );
            return;
        }
        node.state = NodeState::Failed;
        node.error = Some(error);
        node.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProvisionError;

    #[test]
    fn test_happy_path_transitions() {
        use NodeState::*;
        let path = [
            Requested,
            Provisioning,
            Configuring,
            Starting,
            Running,
            Stopping,
            Terminated,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{:?}", pair);
        }
    }

    #[test]
    fn test_failed_reachable_from_non_terminal() {
        use NodeState::*;
        for state in [Requested, Provisioning, Configuring, Starting, Running, Stopping] {
            assert!(state.can_transition_to(Failed));
        }
        assert!(!Terminated.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Failed));
    }

    #[test]
    fn test_no_skipping_or_resurrection() {
        use NodeState::*;
        assert!(!Requested.can_transition_to(Running));
        assert!(!Terminated.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Provisioning));
        assert!(!Running.can_transition_to(Starting));
    }

    #[test]
    fn test_payload_kind_is_fixed_by_tag() {
        let session = SessionId::from_token("abc");
        let payload = BackendPayload::pending(BackendKind::Batch, &session, 3, 12004);
        assert_eq!(payload.kind(), BackendKind::Batch);
        assert_eq!(payload.management_port(), 12004);
    }

    #[tokio::test]
    async fn test_cell_rejects_illegal_transition() {
        let session = SessionId::new();
        let cell = NodeCell::new(Node::new(
            NodeId::new(),
            NodeType::Worker,
            BackendPayload::pending(BackendKind::Local, &session, 0, 12001),
        ));

        assert!(!cell.transition(NodeState::Running).await);
        assert_eq!(cell.state().await, NodeState::Requested);
        assert!(cell.transition(NodeState::Provisioning).await);
    }

    #[tokio::test]
    async fn test_fail_records_error() {
        let id = NodeId::new();
        let session = SessionId::new();
        let cell = NodeCell::new(Node::new(
            id,
            NodeType::Worker,
            BackendPayload::pending(BackendKind::Cloud, &session, 0, 12001),
        ));
        cell.fail(NodeError::new(id, ProvisionError::Aborted("boom".into())))
            .await;

        let descriptor = cell.descriptor().await;
        assert_eq!(descriptor.state, NodeState::Failed);
        assert_eq!(descriptor.error.as_deref(), Some("node task aborted: boom"));
    }

    #[tokio::test]
    async fn test_fail_keeps_first_error() {
        let id = NodeId::new();
        let cell = NodeCell::new(Node::new(
            id,
            NodeType::Worker,
            BackendPayload::pending(BackendKind::Local, &SessionId::new(), 0, 12001),
        ));

        cell.fail(NodeError::new(id, ProvisionError::Aborted("first".into())))
            .await;
        cell.fail(NodeError::new(id, ProvisionError::Aborted("second".into())))
            .await;

        let descriptor = cell.descriptor().await;
        assert_eq!(descriptor.state, NodeState::Failed);
        assert_eq!(descriptor.error.as_deref(), Some("node task aborted: first"));
    }

    #[tokio::test]
    async fn test_descriptor_serializes_state_and_payload() {
        let cell = NodeCell::new(Node::new(
            NodeId::new(),
            NodeType::Worker,
            BackendPayload::pending(BackendKind::Batch, &SessionId::from_token("s"), 2, 12003),
        ));

        let json = serde_json::to_value(cell.descriptor().await).unwrap();

        assert!(json["id"].as_str().unwrap().starts_with("node_"));
        assert!(json["state"].is_string());
        assert!(json["payload"].is_object());
    }
}
