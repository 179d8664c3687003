//! Error taxonomy of the provisioner.
//!
//! Each layer has its own enum. Errors stay local to a node: the lifecycle
//! controller records them on the node as a [`NodeError`] and never lets them
//! reach sibling deployments.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use gridwright_properties::PropertiesError;
use thiserror::Error;

use crate::context::ContextKind;
use crate::ids::NodeId;
use crate::node::{BackendKind, NodeState};

/// Invalid or unreadable configuration. Raised before any remote action.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("credential '{name}': {field} at {} cannot be read: {source}", .path.display())]
    KeyUnreadable {
        name: String,
        field: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("credential '{0}' is already registered")]
    DuplicateCredential(String),

    #[error("credential '{0}' not found")]
    CredentialNotFound(String),

    #[error("credential '{name}' cannot be used here: {reason}")]
    UnusableCredential { name: String, reason: String },

    #[error("credential provider failed to {operation}: {source}")]
    Provider {
        operation: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("invalid node configuration: {field}: {reason}")]
    InvalidNode { field: &'static str, reason: String },

    #[error("no backend registered for {0}")]
    BackendUnavailable(BackendKind),

    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid setting {key}: {reason}")]
    Setting { key: String, reason: String },
}

impl ConfigurationError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidNode {
            field,
            reason: reason.into(),
        }
    }
}

/// A shared provider context could not be produced.
///
/// Clonable so a single failed construction can be handed to every waiter.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContextError {
    #[error("failed to build {kind} context: {message}")]
    Build { kind: ContextKind, message: String },

    #[error("{kind} context build task aborted: {message}")]
    Aborted { kind: ContextKind, message: String },

    #[error("context manager is closed")]
    Closed,
}

/// Failure talking to a remote target.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("cannot connect to {target}: {message}")]
    Connect { target: String, message: String },

    #[error("not connected to {target}")]
    NotConnected { target: String },

    #[error("command `{command}` on {target} exited with {}: {stderr}", .status.map_or("signal".to_string(), |s| s.to_string()))]
    CommandFailed {
        target: String,
        command: String,
        status: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("command `{command}` on {target} printed nothing")]
    EmptyResponse { target: String, command: String },

    #[error("upload to {target}:{path} failed: {message}")]
    Upload {
        target: String,
        path: String,
        message: String,
    },

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// What went wrong inside a deployment step.
#[derive(Debug, Error)]
pub enum StepFailure {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Properties(#[from] PropertiesError),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Provider(#[from] anyhow::Error),

    #[error("{0}")]
    Invalid(String),
}

/// A critical pipeline step failed, or the pipeline was cancelled.
#[derive(Debug, Error)]
pub enum DeploymentStepError {
    #[error("step '{step}' failed: {source}")]
    Failed {
        step: &'static str,
        #[source]
        source: StepFailure,
    },

    #[error("deployment cancelled before step '{step}'")]
    Cancelled { step: &'static str },
}

impl DeploymentStepError {
    pub fn step(&self) -> &'static str {
        match self {
            Self::Failed { step, .. } | Self::Cancelled { step } => step,
        }
    }
}

/// Everything that can end a node's lifecycle in `FAILED`.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("context error: {0}")]
    Context(#[from] ContextError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Step(#[from] DeploymentStepError),

    #[error("cannot {operation} a node in state {state}")]
    InvalidState {
        operation: &'static str,
        state: NodeState,
    },

    #[error("management request failed: {0}")]
    Management(#[source] anyhow::Error),

    #[error("node task aborted: {0}")]
    Aborted(String),
}

/// Terminal failure of one node, shareable between every party waiting on it.
#[derive(Debug, Clone, Error)]
#[error("node {node_id}: {source}")]
pub struct NodeError {
    pub node_id: NodeId,
    #[source]
    pub source: Arc<ProvisionError>,
}

impl NodeError {
    pub fn new(node_id: NodeId, error: impl Into<ProvisionError>) -> Self {
        Self {
            node_id,
            source: Arc::new(error.into()),
        }
    }

    /// Name of the failed pipeline step, if the failure came from one.
    pub fn failed_step(&self) -> Option<&'static str> {
        match self.source.as_ref() {
            ProvisionError::Step(e) => Some(e.step()),
            _ => None,
        }
    }
}

/// Node registry operations that were rejected or failed.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("node {0} is already tracked")]
    Conflict(NodeId),

    #[error("node {0} is not tracked")]
    NotFound(NodeId),

    #[error("node registry is shutting down")]
    Closed,

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Node(#[from] NodeError),
}

/// Outcome of shutting down every tracked node.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    pub terminated: Vec<NodeId>,
    pub failures: Vec<NodeError>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

impl std::fmt::Display for ShutdownReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} nodes terminated, {} failed",
            self.terminated.len(),
            self.failures.len()
        )?;
        for failure in &self.failures {
            write!(f, "\n  {failure}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_error_reports_step() {
        let id = NodeId::new();
        let err = NodeError::new(
            id,
            DeploymentStepError::Failed {
                step: "upload-bundle",
                source: StepFailure::Invalid("disk full".into()),
            },
        );
        assert_eq!(err.failed_step(), Some("upload-bundle"));
        assert!(err.to_string().contains("upload-bundle"));
        assert!(err.to_string().contains(&id.to_string()));
    }

    #[test]
    fn test_command_failed_display() {
        let err = TransportError::CommandFailed {
            target: "ec2-user@10.0.0.1".into(),
            command: "unzip x".into(),
            status: Some(9),
            stdout: String::new(),
            stderr: "boom".into(),
        };
        assert_eq!(
            err.to_string(),
            "command `unzip x` on ec2-user@10.0.0.1 exited with 9: boom"
        );
    }

    #[test]
    fn test_shutdown_report_display() {
        let report = ShutdownReport {
            terminated: vec![NodeId::new(), NodeId::new()],
            failures: vec![NodeError::new(
                NodeId::new(),
                ProvisionError::Aborted("panic".into()),
            )],
        };
        assert!(!report.is_clean());
        assert!(report.to_string().starts_with("2 nodes terminated, 1 failed"));
    }
}
