//! gridwright provisioner
//!
//! Provisions grid runtime nodes on three backends and manages their
//! lifecycle.
//!
//! ## Architecture
//!
//! - **Context Manager**: builds expensive provider sessions once per kind
//! - **Credential Registry**: named identities used to log onto hosts
//! - **Channels**: connect, execute, upload and disconnect per transport
//! - **Pipelines**: ordered deployment steps per backend (local, cloud, batch)
//! - **Lifecycle Controller**: moves one node through its state machine
//! - **Node Registry**: concurrent collection of live nodes
//! - **Orchestrator**: owns all of the above for one session

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod channel;
pub mod config;
pub mod configuration;
pub mod context;
pub mod credentials;
pub mod error;
pub mod ids;
pub mod lifecycle;
pub mod management;
pub mod node;
pub mod orchestrator;
pub mod pipeline;
pub mod registry;

pub use configuration::{BackendConfig, NodeConfiguration, NodeConfigurationBuilder};
pub use context::{ContextKind, ContextManager, ResourceContext};
pub use credentials::{CredentialRegistry, Credentials};
pub use error::{
    ConfigurationError, ContextError, DeploymentStepError, NodeError, ProvisionError,
    RegistryError, ShutdownReport, TransportError,
};
pub use ids::{NodeId, SessionId};
pub use lifecycle::LifecycleController;
pub use node::{BackendKind, NodeDescriptor, NodeState, NodeType};
pub use orchestrator::{Orchestrator, OrchestratorBuilder};
pub use registry::{NodeHandle, NodeRegistry};

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
