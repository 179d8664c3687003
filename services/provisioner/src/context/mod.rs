//! Shared provider contexts.
//!
//! A resource context is an expensive, process-wide handle onto an external
//! provider: a compute-provider session or a credential-store session. The
//! [`ContextManager`] builds each kind at most once and hands out clones.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::credentials::Credentials;
use crate::error::ContextError;

pub mod manager;
pub mod mock;

pub use manager::ContextManager;
pub use mock::{InMemoryCompute, InMemoryCredentialStore, StaticContextFactory};

/// Kind of shared context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextKind {
    /// Compute session with image queries enabled.
    Compute,
    /// Compute session with image queries disabled. Starts faster.
    LazyCompute,
    /// Session onto the store holding provider-generated key pairs.
    CredentialStore,
}

impl ContextKind {
    /// Teardown order: compute sessions before the store they depend on.
    pub const TEARDOWN_ORDER: [ContextKind; 3] = [
        ContextKind::Compute,
        ContextKind::LazyCompute,
        ContextKind::CredentialStore,
    ];

    pub fn is_compute(&self) -> bool {
        matches!(self, Self::Compute | Self::LazyCompute)
    }
}

impl fmt::Display for ContextKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compute => f.write_str("compute"),
            Self::LazyCompute => f.write_str("lazy-compute"),
            Self::CredentialStore => f.write_str("credential-store"),
        }
    }
}

// =============================================================================
// Provider interfaces
// =============================================================================

/// Request for a new compute instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSpec {
    /// Provider profile (instance type, image, region) to launch from.
    pub profile: String,
    /// Name of the key pair the instance should trust.
    pub key_name: String,
    /// Login user of the instance.
    pub user: String,
}

/// A compute instance as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub id: String,
    pub profile: String,
    pub addresses: InstanceAddresses,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceAddresses {
    pub public: BTreeSet<String>,
    pub private: BTreeSet<String>,
}

/// A script run on an instance by the provider's own execution facility.
#[derive(Debug, Clone)]
pub struct RemoteScript {
    pub task_name: String,
    pub body: String,
    pub credentials: Credentials,
    /// Wait for the script to exit. False detaches it.
    pub block_on_complete: bool,
}

/// A key pair minted by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedKey {
    pub name: String,
    pub user: String,
    pub private_key: String,
}

/// Compute provider session.
#[async_trait]
pub trait ComputeProvider: Send + Sync {
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<Instance>;

    async fn list_instances(&self) -> Result<Vec<Instance>>;

    async fn terminate_instance(&self, instance_id: &str) -> Result<()>;

    async fn instance_addresses(&self, instance_id: &str) -> Result<InstanceAddresses>;

    async fn run_script(&self, instance_id: &str, script: &RemoteScript) -> Result<()>;

    async fn create_key_pair(&self, name: &str) -> Result<GeneratedKey>;

    /// Release the session.
    async fn close(&self) -> Result<()>;
}

/// Credential-store session.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Key pairs the provider generated and kept.
    async fn generated_key_pairs(&self) -> Result<Vec<GeneratedKey>>;

    async fn close(&self) -> Result<()>;
}

/// Options for building a compute session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComputeOptions {
    pub query_images: bool,
}

/// Builds provider sessions for the [`ContextManager`].
#[async_trait]
pub trait ContextFactory: Send + Sync {
    async fn build_credential_store(&self) -> Result<Arc<dyn CredentialStore>>;

    async fn build_compute(
        &self,
        options: ComputeOptions,
        credential_store: Arc<dyn CredentialStore>,
    ) -> Result<Arc<dyn ComputeProvider>>;
}

// =============================================================================
// Contexts
// =============================================================================

/// Typed provider handle.
#[derive(Clone)]
pub enum ProviderHandle {
    Compute(Arc<dyn ComputeProvider>),
    CredentialStore(Arc<dyn CredentialStore>),
}

impl fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compute(_) => f.write_str("ProviderHandle::Compute"),
            Self::CredentialStore(_) => f.write_str("ProviderHandle::CredentialStore"),
        }
    }
}

/// A built, shareable context. Clones share the same provider session.
#[derive(Debug, Clone)]
pub struct ResourceContext {
    kind: ContextKind,
    handle: ProviderHandle,
}

impl ResourceContext {
    pub fn new(kind: ContextKind, handle: ProviderHandle) -> Self {
        Self { kind, handle }
    }

    pub fn kind(&self) -> ContextKind {
        self.kind
    }

    pub fn handle(&self) -> &ProviderHandle {
        &self.handle
    }

    pub fn compute(&self) -> Result<Arc<dyn ComputeProvider>, ContextError> {
        match &self.handle {
            ProviderHandle::Compute(provider) => Ok(provider.clone()),
            ProviderHandle::CredentialStore(_) => Err(ContextError::Build {
                kind: self.kind,
                message: "context does not hold a compute provider".to_string(),
            }),
        }
    }

    pub fn credential_store(&self) -> Result<Arc<dyn CredentialStore>, ContextError> {
        match &self.handle {
            ProviderHandle::CredentialStore(store) => Ok(store.clone()),
            ProviderHandle::Compute(_) => Err(ContextError::Build {
                kind: self.kind,
                message: "context does not hold a credential store".to_string(),
            }),
        }
    }

    /// Whether two contexts share the same provider session.
    pub fn same_session(&self, other: &ResourceContext) -> bool {
        match (&self.handle, &other.handle) {
            (ProviderHandle::Compute(a), ProviderHandle::Compute(b)) => Arc::ptr_eq(a, b),
            (ProviderHandle::CredentialStore(a), ProviderHandle::CredentialStore(b)) => {
                Arc::ptr_eq(a, b)
            }
            _ => false,
        }
    }

    pub(crate) async fn teardown(&self) -> Result<()> {
        match &self.handle {
            ProviderHandle::Compute(provider) => provider.close().await,
            ProviderHandle::CredentialStore(store) => store.close().await,
        }
    }
}
