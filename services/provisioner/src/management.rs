//! Management connection to running grid nodes.
//!
//! Nodes expose a management endpoint (host and port rendered into their
//! configuration). The provisioner uses it to ask a node to shut down before
//! the backend removes the process, instance or job underneath it.

use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::lock;

/// Where a node's management endpoint listens.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ManagementEndpoint {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for ManagementEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[async_trait]
pub trait ManagementClient: Send + Sync {
    /// UUID the grid runtime assigned to the node.
    async fn node_uuid(&self, endpoint: &ManagementEndpoint) -> Result<String>;

    /// Ask the node to finish its work within `grace`, and to exit
    /// unconditionally once `force_after` has elapsed.
    async fn shutdown(
        &self,
        endpoint: &ManagementEndpoint,
        grace: Duration,
        force_after: Duration,
    ) -> Result<()>;
}

/// Grace periods used when stopping a node through its management endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownPolicy {
    pub grace: Duration,
    pub force_after: Duration,
}

impl Default for ShutdownPolicy {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(10),
            force_after: Duration::from_secs(30),
        }
    }
}

/// Management client that records calls and can refuse some of them.
#[derive(Debug, Default)]
pub struct RecordingManagement {
    shutdowns: Mutex<Vec<ManagementEndpoint>>,
    refuse: Mutex<Vec<u16>>,
}

impl RecordingManagement {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail shutdown requests to endpoints on `port`.
    pub fn refuse_port(&self, port: u16) {
        lock(&self.refuse).push(port);
    }

    pub fn shutdowns(&self) -> Vec<ManagementEndpoint> {
        lock(&self.shutdowns).clone()
    }
}

#[async_trait]
impl ManagementClient for RecordingManagement {
    async fn node_uuid(&self, endpoint: &ManagementEndpoint) -> Result<String> {
        Ok(format!("uuid-{}-{}", endpoint.host, endpoint.port))
    }

    async fn shutdown(
        &self,
        endpoint: &ManagementEndpoint,
        _grace: Duration,
        _force_after: Duration,
    ) -> Result<()> {
        if lock(&self.refuse).contains(&endpoint.port) {
            bail!("management endpoint {endpoint} refused shutdown");
        }
        lock(&self.shutdowns).push(endpoint.clone());
        Ok(())
    }
}
