//! Immutable per-node configuration.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;
use crate::node::{BackendKind, NodeType};

/// Backend-specific part of a node request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum BackendConfig {
    Local,
    Cloud {
        /// Provider profile to launch the instance from.
        profile: String,
        /// Name of the registered credential used to log on.
        credentials: String,
    },
    Batch {
        /// Scheduler slots requested for the job.
        slots: u32,
    },
}

impl BackendConfig {
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Local => BackendKind::Local,
            Self::Cloud { .. } => BackendKind::Cloud,
            Self::Batch { .. } => BackendKind::Batch,
        }
    }
}

/// What to provision. Built once through [`NodeConfigurationBuilder`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeConfiguration {
    node_type: NodeType,
    driver_address: Option<String>,
    processing_threads: u32,
    jvm_options: Option<String>,
    management_host: Option<String>,
    management_port: Option<u16>,
    artifacts: Vec<PathBuf>,
    properties: BTreeMap<String, String>,
    backend: BackendConfig,
}

impl NodeConfiguration {
    pub fn builder(node_type: NodeType, backend: BackendConfig) -> NodeConfigurationBuilder {
        NodeConfigurationBuilder {
            config: NodeConfiguration {
                node_type,
                driver_address: None,
                processing_threads: 1,
                jvm_options: None,
                management_host: None,
                management_port: None,
                artifacts: Vec::new(),
                properties: BTreeMap::new(),
                backend,
            },
        }
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    /// Address of the driver to join. Unset means "resolve at deploy time".
    pub fn driver_address(&self) -> Option<&str> {
        self.driver_address.as_deref()
    }

    pub fn processing_threads(&self) -> u32 {
        self.processing_threads
    }

    pub fn jvm_options(&self) -> Option<&str> {
        self.jvm_options.as_deref()
    }

    pub fn management_host(&self) -> Option<&str> {
        self.management_host.as_deref()
    }

    /// Explicit management port. Unset lets the backend allocate one.
    pub fn management_port(&self) -> Option<u16> {
        self.management_port
    }

    /// Files copied into the node's `lib/` before start.
    pub fn artifacts(&self) -> &[PathBuf] {
        &self.artifacts
    }

    /// Extra properties written verbatim after the computed ones.
    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn backend(&self) -> &BackendConfig {
        &self.backend
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }
}

/// Validating builder for [`NodeConfiguration`].
#[derive(Debug, Clone)]
pub struct NodeConfigurationBuilder {
    config: NodeConfiguration,
}

impl NodeConfigurationBuilder {
    pub fn driver_address(mut self, address: impl Into<String>) -> Self {
        self.config.driver_address = Some(address.into());
        self
    }

    pub fn processing_threads(mut self, threads: u32) -> Self {
        self.config.processing_threads = threads;
        self
    }

    pub fn jvm_options(mut self, options: impl Into<String>) -> Self {
        self.config.jvm_options = Some(options.into());
        self
    }

    pub fn management_host(mut self, host: impl Into<String>) -> Self {
        self.config.management_host = Some(host.into());
        self
    }

    pub fn management_port(mut self, port: u16) -> Self {
        self.config.management_port = Some(port);
        self
    }

    pub fn artifact(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.artifacts.push(path.into());
        self
    }

    pub fn artifacts<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.config.artifacts.extend(paths.into_iter().map(Into::into));
        self
    }

    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.properties.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> Result<Arc<NodeConfiguration>, ConfigurationError> {
        let mut config = self.config;

        if config.processing_threads == 0 {
            return Err(ConfigurationError::invalid(
                "processing_threads",
                "must be at least 1",
            ));
        }

        config.driver_address = non_blank(config.driver_address);
        config.management_host = non_blank(config.management_host);
        config.jvm_options = non_blank(config.jvm_options);

        if config.management_port == Some(0) {
            return Err(ConfigurationError::invalid("management_port", "must not be 0"));
        }

        for key in config.properties.keys() {
            gridwright_properties::validate_key(key)
                .map_err(|e| ConfigurationError::invalid("properties", e.to_string()))?;
        }

        match &config.backend {
            BackendConfig::Local => {}
            BackendConfig::Cloud {
                profile,
                credentials,
            } => {
                if profile.trim().is_empty() {
                    return Err(ConfigurationError::invalid("profile", "must not be empty"));
                }
                if credentials.trim().is_empty() {
                    return Err(ConfigurationError::invalid(
                        "credentials",
                        "must name a registered credential",
                    ));
                }
            }
            BackendConfig::Batch { slots } => {
                if *slots == 0 {
                    return Err(ConfigurationError::invalid("slots", "must be at least 1"));
                }
            }
        }

        Ok(Arc::new(config))
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
