//! Process configuration and the cluster file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::configuration::{BackendConfig, NodeConfiguration};
use crate::credentials::CredentialSource;
use crate::error::ConfigurationError;
use crate::node::NodeType;
use crate::orchestrator::DEFAULT_MAX_PARALLEL_DEPLOYMENTS;
use crate::pipeline::render::LOCAL_MANAGEMENT_PORT_BASE;
use crate::pipeline::{BatchSettings, CloudSettings, LocalSettings};

/// Provisioner process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Cluster file declaring credentials, backends and nodes.
    pub cluster_file: Option<PathBuf>,

    /// Directory for local node installs.
    pub data_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Upper bound on concurrently running deployment pipelines.
    pub max_parallel_deployments: usize,

    /// Driver address for nodes that do not name one.
    pub driver_address: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let cluster_file = std::env::var("GRIDWRIGHT_CLUSTER_FILE").ok().map(PathBuf::from);

        let data_dir = std::env::var("GRIDWRIGHT_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir().join("gridwright"));

        let log_level = std::env::var("GRIDWRIGHT_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let max_parallel_deployments = match std::env::var("GRIDWRIGHT_MAX_PARALLEL_DEPLOYMENTS") {
            Ok(value) => value
                .parse()
                .with_context(|| format!("GRIDWRIGHT_MAX_PARALLEL_DEPLOYMENTS={value} is not a number"))?,
            Err(_) => DEFAULT_MAX_PARALLEL_DEPLOYMENTS,
        };
        anyhow::ensure!(
            max_parallel_deployments > 0,
            "GRIDWRIGHT_MAX_PARALLEL_DEPLOYMENTS must be at least 1"
        );

        let driver_address = std::env::var("GRIDWRIGHT_DRIVER_ADDRESS")
            .ok()
            .filter(|s| !s.trim().is_empty());

        Ok(Self {
            cluster_file,
            data_dir,
            log_level,
            max_parallel_deployments,
            driver_address,
        })
    }
}

// =============================================================================
// Cluster file
// =============================================================================

/// TOML cluster description.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClusterFile {
    /// Overrides `GRIDWRIGHT_DRIVER_ADDRESS`.
    #[serde(default)]
    pub driver_address: Option<String>,

    /// Import key pairs generated by the provider at startup.
    #[serde(default)]
    pub import_generated_credentials: bool,

    #[serde(default)]
    pub credentials: BTreeMap<String, CredentialSource>,

    #[serde(default)]
    pub local: Option<LocalSection>,

    #[serde(default)]
    pub cloud: Option<CloudSection>,

    #[serde(default)]
    pub batch: Option<BatchSection>,

    #[serde(default)]
    pub nodes: Vec<NodeDeclaration>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalSection {
    pub bundle: PathBuf,
    pub driver_bundle: Option<PathBuf>,
    pub scratch_dir: Option<PathBuf>,
    #[serde(default = "default_management_port_base")]
    pub management_port_base: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CloudSection {
    pub bundle: PathBuf,
    pub driver_bundle: Option<PathBuf>,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    #[serde(default = "default_management_port_base")]
    pub management_port: u16,
    #[serde(default = "default_true")]
    pub lazy_compute: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchSection {
    pub head_host: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    pub credentials: String,
    pub bundle: PathBuf,
    pub submit_script: PathBuf,
    #[serde(default = "default_management_port_base")]
    pub management_port_base: u16,
    pub remote_base: Option<String>,
}

/// `count` identical nodes.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeDeclaration {
    #[serde(default = "default_count")]
    pub count: u32,
    #[serde(rename = "type", default = "default_node_type")]
    pub node_type: NodeType,
    #[serde(flatten)]
    pub backend: BackendConfig,
    pub processing_threads: Option<u32>,
    pub jvm_options: Option<String>,
    pub driver_address: Option<String>,
    pub management_host: Option<String>,
    pub management_port: Option<u16>,
    #[serde(default)]
    pub artifacts: Vec<PathBuf>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

fn default_management_port_base() -> u16 {
    LOCAL_MANAGEMENT_PORT_BASE
}

fn default_ssh_port() -> u16 {
    22
}

fn default_true() -> bool {
    true
}

fn default_count() -> u32 {
    1
}

fn default_node_type() -> NodeType {
    NodeType::Worker
}

impl ClusterFile {
    pub async fn load(path: &Path) -> Result<Self, ConfigurationError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigurationError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        Self::parse(&text).map_err(|source| ConfigurationError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn local_settings(&self, data_dir: &Path) -> Option<LocalSettings> {
        self.local.as_ref().map(|s| LocalSettings {
            bundle: s.bundle.clone(),
            driver_bundle: s.driver_bundle.clone(),
            scratch_dir: Some(s.scratch_dir.clone().unwrap_or_else(|| data_dir.join("nodes"))),
            management_port_base: s.management_port_base,
        })
    }

    pub fn cloud_settings(&self) -> Option<CloudSettings> {
        self.cloud.as_ref().map(|s| CloudSettings {
            bundle: s.bundle.clone(),
            driver_bundle: s.driver_bundle.clone(),
            ssh_port: s.ssh_port,
            management_port: s.management_port,
            lazy_compute: s.lazy_compute,
        })
    }

    pub fn batch_settings(&self) -> Option<BatchSettings> {
        self.batch.as_ref().map(|s| {
            let mut settings =
                BatchSettings::new(&s.head_host, &s.credentials, &s.bundle, &s.submit_script);
            settings.ssh_port = s.ssh_port;
            settings.management_port_base = s.management_port_base;
            if let Some(base) = &s.remote_base {
                settings.remote_base = base.clone();
            }
            settings
        })
    }

    /// Build one configuration per declared node, expanding counts.
    pub fn node_configurations(&self) -> Result<Vec<Arc<NodeConfiguration>>, ConfigurationError> {
        let mut configs = Vec::new();
        for declaration in &self.nodes {
            let config = declaration.to_configuration()?;
            configs.extend((0..declaration.count).map(|_| config.clone()));
        }
        Ok(configs)
    }
}

impl NodeDeclaration {
    pub fn to_configuration(&self) -> Result<Arc<NodeConfiguration>, ConfigurationError> {
        let mut builder = NodeConfiguration::builder(self.node_type, self.backend.clone())
            .artifacts(self.artifacts.iter().cloned());
        if let Some(threads) = self.processing_threads {
            builder = builder.processing_threads(threads);
        }
        if let Some(options) = &self.jvm_options {
            builder = builder.jvm_options(options);
        }
        if let Some(address) = &self.driver_address {
            builder = builder.driver_address(address);
        }
        if let Some(host) = &self.management_host {
            builder = builder.management_host(host);
        }
        if let Some(port) = self.management_port {
            builder = builder.management_port(port);
        }
        for (key, value) in &self.properties {
            builder = builder.property(key, value);
        }
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::BackendKind;

    const CLUSTER: &str = r#"
driver_address = "10.0.0.2"

[credentials.ops]
type = "key_pair"
user = "ec2-user"
private_key = "/keys/ops.pem"

[credentials.hpc]
type = "password"
user = "grid"
password = "hunter2"

[local]
bundle = "/bundles/grid-node.tar.gz"

[batch]
head_host = "head.cluster"
credentials = "hpc"
bundle = "/bundles/grid-node.tar.gz"
submit_script = "/bundles/submit.sh"

[[nodes]]
count = 3
backend = "local"
processing_threads = 4

[[nodes]]
backend = "batch"
slots = 8
jvm_options = "-Xmx2g"

[[nodes]]
type = "driver"
backend = "cloud"
profile = "m5.large"
credentials = "ops"
"#;

    #[test]
    fn test_parse_cluster_file() {
        let cluster = ClusterFile::parse(CLUSTER).unwrap();

        assert_eq!(cluster.driver_address.as_deref(), Some("10.0.0.2"));
        assert_eq!(cluster.credentials.len(), 2);
        assert!(cluster.cloud.is_none());

        let batch = cluster.batch_settings().unwrap();
        assert_eq!(batch.ssh_port, 22);
        assert_eq!(batch.remote_base, "grid-node");

        let local = cluster.local_settings(Path::new("/var/lib/gridwright")).unwrap();
        assert_eq!(local.scratch_dir, Some(PathBuf::from("/var/lib/gridwright/nodes")));
    }

    #[test]
    fn test_node_counts_expand() {
        let cluster = ClusterFile::parse(CLUSTER).unwrap();

        let configs = cluster.node_configurations().unwrap();

        assert_eq!(configs.len(), 5);
        assert_eq!(configs[0].processing_threads(), 4);
        assert_eq!(configs[3].backend(), &BackendConfig::Batch { slots: 8 });
        assert_eq!(configs[4].node_type(), NodeType::Driver);
        assert_eq!(configs[4].backend_kind(), BackendKind::Cloud);
    }

    #[test]
    fn test_invalid_declaration_rejected() {
        let cluster = ClusterFile::parse(
            r#"
[[nodes]]
backend = "local"
processing_threads = 0
"#,
        )
        .unwrap();

        assert!(matches!(
            cluster.node_configurations(),
            Err(ConfigurationError::InvalidNode { field: "processing_threads", .. })
        ));
    }
}
