//! gridwright provisioner daemon
//!
//! Loads the cluster file, provisions the nodes it declares, and keeps them
//! running until interrupted. On shutdown every node is stopped, backend
//! scratch space is removed and provider sessions are closed.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use gridwright_provisioner::config::{ClusterFile, Config};
use gridwright_provisioner::context::StaticContextFactory;
use gridwright_provisioner::pipeline::{BatchBackend, CloudBackend, LocalBackend};
use gridwright_provisioner::{CredentialRegistry, Orchestrator};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting gridwright provisioner");
    info!(
        cluster_file = ?config.cluster_file,
        data_dir = %config.data_dir.display(),
        max_parallel_deployments = config.max_parallel_deployments,
        "Configuration loaded"
    );

    let cluster = match &config.cluster_file {
        Some(path) => ClusterFile::load(path)
            .await
            .with_context(|| format!("loading cluster file {}", path.display()))?,
        None => {
            warn!("GRIDWRIGHT_CLUSTER_FILE not set, no nodes will be provisioned");
            ClusterFile::default()
        }
    };
    let nodes = cluster.node_configurations()?;
    let credentials = Arc::new(CredentialRegistry::load(&cluster.credentials).await?);

    // No provider SDK is linked in; cloud nodes run against in-memory instances.
    let factory = Arc::new(StaticContextFactory::new());
    let mut builder = Orchestrator::builder(factory)
        .credentials(credentials)
        .max_parallel_deployments(config.max_parallel_deployments);
    if let Some(address) = cluster.driver_address.clone().or(config.driver_address.clone()) {
        builder = builder.driver_address(address);
    }
    if let Some(settings) = cluster.local_settings(&config.data_dir) {
        builder = builder.backend(Arc::new(LocalBackend::new(settings)));
    }
    if let Some(settings) = cluster.cloud_settings() {
        warn!("Cloud backend uses the in-memory compute provider");
        builder = builder.backend(Arc::new(CloudBackend::new(settings)));
    }
    if let Some(settings) = cluster.batch_settings() {
        builder = builder.backend(Arc::new(BatchBackend::new(settings)));
    }
    let orchestrator = builder.build();

    if cluster.import_generated_credentials {
        match orchestrator.import_generated_credentials().await {
            Ok(added) => info!(added, "Imported generated credentials"),
            Err(e) => warn!(error = %e, "Failed to import generated credentials"),
        }
    }

    let mut handles = Vec::with_capacity(nodes.len());
    for node in nodes {
        match orchestrator.provision(node).await {
            Ok(handle) => handles.push(handle),
            Err(e) => error!(error = %e, "Node request rejected"),
        }
    }
    info!(requested = handles.len(), "Node requests submitted");

    let watcher = tokio::spawn(async move {
        for handle in handles {
            match handle.await {
                Ok(node) => info!(node_id = %node.id, state = %node.state, "Node ready"),
                Err(e) => error!(node_id = %e.node_id, error = %e, "Node failed"),
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Received shutdown signal");
    watcher.abort();

    let report = orchestrator.shutdown().await;
    if !report.is_clean() {
        error!(report = %report, "Shutdown left failed nodes behind");
    }

    info!("Provisioner shutdown complete");
    Ok(())
}
