//! End-to-end test of the local backend with a real bundle and process.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;
use gridwright_properties::{keys, Properties};
use gridwright_provisioner::context::StaticContextFactory;
use gridwright_provisioner::node::BackendPayload;
use gridwright_provisioner::pipeline::{LocalBackend, LocalSettings};
use gridwright_provisioner::{BackendConfig, NodeConfiguration, NodeState, NodeType, Orchestrator};

const START_SCRIPT: &str = "#!/bin/sh\necho \"$@\" > started.txt\nexec sleep 30\n";
const SHORT_LIVED_SCRIPT: &str = "#!/bin/sh\necho \"$@\" > started.txt\nexit 0\n";

fn write_bundle(path: &Path) {
    write_bundle_with(path, START_SCRIPT);
}

fn write_bundle_with(path: &Path, start_script: &str) {
    let file = std::fs::File::create(path).unwrap();
    let mut archive = tar::Builder::new(GzEncoder::new(file, Compression::default()));

    let mut header = tar::Header::new_gnu();
    header.set_size(start_script.len() as u64);
    header.set_mode(0o755);
    header.set_cksum();
    archive
        .append_data(&mut header, "startNode.sh", start_script.as_bytes())
        .unwrap();

    archive.into_inner().unwrap().finish().unwrap();
}

async fn wait_for_file(path: &Path) -> String {
    for _ in 0..50 {
        if let Ok(text) = tokio::fs::read_to_string(path).await {
            if !text.is_empty() {
                return text;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("{} never appeared", path.display());
}

#[tokio::test]
async fn test_local_node_lifecycle() {
    let workspace = tempfile::tempdir().unwrap();
    let bundle = workspace.path().join("grid-node.tar.gz");
    write_bundle(&bundle);
    let artifact = workspace.path().join("job.jar");
    std::fs::write(&artifact, b"jar").unwrap();

    let mut settings = LocalSettings::new(&bundle);
    settings.scratch_dir = Some(workspace.path().join("nodes"));
    let orchestrator = Orchestrator::builder(Arc::new(StaticContextFactory::new()))
        .backend(Arc::new(LocalBackend::new(settings)))
        .build();

    let config = NodeConfiguration::builder(NodeType::Worker, BackendConfig::Local)
        .processing_threads(4)
        .jvm_options("-Xmx64m")
        .artifact(&artifact)
        .artifact(workspace.path().join("missing.jar"))
        .build()
        .unwrap();

    let node = orchestrator
        .provision(config)
        .await
        .unwrap()
        .await
        .unwrap();
    assert_eq!(node.state, NodeState::Running);
    assert!(node.private_addresses.contains("127.0.0.1"));

    let install_dir: PathBuf = match &node.payload {
        BackendPayload::Local {
            install_dir: Some(dir),
            pid: Some(_),
            management_port,
            ..
        } => {
            assert_eq!(*management_port, 12001);
            dir.clone()
        }
        other => panic!("unexpected payload {other:?}"),
    };

    let config_text = std::fs::read_to_string(install_dir.join("config/grid-node.properties")).unwrap();
    let props = Properties::parse(&config_text).unwrap();
    assert_eq!(props.get(keys::PROCESSING_THREADS), Some("4"));
    assert_eq!(props.get(keys::SERVER_HOST), Some("localhost"));
    assert_eq!(props.get(keys::MANAGEMENT_HOST), Some("localhost"));
    assert!(install_dir.join("lib/job.jar").exists());

    let started = wait_for_file(&install_dir.join("started.txt")).await;
    assert_eq!(started.trim(), "grid-node.properties false false -Xmx64m");

    let stopped = orchestrator.terminate(node.id).await.unwrap();
    assert_eq!(stopped.state, NodeState::Terminated);

    let report = orchestrator.shutdown().await;
    assert!(report.is_clean());
    assert!(!install_dir.exists());
}

#[tokio::test]
async fn test_missing_bundle_is_rejected() {
    let workspace = tempfile::tempdir().unwrap();
    let orchestrator = Orchestrator::builder(Arc::new(StaticContextFactory::new()))
        .backend(Arc::new(LocalBackend::new(LocalSettings::new(
            workspace.path().join("absent.tar.gz"),
        ))))
        .build();
    let config = NodeConfiguration::builder(NodeType::Worker, BackendConfig::Local)
        .build()
        .unwrap();

    assert!(orchestrator.provision(config).await.is_err());
    assert!(orchestrator.nodes_snapshot().await.is_empty());
}

#[tokio::test]
async fn test_node_that_already_exited_still_terminates() {
    let workspace = tempfile::tempdir().unwrap();
    let bundle = workspace.path().join("grid-node.tar.gz");
    write_bundle_with(&bundle, SHORT_LIVED_SCRIPT);

    let mut settings = LocalSettings::new(&bundle);
    settings.scratch_dir = Some(workspace.path().join("nodes"));
    let orchestrator = Orchestrator::builder(Arc::new(StaticContextFactory::new()))
        .backend(Arc::new(LocalBackend::new(settings)))
        .build();
    let config = NodeConfiguration::builder(NodeType::Worker, BackendConfig::Local)
        .build()
        .unwrap();

    let node = orchestrator
        .provision(config)
        .await
        .unwrap()
        .await
        .unwrap();
    let install_dir = match &node.payload {
        BackendPayload::Local {
            install_dir: Some(dir),
            ..
        } => dir.clone(),
        other => panic!("unexpected payload {other:?}"),
    };
    wait_for_file(&install_dir.join("started.txt")).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let stopped = orchestrator.terminate(node.id).await.unwrap();

    assert_eq!(stopped.state, NodeState::Terminated);
    assert!(orchestrator.nodes_snapshot().await.is_empty());
    assert!(orchestrator.shutdown().await.is_clean());
}
