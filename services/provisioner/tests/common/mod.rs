//! Shared fixtures for provisioner integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use gridwright_provisioner::channel::MockChannelFactory;
use gridwright_provisioner::context::StaticContextFactory;
use gridwright_provisioner::management::ManagementClient;
use gridwright_provisioner::pipeline::{CloudBackend, CloudSettings};
use gridwright_provisioner::{
    BackendConfig, CredentialRegistry, Credentials, NodeConfiguration, NodeType, Orchestrator,
    SessionId,
};
use tempfile::NamedTempFile;

/// Everything a cloud test needs to look at after the fact.
pub struct CloudFixture {
    pub orchestrator: Orchestrator,
    pub factory: Arc<StaticContextFactory>,
    pub channels: MockChannelFactory,
    pub bundle: NamedTempFile,
}

pub struct CloudOptions {
    pub session: SessionId,
    pub channels: MockChannelFactory,
    pub factory: StaticContextFactory,
    pub management: Option<Arc<dyn ManagementClient>>,
    pub max_parallel_deployments: usize,
}

impl Default for CloudOptions {
    fn default() -> Self {
        Self {
            session: SessionId::new(),
            channels: MockChannelFactory::new(),
            factory: StaticContextFactory::new(),
            management: None,
            max_parallel_deployments: 16,
        }
    }
}

pub fn bundle_file() -> NamedTempFile {
    let file = tempfile::Builder::new()
        .suffix(".tar.gz")
        .tempfile()
        .unwrap();
    std::fs::write(file.path(), b"bundle-bytes").unwrap();
    file
}

pub async fn cloud_fixture(options: CloudOptions) -> CloudFixture {
    let bundle = bundle_file();
    let credentials = Arc::new(CredentialRegistry::new());
    credentials
        .register("ops", Credentials::password("ec2-user", "s3cret"))
        .await
        .unwrap();

    let factory = Arc::new(options.factory);
    let mut builder = Orchestrator::builder(factory.clone())
        .session(options.session)
        .credentials(credentials)
        .channels(Arc::new(options.channels.clone()))
        .driver_address("10.0.0.250")
        .max_parallel_deployments(options.max_parallel_deployments)
        .backend(Arc::new(CloudBackend::new(CloudSettings::new(bundle.path()))));
    if let Some(management) = options.management {
        builder = builder.management(management);
    }

    CloudFixture {
        orchestrator: builder.build(),
        factory,
        channels: options.channels,
        bundle,
    }
}

pub fn cloud_worker() -> Arc<NodeConfiguration> {
    cloud_worker_with_threads(1)
}

pub fn cloud_worker_with_threads(threads: u32) -> Arc<NodeConfiguration> {
    NodeConfiguration::builder(
        NodeType::Worker,
        BackendConfig::Cloud {
            profile: "m5.large".into(),
            credentials: "ops".into(),
        },
    )
    .processing_threads(threads)
    .build()
    .unwrap()
}

pub fn slow_factory() -> StaticContextFactory {
    StaticContextFactory::new().with_build_delay(Duration::from_millis(200))
}
