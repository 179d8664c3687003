//! Batch backend: nodes run as scheduler jobs submitted from a head node.
//!
//! The bundle and the submit script are installed on the head node once per
//! session. Every node then only needs its own config file and a `qsub`.
//! Jobs land on hosts chosen by the scheduler, so node addresses stay unknown.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::render::{self, RenderTarget, LOCAL_MANAGEMENT_PORT_BASE};
use super::{Backend, DeploymentJob, Environment};
use crate::channel::{shell_quote, BatchChannel, ChannelTarget, RemoteChannel};
use crate::configuration::{BackendConfig, NodeConfiguration};
use crate::error::{ConfigurationError, DeploymentStepError, StepFailure};
use crate::ids::SessionId;
use crate::node::{BackendKind, BackendPayload, NodeState, NodeType};

const SUBMIT_SCRIPT: &str = "submit.sh";

/// Settings of the batch backend.
#[derive(Debug, Clone)]
pub struct BatchSettings {
    /// Scheduler head node jobs are submitted from.
    pub head_host: String,
    pub ssh_port: u16,
    /// Name of the credential used to log into the head node.
    pub credentials: String,
    /// Worker bundle, a `.tar.gz` with the start script at its root.
    pub bundle: PathBuf,
    /// Local script printing a job script for `<job name> <config file>`.
    pub submit_script: PathBuf,
    pub management_port_base: u16,
    /// Install directory on the head node, relative to the login home.
    pub remote_base: String,
}

impl BatchSettings {
    pub fn new(
        head_host: impl Into<String>,
        credentials: impl Into<String>,
        bundle: impl Into<PathBuf>,
        submit_script: impl Into<PathBuf>,
    ) -> Self {
        Self {
            head_host: head_host.into(),
            ssh_port: 22,
            credentials: credentials.into(),
            bundle: bundle.into(),
            submit_script: submit_script.into(),
            management_port_base: LOCAL_MANAGEMENT_PORT_BASE,
            remote_base: "grid-node".to_string(),
        }
    }
}

/// Config file name of a batch node.
pub fn config_file_name(session: &SessionId, sequence: u32) -> String {
    format!("grid-node-{session}-{sequence}.properties")
}

/// Scheduler job name of a batch node.
pub fn job_name(session: &SessionId, sequence: u32) -> String {
    format!("GridNode{session}_{sequence}")
}

pub struct BatchBackend {
    settings: BatchSettings,
    next_sequence: AtomicU32,
    /// Set once the bundle is installed on the head node.
    installed: Mutex<bool>,
}

impl BatchBackend {
    pub fn new(settings: BatchSettings) -> Self {
        Self {
            settings,
            next_sequence: AtomicU32::new(0),
            installed: Mutex::new(false),
        }
    }

    async fn open_head(&self, env: &Environment) -> Result<BatchChannel, StepFailure> {
        let credentials = env.credentials.resolve(&self.settings.credentials).await?;
        let target = ChannelTarget::new(&self.settings.head_host, self.settings.ssh_port, credentials);
        let mut channel = BatchChannel::new(env.channels.open(&target));
        channel.connect().await?;
        Ok(channel)
    }

    /// Install the bundle and submit script unless this session already did.
    async fn ensure_installed(&self, channel: &mut BatchChannel) -> Result<(), StepFailure> {
        let mut installed = self.installed.lock().await;
        if *installed {
            return Ok(());
        }
        let base = &self.settings.remote_base;
        let archive = format!("{base}.tar.gz");

        let mut bundle = tokio::fs::File::open(&self.settings.bundle).await?;
        channel.upload(&mut bundle, &archive).await?;
        channel
            .execute(&format!(
                "rm -rf {base} && mkdir -p {base}/config && tar -xzf {archive} -C {base} && rm -f {archive}",
                base = shell_quote(base),
                archive = shell_quote(&archive)
            ))
            .await?;

        let script_path = format!("{base}/{SUBMIT_SCRIPT}");
        let mut script = tokio::fs::File::open(&self.settings.submit_script).await?;
        channel.upload(&mut script, &script_path).await?;
        channel
            .execute(&format!("chmod +x {}", shell_quote(&script_path)))
            .await?;

        *installed = true;
        info!(head = %self.settings.head_host, base = %base, "Installed node bundle on head node");
        Ok(())
    }

    async fn submit_node(
        &self,
        job: &mut DeploymentJob,
        channel: &mut BatchChannel,
    ) -> Result<(), DeploymentStepError> {
        let steps = job.steps.clone();
        steps
            .critical("install-bundle", self.ensure_installed(channel))
            .await?;

        let payload = job.payload().await;
        let session = &job.env.session;
        let config_file = config_file_name(session, payload.sequence());
        let server_port = render::server_port(&job.config);
        job.node
            .update(|node| {
                if let BackendPayload::Batch {
                    config_file: file,
                    server_port: port,
                    ..
                } = &mut node.payload
                {
                    *file = Some(config_file.clone());
                    *port = server_port;
                }
            })
            .await;
        steps.advance(NodeState::Provisioning).await?;

        let driver_address = job.driver_address();
        let cache_dir = render::cache_dir(session, payload.sequence());
        let target = RenderTarget {
            driver_address: &driver_address,
            management_host: job.config.management_host(),
            management_port: payload.management_port(),
            cache_dir: &cache_dir,
        };
        let rendered = steps
            .critical("render-config", async {
                render::render_node_properties(&job.config, &target)
            })
            .await?;
        steps.advance(NodeState::Configuring).await?;

        let text = rendered.render();
        let remote_config = format!("{}/config/{config_file}", self.settings.remote_base);
        steps
            .critical("upload-config", channel.upload(&mut text.as_bytes(), &remote_config))
            .await?;
        steps.advance(NodeState::Starting).await?;

        let slots = match job.config.backend() {
            BackendConfig::Batch { slots } => *slots,
            _ => 1,
        };
        let script = format!("{}/{SUBMIT_SCRIPT}", self.settings.remote_base);
        let name = job_name(session, payload.sequence());
        let job_id = steps
            .critical("submit-job", channel.submit(&script, &name, &config_file, slots))
            .await?;
        job.node
            .update(|node| {
                node.provider_id = Some(job_id.clone());
                if let BackendPayload::Batch { job_id: slot, .. } = &mut node.payload {
                    *slot = Some(job_id.clone());
                }
            })
            .await;
        steps.advance(NodeState::Running).await
    }

    async fn cancel_job(&self, env: &Environment, job_id: &str) -> Result<(), StepFailure> {
        let mut channel = self.open_head(env).await?;
        let result = channel.cancel(job_id).await;
        channel.disconnect().await;
        Ok(result?)
    }
}

#[async_trait]
impl Backend for BatchBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Batch
    }

    async fn validate(
        &self,
        config: &NodeConfiguration,
        env: &Environment,
    ) -> Result<(), ConfigurationError> {
        if config.node_type() == NodeType::Driver {
            return Err(ConfigurationError::invalid(
                "node_type",
                "the batch backend only runs worker nodes",
            ));
        }
        if !matches!(config.backend(), BackendConfig::Batch { .. }) {
            return Err(ConfigurationError::invalid("backend", "expected a batch configuration"));
        }
        env.credentials.resolve(&self.settings.credentials).await?;
        Ok(())
    }

    fn reserve(&self, config: &NodeConfiguration, session: &SessionId) -> BackendPayload {
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let port = config.management_port().unwrap_or_else(|| {
            let offset = u16::try_from(sequence).unwrap_or(u16::MAX);
            self.settings.management_port_base.saturating_add(offset)
        });
        BackendPayload::pending(BackendKind::Batch, session, sequence, port)
    }

    async fn deploy(&self, job: &mut DeploymentJob) -> Result<(), DeploymentStepError> {
        let steps = job.steps.clone();
        let mut channel = steps.critical("connect", self.open_head(&job.env)).await?;
        let result = self.submit_node(job, &mut channel).await;
        channel.disconnect().await;
        result
    }

    async fn abandon(&self, job: &mut DeploymentJob) {
        let job_id = job.node.read(|n| n.provider_id.clone()).await;
        if let Some(job_id) = job_id {
            if let Err(e) = self.cancel_job(&job.env, &job_id).await {
                warn!(node_id = %job.node_id, %job_id, error = %e, "Failed to cancel abandoned job");
            }
        }
    }

    async fn stop(&self, job: &mut DeploymentJob) -> Result<(), DeploymentStepError> {
        let steps = job.steps.clone();
        let job_id = job.node.read(|n| n.provider_id.clone()).await;
        let job_id = steps
            .critical("locate-job", async {
                job_id.ok_or_else(|| StepFailure::Invalid("node has no scheduler job".to_string()))
            })
            .await?;
        steps
            .critical("cancel-job", self.cancel_job(&job.env, &job_id))
            .await?;
        info!(node_id = %job.node_id, %job_id, "Batch job cancelled");
        Ok(())
    }
}
