//! Cloud backend: one compute instance per node, configured over SSH.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::render::{self, BundleLayout, RenderTarget, DRIVER_MANAGEMENT_PORT};
use super::{Backend, DeploymentJob, Environment};
use crate::channel::{shell_quote, ChannelTarget};
use crate::configuration::{BackendConfig, NodeConfiguration};
use crate::context::{ComputeProvider, ContextKind, InstanceSpec, RemoteScript};
use crate::credentials::Credentials;
use crate::error::{ConfigurationError, DeploymentStepError, StepFailure};
use crate::ids::SessionId;
use crate::node::{BackendKind, BackendPayload, NodeState, NodeType};

const PID_FILE: &str = "node.pid";
const START_TASK: &str = "grid-node-start";

/// Settings of the cloud backend.
#[derive(Debug, Clone)]
pub struct CloudSettings {
    pub bundle: PathBuf,
    pub driver_bundle: Option<PathBuf>,
    pub ssh_port: u16,
    /// Management port of worker nodes. Each node has its own host.
    pub management_port: u16,
    /// Build compute sessions with image queries disabled.
    pub lazy_compute: bool,
}

impl CloudSettings {
    pub fn new(bundle: impl Into<PathBuf>) -> Self {
        Self {
            bundle: bundle.into(),
            driver_bundle: None,
            ssh_port: 22,
            management_port: render::LOCAL_MANAGEMENT_PORT_BASE,
            lazy_compute: true,
        }
    }

    fn bundle_for(&self, node_type: NodeType) -> Option<&Path> {
        match node_type {
            NodeType::Worker => Some(&self.bundle),
            NodeType::Driver => self.driver_bundle.as_deref(),
        }
    }
}

/// Install directory of a node, relative to the login user's home.
///
/// Includes the session so that runs sharing an image never collide.
pub fn install_dir(layout: &BundleLayout, session: &SessionId, sequence: u32) -> String {
    format!("{}-{session}-{sequence}", layout.base_name)
}

pub struct CloudBackend {
    settings: CloudSettings,
    next_sequence: AtomicU32,
}

impl CloudBackend {
    pub fn new(settings: CloudSettings) -> Self {
        Self {
            settings,
            next_sequence: AtomicU32::new(0),
        }
    }

    fn context_kind(&self) -> ContextKind {
        if self.settings.lazy_compute {
            ContextKind::LazyCompute
        } else {
            ContextKind::Compute
        }
    }

    async fn compute(&self, env: &Environment) -> Result<Arc<dyn ComputeProvider>, StepFailure> {
        Ok(env.contexts.get_context(self.context_kind()).await?.compute()?)
    }

    async fn login(
        &self,
        config: &NodeConfiguration,
        env: &Environment,
    ) -> Result<(String, Credentials), StepFailure> {
        match config.backend() {
            BackendConfig::Cloud { credentials, .. } => {
                Ok((credentials.clone(), env.credentials.resolve(credentials).await?))
            }
            other => Err(StepFailure::Invalid(format!(
                "cloud backend cannot deploy {:?}",
                other.kind()
            ))),
        }
    }

    async fn install_and_start(
        &self,
        job: &mut DeploymentJob,
        compute: &Arc<dyn ComputeProvider>,
        instance_id: &str,
        credentials: &Credentials,
    ) -> Result<(), DeploymentStepError> {
        let steps = job.steps.clone();
        let layout = BundleLayout::for_type(job.config.node_type());
        let payload = job.payload().await;
        let dir = install_dir(&layout, &job.env.session, payload.sequence());
        let archive = format!("{dir}.tar.gz");

        steps
            .optional("remove-stale-install", job.exec(&format!("rm -rf {}", shell_quote(&dir))))
            .await?;

        let bundle = self
            .settings
            .bundle_for(job.config.node_type())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.settings.bundle.clone());
        let mut file = steps
            .critical("open-bundle", async { tokio::fs::File::open(&bundle).await })
            .await?;
        steps
            .critical("upload-bundle", job.upload(&mut file, &archive))
            .await?;
        steps
            .critical(
                "unpack-bundle",
                job.exec(&format!(
                    "mkdir -p {dir} && tar -xzf {archive} -C {dir} && rm -f {archive}",
                    dir = shell_quote(&dir),
                    archive = shell_quote(&archive)
                )),
            )
            .await?;
        steps
            .critical(
                "chmod-start-script",
                job.exec(&format!("chmod +x {}", shell_quote(&format!("{dir}/{}", layout.start_script)))),
            )
            .await?;
        job.node
            .update(|node| {
                if let BackendPayload::Cloud { install_dir: slot, .. } = &mut node.payload {
                    *slot = Some(dir.clone());
                }
            })
            .await;

        let (driver_address, management_host) = {
            let host = job.node.read(|n| n.reachable_address().map(str::to_string)).await;
            (job.driver_address(), job.config.management_host().map(str::to_string).or(host))
        };
        let cache_dir = render::cache_dir(&job.env.session, payload.sequence());
        let target = RenderTarget {
            driver_address: &driver_address,
            management_host: management_host.as_deref(),
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
        steps
            .critical(
                "upload-config",
                job.upload(&mut text.as_bytes(), &format!("{dir}/{}", layout.config_path())),
            )
            .await?;
        steps.advance(NodeState::Starting).await?;

        let script = RemoteScript {
            task_name: START_TASK.to_string(),
            body: start_script(&dir, &layout, job.config.jvm_options()),
            credentials: credentials.clone(),
            block_on_complete: false,
        };
        steps
            .critical("start-node", compute.run_script(instance_id, &script))
            .await?;
        steps
            .critical("disconnect", async {
                job.release_channel().await;
                Ok::<_, StepFailure>(())
            })
            .await?;
        steps.advance(NodeState::Running).await
    }
}

/// Shell script that starts the node detached and records its pid.
fn start_script(dir: &str, layout: &BundleLayout, jvm_options: Option<&str>) -> String {
    let mut command = format!("nohup ./{} {} false false", layout.start_script, layout.config_file);
    if let Some(options) = jvm_options {
        command.push(' ');
        command.push_str(&shell_quote(options));
    }
    format!(
        "cd {}\n{command} > nohup.out 2>&1 &\necho $! > {PID_FILE}\n",
        shell_quote(dir)
    )
}

#[async_trait]
impl Backend for CloudBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Cloud
    }

    async fn validate(
        &self,
        config: &NodeConfiguration,
        env: &Environment,
    ) -> Result<(), ConfigurationError> {
        let BackendConfig::Cloud { credentials, .. } = config.backend() else {
            return Err(ConfigurationError::invalid("backend", "expected a cloud configuration"));
        };
        if self.settings.bundle_for(config.node_type()).is_none() {
            return Err(ConfigurationError::Setting {
                key: "cloud.driver_bundle".to_string(),
                reason: "no driver bundle configured".to_string(),
            });
        }
        env.credentials.resolve(credentials).await?;
        Ok(())
    }

    fn reserve(&self, config: &NodeConfiguration, session: &SessionId) -> BackendPayload {
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let port = match (config.management_port(), config.node_type()) {
            (Some(port), _) => port,
            (None, NodeType::Driver) => DRIVER_MANAGEMENT_PORT,
            (None, NodeType::Worker) => self.settings.management_port,
        };
        BackendPayload::pending(BackendKind::Cloud, session, sequence, port)
    }

    async fn deploy(&self, job: &mut DeploymentJob) -> Result<(), DeploymentStepError> {
        let steps = job.steps.clone();
        let (key_name, credentials) = steps
            .critical("resolve-credentials", self.login(&job.config, &job.env))
            .await?;
        let compute = steps
            .critical("acquire-compute", self.compute(&job.env))
            .await?;

        let profile = match job.config.backend() {
            BackendConfig::Cloud { profile, .. } => profile.clone(),
            _ => String::new(),
        };
        let spec = InstanceSpec {
            profile,
            key_name,
            user: credentials.user().to_string(),
        };
        let instance = steps
            .critical("create-instance", compute.create_instance(&spec))
            .await?;
        info!(node_id = %job.node_id, instance_id = %instance.id, "Instance created");
        job.node
            .update(|node| {
                node.provider_id = Some(instance.id.clone());
                node.public_addresses = instance.addresses.public.clone();
                node.private_addresses = instance.addresses.private.clone();
                if let BackendPayload::Cloud { instance_id, .. } = &mut node.payload {
                    *instance_id = Some(instance.id.clone());
                }
            })
            .await;
        steps.advance(NodeState::Provisioning).await?;

        let host = job
            .node
            .read(|n| n.reachable_address().map(str::to_string))
            .await;
        let host = steps
            .critical("resolve-address", async {
                host.ok_or_else(|| StepFailure::Invalid("instance has no address".to_string()))
            })
            .await?;
        let target = ChannelTarget::new(host, self.settings.ssh_port, credentials.clone());
        job.channel = Some(job.env.channels.open(&target));
        steps.critical("connect", job.connect()).await?;

        self.install_and_start(job, &compute, &instance.id, &credentials)
            .await
    }

    async fn abandon(&self, job: &mut DeploymentJob) {
        job.release_channel().await;
        let instance_id = job.node.read(|n| n.provider_id.clone()).await;
        let Some(instance_id) = instance_id else {
            return;
        };
        match self.compute(&job.env).await {
            Ok(compute) => match compute.terminate_instance(&instance_id).await {
                Ok(()) => info!(node_id = %job.node_id, %instance_id, "Terminated abandoned instance"),
                Err(e) => warn!(node_id = %job.node_id, %instance_id, error = %e, "Failed to terminate abandoned instance"),
            },
            Err(e) => warn!(node_id = %job.node_id, %instance_id, error = %e, "No compute context to clean up instance"),
        }
    }

    async fn stop(&self, job: &mut DeploymentJob) -> Result<(), DeploymentStepError> {
        let steps = job.steps.clone();
        let (instance_id, dir, host) = job
            .node
            .read(|n| {
                let dir = match &n.payload {
                    BackendPayload::Cloud { install_dir, .. } => install_dir.clone(),
                    _ => None,
                };
                (n.provider_id.clone(), dir, n.reachable_address().map(str::to_string))
            })
            .await;
        let instance_id = steps
            .critical("locate-instance", async {
                instance_id.ok_or_else(|| StepFailure::Invalid("node has no instance".to_string()))
            })
            .await?;

        if let (Some(dir), Some(host)) = (dir, host) {
            if let Ok((_, credentials)) = self.login(&job.config, &job.env).await {
                let target = ChannelTarget::new(host, self.settings.ssh_port, credentials);
                job.channel = Some(job.env.channels.open(&target));
                if steps.optional("connect", job.connect()).await?.is_some() {
                    let kill = format!("kill $(cat {}) 2>/dev/null || true", shell_quote(&format!("{dir}/{PID_FILE}")));
                    steps.optional("kill-process", job.exec(&kill)).await?;
                }
                job.release_channel().await;
            }
        }

        let compute = steps
            .critical("acquire-compute", self.compute(&job.env))
            .await?;
        steps
            .critical("terminate-instance", compute.terminate_instance(&instance_id))
            .await?;
        info!(node_id = %job.node_id, %instance_id, "Instance terminated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_dir_is_session_scoped() {
        let a = SessionId::from_token("one");
        let b = SessionId::from_token("two");

        assert_eq!(install_dir(&BundleLayout::WORKER, &a, 3), "grid-node-one-3");
        assert_ne!(
            install_dir(&BundleLayout::WORKER, &a, 3),
            install_dir(&BundleLayout::WORKER, &b, 3)
        );
    }

    #[test]
    fn test_start_script_detaches() {
        let script = start_script("grid-node-s-0", &BundleLayout::WORKER, Some("-Xmx1g -server"));

        assert!(script.starts_with("cd grid-node-s-0\n"));
        assert!(script.contains("nohup ./startNode.sh grid-node.properties false false '-Xmx1g -server' > nohup.out 2>&1 &"));
        assert!(script.contains("echo $! > node.pid"));
    }
}
