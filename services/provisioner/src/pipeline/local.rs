//! Local backend: nodes run as processes on this machine.
//!
//! Each node gets a fresh temporary directory holding the unpacked bundle.
//! The directories are removed when the backend shuts down.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};

use async_trait::async_trait;
use flate2::read::GzDecoder;
use gridwright_properties::Properties;
use tar::Archive;
use tempfile::TempDir;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::render::{
    self, BundleLayout, RenderTarget, DRIVER_MANAGEMENT_PORT, LOCAL_MANAGEMENT_PORT_BASE,
};
use super::{Backend, DeploymentJob, Environment};
use crate::channel::{LocalChannel, RemoteChannel};
use crate::configuration::NodeConfiguration;
use crate::error::{ConfigurationError, DeploymentStepError, StepFailure};
use crate::ids::SessionId;
use crate::node::{BackendKind, BackendPayload, NodeState, NodeType};

const LOG_FILE: &str = "node.log";

/// Settings of the local backend.
#[derive(Debug, Clone)]
pub struct LocalSettings {
    /// Worker bundle, a `.tar.gz` with the start script at its root.
    pub bundle: PathBuf,
    pub driver_bundle: Option<PathBuf>,
    /// Parent of the per-node temporary directories. System temp dir if unset.
    pub scratch_dir: Option<PathBuf>,
    pub management_port_base: u16,
}

impl LocalSettings {
    pub fn new(bundle: impl Into<PathBuf>) -> Self {
        Self {
            bundle: bundle.into(),
            driver_bundle: None,
            scratch_dir: None,
            management_port_base: LOCAL_MANAGEMENT_PORT_BASE,
        }
    }

    fn bundle_for(&self, node_type: NodeType) -> Option<&Path> {
        match node_type {
            NodeType::Worker => Some(&self.bundle),
            NodeType::Driver => self.driver_bundle.as_deref(),
        }
    }
}

pub struct LocalBackend {
    settings: LocalSettings,
    next_port: AtomicU16,
    next_sequence: AtomicU32,
    install_dirs: Mutex<Vec<TempDir>>,
}

impl LocalBackend {
    pub fn new(settings: LocalSettings) -> Self {
        Self {
            settings,
            next_port: AtomicU16::new(0),
            next_sequence: AtomicU32::new(0),
            install_dirs: Mutex::new(Vec::new()),
        }
    }

    /// Create a temporary install directory and register it for cleanup.
    async fn create_install_dir(&self) -> Result<PathBuf, StepFailure> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("grid-node-");
        let dir = match &self.settings.scratch_dir {
            Some(root) => {
                tokio::fs::create_dir_all(root).await?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };
        let path = dir.path().to_path_buf();
        self.install_dirs.lock().await.push(dir);
        Ok(path)
    }

    async fn configure_and_start(
        &self,
        job: &mut DeploymentJob,
        channel: &mut LocalChannel,
        layout: BundleLayout,
    ) -> Result<(), DeploymentStepError> {
        let steps = job.steps.clone();
        let install_dir = channel.root().to_path_buf();

        for artifact in job.config.artifacts() {
            steps
                .optional("copy-artifact", copy_artifact(artifact, &install_dir.join("lib")))
                .await?;
        }

        let payload = job.payload().await;
        let driver_address = job.driver_address();
        let cache_dir = render::cache_dir(&job.env.session, payload.sequence());
        let target = RenderTarget {
            driver_address: &driver_address,
            management_host: Some(job.config.management_host().unwrap_or("localhost")),
            management_port: payload.management_port(),
            cache_dir: &cache_dir,
        };
        let rendered = steps
            .critical("render-config", async {
                render::render_node_properties(&job.config, &target)
            })
            .await?;
        steps.advance(NodeState::Configuring).await?;

        let config_path = install_dir.join(layout.config_path());
        steps
            .critical("write-config", write_config(rendered.clone(), config_path))
            .await?;
        debug!(node_id = %job.node_id, digest = %rendered.digest(), "Node configuration written");
        steps.advance(NodeState::Starting).await?;

        steps
            .optional(
                "chmod-start-script",
                channel.execute(&format!("chmod +x {}", layout.start_script)),
            )
            .await?;

        let mut args = vec![
            layout.config_file.to_string(),
            "false".to_string(),
            "false".to_string(),
        ];
        if let Some(options) = job.config.jvm_options() {
            args.push(options.to_string());
        }
        let program = install_dir.join(layout.start_script).to_string_lossy().into_owned();
        let pid = steps
            .critical("start-node", channel.spawn_detached(".", &program, &args, LOG_FILE))
            .await?;

        job.node
            .update(|node| {
                node.provider_id = Some(pid.to_string());
                node.private_addresses.insert("127.0.0.1".to_string());
                if let BackendPayload::Local { pid: slot, .. } = &mut node.payload {
                    *slot = Some(pid);
                }
            })
            .await;
        steps.advance(NodeState::Running).await
    }
}

#[async_trait]
impl Backend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn validate(
        &self,
        config: &NodeConfiguration,
        _env: &Environment,
    ) -> Result<(), ConfigurationError> {
        let bundle = self
            .settings
            .bundle_for(config.node_type())
            .ok_or_else(|| ConfigurationError::Setting {
                key: "local.driver_bundle".to_string(),
                reason: "no driver bundle configured".to_string(),
            })?;
        if tokio::fs::metadata(bundle).await.is_err() {
            return Err(ConfigurationError::Setting {
                key: "local.bundle".to_string(),
                reason: format!("{} does not exist", bundle.display()),
            });
        }
        Ok(())
    }

    fn reserve(&self, config: &NodeConfiguration, session: &SessionId) -> BackendPayload {
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let port = match (config.management_port(), config.node_type()) {
            (Some(port), _) => port,
            (None, NodeType::Driver) => DRIVER_MANAGEMENT_PORT,
            (None, NodeType::Worker) => self
                .settings
                .management_port_base
                .saturating_add(self.next_port.fetch_add(1, Ordering::SeqCst)),
        };
        BackendPayload::pending(BackendKind::Local, session, sequence, port)
    }

    async fn deploy(&self, job: &mut DeploymentJob) -> Result<(), DeploymentStepError> {
        let steps = job.steps.clone();
        let layout = BundleLayout::for_type(job.config.node_type());
        let bundle = steps
            .critical("locate-bundle", async {
                self.settings
                    .bundle_for(job.config.node_type())
                    .map(Path::to_path_buf)
                    .ok_or_else(|| StepFailure::Invalid("no bundle for node type".to_string()))
            })
            .await?;

        let install_dir = steps
            .critical("create-install-dir", self.create_install_dir())
            .await?;
        job.node
            .update(|node| {
                if let BackendPayload::Local { install_dir: slot, .. } = &mut node.payload {
                    *slot = Some(install_dir.clone());
                }
            })
            .await;
        steps
            .critical("unpack-bundle", unpack_bundle(bundle, install_dir.clone()))
            .await?;
        steps.advance(NodeState::Provisioning).await?;

        let mut channel = LocalChannel::new(&install_dir);
        steps.critical("connect", channel.connect()).await?;
        let result = self.configure_and_start(job, &mut channel, layout).await;
        channel.disconnect().await;

        if result.is_ok() {
            info!(node_id = %job.node_id, dir = %install_dir.display(), "Local node started");
        }
        result
    }

    async fn abandon(&self, job: &mut DeploymentJob) {
        let payload = job.payload().await;
        if let BackendPayload::Local {
            pid: Some(pid),
            install_dir: Some(dir),
            ..
        } = payload
        {
            let mut channel = LocalChannel::new(dir);
            if channel.connect().await.is_ok() {
                if let Err(e) = channel.execute(&kill_group(pid)).await {
                    warn!(node_id = %job.node_id, pid, error = %e, "Failed to kill abandoned node");
                }
                channel.disconnect().await;
            }
        }
    }

    async fn stop(&self, job: &mut DeploymentJob) -> Result<(), DeploymentStepError> {
        let steps = job.steps.clone();
        let (pid, dir) = match job.payload().await {
            BackendPayload::Local {
                pid: Some(pid),
                install_dir: Some(dir),
                ..
            } => (pid, dir),
            other => {
                return Err(DeploymentStepError::Failed {
                    step: "locate-process",
                    source: StepFailure::Invalid(format!("node has no local process: {other:?}")),
                })
            }
        };

        job.channel = Some(Box::new(LocalChannel::new(dir)));
        steps.critical("connect", job.connect()).await?;
        steps.critical("kill-process", job.exec(&stop_group(pid))).await?;
        info!(node_id = %job.node_id, pid, "Local node stopped");
        Ok(())
    }

    async fn shutdown(&self) {
        let dirs: Vec<TempDir> = std::mem::take(&mut *self.install_dirs.lock().await);
        if dirs.is_empty() {
            return;
        }
        let count = dirs.len();
        let removal = tokio::task::spawn_blocking(move || {
            for dir in dirs {
                let path = dir.path().to_path_buf();
                if let Err(e) = dir.close() {
                    warn!(dir = %path.display(), error = %e, "Failed to remove install directory");
                }
            }
        })
        .await;
        match removal {
            Ok(()) => info!(count, "Removed local install directories"),
            Err(e) => warn!(error = %e, "Install directory cleanup task failed"),
        }
    }
}

fn kill_group(pid: u32) -> String {
    format!("kill -TERM -{pid}")
}

/// Like [`kill_group`], but succeeds when the group has already exited.
fn stop_group(pid: u32) -> String {
    format!("kill -TERM -{pid} 2>/dev/null || ! kill -0 -{pid} 2>/dev/null")
}

async fn write_config(rendered: Properties, path: PathBuf) -> Result<(), StepFailure> {
    tokio::task::spawn_blocking(move || rendered.write_to_file(&path))
        .await
        .map_err(|e| StepFailure::Invalid(format!("config write task failed: {e}")))??;
    Ok(())
}

async fn copy_artifact(artifact: &Path, lib_dir: &Path) -> Result<u64, StepFailure> {
    let name = artifact
        .file_name()
        .ok_or_else(|| StepFailure::Invalid(format!("{} has no file name", artifact.display())))?;
    tokio::fs::create_dir_all(lib_dir).await?;
    let dest = lib_dir.join(name);
    info!(artifact = %artifact.display(), dest = %dest.display(), "Copying artifact");
    Ok(tokio::fs::copy(artifact, &dest).await?)
}

/// Unpack a gzipped tar bundle into `dest`.
pub(crate) async fn unpack_bundle(bundle: PathBuf, dest: PathBuf) -> Result<(), StepFailure> {
    tokio::task::spawn_blocking(move || -> Result<(), StepFailure> {
        let file = File::open(&bundle)?;
        let mut archive = Archive::new(GzDecoder::new(BufReader::new(file)));
        extract_archive(&mut archive, &dest)
    })
    .await
    .map_err(|e| StepFailure::Invalid(format!("unpack task failed: {e}")))?
}

fn extract_archive<R: Read>(archive: &mut Archive<R>, dest: &Path) -> Result<(), StepFailure> {
    archive.set_preserve_permissions(true);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();

        if path.components().any(|c| c == Component::ParentDir) {
            warn!(path = %path.display(), "Skipping bundle entry with parent directory");
            continue;
        }
        entry.unpack_in(dest)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::BackendConfig;

    #[test]
    fn test_worker_ports_are_distinct() {
        let backend = LocalBackend::new(LocalSettings::new("/bundles/grid-node.tar.gz"));
        let session = SessionId::new();
        let config = NodeConfiguration::builder(NodeType::Worker, BackendConfig::Local)
            .build()
            .unwrap();

        let ports: Vec<u16> = (0..3)
            .map(|_| backend.reserve(&config, &session).management_port())
            .collect();

        assert_eq!(ports, vec![12001, 12002, 12003]);
    }

    #[test]
    fn test_driver_uses_fixed_port() {
        let backend = LocalBackend::new(LocalSettings::new("/bundles/grid-node.tar.gz"));
        let config = NodeConfiguration::builder(NodeType::Driver, BackendConfig::Local)
            .build()
            .unwrap();

        let payload = backend.reserve(&config, &SessionId::new());

        assert_eq!(payload.management_port(), DRIVER_MANAGEMENT_PORT);
    }

    #[test]
    fn test_kill_targets_process_group() {
        assert_eq!(kill_group(4242), "kill -TERM -4242");
        assert_eq!(
            stop_group(4242),
            "kill -TERM -4242 2>/dev/null || ! kill -0 -4242 2>/dev/null"
        );
    }

    #[tokio::test]
    async fn test_write_config_lands_under_install_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config/grid-node.properties");
        let mut props = Properties::with_header("grid node");
        props.set(gridwright_properties::keys::PROCESSING_THREADS, "2").unwrap();

        write_config(props, path.clone()).await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("processing.threads=2\n"));
    }
}
