//! Channel onto a directory of the local machine.

use std::path::{Component, Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::process::Command;
use tracing::{debug, info};

use super::{CommandOutput, RemoteChannel};
use crate::error::TransportError;

/// Runs commands with `sh -c` inside `root`. Upload paths are relative to it.
pub struct LocalChannel {
    root: PathBuf,
    label: String,
    connected: bool,
}

impl LocalChannel {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let label = format!("local:{}", root.display());
        Self {
            root,
            label,
            connected: false,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Start `program` as an independent process in its own process group.
    ///
    /// The child is not awaited and outlives this channel. Output goes to
    /// `log_file` under the working directory. Returns the OS pid.
    pub async fn spawn_detached(
        &self,
        working_dir: &str,
        program: &str,
        args: &[String],
        log_file: &str,
    ) -> Result<u32, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected {
                target: self.label.clone(),
            });
        }
        let dir = self.resolve(working_dir)?;
        let log = std::fs::File::create(dir.join(log_file))?;
        let log_err = log.try_clone()?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn()?;
        let pid = child.id().ok_or_else(|| TransportError::CommandFailed {
            target: self.label.clone(),
            command: program.to_string(),
            status: None,
            stdout: String::new(),
            stderr: "process exited before its pid was read".to_string(),
        })?;
        info!(channel = %self.label, program, pid, "Spawned detached process");
        Ok(pid)
    }

    /// Map a relative path onto the root, refusing paths that escape it.
    fn resolve(&self, relative: &str) -> Result<PathBuf, TransportError> {
        let path = Path::new(relative);
        let escapes = path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)));
        if escapes {
            return Err(TransportError::Upload {
                target: self.label.clone(),
                path: relative.to_string(),
                message: "path must stay inside the channel root".to_string(),
            });
        }
        Ok(self.root.join(path))
    }
}

#[async_trait]
impl RemoteChannel for LocalChannel {
    fn target(&self) -> &str {
        &self.label
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        let is_dir = tokio::fs::metadata(&self.root)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if !is_dir {
            return Err(TransportError::Connect {
                target: self.label.clone(),
                message: "root is not a directory".to_string(),
            });
        }
        self.connected = true;
        Ok(())
    }

    async fn execute(&mut self, command: &str) -> Result<CommandOutput, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected {
                target: self.label.clone(),
            });
        }
        debug!(channel = %self.label, command, "Executing local command");

        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .output()
            .await?;
        CommandOutput::from(output).into_result(&self.label, command)
    }

    async fn upload(
        &mut self,
        data: &mut (dyn AsyncRead + Send + Unpin),
        remote_path: &str,
    ) -> Result<u64, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected {
                target: self.label.clone(),
            });
        }
        let path = self.resolve(remote_path)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::File::create(&path).await?;
        let written = tokio::io::copy(data, &mut file).await?;
        file.sync_all().await?;
        debug!(channel = %self.label, path = %path.display(), bytes = written, "Wrote file");
        Ok(written)
    }

    async fn disconnect(&mut self) {
        self.connected = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upload_then_execute() {
        let dir = tempfile::tempdir().unwrap();
        let mut channel = LocalChannel::new(dir.path());
        channel.connect().await.unwrap();

        let mut data: &[u8] = b"a=1\n";
        let written = channel.upload(&mut data, "config/node.properties").await.unwrap();
        assert_eq!(written, 4);

        let output = channel.execute("cat config/node.properties").await.unwrap();
        assert_eq!(output.stdout, "a=1\n");
    }

    #[tokio::test]
    async fn test_failed_command_carries_output() {
        let dir = tempfile::tempdir().unwrap();
        let mut channel = LocalChannel::new(dir.path());
        channel.connect().await.unwrap();

        let err = channel.execute("echo oops >&2; exit 3").await.unwrap_err();
        match err {
            TransportError::CommandFailed { status, stderr, .. } => {
                assert_eq!(status, Some(3));
                assert_eq!(stderr.trim(), "oops");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_upload_cannot_escape_root() {
        let dir = tempfile::tempdir().unwrap();
        let mut channel = LocalChannel::new(dir.path());
        channel.connect().await.unwrap();

        let mut data: &[u8] = b"x";
        assert!(channel.upload(&mut data, "../outside").await.is_err());
    }

    #[tokio::test]
    async fn test_connect_requires_directory() {
        let mut channel = LocalChannel::new("/nonexistent/grid");
        assert!(matches!(
            channel.connect().await,
            Err(TransportError::Connect { .. })
        ));
    }

    #[tokio::test]
    async fn test_spawn_detached_returns_pid() {
        let dir = tempfile::tempdir().unwrap();
        let mut channel = LocalChannel::new(dir.path());
        channel.connect().await.unwrap();

        let pid = channel
            .spawn_detached(".", "sh", &["-c".to_string(), "echo started".to_string()], "out.log")
            .await
            .unwrap();
        assert!(pid > 0);
    }
}
