//! Channel over the system `ssh` client.
//!
//! Each command is one `ssh` invocation. Key material is written to a private
//! temporary file for the lifetime of the connection; passwords go through
//! `sshpass -e` so they never appear on a command line.

use std::io::Write;
use std::process::Stdio;

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{shell_quote, ChannelFactory, ChannelTarget, CommandOutput, RemoteChannel};
use crate::credentials::Credentials;
use crate::error::TransportError;

const CONNECT_TIMEOUT_SECS: u32 = 15;

/// Opens [`SshChannel`]s.
#[derive(Debug, Clone, Default)]
pub struct SystemChannelFactory;

impl ChannelFactory for SystemChannelFactory {
    fn open(&self, target: &ChannelTarget) -> Box<dyn RemoteChannel> {
        Box::new(SshChannel::new(target.clone()))
    }
}

pub struct SshChannel {
    target: ChannelTarget,
    label: String,
    identity: Option<NamedTempFile>,
    connected: bool,
}

impl SshChannel {
    pub fn new(target: ChannelTarget) -> Self {
        let label = target.display();
        Self {
            target,
            label,
            identity: None,
            connected: false,
        }
    }

    fn command(&self, remote_command: &str) -> Command {
        let mut cmd = match &self.target.credentials {
            Credentials::Password { password, .. } => {
                let mut cmd = Command::new("sshpass");
                cmd.arg("-e").arg("ssh").env("SSHPASS", password.expose());
                cmd
            }
            _ => {
                let mut cmd = Command::new("ssh");
                cmd.args(["-o", "BatchMode=yes"]);
                cmd
            }
        };

        cmd.args(["-o", "StrictHostKeyChecking=no"])
            .args(["-o", "UserKnownHostsFile=/dev/null"])
            .args(["-o", "LogLevel=ERROR"])
            .arg("-o")
            .arg(format!("ConnectTimeout={CONNECT_TIMEOUT_SECS}"))
            .arg("-p")
            .arg(self.target.port.to_string());

        if let Some(identity) = &self.identity {
            cmd.args(["-o", "IdentitiesOnly=yes"]).arg("-i").arg(identity.path());
        }

        cmd.arg(format!("{}@{}", self.target.credentials.user(), self.target.host))
            .arg(remote_command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn materialize_identity(&self) -> Result<Option<NamedTempFile>, TransportError> {
        if self.target.credentials.is_password() {
            return Ok(None);
        }
        // NamedTempFile is created with mode 0600.
        let mut file = NamedTempFile::new()?;
        file.write_all(self.target.credentials.private_material().expose().as_bytes())?;
        file.flush()?;
        Ok(Some(file))
    }

    fn ensure_connected(&self) -> Result<(), TransportError> {
        if self.connected {
            Ok(())
        } else {
            Err(TransportError::NotConnected {
                target: self.label.clone(),
            })
        }
    }
}

#[async_trait]
impl RemoteChannel for SshChannel {
    fn target(&self) -> &str {
        &self.label
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.connected {
            return Ok(());
        }

        self.identity = self.materialize_identity()?;
        let output = self
            .command("true")
            .output()
            .await
            .map_err(|e| TransportError::Connect {
                target: self.label.clone(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            self.identity = None;
            return Err(TransportError::Connect {
                target: self.label.clone(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        self.connected = true;
        info!(channel = %self.label, "SSH channel connected");
        Ok(())
    }

    async fn execute(&mut self, command: &str) -> Result<CommandOutput, TransportError> {
        self.ensure_connected()?;
        debug!(channel = %self.label, command, "Executing remote command");

        let output = self.command(command).output().await?;
        CommandOutput::from(output).into_result(&self.label, command)
    }

    async fn upload(
        &mut self,
        data: &mut (dyn AsyncRead + Send + Unpin),
        remote_path: &str,
    ) -> Result<u64, TransportError> {
        self.ensure_connected()?;
        let upload_error = |message: String| TransportError::Upload {
            target: self.label.clone(),
            path: remote_path.to_string(),
            message,
        };

        let mut child = self
            .command(&format!("cat > {}", shell_quote(remote_path)))
            .stdin(Stdio::piped())
            .spawn()?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| upload_error("stdin of ssh not captured".to_string()))?;
        let written = tokio::io::copy(data, &mut stdin)
            .await
            .map_err(|e| upload_error(e.to_string()))?;
        stdin.shutdown().await.map_err(|e| upload_error(e.to_string()))?;
        drop(stdin);

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(upload_error(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        debug!(channel = %self.label, path = remote_path, bytes = written, "Uploaded file");
        Ok(written)
    }

    async fn disconnect(&mut self) {
        if !self.connected {
            return;
        }
        self.connected = false;
        if let Some(identity) = self.identity.take() {
            if let Err(e) = identity.close() {
                warn!(channel = %self.label, error = %e, "Failed to remove identity file");
            }
        }
        debug!(channel = %self.label, "SSH channel disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_goes_through_env() {
        let channel = SshChannel::new(ChannelTarget::new(
            "head.example",
            2222,
            Credentials::password("grid", "s3cret"),
        ));
        let cmd = channel.command("hostname");
        let std_cmd = cmd.as_std();

        assert_eq!(std_cmd.get_program(), "sshpass");
        let args: Vec<_> = std_cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert!(!args.iter().any(|a| a.contains("s3cret")));
        assert!(args.contains(&"grid@head.example".to_string()));
        assert!(args.contains(&"2222".to_string()));
    }

    #[tokio::test]
    async fn test_execute_requires_connect() {
        let mut channel = SshChannel::new(ChannelTarget::new(
            "head.example",
            22,
            Credentials::generated("ec2-user", "KEY"),
        ));
        let err = channel.execute("true").await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected { .. }));

        // Not connected, so this must not fail.
        channel.disconnect().await;
    }

    #[test]
    fn test_identity_file_holds_key() {
        let channel = SshChannel::new(ChannelTarget::new(
            "h",
            22,
            Credentials::generated("ec2-user", "KEY MATERIAL"),
        ));
        let identity = channel.materialize_identity().unwrap().unwrap();
        assert_eq!(std::fs::read_to_string(identity.path()).unwrap(), "KEY MATERIAL");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(identity.path()).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
