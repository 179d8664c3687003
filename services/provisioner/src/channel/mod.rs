//! Remote execution channels.
//!
//! A channel runs shell commands on one target and uploads files to it.
//! Pipelines only see [`RemoteChannel`]; the SSH, local and batch variants
//! differ in transport, not in contract.

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::credentials::Credentials;
use crate::error::TransportError;

pub mod batch;
pub mod local;
pub mod mock;
pub mod ssh;

pub use batch::BatchChannel;
pub use local::LocalChannel;
pub use mock::{ChannelEvent, MockChannel, MockChannelFactory};
pub use ssh::{SshChannel, SystemChannelFactory};

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status. `None` if the process was killed by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Turn a non-zero exit into [`TransportError::CommandFailed`].
    pub fn into_result(self, target: &str, command: &str) -> Result<Self, TransportError> {
        if self.success() {
            Ok(self)
        } else {
            Err(TransportError::CommandFailed {
                target: target.to_string(),
                command: command.to_string(),
                status: self.status,
                stdout: self.stdout,
                stderr: self.stderr,
            })
        }
    }
}

impl From<std::process::Output> for CommandOutput {
    fn from(output: std::process::Output) -> Self {
        Self {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

/// Command and file transport to one target.
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    /// Human-readable target, used in logs and errors.
    fn target(&self) -> &str;

    fn is_connected(&self) -> bool;

    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Run `command` through the target's shell.
    ///
    /// A non-zero exit is an error carrying the captured output.
    async fn execute(&mut self, command: &str) -> Result<CommandOutput, TransportError>;

    /// Stream `data` into `remote_path`, replacing any existing file.
    /// Returns the number of bytes written.
    async fn upload(
        &mut self,
        data: &mut (dyn AsyncRead + Send + Unpin),
        remote_path: &str,
    ) -> Result<u64, TransportError>;

    /// Release the connection. Does nothing when not connected.
    async fn disconnect(&mut self);
}

/// Where and as whom to open a remote channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelTarget {
    pub host: String,
    pub port: u16,
    pub credentials: Credentials,
}

impl ChannelTarget {
    pub fn new(host: impl Into<String>, port: u16, credentials: Credentials) -> Self {
        Self {
            host: host.into(),
            port,
            credentials,
        }
    }

    /// `user@host:port`
    pub fn display(&self) -> String {
        format!("{}@{}:{}", self.credentials.user(), self.host, self.port)
    }
}

/// Opens channels to remote hosts.
pub trait ChannelFactory: Send + Sync {
    fn open(&self, target: &ChannelTarget) -> Box<dyn RemoteChannel>;
}

/// Quote `value` for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+,".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("grid-node/config/a.properties", "grid-node/config/a.properties")]
    #[case("", "''")]
    #[case("two words", "'two words'")]
    #[case("it's", r"'it'\''s'")]
    fn test_shell_quote(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(shell_quote(input), expected);
    }

    #[test]
    fn test_non_zero_exit_is_error() {
        let output = CommandOutput {
            status: Some(2),
            stdout: "partial".into(),
            stderr: "no such file".into(),
        };

        match output.into_result("host", "ls x") {
            Err(TransportError::CommandFailed {
                status, stderr, ..
            }) => {
                assert_eq!(status, Some(2));
                assert_eq!(stderr, "no such file");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
