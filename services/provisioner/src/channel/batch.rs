//! Batch scheduler access through a channel to the head node.

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tracing::info;

use super::{shell_quote, CommandOutput, RemoteChannel};
use crate::error::TransportError;

/// Channel to a scheduler head node that can also submit and cancel jobs.
pub struct BatchChannel {
    inner: Box<dyn RemoteChannel>,
}

impl BatchChannel {
    pub fn new(inner: Box<dyn RemoteChannel>) -> Self {
        Self { inner }
    }

    /// Pipe the output of `submit_script <job_name> <config_file>` into `qsub`.
    ///
    /// More than one slot requests that many processors on a single host.
    /// Returns the job id printed by the scheduler.
    pub async fn submit(
        &mut self,
        submit_script: &str,
        job_name: &str,
        config_file: &str,
        slots: u32,
    ) -> Result<String, TransportError> {
        let mut command = format!(
            "{} {} {} | qsub",
            shell_quote(submit_script),
            shell_quote(job_name),
            shell_quote(config_file)
        );
        if slots > 1 {
            command.push_str(&format!(" -l nodes=1:ppn={slots}"));
        }
        let output = self.inner.execute(&command).await?;
        let job_id = output.stdout.trim();
        if job_id.is_empty() {
            return Err(TransportError::EmptyResponse {
                target: self.inner.target().to_string(),
                command,
            });
        }
        info!(channel = %self.inner.target(), job_name, job_id, "Submitted batch job");
        Ok(job_id.to_string())
    }

    /// Remove a job from the scheduler with `qdel`.
    pub async fn cancel(&mut self, job_id: &str) -> Result<(), TransportError> {
        self.inner
            .execute(&format!("qdel {}", shell_quote(job_id)))
            .await?;
        info!(channel = %self.inner.target(), job_id, "Cancelled batch job");
        Ok(())
    }
}

#[async_trait]
impl RemoteChannel for BatchChannel {
    fn target(&self) -> &str {
        self.inner.target()
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        self.inner.connect().await
    }

    async fn execute(&mut self, command: &str) -> Result<CommandOutput, TransportError> {
        self.inner.execute(command).await
    }

    async fn upload(
        &mut self,
        data: &mut (dyn AsyncRead + Send + Unpin),
        remote_path: &str,
    ) -> Result<u64, TransportError> {
        self.inner.upload(data, remote_path).await
    }

    async fn disconnect(&mut self) {
        self.inner.disconnect().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelEvent, MockChannelFactory};

    #[tokio::test]
    async fn test_submit_returns_trimmed_job_id() {
        let factory = MockChannelFactory::new();
        factory.respond("qsub", "4711.head\n");
        let mut channel = BatchChannel::new(Box::new(factory.channel("head")));
        channel.connect().await.unwrap();

        let job = channel
            .submit("grid-node/submit.sh", "GridNodeabc_1", "grid-node-abc-1.properties", 1)
            .await
            .unwrap();

        assert_eq!(job, "4711.head");
        assert!(factory.commands().contains(
            &"grid-node/submit.sh GridNodeabc_1 grid-node-abc-1.properties | qsub".to_string()
        ));
    }

    #[tokio::test]
    async fn test_empty_submit_output_is_error() {
        let factory = MockChannelFactory::new();
        let mut channel = BatchChannel::new(Box::new(factory.channel("head")));
        channel.connect().await.unwrap();

        let err = channel.submit("s.sh", "n", "c", 1).await.unwrap_err();
        assert!(matches!(err, TransportError::EmptyResponse { .. }));
    }

    #[tokio::test]
    async fn test_submit_requests_slots() {
        let factory = MockChannelFactory::new();
        factory.respond("qsub", "12.head");
        let mut channel = BatchChannel::new(Box::new(factory.channel("head")));
        channel.connect().await.unwrap();

        channel.submit("s.sh", "n", "c", 4).await.unwrap();

        assert_eq!(factory.commands(), vec!["s.sh n c | qsub -l nodes=1:ppn=4".to_string()]);
    }

    #[tokio::test]
    async fn test_submit_quotes_script_path() {
        let factory = MockChannelFactory::new();
        factory.respond("qsub", "13.head");
        let mut channel = BatchChannel::new(Box::new(factory.channel("head")));
        channel.connect().await.unwrap();

        channel
            .submit("grid node/submit.sh", "n", "c", 1)
            .await
            .unwrap();

        assert_eq!(factory.commands(), vec!["'grid node/submit.sh' n c | qsub".to_string()]);
    }

    #[tokio::test]
    async fn test_cancel_runs_qdel() {
        let factory = MockChannelFactory::new();
        let mut channel = BatchChannel::new(Box::new(factory.channel("head")));
        channel.connect().await.unwrap();

        channel.cancel("4711.head").await.unwrap();

        assert!(factory.events().contains(&ChannelEvent::Execute {
            target: "head".into(),
            command: "qdel 4711.head".into(),
        }));
    }
}
