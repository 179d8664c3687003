//! Scripted channel for tests.
//!
//! Channels opened from one [`MockChannelFactory`] share its rules and its
//! event journal, so a test can script failures up front and inspect every
//! connect, command, upload and disconnect afterwards.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::{ChannelFactory, ChannelTarget, CommandOutput, RemoteChannel};
use crate::error::TransportError;
use crate::lock;

/// One thing a mock channel was asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Connect { target: String },
    Execute { target: String, command: String },
    Upload { target: String, path: String, contents: String },
    Disconnect { target: String },
}

#[derive(Debug, Clone)]
enum Rule {
    FailConnect(String),
    FailExecute(String),
    FailUpload(String),
    Respond(String, String),
}

#[derive(Debug, Default)]
struct Shared {
    rules: Vec<Rule>,
    events: Vec<ChannelEvent>,
}

impl Shared {
    fn record(&mut self, event: ChannelEvent) {
        self.events.push(event);
    }
}

/// Hands out [`MockChannel`]s sharing one script and journal.
#[derive(Debug, Clone, Default)]
pub struct MockChannelFactory {
    shared: Arc<Mutex<Shared>>,
}

impl MockChannelFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// A channel whose target label is `target`.
    pub fn channel(&self, target: &str) -> MockChannel {
        MockChannel {
            target: target.to_string(),
            connected: false,
            shared: self.shared.clone(),
        }
    }

    /// Fail `connect` on targets containing `pattern`.
    pub fn fail_connect(&self, pattern: &str) {
        lock(&self.shared).rules.push(Rule::FailConnect(pattern.to_string()));
    }

    /// Fail commands containing `pattern` with exit status 1.
    pub fn fail_execute(&self, pattern: &str) {
        lock(&self.shared).rules.push(Rule::FailExecute(pattern.to_string()));
    }

    /// Fail uploads to paths containing `pattern`.
    pub fn fail_upload(&self, pattern: &str) {
        lock(&self.shared).rules.push(Rule::FailUpload(pattern.to_string()));
    }

    /// Answer commands containing `pattern` with `stdout`.
    pub fn respond(&self, pattern: &str, stdout: &str) {
        lock(&self.shared)
            .rules
            .push(Rule::Respond(pattern.to_string(), stdout.to_string()));
    }

    pub fn events(&self) -> Vec<ChannelEvent> {
        lock(&self.shared).events.clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ChannelEvent::Execute { command, .. } => Some(command),
                _ => None,
            })
            .collect()
    }

    /// Contents of the last upload to `path`.
    pub fn uploaded(&self, path: &str) -> Option<String> {
        self.events().into_iter().rev().find_map(|e| match e {
            ChannelEvent::Upload {
                path: p, contents, ..
            } if p == path => Some(contents),
            _ => None,
        })
    }

    pub fn count(&self, matches: impl Fn(&ChannelEvent) -> bool) -> usize {
        lock(&self.shared).events.iter().filter(|e| matches(e)).count()
    }
}

impl ChannelFactory for MockChannelFactory {
    fn open(&self, target: &ChannelTarget) -> Box<dyn RemoteChannel> {
        Box::new(self.channel(&target.host))
    }
}

pub struct MockChannel {
    target: String,
    connected: bool,
    shared: Arc<Mutex<Shared>>,
}

impl MockChannel {
    fn not_connected(&self) -> TransportError {
        TransportError::NotConnected {
            target: self.target.clone(),
        }
    }
}

#[async_trait]
impl RemoteChannel for MockChannel {
    fn target(&self) -> &str {
        &self.target
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        let mut shared = lock(&self.shared);
        shared.record(ChannelEvent::Connect {
            target: self.target.clone(),
        });
        let refused = shared
            .rules
            .iter()
            .any(|r| matches!(r, Rule::FailConnect(p) if self.target.contains(p.as_str())));
        if refused {
            return Err(TransportError::Connect {
                target: self.target.clone(),
                message: "connection refused".to_string(),
            });
        }
        self.connected = true;
        Ok(())
    }

    async fn execute(&mut self, command: &str) -> Result<CommandOutput, TransportError> {
        if !self.connected {
            return Err(self.not_connected());
        }
        let mut shared = lock(&self.shared);
        shared.record(ChannelEvent::Execute {
            target: self.target.clone(),
            command: command.to_string(),
        });

        let mut output = CommandOutput::ok("");
        for rule in &shared.rules {
            match rule {
                Rule::FailExecute(p) if command.contains(p.as_str()) => {
                    output = CommandOutput {
                        status: Some(1),
                        stdout: String::new(),
                        stderr: format!("scripted failure of `{command}`"),
                    };
                    break;
                }
                Rule::Respond(p, stdout) if command.contains(p.as_str()) => {
                    output = CommandOutput::ok(stdout.clone());
                }
                _ => {}
            }
        }
        output.into_result(&self.target, command)
    }

    async fn upload(
        &mut self,
        data: &mut (dyn AsyncRead + Send + Unpin),
        remote_path: &str,
    ) -> Result<u64, TransportError> {
        if !self.connected {
            return Err(self.not_connected());
        }
        let mut buffer = Vec::new();
        data.read_to_end(&mut buffer).await?;

        let mut shared = lock(&self.shared);
        shared.record(ChannelEvent::Upload {
            target: self.target.clone(),
            path: remote_path.to_string(),
            contents: String::from_utf8_lossy(&buffer).into_owned(),
        });
        let refused = shared
            .rules
            .iter()
            .any(|r| matches!(r, Rule::FailUpload(p) if remote_path.contains(p.as_str())));
        if refused {
            return Err(TransportError::Upload {
                target: self.target.clone(),
                path: remote_path.to_string(),
                message: "scripted upload failure".to_string(),
            });
        }
        Ok(buffer.len() as u64)
    }

    async fn disconnect(&mut self) {
        if !self.connected {
            return;
        }
        self.connected = false;
        lock(&self.shared).record(ChannelEvent::Disconnect {
            target: self.target.clone(),
        });
    }
}
