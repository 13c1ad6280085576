//! SSH sessions.
//!
//! One multiplexed SSH connection is kept per node. Commands run through `sh -c` so that
//! pipes and redirections in command templates behave like they do in a login shell.

use std::future::Future;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::BoxFuture;
use openssh::{KnownHosts, Session as SSHSession, SessionBuilder};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::error::ExecError;
use crate::node::Node;

/// A command line to run on a node, optionally fed a payload on stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    pub line: String,
    pub stdin: Option<String>,
}

impl RemoteCommand {
    pub fn new(line: impl Into<String>) -> Self {
        Self {
            line: line.into(),
            stdin: None,
        }
    }

    pub fn with_stdin(mut self, payload: impl Into<String>) -> Self {
        self.stdin = Some(payload.into());
        self
    }
}

/// What came back from a remote command that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, or -1 when the process was killed by a signal.
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Turns a non-zero exit into `ExecError::Remote`.
    pub fn check(self, node: &str) -> Result<CommandOutput, ExecError> {
        if self.success() {
            Ok(self)
        } else {
            let stderr = if self.stderr.trim().is_empty() {
                self.stdout.clone()
            } else {
                self.stderr.clone()
            };
            Err(ExecError::Remote {
                node: node.to_string(),
                code: self.code,
                stderr,
            })
        }
    }
}

#[async_trait]
pub trait Session: Send + Sync {
    /// Runs one command to completion.
    async fn run(&self, command: &RemoteCommand) -> Result<CommandOutput, ExecError>;

    /// Cheap liveness check of the underlying connection.
    async fn check(&self) -> bool;

    /// Tears the connection down. Only called once no command holds the handle.
    fn close(self: Box<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async {})
    }
}

/// Opens sessions. The executor owns the resulting handles.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, node: &Node) -> Result<Box<dyn Session>, ExecError>;
}

/// Connects with OpenSSH's native multiplexing.
pub struct SshConnector {
    connect_timeout: Duration,
}

impl SshConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, node: &Node) -> Result<Box<dyn Session>, ExecError> {
        let mut builder = SessionBuilder::default();
        builder
            .user(node.user.clone())
            .port(node.port)
            .connect_timeout(self.connect_timeout)
            .known_hosts_check(KnownHosts::Add);
        if let Some(key) = &node.key {
            builder.keyfile(key);
        }
        let session = builder
            .connect_mux(&node.address)
            .await
            .map_err(|e| ExecError::Connect {
                node: node.id.clone(),
                reason: e.to_string(),
            })?;
        debug!(node = %node.id, "Connected to node.");
        Ok(Box::new(SshSession {
            node: node.id.clone(),
            session,
        }))
    }
}

/// Writes `payload` to `stdin` while `wait` drains the output, then closes `stdin`.
///
/// A remote command may fill its output pipe before it reads any input, so the two must make
/// progress together.
async fn feed_while<W, F>(
    stdin: Option<W>,
    payload: Option<&[u8]>,
    wait: F,
) -> (std::io::Result<()>, F::Output)
where
    W: AsyncWrite + Unpin,
    F: Future,
{
    let feed = async move {
        if let (Some(payload), Some(mut stdin)) = (payload, stdin) {
            stdin.write_all(payload).await?;
            stdin.shutdown().await?;
        }
        Ok::<(), std::io::Error>(())
    };
    tokio::join!(feed, wait)
}

pub struct SshSession {
    node: String,
    session: SSHSession,
}

impl SshSession {
    fn classify(&self, err: openssh::Error) -> ExecError {
        match err {
            openssh::Error::Connect(_) | openssh::Error::Master(_) | openssh::Error::Disconnected => {
                ExecError::Connect {
                    node: self.node.clone(),
                    reason: err.to_string(),
                }
            }
            other => ExecError::Transport {
                node: self.node.clone(),
                reason: other.to_string(),
            },
        }
    }
}

#[async_trait]
impl Session for SshSession {
    async fn run(&self, command: &RemoteCommand) -> Result<CommandOutput, ExecError> {
        let started = Instant::now();
        let mut cmd = self.session.command("sh");
        cmd.arg("-c")
            .arg(&command.line)
            .stdout(openssh::Stdio::piped())
            .stderr(openssh::Stdio::piped());
        if command.stdin.is_some() {
            cmd.stdin(openssh::Stdio::piped());
        } else {
            cmd.stdin(openssh::Stdio::null());
        }
        let mut child = cmd.spawn().await.map_err(|e| self.classify(e))?;
        let stdin = child.stdin().take();
        let payload = command.stdin.as_deref().map(str::as_bytes);
        let (fed, output) = feed_while(stdin, payload, child.wait_with_output()).await;
        let output = output.map_err(|e| self.classify(e))?;
        if let Err(e) = fed {
            // The exit status tells whether the command needed the rest of its input.
            warn!(node = %self.node, code = ?output.status.code(), "Remote command stopped reading stdin: {}", e);
        }
        Ok(CommandOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration: started.elapsed(),
        })
    }

    async fn check(&self) -> bool {
        self.session.check().await.is_ok()
    }

    fn close(self: Box<Self>) -> BoxFuture<'static, ()> {
        let SshSession { node, session } = *self;
        Box::pin(async move {
            debug!(node = %node, "Terminating connection.");
            if let Err(e) = session.close().await {
                warn!(node = %node, "Error while terminating: {}", e);
            }
        })
    }
}
