//! Remote command execution with one pooled session per node.
//!
//! Handles are established lazily, health-checked before every reuse, and discarded when a
//! command times out or the transport breaks. The next command re-establishes them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::ExecError;
use crate::node::Node;
use crate::session::{CommandOutput, Connector, RemoteCommand, Session};

type Handle = Arc<Box<dyn Session>>;

/// Connection and timeout knobs of the executor.
#[derive(Debug, Clone, Copy)]
pub struct ExecutorSettings {
    /// Ceiling for a single command unless the caller passes its own.
    pub command_timeout: Duration,
    /// Attempts to establish a connection before giving up.
    pub connect_retries: u32,
    /// Delay before the second attempt; doubles afterwards.
    pub connect_backoff: Duration,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(3600),
            connect_retries: 3,
            connect_backoff: Duration::from_millis(500),
        }
    }
}

pub struct Executor {
    connector: Arc<dyn Connector>,
    settings: ExecutorSettings,
    /// One slot per node id. The slot lock is only held while acquiring a handle,
    /// never while a command runs, so commands on one node run concurrently.
    slots: Mutex<HashMap<String, Arc<Mutex<Option<Handle>>>>>,
}

impl Executor {
    pub fn new(connector: Arc<dyn Connector>, settings: ExecutorSettings) -> Self {
        Self {
            connector,
            settings,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    /// Runs a command with the default timeout. Non-zero exits are returned as output.
    pub async fn run(&self, node: &Node, command: &RemoteCommand) -> Result<CommandOutput, ExecError> {
        self.run_with_timeout(node, command, self.settings.command_timeout)
            .await
    }

    /// Runs a command and turns a non-zero exit into `ExecError::Remote`.
    pub async fn run_checked(
        &self,
        node: &Node,
        command: &RemoteCommand,
    ) -> Result<CommandOutput, ExecError> {
        self.run(node, command).await?.check(&node.id)
    }

    pub async fn run_with_timeout(
        &self,
        node: &Node,
        command: &RemoteCommand,
        timeout: Duration,
    ) -> Result<CommandOutput, ExecError> {
        let handle = self.acquire(node).await?;
        debug!(node = %node.id, command = %command.line, "Running remote command.");
        match tokio::time::timeout(timeout, handle.run(command)).await {
            Ok(Ok(output)) => {
                debug!(node = %node.id, code = output.code, elapsed = ?output.duration, "Remote command finished.");
                Ok(output)
            }
            Ok(Err(err)) => {
                if err.discards_handle() {
                    self.discard(&node.id, &handle).await;
                }
                Err(err)
            }
            Err(_) => {
                warn!(node = %node.id, command = %command.line, "Remote command timed out; abandoning it.");
                self.discard(&node.id, &handle).await;
                Err(ExecError::Timeout {
                    node: node.id.clone(),
                    secs: timeout.as_secs(),
                })
            }
        }
    }

    /// Whether a live handle is currently pooled for the node.
    pub async fn is_pooled(&self, node_id: &str) -> bool {
        let slot = self.slots.lock().await.get(node_id).cloned();
        match slot {
            Some(slot) => slot.lock().await.is_some(),
            None => false,
        }
    }

    /// Closes every pooled session.
    pub async fn close_all(&self) {
        let slots: Vec<_> = self.slots.lock().await.drain().collect();
        for (node, slot) in slots {
            if let Some(handle) = slot.lock().await.take() {
                info!(node = %node, "Closing SSH session.");
                close_handle(handle).await;
            }
        }
    }

    async fn slot(&self, node_id: &str) -> Arc<Mutex<Option<Handle>>> {
        let mut slots = self.slots.lock().await;
        Arc::clone(slots.entry(node_id.to_string()).or_default())
    }

    async fn acquire(&self, node: &Node) -> Result<Handle, ExecError> {
        let slot = self.slot(&node.id).await;
        let mut guard = slot.lock().await;

        if let Some(handle) = guard.as_ref() {
            if handle.check().await {
                return Ok(Arc::clone(handle));
            }
            warn!(node = %node.id, "Pooled session failed its health check; reconnecting.");
            if let Some(stale) = guard.take() {
                close_handle(stale).await;
            }
        }

        let handle: Handle = Arc::new(self.connect_with_retries(node).await?);
        *guard = Some(Arc::clone(&handle));
        Ok(handle)
    }

    async fn connect_with_retries(&self, node: &Node) -> Result<Box<dyn Session>, ExecError> {
        let attempts = self.settings.connect_retries.max(1);
        let mut backoff = self.settings.connect_backoff;
        let mut attempt = 1;
        loop {
            match self.connector.connect(node).await {
                Ok(session) => {
                    info!(node = %node.id, attempt, "Connected to node.");
                    return Ok(session);
                }
                Err(err) if attempt < attempts => {
                    warn!(node = %node.id, attempt, "Failed to connect: {}; retrying in {:?}.", err, backoff);
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                    attempt += 1;
                }
                Err(err) => {
                    warn!(node = %node.id, attempt, "Giving up connecting: {}", err);
                    return Err(err);
                }
            }
        }
    }

    /// Drops the pooled handle if it is still the one that failed.
    async fn discard(&self, node_id: &str, failed: &Handle) {
        let slot = self.slot(node_id).await;
        let mut guard = slot.lock().await;
        let same = guard
            .as_ref()
            .map(|current| Arc::ptr_eq(current, failed))
            .unwrap_or(false);
        let taken = if same { guard.take() } else { None };
        drop(guard);
        if let Some(handle) = taken {
            debug!(node = %node_id, "Discarding broken session.");
            close_handle(handle).await;
        }
    }
}

/// Closes the session once no running command holds it anymore.
async fn close_handle(handle: Handle) {
    if let Ok(session) = Arc::try_unwrap(handle) {
        session.close().await;
    }
}
