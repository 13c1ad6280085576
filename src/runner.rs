//! Replication Job Runner.
//!
//! Drives one job run from `running` to a terminal state: reachability check, optional parent
//! creation, the replication itself, and the optional registration of the dependent guest.
//! Every failure is captured on the run. Only storage failures escape.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use chrono::Utc;
use regex::Regex;
use tracing::{info, warn};

use crate::error::{ErrorClass, ExecError, ReplicationFailure, RunError, StoreError};
use crate::executor::Executor;
use crate::inventory::Inventory;
use crate::job::{JobRun, RunOutcome, SyncJob};
use crate::node::Node;
use crate::notify::Notifier;
use crate::register::{Registration, RegistrationSaga};
use crate::registry::NodeRegistry;
use crate::session::RemoteCommand;
use crate::store::JobStore;
use crate::tools::ReplicateParams;

/// A failed attempt, with whatever was transferred before the failure.
struct Failure {
    error: RunError,
    bytes: Option<u64>,
}

impl From<RunError> for Failure {
    fn from(error: RunError) -> Self {
        Self { error, bytes: None }
    }
}

/// Unique name of this runner in the shared store: process id, start time and a counter.
fn instance_id() -> String {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    format!(
        "{}-{}-{}",
        std::process::id(),
        Utc::now().timestamp_millis(),
        NEXT.fetch_add(1, Ordering::Relaxed)
    )
}

pub struct Runner {
    /// Recorded on every run this runner claims.
    owner: String,
    executor: Arc<Executor>,
    registry: Arc<NodeRegistry>,
    store: Arc<dyn JobStore>,
    notifier: Arc<dyn Notifier>,
}

impl Runner {
    pub fn new(
        executor: Arc<Executor>,
        registry: Arc<NodeRegistry>,
        store: Arc<dyn JobStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            owner: instance_id(),
            executor,
            registry,
            store,
            notifier,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Takes a pending run to `running`, attempts it, and records the outcome.
    pub async fn execute(&self, run_id: i64, inventory: &Inventory) -> Result<JobRun, StoreError> {
        let run = self.store.mark_running(run_id, &self.owner, Utc::now())?;
        info!(job = %run.job, run_id, trigger = %run.trigger, owner = %self.owner, "Run started.");

        let outcome = match inventory.job(&run.job) {
            Some(job) => {
                let attempt = self.attempt(run_id, job, inventory);
                tokio::pin!(attempt);
                let mut beat = tokio::time::interval(inventory.settings.heartbeat_interval());
                // The first tick completes immediately; mark_running already stamped the run.
                beat.tick().await;
                let result = loop {
                    tokio::select! {
                        result = &mut attempt => break result,
                        _ = beat.tick() => {
                            if let Err(e) = self.store.heartbeat(run_id, Utc::now()) {
                                warn!(run_id, "Failed to record heartbeat: {}", e);
                            }
                        }
                    }
                };
                match result {
                    Ok(bytes) => RunOutcome::success(bytes),
                    Err(failure) => RunOutcome::failed(
                        failure.error.class,
                        failure.error.message,
                        failure.bytes,
                    ),
                }
            }
            None => RunOutcome::failed(
                ErrorClass::ReplicationFailed(ReplicationFailure::Other),
                format!("job '{}' is no longer in the inventory", run.job),
                None,
            ),
        };

        let finished = self.store.finish_run(run_id, &outcome, Utc::now())?;
        self.notifier.run_finished(&finished);
        Ok(finished)
    }

    async fn attempt(
        &self,
        run_id: i64,
        job: &SyncJob,
        inventory: &Inventory,
    ) -> Result<Option<u64>, Failure> {
        let source = self.resolve(inventory, &job.source.node).await?;
        let destination = self.resolve(inventory, &job.destination.node).await?;

        if let Some(capabilities) = self.registry.status(&source.id).await.capabilities {
            if !capabilities.replication_tool {
                return Err(RunError::new(
                    ErrorClass::ToolMissing,
                    format!("replication tool not found on node {}", source.id),
                )
                .into());
            }
        }

        if job.options.create_parent {
            if let Some(parent) = job.destination.parent() {
                let command = RemoteCommand::new(format!("zfs create -p {}", parent));
                match self.executor.run_checked(destination, &command).await {
                    Ok(_) => self.journal(run_id, "create_parent", true, parent),
                    Err(err) => {
                        let error = self.exec_failure(destination, &err).await;
                        self.journal(run_id, "create_parent", false, &error.message);
                        return Err(error.into());
                    }
                }
            }
        }

        let bytes = self.replicate(run_id, job, source, destination, inventory).await?;

        if job.options.register_dependent {
            let saga = RegistrationSaga::new(
                &self.executor,
                &inventory.tools,
                &self.registry,
                self.store.as_ref(),
                run_id,
            );
            let registration = Registration {
                job,
                source,
                destination,
                staging_dir: &inventory.settings.staging_dir,
            };
            saga.run(&registration)
                .await
                .map_err(|error| Failure { error, bytes })?;
        }
        Ok(bytes)
    }

    async fn resolve<'i>(&self, inventory: &'i Inventory, id: &str) -> Result<&'i Node, RunError> {
        let node = inventory.node(id).ok_or_else(|| {
            RunError::new(
                ErrorClass::NodeUnreachable,
                format!("node '{}' is not in the inventory", id),
            )
        })?;
        if self.registry.is_offline(id).await {
            return Err(RunError::new(
                ErrorClass::NodeUnreachable,
                format!("node {} is offline; test it to bring it back", id),
            ));
        }
        Ok(node)
    }

    async fn replicate(
        &self,
        run_id: i64,
        job: &SyncJob,
        source: &Node,
        destination: &Node,
        inventory: &Inventory,
    ) -> Result<Option<u64>, RunError> {
        let target = format!("{}:{}", destination.ssh_target(), job.destination.dataset);
        let params = ReplicateParams {
            recursive: job.options.recursive,
            compress: job.options.compression.as_str(),
            mbuffer_size: job.options.mbuffer_size.as_deref(),
            no_sync_snap: job.options.no_sync_snap,
            force_delete: job.options.force_delete,
            ssh_key: destination.replication_key.as_deref(),
            ssh_port: (destination.port != 22).then_some(destination.port),
            source: &job.source.dataset,
            target: &target,
        };
        let line = inventory.tools.replicate(&params).map_err(|e| {
            RunError::new(ErrorClass::ReplicationFailed(ReplicationFailure::Other), e.to_string())
        })?;

        info!(job = %job.name, run_id, from = %job.source, to = %job.destination, "Replicating.");
        let result = self
            .executor
            .run(source, &RemoteCommand::new(line))
            .await
            .and_then(|output| output.check(&source.id));
        match result {
            Ok(output) => {
                let bytes = parse_transferred_bytes(&format!("{}\n{}", output.stdout, output.stderr));
                let message = match bytes {
                    Some(bytes) => format!("{} bytes transferred in {:?}", bytes, output.duration),
                    None => format!("finished in {:?}", output.duration),
                };
                self.journal(run_id, "replicate", true, &message);
                Ok(bytes)
            }
            Err(err) => {
                let error = self.exec_failure(source, &err).await;
                self.journal(run_id, "replicate", false, &error.message);
                Err(error)
            }
        }
    }

    /// Classifies an executor failure and marks the node Offline when it could not be reached.
    async fn exec_failure(&self, node: &Node, err: &ExecError) -> RunError {
        if matches!(err, ExecError::Connect { .. }) {
            if let Err(e) = self.registry.mark_offline(&node.id, &err.to_string()).await {
                warn!(node = %node.id, "Failed to record node as offline: {}", e);
            }
        }
        let class = match err {
            ExecError::Remote { stderr, .. } => {
                ErrorClass::ReplicationFailed(classify_replication_failure(stderr))
            }
            _ => ErrorClass::ReplicationFailed(ReplicationFailure::Other),
        };
        RunError::from_exec(err, class)
    }

    fn journal(&self, run_id: i64, step: &str, ok: bool, message: &str) {
        if let Err(e) = self.store.record_step(run_id, step, ok, message, Utc::now()) {
            warn!(run_id, step, "Failed to record run step: {}", e);
        }
    }
}

/// Sorts a replication error message into a failure kind. The message itself is kept verbatim.
pub fn classify_replication_failure(message: &str) -> ReplicationFailure {
    let message = message.to_lowercase();
    let any = |needles: &[&str]| needles.iter().any(|n| message.contains(n));
    if any(&["does not exist", "no such dataset"]) {
        ReplicationFailure::NotFound
    } else if any(&[
        "destination has snapshots",
        "has been modified",
        "must be rolled back",
        "already exists",
    ]) {
        ReplicationFailure::Conflict
    } else if any(&["out of space", "no space left", "insufficient"]) {
        ReplicationFailure::InsufficientSpace
    } else {
        ReplicationFailure::Other
    }
}

fn transfer_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?i)\b(\d[\d,]*)\s+bytes\s+transferred",
            r"(?i)\b(\d[\d,]*(?:\.\d+)?)\s*([KMGTP])?(?:i?B)?\s+transferred",
            r"(?i)\bsent\s+(\d[\d,]*(?:\.\d+)?)\s*([KMGTP])?(?:i?B)?\b",
            r"(?i)\b(\d[\d,]*(?:\.\d+)?)\s*([KMGTP])?(?:i?B)?\s+total\b",
        ]
        .iter()
        .filter_map(|pattern| Regex::new(pattern).ok())
        .collect()
    })
}

/// Extracts the number of bytes the replication tool reports as transferred.
///
/// Each line contributes at most one figure, so recursive replications that report per
/// dataset are summed. Units are binary.
pub fn parse_transferred_bytes(output: &str) -> Option<u64> {
    let mut total: Option<u64> = None;
    for line in output.lines() {
        let figure = transfer_patterns().iter().find_map(|pattern| {
            let caps = pattern.captures(line)?;
            let number: f64 = caps.get(1)?.as_str().replace(',', "").parse().ok()?;
            let unit = caps.get(2).map(|m| m.as_str().to_ascii_uppercase());
            let scale: f64 = match unit.as_deref() {
                None => 1.0,
                Some("K") => 1024.0,
                Some("M") => 1024f64.powi(2),
                Some("G") => 1024f64.powi(3),
                Some("T") => 1024f64.powi(4),
                Some(_) => 1024f64.powi(5),
            };
            Some((number * scale).round() as u64)
        });
        if let Some(bytes) = figure {
            total = Some(total.unwrap_or(0).saturating_add(bytes));
        }
    }
    total
}
