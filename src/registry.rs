//! Node Registry.
//!
//! Keeps the last known reachability of every node in memory and mirrors each change into the
//! job store, so an Offline node stays Offline across restarts until it is tested again.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::{EngineError, ExecError, StoreError};
use crate::executor::Executor;
use crate::node::{parse_dataset_listing, Capabilities, Dataset, Node, NodeStatus, ProbeReport, Reachability};
use crate::session::RemoteCommand;
use crate::store::JobStore;

const PROBE_COMMAND: &str = "hostname; \
     command -v sanoid >/dev/null 2>&1 && echo sanoid=yes || echo sanoid=no; \
     command -v syncoid >/dev/null 2>&1 && echo syncoid=yes || echo syncoid=no";

const LIST_COMMAND: &str = "zfs list -H -o name,used,avail,mountpoint -t filesystem,volume";

pub struct NodeRegistry {
    executor: Arc<Executor>,
    store: Arc<dyn JobStore>,
    probe_timeout: Duration,
    statuses: RwLock<HashMap<String, NodeStatus>>,
}

impl NodeRegistry {
    /// Restores the persisted statuses.
    pub fn load(
        executor: Arc<Executor>,
        store: Arc<dyn JobStore>,
        probe_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let statuses = store.node_statuses()?.into_iter().collect();
        Ok(Self {
            executor,
            store,
            probe_timeout,
            statuses: RwLock::new(statuses),
        })
    }

    pub async fn status(&self, node_id: &str) -> NodeStatus {
        self.statuses
            .read()
            .await
            .get(node_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn is_offline(&self, node_id: &str) -> bool {
        self.status(node_id).await.reachability == Reachability::Offline
    }

    /// Round-trips a probe command through the executor and records the outcome.
    pub async fn test(&self, node: &Node) -> Result<ProbeReport, StoreError> {
        let probe = RemoteCommand::new(PROBE_COMMAND);
        let result = self
            .executor
            .run_with_timeout(node, &probe, self.probe_timeout)
            .await
            .and_then(|output| output.check(&node.id));
        let now = Utc::now();
        let report = match result {
            Ok(output) => {
                let (hostname, capabilities) = parse_probe(&output.stdout);
                ProbeReport {
                    node: node.id.clone(),
                    reachability: Reachability::Online,
                    capabilities: Some(capabilities),
                    message: hostname,
                }
            }
            Err(err @ ExecError::Remote { .. }) => {
                // The node answered; the probe script itself failed.
                ProbeReport {
                    node: node.id.clone(),
                    reachability: Reachability::Online,
                    capabilities: None,
                    message: err.to_string(),
                }
            }
            Err(err) => ProbeReport {
                node: node.id.clone(),
                reachability: Reachability::Offline,
                capabilities: None,
                message: err.to_string(),
            },
        };
        self.update(
            &node.id,
            NodeStatus {
                reachability: report.reachability,
                capabilities: report.capabilities,
                checked_at: Some(now),
                message: Some(report.message.clone()),
            },
        )
        .await?;
        Ok(report)
    }

    /// Records a connection failure observed outside an explicit test.
    pub async fn mark_offline(&self, node_id: &str, reason: &str) -> Result<(), StoreError> {
        let previous = self.status(node_id).await;
        self.update(
            node_id,
            NodeStatus {
                reachability: Reachability::Offline,
                capabilities: previous.capabilities,
                checked_at: Some(Utc::now()),
                message: Some(reason.to_string()),
            },
        )
        .await
    }

    /// Tests Offline nodes whose last check is older than `interval`.
    pub async fn reprobe_offline(
        &self,
        nodes: &[Node],
        interval: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<ProbeReport>, StoreError> {
        let interval = chrono::Duration::from_std(interval).unwrap_or(chrono::Duration::zero());
        let mut reports = Vec::new();
        for node in nodes {
            let status = self.status(&node.id).await;
            let stale = status
                .checked_at
                .map(|at| now - at >= interval)
                .unwrap_or(true);
            if status.reachability == Reachability::Offline && stale {
                info!(node = %node.id, "Re-probing offline node.");
                reports.push(self.test(node).await?);
            }
        }
        Ok(reports)
    }

    /// Lists the datasets on a node together with their bound policies.
    pub async fn discover(&self, node: &Node) -> Result<Vec<Dataset>, EngineError> {
        let output = match self
            .executor
            .run_checked(node, &RemoteCommand::new(LIST_COMMAND))
            .await
        {
            Ok(output) => output,
            Err(err) => {
                if matches!(err, ExecError::Connect { .. }) {
                    self.mark_offline(&node.id, &err.to_string()).await?;
                }
                return Err(err.into());
            }
        };
        let bindings: HashMap<String, String> = self
            .store
            .bindings()?
            .into_iter()
            .filter(|b| b.node == node.id)
            .map(|b| (b.dataset, b.policy.name))
            .collect();
        let mut datasets = parse_dataset_listing(&node.id, &output.stdout);
        for dataset in &mut datasets {
            dataset.policy = bindings.get(&dataset.path).cloned();
        }
        Ok(datasets)
    }

    async fn update(&self, node_id: &str, status: NodeStatus) -> Result<(), StoreError> {
        self.store.save_node_status(node_id, &status)?;
        let mut statuses = self.statuses.write().await;
        let previous = statuses
            .get(node_id)
            .map(|s| s.reachability)
            .unwrap_or_default();
        if previous != status.reachability {
            match status.reachability {
                Reachability::Offline => warn!(
                    node = %node_id,
                    from = %previous,
                    "Node is now offline: {}",
                    status.message.as_deref().unwrap_or("")
                ),
                _ => info!(node = %node_id, from = %previous, to = %status.reachability, "Node reachability changed."),
            }
        }
        let capabilities = status.capabilities.or_else(|| {
            statuses.get(node_id).and_then(|s| s.capabilities)
        });
        statuses.insert(
            node_id.to_string(),
            NodeStatus {
                capabilities,
                ..status
            },
        );
        Ok(())
    }
}

/// First line is the hostname, then `tool=yes|no` lines.
fn parse_probe(stdout: &str) -> (String, Capabilities) {
    let mut lines = stdout.lines().map(str::trim).filter(|l| !l.is_empty());
    let hostname = lines.next().unwrap_or_default().to_string();
    let mut capabilities = Capabilities::default();
    for line in lines {
        match line {
            "sanoid=yes" => capabilities.snapshot_tool = true,
            "syncoid=yes" => capabilities.replication_tool = true,
            _ => {}
        }
    }
    (hostname, capabilities)
}
