//! The engine: what operators and other services call.
//!
//! Wires the inventory, the job store, the executor, the node registry, the runner and the
//! scheduler together, and exposes the operations of the orchestrator.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tracing::info;

use crate::error::{EngineError, InventoryError};
use crate::executor::Executor;
use crate::inventory::{valid_dataset, ConfigStore, Inventory, LiveInventory};
use crate::job::{JobRun, RunFilter, StepRecord, Trigger};
use crate::node::{Dataset, Node, ProbeReport};
use crate::notify::{AuditEvent, AuditSink, Notifier};
use crate::policy::{PolicyEngine, PolicyOutcome, SnapshotPolicy};
use crate::registry::NodeRegistry;
use crate::runner::Runner;
use crate::scheduler::{fail_abandoned, Scheduler};
use crate::session::Connector;
use crate::store::{BeginOutcome, JobStore, PolicyBinding};

/// Answer to a manual trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// A new run was created.
    Accepted(i64),
    /// The job already has this run in flight; nothing was created.
    AlreadyRunning(i64),
}

/// Collaborators the engine is built from.
pub struct EngineParts {
    pub config: Arc<dyn ConfigStore>,
    pub store: Arc<dyn JobStore>,
    pub connector: Arc<dyn Connector>,
    pub notifier: Arc<dyn Notifier>,
    pub audit: Arc<dyn AuditSink>,
}

pub struct Engine {
    live: Arc<LiveInventory>,
    store: Arc<dyn JobStore>,
    executor: Arc<Executor>,
    registry: Arc<NodeRegistry>,
    runner: Arc<Runner>,
    scheduler: Arc<Scheduler>,
    audit: Arc<dyn AuditSink>,
}

impl Engine {
    pub fn new(parts: EngineParts) -> Result<Self, EngineError> {
        let live = Arc::new(LiveInventory::load(parts.config)?);
        let settings = live.current().settings.clone();
        let executor = Arc::new(Executor::new(parts.connector, settings.executor()));
        let registry = Arc::new(NodeRegistry::load(
            Arc::clone(&executor),
            Arc::clone(&parts.store),
            settings.probe_timeout(),
        )?);
        let runner = Arc::new(Runner::new(
            Arc::clone(&executor),
            Arc::clone(&registry),
            Arc::clone(&parts.store),
            parts.notifier,
        ));
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&live),
            Arc::clone(&parts.store),
            Arc::clone(&registry),
            Arc::clone(&runner),
            Utc::now(),
        ));
        Ok(Self {
            live,
            store: parts.store,
            executor,
            registry,
            runner,
            scheduler,
            audit: parts.audit,
        })
    }

    pub fn inventory(&self) -> Arc<Inventory> {
        self.live.current()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    /// Fails the runs left `running` by a process that is gone. Runs whose owner still sends
    /// heartbeats, in this process or another, are left alone.
    pub fn reconcile(&self) -> Result<Vec<JobRun>, EngineError> {
        let settings = self.live.current().settings.clone();
        Ok(fail_abandoned(self.store.as_ref(), &settings, Utc::now())?)
    }

    /// Requests an immediate run of a job, outside its schedule.
    pub fn trigger_run(&self, job: &str, requested_by: &str) -> Result<TriggerOutcome, EngineError> {
        let inventory = self.live.refresh();
        if inventory.job(job).is_none() {
            return Err(EngineError::UnknownJob(job.to_string()));
        }
        let now = Utc::now();
        let outcome = match self.store.begin_run(job, Trigger::Manual, None, now)? {
            BeginOutcome::Created(run) => {
                info!(job, run_id = run.id, requested_by, "Manual run accepted.");
                self.scheduler.enqueue(run.id);
                TriggerOutcome::Accepted(run.id)
            }
            BeginOutcome::AlreadyActive(run_id) => {
                info!(job, run_id, requested_by, "Manual run rejected; job is already running.");
                TriggerOutcome::AlreadyRunning(run_id)
            }
        };
        let (accepted, run_id) = match outcome {
            TriggerOutcome::Accepted(id) => (true, id),
            TriggerOutcome::AlreadyRunning(id) => (false, id),
        };
        self.audit.record(&AuditEvent {
            job: job.to_string(),
            requested_by: requested_by.to_string(),
            accepted,
            run_id,
            at: now,
        });
        Ok(outcome)
    }

    /// Executes a pending run in the calling task instead of a worker.
    /// Fails with an invalid transition if someone else already took it.
    pub async fn execute_run(&self, run_id: i64) -> Result<JobRun, EngineError> {
        let inventory = self.live.current();
        Ok(self.runner.execute(run_id, &inventory).await?)
    }

    pub fn run_history(&self, filter: &RunFilter) -> Result<Vec<JobRun>, EngineError> {
        Ok(self.store.history(filter)?)
    }

    pub fn run(&self, run_id: i64) -> Result<Option<JobRun>, EngineError> {
        Ok(self.store.run(run_id)?)
    }

    pub fn run_steps(&self, run_id: i64) -> Result<Vec<StepRecord>, EngineError> {
        Ok(self.store.steps(run_id)?)
    }

    pub async fn test_node(&self, node_id: &str) -> Result<ProbeReport, EngineError> {
        let node = self.node(node_id)?;
        Ok(self.registry.test(&node).await?)
    }

    pub async fn discover_datasets(&self, node_id: &str) -> Result<Vec<Dataset>, EngineError> {
        let node = self.node(node_id)?;
        self.registry.discover(&node).await
    }

    /// Binds a snapshot policy to a dataset and writes it into the node's configuration.
    pub async fn apply_policy(
        &self,
        node_id: &str,
        dataset: &str,
        policy_name: &str,
    ) -> Result<PolicyOutcome, EngineError> {
        let inventory = self.live.refresh();
        let node = inventory
            .node(node_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownNode(node_id.to_string()))?;
        let policy = inventory
            .policies
            .get(policy_name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownPolicy(policy_name.to_string()))?;
        if !valid_dataset(dataset) {
            return Err(InventoryError::Invalid(format!("invalid dataset path '{}'", dataset)).into());
        }
        self.check_policy_unchanged(&policy)?;

        let engine = PolicyEngine::new(
            &self.executor,
            &inventory.tools,
            &inventory.settings.sanoid_config,
        );
        let outcome = engine.apply(&node, dataset, &policy).await?;
        self.store.bind_policy(&PolicyBinding {
            node: node.id.clone(),
            dataset: dataset.to_string(),
            policy,
            applied_at: Utc::now(),
        })?;
        Ok(outcome)
    }

    /// A template that is already bound somewhere must keep its counts.
    fn check_policy_unchanged(&self, policy: &SnapshotPolicy) -> Result<(), EngineError> {
        let redefined = self
            .store
            .bindings()?
            .into_iter()
            .any(|binding| binding.policy.name == policy.name && !binding.policy.same_retention(policy));
        if redefined {
            return Err(EngineError::PolicyInUse(policy.name.clone()));
        }
        Ok(())
    }

    /// Deletes finished runs older than `days` days.
    pub fn prune(&self, days: u32) -> Result<usize, EngineError> {
        let deleted = self.store.prune(days, Utc::now())?;
        info!(days, deleted, "Pruned run history.");
        Ok(deleted)
    }

    /// Runs the scheduler until `stop` flips to true, then closes every session.
    pub async fn serve(&self, stop: watch::Receiver<bool>) -> Result<(), EngineError> {
        self.reconcile()?;
        let result = self.scheduler.run(stop).await;
        self.executor.close_all().await;
        info!("Engine stopped.");
        Ok(result?)
    }

    fn node(&self, node_id: &str) -> Result<Node, EngineError> {
        self.live
            .refresh()
            .node(node_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownNode(node_id.to_string()))
    }
}
