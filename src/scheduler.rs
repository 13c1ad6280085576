//! The scheduler control loop and its worker pool.
//!
//! Every tick re-reads the inventory, evaluates each enabled job's schedule over the window
//! since the previous tick, and creates a `pending` run for every due job. Creating the run is
//! the job store's compare-and-swap, so a job that still has a run in flight is skipped and
//! two triggers can never both proceed. Run ids are queued to a fixed pool of workers, so a
//! saturated pool delays runs but never drops them. Each tick also fails the runs whose owner
//! stopped sending heartbeats, in whatever process they were started.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{ErrorClass, StoreError};
use crate::inventory::{LiveInventory, Settings};
use crate::job::{JobRun, Trigger};
use crate::registry::NodeRegistry;
use crate::runner::Runner;
use crate::store::{BeginOutcome, JobStore, RunningScope};

/// What one tick did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    /// `(job, run id)` of every run created by this tick.
    pub dispatched: Vec<(String, i64)>,
    /// Due jobs skipped because a run was still in flight.
    pub skipped: Vec<String>,
    /// Pending runs created elsewhere and queued by this tick.
    pub adopted: Vec<i64>,
    /// Running runs whose owner stopped sending heartbeats, failed by this tick.
    pub abandoned: Vec<i64>,
}

pub struct Scheduler {
    live: Arc<LiveInventory>,
    store: Arc<dyn JobStore>,
    registry: Arc<NodeRegistry>,
    runner: Arc<Runner>,
    /// End of the last evaluated window, per job.
    cursors: Mutex<HashMap<String, DateTime<Utc>>>,
    /// Cursor for jobs that have never fired.
    started_at: DateTime<Utc>,
    queue_tx: flume::Sender<i64>,
    queue_rx: flume::Receiver<i64>,
    /// Runs queued or executing in this process.
    enqueued: Arc<Mutex<HashSet<i64>>>,
    reprobing: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(
        live: Arc<LiveInventory>,
        store: Arc<dyn JobStore>,
        registry: Arc<NodeRegistry>,
        runner: Arc<Runner>,
        started_at: DateTime<Utc>,
    ) -> Self {
        let (queue_tx, queue_rx) = flume::unbounded();
        Self {
            live,
            store,
            registry,
            runner,
            cursors: Mutex::new(HashMap::new()),
            started_at,
            queue_tx,
            queue_rx,
            enqueued: Arc::new(Mutex::new(HashSet::new())),
            reprobing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Evaluates every job over `(cursor, now]` and queues what is due.
    pub fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let inventory = self.live.refresh();
        let mut report = TickReport::default();
        // Heartbeats carry wall-clock time, so the sweep does too. A freed job can then fire in
        // this same tick.
        match fail_abandoned(self.store.as_ref(), &inventory.settings, Utc::now()) {
            Ok(failed) => report.abandoned = failed.into_iter().map(|run| run.id).collect(),
            Err(e) => error!("Failed to sweep abandoned runs: {}", e),
        }
        let mut cursors = match self.cursors.lock() {
            Ok(cursors) => cursors,
            Err(poisoned) => poisoned.into_inner(),
        };
        cursors.retain(|job, _| inventory.jobs.contains_key(job));

        for job in inventory.jobs.values() {
            if !job.enabled {
                cursors.insert(job.name.clone(), now);
                continue;
            }
            let cursor = match cursors.get(&job.name) {
                Some(cursor) => *cursor,
                None => match self.seed_cursor(&job.name) {
                    Ok(cursor) => cursor,
                    Err(e) => {
                        error!(job = %job.name, "Failed to read the last scheduled slot: {}", e);
                        continue;
                    }
                },
            };
            let slot = match job.schedule.due(cursor, now) {
                Some(slot) => slot,
                None => {
                    cursors.insert(job.name.clone(), now.max(cursor));
                    continue;
                }
            };
            match self.store.begin_run(&job.name, Trigger::Scheduled, Some(slot), now) {
                Ok(BeginOutcome::Created(run)) => {
                    info!(job = %job.name, run_id = run.id, slot = %slot, "Dispatching scheduled run.");
                    self.enqueue(run.id);
                    report.dispatched.push((job.name.clone(), run.id));
                    cursors.insert(job.name.clone(), now);
                }
                Ok(BeginOutcome::AlreadyActive(run_id)) => {
                    debug!(job = %job.name, run_id, slot = %slot, "Job still running; skipping slot.");
                    report.skipped.push(job.name.clone());
                    cursors.insert(job.name.clone(), now);
                }
                Err(e) => {
                    // The cursor stays put so the next tick retries this slot.
                    error!(job = %job.name, slot = %slot, "Failed to create run: {}", e);
                }
            }
        }
        drop(cursors);

        match self.store.pending_runs() {
            Ok(pending) => {
                for run in pending {
                    if self.enqueue(run.id) {
                        info!(job = %run.job, run_id = run.id, trigger = %run.trigger, "Adopted pending run.");
                        report.adopted.push(run.id);
                    }
                }
            }
            Err(e) => error!("Failed to list pending runs: {}", e),
        }
        report
    }

    fn seed_cursor(&self, job: &str) -> Result<DateTime<Utc>, StoreError> {
        Ok(self
            .store
            .last_scheduled_slot(job)?
            .unwrap_or(self.started_at))
    }

    /// Queues a run unless it is already queued or executing here. Returns whether it was queued.
    pub fn enqueue(&self, run_id: i64) -> bool {
        let mut enqueued = match self.enqueued.lock() {
            Ok(enqueued) => enqueued,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !enqueued.insert(run_id) {
            return false;
        }
        if self.queue_tx.send(run_id).is_err() {
            enqueued.remove(&run_id);
            return false;
        }
        true
    }

    /// Number of runs waiting for a worker.
    pub fn queued(&self) -> usize {
        self.queue_rx.len()
    }

    /// Spawns `count` workers that execute queued runs until `stop` flips to true.
    pub fn spawn_workers(&self, count: usize, stop: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        (0..count.max(1))
            .map(|worker| {
                let queue_rx = self.queue_rx.clone();
                let runner = Arc::clone(&self.runner);
                let live = Arc::clone(&self.live);
                let enqueued = Arc::clone(&self.enqueued);
                let mut stop = stop.clone();
                tokio::spawn(async move {
                    loop {
                        let run_id = tokio::select! {
                            biased;
                            _ = stop.changed() => break,
                            next = queue_rx.recv_async() => match next {
                                Ok(run_id) => run_id,
                                Err(_) => break,
                            },
                        };
                        let inventory = live.current();
                        match runner.execute(run_id, &inventory).await {
                            Ok(run) => debug!(worker, run_id, state = %run.state, "Worker finished run."),
                            Err(StoreError::InvalidTransition { from, .. }) => {
                                debug!(worker, run_id, state = %from, "Run was already taken or finished elsewhere.")
                            }
                            Err(e) => error!(worker, run_id, "Failed to record run: {}", e),
                        }
                        if let Ok(mut enqueued) = enqueued.lock() {
                            enqueued.remove(&run_id);
                        }
                        if *stop.borrow() {
                            break;
                        }
                    }
                    debug!(worker, "Worker stopped.");
                })
            })
            .collect()
    }

    /// Re-tests Offline nodes in the background if re-probing is configured and none is running.
    pub fn maybe_reprobe(&self, now: DateTime<Utc>) {
        let inventory = self.live.current();
        let interval = match inventory.settings.reprobe_offline() {
            Some(interval) => interval,
            None => return,
        };
        if self.reprobing.swap(true, Ordering::SeqCst) {
            return;
        }
        let registry = Arc::clone(&self.registry);
        let reprobing = Arc::clone(&self.reprobing);
        tokio::spawn(async move {
            let nodes: Vec<_> = inventory.nodes.values().cloned().collect();
            if let Err(e) = registry.reprobe_offline(&nodes, interval, now).await {
                warn!("Failed to re-probe offline nodes: {}", e);
            }
            reprobing.store(false, Ordering::SeqCst);
        });
    }

    /// Ticks until `stop` flips to true, then drains the workers.
    pub async fn run(&self, mut stop: watch::Receiver<bool>) -> Result<(), StoreError> {
        let settings = self.live.current().settings.clone();
        let workers = self.spawn_workers(settings.workers, stop.clone());
        info!(workers = settings.workers, tick = ?settings.tick_interval(), "Scheduler started.");

        loop {
            let now = Utc::now();
            let report = self.tick(now);
            if !report.dispatched.is_empty() || !report.adopted.is_empty() {
                debug!(
                    dispatched = report.dispatched.len(),
                    adopted = report.adopted.len(),
                    skipped = report.skipped.len(),
                    queued = self.queued(),
                    "Tick finished."
                );
            }
            self.maybe_reprobe(now);

            let interval = self.live.current().settings.tick_interval();
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = stop.changed() => break,
            }
            if *stop.borrow() {
                break;
            }
        }

        self.drain(workers, self.live.current().settings.shutdown_grace())
            .await
    }

    /// Waits up to `grace` for workers to finish their current runs, then aborts them and fails
    /// the runs they left behind.
    async fn drain(&self, workers: Vec<JoinHandle<()>>, grace: Duration) -> Result<(), StoreError> {
        info!(grace = ?grace, "Waiting for in-flight runs to finish.");
        let aborts: Vec<_> = workers.iter().map(|w| w.abort_handle()).collect();
        if tokio::time::timeout(grace, join_all(workers)).await.is_err() {
            warn!("Grace period expired; abandoning in-flight runs.");
            for abort in aborts {
                abort.abort();
            }
        }
        let interrupted = self.store.fail_running(
            RunningScope::OwnedBy(self.runner.owner()),
            ErrorClass::Interrupted,
            "engine shut down before the run finished",
            Utc::now(),
        )?;
        for run in &interrupted {
            warn!(job = %run.job, run_id = run.id, "Run interrupted by shutdown.");
        }
        Ok(())
    }
}

/// Fails every `running` run whose owner missed three heartbeats, wherever it was started.
pub(crate) fn fail_abandoned(
    store: &dyn JobStore,
    settings: &Settings,
    now: DateTime<Utc>,
) -> Result<Vec<JobRun>, StoreError> {
    let stale_after = chrono::Duration::from_std(settings.stale_after())
        .unwrap_or_else(|_| chrono::Duration::seconds(45));
    let failed = store.fail_running(
        RunningScope::StaleSince(now - stale_after),
        ErrorClass::Interrupted,
        "the process executing the run stopped responding",
        now,
    )?;
    for run in &failed {
        warn!(job = %run.job, run_id = run.id, "Marked abandoned run as interrupted.");
    }
    Ok(failed)
}
