//! End-to-end tests for scheduling, replication and registration against a scripted fleet.

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tempfile::NamedTempFile;
use tokio::sync::watch;

use zsync_orchestrator::error::{InventoryError, RegistrationStep, ReplicationFailure};
use zsync_orchestrator::{
    AuditEvent, AuditSink, BeginOutcome, CommandOutput, ConfigStore, Connector, Engine, EngineError,
    EngineParts, ErrorClass, ExecError, Executor, ExecutorSettings, FileInventory, Inventory,
    JobRun, JobStore, LiveInventory, Node, NodeRegistry, Notifier, PolicyOutcome, Reachability,
    RemoteCommand, RunFilter, RunState, Runner, Scheduler, Session, SqliteJobStore, Trigger,
    TriggerOutcome,
};

/// Record of an executed command for testing.
#[derive(Debug, Clone)]
pub struct ExecutedCommand {
    pub node: String,
    pub command: String,
    pub stdin: Option<String>,
    #[allow(dead_code)]
    pub timestamp: Instant,
}

/// Canned reply for commands starting with `prefix` on `node`.
#[derive(Debug, Clone)]
struct Rule {
    node: String,
    prefix: String,
    code: i32,
    output: String,
    delay_ms: u64,
}

/// Shared state behind every mock session: scripted replies, a tiny file system per node and
/// a log of what ran.
#[derive(Default)]
pub struct Remote {
    rules: Mutex<Vec<Rule>>,
    files: Mutex<HashMap<String, String>>,
    executed: Mutex<Vec<ExecutedCommand>>,
    unreachable: Mutex<HashSet<String>>,
    sessions: Mutex<Vec<Arc<AtomicBool>>>,
    connects: AtomicUsize,
}

impl Remote {
    /// Non-zero codes put `output` on stderr, zero on stdout.
    fn on(&self, node: &str, prefix: &str, code: i32, output: &str) {
        self.on_slow(node, prefix, code, output, 0);
    }

    fn on_slow(&self, node: &str, prefix: &str, code: i32, output: &str, delay_ms: u64) {
        self.rules.lock().unwrap().push(Rule {
            node: node.to_string(),
            prefix: prefix.to_string(),
            code,
            output: output.to_string(),
            delay_ms,
        });
    }

    fn clear_rules(&self) {
        self.rules.lock().unwrap().clear();
    }

    fn write_file(&self, node: &str, path: &str, text: &str) {
        self.files
            .lock()
            .unwrap()
            .insert(format!("{}:{}", node, path), text.to_string());
    }

    fn file(&self, node: &str, path: &str) -> Option<String> {
        self.files
            .lock()
            .unwrap()
            .get(&format!("{}:{}", node, path))
            .cloned()
    }

    fn executed(&self) -> Vec<ExecutedCommand> {
        self.executed.lock().unwrap().clone()
    }

    fn commands(&self, node: &str) -> Vec<String> {
        self.executed()
            .into_iter()
            .filter(|c| c.node == node)
            .map(|c| c.command)
            .collect()
    }

    fn set_unreachable(&self, node: &str, unreachable: bool) {
        let mut nodes = self.unreachable.lock().unwrap();
        if unreachable {
            nodes.insert(node.to_string());
        } else {
            nodes.remove(node);
        }
    }

    /// Makes every session opened so far fail its health check.
    fn kill_sessions(&self) {
        for alive in self.sessions.lock().unwrap().iter() {
            alive.store(false, Ordering::SeqCst);
        }
    }

    fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    fn rule(&self, node: &str, line: &str) -> Option<Rule> {
        self.rules
            .lock()
            .unwrap()
            .iter()
            .find(|rule| rule.node == node && line.starts_with(&rule.prefix))
            .cloned()
    }

    /// Interprets the handful of shell idioms the engine emits.
    fn shell(&self, node: &str, line: &str, stdin: Option<&str>) -> (i32, String, String) {
        let key = |path: &str| format!("{}:{}", node, path);
        let mut files = self.files.lock().unwrap();
        let mut stdout = String::new();
        for segment in line.split(" && ") {
            let words: Vec<&str> = segment.split_whitespace().collect();
            match words.as_slice() {
                ["test", "-e", path] => {
                    if !files.contains_key(&key(path)) {
                        return (1, stdout, String::new());
                    }
                }
                ["cat", ">", path, ..] => {
                    files.insert(key(path), stdin.unwrap_or_default().to_string());
                }
                ["test", "!", "-e", path, "||", "cat", _] => {
                    if let Some(text) = files.get(&key(path)) {
                        stdout.push_str(text);
                    }
                }
                ["cat", path] => match files.get(&key(path)) {
                    Some(text) => stdout.push_str(text),
                    None => {
                        return (1, stdout, format!("cat: {}: No such file or directory", path));
                    }
                },
                ["mv", from, to] => match files.remove(&key(from)) {
                    Some(text) => {
                        files.insert(key(to), text);
                    }
                    None => return (1, stdout, format!("mv: cannot stat '{}'", from)),
                },
                ["rm", "-f", path] => {
                    files.remove(&key(path));
                }
                _ => {}
            }
        }
        (0, stdout, String::new())
    }
}

pub struct MockSession {
    node: String,
    remote: Arc<Remote>,
    alive: Arc<AtomicBool>,
}

#[async_trait]
impl Session for MockSession {
    async fn run(&self, command: &RemoteCommand) -> Result<CommandOutput, ExecError> {
        let started = Instant::now();
        self.remote.executed.lock().unwrap().push(ExecutedCommand {
            node: self.node.clone(),
            command: command.line.clone(),
            stdin: command.stdin.clone(),
            timestamp: started,
        });

        let (code, stdout, stderr) = match self.remote.rule(&self.node, &command.line) {
            Some(rule) => {
                if rule.delay_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(rule.delay_ms)).await;
                }
                if rule.code == 0 {
                    (0, rule.output, String::new())
                } else {
                    (rule.code, String::new(), rule.output)
                }
            }
            None => self
                .remote
                .shell(&self.node, &command.line, command.stdin.as_deref()),
        };
        Ok(CommandOutput {
            code,
            stdout,
            stderr,
            duration: started.elapsed(),
        })
    }

    async fn check(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

pub struct MockConnector(Arc<Remote>);

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, node: &Node) -> Result<Box<dyn Session>, ExecError> {
        self.0.connects.fetch_add(1, Ordering::SeqCst);
        if self.0.unreachable.lock().unwrap().contains(&node.id) {
            return Err(ExecError::Connect {
                node: node.id.clone(),
                reason: "Connection refused".to_string(),
            });
        }
        let alive = Arc::new(AtomicBool::new(true));
        self.0.sessions.lock().unwrap().push(Arc::clone(&alive));
        Ok(Box::new(MockSession {
            node: node.id.clone(),
            remote: Arc::clone(&self.0),
            alive,
        }))
    }
}

/// Inventory held in memory, replaceable between ticks.
pub struct TextInventory(Mutex<String>);

impl TextInventory {
    fn new(text: &str) -> Arc<Self> {
        Arc::new(Self(Mutex::new(text.to_string())))
    }

    fn set(&self, text: &str) {
        *self.0.lock().unwrap() = text.to_string();
    }
}

impl ConfigStore for TextInventory {
    fn load(&self) -> Result<Inventory, InventoryError> {
        self.0.lock().unwrap().parse()
    }
}

/// Collects finished runs and audit events.
#[derive(Default)]
pub struct Recorder {
    runs: Mutex<Vec<JobRun>>,
    audits: Mutex<Vec<AuditEvent>>,
}

impl Notifier for Recorder {
    fn run_finished(&self, run: &JobRun) {
        self.runs.lock().unwrap().push(run.clone());
    }
}

impl AuditSink for Recorder {
    fn record(&self, event: &AuditEvent) {
        self.audits.lock().unwrap().push(event.clone());
    }
}

const PROD: &str = "pve-prod-01";
const BACKUP: &str = "pve-backup-01";
const JOB: &str = "replica-vm-100";

const INVENTORY: &str = r#"
settings:
  tick_interval_secs: 1
  workers: 2
  command_timeout_secs: 5
  connect_retries: 2
  connect_backoff_ms: 1
  shutdown_grace_secs: 0
nodes:
  pve-prod-01: 10.0.0.1
  pve-backup-01:
    address: 10.0.0.2
    replication_key: /root/.ssh/zsync_backup
jobs:
  replica-vm-100:
    source: pve-prod-01:rpool/data/vm-100-disk-0
    destination: pve-backup-01:rpool/replica/vm-100-disk-0
    schedule: "0 */4 * * *"
"#;

const REGISTERING_INVENTORY: &str = r#"
settings:
  connect_retries: 1
  staging_dir: /var/lib/zsync/staging
nodes:
  pve-prod-01: 10.0.0.1
  pve-backup-01: 10.0.0.2
jobs:
  replica-vm-100:
    source: pve-prod-01:rpool/data/vm-100-disk-0
    destination: pve-backup-01:rpool/replica/vm-100-disk-0
    schedule: "0 */4 * * *"
    register_dependent: true
    dependent_id: 100
    storage_map:
      local-zfs: replica-zfs
"#;

const VM_100: &str = "\
boot: order=scsi0;net0
cores: 4
memory: 8192
name: web-01
net0: virtio=BC:24:11:5A:7E:01,bridge=vmbr0
scsi0: local-zfs:vm-100-disk-0,iothread=1,size=32G
";

const DESCRIPTOR: &str = "/etc/pve/qemu-server/100.conf";
const STAGED: &str = "/var/lib/zsync/staging/qemu-100.conf";

fn at(time: &str) -> DateTime<Utc> {
    format!("2026-10-16T{}Z", time).parse().unwrap()
}

/// Scheduler-level harness assembled from the public building blocks.
struct Fleet {
    remote: Arc<Remote>,
    store: Arc<SqliteJobStore>,
    registry: Arc<NodeRegistry>,
    recorder: Arc<Recorder>,
    scheduler: Scheduler,
}

fn fleet(config: Arc<dyn ConfigStore>, started_at: DateTime<Utc>) -> Fleet {
    let remote = Arc::new(Remote::default());
    let store = Arc::new(SqliteJobStore::in_memory().unwrap());
    let recorder = Arc::new(Recorder::default());
    let live = Arc::new(LiveInventory::load(config).unwrap());
    let executor = Arc::new(Executor::new(
        Arc::new(MockConnector(Arc::clone(&remote))),
        live.current().settings.executor(),
    ));
    let registry = Arc::new(
        NodeRegistry::load(Arc::clone(&executor), store.clone(), Duration::from_secs(1)).unwrap(),
    );
    let runner = Arc::new(Runner::new(
        executor,
        Arc::clone(&registry),
        store.clone(),
        recorder.clone(),
    ));
    let scheduler = Scheduler::new(live, store.clone(), Arc::clone(&registry), runner, started_at);
    Fleet {
        remote,
        store,
        registry,
        recorder,
        scheduler,
    }
}

struct Harness {
    remote: Arc<Remote>,
    store: Arc<SqliteJobStore>,
    recorder: Arc<Recorder>,
    config: Arc<TextInventory>,
    engine: Arc<Engine>,
}

fn harness(inventory: &str) -> Harness {
    let remote = Arc::new(Remote::default());
    let store = Arc::new(SqliteJobStore::in_memory().unwrap());
    let recorder = Arc::new(Recorder::default());
    let config = TextInventory::new(inventory);
    let engine = Engine::new(EngineParts {
        config: config.clone(),
        store: store.clone(),
        connector: Arc::new(MockConnector(Arc::clone(&remote))),
        notifier: recorder.clone(),
        audit: recorder.clone(),
    })
    .unwrap();
    Harness {
        remote,
        store,
        recorder,
        config,
        engine: Arc::new(engine),
    }
}

async fn wait_for_state(store: &dyn JobStore, run_id: i64, done: fn(RunState) -> bool) -> JobRun {
    for _ in 0..500 {
        if let Some(run) = store.run(run_id).unwrap() {
            if done(run.state) {
                return run;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("run {} never reached the expected state", run_id);
}

async fn wait_finished(store: &dyn JobStore, run_id: i64) -> JobRun {
    wait_for_state(store, run_id, |state| state.is_terminal()).await
}

async fn trigger_and_wait(harness: &Harness) -> JobRun {
    match harness.engine.trigger_run(JOB, "test").unwrap() {
        TriggerOutcome::Accepted(run_id) => harness.engine.execute_run(run_id).await.unwrap(),
        other => panic!("trigger was not accepted: {:?}", other),
    }
}

fn step_names(store: &SqliteJobStore, run_id: i64) -> Vec<(String, bool)> {
    store
        .steps(run_id)
        .unwrap()
        .into_iter()
        .map(|step| (step.step, step.ok))
        .collect()
}

#[tokio::test]
async fn scheduled_replication_succeeds() {
    let fleet = fleet(TextInventory::new(INVENTORY), at("07:59:00"));
    fleet
        .remote
        .on(PROD, "syncoid", 0, "INFO: 536870912 bytes transferred\n");
    let (_stop_tx, stop_rx) = watch::channel(false);
    let _workers = fleet.scheduler.spawn_workers(2, stop_rx);

    let report = fleet.scheduler.tick(at("08:00:30"));
    assert_eq!(report.dispatched.len(), 1);
    let (job, run_id) = report.dispatched[0].clone();
    assert_eq!(job, JOB);

    let run = wait_finished(&*fleet.store, run_id).await;
    assert_eq!(run.state, RunState::Success);
    assert_eq!(run.trigger, Trigger::Scheduled);
    assert_eq!(run.scheduled_for, Some(at("08:00:00")));
    assert_eq!(run.bytes_transferred, Some(536_870_912));
    assert!(run.error_class.is_none());

    let commands = fleet.remote.commands(PROD);
    assert_eq!(commands.len(), 1);
    assert!(commands[0].starts_with("syncoid --compress=lz4 --mbuffer-size=128M"));
    assert!(commands[0].contains("--sshkey=/root/.ssh/zsync_backup"));
    assert!(!commands[0].contains("--sshport"));
    assert!(commands[0].ends_with(
        "rpool/data/vm-100-disk-0 root@10.0.0.2:rpool/replica/vm-100-disk-0 2>&1"
    ));
    assert!(fleet.remote.commands(BACKUP).is_empty());

    // Nothing else is due until 12:00.
    let report = fleet.scheduler.tick(at("08:05:00"));
    assert!(report.dispatched.is_empty());
    assert_eq!(fleet.store.history(&RunFilter::default()).unwrap().len(), 1);
    assert_eq!(fleet.recorder.runs.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn failed_replication_keeps_the_schedule() {
    let fleet = fleet(TextInventory::new(INVENTORY), at("07:59:00"));
    fleet.remote.on(
        PROD,
        "syncoid",
        2,
        "cannot open 'rpool/replica/vm-100-disk-0': dataset does not exist\n",
    );
    let (_stop_tx, stop_rx) = watch::channel(false);
    let _workers = fleet.scheduler.spawn_workers(1, stop_rx);

    let (_, run_id) = fleet.scheduler.tick(at("08:00:30")).dispatched[0].clone();
    let run = wait_finished(&*fleet.store, run_id).await;
    assert_eq!(run.state, RunState::Failed);
    assert_eq!(
        run.error_class,
        Some(ErrorClass::ReplicationFailed(ReplicationFailure::NotFound))
    );
    assert!(run.error_message.unwrap().contains("dataset does not exist"));
    assert_eq!(step_names(&fleet.store, run_id), vec![("replicate".to_string(), false)]);

    // The job is not disabled; the next slot fires as usual.
    let report = fleet.scheduler.tick(at("12:00:10"));
    assert_eq!(report.dispatched.len(), 1);
    let next = wait_finished(&*fleet.store, report.dispatched[0].1).await;
    assert_eq!(next.scheduled_for, Some(at("12:00:00")));
}

#[tokio::test]
async fn due_slot_is_skipped_while_a_run_is_in_flight() {
    let fleet = fleet(TextInventory::new(INVENTORY), at("07:59:00"));
    fleet
        .remote
        .on_slow(PROD, "syncoid", 0, "1024 bytes transferred", 300);
    let (_stop_tx, stop_rx) = watch::channel(false);
    let _workers = fleet.scheduler.spawn_workers(2, stop_rx);

    let (_, run_id) = fleet.scheduler.tick(at("08:00:30")).dispatched[0].clone();
    wait_for_state(&*fleet.store, run_id, |state| state == RunState::Running).await;

    let report = fleet.scheduler.tick(at("12:00:30"));
    assert!(report.dispatched.is_empty());
    assert_eq!(report.skipped, vec![JOB.to_string()]);

    wait_finished(&*fleet.store, run_id).await;
    // The skipped slot is not queued for later.
    let report = fleet.scheduler.tick(at("12:01:30"));
    assert!(report.dispatched.is_empty());
    assert_eq!(fleet.store.history(&RunFilter::default()).unwrap().len(), 1);
}

#[tokio::test]
async fn missed_slots_coalesce_into_one_run() {
    let fleet = fleet(TextInventory::new(INVENTORY), at("07:59:00"));
    let (_stop_tx, stop_rx) = watch::channel(false);
    let _workers = fleet.scheduler.spawn_workers(1, stop_rx);

    // 08:00, 12:00 and 16:00 all passed since the last tick.
    let report = fleet.scheduler.tick(at("16:30:00"));
    assert_eq!(report.dispatched.len(), 1);
    let run = wait_finished(&*fleet.store, report.dispatched[0].1).await;
    assert_eq!(run.scheduled_for, Some(at("16:00:00")));
}

#[tokio::test]
async fn saturated_pool_queues_due_runs() {
    let inventory = format!(
        "{}  replica-vm-101:\n    source: pve-prod-01:rpool/data/vm-101-disk-0\n    destination: pve-backup-01:rpool/replica/vm-101-disk-0\n    schedule: \"0 */4 * * *\"\n",
        INVENTORY
    );
    let fleet = fleet(TextInventory::new(&inventory), at("07:59:00"));
    fleet
        .remote
        .on_slow(PROD, "syncoid", 0, "2048 bytes transferred", 300);
    let (_stop_tx, stop_rx) = watch::channel(false);
    let _workers = fleet.scheduler.spawn_workers(1, stop_rx);

    let report = fleet.scheduler.tick(at("08:00:30"));
    assert_eq!(report.dispatched.len(), 2);
    let (first, second) = (report.dispatched[0].1, report.dispatched[1].1);

    wait_for_state(&*fleet.store, first, |state| state == RunState::Running).await;
    assert_eq!(fleet.scheduler.queued(), 1);
    assert_eq!(fleet.store.run(second).unwrap().unwrap().state, RunState::Pending);

    let first = wait_finished(&*fleet.store, first).await;
    let second = wait_finished(&*fleet.store, second).await;
    assert_eq!(first.state, RunState::Success);
    assert_eq!(second.state, RunState::Success);
    assert!(second.started_at.unwrap() >= first.finished_at.unwrap());
    assert_eq!(fleet.scheduler.queued(), 0);
}

#[tokio::test]
async fn pending_run_from_another_process_is_adopted() {
    let fleet = fleet(TextInventory::new(INVENTORY), at("08:01:00"));
    // Another process, e.g. the CLI, created the run on the shared database.
    let run_id = match fleet
        .store
        .begin_run(JOB, Trigger::Manual, None, Utc::now())
        .unwrap()
    {
        BeginOutcome::Created(run) => run.id,
        other => panic!("unexpected {:?}", other),
    };

    let report = fleet.scheduler.tick(at("08:02:00"));
    assert!(report.dispatched.is_empty());
    assert_eq!(report.adopted, vec![run_id]);
    // Queued once, however often it is seen pending.
    assert!(fleet.scheduler.tick(at("08:02:30")).adopted.is_empty());

    let (_stop_tx, stop_rx) = watch::channel(false);
    let _workers = fleet.scheduler.spawn_workers(1, stop_rx);
    let run = wait_finished(&*fleet.store, run_id).await;
    assert_eq!(run.state, RunState::Success);
    assert_eq!(run.trigger, Trigger::Manual);
    assert_eq!(fleet.remote.commands(PROD).len(), 1);
}

#[tokio::test]
async fn abandoned_run_is_failed_and_the_slot_fires() {
    let fleet = fleet(TextInventory::new(INVENTORY), at("07:59:00"));
    let run_id = match fleet
        .store
        .begin_run(JOB, Trigger::Manual, None, Utc::now())
        .unwrap()
    {
        BeginOutcome::Created(run) => run.id,
        other => panic!("unexpected {:?}", other),
    };
    // Claimed by a process that died ten minutes ago.
    fleet
        .store
        .mark_running(run_id, "crashed-daemon", Utc::now() - chrono::Duration::minutes(10))
        .unwrap();

    let report = fleet.scheduler.tick(at("08:00:30"));
    assert_eq!(report.abandoned, vec![run_id]);
    assert_eq!(report.dispatched.len(), 1);
    let run = fleet.store.run(run_id).unwrap().unwrap();
    assert_eq!(run.state, RunState::Failed);
    assert_eq!(run.error_class, Some(ErrorClass::Interrupted));
}

#[tokio::test]
async fn offline_node_fails_without_running_anything() {
    let fleet = fleet(TextInventory::new(INVENTORY), at("07:59:00"));
    fleet
        .registry
        .mark_offline(BACKUP, "Connection refused")
        .await
        .unwrap();
    let (_stop_tx, stop_rx) = watch::channel(false);
    let _workers = fleet.scheduler.spawn_workers(1, stop_rx);

    let (_, run_id) = fleet.scheduler.tick(at("08:00:30")).dispatched[0].clone();
    let run = wait_finished(&*fleet.store, run_id).await;
    assert_eq!(run.state, RunState::Failed);
    assert_eq!(run.error_class, Some(ErrorClass::NodeUnreachable));
    assert!(fleet.remote.executed().is_empty());
    assert_eq!(fleet.remote.connects(), 0);
}

#[tokio::test]
async fn unreachable_node_goes_offline_until_tested() {
    let h = harness(INVENTORY);
    h.remote.set_unreachable(PROD, true);

    let run = trigger_and_wait(&h).await;
    assert_eq!(run.error_class, Some(ErrorClass::NodeUnreachable));
    // Two attempts per the inventory, then the node is Offline.
    assert_eq!(h.remote.connects(), 2);
    assert!(h.engine.registry().is_offline(PROD).await);

    // Reachable again, but Offline nodes are not contacted by runs.
    h.remote.set_unreachable(PROD, false);
    let run = trigger_and_wait(&h).await;
    assert_eq!(run.error_class, Some(ErrorClass::NodeUnreachable));
    assert_eq!(h.remote.connects(), 2);

    h.remote.on(PROD, "hostname", 0, "pve-prod-01\nsanoid=yes\nsyncoid=yes\n");
    let report = h.engine.test_node(PROD).await.unwrap();
    assert_eq!(report.reachability, Reachability::Online);
    assert_eq!(report.message, "pve-prod-01");
    assert!(report.capabilities.unwrap().replication_tool);

    let run = trigger_and_wait(&h).await;
    assert_eq!(run.state, RunState::Success);
}

#[tokio::test]
async fn missing_replication_tool_is_reported() {
    let h = harness(INVENTORY);
    h.remote.on(PROD, "hostname", 0, "pve-prod-01\nsanoid=yes\nsyncoid=no\n");
    h.engine.test_node(PROD).await.unwrap();

    let run = trigger_and_wait(&h).await;
    assert_eq!(run.error_class, Some(ErrorClass::ToolMissing));
    assert!(!h.remote.commands(PROD).iter().any(|c| c.starts_with("syncoid")));
}

#[tokio::test]
async fn non_zero_exit_always_fails_the_run() {
    let h = harness(INVENTORY);
    for (code, output) in [
        (1, "CRITICAL ERROR: something went wrong"),
        (2, "cannot receive: out of space"),
        (5, ""),
        (127, "sh: 1: syncoid: not found"),
        (255, "ssh: connect to host 10.0.0.2 port 22: No route to host"),
    ] {
        h.remote.clear_rules();
        h.remote.on(PROD, "syncoid", code, output);
        let run = trigger_and_wait(&h).await;
        assert_eq!(run.state, RunState::Failed, "exit code {}", code);
        assert!(run.error_class.is_some(), "exit code {}", code);
        if code == 127 {
            assert_eq!(run.error_class, Some(ErrorClass::ToolMissing));
        }
        if code == 2 {
            assert_eq!(
                run.error_class,
                Some(ErrorClass::ReplicationFailed(
                    ReplicationFailure::InsufficientSpace
                ))
            );
        }
    }
    let failed = h
        .engine
        .run_history(&RunFilter {
            state: Some(RunState::Failed),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(failed.len(), 5);
}

#[tokio::test]
async fn manual_trigger_while_running_is_rejected() {
    let h = harness(INVENTORY);
    h.remote
        .on_slow(PROD, "syncoid", 0, "2048 bytes transferred", 300);

    let run_id = match h.engine.trigger_run(JOB, "alice").unwrap() {
        TriggerOutcome::Accepted(run_id) => run_id,
        other => panic!("unexpected {:?}", other),
    };
    let engine = Arc::clone(&h.engine);
    let task = tokio::spawn(async move { engine.execute_run(run_id).await });
    wait_for_state(&*h.store, run_id, |state| state == RunState::Running).await;

    assert_eq!(
        h.engine.trigger_run(JOB, "bob").unwrap(),
        TriggerOutcome::AlreadyRunning(run_id)
    );

    let run = task.await.unwrap().unwrap();
    assert_eq!(run.state, RunState::Success);
    assert_eq!(run.bytes_transferred, Some(2048));
    assert_eq!(h.store.history(&RunFilter::default()).unwrap().len(), 1);

    let audits = h.recorder.audits.lock().unwrap().clone();
    assert_eq!(audits.len(), 2);
    assert!(audits[0].accepted && audits[0].requested_by == "alice");
    assert!(!audits[1].accepted && audits[1].run_id == run_id);

    assert!(matches!(
        h.engine.trigger_run("no-such-job", "alice"),
        Err(EngineError::UnknownJob(_))
    ));
}

#[test]
fn concurrent_triggers_accept_exactly_one() {
    let h = harness(INVENTORY);
    let outcomes: Vec<TriggerOutcome> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let engine = &h.engine;
                s.spawn(move || engine.trigger_run(JOB, &format!("client-{}", i)).unwrap())
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect()
    });

    let accepted: Vec<i64> = outcomes
        .iter()
        .filter_map(|o| match o {
            TriggerOutcome::Accepted(id) => Some(*id),
            _ => None,
        })
        .collect();
    assert_eq!(accepted.len(), 1);
    assert!(outcomes
        .iter()
        .all(|o| matches!(o, TriggerOutcome::Accepted(id) | TriggerOutcome::AlreadyRunning(id) if *id == accepted[0])));
    assert_eq!(h.store.pending_runs().unwrap().len(), 1);
}

#[tokio::test]
async fn policy_application_is_idempotent() {
    let h = harness(INVENTORY);
    h.remote.write_file(
        BACKUP,
        "/etc/sanoid/sanoid.conf",
        "# managed by hand\n\n[tank/archive]\n  daily = 365\n",
    );

    let outcome = h
        .engine
        .apply_policy(BACKUP, "rpool/replica/vm-100-disk-0", "production")
        .await
        .unwrap();
    assert_eq!(outcome, PolicyOutcome::Updated);
    let written = h.remote.file(BACKUP, "/etc/sanoid/sanoid.conf").unwrap();
    assert!(written.starts_with("# managed by hand\n\n[tank/archive]\n  daily = 365\n"));
    assert!(written.contains("[rpool/replica/vm-100-disk-0]\n  hourly = 48\n  daily = 90\n"));
    let commands = h.remote.commands(BACKUP);
    assert_eq!(commands.len(), 3);
    assert!(commands[2].starts_with("sanoid "));

    let outcome = h
        .engine
        .apply_policy(BACKUP, "rpool/replica/vm-100-disk-0", "production")
        .await
        .unwrap();
    assert_eq!(outcome, PolicyOutcome::Unchanged);
    // Only the read happened the second time.
    assert_eq!(h.remote.commands(BACKUP).len(), 4);
    assert_eq!(h.remote.file(BACKUP, "/etc/sanoid/sanoid.conf").unwrap(), written);

    h.remote.on(
        BACKUP,
        "zfs list",
        0,
        "rpool/replica\t40G\t800G\t/rpool/replica\nrpool/replica/vm-100-disk-0\t32G\t800G\t-\n",
    );
    let datasets = h.engine.discover_datasets(BACKUP).await.unwrap();
    assert_eq!(datasets.len(), 2);
    assert_eq!(datasets[0].policy, None);
    assert_eq!(datasets[1].policy.as_deref(), Some("production"));
    assert_eq!(datasets[1].mountpoint, None);
}

#[tokio::test]
async fn unreadable_policy_file_is_left_untouched() {
    let h = harness(INVENTORY);
    let existing = "[tank/archive]\n  daily = 365\n";
    h.remote.write_file(BACKUP, "/etc/sanoid/sanoid.conf", existing);
    h.remote.on(
        BACKUP,
        "test ! -e",
        1,
        "cat: /etc/sanoid/sanoid.conf: Permission denied",
    );

    let err = h
        .engine
        .apply_policy(BACKUP, "rpool/replica/vm-100-disk-0", "production")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Policy(_)));
    assert!(err.to_string().contains("Permission denied"));
    assert_eq!(h.remote.commands(BACKUP).len(), 1);
    assert_eq!(
        h.remote.file(BACKUP, "/etc/sanoid/sanoid.conf").as_deref(),
        Some(existing)
    );
    assert!(h.store.bindings().unwrap().is_empty());
}

#[tokio::test]
async fn policy_in_use_cannot_change_its_counts() {
    let inventory = format!("{}policies:\n  gold:\n    hourly: 24\n    daily: 7\n    weekly: 0\n    monthly: 0\n    yearly: 0\n", INVENTORY);
    let h = harness(&inventory);
    h.engine
        .apply_policy(BACKUP, "rpool/replica/vm-100-disk-0", "gold")
        .await
        .unwrap();

    h.config.set(&inventory.replace("hourly: 24", "hourly: 48"));
    assert!(matches!(
        h.engine
            .apply_policy(BACKUP, "rpool/replica/vm-100-disk-1", "gold")
            .await,
        Err(EngineError::PolicyInUse(_))
    ));
    assert!(matches!(
        h.engine.apply_policy(BACKUP, "/absolute", "production").await,
        Err(EngineError::Inventory(_))
    ));
    assert!(matches!(
        h.engine.apply_policy(BACKUP, "rpool/x", "platinum").await,
        Err(EngineError::UnknownPolicy(_))
    ));
}

#[tokio::test]
async fn dependent_is_registered_after_replication() {
    let h = harness(REGISTERING_INVENTORY);
    h.remote.on(PROD, "syncoid", 0, "536870912 bytes transferred");
    h.remote.write_file(PROD, DESCRIPTOR, VM_100);

    let run = trigger_and_wait(&h).await;
    assert_eq!(run.state, RunState::Success, "{:?}", run.error_message);

    let registered = h.remote.file(BACKUP, DESCRIPTOR).unwrap();
    assert!(registered.contains("scsi0: replica-zfs:vm-100-disk-0,iothread=1,size=32G\n"));
    assert!(registered.contains("net0: virtio=BC:24:11:5A:7E:01,bridge=vmbr0\n"));
    assert!(h.remote.file(BACKUP, STAGED).is_none());
    assert_eq!(
        step_names(&h.store, run.id),
        vec![
            ("replicate".to_string(), true),
            ("fetch".to_string(), true),
            ("rewrite".to_string(), true),
            ("upload".to_string(), true),
            ("register".to_string(), true),
        ]
    );
}

#[tokio::test]
async fn failed_registration_is_rolled_back() {
    let h = harness(REGISTERING_INVENTORY);
    h.remote.on(PROD, "syncoid", 0, "536870912 bytes transferred");
    h.remote.write_file(PROD, DESCRIPTOR, VM_100);
    h.remote
        .on(BACKUP, "mv ", 255, "unable to parse value of 'scsi0'");

    let run = trigger_and_wait(&h).await;
    assert_eq!(run.state, RunState::Failed);
    assert_eq!(
        run.error_class,
        Some(ErrorClass::VmRegistrationFailed(RegistrationStep::Register))
    );
    // The replicated data stays; only the registration is undone.
    assert_eq!(run.bytes_transferred, Some(536_870_912));

    let backup = h.remote.commands(BACKUP);
    let undo_register = backup
        .iter()
        .position(|c| c == &format!("rm -f {}", DESCRIPTOR))
        .unwrap();
    let undo_upload = backup
        .iter()
        .position(|c| c == &format!("rm -f {}", STAGED))
        .unwrap();
    assert!(undo_register < undo_upload);
    assert!(h.remote.file(BACKUP, STAGED).is_none());
    assert!(h.remote.file(BACKUP, DESCRIPTOR).is_none());

    let upload = h
        .remote
        .executed()
        .into_iter()
        .find(|c| c.node == BACKUP && c.command.contains("cat > "))
        .unwrap();
    assert!(upload.stdin.unwrap().contains("replica-zfs:vm-100-disk-0"));

    assert_eq!(
        step_names(&h.store, run.id),
        vec![
            ("replicate".to_string(), true),
            ("fetch".to_string(), true),
            ("rewrite".to_string(), true),
            ("upload".to_string(), true),
            ("register".to_string(), false),
            ("undo:register".to_string(), true),
            ("undo:upload".to_string(), true),
        ]
    );
}

#[tokio::test]
async fn registration_never_overwrites_an_existing_guest() {
    let h = harness(REGISTERING_INVENTORY);
    h.remote.on(PROD, "syncoid", 0, "");
    h.remote.write_file(PROD, DESCRIPTOR, VM_100);
    h.remote.write_file(BACKUP, DESCRIPTOR, "name: someone-else\n");

    let run = trigger_and_wait(&h).await;
    assert_eq!(
        run.error_class,
        Some(ErrorClass::VmRegistrationFailed(RegistrationStep::Register))
    );
    assert_eq!(
        h.remote.file(BACKUP, DESCRIPTOR).as_deref(),
        Some("name: someone-else\n")
    );
    let steps = step_names(&h.store, run.id);
    assert!(!steps.iter().any(|(step, _)| step == "undo:register"));
    assert_eq!(steps.last(), Some(&("undo:upload".to_string(), true)));
}

#[tokio::test]
async fn shutdown_interrupts_in_flight_runs() {
    let h = harness(INVENTORY);
    h.remote.on_slow(PROD, "syncoid", 0, "", 10_000);
    let run_id = match h.engine.trigger_run(JOB, "test").unwrap() {
        TriggerOutcome::Accepted(run_id) => run_id,
        other => panic!("unexpected {:?}", other),
    };

    let (stop_tx, stop_rx) = watch::channel(false);
    let engine = Arc::clone(&h.engine);
    let daemon = tokio::spawn(async move { engine.serve(stop_rx).await });
    wait_for_state(&*h.store, run_id, |state| state == RunState::Running).await;

    stop_tx.send(true).unwrap();
    daemon.await.unwrap().unwrap();

    let run = h.store.run(run_id).unwrap().unwrap();
    assert_eq!(run.state, RunState::Failed);
    assert_eq!(run.error_class, Some(ErrorClass::Interrupted));
    assert!(h.store.active_run(JOB).unwrap().is_none());
}

#[tokio::test]
async fn live_run_of_another_engine_survives_its_startup_and_shutdown() {
    let h = harness(INVENTORY);
    h.remote
        .on_slow(PROD, "syncoid", 0, "4096 bytes transferred", 3_000);
    // A second engine on the same database, e.g. the daemon next to a `trigger --wait`.
    let other = Arc::new(
        Engine::new(EngineParts {
            config: h.config.clone(),
            store: h.store.clone(),
            connector: Arc::new(MockConnector(Arc::clone(&h.remote))),
            notifier: h.recorder.clone(),
            audit: h.recorder.clone(),
        })
        .unwrap(),
    );

    let run_id = match h.engine.trigger_run(JOB, "cli").unwrap() {
        TriggerOutcome::Accepted(run_id) => run_id,
        other => panic!("unexpected {:?}", other),
    };
    let engine = Arc::clone(&h.engine);
    let cli = tokio::spawn(async move { engine.execute_run(run_id).await });
    wait_for_state(&*h.store, run_id, |state| state == RunState::Running).await;

    assert!(other.reconcile().unwrap().is_empty());
    assert_eq!(
        other.trigger_run(JOB, "operator").unwrap(),
        TriggerOutcome::AlreadyRunning(run_id)
    );
    let (_stop_tx, stop_rx) = watch::channel(true);
    other.serve(stop_rx).await.unwrap();
    assert_eq!(h.store.run(run_id).unwrap().unwrap().state, RunState::Running);

    let run = cli.await.unwrap().unwrap();
    assert_eq!(run.state, RunState::Success);
    assert_eq!(run.bytes_transferred, Some(4096));
    assert_eq!(h.remote.commands(PROD).len(), 1);
}

#[tokio::test]
async fn timed_out_command_discards_the_session() {
    let remote = Arc::new(Remote::default());
    remote.on_slow("nas-01", "sleep", 0, "", 1_000);
    let executor = Executor::new(
        Arc::new(MockConnector(Arc::clone(&remote))),
        ExecutorSettings {
            command_timeout: Duration::from_millis(50),
            connect_retries: 1,
            connect_backoff: Duration::from_millis(1),
        },
    );
    let node = Node::new("nas-01", "10.0.0.9");

    executor.run(&node, &RemoteCommand::new("true")).await.unwrap();
    assert!(executor.is_pooled("nas-01").await);

    let err = executor
        .run(&node, &RemoteCommand::new("sleep 60"))
        .await
        .unwrap_err();
    assert!(matches!(err, ExecError::Timeout { .. }));
    assert!(!executor.is_pooled("nas-01").await);

    executor.run(&node, &RemoteCommand::new("true")).await.unwrap();
    assert_eq!(remote.connects(), 2);
}

#[tokio::test]
async fn unhealthy_session_is_replaced_before_use() {
    let remote = Arc::new(Remote::default());
    let executor = Executor::new(
        Arc::new(MockConnector(Arc::clone(&remote))),
        ExecutorSettings::default(),
    );
    let node = Node::new("nas-01", "10.0.0.9");

    executor.run(&node, &RemoteCommand::new("true")).await.unwrap();
    executor.run(&node, &RemoteCommand::new("true")).await.unwrap();
    assert_eq!(remote.connects(), 1);

    remote.kill_sessions();
    executor.run(&node, &RemoteCommand::new("true")).await.unwrap();
    assert_eq!(remote.connects(), 2);
    executor.close_all().await;
    assert!(!executor.is_pooled("nas-01").await);
}

#[tokio::test]
async fn connect_retries_are_bounded() {
    let remote = Arc::new(Remote::default());
    remote.set_unreachable("nas-01", true);
    let executor = Executor::new(
        Arc::new(MockConnector(Arc::clone(&remote))),
        ExecutorSettings {
            command_timeout: Duration::from_secs(5),
            connect_retries: 3,
            connect_backoff: Duration::from_millis(1),
        },
    );
    let node = Node::new("nas-01", "10.0.0.9");

    let err = executor
        .run(&node, &RemoteCommand::new("true"))
        .await
        .unwrap_err();
    assert!(matches!(err, ExecError::Connect { .. }));
    assert_eq!(remote.connects(), 3);
    assert!(remote.executed().is_empty());
}

#[tokio::test]
async fn invalid_inventory_reload_keeps_the_previous_one() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(INVENTORY.as_bytes()).unwrap();
    let config = Arc::new(FileInventory::new(file.path().to_str().unwrap()));
    let fleet = fleet(config, at("07:59:00"));
    let (_stop_tx, stop_rx) = watch::channel(false);
    let _workers = fleet.scheduler.spawn_workers(1, stop_rx);

    std::fs::write(file.path(), "nodes: [unterminated").unwrap();
    let report = fleet.scheduler.tick(at("08:00:30"));
    assert_eq!(report.dispatched.len(), 1);
    wait_finished(&*fleet.store, report.dispatched[0].1).await;

    // A valid edit disabling the job takes effect on the next tick.
    std::fs::write(
        file.path(),
        INVENTORY.replace("schedule: \"0 */4 * * *\"", "schedule: \"0 */4 * * *\"\n    enabled: false"),
    )
    .unwrap();
    let report = fleet.scheduler.tick(at("12:00:30"));
    assert!(report.dispatched.is_empty());
}
