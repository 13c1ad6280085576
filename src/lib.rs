//! zsync: scheduled ZFS snapshot-policy and replication orchestration over SSH.

// Serde helper module.
mod serde;
// Command line arguments.
pub mod config;
// Error handling.
pub mod error;
// SSH session wrapper.
pub mod session;
// Pooled remote command execution.
pub mod executor;
// Nodes, datasets and endpoints.
pub mod node;
// Reachability and capabilities of nodes.
pub mod registry;
// Five-field cron schedules.
pub mod schedule;
// Snapshot policies and the sanoid configuration.
pub mod policy;
// Command templates for the remote tools.
pub mod tools;
// Sync jobs and their runs.
pub mod job;
// Durable run history.
pub mod store;
// One replication attempt, end to end.
pub mod runner;
// Registration of the replicated guest.
pub mod register;
// Tick loop and worker pool.
pub mod scheduler;
// The inventory file.
pub mod inventory;
// Outcome and audit sinks.
pub mod notify;
// Public operations.
pub mod engine;
// Synchronization primitives.
pub mod sync;

pub use engine::{Engine, EngineParts, TriggerOutcome};
pub use error::{EngineError, ErrorClass, ExecError, RunError, StoreError};
pub use executor::{Executor, ExecutorSettings};
pub use inventory::{ConfigStore, FileInventory, Inventory, LiveInventory, Settings};
pub use job::{JobRun, RunFilter, RunOutcome, RunState, SyncJob, Trigger};
pub use node::{Dataset, Endpoint, Node, ProbeReport, Reachability};
pub use notify::{AuditEvent, AuditSink, LogAudit, LogNotifier, Notifier};
pub use policy::{PolicyEngine, PolicyOutcome, SnapshotPolicy};
pub use registry::NodeRegistry;
pub use runner::Runner;
pub use schedule::Schedule;
pub use scheduler::{Scheduler, TickReport};
pub use session::{CommandOutput, Connector, RemoteCommand, Session, SshConnector};
pub use store::{BeginOutcome, JobStore, RunningScope, SqliteJobStore};
pub use sync::LockedFile;
