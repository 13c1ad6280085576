use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Failure of a single remote command as seen by the executor.
#[derive(Error, Debug, Clone)]
pub enum ExecError {
    #[error("Failed to connect to node {node}: {reason}")]
    Connect { node: String, reason: String },
    #[error("Command on node {node} did not finish within {secs}s")]
    Timeout { node: String, secs: u64 },
    #[error("Command on node {node} exited with status {code}: {stderr}")]
    Remote {
        node: String,
        code: i32,
        stderr: String,
    },
    #[error("SSH transport error on node {node}: {reason}")]
    Transport { node: String, reason: String },
}

impl ExecError {
    /// Connection and transport failures leave the pooled handle unusable.
    pub fn discards_handle(&self) -> bool {
        !matches!(self, ExecError::Remote { .. })
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Job store lock poisoned")]
    Poisoned,
    #[error("Job run {run_id} cannot move from {from} to {to}")]
    InvalidTransition {
        run_id: i64,
        from: String,
        to: String,
    },
    #[error("Job run {0} not found")]
    RunNotFound(i64),
    #[error("Corrupt value in column {column}: {value}")]
    Corrupt { column: &'static str, value: String },
}

#[derive(Error, Debug)]
pub enum InventoryError {
    #[error("Failed to read inventory {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse inventory {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("Invalid inventory: {0}")]
    Invalid(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("Unparsable sanoid configuration at line {line}: {text:?}")]
    Parse { line: usize, text: String },
    #[error("Failed to write sanoid configuration: {0}")]
    Write(String),
}

#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("Schedule {expr:?} must have five fields, found {found}")]
    FieldCount { expr: String, found: usize },
    #[error("Invalid schedule {expr:?}: {reason}")]
    Invalid { expr: String, reason: String },
}

/// Sub-classification of a failed replication, derived from the tool's message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationFailure {
    Conflict,
    NotFound,
    InsufficientSpace,
    Other,
}

/// Which part of the dependent-resource registration failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationStep {
    Fetch,
    Rewrite,
    Upload,
    Register,
}

impl RegistrationStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistrationStep::Fetch => "fetch",
            RegistrationStep::Rewrite => "rewrite",
            RegistrationStep::Upload => "upload",
            RegistrationStep::Register => "register",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyFailure {
    Parse,
    Write,
}

/// Persisted classification of a failed job run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    NodeUnreachable,
    CommandTimeout,
    ToolMissing,
    PolicyApplyFailed(PolicyFailure),
    ReplicationFailed(ReplicationFailure),
    VmRegistrationFailed(RegistrationStep),
    Interrupted,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::NodeUnreachable => write!(f, "node_unreachable"),
            ErrorClass::CommandTimeout => write!(f, "command_timeout"),
            ErrorClass::ToolMissing => write!(f, "tool_missing"),
            ErrorClass::PolicyApplyFailed(kind) => {
                let kind = match kind {
                    PolicyFailure::Parse => "parse",
                    PolicyFailure::Write => "write",
                };
                write!(f, "policy_apply_failed:{}", kind)
            }
            ErrorClass::ReplicationFailed(kind) => {
                let kind = match kind {
                    ReplicationFailure::Conflict => "conflict",
                    ReplicationFailure::NotFound => "not_found",
                    ReplicationFailure::InsufficientSpace => "insufficient_space",
                    ReplicationFailure::Other => "other",
                };
                write!(f, "replication_failed:{}", kind)
            }
            ErrorClass::VmRegistrationFailed(step) => {
                write!(f, "vm_registration_failed:{}", step.as_str())
            }
            ErrorClass::Interrupted => write!(f, "interrupted"),
        }
    }
}

impl FromStr for ErrorClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let class = match s {
            "node_unreachable" => ErrorClass::NodeUnreachable,
            "command_timeout" => ErrorClass::CommandTimeout,
            "tool_missing" => ErrorClass::ToolMissing,
            "policy_apply_failed:parse" => ErrorClass::PolicyApplyFailed(PolicyFailure::Parse),
            "policy_apply_failed:write" => ErrorClass::PolicyApplyFailed(PolicyFailure::Write),
            "replication_failed:conflict" => {
                ErrorClass::ReplicationFailed(ReplicationFailure::Conflict)
            }
            "replication_failed:not_found" => {
                ErrorClass::ReplicationFailed(ReplicationFailure::NotFound)
            }
            "replication_failed:insufficient_space" => {
                ErrorClass::ReplicationFailed(ReplicationFailure::InsufficientSpace)
            }
            "replication_failed:other" => ErrorClass::ReplicationFailed(ReplicationFailure::Other),
            "vm_registration_failed:fetch" => {
                ErrorClass::VmRegistrationFailed(RegistrationStep::Fetch)
            }
            "vm_registration_failed:rewrite" => {
                ErrorClass::VmRegistrationFailed(RegistrationStep::Rewrite)
            }
            "vm_registration_failed:upload" => {
                ErrorClass::VmRegistrationFailed(RegistrationStep::Upload)
            }
            "vm_registration_failed:register" => {
                ErrorClass::VmRegistrationFailed(RegistrationStep::Register)
            }
            "interrupted" => ErrorClass::Interrupted,
            other => return Err(format!("unknown error class '{}'", other)),
        };
        Ok(class)
    }
}

/// Why a job run failed. Captured on the run, never propagated past the runner.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{class}: {message}")]
pub struct RunError {
    pub class: ErrorClass,
    pub message: String,
}

impl RunError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    /// Maps an executor failure that happened while talking to a node.
    /// Remote (non-zero exit) failures are step-specific and handled by the caller.
    pub fn from_exec(err: &ExecError, remote_class: ErrorClass) -> Self {
        match err {
            ExecError::Connect { .. } => RunError::new(ErrorClass::NodeUnreachable, err.to_string()),
            ExecError::Timeout { .. } => RunError::new(ErrorClass::CommandTimeout, err.to_string()),
            ExecError::Remote { code: 127, stderr, .. } => {
                RunError::new(ErrorClass::ToolMissing, stderr.trim().to_string())
            }
            ExecError::Remote { stderr, .. } => RunError::new(remote_class, stderr.trim().to_string()),
            ExecError::Transport { .. } => RunError::new(remote_class, err.to_string()),
        }
    }
}

impl From<PolicyError> for RunError {
    fn from(err: PolicyError) -> Self {
        let kind = match err {
            PolicyError::Parse { .. } => PolicyFailure::Parse,
            PolicyError::Write(_) => PolicyFailure::Write,
        };
        RunError::new(ErrorClass::PolicyApplyFailed(kind), err.to_string())
    }
}

/// Errors returned by the public engine surface.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Inventory(#[from] InventoryError),
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    Run(#[from] RunError),
    #[error("Unknown sync job '{0}'")]
    UnknownJob(String),
    #[error("Unknown node '{0}'")]
    UnknownNode(String),
    #[error("Unknown snapshot policy '{0}'")]
    UnknownPolicy(String),
    #[error("Policy '{0}' is bound with different retention counts and cannot change")]
    PolicyInUse(String),
    #[error("Another instance holds the lock {0}")]
    AlreadyLocked(String),
    #[error("Failed to execute local operation: {0}")]
    LocalIo(#[from] std::io::Error),
}
