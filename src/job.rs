use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::ErrorClass;
use crate::node::Endpoint;
use crate::schedule::Schedule;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    #[default]
    Lz4,
    Gzip,
    Zstd,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Lz4 => "lz4",
            Compression::Gzip => "gzip",
            Compression::Zstd => "zstd",
        }
    }
}

/// Kind of guest whose descriptor is registered after replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependentKind {
    #[default]
    Qemu,
    Lxc,
}

impl DependentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DependentKind::Qemu => "qemu",
            DependentKind::Lxc => "lxc",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct JobOptions {
    pub recursive: bool,
    pub compression: Compression,
    pub mbuffer_size: Option<String>,
    pub no_sync_snap: bool,
    pub force_delete: bool,
    /// Create the destination's parent dataset before replicating.
    pub create_parent: bool,
    pub register_dependent: bool,
    pub dependent_id: Option<u32>,
    pub dependent_kind: DependentKind,
    /// Id to register under on the destination. Defaults to `dependent_id`.
    pub dependent_target_id: Option<u32>,
    /// Storage ids to rename in the descriptor, source id to destination id.
    pub storage_map: BTreeMap<String, String>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            recursive: false,
            compression: Compression::Lz4,
            mbuffer_size: Some("128M".to_string()),
            no_sync_snap: false,
            force_delete: false,
            create_parent: false,
            register_dependent: false,
            dependent_id: None,
            dependent_kind: DependentKind::Qemu,
            dependent_target_id: None,
            storage_map: BTreeMap::new(),
        }
    }
}

/// A recurring replication between two datasets.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncJob {
    /// Unique job name; doubles as its id.
    pub name: String,
    pub source: Endpoint,
    pub destination: Endpoint,
    pub schedule: Schedule,
    pub enabled: bool,
    pub options: JobOptions,
}

impl SyncJob {
    /// Nodes the job talks to, source first.
    pub fn nodes(&self) -> [&str; 2] {
        [&self.source.node, &self.destination.node]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Scheduled,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Pending,
    Running,
    Success,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Success | RunState::Failed)
    }
}

macro_rules! string_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($ty::$variant),)+
                    other => Err(format!("unknown {} '{}'", stringify!($ty), other)),
                }
            }
        }
    };
}

string_enum!(Trigger {
    Scheduled => "scheduled",
    Manual => "manual",
});

string_enum!(RunState {
    Pending => "pending",
    Running => "running",
    Success => "success",
    Failed => "failed",
});

/// One execution attempt of a `SyncJob`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRun {
    pub id: i64,
    pub job: String,
    pub trigger: Trigger,
    pub state: RunState,
    /// Schedule slot this run was fired for. `None` for manual runs.
    pub scheduled_for: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub bytes_transferred: Option<u64>,
    pub error_class: Option<ErrorClass>,
    pub error_message: Option<String>,
}

/// Terminal fields written when a run finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub state: RunState,
    pub bytes_transferred: Option<u64>,
    pub error_class: Option<ErrorClass>,
    pub error_message: Option<String>,
}

impl RunOutcome {
    pub fn success(bytes_transferred: Option<u64>) -> Self {
        Self {
            state: RunState::Success,
            bytes_transferred,
            error_class: None,
            error_message: None,
        }
    }

    pub fn failed(
        class: ErrorClass,
        message: impl Into<String>,
        bytes_transferred: Option<u64>,
    ) -> Self {
        Self {
            state: RunState::Failed,
            bytes_transferred,
            error_class: Some(class),
            error_message: Some(message.into()),
        }
    }
}

/// Record of one step inside a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRecord {
    pub run_id: i64,
    pub step: String,
    pub ok: bool,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// History query. Unset fields do not filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunFilter {
    pub job: Option<String>,
    pub state: Option<RunState>,
    pub trigger: Option<Trigger>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}
