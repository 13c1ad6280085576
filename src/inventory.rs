//! The inventory: nodes, snapshot policies, sync jobs and engine settings.
//!
//! The inventory is a YAML file owned by the operator. The engine only reads it, and it
//! re-reads it on every scheduler tick. A file that fails to parse or validate is rejected as
//! a whole and the last good snapshot stays in effect.

use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, error, info};

use crate::error::InventoryError;
use crate::executor::ExecutorSettings;
use crate::job::{JobOptions, SyncJob};
use crate::node::{Endpoint, Node};
use crate::policy::{builtin_policies, SnapshotPolicy};
use crate::schedule::Schedule;
use crate::serde::string_or_mapping;
use crate::tools::{ToolTemplates, Tools};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub tick_interval_secs: u64,
    /// Size of the worker pool.
    pub workers: usize,
    pub command_timeout_secs: u64,
    pub probe_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub connect_retries: u32,
    pub connect_backoff_ms: u64,
    pub shutdown_grace_secs: u64,
    /// How often an executing run proves it is still alive. A `running` run that misses three
    /// heartbeats is treated as abandoned.
    pub heartbeat_secs: u64,
    /// Re-test Offline nodes this often. Unset means only explicit tests bring them back.
    pub reprobe_offline_secs: Option<u64>,
    /// Directory on destination nodes where descriptors are staged before registration.
    pub staging_dir: String,
    pub sanoid_config: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            tick_interval_secs: 60,
            workers: 4,
            command_timeout_secs: 3600,
            probe_timeout_secs: 10,
            connect_timeout_secs: 10,
            connect_retries: 3,
            connect_backoff_ms: 500,
            shutdown_grace_secs: 30,
            heartbeat_secs: 15,
            reprobe_offline_secs: None,
            staging_dir: "/var/lib/zsync/staging".to_string(),
            sanoid_config: "/etc/sanoid/sanoid.conf".to_string(),
        }
    }
}

impl Settings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }

    /// Age of the last heartbeat after which a `running` run counts as abandoned.
    pub fn stale_after(&self) -> Duration {
        self.heartbeat_interval() * 3
    }

    pub fn reprobe_offline(&self) -> Option<Duration> {
        self.reprobe_offline_secs.map(Duration::from_secs)
    }

    pub fn executor(&self) -> ExecutorSettings {
        ExecutorSettings {
            command_timeout: Duration::from_secs(self.command_timeout_secs),
            connect_retries: self.connect_retries,
            connect_backoff: Duration::from_millis(self.connect_backoff_ms),
        }
    }
}

/// A validated inventory with compiled schedules and tool templates.
pub struct Inventory {
    pub settings: Settings,
    pub tools: Tools,
    pub nodes: BTreeMap<String, Node>,
    /// Built-in templates overlaid with the inventory's own.
    pub policies: BTreeMap<String, SnapshotPolicy>,
    pub jobs: BTreeMap<String, SyncJob>,
}

impl Inventory {
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn job(&self, name: &str) -> Option<&SyncJob> {
        self.jobs.get(name)
    }

    pub fn enabled_jobs(&self) -> impl Iterator<Item = &SyncJob> {
        self.jobs.values().filter(|job| job.enabled)
    }
}

impl FromStr for Inventory {
    type Err = InventoryError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let raw: RawInventory = serde_yaml::from_str(text).map_err(|source| InventoryError::Parse {
            path: "<inline>".to_string(),
            source,
        })?;
        raw.validate()
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawInventory {
    #[serde(default)]
    settings: Settings,
    #[serde(default)]
    tools: ToolTemplates,
    #[serde(default)]
    nodes: BTreeMap<String, NodeSpec>,
    #[serde(default)]
    policies: BTreeMap<String, SnapshotPolicy>,
    #[serde(default)]
    jobs: BTreeMap<String, JobSpec>,
}

#[derive(Debug, Deserialize)]
struct NodeSpec(#[serde(deserialize_with = "string_or_mapping")] NodeSpecInner);

#[derive(Debug, Deserialize)]
struct NodeSpecInner {
    address: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_user")]
    user: String,
    key: Option<String>,
    replication_key: Option<String>,
}

fn default_port() -> u16 {
    22
}

fn default_user() -> String {
    "root".to_string()
}

impl FromStr for NodeSpecInner {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err("node address must not be empty".to_string());
        }
        Ok(Self {
            address: s.trim().to_string(),
            port: default_port(),
            user: default_user(),
            key: None,
            replication_key: None,
        })
    }
}

#[derive(Debug, Deserialize)]
struct EndpointSpec(#[serde(deserialize_with = "string_or_mapping")] Endpoint);

#[derive(Debug, Deserialize)]
struct JobSpec {
    source: EndpointSpec,
    destination: EndpointSpec,
    schedule: String,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(flatten)]
    options: JobOptions,
}

fn default_enabled() -> bool {
    true
}

/// Dataset paths are restricted to `[A-Za-z0-9_.:/-]` and must be relative.
pub fn valid_dataset(path: &str) -> bool {
    !path.is_empty()
        && !path.starts_with('/')
        && !path.ends_with('/')
        && path
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '/' | '-'))
}

impl RawInventory {
    fn validate(self) -> Result<Inventory, InventoryError> {
        let tools = Tools::new(&self.tools)
            .map_err(|e| InventoryError::Invalid(format!("tool template: {}", e)))?;

        let mut nodes = BTreeMap::new();
        for (id, NodeSpec(spec)) in self.nodes {
            nodes.insert(
                id.clone(),
                Node {
                    id,
                    address: spec.address,
                    port: spec.port,
                    user: spec.user,
                    key: spec.key,
                    replication_key: spec.replication_key,
                },
            );
        }

        let mut policies = builtin_policies();
        for (name, mut policy) in self.policies {
            policy.name = name.clone();
            policies.insert(name, policy);
        }

        let mut jobs = BTreeMap::new();
        let mut seen = HashSet::new();
        for (name, spec) in self.jobs {
            let invalid = |reason: String| InventoryError::Invalid(format!("job '{}': {}", name, reason));
            if name.trim().is_empty() || !seen.insert(name.trim().to_string()) {
                return Err(invalid("job names must be unique and non-empty".to_string()));
            }
            let source = spec.source.0;
            let destination = spec.destination.0;
            for endpoint in [&source, &destination] {
                if !nodes.contains_key(&endpoint.node) {
                    return Err(invalid(format!("unknown node '{}'", endpoint.node)));
                }
                if !valid_dataset(&endpoint.dataset) {
                    return Err(invalid(format!("invalid dataset path '{}'", endpoint.dataset)));
                }
            }
            if source == destination {
                return Err(invalid("source and destination are the same dataset".to_string()));
            }
            let schedule = Schedule::parse(&spec.schedule).map_err(|e| invalid(e.to_string()))?;
            if spec.options.register_dependent && spec.options.dependent_id.is_none() {
                return Err(invalid("register_dependent requires dependent_id".to_string()));
            }
            jobs.insert(
                name.clone(),
                SyncJob {
                    name: name.clone(),
                    source,
                    destination,
                    schedule,
                    enabled: spec.enabled,
                    options: spec.options,
                },
            );
        }

        Ok(Inventory {
            settings: self.settings,
            tools,
            nodes,
            policies,
            jobs,
        })
    }
}

/// Where the engine reads its inventory from.
pub trait ConfigStore: Send + Sync {
    fn load(&self) -> Result<Inventory, InventoryError>;
}

/// Inventory kept in a YAML file.
#[derive(Debug, Clone)]
pub struct FileInventory {
    path: String,
}

impl FileInventory {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl ConfigStore for FileInventory {
    fn load(&self) -> Result<Inventory, InventoryError> {
        let text = std::fs::read_to_string(&self.path).map_err(|source| InventoryError::Io {
            path: self.path.clone(),
            source,
        })?;
        let raw: RawInventory =
            serde_yaml::from_str(&text).map_err(|source| InventoryError::Parse {
                path: self.path.clone(),
                source,
            })?;
        raw.validate()
    }
}

/// An inventory that is always loaded: the latest valid one.
pub struct LiveInventory {
    source: Arc<dyn ConfigStore>,
    current: RwLock<Arc<Inventory>>,
}

impl LiveInventory {
    /// Loads the inventory once. Failing here is fatal; later reload failures are not.
    pub fn load(source: Arc<dyn ConfigStore>) -> Result<Self, InventoryError> {
        let inventory = source.load()?;
        info!(
            nodes = inventory.nodes.len(),
            jobs = inventory.jobs.len(),
            "Inventory loaded."
        );
        Ok(Self {
            source,
            current: RwLock::new(Arc::new(inventory)),
        })
    }

    pub fn current(&self) -> Arc<Inventory> {
        match self.current.read() {
            Ok(current) => Arc::clone(&current),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Re-reads the inventory. An invalid one is logged and the previous one returned.
    pub fn refresh(&self) -> Arc<Inventory> {
        match self.source.load() {
            Ok(inventory) => {
                debug!(jobs = inventory.jobs.len(), "Inventory reloaded.");
                let inventory = Arc::new(inventory);
                match self.current.write() {
                    Ok(mut current) => *current = Arc::clone(&inventory),
                    Err(poisoned) => *poisoned.into_inner() = Arc::clone(&inventory),
                }
                inventory
            }
            Err(e) => {
                error!("Keeping the previous inventory: {}", e);
                self.current()
            }
        }
    }
}
