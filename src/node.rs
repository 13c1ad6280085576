//! Managed nodes and the datasets they hold.
//!
//! One pooled SSH connection is created per `Node`. The node's id is the key under which the
//! inventory lists it and under which the executor pools its connection.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// Inventory key, e.g. `pve-prod-01`.
    pub id: String,
    /// Hostname or IP the SSH connection goes to.
    pub address: String,
    pub port: u16,
    pub user: String,
    /// Credential reference: path of the private key to authenticate with.
    pub key: Option<String>,
    /// Key the replication tool on a peer node uses to reach this node, as a path on that peer.
    pub replication_key: Option<String>,
}

impl Node {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            port: 22,
            user: "root".to_string(),
            key: None,
            replication_key: None,
        }
    }

    /// `user@address` as the replication tool expects for a remote endpoint.
    pub fn ssh_target(&self) -> String {
        format!("{}@{}", self.user, self.address)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{} ({}@{}:{})]", self.id, self.user, self.address, self.port)
    }
}

/// Last known reachability of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Reachability {
    /// Never tested.
    #[default]
    Unknown,
    Online,
    Offline,
}

impl Reachability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reachability::Unknown => "unknown",
            Reachability::Online => "online",
            Reachability::Offline => "offline",
        }
    }
}

impl fmt::Display for Reachability {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Reachability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(Reachability::Unknown),
            "online" => Ok(Reachability::Online),
            "offline" => Ok(Reachability::Offline),
            other => Err(format!("unknown reachability '{}'", other)),
        }
    }
}

/// Tools found on a node by the last connectivity test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub snapshot_tool: bool,
    pub replication_tool: bool,
}

/// Registry view of one node.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NodeStatus {
    pub reachability: Reachability,
    /// `None` until a test succeeded at least once.
    pub capabilities: Option<Capabilities>,
    pub checked_at: Option<DateTime<Utc>>,
    pub message: Option<String>,
}

/// Result of an explicit connectivity test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    pub node: String,
    pub reachability: Reachability,
    pub capabilities: Option<Capabilities>,
    /// Remote hostname on success, error text on failure.
    pub message: String,
}

/// A storage unit found on a node by discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataset {
    pub node: String,
    pub path: String,
    pub used: Option<String>,
    pub available: Option<String>,
    pub mountpoint: Option<String>,
    /// Name of the snapshot policy currently bound to this dataset.
    pub policy: Option<String>,
}

/// Parses `zfs list -H -o name,used,avail,mountpoint` output.
pub fn parse_dataset_listing(node: &str, listing: &str) -> Vec<Dataset> {
    listing
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let mut cols = line.split('\t');
            let path = cols.next()?.trim();
            if path.is_empty() {
                return None;
            }
            let column = |value: Option<&str>| {
                value
                    .map(str::trim)
                    .filter(|v| !v.is_empty() && *v != "-")
                    .map(str::to_string)
            };
            Some(Dataset {
                node: node.to_string(),
                path: path.to_string(),
                used: column(cols.next()),
                available: column(cols.next()),
                mountpoint: column(cols.next()),
                policy: None,
            })
        })
        .collect()
}

/// Reference to a dataset on a node, written `node:dataset` in the inventory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct Endpoint {
    pub node: String,
    pub dataset: String,
}

impl Endpoint {
    pub fn new(node: impl Into<String>, dataset: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            dataset: dataset.into(),
        }
    }

    /// Parent dataset path, if the dataset is not a pool root.
    pub fn parent(&self) -> Option<&str> {
        self.dataset.rsplit_once('/').map(|(parent, _)| parent)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.node, self.dataset)
    }
}

impl FromStr for Endpoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((node, dataset)) if !node.is_empty() && !dataset.is_empty() => {
                Ok(Endpoint::new(node, dataset))
            }
            _ => Err(format!("expected 'node:dataset', got '{}'", s)),
        }
    }
}
