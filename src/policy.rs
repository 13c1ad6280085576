//! Snapshot retention policies and the sanoid configuration they are written into.
//!
//! The remote configuration is split into stanzas. Each stanza keeps its original text, so a
//! merge only rewrites the stanza of the dataset being bound and every other byte of the file
//! survives untouched.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::Deserialize;
use tracing::info;

use crate::error::PolicyError;
use crate::executor::Executor;
use crate::node::Node;
use crate::session::RemoteCommand;
use crate::tools::Tools;

/// Named retention template.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SnapshotPolicy {
    #[serde(default)]
    pub name: String,
    pub hourly: u32,
    pub daily: u32,
    pub weekly: u32,
    pub monthly: u32,
    pub yearly: u32,
    #[serde(default = "default_true")]
    pub autosnap: bool,
    #[serde(default = "default_true")]
    pub autoprune: bool,
}

fn default_true() -> bool {
    true
}

impl SnapshotPolicy {
    pub fn new(name: &str, counts: [u32; 5]) -> Self {
        Self {
            name: name.to_string(),
            hourly: counts[0],
            daily: counts[1],
            weekly: counts[2],
            monthly: counts[3],
            yearly: counts[4],
            autosnap: true,
            autoprune: true,
        }
    }

    /// Retention counts from the shortest to the longest cadence.
    pub fn counts(&self) -> [u32; 5] {
        [self.hourly, self.daily, self.weekly, self.monthly, self.yearly]
    }

    /// Whether two templates produce the same configuration.
    pub fn same_retention(&self, other: &SnapshotPolicy) -> bool {
        self.counts() == other.counts()
            && self.autosnap == other.autosnap
            && self.autoprune == other.autoprune
    }

    /// The stanza binding `dataset` to this policy, without the blank line that separates it
    /// from the next one.
    pub fn render(&self, dataset: &str) -> String {
        let yes_no = |b: bool| if b { "yes" } else { "no" };
        let mut out = String::new();
        let _ = writeln!(out, "[{}]", dataset);
        let _ = writeln!(out, "  hourly = {}", self.hourly);
        let _ = writeln!(out, "  daily = {}", self.daily);
        let _ = writeln!(out, "  weekly = {}", self.weekly);
        let _ = writeln!(out, "  monthly = {}", self.monthly);
        let _ = writeln!(out, "  yearly = {}", self.yearly);
        let _ = writeln!(out, "  autosnap = {}", yes_no(self.autosnap));
        let _ = writeln!(out, "  autoprune = {}", yes_no(self.autoprune));
        out
    }
}

/// Templates every installation starts with. Inventory policies override them by name.
pub fn builtin_policies() -> BTreeMap<String, SnapshotPolicy> {
    [
        SnapshotPolicy::new("production", [48, 90, 12, 24, 5]),
        SnapshotPolicy::new("default", [24, 30, 4, 12, 0]),
        SnapshotPolicy::new("minimal", [12, 7, 0, 0, 0]),
        SnapshotPolicy::new("backup", [0, 30, 8, 12, 2]),
        SnapshotPolicy::new("vm", [24, 14, 4, 6, 0]),
    ]
    .into_iter()
    .map(|policy| (policy.name.clone(), policy))
    .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Stanza {
    /// Text between the brackets.
    name: String,
    /// Header and settings exactly as read, up to the last setting.
    body: String,
    /// Blank and comment lines after the last setting. They usually describe the next stanza,
    /// so rebinding this one keeps them.
    trailer: String,
}

impl Stanza {
    fn raw(&self) -> String {
        format!("{}{}", self.body, self.trailer)
    }
}

/// A sanoid configuration file split into opaque stanzas.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PolicyDocument {
    /// Comments and blank lines before the first stanza.
    preamble: String,
    stanzas: Vec<Stanza>,
}

impl PolicyDocument {
    pub fn parse(text: &str) -> Result<Self, PolicyError> {
        let mut doc = PolicyDocument::default();
        for (index, line) in text.split_inclusive('\n').enumerate() {
            let trimmed = line.trim();
            if trimmed.starts_with('[') {
                let name = trimmed
                    .strip_prefix('[')
                    .and_then(|rest| rest.strip_suffix(']'))
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .ok_or_else(|| PolicyError::Parse {
                        line: index + 1,
                        text: trimmed.to_string(),
                    })?;
                if doc.stanzas.iter().any(|stanza| stanza.name == name) {
                    return Err(PolicyError::Parse {
                        line: index + 1,
                        text: format!("duplicate section [{}]", name),
                    });
                }
                doc.stanzas.push(Stanza {
                    name: name.to_string(),
                    body: line.to_string(),
                    trailer: String::new(),
                });
                continue;
            }
            let is_setting = trimmed
                .split_once('=')
                .map(|(key, _)| !key.trim().is_empty())
                .unwrap_or(false);
            let is_filler = trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with(';');
            if !is_filler && !is_setting {
                return Err(PolicyError::Parse {
                    line: index + 1,
                    text: trimmed.to_string(),
                });
            }
            if is_setting && doc.stanzas.is_empty() {
                return Err(PolicyError::Parse {
                    line: index + 1,
                    text: format!("setting outside of any section: {}", trimmed),
                });
            }
            match doc.stanzas.last_mut() {
                Some(stanza) if is_setting => {
                    let trailer = std::mem::take(&mut stanza.trailer);
                    stanza.body.push_str(&trailer);
                    stanza.body.push_str(line);
                }
                Some(stanza) => stanza.trailer.push_str(line),
                None => doc.preamble.push_str(line),
            }
        }
        Ok(doc)
    }

    /// Names of all stanzas in file order.
    pub fn sections(&self) -> impl Iterator<Item = &str> {
        self.stanzas.iter().map(|stanza| stanza.name.as_str())
    }

    /// Raw text of one stanza, including the filler lines that follow it.
    pub fn section(&self, name: &str) -> Option<String> {
        self.stanzas
            .iter()
            .find(|stanza| stanza.name == name)
            .map(Stanza::raw)
    }

    /// Replaces the settings of the stanza for `dataset`, or appends one at the end of the file.
    pub fn bind(&mut self, dataset: &str, policy: &SnapshotPolicy) {
        let rendered = policy.render(dataset);
        if let Some(stanza) = self.stanzas.iter_mut().find(|stanza| stanza.name == dataset) {
            stanza.body = rendered;
            return;
        }
        let tail = match self.stanzas.last_mut() {
            Some(stanza) if stanza.trailer.is_empty() => &mut stanza.body,
            Some(stanza) => &mut stanza.trailer,
            None => &mut self.preamble,
        };
        if !tail.is_empty() && !tail.ends_with('\n') {
            tail.push('\n');
        }
        self.stanzas.push(Stanza {
            name: dataset.to_string(),
            body: rendered,
            trailer: "\n".to_string(),
        });
    }

    pub fn render(&self) -> String {
        let mut out = self.preamble.clone();
        for stanza in &self.stanzas {
            out.push_str(&stanza.body);
            out.push_str(&stanza.trailer);
        }
        out
    }
}

/// Merges a binding into configuration text.
pub fn merge(current: &str, dataset: &str, policy: &SnapshotPolicy) -> Result<String, PolicyError> {
    let mut doc = PolicyDocument::parse(current)?;
    doc.bind(dataset, policy);
    Ok(doc.render())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyOutcome {
    /// The configuration was rewritten and the tool told to reload it.
    Updated,
    /// The binding was already in place; nothing was written.
    Unchanged,
}

/// Reconciles policy bindings into a node's sanoid configuration.
pub struct PolicyEngine<'a> {
    executor: &'a Executor,
    tools: &'a Tools,
    config_path: &'a str,
}

impl<'a> PolicyEngine<'a> {
    pub fn new(executor: &'a Executor, tools: &'a Tools, config_path: &'a str) -> Self {
        Self {
            executor,
            tools,
            config_path,
        }
    }

    pub async fn apply(
        &self,
        node: &Node,
        dataset: &str,
        policy: &SnapshotPolicy,
    ) -> Result<PolicyOutcome, PolicyError> {
        // A missing file reads as empty; any other read failure aborts before anything is written.
        let read = RemoteCommand::new(format!(
            "test ! -e {path} || cat {path}",
            path = self.config_path
        ));
        let current = self
            .executor
            .run_checked(node, &read)
            .await
            .map_err(|e| PolicyError::Write(format!("reading {}: {}", self.config_path, e)))?
            .stdout;

        let merged = merge(&current, dataset, policy)?;
        if merged == current {
            info!(node = %node.id, dataset, policy = %policy.name, "Snapshot policy already in place.");
            return Ok(PolicyOutcome::Unchanged);
        }

        let path = self.config_path;
        let write = RemoteCommand::new(format!(
            "mkdir -p \"$(dirname {path})\" && {{ cp {path} {path}.bak 2>/dev/null || true; }} && cat > {path}.tmp && mv {path}.tmp {path}"
        ))
        .with_stdin(merged);
        self.executor
            .run_checked(node, &write)
            .await
            .map_err(|e| PolicyError::Write(e.to_string()))?;

        let reload = self
            .tools
            .policy_reload(path)
            .map_err(|e| PolicyError::Write(e.to_string()))?;
        self.executor
            .run_checked(node, &RemoteCommand::new(reload))
            .await
            .map_err(|e| PolicyError::Write(format!("reloading: {}", e)))?;

        info!(node = %node.id, dataset, policy = %policy.name, "Snapshot policy written.");
        Ok(PolicyOutcome::Updated)
    }
}
