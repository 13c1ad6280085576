//! Registration of the guest that owns a replicated dataset.
//!
//! After a successful replication the guest's descriptor is copied from the source node,
//! its disk references are rewritten to the destination datasets, and it is registered on the
//! destination in a stopped state. The workflow is an ordered list of steps, each with a
//! forward action and a compensation. When a step fails, the compensations of the steps that
//! already ran are executed in reverse order.

use std::collections::BTreeMap;

use chrono::Utc;
use tracing::{info, warn};

use crate::error::{ErrorClass, ExecError, RegistrationStep, RunError};
use crate::executor::Executor;
use crate::job::SyncJob;
use crate::node::{Endpoint, Node};
use crate::registry::NodeRegistry;
use crate::session::RemoteCommand;
use crate::store::JobStore;
use crate::tools::Tools;

/// Descriptor keys whose values reference a storage volume.
const DISK_KEYS: [&str; 9] = [
    "scsi", "sata", "ide", "virtio", "efidisk", "tpmstate", "unused", "mp", "rootfs",
];

const STEPS: [RegistrationStep; 4] = [
    RegistrationStep::Fetch,
    RegistrationStep::Rewrite,
    RegistrationStep::Upload,
    RegistrationStep::Register,
];

/// What to register, and where.
pub struct Registration<'a> {
    pub job: &'a SyncJob,
    pub source: &'a Node,
    pub destination: &'a Node,
    pub staging_dir: &'a str,
}

impl Registration<'_> {
    fn source_id(&self) -> Result<u32, String> {
        self.job
            .options
            .dependent_id
            .ok_or_else(|| format!("job '{}' has no dependent_id", self.job.name))
    }

    fn target_id(&self) -> Result<u32, String> {
        match self.job.options.dependent_target_id {
            Some(id) => Ok(id),
            None => self.source_id(),
        }
    }
}

/// Values produced by forward actions and needed by later steps or compensations.
#[derive(Debug, Default)]
struct SagaState {
    original: Option<String>,
    rewritten: Option<String>,
    staged: Option<String>,
    descriptor: Option<String>,
}

struct StepFailure {
    message: String,
    /// The step changed remote state before failing and must be compensated itself.
    partial: bool,
}

impl StepFailure {
    fn clean(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            partial: false,
        }
    }

    fn partial(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            partial: true,
        }
    }
}

pub struct RegistrationSaga<'a> {
    executor: &'a Executor,
    tools: &'a Tools,
    registry: &'a NodeRegistry,
    store: &'a dyn JobStore,
    run_id: i64,
}

impl<'a> RegistrationSaga<'a> {
    pub fn new(
        executor: &'a Executor,
        tools: &'a Tools,
        registry: &'a NodeRegistry,
        store: &'a dyn JobStore,
        run_id: i64,
    ) -> Self {
        Self {
            executor,
            tools,
            registry,
            store,
            run_id,
        }
    }

    pub async fn run(&self, reg: &Registration<'_>) -> Result<(), RunError> {
        let mut state = SagaState::default();
        let mut completed: Vec<RegistrationStep> = Vec::with_capacity(STEPS.len());

        for step in STEPS {
            match self.forward(step, reg, &mut state).await {
                Ok(message) => {
                    self.journal(step.as_str(), true, &message);
                    completed.push(step);
                }
                Err(failure) => {
                    warn!(job = %reg.job.name, run_id = self.run_id, step = step.as_str(), "Registration step failed: {}", failure.message);
                    self.journal(step.as_str(), false, &failure.message);
                    if failure.partial {
                        self.compensate(step, reg, &state).await;
                    }
                    for done in completed.iter().rev() {
                        self.compensate(*done, reg, &state).await;
                    }
                    return Err(RunError::new(
                        ErrorClass::VmRegistrationFailed(step),
                        failure.message,
                    ));
                }
            }
        }
        info!(job = %reg.job.name, run_id = self.run_id, node = %reg.destination.id, "Dependent registered.");
        Ok(())
    }

    async fn forward(
        &self,
        step: RegistrationStep,
        reg: &Registration<'_>,
        state: &mut SagaState,
    ) -> Result<String, StepFailure> {
        let kind = reg.job.options.dependent_kind;
        match step {
            RegistrationStep::Fetch => {
                let id = reg.source_id().map_err(StepFailure::clean)?;
                let path = self
                    .tools
                    .descriptor_path(kind, id)
                    .map_err(|e| StepFailure::clean(e.to_string()))?;
                let output = self
                    .exec(reg.source, &RemoteCommand::new(format!("cat {}", path)))
                    .await
                    .map_err(StepFailure::clean)?;
                if output.trim().is_empty() {
                    return Err(StepFailure::clean(format!("descriptor {} is empty", path)));
                }
                state.original = Some(output);
                Ok(format!("fetched {} from {}", path, reg.source.id))
            }
            RegistrationStep::Rewrite => {
                let original = state.original.as_deref().unwrap_or_default();
                let rewritten = rewrite_descriptor(
                    original,
                    &reg.job.source,
                    &reg.job.destination,
                    &reg.job.options.storage_map,
                )
                .map_err(StepFailure::clean)?;
                state.rewritten = Some(rewritten);
                Ok(format!(
                    "rewrote references from {} to {}",
                    reg.job.source.dataset, reg.job.destination.dataset
                ))
            }
            RegistrationStep::Upload => {
                let id = reg.target_id().map_err(StepFailure::clean)?;
                let staged = format!("{}/{}-{}.conf", reg.staging_dir, kind.as_str(), id);
                state.staged = Some(staged.clone());
                let upload = RemoteCommand::new(format!(
                    "mkdir -p {} && cat > {}",
                    reg.staging_dir, staged
                ))
                .with_stdin(state.rewritten.clone().unwrap_or_default());
                self.exec(reg.destination, &upload)
                    .await
                    .map_err(StepFailure::partial)?;
                Ok(format!("staged descriptor at {}", staged))
            }
            RegistrationStep::Register => {
                let id = reg.target_id().map_err(StepFailure::clean)?;
                let descriptor = self
                    .tools
                    .descriptor_path(kind, id)
                    .map_err(|e| StepFailure::clean(e.to_string()))?;
                let staged = state.staged.clone().unwrap_or_default();

                let probe = RemoteCommand::new(format!("test -e {}", descriptor));
                match self.executor.run(reg.destination, &probe).await {
                    Ok(output) if output.success() => {
                        return Err(StepFailure::clean(format!(
                            "{} already exists on {}; id {} is in use",
                            descriptor, reg.destination.id, id
                        )));
                    }
                    Ok(_) => {}
                    Err(err) => return Err(StepFailure::clean(self.exec_failure(reg.destination, err).await)),
                }

                state.descriptor = Some(descriptor.clone());
                let register = self
                    .tools
                    .register(kind, id, &descriptor, &staged)
                    .map_err(|e| StepFailure::clean(e.to_string()))?;
                self.exec(reg.destination, &RemoteCommand::new(register))
                    .await
                    .map_err(StepFailure::partial)?;
                Ok(format!("registered {} {} on {}", kind.as_str(), id, reg.destination.id))
            }
        }
    }

    /// Undoes a step. Failures are logged and journaled; rollback continues regardless.
    async fn compensate(&self, step: RegistrationStep, reg: &Registration<'_>, state: &SagaState) {
        let command = match step {
            RegistrationStep::Fetch | RegistrationStep::Rewrite => return,
            RegistrationStep::Upload => match &state.staged {
                Some(staged) => format!("rm -f {}", staged),
                None => return,
            },
            RegistrationStep::Register => match &state.descriptor {
                Some(descriptor) => match self.tools.unregister(descriptor) {
                    Ok(command) => command,
                    Err(e) => {
                        self.journal(&undo_name(step), false, &e.to_string());
                        return;
                    }
                },
                None => return,
            },
        };
        match self.exec(reg.destination, &RemoteCommand::new(command.clone())).await {
            Ok(_) => {
                info!(job = %reg.job.name, run_id = self.run_id, step = step.as_str(), "Compensated registration step.");
                self.journal(&undo_name(step), true, &command);
            }
            Err(message) => {
                warn!(job = %reg.job.name, run_id = self.run_id, step = step.as_str(), "Compensation failed: {}", message);
                self.journal(&undo_name(step), false, &message);
            }
        }
    }

    async fn exec(&self, node: &Node, command: &RemoteCommand) -> Result<String, String> {
        match self.executor.run_checked(node, command).await {
            Ok(output) => Ok(output.stdout),
            Err(err) => Err(self.exec_failure(node, err).await),
        }
    }

    async fn exec_failure(&self, node: &Node, err: ExecError) -> String {
        let message = err.to_string();
        if matches!(err, ExecError::Connect { .. }) {
            if let Err(e) = self.registry.mark_offline(&node.id, &message).await {
                warn!(node = %node.id, "Failed to record node as offline: {}", e);
            }
        }
        message
    }

    fn journal(&self, step: &str, ok: bool, message: &str) {
        if let Err(e) = self
            .store
            .record_step(self.run_id, step, ok, message, Utc::now())
        {
            warn!(run_id = self.run_id, step, "Failed to record run step: {}", e);
        }
    }
}

fn undo_name(step: RegistrationStep) -> String {
    format!("undo:{}", step.as_str())
}

fn is_disk_key(key: &str) -> bool {
    let base = key.trim_end_matches(|c: char| c.is_ascii_digit());
    DISK_KEYS.contains(&base)
}

fn leaf(dataset: &str) -> &str {
    dataset.rsplit('/').next().unwrap_or(dataset)
}

/// Rewrites the disk references of a guest descriptor from the source dataset naming to the
/// destination dataset naming. Every other byte is preserved.
///
/// A volume `storage:name` is rewritten when `name` is the source dataset's leaf, and its
/// storage id is renamed through `storage_map`. Occurrences of the full source dataset path are
/// replaced with the destination path when they name the dataset itself or one of its children.
pub fn rewrite_descriptor(
    text: &str,
    source: &Endpoint,
    destination: &Endpoint,
    storage_map: &BTreeMap<String, String>,
) -> Result<String, String> {
    let source_leaf = leaf(&source.dataset);
    let destination_leaf = leaf(&destination.dataset);
    let mut rewritten = 0usize;
    let mut out = String::with_capacity(text.len());

    for raw in text.split_inclusive('\n') {
        let body = raw.trim_end_matches(['\r', '\n']);
        let ending = &raw[body.len()..];
        let (key, rest) = match body.split_once(':') {
            Some((key, rest)) if !body.starts_with('#') && is_disk_key(key.trim()) => (key, rest),
            _ => {
                out.push_str(raw);
                continue;
            }
        };
        let value = rest.trim_start();
        let padding = &rest[..rest.len() - value.len()];
        let (volume, options) = match value.find(',') {
            Some(i) => value.split_at(i),
            None => (value, ""),
        };

        let mut new_volume = volume.to_string();
        let mut changed = false;
        if let Some((storage, name)) = volume.split_once(':') {
            let storage = match storage_map.get(storage) {
                Some(mapped) => {
                    changed |= mapped != storage;
                    mapped.as_str()
                }
                None => storage,
            };
            let name = if name == source_leaf {
                changed = true;
                destination_leaf
            } else {
                name
            };
            new_volume = format!("{}:{}", storage, name);
        }
        let mut line = format!("{}:{}{}{}", key, padding, new_volume, options);
        if let Some(replaced) = replace_dataset(&line, &source.dataset, &destination.dataset) {
            line = replaced;
            changed = true;
        }
        if changed {
            rewritten += 1;
        }
        out.push_str(&line);
        out.push_str(ending);
    }

    if rewritten == 0 {
        return Err(format!(
            "descriptor does not reference dataset {}",
            source.dataset
        ));
    }
    Ok(out)
}

/// Replaces whole-path occurrences of `from`. A match must start the value or follow a path
/// separator, and must be followed by the end of the value, `/` or `,`, so that `disk-1` never
/// matches inside `disk-10`.
fn replace_dataset(line: &str, from: &str, to: &str) -> Option<String> {
    let mut out = String::with_capacity(line.len());
    let mut last = 0;
    for (start, _) in line.match_indices(from) {
        let end = start + from.len();
        let before = line[..start].chars().next_back();
        let after = line[end..].chars().next();
        let starts_path = matches!(before, None | Some('/' | ':' | ' ' | '=' | ','));
        let ends_path = matches!(after, None | Some('/' | ','));
        if starts_path && ends_path {
            out.push_str(&line[last..start]);
            out.push_str(to);
            last = end;
        }
    }
    if last == 0 {
        return None;
    }
    out.push_str(&line[last..]);
    Some(out)
}
