//! Receive-only sinks for run outcomes and trigger requests.
//!
//! Sinks are fire-and-forget. They return nothing, so a failing delivery can never fail a run.

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::job::{JobRun, RunState};

/// Receives every run that reached a terminal state.
pub trait Notifier: Send + Sync {
    fn run_finished(&self, run: &JobRun);
}

/// A manual trigger request and what became of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEvent {
    pub job: String,
    /// Who asked, e.g. `cli` or the name of an API client.
    pub requested_by: String,
    pub accepted: bool,
    /// The new run when accepted, the run in flight otherwise.
    pub run_id: i64,
    pub at: DateTime<Utc>,
}

pub trait AuditSink: Send + Sync {
    fn record(&self, event: &AuditEvent);
}

/// Writes terminal runs to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn run_finished(&self, run: &JobRun) {
        match run.state {
            RunState::Success => info!(
                job = %run.job,
                run_id = run.id,
                bytes = run.bytes_transferred,
                "Run succeeded."
            ),
            RunState::Failed => error!(
                job = %run.job,
                run_id = run.id,
                class = %run.error_class.map(|c| c.to_string()).unwrap_or_default(),
                "Run failed: {}",
                run.error_message.as_deref().unwrap_or("")
            ),
            _ => warn!(job = %run.job, run_id = run.id, state = %run.state, "Notified about a run that is not finished."),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogAudit;

impl AuditSink for LogAudit {
    fn record(&self, event: &AuditEvent) {
        info!(
            target: "audit",
            job = %event.job,
            requested_by = %event.requested_by,
            accepted = event.accepted,
            run_id = event.run_id,
            "Manual run requested."
        );
    }
}
