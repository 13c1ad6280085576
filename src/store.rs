//! Durable record of job runs, node reachability and policy bindings.
//!
//! At most one run per job may be `pending` or `running`. The SQLite store enforces this with a
//! partial unique index, so creating a run doubles as an atomic compare-and-swap that holds
//! across workers, across the CLI and the daemon, and across restarts.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, TimeZone, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};

use crate::error::{ErrorClass, StoreError};
use crate::job::{JobRun, RunFilter, RunOutcome, RunState, StepRecord, Trigger};
use crate::node::{Capabilities, NodeStatus, Reachability};
use crate::policy::SnapshotPolicy;

/// Result of trying to create a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeginOutcome {
    Created(JobRun),
    /// The job already has a pending or running run.
    AlreadyActive(i64),
}

/// Persisted binding of a policy to a dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyBinding {
    pub node: String,
    pub dataset: String,
    pub policy: SnapshotPolicy,
    pub applied_at: DateTime<Utc>,
}

/// Which `running` runs `fail_running` applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunningScope<'a> {
    /// Runs claimed by this owner.
    OwnedBy(&'a str),
    /// Runs whose owner has not sent a heartbeat since the cutoff.
    StaleSince(DateTime<Utc>),
}

pub trait JobStore: Send + Sync {
    /// Creates a `pending` run unless the job already has an active one.
    fn begin_run(
        &self,
        job: &str,
        trigger: Trigger,
        scheduled_for: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<BeginOutcome, StoreError>;

    /// `pending` → `running`, claimed by `owner`.
    fn mark_running(&self, run_id: i64, owner: &str, now: DateTime<Utc>) -> Result<JobRun, StoreError>;

    /// Tells other processes that the owner of a `running` run is still executing it.
    fn heartbeat(&self, run_id: i64, now: DateTime<Utc>) -> Result<(), StoreError>;

    /// `pending | running` → terminal state.
    fn finish_run(
        &self,
        run_id: i64,
        outcome: &RunOutcome,
        now: DateTime<Utc>,
    ) -> Result<JobRun, StoreError>;

    fn run(&self, run_id: i64) -> Result<Option<JobRun>, StoreError>;

    /// Id of the job's pending or running run.
    fn active_run(&self, job: &str) -> Result<Option<i64>, StoreError>;

    fn pending_runs(&self) -> Result<Vec<JobRun>, StoreError>;

    /// Newest first.
    fn history(&self, filter: &RunFilter) -> Result<Vec<JobRun>, StoreError>;

    /// Deletes terminal runs that finished more than `days` days before `now`.
    fn prune(&self, days: u32, now: DateTime<Utc>) -> Result<usize, StoreError>;

    /// Fails the `running` runs in `scope`.
    fn fail_running(
        &self,
        scope: RunningScope<'_>,
        class: ErrorClass,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobRun>, StoreError>;

    /// Latest slot a scheduled run was fired for.
    fn last_scheduled_slot(&self, job: &str) -> Result<Option<DateTime<Utc>>, StoreError>;

    fn record_step(
        &self,
        run_id: i64,
        step: &str,
        ok: bool,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    fn steps(&self, run_id: i64) -> Result<Vec<StepRecord>, StoreError>;

    fn save_node_status(&self, node: &str, status: &NodeStatus) -> Result<(), StoreError>;

    fn node_statuses(&self) -> Result<Vec<(String, NodeStatus)>, StoreError>;

    fn bind_policy(&self, binding: &PolicyBinding) -> Result<(), StoreError>;

    fn bindings(&self) -> Result<Vec<PolicyBinding>, StoreError>;
}

#[derive(Clone)]
pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
}

const RUN_COLUMNS: &str = "id, job, run_trigger, state, scheduled_for_ms, created_at_ms, started_at_ms, \
     finished_at_ms, bytes_transferred, error_class, error_message";

impl SqliteJobStore {
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn ensure_schema(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS job_runs (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              job TEXT NOT NULL,
              run_trigger TEXT NOT NULL,
              state TEXT NOT NULL,
              scheduled_for_ms INTEGER NULL,
              created_at_ms INTEGER NOT NULL,
              started_at_ms INTEGER NULL,
              finished_at_ms INTEGER NULL,
              bytes_transferred INTEGER NULL,
              error_class TEXT NULL,
              error_message TEXT NULL,
              owner TEXT NULL,
              heartbeat_ms INTEGER NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS ux_job_runs_active
              ON job_runs(job) WHERE state IN ('pending', 'running');
            CREATE INDEX IF NOT EXISTS idx_job_runs_job_created ON job_runs(job, created_at_ms DESC);
            CREATE INDEX IF NOT EXISTS idx_job_runs_state ON job_runs(state);
            CREATE TABLE IF NOT EXISTS run_steps (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              run_id INTEGER NOT NULL REFERENCES job_runs(id) ON DELETE CASCADE,
              step TEXT NOT NULL,
              ok INTEGER NOT NULL,
              message TEXT NOT NULL,
              at_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_run_steps_run ON run_steps(run_id);
            CREATE TABLE IF NOT EXISTS node_states (
              node TEXT PRIMARY KEY,
              reachability TEXT NOT NULL,
              snapshot_tool INTEGER NULL,
              replication_tool INTEGER NULL,
              checked_at_ms INTEGER NULL,
              message TEXT NULL
            );
            CREATE TABLE IF NOT EXISTS policy_bindings (
              node TEXT NOT NULL,
              dataset TEXT NOT NULL,
              policy TEXT NOT NULL,
              hourly INTEGER NOT NULL,
              daily INTEGER NOT NULL,
              weekly INTEGER NOT NULL,
              monthly INTEGER NOT NULL,
              yearly INTEGER NOT NULL,
              autosnap INTEGER NOT NULL,
              autoprune INTEGER NOT NULL,
              applied_at_ms INTEGER NOT NULL,
              PRIMARY KEY (node, dataset)
            );
            PRAGMA foreign_keys = ON;
            "#,
        )?;
        Ok(())
    }

    fn get_run(conn: &Connection, run_id: i64) -> Result<Option<JobRun>, StoreError> {
        let sql = format!("SELECT {} FROM job_runs WHERE id = ?1", RUN_COLUMNS);
        let raw = conn
            .query_row(&sql, params![run_id], RawRun::from_row)
            .optional()?;
        raw.map(RawRun::into_run).transpose()
    }

    fn state_of(conn: &Connection, run_id: i64) -> Result<RunState, StoreError> {
        let state: Option<String> = conn
            .query_row(
                "SELECT state FROM job_runs WHERE id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?;
        match state {
            Some(state) => parse_column("state", state),
            None => Err(StoreError::RunNotFound(run_id)),
        }
    }
}

impl JobStore for SqliteJobStore {
    fn begin_run(
        &self,
        job: &str,
        trigger: Trigger,
        scheduled_for: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<BeginOutcome, StoreError> {
        let conn = self.lock()?;
        let insert = conn.execute(
            "INSERT INTO job_runs (job, run_trigger, state, scheduled_for_ms, created_at_ms)
             VALUES (?1, ?2, 'pending', ?3, ?4)",
            params![
                job,
                trigger.as_str(),
                scheduled_for.map(dt_to_ms),
                dt_to_ms(now)
            ],
        );
        match insert {
            Ok(_) => {
                let id = conn.last_insert_rowid();
                Self::get_run(&conn, id)?
                    .map(BeginOutcome::Created)
                    .ok_or(StoreError::RunNotFound(id))
            }
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                let active: i64 = conn.query_row(
                    "SELECT id FROM job_runs WHERE job = ?1 AND state IN ('pending', 'running')",
                    params![job],
                    |row| row.get(0),
                )?;
                Ok(BeginOutcome::AlreadyActive(active))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn mark_running(&self, run_id: i64, owner: &str, now: DateTime<Utc>) -> Result<JobRun, StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE job_runs SET state = 'running', started_at_ms = ?2, owner = ?3, heartbeat_ms = ?2
             WHERE id = ?1 AND state = 'pending'",
            params![run_id, dt_to_ms(now), owner],
        )?;
        if changed == 0 {
            let from = Self::state_of(&conn, run_id)?;
            return Err(StoreError::InvalidTransition {
                run_id,
                from: from.to_string(),
                to: RunState::Running.to_string(),
            });
        }
        Self::get_run(&conn, run_id)?.ok_or(StoreError::RunNotFound(run_id))
    }

    fn finish_run(
        &self,
        run_id: i64,
        outcome: &RunOutcome,
        now: DateTime<Utc>,
    ) -> Result<JobRun, StoreError> {
        if !outcome.state.is_terminal() {
            return Err(StoreError::InvalidTransition {
                run_id,
                from: "active".to_string(),
                to: outcome.state.to_string(),
            });
        }
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE job_runs
             SET state = ?2, finished_at_ms = ?3, bytes_transferred = ?4,
                 error_class = ?5, error_message = ?6,
                 started_at_ms = COALESCE(started_at_ms, ?3)
             WHERE id = ?1 AND state IN ('pending', 'running')",
            params![
                run_id,
                outcome.state.as_str(),
                dt_to_ms(now),
                outcome.bytes_transferred.map(|b| b as i64),
                outcome.error_class.map(|c| c.to_string()),
                outcome.error_message,
            ],
        )?;
        if changed == 0 {
            let from = Self::state_of(&conn, run_id)?;
            return Err(StoreError::InvalidTransition {
                run_id,
                from: from.to_string(),
                to: outcome.state.to_string(),
            });
        }
        Self::get_run(&conn, run_id)?.ok_or(StoreError::RunNotFound(run_id))
    }

    fn heartbeat(&self, run_id: i64, now: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE job_runs SET heartbeat_ms = ?2 WHERE id = ?1 AND state = 'running'",
            params![run_id, dt_to_ms(now)],
        )?;
        Ok(())
    }

    fn run(&self, run_id: i64) -> Result<Option<JobRun>, StoreError> {
        let conn = self.lock()?;
        Self::get_run(&conn, run_id)
    }

    fn active_run(&self, job: &str) -> Result<Option<i64>, StoreError> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                "SELECT id FROM job_runs WHERE job = ?1 AND state IN ('pending', 'running')",
                params![job],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn pending_runs(&self) -> Result<Vec<JobRun>, StoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM job_runs WHERE state = 'pending' ORDER BY id",
            RUN_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], RawRun::from_row)?;
        rows.map(|raw| raw?.into_run()).collect()
    }

    fn history(&self, filter: &RunFilter) -> Result<Vec<JobRun>, StoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM job_runs
             WHERE (?1 IS NULL OR job = ?1)
               AND (?2 IS NULL OR state = ?2)
               AND (?3 IS NULL OR run_trigger = ?3)
               AND (?4 IS NULL OR created_at_ms >= ?4)
               AND (?5 IS NULL OR created_at_ms <= ?5)
             ORDER BY created_at_ms DESC, id DESC
             LIMIT ?6",
            RUN_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);
        let rows = stmt.query_map(
            params![
                filter.job,
                filter.state.map(|s| s.as_str()),
                filter.trigger.map(|t| t.as_str()),
                filter.since.map(dt_to_ms),
                filter.until.map(dt_to_ms),
                limit,
            ],
            RawRun::from_row,
        )?;
        rows.map(|raw| raw?.into_run()).collect()
    }

    fn prune(&self, days: u32, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let cutoff = now - Duration::days(i64::from(days));
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM run_steps WHERE run_id IN (
               SELECT id FROM job_runs
               WHERE state IN ('success', 'failed') AND finished_at_ms < ?1)",
            params![dt_to_ms(cutoff)],
        )?;
        let deleted = conn.execute(
            "DELETE FROM job_runs WHERE state IN ('success', 'failed') AND finished_at_ms < ?1",
            params![dt_to_ms(cutoff)],
        )?;
        Ok(deleted)
    }

    fn fail_running(
        &self,
        scope: RunningScope<'_>,
        class: ErrorClass,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobRun>, StoreError> {
        let (owner, stale_before) = match scope {
            RunningScope::OwnedBy(owner) => (Some(owner), None),
            RunningScope::StaleSince(cutoff) => (None, Some(dt_to_ms(cutoff))),
        };
        let conn = self.lock()?;
        let ids: Vec<i64> = {
            let mut stmt = conn.prepare(
                "SELECT id FROM job_runs
                 WHERE state = 'running'
                   AND (?1 IS NULL OR owner = ?1)
                   AND (?2 IS NULL OR COALESCE(heartbeat_ms, started_at_ms, 0) < ?2)
                 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![owner, stale_before], |row| row.get(0))?;
            rows.collect::<Result<_, _>>()?
        };
        let mut failed = Vec::with_capacity(ids.len());
        for id in ids {
            // A run that finished between the select and here is left alone.
            let changed = conn.execute(
                "UPDATE job_runs
                 SET state = 'failed', finished_at_ms = ?2, error_class = ?3, error_message = ?4
                 WHERE id = ?1 AND state = 'running'",
                params![id, dt_to_ms(now), class.to_string(), message],
            )?;
            if changed == 0 {
                continue;
            }
            if let Some(run) = Self::get_run(&conn, id)? {
                failed.push(run);
            }
        }
        Ok(failed)
    }

    fn last_scheduled_slot(&self, job: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let conn = self.lock()?;
        let ms: Option<i64> = conn.query_row(
            "SELECT MAX(scheduled_for_ms) FROM job_runs WHERE job = ?1",
            params![job],
            |row| row.get(0),
        )?;
        Ok(ms.map(ms_to_dt))
    }

    fn record_step(
        &self,
        run_id: i64,
        step: &str,
        ok: bool,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO run_steps (run_id, step, ok, message, at_ms) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![run_id, step, ok, message, dt_to_ms(now)],
        )?;
        Ok(())
    }

    fn steps(&self, run_id: i64) -> Result<Vec<StepRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT run_id, step, ok, message, at_ms FROM run_steps WHERE run_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok(StepRecord {
                run_id: row.get(0)?,
                step: row.get(1)?,
                ok: row.get(2)?,
                message: row.get(3)?,
                at: ms_to_dt(row.get(4)?),
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn save_node_status(&self, node: &str, status: &NodeStatus) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO node_states (node, reachability, snapshot_tool, replication_tool, checked_at_ms, message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(node) DO UPDATE SET
               reachability = excluded.reachability,
               snapshot_tool = COALESCE(excluded.snapshot_tool, node_states.snapshot_tool),
               replication_tool = COALESCE(excluded.replication_tool, node_states.replication_tool),
               checked_at_ms = excluded.checked_at_ms,
               message = excluded.message",
            params![
                node,
                status.reachability.as_str(),
                status.capabilities.map(|c| c.snapshot_tool),
                status.capabilities.map(|c| c.replication_tool),
                status.checked_at.map(dt_to_ms),
                status.message,
            ],
        )?;
        Ok(())
    }

    fn node_statuses(&self) -> Result<Vec<(String, NodeStatus)>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT node, reachability, snapshot_tool, replication_tool, checked_at_ms, message
             FROM node_states ORDER BY node",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<bool>>(2)?,
                row.get::<_, Option<bool>>(3)?,
                row.get::<_, Option<i64>>(4)?,
                row.get::<_, Option<String>>(5)?,
            ))
        })?;
        let mut statuses = Vec::new();
        for row in rows {
            let (node, reachability, snapshot_tool, replication_tool, checked_at, message) = row?;
            let capabilities = match (snapshot_tool, replication_tool) {
                (Some(snapshot_tool), Some(replication_tool)) => Some(Capabilities {
                    snapshot_tool,
                    replication_tool,
                }),
                _ => None,
            };
            statuses.push((
                node,
                NodeStatus {
                    reachability: parse_column::<Reachability>("reachability", reachability)?,
                    capabilities,
                    checked_at: checked_at.map(ms_to_dt),
                    message,
                },
            ));
        }
        Ok(statuses)
    }

    fn bind_policy(&self, binding: &PolicyBinding) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let p = &binding.policy;
        conn.execute(
            "INSERT OR REPLACE INTO policy_bindings
             (node, dataset, policy, hourly, daily, weekly, monthly, yearly, autosnap, autoprune, applied_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                binding.node,
                binding.dataset,
                p.name,
                p.hourly,
                p.daily,
                p.weekly,
                p.monthly,
                p.yearly,
                p.autosnap,
                p.autoprune,
                dt_to_ms(binding.applied_at),
            ],
        )?;
        Ok(())
    }

    fn bindings(&self) -> Result<Vec<PolicyBinding>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT node, dataset, policy, hourly, daily, weekly, monthly, yearly, autosnap, autoprune, applied_at_ms
             FROM policy_bindings ORDER BY node, dataset",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(PolicyBinding {
                node: row.get(0)?,
                dataset: row.get(1)?,
                policy: SnapshotPolicy {
                    name: row.get(2)?,
                    hourly: row.get(3)?,
                    daily: row.get(4)?,
                    weekly: row.get(5)?,
                    monthly: row.get(6)?,
                    yearly: row.get(7)?,
                    autosnap: row.get(8)?,
                    autoprune: row.get(9)?,
                },
                applied_at: ms_to_dt(row.get(10)?),
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }
}

/// Row as stored, before enum columns are parsed.
struct RawRun {
    id: i64,
    job: String,
    trigger: String,
    state: String,
    scheduled_for_ms: Option<i64>,
    created_at_ms: i64,
    started_at_ms: Option<i64>,
    finished_at_ms: Option<i64>,
    bytes_transferred: Option<i64>,
    error_class: Option<String>,
    error_message: Option<String>,
}

impl RawRun {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            job: row.get(1)?,
            trigger: row.get(2)?,
            state: row.get(3)?,
            scheduled_for_ms: row.get(4)?,
            created_at_ms: row.get(5)?,
            started_at_ms: row.get(6)?,
            finished_at_ms: row.get(7)?,
            bytes_transferred: row.get(8)?,
            error_class: row.get(9)?,
            error_message: row.get(10)?,
        })
    }

    fn into_run(self) -> Result<JobRun, StoreError> {
        Ok(JobRun {
            id: self.id,
            job: self.job,
            trigger: parse_column("trigger", self.trigger)?,
            state: parse_column("state", self.state)?,
            scheduled_for: self.scheduled_for_ms.map(ms_to_dt),
            created_at: ms_to_dt(self.created_at_ms),
            started_at: self.started_at_ms.map(ms_to_dt),
            finished_at: self.finished_at_ms.map(ms_to_dt),
            bytes_transferred: self.bytes_transferred.map(|b| b.max(0) as u64),
            error_class: self
                .error_class
                .map(|c| parse_column("error_class", c))
                .transpose()?,
            error_message: self.error_message,
        })
    }
}

fn parse_column<T: std::str::FromStr>(column: &'static str, value: String) -> Result<T, StoreError> {
    value
        .parse()
        .map_err(|_| StoreError::Corrupt { column, value })
}

fn dt_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn ms_to_dt(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}
