//! Command line arguments.
//!
//! Everything that describes the fleet lives in the inventory file; the command line only
//! selects what to do and where the inventory and the run database are.

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};

use crate::job::{RunFilter, RunState, Trigger};

#[derive(Parser)]
#[command(version, author, about)]
pub struct Config {
    #[command(subcommand)]
    pub mode: Mode,

    /// Inventory file with settings, nodes, policies and jobs.
    #[arg(long, global = true, default_value = "inventory.yaml")]
    pub inventory: String,

    /// SQLite database holding run history and node state.
    #[arg(long, global = true, default_value = "zsync.db")]
    pub database: String,

    /// Log output format. The filter comes from RUST_LOG (default `info`).
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

#[derive(Subcommand)]
pub enum Mode {
    /// Run the scheduler until interrupted
    Run,
    /// Request an immediate run of a job
    Trigger {
        job: String,
        /// Execute the run here and wait for it instead of leaving it to the daemon
        #[arg(long)]
        wait: bool,
    },
    /// Show run history, newest first
    History(HistoryArgs),
    /// Show the steps recorded for one run
    Steps { run_id: i64 },
    /// Test connectivity and installed tools of a node
    TestNode { node: String },
    /// List the datasets of a node and their snapshot policies
    Datasets { node: String },
    /// Bind a snapshot policy to a dataset and write it to the node
    ApplyPolicy {
        node: String,
        dataset: String,
        policy: String,
    },
    /// Delete finished runs older than the given number of days
    Prune {
        #[arg(long)]
        days: u32,
    },
    /// Check the inventory and exit
    Validate,
}

#[derive(clap::Args)]
pub struct HistoryArgs {
    #[arg(long)]
    pub job: Option<String>,
    #[arg(long, value_parser = parse_state)]
    pub state: Option<RunState>,
    #[arg(long, value_parser = parse_trigger)]
    pub trigger: Option<Trigger>,
    /// RFC 3339 timestamp, e.g. 2026-10-16T08:00:00Z
    #[arg(long)]
    pub since: Option<DateTime<Utc>>,
    /// RFC 3339 timestamp
    #[arg(long)]
    pub until: Option<DateTime<Utc>>,
    #[arg(long, default_value = "50")]
    pub limit: usize,
}

impl HistoryArgs {
    pub fn filter(&self) -> RunFilter {
        RunFilter {
            job: self.job.clone(),
            state: self.state,
            trigger: self.trigger,
            since: self.since,
            until: self.until,
            limit: Some(self.limit),
        }
    }
}

fn parse_state(s: &str) -> Result<RunState, String> {
    s.parse()
}

fn parse_trigger(s: &str) -> Result<Trigger, String> {
    s.parse()
}

#[derive(PartialEq, Eq, Clone, Copy, ValueEnum)]
pub enum LogFormat {
    Pretty,
    Json,
}
