use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use zsync_orchestrator::config::{Config, LogFormat, Mode};
use zsync_orchestrator::{
    ConfigStore, Engine, EngineError, EngineParts, FileInventory, JobRun, LockedFile, LogAudit,
    LogNotifier, SqliteJobStore, SshConnector, TriggerOutcome,
};

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Pretty => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }
}

fn build_engine(cli: &Config) -> Result<Engine, EngineError> {
    let config = Arc::new(FileInventory::new(cli.inventory.clone()));
    // The connector is built before the engine, so it reads its timeout from its own load.
    let connect_timeout = config.load()?.settings.connect_timeout();
    Engine::new(EngineParts {
        config,
        store: Arc::new(SqliteJobStore::open(&cli.database)?),
        connector: Arc::new(SshConnector::new(connect_timeout)),
        notifier: Arc::new(LogNotifier),
        audit: Arc::new(LogAudit),
    })
}

fn print_run(run: &JobRun) {
    let when = |t: Option<chrono::DateTime<chrono::Utc>>| {
        t.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string())
    };
    println!(
        "{:>6}  {:<24} {:<9} {:<7}  {}  {}  {:>14}  {}",
        run.id,
        run.job,
        run.trigger,
        run.state,
        when(run.started_at),
        when(run.finished_at),
        run.bytes_transferred
            .map(|b| b.to_string())
            .unwrap_or_else(|| "-".to_string()),
        match (&run.error_class, &run.error_message) {
            (Some(class), Some(message)) => format!("{}: {}", class, message),
            (Some(class), None) => class.to_string(),
            _ => String::new(),
        }
    );
}

async fn run_daemon(cli: &Config) -> Result<(), EngineError> {
    let _lock = LockedFile::for_path(&cli.database)?;
    let engine = build_engine(cli)?;

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown requested.");
        let _ = stop_tx.send(true);
    });

    engine.serve(stop_rx).await
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[tokio::main]
async fn main() -> Result<(), EngineError> {
    let cli = Config::parse();
    init_logging(cli.log_format);

    match &cli.mode {
        Mode::Run => run_daemon(&cli).await?,
        Mode::Trigger { job, wait } => {
            let engine = build_engine(&cli)?;
            match engine.trigger_run(job, "cli")? {
                TriggerOutcome::Accepted(run_id) if *wait => {
                    let run = engine.execute_run(run_id).await?;
                    print_run(&run);
                    engine.executor().close_all().await;
                }
                TriggerOutcome::Accepted(run_id) => println!("accepted: run {}", run_id),
                TriggerOutcome::AlreadyRunning(run_id) => {
                    println!("already running: run {}", run_id)
                }
            }
        }
        Mode::History(args) => {
            let engine = build_engine(&cli)?;
            for run in engine.run_history(&args.filter())? {
                print_run(&run);
            }
        }
        Mode::Steps { run_id } => {
            let engine = build_engine(&cli)?;
            for step in engine.run_steps(*run_id)? {
                println!(
                    "{}  {:<16} {:<4} {}",
                    step.at.format("%Y-%m-%d %H:%M:%S"),
                    step.step,
                    if step.ok { "ok" } else { "FAIL" },
                    step.message
                );
            }
        }
        Mode::TestNode { node } => {
            let engine = build_engine(&cli)?;
            let report = engine.test_node(node).await?;
            println!("{}: {} ({})", report.node, report.reachability, report.message);
            if let Some(caps) = report.capabilities {
                println!(
                    "  snapshot tool: {}, replication tool: {}",
                    caps.snapshot_tool, caps.replication_tool
                );
            }
            engine.executor().close_all().await;
        }
        Mode::Datasets { node } => {
            let engine = build_engine(&cli)?;
            for dataset in engine.discover_datasets(node).await? {
                println!(
                    "{:<48} {:>8} {:>8}  {}",
                    dataset.path,
                    dataset.used.as_deref().unwrap_or("-"),
                    dataset.available.as_deref().unwrap_or("-"),
                    dataset.policy.as_deref().unwrap_or("-")
                );
            }
            engine.executor().close_all().await;
        }
        Mode::ApplyPolicy {
            node,
            dataset,
            policy,
        } => {
            let engine = build_engine(&cli)?;
            let outcome = engine.apply_policy(node, dataset, policy).await?;
            println!("{}:{} -> {}: {:?}", node, dataset, policy, outcome);
            engine.executor().close_all().await;
        }
        Mode::Prune { days } => {
            let engine = build_engine(&cli)?;
            println!("deleted {} runs", engine.prune(*days)?);
        }
        Mode::Validate => {
            let inventory = FileInventory::new(cli.inventory.clone()).load()?;
            println!(
                "{}: {} nodes, {} policies, {} jobs ({} enabled)",
                cli.inventory,
                inventory.nodes.len(),
                inventory.policies.len(),
                inventory.jobs.len(),
                inventory.enabled_jobs().count()
            );
        }
    };

    Ok(())
}
