use std::future::Future;
use std::sync::Arc;

use chrono::{Duration, Utc};
use clap::Parser;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use duebell_core::DuebellConfig;
use duebell_scheduler::{expand_snapshots, ReminderEngine, SqliteTaskStore, TaskStore};

mod cli;
mod delivery;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "duebell_daemon=info,duebell_scheduler=info".into()),
        )
        .init();

    let cli = Cli::parse();

    // load config: --config > DUEBELL_CONFIG env > ~/.duebell/duebell.toml
    let config_path = cli.config_path(std::env::var("DUEBELL_CONFIG").ok());
    let config = DuebellConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        DuebellConfig::default()
    });

    match cli.command() {
        Commands::Run => run(config).await,
        Commands::Preview { task_id, hours } => preview(&config, task_id, hours),
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn run(config: DuebellConfig) -> anyhow::Result<()> {
    let store = Arc::new(open_store(&config.database.path)?);
    let notifier = delivery::build_notifier(&config.delivery)?;
    let engine = ReminderEngine::new(&config.reminder, store, notifier)?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut worker = tokio::spawn(engine.run(shutdown_rx));
    info!("duebell reminder daemon running");

    until_signal_or_crash(&mut worker, wait_for_signal()).await?;

    // signal the engine to drain and stop
    let _ = shutdown_tx.send(true);
    worker.await?;
    info!("duebell reminder daemon stopped");
    Ok(())
}

/// Wait for `signal`, failing early if the engine worker exits first.
///
/// The engine only returns after a shutdown request, so an early exit is a crash.
async fn until_signal_or_crash(
    worker: &mut JoinHandle<()>,
    signal: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    tokio::select! {
        () = signal => Ok(()),
        res = worker => {
            res?;
            anyhow::bail!("reminder engine exited unexpectedly")
        }
    }
}

fn preview(config: &DuebellConfig, task_id: Option<i64>, hours: u32) -> anyhow::Result<()> {
    let tz = config.reminder.tz()?;
    let store = open_store(&config.database.path)?;
    let tasks = match task_id {
        Some(id) => match store.find_task(id)? {
            Some(task) => vec![task],
            None => anyhow::bail!("task {id} not found"),
        },
        None => store.list_tasks()?,
    };

    let now = Utc::now();
    let end = now + Duration::hours(i64::from(hours));
    let mut printed = 0;
    for task in &tasks {
        for (record, snapshot) in expand_snapshots(task, now, end, tz) {
            println!(
                "{record}  due {}  {}",
                snapshot.due_at.with_timezone(&tz).to_rfc3339(),
                snapshot.name
            );
            printed += 1;
        }
    }
    if printed == 0 {
        println!("no reminders in the next {hours}h ({} task(s) checked)", tasks.len());
    }
    Ok(())
}

fn open_store(db_path: &str) -> anyhow::Result<SqliteTaskStore> {
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening SQLite database");
    let conn = rusqlite::Connection::open(db_path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    Ok(SqliteTaskStore::new(conn)?)
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}

/// Resolve on SIGTERM or SIGINT (Ctrl+C elsewhere).
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler; waiting for Ctrl+C");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            res = tokio::signal::ctrl_c() => match res {
                Ok(()) => info!("received SIGINT"),
                Err(e) => error!(error = %e, "failed to listen for Ctrl+C"),
            },
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            return;
        }
        info!("received Ctrl+C");
    }
}
