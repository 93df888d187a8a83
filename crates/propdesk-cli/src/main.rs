use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use propdesk_core::config::PropdeskConfig;
use propdesk_scheduler::handlers::{builtin_registry, Collaborators};
use propdesk_scheduler::{default_catalog, Frequency, SqliteTaskStore, SystemClock, TaskManager, TaskStatus};
use tokio_util::sync::CancellationToken;
use tracing::info;

mod backoffice;
mod cli;
mod render;
mod smtp;

use backoffice::BackOffice;
use cli::{Cli, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "propdesk=info,propdesk_scheduler=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // load config: --config > PROPDESK_CONFIG env > ~/.propdesk/propdesk.toml
    let config_path = cli.config.clone().or_else(|| std::env::var("PROPDESK_CONFIG").ok());
    let config = PropdeskConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        tracing::warn!(code = e.code(), "Config load failed ({}), using defaults", e);
        PropdeskConfig::default()
    });

    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening SQLite database");

    // each subsystem gets its own connection
    let office = Arc::new(BackOffice::new(open_db(db_path)?)?);
    let store = Arc::new(SqliteTaskStore::new(open_db(db_path)?)?);
    let mail = Arc::new(smtp::SmtpProbe::from_config(&config.mail));

    let registry = builtin_registry(Collaborators {
        ledger: office.clone(),
        mail,
        audit: office.clone(),
    })?;
    let catalog = default_catalog();
    registry.validate(catalog.iter().map(|e| e.task_type.as_str()))?;

    let manager = Arc::new(
        TaskManager::new(store, registry, Arc::new(SystemClock)).configure(&config.scheduler),
    );

    dispatch(cli.command, &config, manager, &office).await
}

async fn dispatch(
    command: Command,
    config: &PropdeskConfig,
    manager: Arc<TaskManager>,
    office: &BackOffice,
) -> anyhow::Result<()> {
    match command {
        Command::Bootstrap => {
            let report = manager.create_default_tasks()?;
            audit(office, &manager, "tasks.bootstrap");
            print!("{}", render::bootstrap_summary(&report));
        }
        Command::List { json } => {
            let tasks = manager.list()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&tasks)?);
            } else {
                print!("{}", render::task_table(&tasks));
            }
        }
        Command::Inspect { id, json } => {
            let task = manager.inspect(&id)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&task)?);
            } else {
                print!("{}", render::task_detail(&task));
            }
        }
        Command::Run { id } => {
            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    on_interrupt.cancel();
                }
            });

            audit(office, &manager, &format!("task.run {id}"));
            let summary = manager.execute_one_cancellable(&id, &cancel).await?;
            println!("{summary}");
        }
        Command::RunDue => {
            let report = manager.run_due(manager.now()).await?;
            print!("{}", render::sweep_summary(&report));
        }
        Command::Activate { id } => {
            let task = manager.set_status(&id, TaskStatus::Active)?;
            audit(office, &manager, &format!("task.activate {id}"));
            println!("{} is {}", task.name, task.status);
        }
        Command::Deactivate { id } => {
            let task = manager.set_status(&id, TaskStatus::Inactive)?;
            audit(office, &manager, &format!("task.deactivate {id}"));
            println!("{} is {}", task.name, task.status);
        }
        Command::SetFrequency { id, frequency } => {
            let frequency: Frequency = frequency.parse()?;
            let task = manager.set_frequency(&id, frequency)?;
            audit(office, &manager, &format!("task.set_frequency {id} {frequency}"));
            match task.next_run_at {
                Some(next) => println!("{} now runs {}, next at {next}", task.name, task.frequency),
                None => println!("{} now runs {}", task.name, task.frequency),
            }
        }
        Command::Delete { id } => {
            manager.delete(&id)?;
            audit(office, &manager, &format!("task.delete {id}"));
            println!("deleted {id}");
        }
        Command::Serve => {
            if config.scheduler.bootstrap_on_start {
                let report = manager.create_default_tasks()?;
                info!(
                    created = report.created,
                    updated = report.updated,
                    errors = report.errors.len(),
                    "default tasks bootstrapped"
                );
            }

            let tick = Duration::from_secs(config.scheduler.tick_secs.max(1));
            let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
            let engine = tokio::spawn(Arc::clone(&manager).run(tick, shutdown_rx));

            tokio::signal::ctrl_c().await?;
            info!("interrupt received, stopping scheduler");
            let _ = shutdown_tx.send(true);
            engine.await?;
        }
    }
    Ok(())
}

/// Audit failures are logged, never fatal to the operator command.
fn audit(office: &BackOffice, manager: &TaskManager, action: &str) {
    if let Err(e) = office.record(action, manager.now()) {
        tracing::warn!(%action, "audit log write failed: {e}");
    }
}

fn open_db(path: &str) -> anyhow::Result<rusqlite::Connection> {
    let db = rusqlite::Connection::open(path)?;
    db.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;")?;
    Ok(db)
}

/// Create the parent directory of a file path if it doesn't exist.
fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }
}
