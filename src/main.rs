use clap::{Parser, Subcommand};
use console::style;
use db_backup_engine::backup::{BackupEngine, Scheduler};
use db_backup_engine::config::{self, AppConfig};
use db_backup_engine::credentials::{load_or_create_master_key, Credential, CredentialStore};
use db_backup_engine::error::{BackupError, Result};
use db_backup_engine::ledger::{RunLedger, RunRecord, RunStatus, Trigger};
use db_backup_engine::log;
use db_backup_engine::probe::ProbeResult;
use db_backup_engine::web::{self, AppState};
use dialoguer::{Input, Password};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "db-backup", version, about = "Scheduled database dumps to local, blob and FTP destinations")]
struct Cli {
    /// Configuration file (defaults to ~/.db_backup_engine/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the scheduler and the status API until interrupted
    Serve,
    /// Run one job now and wait for it to finish
    Run { job: String },
    /// Check that a server or destination is reachable
    Probe {
        #[command(subcommand)]
        target: ProbeTarget,
    },
    /// List the databases on a server
    Databases { server: String },
    /// Show recent runs, newest first
    Runs {
        #[arg(long)]
        job: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Validate every job in the configuration
    Validate,
    /// Manage the encrypted credential store
    Credential {
        #[command(subcommand)]
        action: CredentialAction,
    },
}

#[derive(Debug, Subcommand)]
enum ProbeTarget {
    Server { id: String },
    Destination { id: String },
}

#[derive(Debug, Subcommand)]
enum CredentialAction {
    /// Add or replace a credential; the secret is prompted for
    Set {
        id: String,
        #[arg(long)]
        username: Option<String>,
    },
    Remove { id: String },
    List,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    log::init(&cli.log_level);

    let config_file = cli.config.clone().unwrap_or_else(config::config_path);
    let code = match dispatch(cli.command, &config_file).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            1
        }
    };
    std::process::exit(code);
}

async fn dispatch(command: Command, config_file: &Path) -> Result<i32> {
    let config = config::load_from(config_file)?;

    match command {
        Command::Serve => serve(config, config_file).await,
        Command::Run { job } => {
            let engine = open_engine(config, config_file)?;
            match engine.run_job(&job, Trigger::Manual).await? {
                Some(record) => {
                    print_run(&record);
                    Ok(if record.status == RunStatus::Succeeded { 0 } else { 2 })
                }
                None => {
                    println!("{} job '{}' is already running", style("!").yellow(), job);
                    Ok(3)
                }
            }
        }
        Command::Probe { target } => {
            let engine = open_engine(config, config_file)?;
            let (label, result) = match target {
                ProbeTarget::Server { id } => (format!("server '{}'", id), engine.probe_server(&id).await?),
                ProbeTarget::Destination { id } => {
                    (format!("destination '{}'", id), engine.probe_destination(&id).await?)
                }
            };
            match result {
                ProbeResult::Reachable => {
                    println!("{} {} is reachable", style("✓").green(), label);
                    Ok(0)
                }
                ProbeResult::Unreachable { reason } => {
                    println!("{} {} is unreachable: {}", style("✗").red(), label, reason);
                    Ok(1)
                }
            }
        }
        Command::Databases { server } => {
            let engine = open_engine(config, config_file)?;
            for name in engine.list_databases(&server).await? {
                println!("{}", name);
            }
            Ok(0)
        }
        Command::Runs { job, limit } => {
            let ledger = RunLedger::open(&config.ledger_path(config_file), config.engine.history_limit)?;
            let runs = ledger.list(job.as_deref(), limit).await;
            if runs.is_empty() {
                println!("{}", style("No runs recorded").dim());
            }
            for record in &runs {
                print_run(record);
            }
            Ok(0)
        }
        Command::Validate => {
            let problems = config.validate();
            if problems.is_empty() {
                println!("{} {} job(s) valid", style("✓").green(), config.jobs.len());
                return Ok(0);
            }
            for problem in &problems {
                println!("{} {}", style("✗").red(), problem);
            }
            Ok(1)
        }
        Command::Credential { action } => manage_credentials(action, &config, config_file),
    }
}

fn open_store(config: &AppConfig, config_file: &Path) -> Result<CredentialStore> {
    let path = config.credentials_path(config_file);
    let key_file = path
        .parent()
        .map(|p| p.join("master.key"))
        .unwrap_or_else(|| PathBuf::from("master.key"));
    let key = load_or_create_master_key(&key_file)?;
    CredentialStore::open(&path, &key)
}

fn open_engine(config: AppConfig, config_file: &Path) -> Result<Arc<BackupEngine>> {
    let credentials = open_store(&config, config_file)?;
    let ledger = RunLedger::open(&config.ledger_path(config_file), config.engine.history_limit)?;
    Ok(Arc::new(BackupEngine::new(
        Arc::new(config),
        Arc::new(credentials),
        Arc::new(ledger),
    )))
}

async fn serve(config: AppConfig, config_file: &Path) -> Result<i32> {
    info!("Database backup engine starting...");

    let shutdown = Arc::new(AtomicUsize::new(0));
    let shutdown_clone = shutdown.clone();

    ctrlc::set_handler(move || {
        let count = shutdown_clone.fetch_add(1, Ordering::SeqCst);

        if count == 0 {
            println!("\n\nShutdown signal received. Press Ctrl+C again to force exit...");
        } else {
            println!("\nForce exiting...");
            std::process::exit(130);
        }
    })
    .expect("Error setting Ctrl-C handler");

    let web_config = config.web.clone();
    let job_ids: Vec<String> = config.jobs.iter().map(|j| j.id.clone()).collect();
    let engine = open_engine(config, config_file)?;
    let scheduler = Arc::new(Scheduler::new(engine.clone()).await);

    let web_handle = if web_config.enabled {
        let state = AppState::new(engine.clone(), Some(scheduler.clone()));
        Some(tokio::spawn(web::start_server(state, web_config.port, shutdown.clone())))
    } else {
        info!("Status API disabled");
        None
    };

    scheduler.run(shutdown.clone()).await;

    if let Some(handle) = web_handle {
        if let Err(e) = handle.await {
            warn!("Status API task ended abnormally: {}", e);
        }
    }

    let running = || job_ids.iter().filter(|id| engine.is_running(id)).count();
    if running() > 0 {
        info!("Waiting for {} running job(s) to finish", running());
        while running() > 0 {
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    info!("Application exited normally");
    Ok(0)
}

fn manage_credentials(action: CredentialAction, config: &AppConfig, config_file: &Path) -> Result<i32> {
    let mut store = open_store(config, config_file)?;

    match action {
        CredentialAction::Set { id, username } => {
            let username = match username {
                Some(u) => Some(u),
                None => {
                    let entered: String = Input::new()
                        .with_prompt("Username (empty for none)")
                        .allow_empty(true)
                        .interact_text()
                        .map_err(prompt_error)?;
                    Some(entered).filter(|u| !u.is_empty())
                }
            };
            let secret = Password::new()
                .with_prompt(format!("Secret for '{}'", id))
                .interact()
                .map_err(prompt_error)?;

            store.put(&id, &Credential::new(username, secret))?;
            println!("{} credential '{}' saved", style("✓").green(), id);
        }
        CredentialAction::Remove { id } => {
            if store.remove(&id)? {
                println!("{} credential '{}' removed", style("✓").green(), id);
            } else {
                println!("{} no credential named '{}'", style("!").yellow(), id);
                return Ok(1);
            }
        }
        CredentialAction::List => {
            for id in store.ids() {
                let users: Vec<&str> = config
                    .servers
                    .iter()
                    .filter(|s| s.credential_ref == id)
                    .map(|s| s.id.as_str())
                    .chain(
                        config
                            .destinations
                            .iter()
                            .filter(|d| d.credential_ref() == Some(id.as_str()))
                            .map(|d| d.id()),
                    )
                    .collect();
                if users.is_empty() {
                    println!("{} {}", id, style("(unused)").dim());
                } else {
                    println!("{} {}", id, style(format!("used by {}", users.join(", "))).dim());
                }
            }
        }
    }
    Ok(0)
}

fn prompt_error(err: dialoguer::Error) -> BackupError {
    BackupError::Config(format!("prompt failed: {}", err))
}

fn print_run(record: &RunRecord) {
    let status = match record.status {
        RunStatus::Succeeded => style(record.status.to_string()).green(),
        RunStatus::PartialFailure => style(record.status.to_string()).yellow(),
        RunStatus::Failed => style(record.status.to_string()).red(),
        RunStatus::Pending | RunStatus::Running => style(record.status.to_string()).cyan(),
    };
    println!(
        "#{} {} [{}] {} {:?}",
        record.id,
        style(&record.job_id).bold(),
        status,
        record.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
        record.trigger
    );
    if let Some(failure) = &record.failure {
        println!("    {:?}: {}", failure.kind, failure.message);
    }
    for (destination, outcome) in &record.destinations {
        let location = outcome.location.as_deref().unwrap_or("-");
        println!(
            "    {} {:?} retries={} {}",
            destination, outcome.status, outcome.retry_count, location
        );
        if let Some(message) = &outcome.message {
            println!("      {}", style(message).dim());
        }
    }
}
