//! Station - host agent entry point
//!
//! Parses the CLI, loads configuration, installs host logging and dispatches
//! to one command.

use std::fs;
use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use station::cli::{Cli, Command};
use station::collaborators::Collaborators;
use station::config::{Config, ConfigError};
use station::events::{ActivityEvent, ActivityKind, EventBuses, MetricsSnapshot, SubscribeOptions};
use station::identity::{IdentityOptions, get_or_create_identity};
use station::lock::RunLock;
use station::log::TailOptions;
use station::paths::StatePaths;
use station::supervisor::{Supervisor, SupervisorContext, SupervisorOptions};

fn setup_logging(log_path: &Path, cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    // Note: Can't log params here since logging isn't initialized yet
    if let Some(dir) = log_path.parent() {
        fs::create_dir_all(dir).context("Failed to create log directory")?;
    }

    // Priority: CLI --log-level > config file > default (INFO)
    let level = match cli_log_level.or(config_log_level).map(str::to_uppercase).as_deref() {
        Some("TRACE") => tracing::Level::TRACE,
        Some("DEBUG") => tracing::Level::DEBUG,
        Some("INFO") | None => tracing::Level::INFO,
        Some("WARN") | Some("WARNING") => tracing::Level::WARN,
        Some("ERROR") => tracing::Level::ERROR,
        Some(other) => {
            eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", other);
            tracing::Level::INFO
        }
    };

    let log_file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .context("Failed to open log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

/// `ConfigError` anywhere in the chain exits with 2, everything else with 1
fn exit_code(err: &eyre::Report) -> u8 {
    if err.chain().any(|cause| cause.downcast_ref::<ConfigError>().is_some()) {
        2
    } else {
        1
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(exit_code(&e))
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    let paths = config.paths();

    setup_logging(&paths.host_log(), cli.log_level.as_deref(), config.log_level.as_deref())
        .context("Failed to setup logging")?;
    info!(state_root = %paths.state_root().display(), "Station {}", env!("GIT_DESCRIBE"));

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Command::Run {
            recreate_station_id_on_error,
        } => {
            let mut config = config;
            config.recreate_station_id_on_error |= recreate_station_id_on_error;
            cmd_run(config, paths).await
        }
        Command::Activity { follow, lines } => cmd_activity(&config, &paths, follow, lines).await,
        Command::Metrics { follow } => cmd_metrics(&config, &paths, follow).await,
        Command::Logs { module, follow, lines } => cmd_logs(&config, &paths, module.as_deref(), follow, lines).await,
        Command::Id => cmd_id(&config, &paths),
    }
}

/// Cancelled on Ctrl-C or SIGTERM
fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = term.recv() => {}
                    }
                }
                Err(_) => {
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        info!("Shutdown signal received");
        token.cancel();
    });
    cancel
}

async fn cmd_run(config: Config, paths: StatePaths) -> Result<()> {
    debug!(modules = config.modules.len(), "cmd_run: called");
    config.validate()?;
    let wallet_address = config.wallet_address.clone().unwrap_or_default().trim().to_string();

    let _lock = RunLock::acquire(&paths)?;
    let identity = get_or_create_identity(&IdentityOptions::from_config(&config, &paths))?;
    let station_id = identity.public_key_hex();
    info!(%station_id, "Loaded station identity");

    let collaborators = Collaborators::local();
    let buses = EventBuses::open(&paths, &config, &collaborators);

    println!("Station {} running as {}", env!("GIT_DESCRIBE"), station_id);
    println!("Logs: {}", paths.logs_dir().display());

    let mut supervisor = Supervisor::new(SupervisorContext {
        modules: config.modules.clone(),
        paths,
        identity,
        wallet_address,
        buses,
        collaborators,
        options: SupervisorOptions::from(&config.supervisor),
    });
    supervisor.run(shutdown_token()).await?;

    println!("Station stopped");
    Ok(())
}

fn format_activity(event: &ActivityEvent) -> String {
    let stamp = event.timestamp.format("%Y-%m-%d %H:%M:%S").to_string();
    let line = format!("{} {}", event.source.bold(), event.message);
    match event.kind {
        ActivityKind::Info => format!("{} {}", stamp.dimmed(), line),
        ActivityKind::Error => format!("{} {}", stamp.dimmed(), line.red()),
    }
}

async fn cmd_activity(config: &Config, paths: &StatePaths, follow: bool, lines: usize) -> Result<()> {
    debug!(follow, lines, "cmd_activity: called");
    let buses = EventBuses::open(paths, config, &Collaborators::local());

    if !follow {
        let events = buses.activity.snapshot().context("Failed to read activity log")?;
        let start = events.len().saturating_sub(lines);
        for event in &events[start..] {
            println!("{}", format_activity(event));
        }
        return Ok(());
    }

    let cancel = shutdown_token();
    let mut sub = buses
        .activity
        .subscribe(SubscribeOptions::from_last_n(lines).with_cancel(cancel.clone()));
    while let Some(event) = sub.next().await {
        println!("{}", format_activity(&event));
    }
    Ok(())
}

fn format_metrics(metrics: &MetricsSnapshot) -> String {
    format!(
        "Jobs completed: {}  Rewards scheduled: {}",
        metrics.total_jobs_completed, metrics.rewards_scheduled
    )
}

async fn cmd_metrics(config: &Config, paths: &StatePaths, follow: bool) -> Result<()> {
    debug!(follow, "cmd_metrics: called");
    let buses = EventBuses::open(paths, config, &Collaborators::local());

    if !follow {
        println!("{}", format_metrics(&buses.metrics.latest()));
        return Ok(());
    }

    let cancel = shutdown_token();
    let mut sub = buses
        .metrics
        .subscribe(SubscribeOptions::from_last_n(1).with_cancel(cancel.clone()));
    while let Some(update) = sub.next().await {
        println!("{}", format_metrics(&update.metrics()));
    }
    Ok(())
}

async fn cmd_logs(config: &Config, paths: &StatePaths, module: Option<&str>, follow: bool, lines: usize) -> Result<()> {
    debug!(?module, follow, lines, "cmd_logs: called");
    let buses = EventBuses::open(paths, config, &Collaborators::local());
    let logs = &buses.logs;

    if !follow {
        let contents = match module {
            Some(m) => logs.get(m),
            None => logs.get_all(),
        }
        .context("Failed to read module log")?;
        let all_lines: Vec<&str> = contents.lines().collect();
        let start = all_lines.len().saturating_sub(lines);
        for line in &all_lines[start..] {
            println!("{}", line);
        }
        return Ok(());
    }

    let options = TailOptions::default().from_last_n(lines).cancel(shutdown_token());
    let mut stream = match module {
        Some(m) => logs.follow(m, options),
        None => logs.follow_all(options),
    };
    while let Some(line) = stream.next_line().await {
        println!("{}", line);
    }
    Ok(())
}

fn cmd_id(config: &Config, paths: &StatePaths) -> Result<()> {
    debug!("cmd_id: called");
    let identity = get_or_create_identity(&IdentityOptions::from_config(config, paths))?;
    println!("{}", identity.public_key_hex());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_for_config_error() {
        let err = eyre::Report::new(ConfigError::MissingWalletAddress).wrap_err("startup failed");
        assert_eq!(exit_code(&err), 2);
        assert_eq!(exit_code(&eyre::eyre!("module crashed")), 1);
    }
}
