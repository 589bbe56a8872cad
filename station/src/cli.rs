//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Station - supervises worker modules and records their activity
#[derive(Debug, Parser)]
#[command(
    name = "station",
    about = "Host agent that supervises worker modules and records their activity",
    version = env!("GIT_DESCRIBE"),
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the station: supervise all configured modules until Ctrl-C
    Run {
        /// Replace an unreadable identity keystore with a new identity
        #[arg(long)]
        recreate_station_id_on_error: bool,
    },

    /// Show module activity
    Activity {
        /// Keep printing new activity (like tail -f)
        #[arg(short, long)]
        follow: bool,

        /// Number of past events to show
        #[arg(short = 'n', long, default_value = "10")]
        lines: usize,
    },

    /// Show merged job and reward metrics
    Metrics {
        /// Keep printing metric updates
        #[arg(short, long)]
        follow: bool,
    },

    /// Show module logs
    Logs {
        /// Module name; all modules when omitted
        module: Option<String>,

        /// Follow log output (like tail -f)
        #[arg(short, long)]
        follow: bool,

        /// Number of lines to show
        #[arg(short = 'n', long, default_value = "50")]
        lines: usize,
    },

    /// Print the station id (hex public key), creating the identity if needed
    Id,
}
