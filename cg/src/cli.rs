//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;

use crate::scheduler::RetryPlacement;

/// Callgate - admission and retry scheduler for rate-limited backends
#[derive(Parser)]
#[command(
    name = "cg",
    about = "Admission, rate-limit and retry scheduler for calls to a rate-limited backend",
    version = env!("CARGO_PKG_VERSION"),
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
    /// Drive the scheduler against a simulated backend
    Simulate {
        /// Number of calls to make
        #[arg(short, long, default_value = "10")]
        tasks: usize,

        /// Probability a call is throttled (overrides config)
        #[arg(long)]
        throttle_rate: Option<f64>,

        /// Probability a call fails terminally (overrides config)
        #[arg(long)]
        failure_rate: Option<f64>,

        /// Latency of each call in milliseconds (overrides config)
        #[arg(long)]
        latency_ms: Option<u64>,

        /// RNG seed for a reproducible run (overrides config)
        #[arg(long)]
        seed: Option<u64>,

        /// Where retries rejoin the queue: front, back, or fair (overrides config)
        #[arg(long)]
        retry_placement: Option<RetryPlacement>,

        /// Submit every call at once instead of running them as a batch
        #[arg(long)]
        concurrent: bool,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Show the effective configuration
    Config,
}

/// Output format for simulation results
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        debug!(%s, "OutputFormat::from_str: called");
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => {
                debug!(%s, "OutputFormat::from_str: unknown format");
                Err(format!("Unknown format: {}. Use: text or json", s))
            }
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Get the log file path
pub fn get_log_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("callgate")
        .join("logs")
        .join("callgate.log")
}
