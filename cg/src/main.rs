//! Callgate - admission and retry scheduler
//!
//! CLI entry point for exercising the scheduler against a simulated backend.

use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result};
use futures::FutureExt;
use serde::Serialize;
use tracing::{debug, info};

use callgate::cli::{Cli, Command, OutputFormat, get_log_path};
use callgate::config::Config;
use callgate::error::{BackendError, CallError};
use callgate::simulate::SimulatedBackend;
use callgate::{BatchError, BatchHooks, BatchRunner, RetryPlacement, Scheduler, SchedulerStats};

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    // Note: Can't log params here since logging isn't initialized yet
    let log_path = get_log_path();
    let log_dir = log_path.parent().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    // Determine log level with priority: CLI --log-level > config file > default (INFO)
    let level = match cli_log_level.or(config_log_level) {
        Some(s) => match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    let log_file = fs::File::create(&log_path).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load log level from config file early (before full config load)
    let config_log_level = Config::load_log_level(cli.config.as_ref());

    // Setup logging with priority: CLI > config > INFO default
    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;

    // Load configuration
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Command::Simulate {
            tasks,
            throttle_rate,
            failure_rate,
            latency_ms,
            seed,
            retry_placement,
            concurrent,
            format,
        } => {
            let mut config = config;
            let sim = &mut config.simulation;
            sim.throttle_rate = throttle_rate.unwrap_or(sim.throttle_rate);
            sim.failure_rate = failure_rate.unwrap_or(sim.failure_rate);
            sim.latency_ms = latency_ms.unwrap_or(sim.latency_ms);
            sim.seed = seed.or(sim.seed);
            if let Some(placement) = retry_placement {
                config.scheduler.retry_placement = placement;
            }
            cmd_simulate(&config, tasks, concurrent, format).await
        }
        Command::Config => cmd_config(&config),
    }
}

/// Result of one simulated call
#[derive(Debug, Serialize)]
struct Outcome {
    index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    call: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct SimulationReport {
    mode: &'static str,
    placement: RetryPlacement,
    tasks: usize,
    succeeded: usize,
    failed: usize,
    backend_calls: u64,
    peak_in_flight: usize,
    elapsed_ms: u128,
    outcomes: Vec<Outcome>,
    stats: SchedulerStats,
}

async fn cmd_simulate(config: &Config, tasks: usize, concurrent: bool, format: OutputFormat) -> Result<()> {
    debug!(tasks, concurrent, %format, "cmd_simulate: called");
    config.validate().context("Invalid configuration")?;

    let scheduler = Scheduler::new(config.scheduler.clone());
    let backend = SimulatedBackend::new(config.simulation.clone());
    let start = Instant::now();

    let mut outcomes = if concurrent {
        run_concurrent(&scheduler, &backend, tasks).await
    } else {
        run_batch(&scheduler, &backend, tasks).await
    };
    outcomes.sort_by_key(|o| o.index);

    let succeeded = outcomes.iter().filter(|o| o.error.is_none()).count();
    let report = SimulationReport {
        mode: if concurrent { "concurrent" } else { "batch" },
        placement: config.scheduler.retry_placement,
        tasks,
        succeeded,
        failed: tasks - succeeded,
        backend_calls: backend.calls(),
        peak_in_flight: backend.peak_in_flight(),
        elapsed_ms: start.elapsed().as_millis(),
        outcomes,
        stats: scheduler.stats(),
    };
    info!(
        tasks,
        succeeded = report.succeeded,
        backend_calls = report.backend_calls,
        "Simulation finished"
    );

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&report).context("Failed to serialize report")?);
        }
        OutputFormat::Text => print_report(&report),
    }
    Ok(())
}

async fn run_batch(scheduler: &Scheduler, backend: &std::sync::Arc<SimulatedBackend>, tasks: usize) -> Vec<Outcome> {
    let works = (0..tasks).map(|index| {
        let mut call = backend.work();
        move || call().map(move |result| result.map(|n| (index, n)))
    });

    let mut failures = Vec::new();
    let hooks = BatchHooks::new()
        .on_progress(|done, total| debug!(done, total, "run_batch: progress"))
        .on_error(|error: &CallError<BackendError>, index| failures.push((index, error.to_string())));

    let succeeded = match BatchRunner::new(scheduler.clone()).run(works, hooks).await {
        Ok(results) => results,
        Err(BatchError::AllFailed { failed, .. }) => {
            debug!(failed, "run_batch: every call failed");
            Vec::new()
        }
    };

    succeeded
        .into_iter()
        .map(|(index, n)| Outcome {
            index,
            call: Some(n),
            error: None,
        })
        .chain(failures.into_iter().map(|(index, error)| Outcome {
            index,
            call: None,
            error: Some(error),
        }))
        .collect()
}

async fn run_concurrent(
    scheduler: &Scheduler,
    backend: &std::sync::Arc<SimulatedBackend>,
    tasks: usize,
) -> Vec<Outcome> {
    let handles: Vec<_> = (0..tasks).map(|_| scheduler.submit(backend.work())).collect();

    futures::future::join_all(handles)
        .await
        .into_iter()
        .enumerate()
        .map(|(index, result)| match result {
            Ok(n) => Outcome {
                index,
                call: Some(n),
                error: None,
            },
            Err(e) => Outcome {
                index,
                call: None,
                error: Some(e.to_string()),
            },
        })
        .collect()
}

fn print_report(report: &SimulationReport) {
    println!(
        "{} {} tasks ({} mode, {} retry placement)",
        "Simulated".bold(),
        report.tasks,
        report.mode,
        report.placement
    );
    println!();

    for outcome in &report.outcomes {
        match (&outcome.call, &outcome.error) {
            (Some(n), _) => println!("  #{:<4} {} (backend call {})", outcome.index, "ok".green(), n),
            (None, Some(error)) => println!("  #{:<4} {} {}", outcome.index, "failed".red(), error),
            (None, None) => println!("  #{:<4} {}", outcome.index, "unknown".yellow()),
        }
    }

    let counters = &report.stats.counters;
    println!();
    println!("{}", "Summary".bold());
    println!("  Succeeded:       {}", report.succeeded.to_string().green());
    println!("  Failed:          {}", report.failed.to_string().red());
    println!("  Backend calls:   {}", report.backend_calls);
    println!("  Retries:         {}", counters.total_retries);
    println!("  Peak in flight:  {}", report.peak_in_flight);
    println!("  Peak queue:      {}", counters.peak_queue_depth);
    println!(
        "  Rate window:     {} ({:.1}%)",
        report.stats.requests_last_minute, report.stats.utilization_percentage
    );
    println!("  Elapsed:         {} ms", report.elapsed_ms);
}

fn cmd_config(config: &Config) -> Result<()> {
    debug!("cmd_config: called");
    let yaml = serde_yaml::to_string(config).context("Failed to serialize config")?;
    print!("{}", yaml);
    Ok(())
}
