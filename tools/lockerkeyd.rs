// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

/*!
Lockerkey daemon

Loads configuration, opens the rental ledger, reconciles it, then runs the
sensor sources, the timeout sweeper, the reconciler, and the audit logger
until Ctrl-C.

Usage:
  lockerkeyd --config lockerkey_configuration.toml [--debug-all | --debug-<crate>]
*/

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};

use lockerkey::config::{
    apply_cli_overrides, apply_environment_overrides, load_config, validate_config, ConfigError,
    LockerkeyConfig,
};
use lockerkey::hal::{sources, HardwareEventIngestor, SensorAddressResolver, SystemClock};
use lockerkey::observability::{
    debug_flags_help, init_console_logging, init_logging, CrateDebugFlags, LoggingGuard,
};
use lockerkey::services::{
    spawn_audit_logger, spawn_reconciler, spawn_timeout_sweeper, CoordinatorSettings,
    OutcomePublisher, ReconcileOptions, SqliteConsistencyManager, TransactionCoordinator,
};
use lockerkey::state_manager::TransactionRegistry;

/// Lockerkey daemon - sensor-confirmed locker rentals
#[derive(Parser, Debug)]
#[command(name = "lockerkeyd", version, author, long_about = None, after_help = debug_flags_help())]
struct Args {
    /// Path to lockerkey_configuration.toml (searched for when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run with built-in defaults when no configuration file is found
    #[arg(long, default_value_t = false)]
    allow_default_config: bool,

    /// SQLite database file
    #[arg(long)]
    database_path: Option<PathBuf>,

    /// Data directory (holds the default database file)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Base log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Base directory for per-run log folders
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Write JSON log files in addition to the console
    #[arg(long, default_value_t = false)]
    file_logging: bool,

    #[arg(long)]
    verification_timeout_seconds: Option<u64>,

    #[arg(long)]
    max_daily_rentals: Option<u32>,

    #[arg(long)]
    debounce_window_ms: Option<u64>,
}

impl Args {
    fn overrides(&self) -> HashMap<String, String> {
        let mut overrides = HashMap::new();
        let mut put = |key: &str, value: Option<String>| {
            if let Some(value) = value {
                overrides.insert(key.to_string(), value);
            }
        };
        put("database_path", self.database_path.as_ref().map(|p| p.display().to_string()));
        put("data_dir", self.data_dir.as_ref().map(|p| p.display().to_string()));
        put("log_level", self.log_level.clone());
        put("log_dir", self.log_dir.as_ref().map(|p| p.display().to_string()));
        put(
            "verification_timeout_seconds",
            self.verification_timeout_seconds.map(|v| v.to_string()),
        );
        put("max_daily_rentals", self.max_daily_rentals.map(|v| v.to_string()));
        put("debounce_window_ms", self.debounce_window_ms.map(|v| v.to_string()));
        overrides
    }
}

/// `--debug-*` flags are handled by the observability crate, not clap
fn split_debug_args() -> (Vec<String>, Vec<String>) {
    std::env::args().partition(|arg| !arg.starts_with("--debug-"))
}

fn load_configuration(args: &Args) -> Result<(LockerkeyConfig, Option<String>)> {
    let overrides = args.overrides();
    match load_config(args.config.as_deref(), Some(&overrides)) {
        Ok(config) => Ok((config, None)),
        Err(ConfigError::FileNotFound(searched))
            if args.config.is_none() && args.allow_default_config =>
        {
            let mut config = LockerkeyConfig::default();
            apply_environment_overrides(&mut config);
            apply_cli_overrides(&mut config, &overrides);
            Ok((config, Some(searched)))
        }
        Err(e) => Err(e).context("Failed to load configuration"),
    }
}

fn init_observability(args: &Args, config: &LockerkeyConfig, debug_args: Vec<String>) -> Result<LoggingGuard> {
    let mut flags = CrateDebugFlags::from_args(debug_args)
        .with_base_level(config.system.log_level.clone());
    if let Ok(value) = std::env::var("LOCKERKEY_DEBUG") {
        flags.merge_env_value(&value);
    }

    if args.file_logging || config.logging.file_logging {
        init_logging(
            &flags,
            Some(config.logging.log_dir.clone()),
            Some(config.logging.retention_days),
            Some(config.logging.retention_runs),
        )
    } else {
        init_console_logging(&flags)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let (cli_args, debug_args) = split_debug_args();
    let args = Args::parse_from(cli_args);

    let (config, defaulted_from) = load_configuration(&args)?;
    let _logging = init_observability(&args, &config, debug_args)?;

    if let Some(searched) = defaulted_from {
        warn!(target: "lockerkeyd", searched = %searched, "No configuration file found; using built-in defaults");
    }
    validate_config(&config).context("Invalid configuration")?;

    let locker_table = config.locker_table();
    info!(
        target: "lockerkeyd",
        version = lockerkey::services::VERSION,
        lockers = locker_table.len(),
        sources = config.sensors.sources.len(),
        verification_timeout_seconds = config.transactions.verification_timeout_seconds,
        max_daily_rentals = config.transactions.max_daily_rentals,
        "Starting lockerkey daemon"
    );

    // Persistence
    let settings = CoordinatorSettings::from_config(&config.transactions);
    let database = config.system.database_file();
    let store = Arc::new(
        SqliteConsistencyManager::open(&database)
            .with_context(|| format!("Failed to open rental ledger {}", database.display()))?
            .with_day_offset(settings.day_offset),
    );
    store
        .seed_lockers(&locker_table, Utc::now())
        .context("Failed to seed locker table")?;

    // Core
    let clock = Arc::new(SystemClock);
    let outcomes = OutcomePublisher::default();
    let coordinator = Arc::new(TransactionCoordinator::new(
        Arc::new(TransactionRegistry::new(config.transactions.outcome_retention)),
        store.clone(),
        clock.clone(),
        outcomes.clone(),
        settings,
    ));

    // Nothing is in flight yet, so every pending row is stale
    let report = coordinator
        .reconcile(ReconcileOptions::startup())
        .context("Startup reconciliation failed")?;
    info!(
        target: "lockerkeyd",
        stale_pending = report.stale_pending_failed.len(),
        consistent = report.is_consistent(),
        "Startup reconciliation complete"
    );

    let resolver = Arc::new(
        SensorAddressResolver::from_config(&config).context("Invalid sensor mapping")?,
    );
    let ingestor = Arc::new(HardwareEventIngestor::new(
        resolver,
        coordinator.clone(),
        clock,
        config.sensors.debounce_window_ms,
        config.sensors.max_line_bytes,
    ));

    // Background tasks
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    tasks.push(spawn_audit_logger(&outcomes, shutdown_rx.clone()));
    tasks.push(spawn_timeout_sweeper(
        coordinator.clone(),
        Duration::from_millis(config.transactions.sweep_interval_ms),
        shutdown_rx.clone(),
    ));
    if config.transactions.reconcile_interval_seconds > 0 {
        tasks.push(spawn_reconciler(
            coordinator.clone(),
            Duration::from_secs(config.transactions.reconcile_interval_seconds),
            shutdown_rx.clone(),
        ));
    }

    let reconnect_delay = Duration::from_millis(config.sensors.reconnect_delay_ms);
    for source in config.sensors.sources.iter().cloned() {
        tasks.push(tokio::spawn(sources::run_source(
            ingestor.clone(),
            source,
            reconnect_delay,
            shutdown_rx.clone(),
        )));
    }
    if config.sensors.sources.is_empty() {
        warn!(target: "lockerkeyd", "No sensor sources configured; only simulated events will arrive");
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!(target: "lockerkeyd", "Shutdown requested");

    if shutdown_tx.send(true).is_err() {
        warn!(target: "lockerkeyd", "All background tasks had already stopped");
    }
    for task in tasks {
        if let Err(e) = task.await {
            error!(target: "lockerkeyd", error = %e, "Background task ended abnormally");
        }
    }

    let stats = ingestor.stats();
    info!(
        target: "lockerkeyd",
        lines = stats.lines,
        dispatched = stats.dispatched,
        debounced = stats.debounced,
        malformed = stats.malformed,
        unmapped = stats.unmapped,
        commit_failures = coordinator.commit_failures(),
        "Lockerkey daemon stopped"
    );
    Ok(())
}
