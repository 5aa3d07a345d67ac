// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Configuration file loading with override support
//!
//! This module implements the 3-tier configuration loading system:
//! 1. TOML file (base defaults)
//! 2. Environment variables (runtime overrides)
//! 3. CLI arguments (explicit user overrides)

use crate::{ConfigError, ConfigResult, LockerkeyConfig};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_FILE_NAME: &str = "lockerkey_configuration.toml";

/// Find the lockerkey configuration file
///
/// Search order:
/// 1. `LOCKERKEY_CONFIG_PATH` environment variable
/// 2. Current working directory: `./lockerkey_configuration.toml`
/// 3. Parent directories (up to 5 levels)
///
/// # Errors
///
/// Returns `ConfigError::FileNotFound` if no config file is found in any location
pub fn find_config_file() -> ConfigResult<PathBuf> {
    if let Ok(env_path) = env::var("LOCKERKEY_CONFIG_PATH") {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok(path);
        }
        return Err(ConfigError::FileNotFound(format!(
            "Config file specified by LOCKERKEY_CONFIG_PATH not found: {}",
            path.display()
        )));
    }

    let mut search_paths = Vec::new();

    if let Ok(cwd) = env::current_dir() {
        search_paths.push(cwd.join(CONFIG_FILE_NAME));

        let mut current = cwd.clone();
        for _ in 0..5 {
            if let Some(parent) = current.parent() {
                search_paths.push(parent.join(CONFIG_FILE_NAME));
                current = parent.to_path_buf();
            }
        }
    }

    for path in &search_paths {
        if path.exists() {
            return Ok(path.clone());
        }
    }

    let search_list = search_paths
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    Err(ConfigError::FileNotFound(format!(
        "Configuration file '{}' not found in any of these locations:\n{}\n\nSet LOCKERKEY_CONFIG_PATH environment variable to specify custom location.",
        CONFIG_FILE_NAME, search_list
    )))
}

/// Load configuration from TOML file
///
/// # Arguments
///
/// * `config_path` - Optional path to config file. If `None`, will search for config file.
/// * `cli_args` - Optional CLI argument overrides
///
/// # Errors
///
/// Returns error if config file is not found or contains invalid TOML.
/// Validation is a separate step (`validate_config`).
pub fn load_config(
    config_path: Option<&Path>,
    cli_args: Option<&HashMap<String, String>>,
) -> ConfigResult<LockerkeyConfig> {
    let config_file = if let Some(path) = config_path {
        path.to_path_buf()
    } else {
        find_config_file()?
    };

    let content = fs::read_to_string(&config_file)?;
    let mut config: LockerkeyConfig = toml::from_str(&content)?;

    apply_environment_overrides(&mut config);

    if let Some(cli) = cli_args {
        apply_cli_overrides(&mut config, cli);
    }

    Ok(config)
}

/// Apply environment variable overrides to configuration
///
/// Supported environment variables:
/// - `LOCKERKEY_DATABASE_PATH` -> `system.database_path`
/// - `LOCKERKEY_DATA_DIR` -> `system.data_dir`
/// - `LOCKERKEY_LOG_LEVEL` -> `system.log_level`
/// - `LOCKERKEY_VERIFICATION_TIMEOUT_SECONDS` -> `transactions.verification_timeout_seconds`
/// - `LOCKERKEY_MAX_DAILY_RENTALS` -> `transactions.max_daily_rentals`
/// - `LOCKERKEY_DEBOUNCE_WINDOW_MS` -> `sensors.debounce_window_ms`
/// - `LOCKERKEY_PINS_PER_CHIP` -> `sensors.pins_per_chip`
pub fn apply_environment_overrides(config: &mut LockerkeyConfig) {
    if let Ok(value) = env::var("LOCKERKEY_DATABASE_PATH") {
        config.system.database_path = Some(PathBuf::from(value));
    }
    if let Ok(value) = env::var("LOCKERKEY_DATA_DIR") {
        config.system.data_dir = PathBuf::from(value);
    }
    if let Ok(value) = env::var("LOCKERKEY_LOG_LEVEL") {
        config.system.log_level = value;
    }

    if let Ok(value) = env::var("LOCKERKEY_VERIFICATION_TIMEOUT_SECONDS") {
        if let Ok(seconds) = value.parse::<u64>() {
            config.transactions.verification_timeout_seconds = seconds;
        }
    }
    if let Ok(value) = env::var("LOCKERKEY_MAX_DAILY_RENTALS") {
        if let Ok(cap) = value.parse::<u32>() {
            config.transactions.max_daily_rentals = cap;
        }
    }

    if let Ok(value) = env::var("LOCKERKEY_DEBOUNCE_WINDOW_MS") {
        if let Ok(ms) = value.parse::<u64>() {
            config.sensors.debounce_window_ms = ms;
        }
    }
    if let Ok(value) = env::var("LOCKERKEY_PINS_PER_CHIP") {
        if let Ok(pins) = value.parse::<u32>() {
            config.sensors.pins_per_chip = pins;
        }
    }
}

/// Apply CLI argument overrides to configuration
///
/// # Arguments
///
/// * `config` - Configuration to modify
/// * `cli_args` - HashMap of CLI arguments (e.g., `{"database_path": "/var/lib/lk.db"}`)
pub fn apply_cli_overrides(config: &mut LockerkeyConfig, cli_args: &HashMap<String, String>) {
    if let Some(value) = cli_args.get("database_path") {
        config.system.database_path = Some(PathBuf::from(value));
    }
    if let Some(value) = cli_args.get("data_dir") {
        config.system.data_dir = PathBuf::from(value);
    }
    if let Some(value) = cli_args.get("log_level") {
        config.system.log_level = value.clone();
    }
    if let Some(value) = cli_args.get("log_dir") {
        config.logging.log_dir = PathBuf::from(value);
    }

    if let Some(value) = cli_args.get("verification_timeout_seconds") {
        if let Ok(seconds) = value.parse::<u64>() {
            config.transactions.verification_timeout_seconds = seconds;
        }
    }
    if let Some(value) = cli_args.get("max_daily_rentals") {
        if let Ok(cap) = value.parse::<u32>() {
            config.transactions.max_daily_rentals = cap;
        }
    }
    if let Some(value) = cli_args.get("debounce_window_ms") {
        if let Ok(ms) = value.parse::<u64>() {
            config.sensors.debounce_window_ms = ms;
        }
    }
}
