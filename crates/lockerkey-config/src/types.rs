// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Configuration type definitions
//!
//! This module defines all configuration structs that map to sections in
//! `lockerkey_configuration.toml`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LockerkeyConfig {
    pub system: SystemConfig,
    pub transactions: TransactionConfig,
    pub sensors: SensorConfig,
    /// Range-generated locker assignments. Omitting the key keeps the
    /// deployed layout; `zones = []` disables it.
    pub zones: Vec<ZoneRange>,
    /// Explicit assignments; these replace any zone-generated entry that
    /// shares the locker number or the sensor number.
    pub lockers: Vec<LockerAssignment>,
    pub logging: LoggingConfig,
}

impl Default for LockerkeyConfig {
    fn default() -> Self {
        Self {
            system: SystemConfig::default(),
            transactions: TransactionConfig::default(),
            sensors: SensorConfig::default(),
            zones: ZoneRange::deployed_layout(),
            lockers: Vec::new(),
            logging: LoggingConfig::default(),
        }
    }
}

impl LockerkeyConfig {
    /// Effective locker table: zone ranges expanded, explicit entries applied
    /// on top, ordered by sensor number.
    pub fn locker_table(&self) -> Vec<LockerAssignment> {
        let mut table: Vec<LockerAssignment> =
            self.zones.iter().flat_map(ZoneRange::expand).collect();

        for explicit in &self.lockers {
            table.retain(|entry| {
                entry.locker_number != explicit.locker_number
                    && entry.sensor_number != explicit.sensor_number
            });
            table.push(explicit.clone());
        }

        table.sort_by_key(|entry| entry.sensor_number);
        table
    }
}

/// System-level configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SystemConfig {
    pub log_level: String,
    pub data_dir: PathBuf,
    /// Explicit database file; defaults to `<data_dir>/lockerkey.db`
    pub database_path: Option<PathBuf>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            data_dir: PathBuf::from("./data"),
            database_path: None,
        }
    }
}

impl SystemConfig {
    pub fn database_file(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("lockerkey.db"))
    }
}

/// Rental/return transaction tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransactionConfig {
    /// Deadline for `awaiting_sensor`
    pub verification_timeout_seconds: u64,
    /// Per-member cap on rentals per calendar day
    pub max_daily_rentals: u32,
    /// How often the timeout sweep runs
    pub sweep_interval_ms: u64,
    /// How often the reconciliation pass runs (0 = startup only)
    pub reconcile_interval_seconds: u64,
    /// Terminal outcomes kept queryable after deregistration
    pub outcome_retention: usize,
    /// Offset from UTC that defines the calendar day for the daily cap
    pub daily_reset_utc_offset_minutes: i32,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            verification_timeout_seconds: 30,
            max_daily_rentals: 3,
            sweep_interval_ms: 500,
            reconcile_interval_seconds: 300,
            outcome_retention: 256,
            daily_reset_utc_offset_minutes: 0,
        }
    }
}

/// Sensor controller and decoding configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SensorConfig {
    pub pins_per_chip: u32,
    pub debounce_window_ms: u64,
    /// Longest accepted line; longer input is discarded up to the next newline
    pub max_line_bytes: usize,
    pub reconnect_delay_ms: u64,
    pub sources: Vec<SensorSourceConfig>,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            pins_per_chip: 16,
            debounce_window_ms: 300,
            max_line_bytes: 4096,
            reconnect_delay_ms: 2000,
            sources: Vec::new(),
        }
    }
}

/// Transport used to reach a sensor controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// Character device (e.g. `/dev/ttyUSB0`) already configured for the line rate
    Serial,
    /// Plain TCP stream (`host:port`)
    Tcp,
}

impl SourceKind {
    pub fn parse(kind: &str) -> Option<Self> {
        match kind.to_ascii_lowercase().as_str() {
            "serial" => Some(Self::Serial),
            "tcp" => Some(Self::Tcp),
            _ => None,
        }
    }
}

/// One physical sensor controller
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SensorSourceConfig {
    pub name: String,
    pub kind: String,
    pub address: String,
}

impl SensorSourceConfig {
    pub fn source_kind(&self) -> Option<SourceKind> {
        SourceKind::parse(&self.kind)
    }
}

/// A contiguous run of lockers wired to consecutive sensors
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ZoneRange {
    pub zone: String,
    /// Locker number prefix, e.g. `M` for `M01`
    pub prefix: String,
    pub count: u32,
    pub first_sensor: u32,
    #[serde(default = "default_number_width")]
    pub number_width: usize,
}

fn default_number_width() -> usize {
    2
}

impl ZoneRange {
    /// Deployed layout: M01-M70 on sensors 1-70, F01-F50 on 71-120, S01-S20 on 121-140.
    pub fn deployed_layout() -> Vec<ZoneRange> {
        vec![
            ZoneRange {
                zone: "MALE".to_string(),
                prefix: "M".to_string(),
                count: 70,
                first_sensor: 1,
                number_width: 2,
            },
            ZoneRange {
                zone: "FEMALE".to_string(),
                prefix: "F".to_string(),
                count: 50,
                first_sensor: 71,
                number_width: 2,
            },
            ZoneRange {
                zone: "STAFF".to_string(),
                prefix: "S".to_string(),
                count: 20,
                first_sensor: 121,
                number_width: 2,
            },
        ]
    }

    pub fn expand(&self) -> Vec<LockerAssignment> {
        (0..self.count)
            .map(|offset| LockerAssignment {
                locker_number: format!(
                    "{}{:0width$}",
                    self.prefix,
                    offset + 1,
                    width = self.number_width
                ),
                zone: self.zone.clone(),
                sensor_number: self.first_sensor + offset,
            })
            .collect()
    }
}

/// A single locker bound to a sensor number
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LockerAssignment {
    pub locker_number: String,
    pub zone: String,
    pub sensor_number: u32,
}

/// Log output configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_dir: PathBuf,
    pub file_logging: bool,
    pub retention_days: u64,
    pub retention_runs: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("./logs"),
            file_logging: false,
            retention_days: 30,
            retention_runs: 10,
        }
    }
}
