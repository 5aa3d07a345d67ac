// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Configuration validation
//!
//! Ensures configuration values are within valid ranges and that the locker
//! mapping table is unambiguous.

use crate::{ConfigError, ConfigResult, LockerkeyConfig};
use std::collections::HashMap;

/// Validation errors that can occur during config validation
#[derive(Debug, Clone)]
pub enum ConfigValidationError {
    InvalidValue { field: String, reason: String },
    DuplicateLocker { locker_number: String },
    DuplicateSensor { sensor_number: u32, lockers: Vec<String> },
    UnknownSourceKind { source: String, kind: String },
}

impl std::fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidValue { field, reason } => {
                write!(f, "Invalid configuration value for {}: {}", field, reason)
            }
            Self::DuplicateLocker { locker_number } => {
                write!(f, "Locker {} is assigned more than once", locker_number)
            }
            Self::DuplicateSensor {
                sensor_number,
                lockers,
            } => {
                write!(
                    f,
                    "Sensor {} is assigned to several lockers: {}",
                    sensor_number,
                    lockers.join(", ")
                )
            }
            Self::UnknownSourceKind { source, kind } => {
                write!(
                    f,
                    "Sensor source '{}' has unknown kind '{}' (expected serial or tcp)",
                    source, kind
                )
            }
        }
    }
}

/// Validate the complete configuration
///
/// Checks for:
/// - Positive timeout, daily cap, and pins per chip
/// - Debounce window shorter than the verification timeout
/// - Unique locker numbers and sensor numbers in the locker table
/// - Sensor sources with a known kind and a non-empty address
///
/// # Errors
///
/// Returns `ConfigError::ValidationError` listing every problem found
pub fn validate_config(config: &LockerkeyConfig) -> ConfigResult<()> {
    let mut errors = Vec::new();

    validate_value_ranges(config, &mut errors);
    validate_locker_table(config, &mut errors);
    validate_sources(config, &mut errors);

    if !errors.is_empty() {
        let error_messages = errors
            .iter()
            .map(|e| format!("  - {}", e))
            .collect::<Vec<_>>()
            .join("\n");

        return Err(ConfigError::ValidationError(format!(
            "Configuration validation failed:\n{}",
            error_messages
        )));
    }

    Ok(())
}

fn validate_value_ranges(config: &LockerkeyConfig, errors: &mut Vec<ConfigValidationError>) {
    let tx = &config.transactions;

    if tx.verification_timeout_seconds == 0 {
        errors.push(ConfigValidationError::InvalidValue {
            field: "transactions.verification_timeout_seconds".to_string(),
            reason: "must be greater than 0".to_string(),
        });
    }
    if tx.max_daily_rentals == 0 {
        errors.push(ConfigValidationError::InvalidValue {
            field: "transactions.max_daily_rentals".to_string(),
            reason: "must be greater than 0".to_string(),
        });
    }
    if tx.sweep_interval_ms == 0 {
        errors.push(ConfigValidationError::InvalidValue {
            field: "transactions.sweep_interval_ms".to_string(),
            reason: "must be greater than 0".to_string(),
        });
    }
    if tx.daily_reset_utc_offset_minutes.abs() >= 24 * 60 {
        errors.push(ConfigValidationError::InvalidValue {
            field: "transactions.daily_reset_utc_offset_minutes".to_string(),
            reason: "must be within one day of UTC".to_string(),
        });
    }

    if config.sensors.pins_per_chip == 0 {
        errors.push(ConfigValidationError::InvalidValue {
            field: "sensors.pins_per_chip".to_string(),
            reason: "must be greater than 0".to_string(),
        });
    }
    if config.sensors.max_line_bytes == 0 {
        errors.push(ConfigValidationError::InvalidValue {
            field: "sensors.max_line_bytes".to_string(),
            reason: "must be greater than 0".to_string(),
        });
    }
    if config.sensors.debounce_window_ms >= tx.verification_timeout_seconds.saturating_mul(1000)
        && tx.verification_timeout_seconds > 0
    {
        errors.push(ConfigValidationError::InvalidValue {
            field: "sensors.debounce_window_ms".to_string(),
            reason: format!(
                "{}ms is not shorter than the verification timeout ({}s)",
                config.sensors.debounce_window_ms, tx.verification_timeout_seconds
            ),
        });
    }
}

fn validate_locker_table(config: &LockerkeyConfig, errors: &mut Vec<ConfigValidationError>) {
    // Explicit entries override zone entries, so duplicates are checked within each list
    // and across zone ranges, then once more over the merged table.
    let mut seen_explicit: HashMap<&str, usize> = HashMap::new();
    for entry in &config.lockers {
        *seen_explicit.entry(entry.locker_number.as_str()).or_default() += 1;
        if entry.sensor_number == 0 {
            errors.push(ConfigValidationError::InvalidValue {
                field: format!("lockers.{}.sensor_number", entry.locker_number),
                reason: "sensor numbers are 1-based".to_string(),
            });
        }
    }
    let mut explicit_dupes: Vec<&str> = seen_explicit
        .into_iter()
        .filter(|(_, count)| *count > 1)
        .map(|(locker, _)| locker)
        .collect();
    explicit_dupes.sort_unstable();
    for locker_number in explicit_dupes {
        errors.push(ConfigValidationError::DuplicateLocker {
            locker_number: locker_number.to_string(),
        });
    }

    for zone in &config.zones {
        if zone.first_sensor == 0 {
            errors.push(ConfigValidationError::InvalidValue {
                field: format!("zones.{}.first_sensor", zone.zone),
                reason: "sensor numbers are 1-based".to_string(),
            });
        }
    }
    let zone_entries: Vec<_> = config.zones.iter().flat_map(|z| z.expand()).collect();
    let mut zone_lockers: HashMap<&str, usize> = HashMap::new();
    let mut zone_sensors: HashMap<u32, Vec<String>> = HashMap::new();
    for entry in &zone_entries {
        *zone_lockers.entry(entry.locker_number.as_str()).or_default() += 1;
        zone_sensors
            .entry(entry.sensor_number)
            .or_default()
            .push(entry.locker_number.clone());
    }
    let mut zone_dupes: Vec<&str> = zone_lockers
        .into_iter()
        .filter(|(_, count)| *count > 1)
        .map(|(locker, _)| locker)
        .collect();
    zone_dupes.sort_unstable();
    for locker_number in zone_dupes {
        errors.push(ConfigValidationError::DuplicateLocker {
            locker_number: locker_number.to_string(),
        });
    }

    let mut sensor_dupes: Vec<(u32, Vec<String>)> = zone_sensors
        .into_iter()
        .filter(|(_, lockers)| lockers.len() > 1)
        .collect();

    let mut explicit_sensors: HashMap<u32, Vec<String>> = HashMap::new();
    for entry in &config.lockers {
        explicit_sensors
            .entry(entry.sensor_number)
            .or_default()
            .push(entry.locker_number.clone());
    }
    sensor_dupes.extend(
        explicit_sensors
            .into_iter()
            .filter(|(_, lockers)| lockers.len() > 1),
    );
    sensor_dupes.sort_by_key(|(sensor, _)| *sensor);

    for (sensor_number, lockers) in sensor_dupes {
        errors.push(ConfigValidationError::DuplicateSensor {
            sensor_number,
            lockers,
        });
    }
}

fn validate_sources(config: &LockerkeyConfig, errors: &mut Vec<ConfigValidationError>) {
    for source in &config.sensors.sources {
        if source.source_kind().is_none() {
            errors.push(ConfigValidationError::UnknownSourceKind {
                source: source.name.clone(),
                kind: source.kind.clone(),
            });
        }
        if source.address.trim().is_empty() {
            errors.push(ConfigValidationError::InvalidValue {
                field: format!("sensors.sources.{}.address", source.name),
                reason: "must not be empty".to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LockerAssignment, SensorSourceConfig, ZoneRange};

    #[test]
    fn test_zero_timeout_rejected() {
        let mut config = LockerkeyConfig::default();
        config.transactions.verification_timeout_seconds = 0;
        let err = validate_config(&config).unwrap_err().to_string();
        assert!(err.contains("verification_timeout_seconds"));
    }

    #[test]
    fn test_debounce_longer_than_timeout_rejected() {
        let mut config = LockerkeyConfig::default();
        config.transactions.verification_timeout_seconds = 1;
        config.sensors.debounce_window_ms = 1500;
        let err = validate_config(&config).unwrap_err().to_string();
        assert!(err.contains("debounce_window_ms"));
    }

    #[test]
    fn test_overlapping_zones_rejected() {
        let mut config = LockerkeyConfig::default();
        config.zones.push(ZoneRange {
            zone: "EXTRA".to_string(),
            prefix: "X".to_string(),
            count: 5,
            first_sensor: 139,
            number_width: 2,
        });
        let err = validate_config(&config).unwrap_err().to_string();
        assert!(err.contains("Sensor 139"));
        assert!(err.contains("Sensor 140"));
    }

    #[test]
    fn test_duplicate_explicit_lockers_rejected() {
        let mut config = LockerkeyConfig::default();
        config.zones.clear();
        for sensor in [1, 2] {
            config.lockers.push(LockerAssignment {
                locker_number: "A01".to_string(),
                zone: "MALE".to_string(),
                sensor_number: sensor,
            });
        }
        let err = validate_config(&config).unwrap_err().to_string();
        assert!(err.contains("Locker A01"));
    }

    #[test]
    fn test_bad_source_reports_all_errors() {
        let mut config = LockerkeyConfig::default();
        config.sensors.sources.push(SensorSourceConfig {
            name: "board-1".to_string(),
            kind: "usb".to_string(),
            address: " ".to_string(),
        });
        let err = validate_config(&config).unwrap_err().to_string();
        assert!(err.contains("unknown kind 'usb'"));
        assert!(err.contains("sensors.sources.board-1.address"));
    }
}
