// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Sensor address resolution
//!
//! Firmware reports only `(chip_index, pin_index)`. The sensor number is
//! `chip_index * pins_per_chip + pin_index + 1`, and the locker table maps
//! sensor numbers to locker numbers.

use ahash::AHashMap;
use lockerkey_config::{LockerAssignment, LockerkeyConfig};

use crate::error::ResolveError;

/// Immutable wiring table loaded once at startup
#[derive(Debug, Clone)]
pub struct SensorAddressResolver {
    pins_per_chip: u32,
    sensor_to_locker: AHashMap<u32, String>,
    locker_to_sensor: AHashMap<String, u32>,
    locker_zone: AHashMap<String, String>,
}

impl SensorAddressResolver {
    pub fn new(pins_per_chip: u32, table: &[LockerAssignment]) -> Result<Self, ResolveError> {
        if pins_per_chip == 0 {
            return Err(ResolveError::InvalidPinsPerChip);
        }

        let mut sensor_to_locker: AHashMap<u32, String> = AHashMap::with_capacity(table.len());
        let mut locker_to_sensor: AHashMap<String, u32> = AHashMap::with_capacity(table.len());
        let mut locker_zone: AHashMap<String, String> = AHashMap::with_capacity(table.len());

        for entry in table {
            if let Some(first) = sensor_to_locker.get(&entry.sensor_number) {
                return Err(ResolveError::DuplicateSensor {
                    sensor_number: entry.sensor_number,
                    first: first.clone(),
                    second: entry.locker_number.clone(),
                });
            }
            if locker_to_sensor.contains_key(&entry.locker_number) {
                return Err(ResolveError::DuplicateLocker {
                    locker_number: entry.locker_number.clone(),
                });
            }
            sensor_to_locker.insert(entry.sensor_number, entry.locker_number.clone());
            locker_to_sensor.insert(entry.locker_number.clone(), entry.sensor_number);
            locker_zone.insert(entry.locker_number.clone(), entry.zone.clone());
        }

        Ok(Self {
            pins_per_chip,
            sensor_to_locker,
            locker_to_sensor,
            locker_zone,
        })
    }

    pub fn from_config(config: &LockerkeyConfig) -> Result<Self, ResolveError> {
        Self::new(config.sensors.pins_per_chip, &config.locker_table())
    }

    pub fn pins_per_chip(&self) -> u32 {
        self.pins_per_chip
    }

    /// 1-based sensor number for a wiring address
    pub fn sensor_number(&self, chip_index: u32, pin_index: u32) -> Result<u32, ResolveError> {
        if pin_index >= self.pins_per_chip {
            return Err(ResolveError::PinOutOfRange {
                pin_index,
                pins_per_chip: self.pins_per_chip,
            });
        }
        chip_index
            .checked_mul(self.pins_per_chip)
            .and_then(|base| base.checked_add(pin_index + 1))
            .ok_or(ResolveError::AddressOverflow {
                chip_index,
                pin_index,
            })
    }

    pub fn resolve(&self, chip_index: u32, pin_index: u32) -> Result<&str, ResolveError> {
        let sensor_number = self.sensor_number(chip_index, pin_index)?;
        self.locker_for_sensor(sensor_number)
            .ok_or(ResolveError::NotMapped { sensor_number })
    }

    pub fn locker_for_sensor(&self, sensor_number: u32) -> Option<&str> {
        self.sensor_to_locker.get(&sensor_number).map(String::as_str)
    }

    pub fn sensor_for_locker(&self, locker_number: &str) -> Option<u32> {
        self.locker_to_sensor.get(locker_number).copied()
    }

    pub fn zone_of(&self, locker_number: &str) -> Option<&str> {
        self.locker_zone.get(locker_number).map(String::as_str)
    }

    pub fn is_mapped(&self, locker_number: &str) -> bool {
        self.locker_to_sensor.contains_key(locker_number)
    }

    /// All mapped lockers with their zone, ordered by sensor number
    pub fn lockers(&self) -> Vec<LockerAssignment> {
        let mut entries: Vec<LockerAssignment> = self
            .sensor_to_locker
            .iter()
            .map(|(sensor, locker)| LockerAssignment {
                locker_number: locker.clone(),
                zone: self.locker_zone.get(locker).cloned().unwrap_or_default(),
                sensor_number: *sensor,
            })
            .collect();
        entries.sort_by_key(|e| e.sensor_number);
        entries
    }

    pub fn len(&self) -> usize {
        self.sensor_to_locker.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sensor_to_locker.is_empty()
    }
}
