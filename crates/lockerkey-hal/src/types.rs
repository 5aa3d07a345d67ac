// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Normalized sensor types shared with the transaction core.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Direction of a locker key sensor transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorEdge {
    /// Key inserted (wire state `HIGH`)
    Engaged,
    /// Key removed (wire state `LOW`)
    Vacant,
}

impl SensorEdge {
    /// Parse the controller's edge spellings
    pub fn from_wire(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "engaged" | "inserted" | "rising" | "high" => Some(Self::Engaged),
            "vacant" | "removed" | "falling" | "low" => Some(Self::Vacant),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Engaged => "engaged",
            Self::Vacant => "vacant",
        }
    }
}

impl fmt::Display for SensorEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded but not yet resolved hardware reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawSensorReading {
    pub chip_index: u32,
    pub pin_index: u32,
    pub edge: SensorEdge,
}

/// A resolved sensor transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorEvent {
    pub locker_number: String,
    pub edge: SensorEdge,
    pub observed_at: DateTime<Utc>,
}
