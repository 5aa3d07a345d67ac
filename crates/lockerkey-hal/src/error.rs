// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Sensor addressing failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("pin {pin_index} is outside 0..{pins_per_chip}")]
    PinOutOfRange { pin_index: u32, pins_per_chip: u32 },

    #[error("chip {chip_index} pin {pin_index} is beyond any sensor number")]
    AddressOverflow { chip_index: u32, pin_index: u32 },

    #[error("sensor {sensor_number} is not mapped to a locker")]
    NotMapped { sensor_number: u32 },

    #[error("pins_per_chip must be greater than 0")]
    InvalidPinsPerChip,

    #[error("sensor {sensor_number} is assigned to both {first} and {second}")]
    DuplicateSensor {
        sensor_number: u32,
        first: String,
        second: String,
    },

    #[error("locker {locker_number} is assigned to more than one sensor")]
    DuplicateLocker { locker_number: String },
}

/// Wire record decoding failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed JSON: {0}")]
    Json(String),

    #[error("record is not a JSON object")]
    NotAnObject,

    #[error("missing or invalid field '{0}'")]
    MissingField(&'static str),

    #[error("unrecognised edge value '{0}'")]
    InvalidEdge(String),

    #[error("line exceeded {limit} bytes and was discarded")]
    LineTooLong { limit: usize },
}
