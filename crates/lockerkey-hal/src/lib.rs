// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! # lockerkey-hal
//!
//! Everything between the sensor controllers and the transaction core:
//!
//! - [`hal`]: platform traits (clock, event sink)
//! - [`resolver`]: `(chip_index, pin_index)` → sensor number → locker number
//! - [`codec`]: byte-stream framing and wire record decoding
//! - [`debounce`]: coalescing of mechanical bounce
//! - [`ingestor`]: the continuous ingest loop feeding a [`SensorEventSink`]
//! - [`sources`]: serial/TCP controller connections with reconnect

/// Crate version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod codec;
pub mod debounce;
pub mod error;
pub mod hal;
pub mod ingestor;
pub mod resolver;
pub mod sources;
pub mod types;

pub use codec::{decode_line, DecodedRecord, Frame, LineFramer};
pub use debounce::Debouncer;
pub use error::{DecodeError, ResolveError};
pub use hal::{Clock, ManualClock, SensorEventSink, SystemClock};
pub use ingestor::{HardwareEventIngestor, IngestStats};
pub use resolver::SensorAddressResolver;
pub use types::{RawSensorReading, SensorEdge, SensorEvent};
