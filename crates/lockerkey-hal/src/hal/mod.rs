// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

/// Wall-clock abstraction (system and manually driven clocks).
pub mod clock;
/// Downstream consumer of normalized sensor events.
pub mod sink;

pub use clock::{Clock, ManualClock, SystemClock};
pub use sink::SensorEventSink;
