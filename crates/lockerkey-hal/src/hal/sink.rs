// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::types::SensorEvent;

/// Receiver of normalized, debounced sensor events
///
/// Implementations must return quickly; the ingest loop calls this inline.
pub trait SensorEventSink: Send + Sync {
    fn dispatch(&self, event: SensorEvent);
}
