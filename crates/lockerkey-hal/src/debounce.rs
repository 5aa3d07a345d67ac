// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Coalescing of repeated `(locker, edge)` events within a cooldown window.

use ahash::AHashMap;
use chrono::{DateTime, Duration, Utc};

use crate::types::SensorEdge;

const PRUNE_THRESHOLD: usize = 1024;

/// Tracks the last dispatched instant per `(locker_number, edge)`
///
/// The window is anchored at the last event that was let through, so a burst
/// of N identical events inside one window yields exactly one dispatch.
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    last_dispatched: AHashMap<(String, SensorEdge), DateTime<Utc>>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_dispatched: AHashMap::new(),
        }
    }

    pub fn from_millis(window_ms: u64) -> Self {
        Self::new(Duration::milliseconds(window_ms as i64))
    }

    /// Returns true if the event should be dispatched
    pub fn admit(&mut self, locker_number: &str, edge: SensorEdge, at: DateTime<Utc>) -> bool {
        let key = (locker_number.to_string(), edge);

        if let Some(last) = self.last_dispatched.get(&key) {
            if at >= *last && at - *last < self.window {
                return false;
            }
        }

        self.last_dispatched.insert(key, at);

        if self.last_dispatched.len() > PRUNE_THRESHOLD {
            let window = self.window;
            self.last_dispatched.retain(|_, last| at - *last < window);
        }

        true
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}
