// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Transaction model and step machine

use chrono::{DateTime, Utc};
use lockerkey_hal::SensorEdge;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Rent,
    Return,
}

impl TransactionKind {
    /// Sensor transition that confirms this kind: key pulled for a rent,
    /// key put back for a return.
    pub fn expected_edge(&self) -> SensorEdge {
        match self {
            TransactionKind::Rent => SensorEdge::Vacant,
            TransactionKind::Return => SensorEdge::Engaged,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Rent => "rent",
            TransactionKind::Return => "return",
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle step
///
/// ```text
/// initiated ──► awaiting_sensor ──► sensor_confirmed ──► completed
///     │               │  │                  │
///     └──► failed ◄───┘  └──► timed_out     └──► failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStep {
    Initiated,
    AwaitingSensor,
    SensorConfirmed,
    Completed,
    TimedOut,
    Failed,
}

impl TransactionStep {
    pub fn can_transition_to(&self, next: TransactionStep) -> bool {
        use TransactionStep::*;
        matches!(
            (self, next),
            (Initiated, AwaitingSensor)
                | (Initiated, Failed)
                | (AwaitingSensor, SensorConfirmed)
                | (AwaitingSensor, TimedOut)
                | (AwaitingSensor, Failed)
                | (SensorConfirmed, Completed)
                | (SensorConfirmed, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStep::Completed | TransactionStep::TimedOut | TransactionStep::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStep::Initiated => "initiated",
            TransactionStep::AwaitingSensor => "awaiting_sensor",
            TransactionStep::SensorConfirmed => "sensor_confirmed",
            TransactionStep::Completed => "completed",
            TransactionStep::TimedOut => "timed_out",
            TransactionStep::Failed => "failed",
        }
    }
}

impl fmt::Display for TransactionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// In-memory record of one rent/return attempt; never persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveTransaction {
    pub transaction_id: String,
    pub kind: TransactionKind,
    pub member_id: String,
    pub locker_number: String,
    pub step: TransactionStep,
    pub expected_edge: SensorEdge,
    pub initiated_at: DateTime<Utc>,
    /// Set when armed
    pub deadline: Option<DateTime<Utc>>,
    pub sensor_confirmed_at: Option<DateTime<Utc>>,
    /// Ledger row backing this attempt
    pub rental_id: Option<i64>,
}

impl ActiveTransaction {
    pub fn new(
        transaction_id: String,
        kind: TransactionKind,
        member_id: impl Into<String>,
        locker_number: impl Into<String>,
        initiated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            transaction_id,
            kind,
            member_id: member_id.into(),
            locker_number: locker_number.into(),
            step: TransactionStep::Initiated,
            expected_edge: kind.expected_edge(),
            initiated_at,
            deadline: None,
            sensor_confirmed_at: None,
            rental_id: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.step == TransactionStep::AwaitingSensor
            && self.deadline.map(|deadline| deadline <= now).unwrap_or(false)
    }
}
