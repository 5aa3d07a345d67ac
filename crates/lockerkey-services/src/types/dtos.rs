// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

/*!
Data Transfer Objects for the service layer.

Transport-agnostic; adapters map them onto their own wire formats.
*/

use chrono::{DateTime, Utc};
use lockerkey_state_manager::{ActiveTransaction, TransactionKind, TransactionStep};
use serde::Serialize;

// ============================================================================
// TRANSACTION DTOs
// ============================================================================

/// Returned by rent/return once the transaction is awaiting its sensor
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionTicket {
    pub transaction_id: String,
    pub kind: TransactionKind,
    pub member_id: String,
    pub locker_number: String,
    pub step: TransactionStep,
    pub deadline: DateTime<Utc>,
    pub rental_id: i64,
}

/// Status poll result
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionStatus {
    pub transaction_id: String,
    pub kind: TransactionKind,
    pub member_id: String,
    pub locker_number: String,
    pub step: TransactionStep,
    pub deadline: Option<DateTime<Utc>>,
    pub rental_id: Option<i64>,
}

impl From<ActiveTransaction> for TransactionStatus {
    fn from(tx: ActiveTransaction) -> Self {
        Self {
            transaction_id: tx.transaction_id,
            kind: tx.kind,
            member_id: tx.member_id,
            locker_number: tx.locker_number,
            step: tx.step,
            deadline: tx.deadline,
            rental_id: tx.rental_id,
        }
    }
}

/// How a transaction ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionOutcome {
    Completed,
    TimedOut,
    Failed,
}

impl TransactionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionOutcome::Completed => "completed",
            TransactionOutcome::TimedOut => "timed_out",
            TransactionOutcome::Failed => "failed",
        }
    }
}

/// Emitted once per resolved transaction to downstream collaborators
/// (audit photo, notification, audit log)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionOutcomeEvent {
    pub rental_id: Option<i64>,
    pub transaction_id: String,
    pub member_id: String,
    pub locker_number: String,
    pub kind: TransactionKind,
    pub outcome: TransactionOutcome,
    /// Failure reason, if any
    pub detail: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// What the coordinator did with one sensor event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SensorDisposition {
    /// No awaiting transaction on that locker
    Discarded,
    /// An awaiting transaction exists but the edge does not confirm it
    EdgeMismatch { transaction_id: String },
    Completed { transaction_id: String, rental_id: i64 },
    CommitFailed { transaction_id: String, error: String },
}

// ============================================================================
// CONSISTENCY MANAGER DTOs
// ============================================================================

/// Opening row for a rent attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRental {
    pub transaction_id: String,
    pub member_id: String,
    pub locker_number: String,
    pub initiated_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

/// Everything the atomic commit needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRequest {
    pub transaction_id: String,
    pub kind: TransactionKind,
    pub rental_id: i64,
    pub member_id: String,
    pub locker_number: String,
    pub confirmed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitReceipt {
    pub rental_id: i64,
    /// Member's count for today after this commit
    pub daily_rental_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReconcileOptions {
    /// Fail every pending row not backed by a live transaction, regardless
    /// of deadline (process start: nothing can be live yet)
    pub fail_all_orphaned_pending: bool,
    /// Compute the report, then roll back
    pub dry_run: bool,
}

impl ReconcileOptions {
    pub fn startup() -> Self {
        Self {
            fail_all_orphaned_pending: true,
            dry_run: false,
        }
    }

    pub fn periodic() -> Self {
        Self::default()
    }

    pub fn audit_only() -> Self {
        Self {
            fail_all_orphaned_pending: false,
            dry_run: true,
        }
    }
}

/// One pointer that reconciliation changed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PointerRepair {
    pub key: String,
    pub before: Option<String>,
    pub after: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub stale_pending_failed: Vec<i64>,
    pub duplicate_active_failed: Vec<i64>,
    pub member_repairs: Vec<PointerRepair>,
    pub locker_repairs: Vec<PointerRepair>,
    pub dry_run: bool,
}

impl ReconcileReport {
    /// No member/locker/ledger divergence (stale pending rows are routine)
    pub fn is_consistent(&self) -> bool {
        self.duplicate_active_failed.is_empty()
            && self.member_repairs.is_empty()
            && self.locker_repairs.is_empty()
    }

    pub fn is_clean(&self) -> bool {
        self.is_consistent() && self.stale_pending_failed.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LedgerStats {
    pub members: u64,
    pub lockers: u64,
    pub lockers_available: u64,
    pub rentals_pending: u64,
    pub rentals_active: u64,
    pub rentals_completed: u64,
    pub rentals_timed_out: u64,
    pub rentals_failed: u64,
}
