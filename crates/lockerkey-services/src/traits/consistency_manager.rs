// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

use chrono::{DateTime, Utc};

use crate::types::{
    CommitReceipt, CommitRequest, LedgerResult, Locker, Member, PendingRental, ReconcileOptions,
    ReconcileReport, Rental, RentalStatus,
};

/// Sole writer of member, locker, and rental records
///
/// Calls are synchronous and short; the coordinator never holds the
/// transaction registry lock while calling in.
pub trait ConsistencyManager: Send + Sync {
    fn load_member(&self, member_id: &str) -> LedgerResult<Option<Member>>;

    /// Resolve a scanned member id, barcode, or QR code
    fn find_member_by_credential(&self, code: &str) -> LedgerResult<Option<Member>>;

    fn load_locker(&self, locker_number: &str) -> LedgerResult<Option<Locker>>;

    fn active_rental_for_member(&self, member_id: &str) -> LedgerResult<Option<Rental>>;

    /// Insert the `pending` ledger row for a rent attempt
    fn open_pending_rental(&self, pending: &PendingRental) -> LedgerResult<i64>;

    /// Apply ledger row, member pointer, and locker state as one unit
    fn commit(&self, request: &CommitRequest) -> LedgerResult<CommitReceipt>;

    /// `pending → timed_out | failed`
    fn close_pending_rental(
        &self,
        rental_id: i64,
        status: RentalStatus,
        at: DateTime<Utc>,
    ) -> LedgerResult<()>;

    /// Restore the member/rental/locker invariants
    fn reconcile(
        &self,
        live_rental_ids: &[i64],
        options: ReconcileOptions,
        now: DateTime<Utc>,
    ) -> LedgerResult<ReconcileReport>;
}
