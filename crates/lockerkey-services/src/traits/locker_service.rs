// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

/*!
Locker service trait.

Defines the stable inbound interface used by transport adapters (HTTP,
kiosk UI, bench tools) to drive rentals and returns.
*/

use crate::types::*;
use async_trait::async_trait;
use lockerkey_hal::SensorEdge;

/// Locker rental service (transport-agnostic)
#[async_trait]
pub trait LockerService: Send + Sync {
    /// Start a rent transaction
    ///
    /// Returns once the transaction is awaiting the key-removed edge.
    ///
    /// # Errors
    /// * `ServiceError::Rejected` - A precondition failed; nothing was created
    /// * `ServiceError::Storage` - The ledger row could not be opened
    ///
    async fn rent(&self, member_id: &str, locker_number: &str) -> ServiceResult<TransactionTicket>;

    /// Start a return transaction for the member's current locker
    ///
    /// # Errors
    /// * `ServiceError::Rejected` - Member is not renting, or is busy
    ///
    async fn return_locker(&self, member_id: &str) -> ServiceResult<TransactionTicket>;

    /// Poll a transaction
    ///
    /// # Errors
    /// * `ServiceError::NotFound` - Unknown, or resolved long enough ago to be evicted
    ///
    async fn status(&self, transaction_id: &str) -> ServiceResult<TransactionStatus>;

    /// Abandon a transaction that is still awaiting its sensor
    ///
    /// # Errors
    /// * `ServiceError::NotFound` - No live transaction with that id
    /// * `ServiceError::InvalidState` - Sensor already confirmed
    ///
    async fn cancel(&self, transaction_id: &str) -> ServiceResult<TransactionStatus>;

    /// Inject a sensor transition as if the hardware had reported it
    ///
    /// Returns false if the event was debounced.
    async fn simulate_sensor(&self, sensor_number: u32, edge: SensorEdge) -> ServiceResult<bool>;

    /// Resolve a scanned member id, barcode, or QR code
    async fn lookup_member(&self, code: &str) -> ServiceResult<Member>;

    /// Run the reconciliation pass now
    async fn reconcile(&self) -> ServiceResult<ReconcileReport>;
}
