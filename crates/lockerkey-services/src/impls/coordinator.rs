// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

/*!
Transaction coordinator.

Owns the rent/return lifecycle:

```text
begin_transaction ──► registry.try_register ──► preconditions ──► ledger row ──► arm
                                                                                 │
on_sensor_event ──► registry.claim_for_event ──► store.commit ──► finish ◄───────┘
                                                                    ▲
sweep_timeouts ──► registry.take_expired ──► ledger row timed_out ──┘
```

The registry lock is only held inside registry calls; every store call
happens outside it, after the transaction has been claimed.
*/

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, FixedOffset, Offset, Utc};
use lockerkey_config::TransactionConfig;
use lockerkey_hal::{Clock, SensorEvent, SensorEventSink};
use lockerkey_state_manager::{
    ActiveTransaction, ClaimOutcome, StateError, TransactionKind, TransactionRegistry,
    TransactionStep,
};
use tracing::{debug, error, info, warn};

use crate::impls::outcomes::OutcomePublisher;
use crate::traits::ConsistencyManager;
use crate::types::{
    local_date, BeginError, CommitRequest, LedgerError, LedgerResult, Member, MemberStatus,
    PendingRental, ReconcileOptions, ReconcileReport, Rejection, RentalStatus, SensorDisposition,
    TransactionOutcome, TransactionOutcomeEvent, TransactionStatus, TransactionTicket,
};

/// Upper bound on the verification timeout
const MAX_VERIFICATION_TIMEOUT_SECONDS: u64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorSettings {
    pub verification_timeout: Duration,
    pub max_daily_rentals: u32,
    /// Offset whose calendar day bounds the daily cap
    pub day_offset: FixedOffset,
}

impl CoordinatorSettings {
    pub fn from_config(config: &TransactionConfig) -> Self {
        let seconds = config
            .verification_timeout_seconds
            .min(MAX_VERIFICATION_TIMEOUT_SECONDS);
        Self {
            verification_timeout: Duration::seconds(seconds as i64),
            max_daily_rentals: config.max_daily_rentals,
            day_offset: FixedOffset::east_opt(config.daily_reset_utc_offset_minutes * 60)
                .unwrap_or_else(|| Utc.fix()),
        }
    }
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self::from_config(&TransactionConfig::default())
    }
}

/// The rent/return state machine
pub struct TransactionCoordinator {
    registry: Arc<TransactionRegistry>,
    store: Arc<dyn ConsistencyManager>,
    clock: Arc<dyn Clock>,
    outcomes: OutcomePublisher,
    settings: CoordinatorSettings,
    commit_failures: AtomicU64,
}

impl TransactionCoordinator {
    pub fn new(
        registry: Arc<TransactionRegistry>,
        store: Arc<dyn ConsistencyManager>,
        clock: Arc<dyn Clock>,
        outcomes: OutcomePublisher,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            registry,
            store,
            clock,
            outcomes,
            settings,
            commit_failures: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<TransactionRegistry> {
        &self.registry
    }

    pub fn outcomes(&self) -> &OutcomePublisher {
        &self.outcomes
    }

    pub fn settings(&self) -> CoordinatorSettings {
        self.settings
    }

    /// Commits that failed after the hardware had already confirmed
    pub fn commit_failures(&self) -> u64 {
        self.commit_failures.load(Ordering::Relaxed)
    }

    // ========================================================================
    // BEGIN
    // ========================================================================

    /// Open a transaction and arm its deadline
    ///
    /// Rejections are synchronous and leave nothing behind: no registry
    /// entry and no ledger row.
    pub fn begin_transaction(
        &self,
        kind: TransactionKind,
        member_id: &str,
        locker_number: &str,
    ) -> Result<TransactionTicket, BeginError> {
        let now = self.clock.now();
        let deadline = now + self.settings.verification_timeout;

        let tx = self
            .registry
            .try_register(kind, member_id, locker_number, now)
            .map_err(|err| match err {
                StateError::LockerBusy { locker_number, .. } => {
                    BeginError::Rejected(Rejection::LockerBusy { locker_number })
                }
                StateError::MemberBusy { member_id, .. } => {
                    BeginError::Rejected(Rejection::MemberBusy { member_id })
                }
                other => BeginError::State(other),
            });
        let tx = match tx {
            Ok(tx) => tx,
            Err(err) => {
                info!(target: "lockerkey-services", %kind, member_id, locker_number, reason = %err, "Transaction rejected");
                return Err(err);
            }
        };

        let rental_id = match self.prepare(&tx, now, deadline) {
            Ok(rental_id) => rental_id,
            Err(err) => {
                self.abandon(&tx);
                match &err {
                    BeginError::Rejected(rejection) => {
                        info!(target: "lockerkey-services", %kind, member_id, locker_number, reason = %rejection, "Transaction rejected");
                    }
                    other => {
                        error!(target: "lockerkey-services", %kind, member_id, locker_number, error = %other, "Transaction could not be opened");
                    }
                }
                return Err(err);
            }
        };

        let armed = match self.registry.arm(&tx.transaction_id, deadline, Some(rental_id)) {
            Ok(armed) => armed,
            Err(err) => {
                if kind == TransactionKind::Rent {
                    self.close_pending(rental_id, RentalStatus::Failed, now);
                }
                self.abandon(&tx);
                return Err(BeginError::State(err));
            }
        };

        info!(
            target: "lockerkey-services",
            transaction_id = %armed.transaction_id,
            rental_id,
            %kind,
            member_id,
            locker_number,
            deadline = %deadline,
            "Awaiting sensor confirmation"
        );

        Ok(TransactionTicket {
            transaction_id: armed.transaction_id,
            kind,
            member_id: armed.member_id,
            locker_number: armed.locker_number,
            step: armed.step,
            deadline,
            rental_id,
        })
    }

    /// Check preconditions and find or create the backing ledger row
    fn prepare(
        &self,
        tx: &ActiveTransaction,
        now: DateTime<Utc>,
        deadline: DateTime<Utc>,
    ) -> Result<i64, BeginError> {
        let member = self
            .store
            .load_member(&tx.member_id)?
            .ok_or_else(|| Rejection::MemberNotFound {
                member_id: tx.member_id.clone(),
            })?;

        match tx.kind {
            TransactionKind::Rent => {
                self.check_rent(&member, &tx.locker_number, now)?;
                let rental_id = self.store.open_pending_rental(&PendingRental {
                    transaction_id: tx.transaction_id.clone(),
                    member_id: tx.member_id.clone(),
                    locker_number: tx.locker_number.clone(),
                    initiated_at: now,
                    deadline,
                })?;
                Ok(rental_id)
            }
            TransactionKind::Return => self.check_return(&member, &tx.locker_number),
        }
    }

    fn check_rent(
        &self,
        member: &Member,
        locker_number: &str,
        now: DateTime<Utc>,
    ) -> Result<(), BeginError> {
        let member_id = member.member_id.clone();

        if member.status != MemberStatus::Active {
            return Err(Rejection::MemberInactive {
                member_id,
                status: member.status,
            }
            .into());
        }
        if let Some(expired_on) = member.expired_on(local_date(now, self.settings.day_offset)) {
            return Err(Rejection::MembershipExpired {
                member_id,
                expired_on,
            }
            .into());
        }
        if let Some(current) = &member.currently_renting {
            return Err(Rejection::AlreadyRenting {
                member_id,
                locker_number: current.clone(),
            }
            .into());
        }
        let count = member.rentals_today(now, self.settings.day_offset);
        if count >= self.settings.max_daily_rentals {
            return Err(Rejection::DailyLimitReached {
                member_id,
                count,
                limit: self.settings.max_daily_rentals,
            }
            .into());
        }

        let locker = self
            .store
            .load_locker(locker_number)?
            .ok_or_else(|| Rejection::LockerNotFound {
                locker_number: locker_number.to_string(),
            })?;
        if !locker.is_in_service() {
            return Err(Rejection::LockerOutOfService {
                locker_number: locker_number.to_string(),
            }
            .into());
        }
        if locker.current_member.is_some() {
            return Err(Rejection::LockerOccupied {
                locker_number: locker_number.to_string(),
            }
            .into());
        }
        if !member.may_use_zone(&locker.zone) {
            return Err(Rejection::ZoneNotPermitted {
                member_id,
                zone: locker.zone,
            }
            .into());
        }
        Ok(())
    }

    /// Returns the active rental being closed
    fn check_return(&self, member: &Member, locker_number: &str) -> Result<i64, BeginError> {
        let Some(renting) = &member.currently_renting else {
            return Err(Rejection::NotRenting {
                member_id: member.member_id.clone(),
            }
            .into());
        };
        if renting != locker_number {
            return Err(Rejection::WrongLocker {
                member_id: member.member_id.clone(),
                renting: renting.clone(),
                requested: locker_number.to_string(),
            }
            .into());
        }

        match self.store.active_rental_for_member(&member.member_id)? {
            Some(rental) if rental.locker_number == locker_number => Ok(rental.rental_id),
            other => {
                let detail = format!(
                    "member {} points at {} but the active rental is {:?}",
                    member.member_id,
                    locker_number,
                    other.map(|r| (r.rental_id, r.locker_number))
                );
                error!(target: "lockerkey-services", member_id = %member.member_id, locker_number, "Member pointer has no matching active rental");
                Err(LedgerError::Inconsistent(detail).into())
            }
        }
    }

    fn abandon(&self, tx: &ActiveTransaction) {
        if let Err(err) = self.registry.abandon(&tx.transaction_id) {
            error!(target: "lockerkey-services", transaction_id = %tx.transaction_id, error = %err, "Failed to release rejected transaction");
        }
    }

    // ========================================================================
    // SENSOR EVENTS
    // ========================================================================

    /// Route one normalized sensor event
    pub fn on_sensor_event(&self, event: &SensorEvent) -> SensorDisposition {
        match self
            .registry
            .claim_for_event(&event.locker_number, event.edge, event.observed_at)
        {
            ClaimOutcome::NoTransaction => {
                debug!(target: "lockerkey-services", locker_number = %event.locker_number, edge = %event.edge, "No transaction awaiting this locker; event discarded");
                SensorDisposition::Discarded
            }
            ClaimOutcome::NotAwaiting {
                transaction_id,
                step,
            } => {
                debug!(target: "lockerkey-services", %transaction_id, %step, edge = %event.edge, "Transaction not awaiting a sensor; event discarded");
                SensorDisposition::Discarded
            }
            ClaimOutcome::EdgeMismatch {
                transaction_id,
                expected,
            } => {
                debug!(target: "lockerkey-services", %transaction_id, %expected, edge = %event.edge, "Edge does not confirm transaction; still waiting");
                SensorDisposition::EdgeMismatch { transaction_id }
            }
            ClaimOutcome::Claimed(tx) => self.resolve_claimed(tx, event.observed_at),
        }
    }

    fn resolve_claimed(&self, tx: ActiveTransaction, confirmed_at: DateTime<Utc>) -> SensorDisposition {
        let result = match tx.rental_id {
            Some(rental_id) => self.store.commit(&CommitRequest {
                transaction_id: tx.transaction_id.clone(),
                kind: tx.kind,
                rental_id,
                member_id: tx.member_id.clone(),
                locker_number: tx.locker_number.clone(),
                confirmed_at,
            }),
            None => Err(LedgerError::Inconsistent(format!(
                "transaction {} has no ledger row",
                tx.transaction_id
            ))),
        };

        match result {
            Ok(receipt) => {
                if let Err(err) = self
                    .registry
                    .finish(&tx.transaction_id, TransactionStep::Completed)
                {
                    error!(target: "lockerkey-services", transaction_id = %tx.transaction_id, error = %err, "Committed transaction could not be deregistered");
                }
                info!(
                    target: "lockerkey-services",
                    transaction_id = %tx.transaction_id,
                    rental_id = receipt.rental_id,
                    kind = %tx.kind,
                    member_id = %tx.member_id,
                    locker_number = %tx.locker_number,
                    daily_rental_count = receipt.daily_rental_count,
                    "Transaction completed"
                );
                self.publish(&tx, TransactionOutcome::Completed, None);
                SensorDisposition::Completed {
                    transaction_id: tx.transaction_id,
                    rental_id: receipt.rental_id,
                }
            }
            Err(err) => {
                self.commit_failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    target: "lockerkey-services",
                    transaction_id = %tx.transaction_id,
                    rental_id = ?tx.rental_id,
                    kind = %tx.kind,
                    member_id = %tx.member_id,
                    locker_number = %tx.locker_number,
                    error = %err,
                    "Commit failed after sensor confirmation; locker and records have diverged"
                );
                if let (TransactionKind::Rent, Some(rental_id)) = (tx.kind, tx.rental_id) {
                    self.close_pending(rental_id, RentalStatus::Failed, confirmed_at);
                }
                if let Err(state_err) = self
                    .registry
                    .finish(&tx.transaction_id, TransactionStep::Failed)
                {
                    error!(target: "lockerkey-services", transaction_id = %tx.transaction_id, error = %state_err, "Failed transaction could not be deregistered");
                }
                let detail = err.to_string();
                self.publish(&tx, TransactionOutcome::Failed, Some(detail.clone()));
                SensorDisposition::CommitFailed {
                    transaction_id: tx.transaction_id,
                    error: detail,
                }
            }
        }
    }

    // ========================================================================
    // TIMEOUTS, CANCEL, QUERIES
    // ========================================================================

    /// Expire every transaction past its deadline
    ///
    /// A rent's ledger row becomes `timed_out`; a return leaves the active
    /// rental untouched. No member or locker record changes. The registry
    /// keeps the row out of reconciliation until it is closed here.
    pub fn sweep_timeouts(&self) -> Vec<ActiveTransaction> {
        let now = self.clock.now();
        let expired = self.registry.take_expired(now);
        for tx in &expired {
            if let (TransactionKind::Rent, Some(rental_id)) = (tx.kind, tx.rental_id) {
                self.close_pending(rental_id, RentalStatus::TimedOut, now);
                self.registry.release_rental(rental_id);
            }
            info!(
                target: "lockerkey-services",
                transaction_id = %tx.transaction_id,
                rental_id = ?tx.rental_id,
                kind = %tx.kind,
                member_id = %tx.member_id,
                locker_number = %tx.locker_number,
                "Transaction timed out"
            );
            self.publish(tx, TransactionOutcome::TimedOut, None);
        }
        expired
    }

    /// `awaiting_sensor → failed` on request
    pub fn cancel(&self, transaction_id: &str) -> Result<TransactionStatus, StateError> {
        let tx = self.registry.cancel(transaction_id)?;
        if let (TransactionKind::Rent, Some(rental_id)) = (tx.kind, tx.rental_id) {
            self.close_pending(rental_id, RentalStatus::Failed, self.clock.now());
            self.registry.release_rental(rental_id);
        }
        info!(target: "lockerkey-services", transaction_id, kind = %tx.kind, member_id = %tx.member_id, locker_number = %tx.locker_number, "Transaction cancelled");
        self.publish(&tx, TransactionOutcome::Failed, Some("cancelled".to_string()));
        Ok(tx.into())
    }

    /// Live or recently terminated transaction
    pub fn query_status(&self, transaction_id: &str) -> Option<TransactionStatus> {
        self.registry.get(transaction_id).map(TransactionStatus::from)
    }

    /// Restore ledger/member/locker invariants, sparing rows of live transactions
    pub fn reconcile(&self, options: ReconcileOptions) -> LedgerResult<ReconcileReport> {
        let live = self.registry.live_rental_ids();
        let report = self.store.reconcile(&live, options, self.clock.now())?;
        if !report.is_consistent() {
            error!(
                target: "lockerkey-services",
                duplicate_active = report.duplicate_active_failed.len(),
                member_repairs = report.member_repairs.len(),
                locker_repairs = report.locker_repairs.len(),
                dry_run = report.dry_run,
                "Member, locker, and rental records had diverged"
            );
        }
        Ok(report)
    }

    fn close_pending(&self, rental_id: i64, status: RentalStatus, at: DateTime<Utc>) {
        if let Err(err) = self.store.close_pending_rental(rental_id, status, at) {
            warn!(target: "lockerkey-services", rental_id, status = %status, error = %err, "Pending rental could not be closed; reconciliation will retry");
        }
    }

    fn publish(&self, tx: &ActiveTransaction, outcome: TransactionOutcome, detail: Option<String>) {
        self.outcomes.publish(TransactionOutcomeEvent {
            rental_id: tx.rental_id,
            transaction_id: tx.transaction_id.clone(),
            member_id: tx.member_id.clone(),
            locker_number: tx.locker_number.clone(),
            kind: tx.kind,
            outcome,
            detail,
            occurred_at: self.clock.now(),
        });
    }
}

impl SensorEventSink for TransactionCoordinator {
    fn dispatch(&self, event: SensorEvent) {
        self.on_sensor_event(&event);
    }
}
