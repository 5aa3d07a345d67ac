// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Active-transaction registry
//!
//! One coarse lock guards three indexes (by id, by locker, by member) so that
//! registration, event claims, expiry, and deregistration are each a single
//! atomic step. A transaction keeps its locker and member keys from
//! `try_register` until `finish`, including while its commit runs outside
//! the lock. A rent that expires or is cancelled leaves the registry with
//! its pending ledger row still open; that row stays in the live set until
//! `release_rental` so reconciliation never races the caller closing it.

use std::collections::VecDeque;

use ahash::{AHashMap, AHashSet};
use chrono::{DateTime, Utc};
use lockerkey_hal::SensorEdge;
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::transaction::{ActiveTransaction, TransactionKind, TransactionStep};
use crate::{Result, StateError};

/// Result of routing a sensor event to the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The transaction moved to `sensor_confirmed`; the caller owns the commit
    Claimed(ActiveTransaction),
    /// No transaction holds this locker
    NoTransaction,
    /// A transaction holds the locker but is not awaiting a sensor
    NotAwaiting {
        transaction_id: String,
        step: TransactionStep,
    },
    /// Awaiting, but this edge does not confirm it
    EdgeMismatch {
        transaction_id: String,
        expected: SensorEdge,
    },
}

#[derive(Debug)]
struct RegistryInner {
    by_id: AHashMap<String, ActiveTransaction>,
    by_locker: AHashMap<String, String>,
    by_member: AHashMap<String, String>,
    recent: VecDeque<ActiveTransaction>,
    retention: usize,
    /// Pending rows of deregistered rents not yet closed by the caller
    retiring: AHashSet<i64>,
}

impl RegistryInner {
    fn get_mut(&mut self, transaction_id: &str) -> Result<&mut ActiveTransaction> {
        self.by_id
            .get_mut(transaction_id)
            .ok_or_else(|| StateError::TransactionNotFound(transaction_id.to_string()))
    }

    fn remove(&mut self, transaction_id: &str) -> Option<ActiveTransaction> {
        let tx = self.by_id.remove(transaction_id)?;
        if self.by_locker.get(&tx.locker_number).map(String::as_str) == Some(transaction_id) {
            self.by_locker.remove(&tx.locker_number);
        }
        if self.by_member.get(&tx.member_id).map(String::as_str) == Some(transaction_id) {
            self.by_member.remove(&tx.member_id);
        }
        Some(tx)
    }

    fn remember(&mut self, tx: ActiveTransaction) {
        if self.retention == 0 {
            return;
        }
        while self.recent.len() >= self.retention {
            self.recent.pop_front();
        }
        self.recent.push_back(tx);
    }

    fn hold_pending_row(&mut self, tx: &ActiveTransaction) {
        if let (TransactionKind::Rent, Some(rental_id)) = (tx.kind, tx.rental_id) {
            self.retiring.insert(rental_id);
        }
    }
}

fn check_transition(tx: &ActiveTransaction, to: TransactionStep) -> Result<()> {
    if tx.step.can_transition_to(to) {
        return Ok(());
    }
    error!(
        target: "lockerkey-state-manager",
        transaction_id = %tx.transaction_id,
        from = %tx.step,
        to = %to,
        "Illegal transaction transition"
    );
    Err(StateError::InvalidTransition {
        transaction_id: tx.transaction_id.clone(),
        from: tx.step,
        to,
    })
}

/// Process-wide index of in-flight transactions
///
/// Constructed once and shared by reference (`Arc`) between the coordinator
/// and whatever routes sensor events to it.
#[derive(Debug)]
pub struct TransactionRegistry {
    inner: Mutex<RegistryInner>,
}

impl TransactionRegistry {
    /// `retention` bounds how many terminal transactions stay queryable
    pub fn new(retention: usize) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                by_id: AHashMap::new(),
                by_locker: AHashMap::new(),
                by_member: AHashMap::new(),
                recent: VecDeque::with_capacity(retention.min(1024)),
                retention,
                retiring: AHashSet::new(),
            }),
        }
    }

    /// Claim the locker and member keys for a new `initiated` transaction
    pub fn try_register(
        &self,
        kind: TransactionKind,
        member_id: &str,
        locker_number: &str,
        now: DateTime<Utc>,
    ) -> Result<ActiveTransaction> {
        let mut inner = self.inner.lock();

        if let Some(holder) = inner.by_locker.get(locker_number) {
            return Err(StateError::LockerBusy {
                locker_number: locker_number.to_string(),
                transaction_id: holder.clone(),
            });
        }
        if let Some(holder) = inner.by_member.get(member_id) {
            return Err(StateError::MemberBusy {
                member_id: member_id.to_string(),
                transaction_id: holder.clone(),
            });
        }

        let transaction_id = uuid::Uuid::new_v4().to_string();
        let tx = ActiveTransaction::new(transaction_id.clone(), kind, member_id, locker_number, now);

        inner
            .by_locker
            .insert(locker_number.to_string(), transaction_id.clone());
        inner
            .by_member
            .insert(member_id.to_string(), transaction_id.clone());
        inner.by_id.insert(transaction_id, tx.clone());

        debug!(target: "lockerkey-state-manager", transaction_id = %tx.transaction_id, %kind, member_id, locker_number, "Transaction registered");
        Ok(tx)
    }

    /// `initiated → awaiting_sensor` with a deadline and the backing ledger row
    pub fn arm(
        &self,
        transaction_id: &str,
        deadline: DateTime<Utc>,
        rental_id: Option<i64>,
    ) -> Result<ActiveTransaction> {
        let mut inner = self.inner.lock();
        let tx = inner.get_mut(transaction_id)?;
        check_transition(tx, TransactionStep::AwaitingSensor)?;
        tx.step = TransactionStep::AwaitingSensor;
        tx.deadline = Some(deadline);
        tx.rental_id = rental_id;
        Ok(tx.clone())
    }

    /// Atomically find the transaction holding `locker_number` and, if it is
    /// awaiting this edge, move it to `sensor_confirmed`
    pub fn claim_for_event(
        &self,
        locker_number: &str,
        edge: SensorEdge,
        observed_at: DateTime<Utc>,
    ) -> ClaimOutcome {
        let mut inner = self.inner.lock();

        let Some(transaction_id) = inner.by_locker.get(locker_number).cloned() else {
            return ClaimOutcome::NoTransaction;
        };
        let Some(tx) = inner.by_id.get_mut(&transaction_id) else {
            return ClaimOutcome::NoTransaction;
        };

        if tx.step != TransactionStep::AwaitingSensor {
            return ClaimOutcome::NotAwaiting {
                transaction_id,
                step: tx.step,
            };
        }
        if tx.expected_edge != edge {
            return ClaimOutcome::EdgeMismatch {
                transaction_id,
                expected: tx.expected_edge,
            };
        }

        tx.step = TransactionStep::SensorConfirmed;
        tx.sensor_confirmed_at = Some(observed_at);
        ClaimOutcome::Claimed(tx.clone())
    }

    /// Move to a terminal step and deregister
    pub fn finish(&self, transaction_id: &str, to: TransactionStep) -> Result<ActiveTransaction> {
        let mut inner = self.inner.lock();
        let tx = inner.get_mut(transaction_id)?;
        check_transition(tx, to)?;
        if !to.is_terminal() {
            return Err(StateError::InvalidTransition {
                transaction_id: transaction_id.to_string(),
                from: tx.step,
                to,
            });
        }
        tx.step = to;

        let Some(done) = inner.remove(transaction_id) else {
            return Err(StateError::TransactionNotFound(transaction_id.to_string()));
        };
        inner.remember(done.clone());
        debug!(target: "lockerkey-state-manager", transaction_id, step = %to, "Transaction deregistered");
        Ok(done)
    }

    /// `awaiting_sensor → failed`, refused once a sensor event has claimed it
    ///
    /// A rent's pending row stays live until `release_rental`.
    pub fn cancel(&self, transaction_id: &str) -> Result<ActiveTransaction> {
        let mut inner = self.inner.lock();
        let tx = inner.get_mut(transaction_id)?;
        if tx.step != TransactionStep::AwaitingSensor {
            return Err(StateError::InvalidTransition {
                transaction_id: transaction_id.to_string(),
                from: tx.step,
                to: TransactionStep::Failed,
            });
        }
        tx.step = TransactionStep::Failed;

        let Some(done) = inner.remove(transaction_id) else {
            return Err(StateError::TransactionNotFound(transaction_id.to_string()));
        };
        inner.hold_pending_row(&done);
        inner.remember(done.clone());
        debug!(target: "lockerkey-state-manager", transaction_id, "Transaction cancelled and deregistered");
        Ok(done)
    }

    /// Drop an `initiated` transaction whose preconditions failed
    ///
    /// Unlike `finish`, the attempt is not retained: a rejected request never
    /// became a transaction the caller can poll.
    pub fn abandon(&self, transaction_id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let tx = inner.get_mut(transaction_id)?;
        if tx.step != TransactionStep::Initiated {
            return Err(StateError::InvalidTransition {
                transaction_id: transaction_id.to_string(),
                from: tx.step,
                to: TransactionStep::Failed,
            });
        }
        inner.remove(transaction_id);
        debug!(target: "lockerkey-state-manager", transaction_id, "Transaction abandoned");
        Ok(())
    }

    /// Remove every armed transaction whose deadline is at or before `now`,
    /// marking each `timed_out`
    ///
    /// Expired rents keep their pending rows live until `release_rental`.
    pub fn take_expired(&self, now: DateTime<Utc>) -> Vec<ActiveTransaction> {
        let mut inner = self.inner.lock();

        let expired_ids: Vec<String> = inner
            .by_id
            .values()
            .filter(|tx| tx.is_expired(now))
            .map(|tx| tx.transaction_id.clone())
            .collect();

        let mut expired = Vec::with_capacity(expired_ids.len());
        for id in expired_ids {
            if let Some(mut tx) = inner.remove(&id) {
                tx.step = TransactionStep::TimedOut;
                inner.hold_pending_row(&tx);
                inner.remember(tx.clone());
                expired.push(tx);
            }
        }
        expired
    }

    /// Live transaction, else a retained terminal one
    pub fn get(&self, transaction_id: &str) -> Option<ActiveTransaction> {
        let inner = self.inner.lock();
        if let Some(tx) = inner.by_id.get(transaction_id) {
            return Some(tx.clone());
        }
        inner
            .recent
            .iter()
            .rev()
            .find(|tx| tx.transaction_id == transaction_id)
            .cloned()
    }

    pub fn for_locker(&self, locker_number: &str) -> Option<ActiveTransaction> {
        let inner = self.inner.lock();
        inner
            .by_locker
            .get(locker_number)
            .and_then(|id| inner.by_id.get(id))
            .cloned()
    }

    pub fn for_member(&self, member_id: &str) -> Option<ActiveTransaction> {
        let inner = self.inner.lock();
        inner
            .by_member
            .get(member_id)
            .and_then(|id| inner.by_id.get(id))
            .cloned()
    }

    pub fn live_ids(&self) -> Vec<String> {
        self.inner.lock().by_id.keys().cloned().collect()
    }

    /// The pending row of an expired or cancelled rent has been closed
    pub fn release_rental(&self, rental_id: i64) {
        self.inner.lock().retiring.remove(&rental_id);
    }

    /// Ledger rows backing live transactions, plus rows still being closed
    pub fn live_rental_ids(&self) -> Vec<i64> {
        let inner = self.inner.lock();
        inner
            .by_id
            .values()
            .filter_map(|tx| tx.rental_id)
            .chain(inner.retiring.iter().copied())
            .collect()
    }

    pub fn live_count(&self) -> usize {
        self.inner.lock().by_id.len()
    }
}

impl Default for TransactionRegistry {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use std::sync::Arc;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap()
    }

    fn armed(registry: &TransactionRegistry, kind: TransactionKind, member: &str, locker: &str) -> ActiveTransaction {
        let tx = registry.try_register(kind, member, locker, t0()).unwrap();
        registry
            .arm(&tx.transaction_id, t0() + Duration::seconds(30), Some(1))
            .unwrap()
    }

    #[test]
    fn test_locker_and_member_exclusion() {
        let registry = TransactionRegistry::new(8);
        let first = armed(&registry, TransactionKind::Rent, "M1", "A05");

        match registry.try_register(TransactionKind::Rent, "M2", "A05", t0()) {
            Err(StateError::LockerBusy { transaction_id, .. }) => {
                assert_eq!(transaction_id, first.transaction_id)
            }
            other => panic!("expected LockerBusy, got {:?}", other),
        }
        assert!(matches!(
            registry.try_register(TransactionKind::Rent, "M1", "A06", t0()),
            Err(StateError::MemberBusy { .. })
        ));
        assert_eq!(registry.live_count(), 1);
    }

    #[test]
    fn test_claim_requires_matching_edge() {
        let registry = TransactionRegistry::new(8);
        let tx = armed(&registry, TransactionKind::Rent, "M1", "A05");

        assert_eq!(
            registry.claim_for_event("A05", SensorEdge::Engaged, t0()),
            ClaimOutcome::EdgeMismatch {
                transaction_id: tx.transaction_id.clone(),
                expected: SensorEdge::Vacant
            }
        );
        assert_eq!(
            registry.get(&tx.transaction_id).unwrap().step,
            TransactionStep::AwaitingSensor
        );

        let ClaimOutcome::Claimed(claimed) =
            registry.claim_for_event("A05", SensorEdge::Vacant, t0())
        else {
            panic!("expected claim");
        };
        assert_eq!(claimed.step, TransactionStep::SensorConfirmed);
        assert_eq!(claimed.sensor_confirmed_at, Some(t0()));

        // Second matching event while commit is in flight
        assert!(matches!(
            registry.claim_for_event("A05", SensorEdge::Vacant, t0()),
            ClaimOutcome::NotAwaiting {
                step: TransactionStep::SensorConfirmed,
                ..
            }
        ));
    }

    #[test]
    fn test_finish_deregisters_and_retains_outcome() {
        let registry = TransactionRegistry::new(8);
        let tx = armed(&registry, TransactionKind::Rent, "M1", "A05");
        registry.claim_for_event("A05", SensorEdge::Vacant, t0());
        registry
            .finish(&tx.transaction_id, TransactionStep::Completed)
            .unwrap();

        assert_eq!(registry.live_count(), 0);
        assert_eq!(
            registry.claim_for_event("A05", SensorEdge::Vacant, t0()),
            ClaimOutcome::NoTransaction
        );
        assert_eq!(
            registry.get(&tx.transaction_id).unwrap().step,
            TransactionStep::Completed
        );
        // Keys are free again
        assert!(registry
            .try_register(TransactionKind::Return, "M1", "A05", t0())
            .is_ok());
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let registry = TransactionRegistry::new(8);
        let tx = registry
            .try_register(TransactionKind::Rent, "M1", "A05", t0())
            .unwrap();

        assert!(matches!(
            registry.finish(&tx.transaction_id, TransactionStep::Completed),
            Err(StateError::InvalidTransition {
                from: TransactionStep::Initiated,
                to: TransactionStep::Completed,
                ..
            })
        ));
        assert!(matches!(
            registry.finish(&tx.transaction_id, TransactionStep::TimedOut),
            Err(StateError::InvalidTransition { .. })
        ));
        // Rejection before any wait
        registry
            .finish(&tx.transaction_id, TransactionStep::Failed)
            .unwrap();
        assert!(matches!(
            registry.arm(&tx.transaction_id, t0(), None),
            Err(StateError::TransactionNotFound(_))
        ));
    }

    #[test]
    fn test_take_expired() {
        let registry = TransactionRegistry::new(8);
        let early = armed(&registry, TransactionKind::Rent, "M1", "A05");
        let pending = registry
            .try_register(TransactionKind::Rent, "M2", "A06", t0())
            .unwrap();
        registry
            .arm(&pending.transaction_id, t0() + Duration::seconds(60), Some(2))
            .unwrap();

        assert!(registry.take_expired(t0() + Duration::seconds(29)).is_empty());

        let expired = registry.take_expired(t0() + Duration::seconds(30));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].transaction_id, early.transaction_id);
        assert_eq!(expired[0].step, TransactionStep::TimedOut);
        assert_eq!(registry.live_count(), 1);

        // Late event for the expired locker is not routed
        assert_eq!(
            registry.claim_for_event("A05", SensorEdge::Vacant, t0() + Duration::seconds(31)),
            ClaimOutcome::NoTransaction
        );
    }

    #[test]
    fn test_claimed_transaction_never_expires() {
        let registry = TransactionRegistry::new(8);
        let tx = armed(&registry, TransactionKind::Rent, "M1", "A05");
        registry.claim_for_event("A05", SensorEdge::Vacant, t0());
        assert!(registry.take_expired(t0() + Duration::hours(1)).is_empty());
        assert!(registry.cancel(&tx.transaction_id).is_err());
    }

    #[test]
    fn test_cancel() {
        let registry = TransactionRegistry::new(8);
        let tx = armed(&registry, TransactionKind::Return, "M1", "A05");
        let cancelled = registry.cancel(&tx.transaction_id).unwrap();
        assert_eq!(cancelled.step, TransactionStep::Failed);
        assert!(registry.for_locker("A05").is_none());
        assert!(registry.for_member("M1").is_none());
        // A return's row is the active rental, not a pending one
        assert!(registry.live_rental_ids().is_empty());
    }

    #[test]
    fn test_retired_rent_rows_stay_live_until_released() {
        let registry = TransactionRegistry::new(8);
        armed(&registry, TransactionKind::Rent, "M1", "A05");
        let cancelled = registry
            .try_register(TransactionKind::Rent, "M2", "A06", t0())
            .unwrap();
        registry
            .arm(&cancelled.transaction_id, t0() + Duration::seconds(60), Some(2))
            .unwrap();

        assert_eq!(registry.take_expired(t0() + Duration::seconds(30)).len(), 1);
        registry.cancel(&cancelled.transaction_id).unwrap();
        assert_eq!(registry.live_count(), 0);

        let mut live = registry.live_rental_ids();
        live.sort_unstable();
        assert_eq!(live, vec![1, 2]);

        registry.release_rental(1);
        assert_eq!(registry.live_rental_ids(), vec![2]);
        registry.release_rental(2);
        assert!(registry.live_rental_ids().is_empty());
    }

    #[test]
    fn test_abandon_releases_keys_without_retaining() {
        let registry = TransactionRegistry::new(8);
        let tx = registry
            .try_register(TransactionKind::Rent, "M1", "A05", t0())
            .unwrap();
        registry.abandon(&tx.transaction_id).unwrap();

        assert!(registry.get(&tx.transaction_id).is_none());
        assert!(registry
            .try_register(TransactionKind::Rent, "M1", "A05", t0())
            .is_ok());

        let armed_tx = armed(&registry, TransactionKind::Rent, "M2", "A06");
        assert!(registry.abandon(&armed_tx.transaction_id).is_err());
    }

    #[test]
    fn test_retention_is_bounded() {
        let registry = TransactionRegistry::new(2);
        let mut ids = Vec::new();
        for i in 0..3 {
            let tx = registry
                .try_register(TransactionKind::Rent, &format!("M{}", i), "A05", t0())
                .unwrap();
            registry
                .finish(&tx.transaction_id, TransactionStep::Failed)
                .unwrap();
            ids.push(tx.transaction_id);
        }
        assert!(registry.get(&ids[0]).is_none());
        assert!(registry.get(&ids[1]).is_some());
        assert!(registry.get(&ids[2]).is_some());
    }

    #[test]
    fn test_concurrent_registration_single_winner() {
        let registry = Arc::new(TransactionRegistry::new(64));
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    registry
                        .try_register(TransactionKind::Rent, &format!("M{}", i), "A05", t0())
                        .is_ok()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(registry.live_count(), 1);
    }
}
