// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Recurring background work: the timeout sweep and the reconciliation pass.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::impls::coordinator::TransactionCoordinator;
use crate::types::ReconcileOptions;

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Run `SweepTimeouts` every `period` until shutdown
pub fn spawn_timeout_sweeper(
    coordinator: Arc<TransactionCoordinator>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(target: "lockerkey-services", period_ms = period.as_millis() as u64, "Timeout sweeper started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let expired = coordinator.sweep_timeouts();
                    if !expired.is_empty() {
                        debug!(target: "lockerkey-services", expired = expired.len(), "Timeout sweep");
                    }
                }
                _ = stopped(&mut shutdown) => break,
            }
        }
        info!(target: "lockerkey-services", "Timeout sweeper stopped");
    })
}

/// Run the periodic reconciliation pass every `period` until shutdown
///
/// The first pass happens one period after start; the startup pass is the
/// caller's job.
pub fn spawn_reconciler(
    coordinator: Arc<TransactionCoordinator>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = period.max(Duration::from_secs(1));
        let start = tokio::time::Instant::now() + period;
        let mut ticker = tokio::time::interval_at(start, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(target: "lockerkey-services", period_s = period.as_secs(), "Reconciler started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = coordinator.reconcile(ReconcileOptions::periodic()) {
                        error!(target: "lockerkey-services", error = %err, "Reconciliation pass failed");
                    }
                }
                _ = stopped(&mut shutdown) => break,
            }
        }
        info!(target: "lockerkey-services", "Reconciler stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::coordinator::CoordinatorSettings;
    use crate::impls::outcomes::OutcomePublisher;
    use crate::impls::sqlite_store::SqliteConsistencyManager;
    use crate::types::{Locker, Member, RentalStatus};
    use chrono::{TimeZone, Utc};
    use lockerkey_hal::ManualClock;
    use lockerkey_state_manager::{TransactionKind, TransactionRegistry};

    #[tokio::test]
    async fn test_sweeper_times_out_and_stops() {
        let t0 = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(t0));
        let store = Arc::new(SqliteConsistencyManager::in_memory().unwrap());
        store
            .upsert_locker(&Locker::new("M01", "MALE", Some(1), t0))
            .unwrap();
        store.upsert_member(&Member::new("K1", "Kim"), t0).unwrap();

        let coordinator = Arc::new(TransactionCoordinator::new(
            Arc::new(TransactionRegistry::new(8)),
            store.clone(),
            clock.clone(),
            OutcomePublisher::new(8),
            CoordinatorSettings::default(),
        ));
        let mut outcomes = coordinator.outcomes().subscribe();
        let ticket = coordinator
            .begin_transaction(TransactionKind::Rent, "K1", "M01")
            .unwrap();
        clock.advance(chrono::Duration::seconds(31));

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = spawn_timeout_sweeper(coordinator.clone(), Duration::from_millis(5), stop_rx);

        let outcome = tokio::time::timeout(Duration::from_secs(5), outcomes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.transaction_id, ticket.transaction_id);
        assert_eq!(
            store.rental(ticket.rental_id).unwrap().unwrap().status,
            RentalStatus::TimedOut
        );

        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_reconciler_stops_on_shutdown() {
        let coordinator = Arc::new(TransactionCoordinator::new(
            Arc::new(TransactionRegistry::new(8)),
            Arc::new(SqliteConsistencyManager::in_memory().unwrap()),
            Arc::new(ManualClock::new(Utc::now())),
            OutcomePublisher::default(),
            CoordinatorSettings::default(),
        ));
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = spawn_reconciler(coordinator, Duration::from_secs(60), stop_rx);
        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
