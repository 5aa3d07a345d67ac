// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Fan-out of resolved transactions to downstream collaborators.

use lockerkey_observability::AUDIT_TARGET;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::types::{TransactionOutcome, TransactionOutcomeEvent};

/// Broadcasts one [`TransactionOutcomeEvent`] per resolved transaction
///
/// Publishing never blocks and never fails the transaction: with no
/// subscribers the event is simply dropped, and a slow subscriber lags
/// rather than back-pressuring the coordinator.
#[derive(Clone, Debug)]
pub struct OutcomePublisher {
    sender: broadcast::Sender<TransactionOutcomeEvent>,
}

impl OutcomePublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Returns how many subscribers received the event
    pub fn publish(&self, event: TransactionOutcomeEvent) -> usize {
        match self.sender.send(event) {
            Ok(receivers) => receivers,
            Err(broadcast::error::SendError(event)) => {
                debug!(target: "lockerkey-services", transaction_id = %event.transaction_id, "Outcome dropped: no subscribers");
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransactionOutcomeEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for OutcomePublisher {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Write every outcome to the audit log target until shutdown
pub fn spawn_audit_logger(
    publisher: &OutcomePublisher,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let mut outcomes = publisher.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                received = outcomes.recv() => match received {
                    Ok(event) => log_outcome(&event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(target: AUDIT_TARGET, skipped, "Audit logger lagged; outcomes skipped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!(target: "lockerkey-services", "Audit logger stopped");
    })
}

fn log_outcome(event: &TransactionOutcomeEvent) {
    match event.outcome {
        TransactionOutcome::Completed => info!(
            target: AUDIT_TARGET,
            transaction_id = %event.transaction_id,
            rental_id = ?event.rental_id,
            member_id = %event.member_id,
            locker_number = %event.locker_number,
            kind = %event.kind,
            outcome = event.outcome.as_str(),
            occurred_at = %event.occurred_at,
            "Transaction completed"
        ),
        TransactionOutcome::TimedOut | TransactionOutcome::Failed => warn!(
            target: AUDIT_TARGET,
            transaction_id = %event.transaction_id,
            rental_id = ?event.rental_id,
            member_id = %event.member_id,
            locker_number = %event.locker_number,
            kind = %event.kind,
            outcome = event.outcome.as_str(),
            detail = event.detail.as_deref().unwrap_or(""),
            occurred_at = %event.occurred_at,
            "Transaction not completed"
        ),
    }
}
