// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

/*!
Locker service implementation.

Thin adapter from the boundary API onto the coordinator, the consistency
manager, and the hardware ingestor.
*/

use std::sync::Arc;

use async_trait::async_trait;
use lockerkey_hal::{HardwareEventIngestor, IngestStats, SensorEdge};
use lockerkey_state_manager::TransactionKind;
use tracing::{debug, info};

use crate::impls::coordinator::TransactionCoordinator;
use crate::traits::{ConsistencyManager, LockerService};
use crate::types::*;

/// Default implementation of LockerService
pub struct LockerServiceImpl {
    coordinator: Arc<TransactionCoordinator>,
    store: Arc<dyn ConsistencyManager>,
    ingestor: Arc<HardwareEventIngestor>,
}

impl LockerServiceImpl {
    pub fn new(
        coordinator: Arc<TransactionCoordinator>,
        store: Arc<dyn ConsistencyManager>,
        ingestor: Arc<HardwareEventIngestor>,
    ) -> Self {
        Self {
            coordinator,
            store,
            ingestor,
        }
    }

    pub fn coordinator(&self) -> &Arc<TransactionCoordinator> {
        &self.coordinator
    }

    pub fn ingest_stats(&self) -> IngestStats {
        self.ingestor.stats()
    }
}

fn require(field: &str, value: &str) -> ServiceResult<()> {
    if value.trim().is_empty() {
        return Err(ServiceError::InvalidInput(format!("{field} must not be empty")));
    }
    Ok(())
}

#[async_trait]
impl LockerService for LockerServiceImpl {
    async fn rent(&self, member_id: &str, locker_number: &str) -> ServiceResult<TransactionTicket> {
        require("member_id", member_id)?;
        require("locker_number", locker_number)?;
        debug!(target: "lockerkey-services", member_id, locker_number, "Rent requested");

        Ok(self
            .coordinator
            .begin_transaction(TransactionKind::Rent, member_id, locker_number)?)
    }

    async fn return_locker(&self, member_id: &str) -> ServiceResult<TransactionTicket> {
        require("member_id", member_id)?;
        debug!(target: "lockerkey-services", member_id, "Return requested");

        let member = self
            .store
            .load_member(member_id)?
            .ok_or_else(|| Rejection::MemberNotFound {
                member_id: member_id.to_string(),
            })?;
        let locker_number = member
            .currently_renting
            .ok_or_else(|| Rejection::NotRenting {
                member_id: member_id.to_string(),
            })?;

        Ok(self
            .coordinator
            .begin_transaction(TransactionKind::Return, member_id, &locker_number)?)
    }

    async fn status(&self, transaction_id: &str) -> ServiceResult<TransactionStatus> {
        self.coordinator
            .query_status(transaction_id)
            .ok_or_else(|| ServiceError::NotFound {
                resource: "Transaction".to_string(),
                id: transaction_id.to_string(),
            })
    }

    async fn cancel(&self, transaction_id: &str) -> ServiceResult<TransactionStatus> {
        Ok(self.coordinator.cancel(transaction_id)?)
    }

    async fn simulate_sensor(&self, sensor_number: u32, edge: SensorEdge) -> ServiceResult<bool> {
        info!(target: "lockerkey-services", sensor_number, %edge, "Simulating sensor transition");
        Ok(self.ingestor.simulate_sensor(sensor_number, edge)?)
    }

    async fn lookup_member(&self, code: &str) -> ServiceResult<Member> {
        require("code", code)?;
        self.store
            .find_member_by_credential(code)?
            .ok_or_else(|| ServiceError::NotFound {
                resource: "Member".to_string(),
                id: code.to_string(),
            })
    }

    async fn reconcile(&self) -> ServiceResult<ReconcileReport> {
        info!(target: "lockerkey-services", "On-demand reconciliation requested");
        Ok(self.coordinator.reconcile(ReconcileOptions::periodic())?)
    }
}
