// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! # Lockerkey - sensor-confirmed locker rentals
//!
//! Umbrella crate over the lockerkey workspace. A member's rent or return
//! request opens a transaction that only completes when the locker's key
//! sensor reports the matching edge before the deadline; the member
//! pointer, the locker row, and the rental ledger are then written as one
//! unit.
//!
//! ## Crates
//!
//! - [`config`]: TOML configuration with environment and CLI overrides
//! - [`observability`]: logging initialisation and per-crate debug flags
//! - [`hal`]: clock, sensor addressing, wire decoding, the hardware ingestor
//! - [`state_manager`]: the in-flight transaction registry
//! - [`services`]: coordinator, consistency manager, boundary service
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use lockerkey::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(SqliteConsistencyManager::in_memory()?);
//! let clock = Arc::new(SystemClock);
//! let coordinator = Arc::new(TransactionCoordinator::new(
//!     Arc::new(TransactionRegistry::default()),
//!     store.clone(),
//!     clock,
//!     OutcomePublisher::default(),
//!     CoordinatorSettings::default(),
//! ));
//!
//! let ticket = coordinator.begin_transaction(TransactionKind::Rent, "M1", "A05")?;
//! coordinator.on_sensor_event(&SensorEvent {
//!     locker_number: "A05".to_string(),
//!     edge: SensorEdge::Vacant,
//!     observed_at: chrono::Utc::now(),
//! });
//! println!("{:?}", coordinator.query_status(&ticket.transaction_id));
//! # Ok(())
//! # }
//! ```

pub use lockerkey_config as config;
pub use lockerkey_hal as hal;
pub use lockerkey_observability as observability;
pub use lockerkey_services as services;
pub use lockerkey_state_manager as state_manager;

/// Prelude - commonly used types and traits
pub mod prelude {
    pub use crate::config::{load_config, validate_config, LockerkeyConfig};
    pub use crate::hal::{
        Clock, HardwareEventIngestor, SensorAddressResolver, SensorEdge, SensorEvent,
        SensorEventSink, SystemClock,
    };
    pub use crate::services::{
        ConsistencyManager, CoordinatorSettings, LockerService, LockerServiceImpl,
        OutcomePublisher, Rejection, ServiceError, ServiceResult, SqliteConsistencyManager,
        TransactionCoordinator,
    };
    pub use crate::state_manager::{TransactionKind, TransactionRegistry, TransactionStep};
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_facade_imports() {
        use crate::prelude::*;
        assert_eq!(TransactionKind::Rent.expected_edge(), SensorEdge::Vacant);
        assert!(CoordinatorSettings::default().max_daily_rentals > 0);
    }
}
