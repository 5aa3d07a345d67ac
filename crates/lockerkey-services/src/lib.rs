// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

/*!
# Lockerkey Service Layer

The transaction core: correlates a member's rent/return intent with the
asynchronous sensor edge that confirms it, and keeps the member pointer,
the locker row, and the rental ledger consistent.

## Architecture

```text
┌─────────────────────────────────────────────────────────────────┐
│                    TRANSPORT ADAPTERS                           │
│  Kiosk HTTP, bench tools, tests                                 │
└────────────────────────────┬────────────────────────────────────┘
                             ↓
┌─────────────────────────────────────────────────────────────────┐
│              SERVICE LAYER (This Crate)                         │
│  • LockerService          - rent / return / status / cancel     │
│  • TransactionCoordinator - the state machine                   │
│  • ConsistencyManager     - atomic commit + reconciliation      │
│  • OutcomePublisher       - structured outcome fan-out          │
└────────────────────────────┬────────────────────────────────────┘
                             ↓
┌─────────────────────────────────────────────────────────────────┐
│                   INFRASTRUCTURE                                │
│  lockerkey-state-manager (registry), lockerkey-hal (sensors)    │
└─────────────────────────────────────────────────────────────────┘
```

## Usage

```rust,no_run
use std::sync::Arc;
use lockerkey_hal::{HardwareEventIngestor, SensorAddressResolver, SystemClock};
use lockerkey_services::{
    CoordinatorSettings, LockerService, LockerServiceImpl, OutcomePublisher,
    SqliteConsistencyManager, TransactionCoordinator,
};
use lockerkey_state_manager::TransactionRegistry;

# async fn run() -> Result<(), Box<dyn std::error::Error>> {
let config = lockerkey_config::LockerkeyConfig::default();
let clock = Arc::new(SystemClock);
let store = Arc::new(SqliteConsistencyManager::open("./data/lockerkey.db")?);
store.seed_lockers(&config.locker_table(), chrono::Utc::now())?;

let coordinator = Arc::new(TransactionCoordinator::new(
    Arc::new(TransactionRegistry::new(config.transactions.outcome_retention)),
    store.clone(),
    clock.clone(),
    OutcomePublisher::default(),
    CoordinatorSettings::from_config(&config.transactions),
));
let ingestor = Arc::new(HardwareEventIngestor::new(
    Arc::new(SensorAddressResolver::from_config(&config)?),
    coordinator.clone(),
    clock,
    config.sensors.debounce_window_ms,
    config.sensors.max_line_bytes,
));

let service = LockerServiceImpl::new(coordinator, store, ingestor);
let ticket = service.rent("M1", "M05").await?;
println!("{} is {}", ticket.transaction_id, ticket.step);
# Ok(())
# }
```
*/

/// Crate version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod impls;
pub mod traits;
pub mod types;

pub use impls::*;
pub use traits::*;
pub use types::*;
