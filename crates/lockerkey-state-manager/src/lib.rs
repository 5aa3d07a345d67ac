// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! # Lockerkey State Manager
//!
//! Ephemeral state for rental/return transactions that are waiting on
//! hardware confirmation.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │   Transaction Registry              │  ← one Mutex over three indexes
//! │     by_id / by_locker / by_member   │
//! └─────────────────────────────────────┘
//!           ↓ deregistration
//! ┌─────────────────────────────────────┐
//! │   Recent Outcomes (bounded)         │  ← status polls after resolution
//! └─────────────────────────────────────┘
//! ```
//!
//! Nothing here touches storage. Callers read and write persistent records
//! outside the registry lock, after atomically claiming a transaction.
//!
//! ## Usage
//!
//! ```rust
//! use chrono::{Duration, Utc};
//! use lockerkey_hal::SensorEdge;
//! use lockerkey_state_manager::{ClaimOutcome, TransactionKind, TransactionRegistry, TransactionStep};
//!
//! let registry = TransactionRegistry::new(64);
//! let now = Utc::now();
//! let tx = registry.try_register(TransactionKind::Rent, "M1", "A05", now)?;
//! registry.arm(&tx.transaction_id, now + Duration::seconds(30), Some(1))?;
//!
//! match registry.claim_for_event("A05", SensorEdge::Vacant, now) {
//!     ClaimOutcome::Claimed(claimed) => {
//!         // commit persistent records here, then:
//!         registry.finish(&claimed.transaction_id, TransactionStep::Completed)?;
//!     }
//!     _ => unreachable!(),
//! }
//! # Ok::<(), lockerkey_state_manager::StateError>(())
//! ```

// Module structure
pub mod registry;     // Active-transaction registry
pub mod transaction;  // Transaction model and step machine

pub use registry::{ClaimOutcome, TransactionRegistry};
pub use transaction::{ActiveTransaction, TransactionKind, TransactionStep};

/// State management errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    /// Another transaction holds the locker
    LockerBusy {
        locker_number: String,
        transaction_id: String,
    },
    /// Another transaction holds the member
    MemberBusy {
        member_id: String,
        transaction_id: String,
    },
    TransactionNotFound(String),
    InvalidTransition {
        transaction_id: String,
        from: TransactionStep,
        to: TransactionStep,
    },
}

impl std::fmt::Display for StateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateError::LockerBusy {
                locker_number,
                transaction_id,
            } => write!(
                f,
                "Locker {} is held by transaction {}",
                locker_number, transaction_id
            ),
            StateError::MemberBusy {
                member_id,
                transaction_id,
            } => write!(
                f,
                "Member {} is held by transaction {}",
                member_id, transaction_id
            ),
            StateError::TransactionNotFound(id) => write!(f, "Transaction not found: {}", id),
            StateError::InvalidTransition {
                transaction_id,
                from,
                to,
            } => write!(
                f,
                "Invalid transition for {}: {} -> {}",
                transaction_id, from, to
            ),
        }
    }
}

impl std::error::Error for StateError {}

pub type Result<T> = std::result::Result<T, StateError>;
