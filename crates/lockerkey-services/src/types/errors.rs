// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

/*!
Service layer error types.

Three tiers:
- [`Rejection`]: a precondition failed; routine, synchronous, retryable.
- [`LedgerError`]: the persistent store failed or refused a write.
- [`ServiceError`]: transport-agnostic errors returned by the boundary API.
*/

use lockerkey_state_manager::StateError;
use thiserror::Error;

use crate::types::models::MemberStatus;

/// Why a rent/return request was refused before any hardware wait
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    #[error("locker {locker_number} already has a transaction in flight")]
    LockerBusy { locker_number: String },

    #[error("member {member_id} already has a transaction in flight")]
    MemberBusy { member_id: String },

    #[error("member {member_id} not found")]
    MemberNotFound { member_id: String },

    #[error("member {member_id} is {status}")]
    MemberInactive {
        member_id: String,
        status: MemberStatus,
    },

    #[error("membership of {member_id} expired on {expired_on}")]
    MembershipExpired {
        member_id: String,
        expired_on: chrono::NaiveDate,
    },

    #[error("member {member_id} is already renting locker {locker_number}")]
    AlreadyRenting {
        member_id: String,
        locker_number: String,
    },

    #[error("member {member_id} has no locker to return")]
    NotRenting { member_id: String },

    #[error("member {member_id} rents {renting}, not {requested}")]
    WrongLocker {
        member_id: String,
        renting: String,
        requested: String,
    },

    #[error("member {member_id} reached the daily limit ({count}/{limit})")]
    DailyLimitReached {
        member_id: String,
        count: u32,
        limit: u32,
    },

    #[error("locker {locker_number} not found")]
    LockerNotFound { locker_number: String },

    #[error("locker {locker_number} is out of service")]
    LockerOutOfService { locker_number: String },

    #[error("locker {locker_number} is occupied")]
    LockerOccupied { locker_number: String },

    #[error("member {member_id} may not use zone {zone}")]
    ZoneNotPermitted { member_id: String, zone: String },
}

/// Persistent store failures
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum LedgerError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A guarded write matched the wrong number of rows; nothing was applied
    #[error("commit conflict on {table}: {detail}")]
    CommitConflict { table: &'static str, detail: String },

    #[error("rental {rental_id} is not pending")]
    RentalNotPending { rental_id: i64 },

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("stored value '{value}' is not a valid {kind}")]
    InvalidStoredValue { kind: &'static str, value: String },

    #[error("records inconsistent: {0}")]
    Inconsistent(String),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// `BeginTransaction` failure
#[derive(Error, Debug)]
pub enum BeginError {
    #[error("rejected: {0}")]
    Rejected(#[from] Rejection),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("state error: {0}")]
    State(StateError),
}

/// Service layer errors (transport-agnostic)
#[derive(Error, Debug, Clone)]
pub enum ServiceError {
    /// Resource not found (404 in HTTP)
    #[error("Not found: {resource} with id '{id}'")]
    NotFound { resource: String, id: String },

    /// Precondition failed (409 in HTTP)
    #[error("Rejected: {0}")]
    Rejected(Rejection),

    /// Invalid input parameters (400 in HTTP)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Invalid state for operation (e.g., cancelling after sensor confirmation)
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Persistent store failure (500 in HTTP)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Internal service error (500 in HTTP)
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;

// ============================================================================
// ERROR CONVERSIONS
// ============================================================================

impl From<Rejection> for ServiceError {
    fn from(rejection: Rejection) -> Self {
        ServiceError::Rejected(rejection)
    }
}

impl From<LedgerError> for ServiceError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::NotFound { kind, id } => ServiceError::NotFound {
                resource: kind.to_string(),
                id,
            },
            other => ServiceError::Storage(other.to_string()),
        }
    }
}

impl From<BeginError> for ServiceError {
    fn from(err: BeginError) -> Self {
        match err {
            BeginError::Rejected(rejection) => ServiceError::Rejected(rejection),
            BeginError::Ledger(ledger) => ledger.into(),
            BeginError::State(state) => state.into(),
        }
    }
}

impl From<StateError> for ServiceError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::TransactionNotFound(id) => ServiceError::NotFound {
                resource: "Transaction".to_string(),
                id,
            },
            StateError::LockerBusy { locker_number, .. } => {
                ServiceError::Rejected(Rejection::LockerBusy { locker_number })
            }
            StateError::MemberBusy { member_id, .. } => {
                ServiceError::Rejected(Rejection::MemberBusy { member_id })
            }
            other @ StateError::InvalidTransition { .. } => {
                ServiceError::InvalidState(other.to_string())
            }
        }
    }
}

impl From<lockerkey_hal::ResolveError> for ServiceError {
    fn from(err: lockerkey_hal::ResolveError) -> Self {
        match err {
            lockerkey_hal::ResolveError::NotMapped { sensor_number } => ServiceError::NotFound {
                resource: "Sensor".to_string(),
                id: sensor_number.to_string(),
            },
            other => ServiceError::InvalidInput(other.to_string()),
        }
    }
}
