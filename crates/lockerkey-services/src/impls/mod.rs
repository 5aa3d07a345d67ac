// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

/*!
Service implementations.
*/

pub mod coordinator;
pub mod locker_service_impl;
pub mod maintenance;
pub mod outcomes;
pub mod sqlite_store;

pub use coordinator::{CoordinatorSettings, TransactionCoordinator};
pub use locker_service_impl::LockerServiceImpl;
pub use maintenance::{spawn_reconciler, spawn_timeout_sweeper};
pub use outcomes::{spawn_audit_logger, OutcomePublisher};
pub use sqlite_store::SqliteConsistencyManager;
