// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

/*!
Service trait definitions.

`ConsistencyManager` is the seam between the coordinator and storage;
`LockerService` is the boundary consumed by transport adapters.
*/

pub mod consistency_manager;
pub mod locker_service;

pub use consistency_manager::ConsistencyManager;
pub use locker_service::LockerService;
