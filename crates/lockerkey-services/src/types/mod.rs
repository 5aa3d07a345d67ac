// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

/*!
Domain records, transport-agnostic DTOs, and error types.
*/

pub mod dtos;
pub mod errors;
pub mod models;

pub use dtos::*;
pub use errors::*;
pub use models::*;
