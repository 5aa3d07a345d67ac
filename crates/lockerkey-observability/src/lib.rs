// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! # lockerkey-observability
//!
//! Logging setup shared by every lockerkey binary: console output, per-crate
//! JSON log files with retention, and per-crate debug flags.

/// Crate version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod cli;
pub mod init;

pub use cli::*;
pub use init::*;

/// Tracing target carrying structured transaction audit records
pub const AUDIT_TARGET: &str = "lockerkey-audit";

/// Known lockerkey log targets for debug flags
pub const KNOWN_CRATES: &[&str] = &[
    "lockerkey-config",
    "lockerkey-hal",
    "lockerkey-state-manager",
    "lockerkey-services",
    "lockerkey-audit",
    "lockerkeyd",
];
