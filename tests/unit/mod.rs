// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Unit tests for the PostgreSQL access operator
//!
//! This module contains unit tests for:
//! - Desired-state resolution and validation
//! - The diff engine
//! - Full reconciliation cycles against an in-memory PostgreSQL
//! - Teardown and deletion ordering
//! - Credential management
//! - Status management
//! - State machine transitions

#[path = "../common/mod.rs"]
mod common;

mod resolve;
mod state_machine;
mod status;
