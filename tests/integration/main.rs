// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Integration tests for postgres-access-operator
//!
//! These tests require a reachable PostgreSQL server and a superuser account,
//! configured through the same environment variables as the operator
//! (`PGHOST`, `PGPORT`, `PGUSER`, `PGPASSWORD`, `PGSSLMODE`, ...).
//! Tests are marked with #[ignore] and must be run explicitly:
//!
//! ```bash
//! PGHOST=localhost PGPASSWORD=postgres \
//!     cargo test --test integration -- --ignored --test-threads=1
//! ```
//!
//! Every test works on uniquely named roles and databases and drops them when
//! it finishes.

#[path = "../common/mod.rs"]
mod common;

mod access_tests;

pub use postgres::*;
