// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Functional tests for cluster formation.
//!
//! These tests drive the real sequencer, credential broker, VIP coordinator
//! and add-on gate against an in-memory cluster. No SSH host, API server
//! or helm binary is needed.
//!
//! ```bash
//! # Run all functional tests
//! cargo test --test functional
//!
//! # Run specific test
//! cargo test --test functional test_end_to_end_three_control_planes_three_workers
//! ```
//!
//! ## Test Categories
//!
//! - **Topology tests**: inventory validation and VIP planning
//! - **Scenario tests**: full runs, re-runs, failures and the add-on gate

mod scenario_tests;
mod topology_tests;
