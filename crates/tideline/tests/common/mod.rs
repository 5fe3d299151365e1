//! Shared test utilities for tideline integration tests.
//!
//! - `TestHarness` wires a reconciler to an in-memory source and cluster
//! - Builders create Applications and charts without YAML boilerplate

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::TestHarness;
