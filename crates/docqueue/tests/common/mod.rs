//! Shared test utilities for docqueue integration tests.
//!
//! This module provides:
//! - `TestHarness` for isolated runs against a file-backed queue
//! - Builders for configs and a scripted engine

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::TestHarness;
