//! Common test utilities shared across all `sonic-foundation` integration tests.
//!
//! This module is **not** a standalone test binary.  It is declared with
//! `mod common;` inside each integration test file that needs it.

pub mod fixtures;
pub mod harness;
