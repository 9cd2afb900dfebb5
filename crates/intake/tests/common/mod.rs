//! Shared fixtures for the scheduler integration tests.

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::{BrokenPreprocessor, Step, TestHarness};
