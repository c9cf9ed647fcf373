//! Shared harness for the end-to-end pipeline tests.

pub mod fixtures;
pub mod mocks;
pub mod setup;
