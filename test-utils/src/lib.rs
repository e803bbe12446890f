//! Test utilities for the wallet-sync workspace
//!
//! This crate provides deterministic key and account fixtures, transaction
//! builders and assertion macros shared by the workspace's test suites.

pub mod builders;
pub mod fixtures;
pub mod macros;

pub use builders::*;
pub use fixtures::*;
