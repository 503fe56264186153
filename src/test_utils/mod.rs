//! Shared test utilities for ferret.

pub mod fixtures;
pub mod logging;
