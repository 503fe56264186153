pub mod app;
pub mod backend;
pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod search;
pub mod storage;
#[cfg(test)]
pub mod test_utils;
pub mod tui;
pub mod ui;
pub mod views;

pub use error::{FerretError, Result};

/// Package version from Cargo.toml.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
