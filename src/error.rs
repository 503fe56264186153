use std::io;

use thiserror::Error;

/// Main error type for ferret operations.
#[derive(Error, Debug)]
pub enum FerretError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Query parse error: {0}")]
    QueryParse(String),

    #[error("Backend error ({backend}): {reason}")]
    Backend { backend: String, reason: String },

    #[error("Config error: {0}")]
    Config(String),

    #[error("Missing required config: {0}")]
    MissingConfig(String),

    #[error("Transaction failed: {0}")]
    TransactionFailed(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Import error: {0}")]
    Import(String),
}

/// How a failure affects a running search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// One pipeline stage failed; the rest of the pipeline continues.
    DegradedStage,
    /// Synchronous stages cannot run at all; the UI returns to browsing.
    FatalSession,
    /// Persistence failure, propagated to the caller.
    Storage,
    /// Bad configuration; reported at startup.
    Config,
}

impl FerretError {
    pub fn backend(backend: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Backend {
            backend: backend.into(),
            reason: reason.into(),
        }
    }

    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Database(_) | Self::Io(_) | Self::TransactionFailed(_) | Self::NotFound(_) => {
                ErrorClass::Storage
            }
            Self::Config(_) | Self::MissingConfig(_) => ErrorClass::Config,
            Self::Http(_)
            | Self::Backend { .. }
            | Self::Timeout(_)
            | Self::Cancelled(_)
            | Self::QueryParse(_)
            | Self::Json(_)
            | Self::Serialization(_)
            | Self::Import(_) => ErrorClass::DegradedStage,
        }
    }

    /// Whether the failure only degrades a single stage.
    #[must_use]
    pub const fn is_degraded(&self) -> bool {
        matches!(self.class(), ErrorClass::DegradedStage)
    }
}

pub type Result<T> = std::result::Result<T, FerretError>;
