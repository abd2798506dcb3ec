//! Error types for the refinery

use serde::Serialize;
use thiserror::Error;

/// Diagnostic detail attached to a failed storage or search call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageDiagnostics {
    /// Storage operation that failed (e.g. "get_memory")
    pub operation: String,
    /// Backend status code, when the backend reports one
    pub status_code: Option<u16>,
    /// Wall time spent before the failure
    pub duration_ms: u64,
    /// Retries attempted before giving up
    pub retries: u32,
}

impl StorageDiagnostics {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            status_code: None,
            duration_ms: 0,
            retries: 0,
        }
    }

    pub fn with_status(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }

    pub fn with_timing(mut self, duration_ms: u64, retries: u32) -> Self {
        self.duration_ms = duration_ms;
        self.retries = retries;
        self
    }
}

impl std::fmt::Display for StorageDiagnostics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "op={}", self.operation)?;
        if let Some(code) = self.status_code {
            write!(f, " status={code}")?;
        }
        write!(f, " took={}ms retries={}", self.duration_ms, self.retries)
    }
}

/// Main error type for the refinery
#[derive(Error, Debug)]
pub enum MemoryError {
    /// Database operation failed
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Storage/search backend failure carrying diagnostics
    #[error("Search error: {message} ({diagnostics})")]
    Search {
        message: String,
        diagnostics: StorageDiagnostics,
    },

    /// Memory not found
    #[error("Memory not found: {0}")]
    NotFound(String),

    /// Invalid operation
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other errors
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl MemoryError {
    /// Structured diagnostics, if the failing backend attached any
    pub fn diagnostics(&self) -> Option<&StorageDiagnostics> {
        match self {
            MemoryError::Search { diagnostics, .. } => Some(diagnostics),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for MemoryError {
    fn from(err: serde_json::Error) -> Self {
        MemoryError::Serialization(err.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, MemoryError>;
