//! Core error types for phaseclock-core.
//!
//! Errors are split by concern (storage, configuration, validation, control)
//! and folded into [`CoreError`] at the crate boundary. Runtime degradations
//! the engine is expected to survive (a failed store write, an unplayable
//! tone, a corrupt payload) are logged and swallowed instead of surfacing here.

use std::path::PathBuf;
use thiserror::Error;

use crate::timer::SessionStatus;

/// Core error type for phaseclock-core.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Key-value store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// A controller command was rejected
    #[error("Control error: {0}")]
    Control(#[from] ControlError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic errors with context
    #[error("{0}")]
    Custom(String),
}

/// Key-value store errors.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Failed to open the backing database
    #[error("Failed to open store at {path}: {source}")]
    OpenFailed {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// Query execution failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Database is locked by another writer
    #[error("Store is locked")]
    Locked,

    /// Write rejected because the store is full
    #[error("Quota exceeded writing '{key}' (limit: {limit} bytes)")]
    QuotaExceeded { key: String, limit: usize },

    /// Internal lock was poisoned by a panicking holder
    #[error("Store state poisoned: {0}")]
    Poisoned(&'static str),
}

/// Configuration-specific errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to load configuration
    #[error("Failed to load configuration from {path}: {message}")]
    LoadFailed { path: PathBuf, message: String },

    /// Failed to save configuration
    #[error("Failed to save configuration to {path}: {message}")]
    SaveFailed { path: PathBuf, message: String },

    /// Invalid configuration value
    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    /// Unknown dot-path key
    #[error("Unknown configuration key: {0}")]
    UnknownKey(String),

    /// Failed to parse configuration
    #[error("Failed to parse configuration: {0}")]
    ParseFailed(String),
}

/// Validation errors for session definitions and runtime payloads.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// A session needs at least one phase to run
    #[error("Session '{0}' has no phases")]
    EmptySession(String),

    /// Phase ids must be unique within a session
    #[error("Duplicate phase id '{0}'")]
    DuplicatePhaseId(String),

    /// Alternating branching needs a block of speaking/transition phases
    #[error("Alternating branching requires a contiguous block of speaking/transition phases")]
    MissingAlternatingCycle,

    /// Runtime state belongs to a different session
    #[error("State belongs to session '{found}', expected '{expected}'")]
    SessionMismatch { expected: String, found: String },

    /// Out of bounds
    #[error("Index {index} out of bounds for {collection} (length: {len})")]
    OutOfBounds {
        collection: String,
        index: usize,
        len: usize,
    },

    /// Invalid value
    #[error("Invalid value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

/// Rejected controller commands.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    /// The command is not valid from the current status
    #[error("Cannot {action} a session that is {status}")]
    InvalidTransition {
        action: &'static str,
        status: SessionStatus,
    },
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, _msg) => match code.code {
                rusqlite::ErrorCode::DatabaseLocked | rusqlite::ErrorCode::DatabaseBusy => {
                    StoreError::Locked
                }
                _ => StoreError::QueryFailed(err.to_string()),
            },
            _ => StoreError::QueryFailed(err.to_string()),
        }
    }
}

/// Result type alias for CoreError
pub type Result<T, E = CoreError> = std::result::Result<T, E>;
