//! Error types for artifact index operations

use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Argument validation errors. Never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Constraint violation on {constraint}: {reason}")]
    ConstraintViolation { constraint: String, reason: String },
}

/// Storage layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Artifact not found: {uuid}")]
    NotFound { uuid: Uuid },

    #[error("Artifact already indexed: {uuid}")]
    AlreadyExists { uuid: Uuid },

    #[error("Persistence failed: {reason}")]
    PersistenceFailed { reason: String },

    #[error("Database error during {operation}: {reason}")]
    Database { operation: String, reason: String },

    #[error("Gave up on {operation} after {attempts} attempts: {reason}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        reason: String,
    },

    #[error("Corrupt record {key}: {reason}")]
    CorruptRecord { key: String, reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Index lifecycle and readiness errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("Index not ready (state: {state})")]
    NotReady { state: String },

    #[error("Index did not become ready within {waited:?}")]
    Timeout { waited: Duration },

    #[error("Index was stopped")]
    Stopped,

    #[error("Invalid lifecycle transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("No artifact data store registered")]
    DataStoreUnavailable,

    #[error("Schema version mismatch: expected {expected}, found {found:?}")]
    SchemaMismatch { expected: i32, found: Option<i32> },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all index errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IndexError {
    #[error("Invalid argument: {0}")]
    Validation(#[from] ValidationError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl IndexError {
    /// True for caller mistakes that retrying cannot fix.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, IndexError::Validation(_))
    }

    /// True for `update_storage_url` on an unknown or deleted artifact.
    pub fn is_not_found(&self) -> bool {
        matches!(self, IndexError::Storage(StorageError::NotFound { .. }))
    }
}

/// Result type alias for index operations.
pub type IndexResult<T> = Result<T, IndexError>;

// =============================================================================
// TESTS
// =============================================================================
