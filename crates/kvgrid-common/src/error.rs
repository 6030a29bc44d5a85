//! Error types for KVGrid
//!
//! This module defines the common error type used throughout the control
//! plane. Variants fall into four classes: transient I/O against the
//! document store or value backend, data integrity, authorization, and
//! conflicts. Callers pick their handling by class, not by variant.

use thiserror::Error;

/// Common result type for KVGrid operations
pub type Result<T> = std::result::Result<T, Error>;

/// Typed failure codes from the value backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueErrorCode {
    /// The key does not exist in the storage
    KeyNotFound,
    /// The backend answered with an unexpected status
    OperationFailed,
}

/// Common error type for KVGrid
#[derive(Debug, Error)]
pub enum Error {
    // Transient store I/O
    #[error("document store unreachable: {0}")]
    StoreUnavailable(String),

    #[error("document store request timed out")]
    StoreTimeout,

    #[error("store operation failed: {op}")]
    RequestFailed { op: &'static str },

    // Data integrity
    #[error("corrupt storage record {id}: missing {field}")]
    CorruptRecord { id: String, field: &'static str },

    // Domain lookups
    #[error("storage not found: {0}")]
    StorageNotFound(String),

    #[error("storage already exists: {0}")]
    StorageAlreadyExists(String),

    // Authorization
    #[error("access denied to storage {0}")]
    AccessDenied(String),

    // Cursor handling
    #[error("scroll cursor expired or unknown")]
    CursorExpired,

    // Value backend
    #[error("value backend error: {0:?}")]
    ValueBackend(ValueErrorCode),

    // Caller input
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // Internal
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Check if this is a transient I/O failure that a later retry may clear
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable(_)
                | Self::StoreTimeout
                | Self::RequestFailed { .. }
                | Self::ValueBackend(ValueErrorCode::OperationFailed)
        )
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::StorageNotFound(_) | Self::ValueBackend(ValueErrorCode::KeyNotFound)
        )
    }

    /// Stable machine-readable code surfaced through the management API
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::StoreUnavailable(_) | Self::StoreTimeout | Self::RequestFailed { .. } => {
                "OperationFailed"
            }
            Self::CorruptRecord { .. } => "CorruptRecord",
            Self::StorageNotFound(_) => "StorageNotFound",
            Self::StorageAlreadyExists(_) => "StorageAlreadyExists",
            Self::AccessDenied(_) => "AccessDenied",
            Self::CursorExpired => "CursorExpired",
            Self::ValueBackend(ValueErrorCode::KeyNotFound) => "KeyNotFound",
            Self::ValueBackend(ValueErrorCode::OperationFailed) => "ValueOperationFailed",
            Self::InvalidArgument(_) => "InvalidArgument",
            Self::Serialization(_) => "SerializationError",
            Self::Configuration(_) => "ConfigurationError",
        }
    }
}
