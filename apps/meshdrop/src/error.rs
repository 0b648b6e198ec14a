//! Error types for the dead drop core.
//!
//! Every failure maps to a stable machine-readable code so an outer API
//! layer can translate errors without matching on message text.

use thiserror::Error;

/// Core error type with structured error codes.
#[derive(Error, Debug)]
pub enum DropError {
    // Secret sharing errors
    #[error("Invalid threshold: k={threshold} must satisfy 2 <= k <= n={total}")]
    InvalidThreshold { threshold: usize, total: usize },

    #[error("Secret is empty")]
    EmptySecret,

    #[error("Secret too large: value must be below the field modulus ({len} bytes supplied)")]
    SecretTooLarge { len: usize },

    #[error("Reconstructed secret does not match the recorded hash")]
    HashMismatch,

    #[error("Insufficient shares: need {needed}, have {have}")]
    InsufficientShares { needed: usize, have: usize },

    #[error("Invalid share: {0}")]
    InvalidShare(String),

    // Crypto errors
    #[error("Authentication failed: {0}")]
    AuthenticationError(String),

    #[error("Location mismatch: expected cell {expected}, got {actual}")]
    LocationMismatch { expected: String, actual: String },

    #[error("Not yet valid: opens at unix time {not_before}")]
    NotYetValid { not_before: u64 },

    #[error("Expired: {0}")]
    Expired(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    // Location verification errors
    #[error("Spoofing detected: {0}")]
    SpoofingDetected(String),

    #[error("Insufficient beacons: need {needed}, saw {seen}")]
    InsufficientBeacons { needed: usize, seen: usize },

    #[error("Location verification failed: {0}")]
    VerificationFailed(String),

    // Distribution errors
    #[error("Insufficient fragments: need {needed}, have {have}")]
    InsufficientFragments { needed: usize, have: usize },

    #[error("Node {node_id} is at capacity ({capacity})")]
    CapacityExceeded { node_id: String, capacity: u32 },

    #[error("Transfer to node {node_id} failed: {reason}")]
    TransferFailed { node_id: String, reason: String },

    #[error("Dead drop not found: {0}")]
    DropNotFound(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Invalid dead drop state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    // Input validation errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DropError {
    /// Get the error code for structured error reporting.
    pub fn error_code(&self) -> Option<&'static str> {
        match self {
            Self::InvalidThreshold { .. } => Some("INVALID_THRESHOLD"),
            Self::EmptySecret => Some("EMPTY_SECRET"),
            Self::SecretTooLarge { .. } => Some("SECRET_TOO_LARGE"),
            Self::HashMismatch => Some("HASH_MISMATCH"),
            Self::InsufficientShares { .. } => Some("INSUFFICIENT_SHARES"),
            Self::InvalidShare(_) => Some("INVALID_SHARE"),
            Self::AuthenticationError(_) => Some("AUTHENTICATION_ERROR"),
            Self::LocationMismatch { .. } => Some("LOCATION_MISMATCH"),
            Self::NotYetValid { .. } => Some("NOT_YET_VALID"),
            Self::Expired(_) => Some("EXPIRED"),
            Self::InvalidPayload(_) => Some("INVALID_PAYLOAD"),
            Self::SpoofingDetected(_) => Some("SPOOFING_DETECTED"),
            Self::InsufficientBeacons { .. } => Some("INSUFFICIENT_BEACONS"),
            Self::VerificationFailed(_) => Some("VERIFICATION_FAILED"),
            Self::InsufficientFragments { .. } => Some("INSUFFICIENT_FRAGMENTS"),
            Self::CapacityExceeded { .. } => Some("CAPACITY_EXCEEDED"),
            Self::TransferFailed { .. } => Some("TRANSFER_FAILED"),
            Self::DropNotFound(_) => Some("DROP_NOT_FOUND"),
            Self::NodeNotFound(_) => Some("NODE_NOT_FOUND"),
            Self::InvalidState { .. } => Some("INVALID_STATE"),
            Self::InvalidInput(_) => Some("INVALID_INPUT"),
            Self::Storage(_) => Some("STORAGE_ERROR"),
            Self::Serialization(_) => Some("SERIALIZATION_ERROR"),
            Self::Deserialization(_) => Some("DESERIALIZATION_ERROR"),
            Self::Internal(_) => None, // Don't expose internal error codes
        }
    }

    /// Precondition violations that the caller must fix. Never retried.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidThreshold { .. }
                | Self::EmptySecret
                | Self::SecretTooLarge { .. }
                | Self::InsufficientShares { .. }
                | Self::InvalidShare(_)
                | Self::InvalidPayload(_)
                | Self::InvalidInput(_)
                | Self::DropNotFound(_)
                | Self::NodeNotFound(_)
        )
    }
}

// Conversion from common error types

impl From<std::io::Error> for DropError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for DropError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            Self::Deserialization(err.to_string())
        } else {
            Self::Serialization(err.to_string())
        }
    }
}

impl From<redb::Error> for DropError {
    fn from(err: redb::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<redb::DatabaseError> for DropError {
    fn from(err: redb::DatabaseError) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<redb::TableError> for DropError {
    fn from(err: redb::TableError) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<redb::TransactionError> for DropError {
    fn from(err: redb::TransactionError) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<redb::CommitError> for DropError {
    fn from(err: redb::CommitError) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<redb::StorageError> for DropError {
    fn from(err: redb::StorageError) -> Self {
        Self::Storage(err.to_string())
    }
}

/// Result type alias for dead drop operations.
pub type DropResult<T> = Result<T, DropError>;
