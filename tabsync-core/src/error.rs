//! Error types for tabsync operations

use thiserror::Error;

/// JSON encoding errors for persisted values.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Cannot serialize value for key {key}: {reason}")]
    Serialization { key: String, reason: String },

    #[error("Cannot deserialize value for key {key}: {reason}")]
    Deserialization { key: String, reason: String },
}

/// Storage backend errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Read failed for key {key}: {reason}")]
    ReadFailed { key: String, reason: String },

    #[error("Write failed for key {key}: {reason}")]
    WriteFailed { key: String, reason: String },

    #[error("Storage quota exceeded writing key {key}")]
    QuotaExceeded { key: String },

    #[error("Storage backend unavailable: {reason}")]
    Unavailable { reason: String },
}

/// Subscription registry errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error("Unknown subscription id {id}")]
    Unknown { id: u64 },
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Master error type for all tabsync errors.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Subscription error: {0}")]
    Subscription(#[from] SubscriptionError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for tabsync operations.
pub type SyncResult<T> = Result<T, SyncError>;

// =============================================================================
// TESTS
// =============================================================================
