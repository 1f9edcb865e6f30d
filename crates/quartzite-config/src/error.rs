//! Error types for parameter handling.

use thiserror::Error;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum Error {
    /// Key is not registered in the schema.
    #[error("unknown parameter: {0}")]
    UnknownKey(String),

    /// Value failed per-key validation.
    #[error("invalid value '{value}' for parameter {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    /// Key may only be set at construction time.
    #[error("parameter {0} cannot be changed at runtime")]
    NotSettable(String),

    /// Malformed ISO-8601 duration.
    #[error("invalid ISO-8601 duration: {0}")]
    BadDuration(String),

    /// IO error while reading a configuration file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML deserialization error.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Result type for configuration operations.
pub type Result<T> = std::result::Result<T, Error>;
