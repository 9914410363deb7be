//! Error types for the configuration store.

use thiserror::Error;

/// Configuration result type.
pub type Result<T> = std::result::Result<T, ConfError>;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfError {
    /// A strict accessor was asked for a key that is not stored
    #[error("Missing key: {0}")]
    MissingKey(String),

    /// The stored value cannot be read as the requested type
    #[error("Invalid value for key {key}: expected {expected}")]
    InvalidValue { key: String, expected: &'static str },

    /// Malformed source text
    #[error("Parse error: {0}")]
    Parse(String),

    /// IO error reading a source
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfError {
    /// Create a missing key error.
    pub fn missing_key(key: impl Into<String>) -> Self {
        Self::MissingKey(key.into())
    }

    /// Create an invalid value error.
    pub fn invalid_value(key: impl Into<String>, expected: &'static str) -> Self {
        Self::InvalidValue {
            key: key.into(),
            expected,
        }
    }
}

impl From<serde_json::Error> for ConfError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

impl From<toml::de::Error> for ConfError {
    fn from(err: toml::de::Error) -> Self {
        Self::Parse(err.to_string())
    }
}
