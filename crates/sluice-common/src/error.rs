//! Common error types for sluice binaries and glue code.

use thiserror::Error;

/// Result type alias using the shared error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while setting a receiver up.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (config file, socket)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed JSON
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Unusable key material
    #[error("crypto error: {0}")]
    Crypto(String),
}

impl Error {
    /// Create a crypto error from any displayable type.
    pub fn crypto(msg: impl std::fmt::Display) -> Self {
        Self::Crypto(msg.to_string())
    }
}
