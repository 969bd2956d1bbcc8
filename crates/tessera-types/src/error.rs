//! Shared error types for Tessera value types.

use thiserror::Error;

/// Errors raised while parsing or validating value types.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TypesError {
    /// An address string could not be parsed.
    #[error("Invalid address '{address}': {reason}")]
    InvalidAddress {
        /// The rejected input.
        address: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A public key had the wrong length or was not a valid curve point.
    #[error("Invalid public key: {0}")]
    InvalidKey(String),

    /// A signature was malformed or did not verify.
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    /// A configuration value was rejected.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Alias for Result with TypesError.
pub type TypesResult<T> = Result<T, TypesError>;
