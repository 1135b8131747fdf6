//! # Shared Errors
//!
//! Validation and decoding failures raised by the value types in this crate.
//! The driver maps these onto its own caller-facing taxonomy.

use thiserror::Error;

/// Result alias for shared type operations.
pub type CkvResult<T> = Result<T, CkvError>;

/// Errors produced while building or decoding shared values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CkvError {
    /// Namespace is empty.
    #[error("namespace must not be empty")]
    NamespaceEmpty,
    /// Namespace exceeds `MAX_NAMESPACE_LEN`.
    #[error("namespace exceeds {max} bytes")]
    NamespaceTooLong { max: usize },
    /// Set name exceeds `MAX_SET_LEN`.
    #[error("set name exceeds {max} bytes")]
    SetTooLong { max: usize },
    /// User key exceeds `MAX_USER_KEY_LEN`.
    #[error("user key exceeds {max} bytes")]
    KeyTooLong { max: usize },
    /// A name contains the field separator byte.
    #[error("key component contains a reserved separator byte")]
    ReservedByte,
    /// Record or metadata payload could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),
}

impl From<serde_json::Error> for CkvError {
    fn from(err: serde_json::Error) -> Self {
        CkvError::Decode(err.to_string())
    }
}
