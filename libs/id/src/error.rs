//! Errors raised while decoding identifiers.

use thiserror::Error;

/// Errors that can occur when decoding a friendly or internal identifier.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The identifier string is empty.
    #[error("identifier cannot be empty")]
    Empty,

    /// The friendly identifier belongs to a different entity kind.
    #[error("invalid identifier prefix: expected '{expected}', got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    /// The friendly identifier has no `_` between prefix and body.
    #[error("identifier missing underscore separator")]
    MissingSeparator,

    /// The ULID body (or a bare internal id) is malformed.
    #[error("invalid ULID: {0}")]
    InvalidUlid(String),
}

impl IdError {
    /// Returns true if the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }

    /// Returns true if the identifier names a different entity kind.
    pub fn is_prefix_error(&self) -> bool {
        matches!(self, IdError::InvalidPrefix { .. })
    }
}
