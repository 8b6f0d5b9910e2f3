//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Deterministic business failures only: retrying a call with identical
/// arguments against identical state fails identically. Storage failures live
/// in the infrastructure crate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Malformed input (zero quantity, negative price, empty reason, currency mismatch).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An operation was attempted from a state that does not allow it.
    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Over-refund, negative stock, or a reservation exceeding what is available.
    #[error("insufficient funds or stock: {0}")]
    InsufficientFundsOrStock(String),

    /// A domain invariant was violated (e.g. command addressed to another aggregate).
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// The aggregate (or an entity inside it) does not exist.
    #[error("not found")]
    NotFound,

    /// The aggregate (or a refund inside it) was already created.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Stale expected version.
    #[error("conflict: {0}")]
    Conflict(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_transition(from: impl core::fmt::Display, to: impl core::fmt::Display) -> Self {
        Self::InvalidStateTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub fn insufficient(msg: impl Into<String>) -> Self {
        Self::InsufficientFundsOrStock(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn already_exists(msg: impl Into<String>) -> Self {
        Self::AlreadyExists(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found() -> Self {
        Self::NotFound
    }

    /// Only version conflicts are worth a reload-and-retry. A duplicate
    /// creation fails the same way every time.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

/// Reject blank free-text arguments (reasons, codes, identifiers).
pub fn require_non_blank(value: &str, field: &str) -> DomainResult<()> {
    if value.trim().is_empty() {
        return Err(DomainError::validation(format!("{field} cannot be empty")));
    }
    Ok(())
}
