//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic, business/domain failures. Provider
/// outages, storage faults and other infrastructure concerns are modelled in
/// the engine layer, not here.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input). Never persisted.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A domain invariant was violated (money conservation, immutability).
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// An illegal state-machine transition was attempted.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A refund or release exceeds the available balance.
    #[error("insufficient balance: {0}")]
    InsufficientBalance(String),

    /// The target already exists (duplicate escrow, settlement, invoice).
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// A rate rule overlaps an active rule of the same scope.
    #[error("conflicting rule: {0}")]
    ConflictingRule(String),

    /// A conflict occurred (stale version / optimistic concurrency).
    /// Callers are expected to re-read and retry.
    #[error("conflict: {0}")]
    Conflict(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A requested resource was not found (domain-level).
    #[error("not found")]
    NotFound,

    /// The requester is not allowed to perform the operation.
    #[error("unauthorized")]
    Unauthorized,
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn insufficient_balance(msg: impl Into<String>) -> Self {
        Self::InsufficientBalance(msg.into())
    }

    pub fn already_exists(msg: impl Into<String>) -> Self {
        Self::AlreadyExists(msg.into())
    }

    pub fn conflicting_rule(msg: impl Into<String>) -> Self {
        Self::ConflictingRule(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn not_found() -> Self {
        Self::NotFound
    }
}
