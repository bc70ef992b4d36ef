//! Error taxonomy for STRATA operations.
//!
//! Adapters must surface structured errors, never raw driver errors. All
//! error types are `Clone` so the coalescer can fan a single failure out
//! to every waiting caller.

use crate::authorization::AuthorizationAction;
use crate::field::FieldValue;
use thiserror::Error;

/// Kind of relational constraint behind a permanent database failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstraintKind {
    Unique,
    ForeignKey,
    Check,
    NotNull,
    Exclusion,
}

/// Structured database adapter errors.
///
/// `Transient` failures may be retried by the caller; constraint
/// violations are permanent; anything the adapter cannot classify is
/// `Unknown`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DatabaseError {
    #[error("Transient database failure: {reason}")]
    Transient { reason: String },

    #[error("Constraint violation ({kind:?}) on {constraint:?}")]
    ConstraintViolation {
        kind: ConstraintKind,
        constraint: Option<String>,
    },

    #[error("Unclassified database error: {reason}")]
    Unknown { reason: String },
}

/// Cache adapter errors.
///
/// Cache failures propagate to the caller; they are never downgraded to
/// a cache miss.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache backend failure: {reason}")]
    Backend { reason: String },

    #[error("Cached entry could not be decoded: {reason}")]
    Codec { reason: String },
}

/// Master error type for data-access operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EntityError {
    #[error("Entity not found in {table} for id {id:?}")]
    NotFound { table: String, id: FieldValue },

    #[error("Viewer not authorized for {action:?} on {table}: {reason}")]
    Unauthorized {
        table: String,
        action: AuthorizationAction,
        reason: String,
    },

    #[error("Invalid value for {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("Failed to construct entity from {table} row: {reason}")]
    Construction { table: String, reason: String },

    #[error("Rejected empty write to {table}")]
    EmptyWrite { table: String },

    #[error("Expected exactly one affected row in {table}, got {actual}")]
    AffectedRowMismatch { table: String, actual: u64 },

    #[error("Transaction error: {reason}")]
    Transaction { reason: String },

    #[error("Internal invariant violated: {reason}")]
    Internal { reason: String },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
}

impl EntityError {
    /// Whether the underlying store reported a retryable condition.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Database(DatabaseError::Transient { .. }))
    }

    /// Whether this is a privacy denial.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized { .. })
    }
}

/// Result type alias for data-access operations.
pub type EntityResult<T> = Result<T, EntityError>;

/// Raise unless exactly one row was affected by a write.
///
/// Updates and deletes that target a missing row report zero affected
/// rows rather than erroring; callers that require exactly one row use
/// this to turn zero (or more than one) into a failure.
pub fn ensure_single_row_affected(table: &str, affected: u64) -> EntityResult<()> {
    if affected == 1 {
        Ok(())
    } else {
        Err(EntityError::AffectedRowMismatch {
            table: table.to_string(),
            actual: affected,
        })
    }
}
