use thiserror::Error;

/// Store-related errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("relationship not found: {0}")]
    NotFound(String),

    /// An active relationship for the same (initiator, responder,
    /// continuation) triple already exists.
    #[error("duplicate relationship: {0}")]
    Duplicate(String),

    /// The supplied chain head no longer matches; the caller must re-read
    /// and retry.
    #[error("chain head conflict on relationship {0}")]
    ChainConflict(String),

    /// Append refused because the relationship is closed.
    #[error("relationship {0} is closed")]
    Closed(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;
