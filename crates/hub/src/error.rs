//! Error taxonomy of the schedule store and job scheduler.

use thiserror::Error;

/// Schedule input rejected before it reaches the store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {reason}")]
pub struct ValidationError {
    pub field: &'static str,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// A stored row that fails its type-specific checks.  The row is skipped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("schedule {id}: {field}: {reason}")]
pub struct MalformedRecord {
    pub id: i64,
    pub field: &'static str,
    pub reason: String,
}

impl MalformedRecord {
    pub fn from_validation(id: i64, e: ValidationError) -> Self {
        Self {
            id,
            field: e.field,
            reason: e.reason,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid schedule: {0}")]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("schedule {0} not found")]
    NotFound(i64),
}
