use crate::conflicts::Conflict;
use thiserror::Error;

/// Everything that can go wrong while validating or running a merge or a split
#[derive(Error, Debug)]
pub enum EngineError {
    /// The request cannot be processed as given. Never queued
    #[error("precondition failed: {0}")]
    Precondition(String),
    /// Identifier collisions on entity types resolved with `fail_on_conflict`
    #[error("{} unresolved conflict(s) on {}", .0.len(), conflicting_types(.0))]
    Conflict(Vec<Conflict>),
    /// An internal invariant is broken: dangling reference, duplicated id, count mismatch
    #[error("integrity violation: {0}")]
    IntegrityViolation(String),
    /// Another task holds a lock on this target
    #[error("{0} is locked by another task, retry later")]
    TargetLocked(String),
    /// Storage or scheduler failure
    #[error("task failure: {0}")]
    Task(String),
    /// The task was cancelled between two phases
    #[error("cancelled")]
    Cancelled,
    #[error(transparent)]
    Gtfs(#[from] gtfs_structures::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;

fn conflicting_types(conflicts: &[Conflict]) -> String {
    let types: std::collections::BTreeSet<_> =
        conflicts.iter().map(|c| c.entity_type.as_str()).collect();
    types.into_iter().collect::<Vec<_>>().join(", ")
}

impl EngineError {
    /// Resubmitting the same request may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::TargetLocked(_) | EngineError::Task(_))
    }
}

impl<T> From<std::sync::PoisonError<T>> for EngineError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        EngineError::Task(format!("poisoned lock: {e}"))
    }
}
