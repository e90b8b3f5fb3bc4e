use std::time::Duration;
use thiserror::Error;

use crate::entity::EntityType;

/// Errors surfaced by the deduplication engine.
///
/// Relationship conflicts during a merge are not errors; they are resolved
/// by deleting the duplicate's row and reported as a merge action.
#[derive(Debug, Error)]
pub enum DedupError {
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("oracle error: {0}")]
    Oracle(String),

    #[error("oracle call timed out after {0:?}")]
    OracleTimeout(Duration),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("{entity_type} {id} not found")]
    EntityNotFound { entity_type: EntityType, id: i64 },

    #[error("{entity_type} {duplicate_id} was merged and committed but not audited: {reason}")]
    AuditMissing {
        entity_type: EntityType,
        duplicate_id: i64,
        reason: String,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl DedupError {
    /// Errors that make the whole run pointless to continue.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DedupError::Configuration(_))
    }
}

pub type Result<T, E = DedupError> = std::result::Result<T, E>;
