//! Error taxonomy (§7). Exceptions in the source become a closed sum type
//! with classifier methods instead of a catch-block hierarchy (§9).

use crate::state::IllegalIndexShardStateError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum ErrorKind {
    #[error("illegal shard state: {0}")]
    IllegalIndexShardState(String),

    #[error("already closed")]
    AlreadyClosed,

    #[error("engine closed")]
    EngineClosed,

    #[error("version conflict: expected version {expected}, actual {actual}")]
    VersionConflictEngine { expected: i64, actual: i64 },

    #[error("document failed to parse against the current mapping: {0}")]
    MapperParsing(String),

    #[error("shard not found: {0}")]
    ShardNotFound(String),

    #[error("index not found: {0}")]
    IndexNotFound(String),

    #[error("index shard closed")]
    IndexShardClosed,

    #[error("recovery failed: {0}")]
    RecoveryFailed(String),

    #[error("corrupt index: {0}")]
    CorruptIndex(String),

    #[error("index format too old: {0}")]
    IndexFormatTooOld(String),

    #[error("index format too new: {0}")]
    IndexFormatTooNew(String),

    #[error("circuit breaking: {0}")]
    CircuitBreaking(String),

    #[error("relocation hand-off timed out after {0:?}")]
    RelocationTimeout(std::time::Duration),

    #[error("operation should be retried on the primary: {0}")]
    RetryOnPrimary(String),

    #[error("too old primary term: request term {request_term} < shard term {shard_term}")]
    TooOldPrimaryTerm { request_term: u64, shard_term: u64 },
}

impl From<IllegalIndexShardStateError> for ErrorKind {
    fn from(e: IllegalIndexShardStateError) -> Self {
        ErrorKind::IllegalIndexShardState(e.to_string())
    }
}

impl ErrorKind {
    /// §4.4 retry policy: the primary restores pre-attempt (version,
    /// versionType) on every in-flight sibling and re-routes.
    pub fn is_retryable_on_primary(&self) -> bool {
        matches!(
            self,
            ErrorKind::ShardNotFound(_)
                | ErrorKind::IndexNotFound(_)
                | ErrorKind::IndexShardClosed
                | ErrorKind::EngineClosed
                | ErrorKind::RetryOnPrimary(_)
        )
    }

    /// §4.4 step 6: the benign class of per-replica failures the
    /// coordinator ignores rather than failing the shard.
    pub fn is_benign_on_replica(&self) -> bool {
        matches!(
            self,
            ErrorKind::VersionConflictEngine { .. }
                | ErrorKind::MapperParsing(_)
                | ErrorKind::EngineClosed
                | ErrorKind::IndexShardClosed
        )
    }

    /// §4.5 step 1: a stale primary term is a hard failure, never ignored.
    pub fn is_hard_failure(&self) -> bool {
        matches!(self, ErrorKind::TooOldPrimaryTerm { .. })
    }
}
