//! The `SegmentEngine` port (§4.3): the opaque segment/inverted-index store
//! the shard drives but does not implement. `shard-engine` provides one
//! concrete adapter; callers may substitute their own.

use crate::ids::{SeqNo, TranslogLocation};
use crate::operation::{Operation, OperationFailure, ResultKind};
use std::sync::Arc;

/// Selects how `SegmentEngine::open` should treat on-disk state (§4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Reuse an existing index and an existing translog.
    OpenIndexAndTranslog,
    /// Nothing exists on disk yet; create both fresh.
    CreateIndexAndTranslog,
    /// A snapshot restored fresh index files; start a fresh translog and
    /// skip replay.
    OpenIndexCreateTranslog,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub open_mode: OpenMode,
    pub enable_gc_deletes: bool,
}

/// Identifies a durable commit produced by `flush`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommitId(pub String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncFlushOutcome {
    Committed,
    PendingOperations,
    OutOfSync,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct IndexResult {
    pub seq_no: SeqNo,
    pub version: i64,
    pub translog_location: TranslogLocation,
    pub is_created: bool,
}

#[derive(Debug, Clone)]
pub struct DeleteResult {
    pub seq_no: SeqNo,
    pub version: i64,
    pub translog_location: TranslogLocation,
    pub is_found: bool,
}

pub type EngineOpResult<T> = Result<T, OperationFailure>;

impl From<IndexResult> for crate::operation::OperationSuccess {
    fn from(r: IndexResult) -> Self {
        crate::operation::OperationSuccess {
            seq_no: r.seq_no,
            version: r.version,
            translog_location: r.translog_location,
            result: if r.is_created { ResultKind::Created } else { ResultKind::Updated },
        }
    }
}

impl From<DeleteResult> for crate::operation::OperationSuccess {
    fn from(r: DeleteResult) -> Self {
        crate::operation::OperationSuccess {
            seq_no: r.seq_no,
            version: r.version,
            translog_location: r.translog_location,
            result: if r.is_found { ResultKind::Deleted } else { ResultKind::NotFound },
        }
    }
}

/// A scoped read snapshot. Resources behind it are released on drop (§5).
pub trait Searcher: Send {
    fn doc_count(&self) -> usize;
}

/// A scoped hold on a commit, kept alive for a snapshot upload.
pub trait Commit: Send {
    fn id(&self) -> &CommitId;
}

/// Invoked by the engine when it fails unrecoverably; the shard wires this
/// to its shard-failure callback (§4.3, §9 — avoid a strong engine→shard
/// cycle by handing the engine a narrow closure rather than a shard handle).
pub trait EventListener: Send + Sync {
    fn on_failed_engine(&self, reason: &str, cause: &str);
}

pub struct NoopEventListener;
impl EventListener for NoopEventListener {
    fn on_failed_engine(&self, _reason: &str, _cause: &str) {}
}

/// The interface `IndexShard` requires of the segment engine. Every
/// documented operation from §4.3.
pub trait SegmentEngine: Send + Sync {
    fn index(&self, op: &Operation) -> EngineOpResult<IndexResult>;
    fn delete(&self, op: &Operation) -> EngineOpResult<DeleteResult>;

    /// Make recently indexed docs visible to new searchers. Idempotent.
    fn refresh(&self, source: &str);

    /// Write a durable commit.
    fn flush(&self, force: bool, wait_if_ongoing: bool) -> EngineOpResult<CommitId>;

    /// Attempt to atomically mark the current commit with `sync_id` iff it
    /// still matches `expected_commit_id`.
    fn sync_flush(&self, sync_id: &str, expected_commit_id: &CommitId) -> SyncFlushOutcome;

    fn force_merge(
        &self,
        flush: bool,
        max_segments: Option<u32>,
        only_expunge_deletes: bool,
        upgrade: bool,
        only_ancient: bool,
    ) -> EngineOpResult<()>;

    fn acquire_searcher(&self, source: &str) -> Arc<dyn Searcher>;
    fn acquire_index_commit(&self, flush_first: bool) -> EngineOpResult<Arc<dyn Commit>>;

    fn is_throttled(&self) -> bool;
    fn activate_throttling(&self);
    fn deactivate_throttling(&self);
    fn get_index_buffer_ram_bytes_used(&self) -> u64;
    fn write_indexing_buffer(&self);

    /// Replay the shard's own translog on startup.
    fn recover_from_translog(&self) -> EngineOpResult<u64>;

    fn config(&self) -> &EngineConfig;

    fn set_enable_gc_deletes(&self, enabled: bool);

    fn close(&self);
}
