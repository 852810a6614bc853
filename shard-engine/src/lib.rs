//! One concrete adapter for the `shard_core::SegmentEngine` port (§4.3):
//! an in-memory document store that applies index/delete operations,
//! assigns versions, and couples every write to the shard's translog.
//!
//! The inverted-index / scoring engine itself is out of scope (§1
//! non-goals); this crate exists only to make the replication pipeline in
//! `shard-cluster` exercisable end-to-end against a real `SegmentEngine`.

use shard_core::engine::{
    Commit, CommitId, DeleteResult, EngineConfig, EngineOpResult, EventListener, IndexResult,
    NoopEventListener, OpenMode, Searcher, SegmentEngine, SyncFlushOutcome,
};
use shard_core::error::ErrorKind;
use shard_core::ids::{TranslogLocation, Uid};
use shard_core::operation::{Operation, OperationFailure, OperationHeader, VersionType};
use shard_core::routing::RecoverySourceKind;
use shard_core::translog::Translog;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
struct DocEntry {
    version: i64,
    deleted: bool,
}

fn fail(kind: ErrorKind) -> OperationFailure {
    let cause = kind.to_string();
    OperationFailure { kind, cause }
}

/// Resolves the next version for a write against the document's current
/// version, per §3's `VersionType` semantics.
fn resolve_version(current: Option<i64>, header: &OperationHeader) -> Result<i64, OperationFailure> {
    match header.version_type {
        VersionType::Internal => Ok(current.unwrap_or(0) + 1),
        VersionType::External => match current {
            Some(existing) if header.version <= existing => Err(fail(ErrorKind::VersionConflictEngine {
                expected: existing + 1,
                actual: header.version,
            })),
            _ => Ok(header.version),
        },
        VersionType::ExternalGte => match current {
            Some(existing) if header.version < existing => Err(fail(ErrorKind::VersionConflictEngine {
                expected: existing,
                actual: header.version,
            })),
            _ => Ok(header.version),
        },
    }
}

/// An in-memory `SegmentEngine`. Documents live in a `HashMap` guarded by a
/// single lock; every index/delete both mutates that map and appends to the
/// translog under the same critical section, matching §4.3's "apply to the
/// in-memory index and append to the translog atomically".
pub struct InMemorySegmentEngine {
    config: EngineConfig,
    documents: Mutex<HashMap<Uid, DocEntry>>,
    translog: Arc<dyn Translog>,
    event_listener: Arc<dyn EventListener>,
    gc_deletes_enabled: AtomicBool,
    throttled: AtomicBool,
    buffer_bytes: AtomicU64,
    commit_generation: AtomicU64,
    last_commit: Mutex<Option<CommitId>>,
    ops_since_commit: AtomicU64,
    sync_id: Mutex<Option<(String, CommitId)>>,
    closed: AtomicBool,
}

impl InMemorySegmentEngine {
    pub fn open(config: EngineConfig, translog: Arc<dyn Translog>) -> Arc<Self> {
        Self::open_with_listener(config, translog, Arc::new(NoopEventListener))
    }

    pub fn open_with_listener(
        config: EngineConfig,
        translog: Arc<dyn Translog>,
        event_listener: Arc<dyn EventListener>,
    ) -> Arc<Self> {
        let gc_deletes_enabled = config.enable_gc_deletes;
        Arc::new(Self {
            config,
            documents: Mutex::new(HashMap::new()),
            translog,
            event_listener,
            gc_deletes_enabled: AtomicBool::new(gc_deletes_enabled),
            throttled: AtomicBool::new(false),
            buffer_bytes: AtomicU64::new(0),
            commit_generation: AtomicU64::new(0),
            last_commit: Mutex::new(None),
            ops_since_commit: AtomicU64::new(0),
            sync_id: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<(), OperationFailure> {
        if self.closed.load(Ordering::Acquire) {
            return Err(fail(ErrorKind::EngineClosed));
        }
        Ok(())
    }

    fn report_failure(&self, reason: &str, cause: &str) {
        self.event_listener.on_failed_engine(reason, cause);
    }

    /// Whether deleted documents may currently be garbage-collected.
    /// Disabled for the duration of recovery (§4.8) via
    /// `set_enable_gc_deletes(false)`, re-enabled at `FINALIZE`.
    pub fn gc_deletes_enabled(&self) -> bool {
        self.gc_deletes_enabled.load(Ordering::Relaxed)
    }
}

impl SegmentEngine for InMemorySegmentEngine {
    fn index(&self, op: &Operation) -> EngineOpResult<IndexResult> {
        self.ensure_open()?;
        let header = op.header().clone();
        let mut docs = self.documents.lock().unwrap();
        let current = docs.get(&header.uid).map(|e| e.version);
        let version = resolve_version(current, &header)?;
        let is_created = !matches!(docs.get(&header.uid), Some(e) if !e.deleted);

        let location = self.translog.append(op).map_err(|e| {
            self.report_failure("translog append failed during index", &e.to_string());
            fail(ErrorKind::EngineClosed)
        })?;

        docs.insert(header.uid.clone(), DocEntry { version, deleted: false });
        drop(docs);
        self.buffer_bytes.fetch_add(estimate_size(op), Ordering::Relaxed);
        self.ops_since_commit.fetch_add(1, Ordering::Relaxed);

        Ok(IndexResult {
            seq_no: header.seq_no,
            version,
            translog_location: location,
            is_created,
        })
    }

    fn delete(&self, op: &Operation) -> EngineOpResult<DeleteResult> {
        self.ensure_open()?;
        let header = op.header().clone();
        let mut docs = self.documents.lock().unwrap();
        let current = docs.get(&header.uid).map(|e| e.version);
        let is_found = matches!(docs.get(&header.uid), Some(e) if !e.deleted);
        let version = resolve_version(current, &header)?;

        let location = self.translog.append(op).map_err(|e| {
            self.report_failure("translog append failed during delete", &e.to_string());
            fail(ErrorKind::EngineClosed)
        })?;

        if self.gc_deletes_enabled() || !is_found {
            docs.insert(header.uid.clone(), DocEntry { version, deleted: true });
        } else {
            docs.remove(&header.uid);
        }
        drop(docs);
        self.ops_since_commit.fetch_add(1, Ordering::Relaxed);

        Ok(DeleteResult {
            seq_no: header.seq_no,
            version,
            translog_location: location,
            is_found,
        })
    }

    fn refresh(&self, source: &str) {
        tracing::debug!(source, "refresh requested (in-memory engine is always visible)");
    }

    fn flush(&self, force: bool, _wait_if_ongoing: bool) -> EngineOpResult<CommitId> {
        self.ensure_open()?;
        if !force && self.ops_since_commit.load(Ordering::Relaxed) == 0 {
            if let Some(existing) = self.last_commit.lock().unwrap().clone() {
                return Ok(existing);
            }
        }
        let generation = self.commit_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let commit_id = CommitId(format!("commit-{generation}"));
        *self.last_commit.lock().unwrap() = Some(commit_id.clone());
        self.ops_since_commit.store(0, Ordering::Relaxed);
        let _ = self.translog.roll_generation();
        metrics::counter!("segment_engine_flush_total").increment(1);
        tracing::info!(commit = %commit_id.0, "flush completed");
        Ok(commit_id)
    }

    fn sync_flush(&self, sync_id: &str, expected_commit_id: &CommitId) -> SyncFlushOutcome {
        if self.ops_since_commit.load(Ordering::Relaxed) > 0 {
            return SyncFlushOutcome::PendingOperations;
        }
        let current = self.last_commit.lock().unwrap().clone();
        match current {
            Some(ref commit) if commit == expected_commit_id => {
                *self.sync_id.lock().unwrap() = Some((sync_id.to_string(), commit.clone()));
                SyncFlushOutcome::Committed
            }
            Some(_) => SyncFlushOutcome::OutOfSync,
            None => SyncFlushOutcome::Failed("no commit exists yet".into()),
        }
    }

    fn force_merge(
        &self,
        flush: bool,
        _max_segments: Option<u32>,
        _only_expunge_deletes: bool,
        _upgrade: bool,
        _only_ancient: bool,
    ) -> EngineOpResult<()> {
        self.ensure_open()?;
        if flush {
            self.flush(true, false)?;
        }
        Ok(())
    }

    fn acquire_searcher(&self, source: &str) -> Arc<dyn Searcher> {
        let docs = self.documents.lock().unwrap();
        let live = docs.values().filter(|e| !e.deleted).count();
        tracing::trace!(source, live, "searcher acquired");
        Arc::new(InMemorySearcher { doc_count: live })
    }

    fn acquire_index_commit(&self, flush_first: bool) -> EngineOpResult<Arc<dyn Commit>> {
        let commit_id = if flush_first {
            self.flush(true, true)?
        } else {
            self.last_commit
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| fail(ErrorKind::RecoveryFailed("no commit exists to acquire".into())))?
        };
        Ok(Arc::new(InMemoryCommit { id: commit_id }))
    }

    fn is_throttled(&self) -> bool {
        self.throttled.load(Ordering::Relaxed)
    }

    fn activate_throttling(&self) {
        self.throttled.store(true, Ordering::Relaxed);
    }

    fn deactivate_throttling(&self) {
        self.throttled.store(false, Ordering::Relaxed);
    }

    fn get_index_buffer_ram_bytes_used(&self) -> u64 {
        self.buffer_bytes.load(Ordering::Relaxed)
    }

    fn write_indexing_buffer(&self) {
        self.buffer_bytes.store(0, Ordering::Relaxed);
    }

    fn recover_from_translog(&self) -> EngineOpResult<u64> {
        let mut docs = self.documents.lock().unwrap();
        let mut applied = 0u64;
        let count = self
            .translog
            .replay(&mut |op| {
                let header = op.header().clone();
                match &op {
                    Operation::Index { .. } => {
                        docs.insert(header.uid, DocEntry { version: header.version, deleted: false });
                    }
                    Operation::Delete { .. } => {
                        docs.insert(header.uid, DocEntry { version: header.version, deleted: true });
                    }
                    Operation::NoOpUpdate { .. } => {}
                }
                applied += 1;
                Ok(())
            })
            .map_err(|e| fail(ErrorKind::RecoveryFailed(e.to_string())))?;
        debug_assert_eq!(count, applied);
        Ok(applied)
    }

    fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn set_enable_gc_deletes(&self, enabled: bool) {
        self.gc_deletes_enabled.store(enabled, Ordering::Relaxed);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.translog.close();
    }
}

fn estimate_size(op: &Operation) -> u64 {
    match op {
        Operation::Index { source, .. } => source.to_string().len() as u64,
        _ => 0,
    }
}

struct InMemorySearcher {
    doc_count: usize,
}

impl Searcher for InMemorySearcher {
    fn doc_count(&self) -> usize {
        self.doc_count
    }
}

struct InMemoryCommit {
    id: CommitId,
}

impl Commit for InMemoryCommit {
    fn id(&self) -> &CommitId {
        &self.id
    }
}

/// Picks the `OpenMode` a recovery driver should hand to `SegmentEngine`
/// given what's on local disk and which recovery source is in play (§4.3,
/// §4.8).
pub fn open_mode_for(has_existing_index: bool, source: RecoverySourceKind) -> OpenMode {
    match source {
        RecoverySourceKind::Snapshot => OpenMode::OpenIndexCreateTranslog,
        _ if has_existing_index => OpenMode::OpenIndexAndTranslog,
        _ => OpenMode::CreateIndexAndTranslog,
    }
}
