//! `IndexShard`: the hub tying lifecycle state, routing, primary term,
//! engine, translog, and the operation lock together (§2, §4.1, §4.4–§4.6).

use crate::engine::SegmentEngine;
use crate::error::ErrorKind;
use crate::ids::{AllocationId, PrimaryTerm, SeqNo, ShardId};
use crate::listener::{GlobalCheckpointSyncer, IndexEventListener, NoopIndexEventListener};
use crate::lock::{Executor, InlineExecutor, OperationLock, Permit};
use crate::operation::{Operation, OperationFailure, OperationSuccess};
use crate::routing::{validate_routing_update, ShardRouting};
use crate::seqno::SeqNoService;
use crate::settings::ShardSettings;
use crate::shard_state::ShardStateFile;
use crate::state::{
    check_mark_as_recovering, check_mark_started, check_post_recovery, check_read_allowed,
    check_relocated, check_write_allowed, IndexShardState, OperationOrigin,
};
use crate::translog::Translog;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

/// Guards `state` and `routing` together (§5: one monitor for state
/// transitions and metadata persistence, never held across engine I/O).
struct ShardMeta {
    state: IndexShardState,
    routing: ShardRouting,
    has_relocated_away: bool,
}

pub struct IndexShard {
    shard_id: ShardId,
    meta: Mutex<ShardMeta>,
    primary_term: AtomicU64,
    engine: RwLock<Option<Arc<dyn SegmentEngine>>>,
    translog: RwLock<Option<Arc<dyn Translog>>>,
    operation_lock: OperationLock,
    seq_no_service: SeqNoService,
    settings: ShardSettings,
    active: AtomicBool,
    last_write_millis: AtomicI64,
    writing_bytes: AtomicU64,
    async_flush_running: AtomicBool,
    event_listener: Arc<dyn IndexEventListener>,
    executor: Arc<dyn Executor>,
    /// Directory the `shard_state` file is written to on primary-ness /
    /// allocation changes (§6). `None` disables persistence, e.g. in tests
    /// that never touch disk.
    state_dir: Option<PathBuf>,
}

impl IndexShard {
    pub fn new(shard_id: ShardId, routing: ShardRouting, settings: ShardSettings) -> Self {
        Self::with_listener(shard_id, routing, settings, Arc::new(NoopIndexEventListener))
    }

    pub fn with_listener(
        shard_id: ShardId,
        routing: ShardRouting,
        settings: ShardSettings,
        event_listener: Arc<dyn IndexEventListener>,
    ) -> Self {
        let shard = Self {
            shard_id,
            meta: Mutex::new(ShardMeta {
                state: IndexShardState::Created,
                routing,
                has_relocated_away: false,
            }),
            primary_term: AtomicU64::new(crate::ids::UNASSIGNED_PRIMARY_TERM),
            engine: RwLock::new(None),
            translog: RwLock::new(None),
            operation_lock: OperationLock::new(),
            seq_no_service: SeqNoService::new(),
            settings,
            active: AtomicBool::new(false),
            last_write_millis: AtomicI64::new(0),
            writing_bytes: AtomicU64::new(0),
            async_flush_running: AtomicBool::new(false),
            event_listener,
            executor: Arc::new(InlineExecutor),
            state_dir: None,
        };
        shard.persist_shard_state();
        shard
    }

    /// Enables `shard_state` persistence (§6) to `dir`, writing the current
    /// primary-ness/allocation immediately and on every future change.
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self.persist_shard_state();
        self
    }

    fn persist_shard_state(&self) {
        let Some(dir) = &self.state_dir else { return };
        let meta = self.meta.lock().unwrap();
        let state = ShardStateFile {
            primary: meta.routing.primary,
            index_uuid: self.shard_id.index_uuid.clone(),
            allocation_id: meta.routing.allocation_id.clone(),
        };
        drop(meta);
        if let Err(e) = state.write_atomically(dir) {
            tracing::warn!(shard = %self.shard_id, error = %e, "failed to persist shard_state");
        }
    }

    pub fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }

    pub fn state(&self) -> IndexShardState {
        self.meta.lock().unwrap().state
    }

    pub fn routing(&self) -> ShardRouting {
        self.meta.lock().unwrap().routing.clone()
    }

    pub fn primary_term(&self) -> PrimaryTerm {
        PrimaryTerm(self.primary_term.load(Ordering::SeqCst))
    }

    pub fn seq_no_service(&self) -> &SeqNoService {
        &self.seq_no_service
    }

    pub fn settings(&self) -> &ShardSettings {
        &self.settings
    }

    pub fn operation_lock(&self) -> &OperationLock {
        &self.operation_lock
    }

    fn set_state(&self, new: IndexShardState) {
        let old = {
            let mut meta = self.meta.lock().unwrap();
            let old = meta.state;
            meta.state = new;
            old
        };
        if old != new {
            self.event_listener.index_shard_state_changed(&self.shard_id, old, new);
        }
    }

    // -- Lifecycle transitions (§4.1) --------------------------------------

    pub fn mark_as_recovering(&self) -> Result<(), ErrorKind> {
        let mut meta = self.meta.lock().unwrap();
        check_mark_as_recovering(meta.state)?;
        meta.state = IndexShardState::Recovering;
        tracing::info!(shard = %self.shard_id, "marked as recovering");
        Ok(())
    }

    pub fn post_recovery(&self) -> Result<(), ErrorKind> {
        let mut meta = self.meta.lock().unwrap();
        check_post_recovery(meta.state)?;
        meta.state = IndexShardState::PostRecovery;
        if let Some(engine) = self.engine.read().unwrap().as_ref() {
            engine.set_enable_gc_deletes(true);
        }
        tracing::info!(shard = %self.shard_id, "entered post-recovery");
        Ok(())
    }

    /// Cluster-state inbound call: `update_routing_entry(new)` (§6).
    pub fn update_routing_entry(&self, new_routing: ShardRouting) -> Result<(), ErrorKind> {
        let mut meta = self.meta.lock().unwrap();
        validate_routing_update(&meta.routing, &new_routing, meta.has_relocated_away)
            .map_err(|e| ErrorKind::IllegalIndexShardState(e.to_string()))?;
        let old = meta.routing.clone();
        let should_start = new_routing.active && meta.state == IndexShardState::PostRecovery;
        let state_changed =
            old.primary != new_routing.primary || old.allocation_id != new_routing.allocation_id;
        meta.routing = new_routing.clone();
        if should_start {
            check_mark_started(meta.state)?;
            meta.state = IndexShardState::Started;
        }
        drop(meta);
        if state_changed {
            self.persist_shard_state();
        }
        self.event_listener.shard_routing_changed(&self.shard_id, &old, &new_routing);
        if should_start {
            self.event_listener.after_index_shard_started(&self.shard_id);
        }
        Ok(())
    }

    /// Cluster-state inbound call: `update_primary_term(new)` (§6, invariant 2,
    /// testable property 10). Strictly greater advances the term; equal is a
    /// no-op; lesser is a programming-bug assertion, matching the source.
    pub fn update_primary_term(&self, new_term: PrimaryTerm) {
        let current = self.primary_term.load(Ordering::SeqCst);
        assert!(
            new_term.0 >= current,
            "primary term must never decrease: current={current}, new={}",
            new_term.0
        );
        if new_term.0 > current {
            self.primary_term.store(new_term.0, Ordering::SeqCst);
            tracing::info!(shard = %self.shard_id, term = new_term.0, "primary term advanced");
        }
    }

    /// `relocated()`: drains in-flight ops under the lock's block, then
    /// moves `STARTED -> RELOCATED` (invariant 3, invariant 5, scenario S4).
    pub fn relocated(&self) -> Result<(), ErrorKind> {
        {
            let meta = self.meta.lock().unwrap();
            if !meta.routing.is_relocating_primary() {
                return Err(ErrorKind::IllegalIndexShardState(
                    "relocated() called without a relocating-primary routing entry".into(),
                ));
            }
            check_relocated(meta.state)?;
        }
        let timeout = self.settings.relocation_handoff_timeout;
        let result = self.operation_lock.block_operations(timeout, || {
            self.set_state(IndexShardState::Relocated);
            let mut meta = self.meta.lock().unwrap();
            meta.has_relocated_away = true;
        });
        result.map_err(|_| ErrorKind::RelocationTimeout(timeout))
    }

    // -- Engine / translog incarnation (§3 ownership) ----------------------

    pub fn set_engine(&self, engine: Arc<dyn SegmentEngine>) {
        let mut slot = self.engine.write().unwrap();
        *slot = Some(engine);
    }

    pub fn set_translog(&self, translog: Arc<dyn Translog>) {
        let mut slot = self.translog.write().unwrap();
        *slot = Some(translog);
    }

    pub fn engine(&self) -> Option<Arc<dyn SegmentEngine>> {
        self.engine.read().unwrap().clone()
    }

    pub fn translog(&self) -> Option<Arc<dyn Translog>> {
        self.translog.read().unwrap().clone()
    }

    pub fn engine_or_null(&self) -> Option<Arc<dyn SegmentEngine>> {
        match self.state() {
            IndexShardState::Started | IndexShardState::Relocated => self.engine(),
            _ => None,
        }
    }

    /// `close()`: atomically claims the engine, optionally flushes, closes
    /// it and the operation lock (§4.1, always terminal).
    pub fn close(&self, flush_before_close: bool) {
        self.set_state(IndexShardState::Closed);
        let engine = self.engine.write().unwrap().take();
        if let Some(engine) = engine {
            if flush_before_close {
                let _ = engine.flush(true, false);
            }
            engine.close();
        }
        if let Some(translog) = self.translog.write().unwrap().take() {
            translog.close();
        }
        self.operation_lock.close();
        tracing::info!(shard = %self.shard_id, "shard closed");
    }

    // -- Admission (§4.1, §4.6) ---------------------------------------------

    pub fn ensure_read_allowed(&self) -> Result<(), ErrorKind> {
        check_read_allowed(self.state()).map_err(ErrorKind::from)
    }

    pub fn ensure_write_allowed(&self, origin: OperationOrigin) -> Result<(), ErrorKind> {
        check_write_allowed(self.state(), origin).map_err(ErrorKind::from)
    }

    /// Acquires a primary-operation permit, failing fast if the state
    /// forbids writes before ever touching the lock or the engine
    /// (testable property 9).
    pub fn acquire_primary_operation_permit(&self) -> Result<Permit, ErrorKind> {
        self.ensure_write_allowed(OperationOrigin::Primary)?;
        self.acquire_permit_blocking(false)
    }

    /// Acquires a replica-operation permit after checking the primary term
    /// is not stale (§4.5 step 1). Replicas never block-all.
    pub fn acquire_replica_operation_permit(
        &self,
        operation_primary_term: PrimaryTerm,
    ) -> Result<Permit, ErrorKind> {
        let current = self.primary_term();
        if operation_primary_term < current {
            return Err(ErrorKind::TooOldPrimaryTerm {
                request_term: operation_primary_term.0,
                shard_term: current.0,
            });
        }
        self.ensure_write_allowed(OperationOrigin::Replica)?;
        self.acquire_permit_blocking(true)
    }

    fn acquire_permit_blocking(&self, is_replica: bool) -> Result<Permit, ErrorKind> {
        let (tx, rx) = std::sync::mpsc::channel();
        self.operation_lock.acquire(
            self.executor.clone(),
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
            is_replica,
        );
        rx.recv()
            .expect("operation lock callback dropped without a result")
            .map_err(|_| ErrorKind::IndexShardClosed)
    }

    // -- Per-operation pipeline (§4.4, §4.5) --------------------------------

    /// Primary-side index/delete. The caller already holds the permit
    /// returned by `acquire_primary_operation_permit`.
    pub fn index_or_delete(&self, op: Operation) -> Result<OperationSuccess, OperationFailure> {
        let engine = self.engine_for_op().map_err(|e| OperationFailure { kind: e, cause: String::new() })?;
        self.touch_active();
        let result = match &op {
            Operation::Index { .. } => engine.index(&op).map(OperationSuccess::from),
            Operation::Delete { .. } => engine.delete(&op).map(OperationSuccess::from),
            Operation::NoOpUpdate { .. } => Ok(OperationSuccess {
                seq_no: op.header().seq_no,
                version: op.header().version,
                translog_location: crate::ids::TranslogLocation::ZERO,
                result: crate::operation::ResultKind::Noop,
            }),
        };
        if let Ok(success) = &result {
            self.seq_no_service.mark_seq_no_as_completed(success.seq_no);
            metrics::counter!("shard_operations_total", "shard" => self.shard_id.index_name.clone()).increment(1);
        }
        result
    }

    fn engine_for_op(&self) -> Result<Arc<dyn SegmentEngine>, ErrorKind> {
        self.engine.read().unwrap().clone().ok_or(ErrorKind::EngineClosed)
    }

    fn touch_active(&self) {
        self.active.store(true, Ordering::Relaxed);
        self.last_write_millis.store(now_millis(), Ordering::Relaxed);
    }

    /// §4.9: periodic external caller clears `active` once the inactivity
    /// threshold elapses, firing `on_shard_inactive`.
    pub fn check_idle(&self) {
        if !self.active.load(Ordering::Relaxed) {
            return;
        }
        let last = self.last_write_millis.load(Ordering::Relaxed);
        let elapsed = Duration::from_millis((now_millis() - last).max(0) as u64);
        if elapsed >= self.settings.inactive_threshold {
            self.active.store(false, Ordering::Relaxed);
            self.event_listener.on_shard_inactive(&self.shard_id);
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    // -- Flush policy (§4.9) -------------------------------------------------

    pub fn should_flush(&self) -> bool {
        match self.translog() {
            Some(translog) => translog.size_in_bytes() >= self.settings.flush_threshold_size_bytes,
            None => false,
        }
    }

    /// Idempotent via a CAS guard: at most one async flush in flight; if the
    /// condition still holds when it completes, it refires (scenario S6).
    pub fn maybe_flush(&self) -> bool {
        if self.async_flush_running.compare_exchange(
            false,
            true,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ).is_err() {
            return false;
        }
        let scheduled = if self.should_flush() {
            if let Some(engine) = self.engine() {
                let _ = engine.flush(false, false);
                metrics::counter!("shard_flush_total", "shard" => self.shard_id.index_name.clone()).increment(1);
            }
            true
        } else {
            false
        };
        self.async_flush_running.store(false, Ordering::SeqCst);
        if scheduled && self.should_flush() {
            return self.maybe_flush();
        }
        scheduled
    }

    pub fn writing_bytes(&self) -> u64 {
        self.writing_bytes.load(Ordering::Relaxed)
    }

    pub fn add_writing_bytes(&self, delta: i64) {
        if delta >= 0 {
            self.writing_bytes.fetch_add(delta as u64, Ordering::Relaxed);
        } else {
            self.writing_bytes.fetch_sub((-delta) as u64, Ordering::Relaxed);
        }
    }

    // -- Checkpoint propagation (§4.7) --------------------------------------

    pub fn update_local_checkpoint_for_shard(
        &self,
        allocation_id: AllocationId,
        seq_no: SeqNo,
        syncer: &dyn GlobalCheckpointSyncer,
    ) {
        if self.seq_no_service.update_local_checkpoint_for_shard(allocation_id, seq_no) {
            syncer.run();
        }
    }

    pub fn update_global_checkpoint_on_replica(&self, checkpoint: SeqNo) {
        self.seq_no_service.update_global_checkpoint_on_replica(checkpoint);
    }
}

fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as i64
}
