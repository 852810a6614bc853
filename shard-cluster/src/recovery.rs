//! `RecoveryDriver` (§4.8): drives the per-shard recovery state machine
//! from any of the four sources, through the six externally-observable
//! stages, disabling delete GC until `FINALIZE`.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use shard_core::engine::{EngineConfig, OpenMode, SegmentEngine};
use shard_core::error::ErrorKind;
use shard_core::ids::{NodeId, ShardId};
use shard_core::operation::Operation;
use shard_core::routing::RecoverySourceKind;
use shard_core::shard::IndexShard;
use shard_core::translog::Translog;
use shard_translog::Repository;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecoveryStage {
    Init = 0,
    Index = 1,
    VerifyIndex = 2,
    Translog = 3,
    Finalize = 4,
    Done = 5,
}

/// External collaborator for `PEER` recovery (§4.8 source 2). The one
/// concrete implementation ships the source shard's own translog ops,
/// standing in for the source's "stream files and translog ops" protocol —
/// segment files themselves stay behind `SegmentEngine`'s opaque boundary.
pub trait PeerRecoveryTargetService: Send + Sync {
    fn start_recovery(&self, shard_id: &ShardId, source_node: &NodeId) -> Result<Vec<Operation>, ErrorKind>;
}

pub struct InProcessPeerRecoveryService {
    sources: std::sync::Mutex<std::collections::HashMap<(NodeId, ShardId), Arc<IndexShard>>>,
}

impl Default for InProcessPeerRecoveryService {
    fn default() -> Self {
        Self { sources: std::sync::Mutex::new(std::collections::HashMap::new()) }
    }
}

impl InProcessPeerRecoveryService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_source(&self, node: NodeId, shard_id: ShardId, shard: Arc<IndexShard>) {
        self.sources.lock().unwrap().insert((node, shard_id), shard);
    }
}

impl PeerRecoveryTargetService for InProcessPeerRecoveryService {
    fn start_recovery(&self, shard_id: &ShardId, source_node: &NodeId) -> Result<Vec<Operation>, ErrorKind> {
        let source = self
            .sources
            .lock()
            .unwrap()
            .get(&(source_node.clone(), shard_id.clone()))
            .cloned()
            .ok_or_else(|| ErrorKind::ShardNotFound(format!("{shard_id} on {source_node}")))?;
        let translog = source.translog().ok_or(ErrorKind::EngineClosed)?;
        let mut ops = Vec::new();
        translog
            .replay(&mut |op| {
                ops.push(op);
                Ok(())
            })
            .map_err(|e| ErrorKind::RecoveryFailed(e.to_string()))?;
        Ok(ops)
    }
}

/// Drives a single `IndexShard` through recovery. One driver per in-flight
/// recovery; `perform_recovery_restart` resets it without losing the
/// shard's `RECOVERING` state.
pub struct RecoveryDriver {
    stage: AtomicU8,
}

impl Default for RecoveryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl RecoveryDriver {
    pub fn new() -> Self {
        Self { stage: AtomicU8::new(RecoveryStage::Init as u8) }
    }

    pub fn stage(&self) -> RecoveryStage {
        match self.stage.load(Ordering::SeqCst) {
            0 => RecoveryStage::Init,
            1 => RecoveryStage::Index,
            2 => RecoveryStage::VerifyIndex,
            3 => RecoveryStage::Translog,
            4 => RecoveryStage::Finalize,
            _ => RecoveryStage::Done,
        }
    }

    fn set_stage(&self, stage: RecoveryStage) {
        self.stage.store(stage as u8, Ordering::SeqCst);
        metrics::gauge!("shard_recovery_stage").set(stage as u8 as f64);
    }

    /// §4.8 source 1: `EMPTY_STORE`/`EXISTING_STORE`. `has_existing_index`
    /// selects `OpenIndexAndTranslog` vs. `CreateIndexAndTranslog`.
    pub fn recover_from_store(
        &self,
        shard: &IndexShard,
        has_existing_index: bool,
        translog: Arc<dyn Translog>,
        engine_factory: impl FnOnce(EngineConfig, Arc<dyn Translog>) -> Arc<dyn SegmentEngine>,
    ) -> Result<(), ErrorKind> {
        shard.mark_as_recovering()?;
        self.set_stage(RecoveryStage::Init);

        self.set_stage(RecoveryStage::Index);
        let open_mode =
            shard_engine::open_mode_for(has_existing_index, shard.routing().recovery_source);
        let engine = engine_factory(EngineConfig { open_mode, enable_gc_deletes: false }, translog.clone());
        shard.set_translog(translog);
        shard.set_engine(engine.clone());

        self.set_stage(RecoveryStage::VerifyIndex);

        self.set_stage(RecoveryStage::Translog);
        engine.recover_from_translog().map_err(|f| f.kind)?;

        self.finalize(shard, &engine)
    }

    /// §4.8 source 2: `PEER`.
    pub fn recover_from_peer(
        &self,
        shard: &IndexShard,
        source_node: &NodeId,
        peer_service: &dyn PeerRecoveryTargetService,
        translog: Arc<dyn Translog>,
        engine_factory: impl FnOnce(EngineConfig, Arc<dyn Translog>) -> Arc<dyn SegmentEngine>,
    ) -> Result<(), ErrorKind> {
        shard.mark_as_recovering()?;
        self.set_stage(RecoveryStage::Init);

        self.set_stage(RecoveryStage::Index);
        let engine = engine_factory(
            EngineConfig { open_mode: OpenMode::CreateIndexAndTranslog, enable_gc_deletes: false },
            translog.clone(),
        );
        shard.set_translog(translog);
        shard.set_engine(engine.clone());

        self.set_stage(RecoveryStage::VerifyIndex);

        self.set_stage(RecoveryStage::Translog);
        let ops = peer_service.start_recovery(shard.shard_id(), source_node)?;
        apply_ops(&engine, ops).map_err(|f| f.kind)?;

        self.finalize(shard, &engine)
    }

    /// §4.8 source 3: `SNAPSHOT`. Fresh translog, replay is skipped.
    pub fn recover_from_snapshot(
        &self,
        shard: &IndexShard,
        repository: &dyn Repository,
        snapshot_id: &str,
        local_dir: &Path,
        translog_factory: impl FnOnce(&Path) -> Result<Arc<dyn Translog>, ErrorKind>,
        engine_factory: impl FnOnce(EngineConfig, Arc<dyn Translog>) -> Arc<dyn SegmentEngine>,
    ) -> Result<(), ErrorKind> {
        shard.mark_as_recovering()?;
        self.set_stage(RecoveryStage::Init);
        repository.restore(snapshot_id, local_dir).map_err(|e| ErrorKind::RecoveryFailed(e.to_string()))?;

        self.set_stage(RecoveryStage::Index);
        let translog = translog_factory(local_dir)?;
        let engine = engine_factory(
            EngineConfig { open_mode: OpenMode::OpenIndexCreateTranslog, enable_gc_deletes: false },
            translog.clone(),
        );
        shard.set_translog(translog);
        shard.set_engine(engine.clone());

        self.set_stage(RecoveryStage::VerifyIndex);
        self.set_stage(RecoveryStage::Translog); // replay skipped: translog is fresh.

        self.finalize(shard, &engine)
    }

    /// §4.8 source 4: `LOCAL_SHARDS` (shrink/split). Every source shard
    /// must already be `STARTED`; their retained translog ops are replayed
    /// into the new engine, standing in for the opaque
    /// `StoreRecovery.recover_from_local_shards` store assembly.
    pub fn recover_from_local_shards(
        &self,
        shard: &IndexShard,
        sources: &[Arc<IndexShard>],
        translog: Arc<dyn Translog>,
        engine_factory: impl FnOnce(EngineConfig, Arc<dyn Translog>) -> Arc<dyn SegmentEngine>,
    ) -> Result<(), ErrorKind> {
        use shard_core::state::IndexShardState;

        for source in sources {
            if source.state() != IndexShardState::Started {
                return Err(ErrorKind::RecoveryFailed(format!(
                    "source shard {} is not STARTED",
                    source.shard_id()
                )));
            }
        }

        shard.mark_as_recovering()?;
        self.set_stage(RecoveryStage::Init);

        self.set_stage(RecoveryStage::Index);
        let engine = engine_factory(
            EngineConfig { open_mode: OpenMode::CreateIndexAndTranslog, enable_gc_deletes: false },
            translog.clone(),
        );
        shard.set_translog(translog);
        shard.set_engine(engine.clone());

        self.set_stage(RecoveryStage::VerifyIndex);

        self.set_stage(RecoveryStage::Translog);
        for source in sources {
            if let Some(source_translog) = source.translog() {
                let mut ops = Vec::new();
                source_translog
                    .replay(&mut |op| {
                        ops.push(op);
                        Ok(())
                    })
                    .map_err(|e| ErrorKind::RecoveryFailed(e.to_string()))?;
                apply_ops(&engine, ops).map_err(|f| f.kind)?;
            }
        }

        self.finalize(shard, &engine)
    }

    fn finalize(&self, shard: &IndexShard, engine: &Arc<dyn SegmentEngine>) -> Result<(), ErrorKind> {
        self.set_stage(RecoveryStage::Finalize);
        engine.set_enable_gc_deletes(true);
        shard.post_recovery()?;
        self.set_stage(RecoveryStage::Done);
        Ok(())
    }

    /// Closes the in-progress engine and resets to `INIT` without touching
    /// the shard's lifecycle state, which stays `RECOVERING` (§4.8 restart).
    pub fn perform_recovery_restart(&self, shard: &IndexShard) {
        if let Some(engine) = shard.engine() {
            engine.close();
        }
        self.set_stage(RecoveryStage::Init);
        tracing::warn!(shard = %shard.shard_id(), "recovery restarted after a transient failure");
    }
}

fn apply_ops(engine: &Arc<dyn SegmentEngine>, ops: Vec<Operation>) -> Result<(), shard_core::operation::OperationFailure> {
    for op in ops {
        match &op {
            Operation::Index { .. } => {
                engine.index(&op)?;
            }
            Operation::Delete { .. } => {
                engine.delete(&op)?;
            }
            Operation::NoOpUpdate { .. } => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shard_core::ids::{AllocationId, PrimaryTerm, SeqNo, Uid};
    use shard_core::operation::{OperationHeader, VersionType};
    use shard_core::routing::ShardRouting;
    use shard_core::settings::ShardSettings;
    use shard_core::state::OperationOrigin;
    use shard_engine::InMemorySegmentEngine;
    use shard_translog::FileTranslog;

    fn routing(shard_id: &ShardId, source: RecoverySourceKind) -> ShardRouting {
        ShardRouting {
            shard_id: shard_id.clone(),
            node: NodeId::new("node-0"),
            allocation_id: AllocationId::new("alloc-0"),
            primary: true,
            active: false,
            relocating: false,
            relocation_target: None,
            recovery_source: source,
        }
    }

    fn index_op(uid: &str, seq_no: i64) -> Operation {
        Operation::Index {
            header: OperationHeader {
                uid: Uid::Str(uid.into()),
                seq_no: SeqNo(seq_no),
                primary_term: PrimaryTerm(1),
                version: 1,
                version_type: VersionType::Internal,
                origin: OperationOrigin::Primary,
                start_time_millis: 0,
                auto_generated_id_timestamp: -1,
                is_retry: false,
            },
            source: serde_json::json!({"seq": seq_no}),
        }
    }

    /// Scenario S5 (crash-replay): a translog with 5 prior ops, recovered
    /// from EXISTING_STORE, ends at localCheckpoint=4 with all 5 docs.
    #[test]
    fn scenario_s5_recovering_from_store_replays_every_op() {
        let shard_id = ShardId::new("idx", "uuid", 0);
        let shard = IndexShard::new(shard_id.clone(), routing(&shard_id, RecoverySourceKind::ExistingStore), ShardSettings::default());

        let dir = tempfile::tempdir().unwrap();
        let translog = FileTranslog::open(dir.path()).unwrap();
        for i in 0..5 {
            let location = translog.append(&index_op(&format!("doc-{i}"), i)).unwrap();
            translog.ensure_synced(&[location]).unwrap();
        }

        let driver = RecoveryDriver::new();
        driver
            .recover_from_store(&shard, true, translog, |config, translog| {
                InMemorySegmentEngine::open(config, translog)
            })
            .unwrap();

        assert_eq!(driver.stage(), RecoveryStage::Done);
        assert_eq!(shard.state(), shard_core::state::IndexShardState::PostRecovery);
        let searcher = shard.engine().unwrap().acquire_searcher("test");
        assert_eq!(searcher.doc_count(), 5);
    }

    #[test]
    fn restart_closes_the_engine_but_keeps_recovering_state() {
        let shard_id = ShardId::new("idx", "uuid", 0);
        let shard = IndexShard::new(shard_id.clone(), routing(&shard_id, RecoverySourceKind::EmptyStore), ShardSettings::default());
        let dir = tempfile::tempdir().unwrap();
        let translog: Arc<dyn Translog> = FileTranslog::open(dir.path()).unwrap();
        shard.mark_as_recovering().unwrap();
        shard.set_translog(translog.clone());
        shard.set_engine(InMemorySegmentEngine::open(
            EngineConfig { open_mode: OpenMode::CreateIndexAndTranslog, enable_gc_deletes: false },
            translog,
        ));

        let driver = RecoveryDriver::new();
        driver.perform_recovery_restart(&shard);
        assert_eq!(driver.stage(), RecoveryStage::Init);
        assert_eq!(shard.state(), shard_core::state::IndexShardState::Recovering);
    }

    #[test]
    fn local_shards_recovery_requires_started_sources() {
        let shard_id = ShardId::new("idx", "uuid", 1);
        let shard = IndexShard::new(shard_id.clone(), routing(&shard_id, RecoverySourceKind::LocalShards), ShardSettings::default());
        let source_id = ShardId::new("idx", "uuid", 0);
        let source = Arc::new(IndexShard::new(
            source_id.clone(),
            routing(&source_id, RecoverySourceKind::EmptyStore),
            ShardSettings::default(),
        ));

        let dir = tempfile::tempdir().unwrap();
        let translog: Arc<dyn Translog> = FileTranslog::open(dir.path()).unwrap();
        let driver = RecoveryDriver::new();
        let result = driver.recover_from_local_shards(&shard, &[source], translog, |config, translog| {
            InMemorySegmentEngine::open(config, translog)
        });
        assert!(result.is_err());
    }
}
