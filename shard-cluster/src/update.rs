//! Update-to-index/delete translation (§4.4 step 4). `UpdateHelper` is an
//! opaque external collaborator in the same family as `ClusterStateSource`
//! and `Transport`: the shard never parses or merges documents itself (§1
//! Non-goals), it only calls `prepare` and retries on conflict.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use shard_core::error::ErrorKind;
use shard_core::ids::{PrimaryTerm, SeqNo, Uid};
use shard_core::operation::{Operation, OperationFailure, OperationHeader, ResultKind, VersionType};
use shard_core::shard::IndexShard;
use shard_core::state::OperationOrigin;

use crate::replication::{ReplicationCoordinator, WriteResponse};

/// A partial-document update request (ES's "partial doc" update, not a
/// script): `doc` is merged field-by-field into whatever currently exists
/// for `uid`.
#[derive(Debug, Clone)]
pub struct UpdateRequest {
    pub uid: Uid,
    pub doc: serde_json::Value,
    pub detect_noop: bool,
}

/// §4.4 step 4's opaque `UpdateHelper.prepare`: turns an `UpdateRequest`
/// into a concrete `Index`/`Delete`/`NoOpUpdate` operation. `record_applied`
/// and `record_conflict` let a stateful implementation keep its notion of
/// "current document" in sync with what the engine actually accepted,
/// since the engine exposes no read path back to the shard (§4.3).
pub trait UpdateHelper: Send + Sync {
    fn prepare(&self, request: &UpdateRequest) -> Operation;
    fn record_applied(&self, uid: &Uid, version: i64, source: serde_json::Value);
    fn record_conflict(&self, uid: &Uid, actual_version: i64);
}

/// In-process stand-in: merges partial docs into its own record of each
/// uid's last-known source and version, mirroring the teacher's
/// `Collection::upsert` (`barq-core`) merge-on-write without taking on its
/// vector-index bookkeeping. A real deployment's helper would merge against
/// the live segment store instead of this private shadow copy.
pub struct MergingUpdateHelper {
    known: Mutex<HashMap<String, (i64, serde_json::Value)>>,
}

impl MergingUpdateHelper {
    pub fn new() -> Self {
        Self { known: Mutex::new(HashMap::new()) }
    }

    fn key(uid: &Uid) -> String {
        match uid {
            Uid::Str(s) => s.clone(),
            Uid::U64(n) => n.to_string(),
        }
    }

    fn base_header(uid: &Uid) -> OperationHeader {
        OperationHeader {
            uid: uid.clone(),
            seq_no: SeqNo::UNASSIGNED,
            primary_term: PrimaryTerm::UNASSIGNED,
            version: 0,
            version_type: VersionType::Internal,
            origin: OperationOrigin::Primary,
            start_time_millis: 0,
            auto_generated_id_timestamp: -1,
            is_retry: false,
        }
    }
}

impl Default for MergingUpdateHelper {
    fn default() -> Self {
        Self::new()
    }
}

impl UpdateHelper for MergingUpdateHelper {
    fn prepare(&self, request: &UpdateRequest) -> Operation {
        let current = self.known.lock().unwrap().get(&Self::key(&request.uid)).cloned();
        let mut header = Self::base_header(&request.uid);

        match current {
            None => Operation::Index { header, source: request.doc.clone() },
            Some((current_version, existing_source)) => {
                let mut merged = existing_source.clone();
                merge_into(&mut merged, &request.doc);
                if request.detect_noop && merged == existing_source {
                    header.version = current_version;
                    header.version_type = VersionType::ExternalGte;
                    return Operation::NoOpUpdate { header, reason: "document unchanged after merge".into() };
                }
                // Expect to move the document from current_version to the
                // next one; `External` rejects if someone else already did.
                header.version = current_version + 1;
                header.version_type = VersionType::External;
                Operation::Index { header, source: merged }
            }
        }
    }

    fn record_applied(&self, uid: &Uid, version: i64, source: serde_json::Value) {
        self.known.lock().unwrap().insert(Self::key(uid), (version, source));
    }

    fn record_conflict(&self, uid: &Uid, actual_version: i64) {
        let mut known = self.known.lock().unwrap();
        known
            .entry(Self::key(uid))
            .and_modify(|entry| entry.0 = actual_version)
            .or_insert((actual_version, serde_json::Value::Null));
    }
}

/// Recursive field merge: objects merge key-by-key, anything else
/// (scalars, arrays) is replaced wholesale by the patch's value.
fn merge_into(base: &mut serde_json::Value, patch: &serde_json::Value) {
    if let (serde_json::Value::Object(base_map), serde_json::Value::Object(patch_map)) = (&mut *base, patch) {
        for (key, value) in patch_map {
            merge_into(base_map.entry(key.clone()).or_insert(serde_json::Value::Null), value);
        }
    } else {
        *base = patch.clone();
    }
}

fn noop_response(header: &OperationHeader) -> WriteResponse {
    WriteResponse {
        seq_no: SeqNo::UNASSIGNED,
        version: header.version,
        result: ResultKind::Noop,
        shards_total: 1,
        shards_successful: 1,
        shards_failed: Vec::new(),
    }
}

impl ReplicationCoordinator {
    /// §4.4 step 4: translate `request` via `update_helper`, retrying up to
    /// `retry_on_conflict` times only on `VersionConflictEngine`; a `NOOP`
    /// translation short-circuits into a synthesized response without
    /// touching the engine or replicas.
    pub fn update(
        &self,
        primary: &Arc<IndexShard>,
        shard_number: u32,
        update_helper: &dyn UpdateHelper,
        request: UpdateRequest,
        wait_for_active_shards: Option<usize>,
    ) -> Result<WriteResponse, OperationFailure> {
        let retry_bound = primary.settings().retry_on_conflict;
        let mut attempts_left = retry_bound + 1;

        loop {
            let prepared = update_helper.prepare(&request);
            if let Operation::NoOpUpdate { header, .. } = &prepared {
                tracing::debug!(uid = ?request.uid, "update resolved to a no-op, skipping replication");
                return Ok(noop_response(header));
            }
            let applied_source = match &prepared {
                Operation::Index { source, .. } => Some(source.clone()),
                _ => None,
            };

            match self.replicate(primary, shard_number, prepared, wait_for_active_shards) {
                Ok(response) => {
                    if let Some(source) = applied_source {
                        update_helper.record_applied(&request.uid, response.version, source);
                    }
                    return Ok(response);
                }
                Err(failure) => match failure.kind {
                    // `expected` is the version the engine would have
                    // accepted (`existing + 1`), so `expected - 1` is the
                    // document's real current version (see
                    // `shard_engine::resolve_version`'s `External` arm).
                    ErrorKind::VersionConflictEngine { expected, .. } if attempts_left > 1 => {
                        let actual_version = expected - 1;
                        update_helper.record_conflict(&request.uid, actual_version);
                        attempts_left -= 1;
                        tracing::warn!(uid = ?request.uid, actual_version, "retrying update after version conflict");
                        continue;
                    }
                    _ => return Err(failure),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClusterConfig, NodeConfig, ReadPreference};
    use crate::state_source::InMemoryClusterStateSource;
    use crate::transport::InProcessTransport;
    use shard_core::engine::{EngineConfig, OpenMode};
    use shard_core::ids::{AllocationId, NodeId, PrimaryTerm, ShardId};
    use shard_core::routing::{RecoverySourceKind, ShardRouting};
    use shard_core::settings::ShardSettings;
    use shard_engine::InMemorySegmentEngine;
    use shard_translog::FileTranslog;
    use std::collections::HashMap as Map;

    fn open_primary(shard_id: ShardId, retry_on_conflict: u32) -> Arc<IndexShard> {
        let routing = ShardRouting {
            shard_id: shard_id.clone(),
            node: NodeId::new("node-0"),
            allocation_id: AllocationId::new("alloc-0"),
            primary: true,
            active: false,
            relocating: false,
            relocation_target: None,
            recovery_source: RecoverySourceKind::EmptyStore,
        };
        let mut settings = ShardSettings::default();
        settings.retry_on_conflict = retry_on_conflict;
        let shard = Arc::new(IndexShard::new(shard_id, routing, settings));
        shard.mark_as_recovering().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let translog = FileTranslog::open(dir.path().join("translog")).unwrap();
        shard.set_translog(translog.clone());
        shard.set_engine(InMemorySegmentEngine::open(
            EngineConfig { open_mode: OpenMode::CreateIndexAndTranslog, enable_gc_deletes: true },
            translog,
        ));
        shard.post_recovery().unwrap();
        let mut r = shard.routing();
        r.active = true;
        shard.update_routing_entry(r).unwrap();
        shard.update_primary_term(PrimaryTerm(1));
        shard
    }

    fn coordinator() -> (ReplicationCoordinator, Arc<IndexShard>) {
        let config = ClusterConfig {
            node_id: NodeId::new("node-0"),
            index_name: "idx".into(),
            index_uuid: "uuid".into(),
            nodes: vec![NodeConfig { id: NodeId::new("node-0"), address: "n0".into() }],
            shard_count: 1,
            replication_factor: 1,
            read_preference: ReadPreference::Primary,
            placements: Map::new(),
        };
        let cluster_state = Arc::new(InMemoryClusterStateSource::new(config).unwrap());
        let shard_id = cluster_state.shard_id(0);
        let primary = open_primary(shard_id, 3);
        let transport = Arc::new(InProcessTransport::new());
        (ReplicationCoordinator::new(transport, cluster_state), primary)
    }

    #[test]
    fn first_update_on_missing_document_creates_it() {
        let (coordinator, primary) = coordinator();
        let helper = MergingUpdateHelper::new();
        let request = UpdateRequest { uid: Uid::Str("doc-1".into()), doc: serde_json::json!({"a": 1}), detect_noop: true };

        let response = coordinator.update(&primary, 0, &helper, request, Some(1)).unwrap();
        assert_eq!(response.result, ResultKind::Created);
        assert_eq!(response.version, 1);
    }

    #[test]
    fn repeated_identical_update_is_a_noop_and_skips_replication() {
        let (coordinator, primary) = coordinator();
        let helper = MergingUpdateHelper::new();
        let request = UpdateRequest { uid: Uid::Str("doc-1".into()), doc: serde_json::json!({"a": 1}), detect_noop: true };
        coordinator.update(&primary, 0, &helper, request.clone(), Some(1)).unwrap();

        let response = coordinator.update(&primary, 0, &helper, request, Some(1)).unwrap();
        assert_eq!(response.result, ResultKind::Noop);
        // No new op was appended to the translog for the no-op.
        assert_eq!(primary.translog().unwrap().stats().operation_count, 1);
    }

    #[test]
    fn update_retries_on_a_stale_version_and_eventually_succeeds() {
        let (coordinator, primary) = coordinator();
        let helper = MergingUpdateHelper::new();
        let create = UpdateRequest { uid: Uid::Str("doc-1".into()), doc: serde_json::json!({"a": 1}), detect_noop: true };
        coordinator.update(&primary, 0, &helper, create, Some(1)).unwrap();

        // Simulate a concurrent writer the helper doesn't know about: bump
        // the engine's version out from under the helper's cached version.
        let stale_op = Operation::Index {
            header: OperationHeader {
                uid: Uid::Str("doc-1".into()),
                seq_no: SeqNo::UNASSIGNED,
                primary_term: PrimaryTerm(1),
                version: 2,
                version_type: VersionType::ExternalGte,
                origin: OperationOrigin::Primary,
                start_time_millis: 0,
                auto_generated_id_timestamp: -1,
                is_retry: false,
            },
            source: serde_json::json!({"a": 1, "b": "someone else"}),
        };
        coordinator.replicate(&primary, 0, stale_op, Some(1)).unwrap();

        let merge = UpdateRequest { uid: Uid::Str("doc-1".into()), doc: serde_json::json!({"c": 3}), detect_noop: true };
        let response = coordinator.update(&primary, 0, &helper, merge, Some(1)).unwrap();
        assert_eq!(response.result, ResultKind::Updated);
        assert_eq!(response.version, 3);
    }

    #[test]
    fn update_surfaces_conflict_once_retries_are_exhausted() {
        let (coordinator, default_primary) = coordinator();
        // retry_on_conflict = 0: first stale attempt fails for good.
        let shard_id = default_primary.shard_id().clone();
        let zero_retry_primary = open_primary(shard_id, 0);
        zero_retry_primary.update_primary_term(PrimaryTerm(1));

        let helper = MergingUpdateHelper::new();
        let create = UpdateRequest { uid: Uid::Str("doc-1".into()), doc: serde_json::json!({"a": 1}), detect_noop: true };
        coordinator.update(&zero_retry_primary, 0, &helper, create, Some(1)).unwrap();

        let stale_op = Operation::Index {
            header: OperationHeader {
                uid: Uid::Str("doc-1".into()),
                seq_no: SeqNo::UNASSIGNED,
                primary_term: PrimaryTerm(1),
                version: 2,
                version_type: VersionType::ExternalGte,
                origin: OperationOrigin::Primary,
                start_time_millis: 0,
                auto_generated_id_timestamp: -1,
                is_retry: false,
            },
            source: serde_json::json!({"a": 1}),
        };
        coordinator.replicate(&zero_retry_primary, 0, stale_op, Some(1)).unwrap();

        let merge = UpdateRequest { uid: Uid::Str("doc-1".into()), doc: serde_json::json!({"c": 3}), detect_noop: true };
        let err = coordinator.update(&zero_retry_primary, 0, &helper, merge, Some(1)).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::VersionConflictEngine { .. }));
    }
}
