//! `Transport` (§6): the opaque RPC layer. Defined here as a plain trait
//! with one in-process implementation — a direct call into the target
//! shard — so `ReplicationCoordinator` is exercisable without a real
//! network. Real transports (gRPC, HTTP) are out of scope.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use shard_core::ids::{NodeId, PrimaryTerm, SeqNo, ShardId};
use shard_core::operation::{Operation, OperationFailure};
use shard_core::shard::IndexShard;
use thiserror::Error;

use crate::replication::apply_replica_operation;

#[derive(Debug, Clone)]
pub struct ReplicaRequest {
    pub operation: Operation,
    pub primary_term: PrimaryTerm,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("target shard not registered: node={0} shard={1}")]
    NotRegistered(String, String),

    #[error("receive timeout after {0:?}")]
    ReceiveTimeout(Duration),
}

/// Either a transport-level failure (no route, timeout) or an
/// operation-level failure the replica itself reported.
#[derive(Debug)]
pub enum ReplicaSendError {
    Transport(TransportError),
    Operation(OperationFailure),
}

impl From<TransportError> for ReplicaSendError {
    fn from(e: TransportError) -> Self {
        ReplicaSendError::Transport(e)
    }
}

pub trait Transport: Send + Sync {
    fn send_replica_request(
        &self,
        node: &NodeId,
        shard_id: &ShardId,
        request: ReplicaRequest,
    ) -> Result<SeqNo, ReplicaSendError>;
}

/// Direct in-process dispatch: looks up the target `IndexShard` by
/// `(node, shard)` and calls into it synchronously, standing in for a
/// real RPC round-trip (§6).
#[derive(Default)]
pub struct InProcessTransport {
    registry: Mutex<HashMap<(NodeId, ShardId), Arc<IndexShard>>>,
}

impl InProcessTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node: NodeId, shard_id: ShardId, shard: Arc<IndexShard>) {
        self.registry.lock().unwrap().insert((node, shard_id), shard);
    }
}

impl Transport for InProcessTransport {
    fn send_replica_request(
        &self,
        node: &NodeId,
        shard_id: &ShardId,
        request: ReplicaRequest,
    ) -> Result<SeqNo, ReplicaSendError> {
        let shard = self
            .registry
            .lock()
            .unwrap()
            .get(&(node.clone(), shard_id.clone()))
            .cloned()
            .ok_or_else(|| TransportError::NotRegistered(node.0.clone(), shard_id.to_string()))?;
        apply_replica_operation(&shard, request).map_err(ReplicaSendError::Operation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shard_core::ids::{AllocationId, Uid};
    use shard_core::operation::{OperationHeader, VersionType};
    use shard_core::routing::{RecoverySourceKind, ShardRouting};
    use shard_core::settings::ShardSettings;
    use shard_core::state::OperationOrigin;
    use shard_engine::InMemorySegmentEngine;
    use shard_translog::FileTranslog;

    fn started_shard(shard_id: ShardId, node: NodeId) -> Arc<IndexShard> {
        let routing = ShardRouting {
            shard_id: shard_id.clone(),
            node,
            allocation_id: AllocationId::new("alloc-0"),
            primary: false,
            active: false,
            relocating: false,
            relocation_target: None,
            recovery_source: RecoverySourceKind::Peer,
        };
        let shard = Arc::new(IndexShard::new(shard_id, routing, ShardSettings::default()));
        shard.mark_as_recovering().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let translog = FileTranslog::open(dir.path().join("translog")).unwrap();
        shard.set_translog(translog.clone());
        shard.set_engine(InMemorySegmentEngine::open(
            shard_core::engine::EngineConfig {
                open_mode: shard_core::engine::OpenMode::CreateIndexAndTranslog,
                enable_gc_deletes: true,
            },
            translog,
        ));
        shard.post_recovery().unwrap();
        let mut r = shard.routing();
        r.active = true;
        shard.update_routing_entry(r).unwrap();
        shard
    }

    #[test]
    fn unregistered_target_fails_fast() {
        let transport = InProcessTransport::new();
        let shard_id = ShardId::new("idx", "uuid", 0);
        let header = OperationHeader {
            uid: Uid::Str("a".into()),
            seq_no: SeqNo(0),
            primary_term: PrimaryTerm(1),
            version: 1,
            version_type: VersionType::ExternalGte,
            origin: OperationOrigin::Replica,
            start_time_millis: 0,
            auto_generated_id_timestamp: -1,
            is_retry: false,
        };
        let request = ReplicaRequest {
            operation: Operation::Index { header, source: serde_json::json!({}) },
            primary_term: PrimaryTerm(1),
        };
        let result = transport.send_replica_request(&NodeId::new("ghost"), &shard_id, request);
        assert!(matches!(result, Err(ReplicaSendError::Transport(TransportError::NotRegistered(_, _)))));
    }

    #[test]
    fn registered_target_applies_the_operation() {
        let transport = InProcessTransport::new();
        let shard_id = ShardId::new("idx", "uuid", 0);
        let node = NodeId::new("node-1");
        let shard = started_shard(shard_id.clone(), node.clone());
        transport.register(node.clone(), shard_id.clone(), shard.clone());

        let header = OperationHeader {
            uid: Uid::Str("a".into()),
            seq_no: SeqNo(0),
            primary_term: PrimaryTerm(1),
            version: 1,
            version_type: VersionType::ExternalGte,
            origin: OperationOrigin::Replica,
            start_time_millis: 0,
            auto_generated_id_timestamp: -1,
            is_retry: false,
        };
        let request = ReplicaRequest {
            operation: Operation::Index { header, source: serde_json::json!({"x": 1}) },
            primary_term: PrimaryTerm(1),
        };
        let local_checkpoint = transport.send_replica_request(&node, &shard_id, request).unwrap();
        assert_eq!(local_checkpoint, SeqNo(0));
    }
}
