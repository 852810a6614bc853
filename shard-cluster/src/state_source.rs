//! `ClusterStateSource` (§6, opaque inbound collaborator): decides shard
//! placement and primary terms, and pushes routing/term updates into every
//! registered shard copy. This workspace's one concrete implementation
//! keeps everything in memory, pushing membership changes into real
//! `IndexShard` instances rather than shipping a log of operations between
//! independent stores.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use shard_core::ids::{AllocationId, NodeId, PrimaryTerm, ShardId};
use shard_core::routing::{RecoverySourceKind, ShardRouting};
use shard_core::shard::IndexShard;

use crate::config::{ClusterConfig, ClusterError, ClusterRouter, ShardPlacement};

/// The logical interface a shard's host process consumes from cluster-state
/// distribution (§6). Narrow by design: resolving placement and primary
/// term is all `ReplicationCoordinator`/`Transport` need to route a write.
pub trait ClusterStateSource: Send + Sync {
    fn placement(&self, shard_number: u32) -> Result<ShardPlacement, ClusterError>;
    fn primary_term(&self, shard_number: u32) -> PrimaryTerm;
}

struct ShardCopy {
    shard: Arc<IndexShard>,
    allocation_id: AllocationId,
}

/// In-process `ClusterStateSource`: holds the router plus every shard copy
/// registered on this "process" (in tests, often several nodes' worth of
/// copies live in one address space), and broadcasts routing/term changes
/// to them directly rather than over a transport.
pub struct InMemoryClusterStateSource {
    router: RwLock<ClusterRouter>,
    primary_terms: Mutex<HashMap<u32, PrimaryTerm>>,
    copies: Mutex<HashMap<(NodeId, u32), ShardCopy>>,
}

impl InMemoryClusterStateSource {
    pub fn new(config: ClusterConfig) -> Result<Self, ClusterError> {
        let router = ClusterRouter::from_config(config)?;
        let primary_terms = router.placements.keys().map(|&shard| (shard, PrimaryTerm(1))).collect();
        Ok(Self {
            router: RwLock::new(router),
            primary_terms: Mutex::new(primary_terms),
            copies: Mutex::new(HashMap::new()),
        })
    }

    pub fn shard_id(&self, shard_number: u32) -> ShardId {
        self.router.read().unwrap().shard_id(shard_number)
    }

    /// Registers a shard copy living on `node` so future routing/term
    /// broadcasts reach it. Called once per allocation, mirroring the
    /// teacher's pattern of a node announcing its local shards on startup.
    pub fn register_shard(&self, node: NodeId, shard_number: u32, allocation_id: AllocationId, shard: Arc<IndexShard>) {
        self.copies.lock().unwrap().insert((node, shard_number), ShardCopy { shard, allocation_id });
    }

    /// Computes and pushes the routing entry this node/shard pair should
    /// have given the current placement, calling `IndexShard::update_routing_entry`
    /// on every registered copy of the shard (§6 inbound call).
    pub fn publish_routing(&self, shard_number: u32, active: bool) -> Result<(), ClusterError> {
        let router = self.router.read().unwrap();
        let placement = router.placement(shard_number)?;
        let shard_id = router.shard_id(shard_number);
        drop(router);

        let copies = self.copies.lock().unwrap();
        for ((node, number), copy) in copies.iter() {
            if *number != shard_number {
                continue;
            }
            let primary = *node == placement.primary;
            let routing = ShardRouting {
                shard_id: shard_id.clone(),
                node: node.clone(),
                allocation_id: copy.allocation_id.clone(),
                primary,
                active,
                relocating: false,
                relocation_target: None,
                recovery_source: if primary { RecoverySourceKind::ExistingStore } else { RecoverySourceKind::Peer },
            };
            if let Err(e) = copy.shard.update_routing_entry(routing) {
                tracing::warn!(shard = shard_number, node = %node, error = %e, "routing update rejected by shard");
            }
        }
        Ok(())
    }

    /// Advances the primary term for `shard_number` and pushes it to every
    /// registered copy (§6 `update_primary_term`, invariant 2).
    pub fn advance_primary_term(&self, shard_number: u32) -> PrimaryTerm {
        let new_term = {
            let mut terms = self.primary_terms.lock().unwrap();
            let next = terms.get(&shard_number).copied().unwrap_or(PrimaryTerm::UNASSIGNED).next();
            terms.insert(shard_number, next);
            next
        };
        let copies = self.copies.lock().unwrap();
        for ((_, number), copy) in copies.iter() {
            if *number == shard_number {
                copy.shard.update_primary_term(new_term);
            }
        }
        tracing::info!(shard = shard_number, term = new_term.0, "primary term advanced by cluster state");
        new_term
    }
}

impl ClusterStateSource for InMemoryClusterStateSource {
    fn placement(&self, shard_number: u32) -> Result<ShardPlacement, ClusterError> {
        self.router.read().unwrap().placement(shard_number)
    }

    fn primary_term(&self, shard_number: u32) -> PrimaryTerm {
        self.primary_terms.lock().unwrap().get(&shard_number).copied().unwrap_or(PrimaryTerm::UNASSIGNED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NodeConfig, ReadPreference};
    use shard_core::settings::ShardSettings;
    use std::collections::HashMap as Map;

    fn config() -> ClusterConfig {
        ClusterConfig {
            node_id: NodeId::new("node-0"),
            index_name: "products".into(),
            index_uuid: "uuid-1".into(),
            nodes: vec![
                NodeConfig { id: NodeId::new("node-0"), address: "n0".into() },
                NodeConfig { id: NodeId::new("node-1"), address: "n1".into() },
            ],
            shard_count: 1,
            replication_factor: 2,
            read_preference: ReadPreference::Primary,
            placements: Map::new(),
        }
    }

    #[test]
    fn publishing_routing_starts_the_registered_primary() {
        let source = InMemoryClusterStateSource::new(config()).unwrap();
        let shard_id = source.shard_id(0);
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
        let shard = Arc::new(IndexShard::new(shard_id, routing, ShardSettings::default()));
        shard.mark_as_recovering().unwrap();
        shard.post_recovery().unwrap();

        source.register_shard(NodeId::new("node-0"), 0, AllocationId::new("alloc-0"), shard.clone());
        source.publish_routing(0, true).unwrap();

        assert_eq!(shard.state(), shard_core::state::IndexShardState::Started);
    }

    #[test]
    fn advancing_primary_term_reaches_every_copy() {
        let source = InMemoryClusterStateSource::new(config()).unwrap();
        let shard_id = source.shard_id(0);
        let routing = ShardRouting {
            shard_id: shard_id.clone(),
            node: NodeId::new("node-1"),
            allocation_id: AllocationId::new("alloc-1"),
            primary: false,
            active: false,
            relocating: false,
            relocation_target: None,
            recovery_source: RecoverySourceKind::Peer,
        };
        let shard = Arc::new(IndexShard::new(shard_id, routing, ShardSettings::default()));
        source.register_shard(NodeId::new("node-1"), 0, AllocationId::new("alloc-1"), shard.clone());

        let term = source.advance_primary_term(0);
        assert_eq!(shard.primary_term(), term);
    }
}
