//! The routing entry a shard is handed by the cluster-state source: which
//! node it lives on, whether it is primary or replica, and whether it is
//! mid-relocation.

use crate::ids::{AllocationId, NodeId, ShardId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How a shard copy came to exist, as discriminated by the routing entry.
/// Selects which of the four recovery sources `RecoveryDriver` uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoverySourceKind {
    EmptyStore,
    ExistingStore,
    Peer,
    Snapshot,
    LocalShards,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRouting {
    pub shard_id: ShardId,
    pub node: NodeId,
    pub allocation_id: AllocationId,
    pub primary: bool,
    pub active: bool,
    pub relocating: bool,
    pub relocation_target: Option<NodeId>,
    pub recovery_source: RecoverySourceKind,
}

impl ShardRouting {
    pub fn is_relocating_primary(&self) -> bool {
        self.primary && self.relocating && self.relocation_target.is_some()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoutingUpdateError {
    #[error("routing update refers to a different shard: expected {expected}, got {actual}")]
    WrongShard { expected: ShardId, actual: ShardId },

    #[error("routing update changes allocation id from {old} to {new} without a recovery restart")]
    AllocationMismatch { old: AllocationId, new: AllocationId },

    #[error("routing update would demote an active primary to a replica")]
    PrimaryDemotion,

    #[error("shard has relocated away; routing can no longer change for this allocation")]
    AlreadyRelocatedAway,
}

/// Validates a proposed routing transition against the invariants in §6:
/// same shard id, same allocation id (or both absent), never demote a
/// primary, never move a routing once the shard has fully relocated away.
pub fn validate_routing_update(
    current: &ShardRouting,
    new: &ShardRouting,
    has_relocated_away: bool,
) -> Result<(), RoutingUpdateError> {
    if current.shard_id != new.shard_id {
        return Err(RoutingUpdateError::WrongShard {
            expected: current.shard_id.clone(),
            actual: new.shard_id.clone(),
        });
    }
    if current.allocation_id != new.allocation_id {
        return Err(RoutingUpdateError::AllocationMismatch {
            old: current.allocation_id.clone(),
            new: new.allocation_id.clone(),
        });
    }
    if current.primary && !new.primary {
        return Err(RoutingUpdateError::PrimaryDemotion);
    }
    if has_relocated_away && !new.is_relocating_primary() {
        return Err(RoutingUpdateError::AlreadyRelocatedAway);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn routing(primary: bool, relocating: bool) -> ShardRouting {
        ShardRouting {
            shard_id: ShardId::new("idx", "uuid-1", 0),
            node: NodeId::new("node-0"),
            allocation_id: AllocationId::new("alloc-1"),
            primary,
            active: true,
            relocating,
            relocation_target: if relocating { Some(NodeId::new("node-1")) } else { None },
            recovery_source: RecoverySourceKind::ExistingStore,
        }
    }

    #[test]
    fn rejects_primary_demotion() {
        let current = routing(true, false);
        let mut new = routing(true, false);
        new.primary = false;
        assert_eq!(
            validate_routing_update(&current, &new, false),
            Err(RoutingUpdateError::PrimaryDemotion)
        );
    }

    #[test]
    fn rejects_changes_after_relocated_away() {
        let current = routing(true, true);
        let new = routing(true, false);
        assert_eq!(
            validate_routing_update(&current, &new, true),
            Err(RoutingUpdateError::AlreadyRelocatedAway)
        );
    }

    #[test]
    fn accepts_matching_update() {
        let current = routing(true, false);
        let new = routing(true, true);
        assert!(validate_routing_update(&current, &new, false).is_ok());
    }
}
