//! Outbound notifications the shard fires towards the cluster (§6).
//! Default no-op methods so a listener only overrides what it needs —
//! the idiomatic-Rust shape of the source's listener-interface pattern.

use crate::ids::ShardId;
use crate::routing::ShardRouting;
use crate::state::IndexShardState;

pub trait IndexEventListener: Send + Sync {
    fn after_index_shard_started(&self, _shard_id: &ShardId) {}
    fn shard_routing_changed(&self, _shard_id: &ShardId, _old: &ShardRouting, _new: &ShardRouting) {}
    fn on_shard_inactive(&self, _shard_id: &ShardId) {}
    fn index_shard_state_changed(
        &self,
        _shard_id: &ShardId,
        _old: IndexShardState,
        _new: IndexShardState,
    ) {
    }
}

pub struct NoopIndexEventListener;
impl IndexEventListener for NoopIndexEventListener {}

/// Fired when a primary advances the global checkpoint (§4.7, §6).
pub trait GlobalCheckpointSyncer: Send + Sync {
    fn run(&self);
}

/// Fired on a fatal engine failure (§4.3, §6). Deliberately narrow — just
/// shard id plus strings — so the engine never needs a strong handle back
/// to the owning shard (§9 cyclic-ownership note).
pub trait ShardFailureCallback: Send + Sync {
    fn on_shard_failure(&self, shard_id: &ShardId, reason: &str, cause: &str);
}
