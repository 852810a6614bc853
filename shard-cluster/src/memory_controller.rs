//! External memory controller (§4.9): polls `writingBytes` across the shards
//! registered on this node and throttles indexing once the aggregate crosses
//! a configured limit. Grounded on the teacher's tenant usage/quota poller in
//! `barq-storage` (`emit_usage_metrics`/`record_usage_metrics`), adapted from
//! a per-tenant quota gauge to a per-node indexing-buffer limit: both poll a
//! running counter, compare it against a configured ceiling, and publish a
//! gauge either way.
//!
//! This lives outside `shard-core` because it is explicitly an external
//! caller in the spec (the same category as `ClusterStateSource`): a shard
//! only exposes `writing_bytes()` and the engine's throttle switch, it never
//! polls its own siblings.

use std::sync::Arc;

use shard_core::shard::IndexShard;

/// Registers shards on this node and decides, on each `poll`, whether the
/// combined `writing_bytes` across them exceeds `limit_bytes`. Throttling is
/// applied per shard (via its current engine's `activate_throttling`), since
/// that is the only lever `SegmentEngine` exposes.
pub struct MemoryController {
    limit_bytes: u64,
    shards: Vec<Arc<IndexShard>>,
    throttled: std::sync::atomic::AtomicBool,
}

impl MemoryController {
    pub fn new(limit_bytes: u64) -> Self {
        Self { limit_bytes, shards: Vec::new(), throttled: std::sync::atomic::AtomicBool::new(false) }
    }

    pub fn register(&mut self, shard: Arc<IndexShard>) {
        self.shards.push(shard);
    }

    pub fn is_throttled(&self) -> bool {
        self.throttled.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Sums `writing_bytes` across every registered shard, flips throttling
    /// on or off on each shard's engine as the limit is crossed, and reports
    /// the total via a gauge. Returns the total so callers (tests, a
    /// periodic scheduler) can observe it without re-summing.
    pub fn poll(&self) -> u64 {
        let total: u64 = self.shards.iter().map(|s| s.writing_bytes()).sum();
        let over_limit = total > self.limit_bytes;
        let was_throttled = self.throttled.swap(over_limit, std::sync::atomic::Ordering::Relaxed);

        if over_limit != was_throttled {
            for shard in &self.shards {
                let Some(engine) = shard.engine_or_null() else { continue };
                if over_limit {
                    engine.activate_throttling();
                } else {
                    engine.deactivate_throttling();
                }
            }
            tracing::info!(total, limit = self.limit_bytes, throttled = over_limit, "memory controller crossed limit");
        }

        metrics::gauge!("shard_indexing_buffer_bytes_used").set(total as f64);
        metrics::gauge!("shard_indexing_buffer_throttled").set(if over_limit { 1.0 } else { 0.0 });
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shard_core::ids::{AllocationId, NodeId};
    use shard_core::routing::{RecoverySourceKind, ShardRouting};
    use shard_core::settings::ShardSettings;

    fn shard_with_bytes(bytes: i64) -> Arc<IndexShard> {
        let shard_id = shard_core::ids::ShardId::new("idx", "uuid-1", 0);
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
        shard.add_writing_bytes(bytes);
        shard
    }

    #[test]
    fn stays_untouched_below_limit() {
        let mut controller = MemoryController::new(1000);
        controller.register(shard_with_bytes(100));
        controller.register(shard_with_bytes(200));
        assert_eq!(controller.poll(), 300);
        assert!(!controller.is_throttled());
    }

    #[test]
    fn throttles_once_combined_usage_crosses_the_limit() {
        let mut controller = MemoryController::new(250);
        controller.register(shard_with_bytes(100));
        controller.register(shard_with_bytes(200));
        assert_eq!(controller.poll(), 300);
        assert!(controller.is_throttled());
    }

    #[test]
    fn un_throttles_once_usage_drops_back_below_the_limit() {
        let mut controller = MemoryController::new(250);
        let heavy = shard_with_bytes(300);
        controller.register(heavy.clone());
        assert!(controller.poll() > 250);
        assert!(controller.is_throttled());

        heavy.add_writing_bytes(-200);
        assert!(controller.poll() < 250);
        assert!(!controller.is_throttled());
    }
}
