//! Cluster-facing glue around a `shard-core` `IndexShard`: membership and
//! placement (§3/§6), the in-process `ClusterStateSource`/`Transport` ports,
//! the per-write `ReplicationCoordinator` (§4.4/§4.5/§5), and the recovery
//! state machine (§4.8), driving real shards instead of shipping a log of
//! operations between independent stores.

pub mod config;
pub mod memory_controller;
pub mod recovery;
pub mod replication;
pub mod state_source;
pub mod transport;
pub mod update;

pub use config::{ClusterConfig, ClusterError, ClusterRouter, NodeConfig, ReadPreference, ShardPlacement};
pub use memory_controller::MemoryController;
pub use recovery::{InProcessPeerRecoveryService, PeerRecoveryTargetService, RecoveryDriver, RecoveryStage};
pub use replication::{ReplicationCoordinator, ShardFailureInfo, WriteResponse};
pub use state_source::{ClusterStateSource, InMemoryClusterStateSource};
pub use transport::{InProcessTransport, ReplicaRequest, ReplicaSendError, Transport, TransportError};
pub use update::{MergingUpdateHelper, UpdateHelper, UpdateRequest};
