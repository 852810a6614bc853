//! Shard-local primitives shared by every crate in the workspace: identity
//! types, the lifecycle state machine, the operation admission gate, and the
//! `SegmentEngine`/`Translog` ports that `shard-engine` and `shard-translog`
//! implement.

pub mod engine;
pub mod error;
pub mod ids;
pub mod listener;
pub mod lock;
pub mod operation;
pub mod routing;
pub mod seqno;
pub mod settings;
pub mod shard;
pub mod shard_state;
pub mod state;
pub mod translog;

pub use engine::{EngineConfig, OpenMode, SegmentEngine};
pub use error::ErrorKind;
pub use ids::{AllocationId, NodeId, PrimaryTerm, SeqNo, ShardId, TranslogLocation, Uid};
pub use lock::{OperationLock, OperationLockError, Permit};
pub use operation::{Operation, OperationFailure, OperationResult, OperationSuccess};
pub use routing::ShardRouting;
pub use seqno::SeqNoService;
pub use settings::ShardSettings;
pub use shard::IndexShard;
pub use shard_state::ShardStateFile;
pub use state::IndexShardState;
pub use translog::Translog;
