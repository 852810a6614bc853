//! The `Translog` port (§4.2): an append-only, durable log of operations.
//! `shard-translog` supplies a file-backed implementation.

use crate::ids::TranslogLocation;
use crate::operation::Operation;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Durability {
    /// Sync before acking the client.
    Request,
    /// Batch sync on a timer/threshold.
    Async,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TranslogStats {
    pub operation_count: u64,
    pub size_in_bytes: u64,
    pub uncommitted_operations: u64,
    pub earliest_location: Option<TranslogLocation>,
    pub latest_location: Option<TranslogLocation>,
}

#[derive(Debug, Error)]
pub enum TranslogError {
    #[error("io error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serde(String),
    #[error("translog is closed")]
    Closed,
    #[error("requested location {0} was already truncated")]
    Truncated(TranslogLocation),
}

/// A read snapshot that prevents truncation of the locations it covers
/// until dropped (§4.2, §5 scoped acquisitions).
pub trait TranslogView: Send {
    fn min_location(&self) -> TranslogLocation;
}

pub trait Translog: Send + Sync {
    fn append(&self, op: &Operation) -> Result<TranslogLocation, TranslogError>;

    /// Fsyncs up to the maximum location in the set. Returns whether any
    /// work was actually done (i.e. the durable point advanced).
    fn ensure_synced(&self, locations: &[TranslogLocation]) -> Result<bool, TranslogError>;

    fn new_view(&self) -> Box<dyn TranslogView>;

    fn size_in_bytes(&self) -> u64;

    fn stats(&self) -> TranslogStats;

    /// Replays every retained operation in location order.
    fn replay(&self, apply: &mut dyn FnMut(Operation) -> Result<(), TranslogError>) -> Result<u64, TranslogError>;

    /// Seals the current generation and starts a new one. Called by the
    /// engine after a durable commit (§4.2 "after which the translog can
    /// be truncated"); resets `size_in_bytes` to measure only the new,
    /// not-yet-committed generation. Returns the new generation's start
    /// location.
    fn roll_generation(&self) -> Result<TranslogLocation, TranslogError>;

    fn close(&self);
}
