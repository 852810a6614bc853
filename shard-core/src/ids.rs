//! Identity types for shards, allocations, and the monotone counters
//! carried alongside every replicated operation.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Sentinel meaning "no sequence number has been assigned yet".
pub const UNASSIGNED_SEQ_NO: i64 = -2;

/// Sentinel primary term used before a shard has ever been assigned one.
pub const UNASSIGNED_PRIMARY_TERM: u64 = 0;

/// Identity of an index/shard-number pair. Immutable for the lifetime of the index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardId {
    pub index_name: String,
    pub index_uuid: String,
    pub shard_number: u32,
}

impl ShardId {
    pub fn new(index_name: impl Into<String>, index_uuid: impl Into<String>, shard_number: u32) -> Self {
        Self {
            index_name: index_name.into(),
            index_uuid: index_uuid.into(),
            shard_number,
        }
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}][{}]", self.index_name, self.shard_number)
    }
}

/// Identifies a specific copy of a shard on a specific node. Unique for the
/// lifetime of that copy; a relocation or recovery restart mints a new one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AllocationId(pub String);

impl AllocationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for AllocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a cluster node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonically non-decreasing primary-term counter (invariant 2 / §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PrimaryTerm(pub u64);

impl PrimaryTerm {
    pub const UNASSIGNED: PrimaryTerm = PrimaryTerm(UNASSIGNED_PRIMARY_TERM);

    pub fn next(self) -> PrimaryTerm {
        PrimaryTerm(self.0 + 1)
    }
}

impl fmt::Display for PrimaryTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-shard sequence number assigned by the primary on accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeqNo(pub i64);

impl SeqNo {
    pub const UNASSIGNED: SeqNo = SeqNo(UNASSIGNED_SEQ_NO);
    pub const NO_OPS_PERFORMED: SeqNo = SeqNo(-1);

    pub fn is_assigned(self) -> bool {
        self.0 >= 0
    }

    pub fn next(self) -> SeqNo {
        debug_assert!(self.0 >= -1, "cannot advance from an unassigned seq-no");
        SeqNo(self.0 + 1)
    }
}

impl fmt::Display for SeqNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A monotonically increasing logical offset into a shard's translog.
///
/// Ordering is the whole contract: `next > current` must hold for any two
/// successive writes produced by one shard (invariant 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TranslogLocation {
    pub generation: u64,
    pub offset: u64,
}

impl TranslogLocation {
    pub const ZERO: TranslogLocation = TranslogLocation {
        generation: 0,
        offset: 0,
    };
}

impl fmt::Display for TranslogLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.generation, self.offset)
    }
}

/// Identifier for a document within a shard, echoed in every operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub enum Uid {
    Str(String),
    U64(u64),
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Uid::Str(s) => write!(f, "{s}"),
            Uid::U64(v) => write!(f, "{v}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_term_never_decreases_by_construction() {
        let t = PrimaryTerm(4);
        assert_eq!(t.next(), PrimaryTerm(5));
        assert!(t.next() > t);
    }

    #[test]
    fn translog_location_orders_by_generation_then_offset() {
        let a = TranslogLocation { generation: 0, offset: 10 };
        let b = TranslogLocation { generation: 1, offset: 0 };
        assert!(b > a);
    }

    #[test]
    fn seq_no_unassigned_is_not_assigned() {
        assert!(!SeqNo::UNASSIGNED.is_assigned());
        assert!(SeqNo(0).is_assigned());
    }
}
