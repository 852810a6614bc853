//! Operation and result types flowing through the replication pipeline (§3).

use crate::ids::{SeqNo, TranslogLocation, Uid};
use crate::state::OperationOrigin;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersionType {
    /// Version is assigned internally, monotonically, by the primary.
    Internal,
    /// Caller supplies the version; rejected unless strictly greater than
    /// the document's current version.
    External,
    /// Like `External` but accepts version equal to the current one too.
    ExternalGte,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationHeader {
    pub uid: Uid,
    pub seq_no: SeqNo,
    pub primary_term: crate::ids::PrimaryTerm,
    pub version: i64,
    pub version_type: VersionType,
    pub origin: OperationOrigin,
    pub start_time_millis: i64,
    pub auto_generated_id_timestamp: i64,
    pub is_retry: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Operation {
    Index { header: OperationHeader, source: serde_json::Value },
    Delete { header: OperationHeader },
    NoOpUpdate { header: OperationHeader, reason: String },
}

impl Operation {
    pub fn header(&self) -> &OperationHeader {
        match self {
            Operation::Index { header, .. } => header,
            Operation::Delete { header } => header,
            Operation::NoOpUpdate { header, .. } => header,
        }
    }

    pub fn header_mut(&mut self) -> &mut OperationHeader {
        match self {
            Operation::Index { header, .. } => header,
            Operation::Delete { header } => header,
            Operation::NoOpUpdate { header, .. } => header,
        }
    }
}

/// The user-visible outcome of a single-document write (§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultKind {
    Created,
    Updated,
    Deleted,
    NotFound,
    Noop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationSuccess {
    pub seq_no: SeqNo,
    pub version: i64,
    pub translog_location: TranslogLocation,
    pub result: ResultKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationFailure {
    pub kind: crate::error::ErrorKind,
    pub cause: String,
}

pub type OperationResult = Result<OperationSuccess, OperationFailure>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::PrimaryTerm;

    fn header() -> OperationHeader {
        OperationHeader {
            uid: Uid::Str("a".into()),
            seq_no: SeqNo::UNASSIGNED,
            primary_term: PrimaryTerm(1),
            version: 0,
            version_type: VersionType::Internal,
            origin: OperationOrigin::Primary,
            start_time_millis: 0,
            auto_generated_id_timestamp: -1,
            is_retry: false,
        }
    }

    #[test]
    fn header_accessor_matches_variant() {
        let op = Operation::Delete { header: header() };
        assert_eq!(op.header().uid, Uid::Str("a".into()));
    }
}
