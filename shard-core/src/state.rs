//! The `IndexShard` lifecycle state machine (§4.1).

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexShardState {
    Created,
    Recovering,
    PostRecovery,
    Started,
    Relocated,
    Closed,
}

impl fmt::Display for IndexShardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IndexShardState::Created => "CREATED",
            IndexShardState::Recovering => "RECOVERING",
            IndexShardState::PostRecovery => "POST_RECOVERY",
            IndexShardState::Started => "STARTED",
            IndexShardState::Relocated => "RELOCATED",
            IndexShardState::Closed => "CLOSED",
        };
        write!(f, "{s}")
    }
}

/// The origin of an operation, which determines which shard states admit it
/// (§4.1 write-admission table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationOrigin {
    Primary,
    Replica,
    PeerRecovery,
    LocalTranslogRecovery,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IllegalIndexShardStateError {
    #[error("CurrentState[{current}] operation only allowed when not already recovering, current state is already RECOVERING")]
    AlreadyRecovering { current: IndexShardState },

    #[error("CurrentState[{current}] operation only allowed when not already started")]
    AlreadyStarted { current: IndexShardState },

    #[error("CurrentState[{current}] operation only allowed when not already relocated")]
    AlreadyRelocated { current: IndexShardState },

    #[error("CurrentState[{current}] operation only allowed when not recovering, current state is not RECOVERING")]
    NotRecovering { current: IndexShardState },

    #[error("CurrentState[{current}] operation only allowed when started, current state not valid")]
    NotStarted { current: IndexShardState },

    #[error("CurrentState[{current}] shard is closed")]
    Closed { current: IndexShardState },

    #[error("CurrentState[{current}] operation of origin {origin:?} not allowed in this state")]
    WriteNotAllowed {
        current: IndexShardState,
        origin: OperationOrigin,
    },

    #[error("CurrentState[{current}] reads are only allowed in STARTED, RELOCATED or POST_RECOVERY")]
    ReadNotAllowed { current: IndexShardState },
}

/// `markAsRecovering`: `CREATED -> RECOVERING`.
pub fn check_mark_as_recovering(current: IndexShardState) -> Result<(), IllegalIndexShardStateError> {
    match current {
        IndexShardState::Created => Ok(()),
        IndexShardState::Recovering => Err(IllegalIndexShardStateError::AlreadyRecovering { current }),
        IndexShardState::Started | IndexShardState::PostRecovery => {
            Err(IllegalIndexShardStateError::AlreadyStarted { current })
        }
        IndexShardState::Relocated => Err(IllegalIndexShardStateError::AlreadyRelocated { current }),
        IndexShardState::Closed => Err(IllegalIndexShardStateError::Closed { current }),
    }
}

/// `postRecovery`: `RECOVERING -> POST_RECOVERY`.
pub fn check_post_recovery(current: IndexShardState) -> Result<(), IllegalIndexShardStateError> {
    match current {
        IndexShardState::Recovering => Ok(()),
        IndexShardState::Closed => Err(IllegalIndexShardStateError::Closed { current }),
        _ => Err(IllegalIndexShardStateError::NotRecovering { current }),
    }
}

/// `updateRoutingEntry(active)`: `POST_RECOVERY -> STARTED`.
pub fn check_mark_started(current: IndexShardState) -> Result<(), IllegalIndexShardStateError> {
    match current {
        IndexShardState::PostRecovery | IndexShardState::Started => Ok(()),
        IndexShardState::Closed => Err(IllegalIndexShardStateError::Closed { current }),
        _ => Err(IllegalIndexShardStateError::NotRecovering { current }),
    }
}

/// `relocated()`: `STARTED -> RELOCATED`. Only the state-machine precondition
/// is checked here; the caller is responsible for having already drained
/// in-flight operations via the operation lock (invariant 5).
pub fn check_relocated(current: IndexShardState) -> Result<(), IllegalIndexShardStateError> {
    match current {
        IndexShardState::Started => Ok(()),
        IndexShardState::Relocated => Err(IllegalIndexShardStateError::AlreadyRelocated { current }),
        IndexShardState::Closed => Err(IllegalIndexShardStateError::Closed { current }),
        _ => Err(IllegalIndexShardStateError::NotStarted { current }),
    }
}

pub fn check_read_allowed(current: IndexShardState) -> Result<(), IllegalIndexShardStateError> {
    match current {
        IndexShardState::Started | IndexShardState::Relocated | IndexShardState::PostRecovery => Ok(()),
        _ => Err(IllegalIndexShardStateError::ReadNotAllowed { current }),
    }
}

/// Write admission table from §4.1.
pub fn check_write_allowed(
    current: IndexShardState,
    origin: OperationOrigin,
) -> Result<(), IllegalIndexShardStateError> {
    let allowed = match origin {
        OperationOrigin::Primary => matches!(
            current,
            IndexShardState::Recovering | IndexShardState::PostRecovery | IndexShardState::Started
        ),
        OperationOrigin::Replica => matches!(
            current,
            IndexShardState::Recovering
                | IndexShardState::PostRecovery
                | IndexShardState::Started
                | IndexShardState::Relocated
        ),
        OperationOrigin::PeerRecovery | OperationOrigin::LocalTranslogRecovery => {
            matches!(current, IndexShardState::Recovering)
        }
    };
    if allowed {
        Ok(())
    } else {
        Err(IllegalIndexShardStateError::WriteNotAllowed { current, origin })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_cannot_write_once_relocated() {
        assert!(check_write_allowed(IndexShardState::Relocated, OperationOrigin::Primary).is_err());
    }

    #[test]
    fn replica_can_write_while_relocated() {
        assert!(check_write_allowed(IndexShardState::Relocated, OperationOrigin::Replica).is_ok());
    }

    #[test]
    fn recovery_origin_only_allowed_while_recovering() {
        assert!(
            check_write_allowed(IndexShardState::Recovering, OperationOrigin::PeerRecovery).is_ok()
        );
        assert!(
            check_write_allowed(IndexShardState::Started, OperationOrigin::PeerRecovery).is_err()
        );
    }

    #[test]
    fn reads_allowed_only_in_three_states() {
        assert!(check_read_allowed(IndexShardState::Started).is_ok());
        assert!(check_read_allowed(IndexShardState::Relocated).is_ok());
        assert!(check_read_allowed(IndexShardState::PostRecovery).is_ok());
        assert!(check_read_allowed(IndexShardState::Recovering).is_err());
        assert!(check_read_allowed(IndexShardState::Created).is_err());
    }

    #[test]
    fn mark_as_recovering_rejects_every_non_created_state() {
        assert!(check_mark_as_recovering(IndexShardState::Created).is_ok());
        assert!(matches!(
            check_mark_as_recovering(IndexShardState::Recovering),
            Err(IllegalIndexShardStateError::AlreadyRecovering { .. })
        ));
        assert!(matches!(
            check_mark_as_recovering(IndexShardState::Started),
            Err(IllegalIndexShardStateError::AlreadyStarted { .. })
        ));
        assert!(matches!(
            check_mark_as_recovering(IndexShardState::Relocated),
            Err(IllegalIndexShardStateError::AlreadyRelocated { .. })
        ));
        assert!(matches!(
            check_mark_as_recovering(IndexShardState::Closed),
            Err(IllegalIndexShardStateError::Closed { .. })
        ));
    }
}
