//! `ReplicationCoordinator` (§4.4 primary path, §4.5 replica path). Drives
//! one write across a primary and its replicas, honoring
//! `waitForActiveShards`, classifying benign vs. hostile replica failures,
//! and retrying the bounded set of primary-retryable engine errors.
//! Fan-out to replicas runs on a `rayon` thread pool (§5), matching the
//! teacher's choice of bounded parallel threads over an async runtime.

use std::sync::Arc;
use std::time::{Duration, Instant};

use shard_core::error::ErrorKind;
use shard_core::ids::{NodeId, SeqNo};
use shard_core::operation::{Operation, OperationFailure, OperationSuccess, ResultKind, VersionType};
use shard_core::shard::IndexShard;
use shard_core::translog::Durability;

use crate::config::ShardPlacement;
use crate::state_source::ClusterStateSource;
use crate::transport::{ReplicaRequest, ReplicaSendError, Transport};

/// The user-visible outcome of a replicated write (§7).
#[derive(Debug, Clone)]
pub struct WriteResponse {
    pub seq_no: SeqNo,
    pub version: i64,
    pub result: ResultKind,
    pub shards_total: usize,
    pub shards_successful: usize,
    pub shards_failed: Vec<ShardFailureInfo>,
}

#[derive(Debug, Clone)]
pub struct ShardFailureInfo {
    pub node: NodeId,
    pub reason: String,
}

pub struct ReplicationCoordinator {
    transport: Arc<dyn Transport>,
    cluster_state: Arc<dyn ClusterStateSource>,
    wait_timeout: Duration,
}

impl ReplicationCoordinator {
    pub fn new(transport: Arc<dyn Transport>, cluster_state: Arc<dyn ClusterStateSource>) -> Self {
        Self { transport, cluster_state, wait_timeout: Duration::from_secs(30) }
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    /// §4.4: drives one write on `primary`, then fans it out to every
    /// assigned replica, and returns once `min(successful + 1,
    /// wait_for_active_shards)` copies have acknowledged or the timeout
    /// elapses.
    pub fn replicate(
        &self,
        primary: &Arc<IndexShard>,
        shard_number: u32,
        mut op: Operation,
        wait_for_active_shards: Option<usize>,
    ) -> Result<WriteResponse, OperationFailure> {
        let placement = self
            .cluster_state
            .placement(shard_number)
            .map_err(|e| fail(ErrorKind::ShardNotFound(e.to_string())))?;

        let retry_bound = primary.settings().retry_on_conflict;
        let mut attempts_left = retry_bound + 1;

        loop {
            match self.attempt_on_primary(primary, &mut op) {
                Ok(success) => {
                    return Ok(self.fan_out_and_wait(primary, &placement, &op, success, wait_for_active_shards));
                }
                Err(failure) if failure.kind.is_retryable_on_primary() && attempts_left > 1 => {
                    attempts_left -= 1;
                    tracing::warn!(error = %failure.kind, "retrying write on primary");
                    continue;
                }
                Err(failure) => return Err(failure),
            }
        }
    }

    fn attempt_on_primary(
        &self,
        primary: &Arc<IndexShard>,
        op: &mut Operation,
    ) -> Result<OperationSuccess, OperationFailure> {
        let permit = primary.acquire_primary_operation_permit().map_err(|e| fail(e))?;
        let header = op.header_mut();
        header.primary_term = primary.primary_term();
        if !header.seq_no.is_assigned() {
            header.seq_no = primary.seq_no_service().generate_seq_no();
        }
        let result = primary.index_or_delete(op.clone());
        drop(permit);
        result
    }

    fn fan_out_and_wait(
        &self,
        primary: &Arc<IndexShard>,
        placement: &ShardPlacement,
        op: &Operation,
        success: OperationSuccess,
        wait_for_active_shards: Option<usize>,
    ) -> WriteResponse {
        let replica_op = replica_flavor(op, &success);
        let wait_target = wait_for_active_shards.unwrap_or(primary.settings().default_wait_for_active_shards);
        let total = 1 + placement.replicas.len();

        let request = ReplicaRequest { operation: replica_op, primary_term: primary.primary_term() };
        let shard_id = primary.shard_id().clone();
        let deadline = Instant::now() + self.wait_timeout;

        let outcomes: Vec<Result<(NodeId, SeqNo), ShardFailureInfo>> = {
            let replicas = placement.replicas.clone();
            let transport = self.transport.clone();
            let request = request.clone();
            let shard_id = shard_id.clone();
            rayon::scope(|scope| {
                let (tx, rx) = std::sync::mpsc::channel();
                for node in replicas {
                    let tx = tx.clone();
                    let transport = transport.clone();
                    let request = request.clone();
                    let shard_id = shard_id.clone();
                    scope.spawn(move |_| {
                        let outcome = match transport.send_replica_request(&node, &shard_id, request) {
                            Ok(checkpoint) => Ok((node, checkpoint)),
                            Err(ReplicaSendError::Operation(failure)) if failure.kind.is_benign_on_replica() => {
                                tracing::debug!(node = %node, error = %failure.kind, "benign replica failure ignored");
                                Err(ShardFailureInfo { node, reason: failure.kind.to_string() })
                            }
                            Err(ReplicaSendError::Operation(failure)) => {
                                tracing::error!(node = %node, error = %failure.kind, "replica failed the shard");
                                Err(ShardFailureInfo { node, reason: failure.kind.to_string() })
                            }
                            Err(ReplicaSendError::Transport(e)) => {
                                tracing::error!(node = %node, error = %e, "transport failure replicating write");
                                Err(ShardFailureInfo { node, reason: e.to_string() })
                            }
                        };
                        let _ = tx.send(outcome);
                    });
                }
                drop(tx);
                let required = wait_target.min(total).saturating_sub(1);
                let mut results = Vec::new();
                let mut acked = 0;
                while Instant::now() < deadline && acked < required {
                    match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                        Ok(outcome) => {
                            if outcome.is_ok() {
                                acked += 1;
                            }
                            results.push(outcome);
                        }
                        Err(_) => break,
                    }
                    if results.len() == total - 1 {
                        break;
                    }
                }
                results
            })
        };

        let mut successful = 1; // the primary itself
        let mut failed = Vec::new();
        for outcome in outcomes {
            match outcome {
                Ok((node, checkpoint)) => {
                    primary.update_local_checkpoint_for_shard(
                        allocation_for(placement, &node),
                        checkpoint,
                        &NoopGlobalCheckpointSyncer,
                    );
                    successful += 1;
                }
                Err(info) => failed.push(info),
            }
        }

        if primary.settings().durability == Durability::Request {
            if let Some(translog) = primary.translog() {
                let _ = translog.ensure_synced(&[success.translog_location]);
            }
        }

        WriteResponse {
            seq_no: success.seq_no,
            version: success.version,
            result: success.result,
            shards_total: total,
            shards_successful: successful,
            shards_failed: failed,
        }
    }

    /// §4.5: applies a replicated operation on a replica shard directly
    /// (used by tests and by in-process callers that already hold the
    /// target `IndexShard`, bypassing `Transport`).
    pub fn replicate_on_replica(
        &self,
        replica: &Arc<IndexShard>,
        request: ReplicaRequest,
    ) -> Result<SeqNo, OperationFailure> {
        apply_replica_operation(replica, request)
    }
}

fn allocation_for(placement: &ShardPlacement, node: &NodeId) -> shard_core::ids::AllocationId {
    // Allocation ids aren't tracked by the placement table (that's the
    // `ClusterStateSource`'s job via `register_shard`); using the node id as
    // a stand-in keeps `SeqNoService`'s per-allocation map keyed consistently
    // within a single coordinator's lifetime.
    let _ = placement;
    shard_core::ids::AllocationId::new(node.0.clone())
}

struct NoopGlobalCheckpointSyncer;
impl shard_core::listener::GlobalCheckpointSyncer for NoopGlobalCheckpointSyncer {
    fn run(&self) {}
}

fn fail(kind: ErrorKind) -> OperationFailure {
    OperationFailure { cause: kind.to_string(), kind }
}

/// Builds the outgoing replica request: the accepted seq-no/version carried
/// as `ExternalGte` so the replica applies the primary's decision verbatim
/// instead of re-running its own version-conflict resolution (§4.4 step 3,
/// "replication-and-recovery flavor of the version type").
fn replica_flavor(op: &Operation, success: &OperationSuccess) -> Operation {
    let mut replica_op = op.clone();
    let header = replica_op.header_mut();
    header.seq_no = success.seq_no;
    header.version = success.version;
    header.version_type = VersionType::ExternalGte;
    header.origin = shard_core::state::OperationOrigin::Replica;
    replica_op
}

/// §4.5 replica-side pipeline, shared by `InProcessTransport` and direct
/// in-test callers: stale-term rejection (via
/// `acquire_replica_operation_permit`), apply, optional sync, reply with
/// the replica's local checkpoint.
pub fn apply_replica_operation(
    replica: &Arc<IndexShard>,
    request: ReplicaRequest,
) -> Result<SeqNo, OperationFailure> {
    let permit = replica
        .acquire_replica_operation_permit(request.primary_term)
        .map_err(|e| fail(e))?;
    let result = replica.index_or_delete(request.operation);
    drop(permit);
    let success = result?;
    if replica.settings().durability == Durability::Request {
        if let Some(translog) = replica.translog() {
            translog.ensure_synced(&[success.translog_location]).map_err(|e| {
                fail(ErrorKind::RecoveryFailed(e.to_string()))
            })?;
        }
    }
    Ok(replica.seq_no_service().local_checkpoint())
}
