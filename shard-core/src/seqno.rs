//! `SeqNoService`: per-allocation local checkpoints and the global
//! checkpoint they bound (§4.7).

use crate::ids::{AllocationId, SeqNo};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

struct State {
    local_checkpoint: SeqNo,
    max_seq_no: SeqNo,
    allocation_checkpoints: HashMap<AllocationId, SeqNo>,
    in_sync_allocations: HashSet<AllocationId>,
    global_checkpoint: SeqNo,
}

pub struct SeqNoService {
    state: Mutex<State>,
}

impl Default for SeqNoService {
    fn default() -> Self {
        Self::new()
    }
}

impl SeqNoService {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                local_checkpoint: SeqNo::NO_OPS_PERFORMED,
                max_seq_no: SeqNo::NO_OPS_PERFORMED,
                allocation_checkpoints: HashMap::new(),
                in_sync_allocations: HashSet::new(),
                global_checkpoint: SeqNo::NO_OPS_PERFORMED,
            }),
        }
    }

    /// Called by the primary's `SegmentEngine` on accept: reserves the next
    /// seq-no. Seq-nos are assigned monotonically even though completion
    /// order may differ (§5 ordering guarantees).
    pub fn generate_seq_no(&self) -> SeqNo {
        let mut state = self.state.lock().unwrap();
        state.max_seq_no = state.max_seq_no.next();
        state.max_seq_no
    }

    /// Marks a seq-no as locally applied. Only advances the local checkpoint
    /// over a contiguous run; gaps (out-of-order completions) are tracked
    /// implicitly by leaving the checkpoint where it is until the gap fills.
    pub fn mark_seq_no_as_completed(&self, seq_no: SeqNo) {
        let mut state = self.state.lock().unwrap();
        if seq_no.0 == state.local_checkpoint.0 + 1 {
            state.local_checkpoint = seq_no;
        }
    }

    pub fn local_checkpoint(&self) -> SeqNo {
        self.state.lock().unwrap().local_checkpoint
    }

    pub fn global_checkpoint(&self) -> SeqNo {
        self.state.lock().unwrap().global_checkpoint
    }

    /// Primary-side: record a replica's reported local checkpoint and
    /// recompute the global checkpoint as the min over in-sync copies.
    /// Returns `true` iff the global checkpoint advanced, so the caller
    /// can fire the global-checkpoint-sync RPC (§4.7).
    pub fn update_local_checkpoint_for_shard(&self, allocation_id: AllocationId, seq_no: SeqNo) -> bool {
        let mut state = self.state.lock().unwrap();
        state.allocation_checkpoints.insert(allocation_id, seq_no);
        self.recompute_global_checkpoint(&mut state)
    }

    /// After a replica's recovery proves it has caught up, it joins the
    /// in-sync set used to compute the global checkpoint.
    pub fn mark_allocation_id_as_in_sync(&self, allocation_id: AllocationId) {
        let mut state = self.state.lock().unwrap();
        state
            .allocation_checkpoints
            .entry(allocation_id.clone())
            .or_insert(SeqNo::NO_OPS_PERFORMED);
        state.in_sync_allocations.insert(allocation_id);
    }

    /// Replica-side: the primary forwards its computed global checkpoint.
    /// Monotone: a smaller incoming value is ignored (invariant 6).
    pub fn update_global_checkpoint_on_replica(&self, checkpoint: SeqNo) {
        let mut state = self.state.lock().unwrap();
        if checkpoint > state.global_checkpoint {
            state.global_checkpoint = checkpoint;
        }
    }

    /// Reconciles the tracked allocation set with the cluster state's view
    /// of active/initializing copies, dropping any that fell out.
    pub fn update_allocation_ids_from_master(
        &self,
        active: &HashSet<AllocationId>,
        initializing: &HashSet<AllocationId>,
    ) {
        let mut state = self.state.lock().unwrap();
        let known: HashSet<AllocationId> = active.union(initializing).cloned().collect();
        state.in_sync_allocations.retain(|id| known.contains(id));
        state.allocation_checkpoints.retain(|id, _| known.contains(id));
        self.recompute_global_checkpoint(&mut state);
    }

    fn recompute_global_checkpoint(&self, state: &mut State) -> bool {
        if state.in_sync_allocations.is_empty() {
            return false;
        }
        let min = state
            .in_sync_allocations
            .iter()
            .map(|id| state.allocation_checkpoints.get(id).copied().unwrap_or(SeqNo::NO_OPS_PERFORMED))
            .min()
            .unwrap_or(SeqNo::NO_OPS_PERFORMED);
        if min > state.global_checkpoint {
            state.global_checkpoint = min;
            true
        } else {
            false
        }
    }
}
