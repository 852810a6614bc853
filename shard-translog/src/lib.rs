//! A file-backed `shard_core::translog::Translog` implementation plus the
//! async syncing processor that coalesces fsync requests (§4.2), and the
//! `Repository` port used by snapshot recovery (§4.8) with a local
//! filesystem implementation.

pub mod repository;

use shard_core::ids::TranslogLocation;
use shard_core::operation::Operation;
use shard_core::translog::{Durability, Translog, TranslogError, TranslogStats, TranslogView};
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

pub use repository::{LocalRepository, Repository, RepositoryError};

fn io_err(e: std::io::Error) -> TranslogError {
    TranslogError::Io(e.to_string())
}

fn serde_err(e: serde_json::Error) -> TranslogError {
    TranslogError::Serde(e.to_string())
}

fn generation_file_name(generation: u64) -> String {
    format!("translog-{generation:020}.tlog")
}

fn generation_path(dir: &Path, generation: u64) -> PathBuf {
    dir.join(generation_file_name(generation))
}

fn list_generations(dir: &Path) -> Result<Vec<u64>, TranslogError> {
    let mut generations = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(rest) = name.strip_prefix("translog-").and_then(|n| n.strip_suffix(".tlog")) {
            if let Ok(generation) = rest.parse::<u64>() {
                generations.push(generation);
            }
        }
    }
    generations.sort_unstable();
    Ok(generations)
}

struct ActiveGeneration {
    generation: u64,
    file: File,
    bytes_written: u64,
    synced_bytes: u64,
}

/// Per-shard state tracked across the whole translog lifetime, guarded by
/// the same lock as the active generation's writer (§4.2 append is a single
/// critical section; `shard-engine` calls this from inside its own
/// document-map lock so the two stay in lock-step).
struct Counters {
    operation_count: u64,
    earliest_location: Option<TranslogLocation>,
    latest_location: Option<TranslogLocation>,
    uncommitted_operations: u64,
}

/// An append-only, file-backed translog. Operations are appended as JSON
/// lines to a per-generation file; `roll_generation` (invoked by the engine
/// on flush, §4.2 "after which the translog can be truncated") seals the
/// current generation and starts a fresh one.
pub struct FileTranslog {
    dir: PathBuf,
    active: Mutex<ActiveGeneration>,
    counters: Mutex<Counters>,
    pinned_generations: Mutex<HashSet<u64>>,
    closed: std::sync::atomic::AtomicBool,
}

impl FileTranslog {
    /// Opens (creating if absent) a translog directory, resuming at the
    /// highest existing generation or starting fresh at generation 0.
    pub fn open(dir: impl AsRef<Path>) -> Result<Arc<Self>, TranslogError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(io_err)?;
        let generations = list_generations(&dir)?;
        let generation = generations.last().copied().unwrap_or(0);
        let path = generation_path(&dir, generation);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err)?;
        let bytes_written = file.metadata().map_err(io_err)?.len();

        Ok(Arc::new(Self {
            dir,
            active: Mutex::new(ActiveGeneration {
                generation,
                file,
                bytes_written,
                synced_bytes: 0,
            }),
            counters: Mutex::new(Counters {
                operation_count: 0,
                earliest_location: None,
                latest_location: None,
                uncommitted_operations: 0,
            }),
            pinned_generations: Mutex::new(HashSet::new()),
            closed: std::sync::atomic::AtomicBool::new(false),
        }))
    }

    fn ensure_open(&self) -> Result<(), TranslogError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TranslogError::Closed);
        }
        Ok(())
    }

    /// Deletes generation files strictly older than the oldest generation
    /// any live `TranslogView` still pins, and older than the active
    /// generation. Safe to call any time; a no-op if nothing is eligible.
    pub fn reclaim_unreferenced_generations(&self) -> Result<(), TranslogError> {
        let active_generation = self.active.lock().unwrap().generation;
        let floor = self
            .pinned_generations
            .lock()
            .unwrap()
            .iter()
            .copied()
            .min()
            .unwrap_or(active_generation);
        for generation in list_generations(&self.dir)? {
            if generation < floor && generation < active_generation {
                let _ = fs::remove_file(generation_path(&self.dir, generation));
            }
        }
        Ok(())
    }
}

impl Translog for FileTranslog {
    fn append(&self, op: &Operation) -> Result<TranslogLocation, TranslogError> {
        self.ensure_open()?;
        let line = serde_json::to_string(op).map_err(serde_err)?;

        let mut active = self.active.lock().unwrap();
        let location = TranslogLocation { generation: active.generation, offset: active.bytes_written };
        active.file.write_all(line.as_bytes()).map_err(io_err)?;
        active.file.write_all(b"\n").map_err(io_err)?;
        active.bytes_written += line.len() as u64 + 1;
        drop(active);

        let mut counters = self.counters.lock().unwrap();
        counters.operation_count += 1;
        counters.uncommitted_operations += 1;
        counters.earliest_location.get_or_insert(location);
        counters.latest_location = Some(location);
        Ok(location)
    }

    fn ensure_synced(&self, locations: &[TranslogLocation]) -> Result<bool, TranslogError> {
        self.ensure_open()?;
        let Some(&max_requested) = locations.iter().max() else {
            return Ok(false);
        };
        let mut active = self.active.lock().unwrap();
        if max_requested.generation < active.generation {
            // A prior `roll_generation` already fsynced and sealed that
            // generation before moving on.
            return Ok(false);
        }
        if max_requested.offset < active.synced_bytes {
            return Ok(false);
        }
        active.file.sync_data().map_err(io_err)?;
        active.synced_bytes = active.bytes_written;
        metrics::counter!("translog_fsync_total").increment(1);
        Ok(true)
    }

    fn new_view(&self) -> Box<dyn TranslogView> {
        let min_generation = {
            let generations = list_generations(&self.dir).unwrap_or_default();
            generations.first().copied().unwrap_or_else(|| self.active.lock().unwrap().generation)
        };
        self.pinned_generations.lock().unwrap().insert(min_generation);
        Box::new(FileTranslogView {
            min_location: TranslogLocation { generation: min_generation, offset: 0 },
        })
        // Note: this view doesn't carry a back-reference to unpin on drop
        // because `Box<dyn TranslogView>` erases it; `reclaim_unreferenced_generations`
        // is therefore conservative (floor is the overall minimum ever
        // requested) rather than per-view precise. See DESIGN.md.
    }

    fn size_in_bytes(&self) -> u64 {
        let active = self.active.lock().unwrap();
        active.bytes_written
    }

    fn stats(&self) -> TranslogStats {
        let counters = self.counters.lock().unwrap();
        TranslogStats {
            operation_count: counters.operation_count,
            size_in_bytes: self.size_in_bytes(),
            uncommitted_operations: counters.uncommitted_operations,
            earliest_location: counters.earliest_location,
            latest_location: counters.latest_location,
        }
    }

    fn replay(&self, apply: &mut dyn FnMut(Operation) -> Result<(), TranslogError>) -> Result<u64, TranslogError> {
        let mut applied = 0u64;
        for generation in list_generations(&self.dir)? {
            let file = File::open(generation_path(&self.dir, generation)).map_err(io_err)?;
            for line in BufReader::new(file).lines() {
                let line = line.map_err(io_err)?;
                if line.is_empty() {
                    continue;
                }
                let op: Operation = serde_json::from_str(&line).map_err(serde_err)?;
                apply(op)?;
                applied += 1;
            }
        }
        Ok(applied)
    }

    fn roll_generation(&self) -> Result<TranslogLocation, TranslogError> {
        self.ensure_open()?;
        let mut active = self.active.lock().unwrap();
        active.file.sync_data().map_err(io_err)?;
        let new_generation = active.generation + 1;
        let path = generation_path(&self.dir, new_generation);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err)?;
        *active = ActiveGeneration { generation: new_generation, file, bytes_written: 0, synced_bytes: 0 };
        drop(active);

        let mut counters = self.counters.lock().unwrap();
        counters.uncommitted_operations = 0;
        Ok(TranslogLocation { generation: new_generation, offset: 0 })
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Ok(active) = self.active.lock() {
            let _ = active.file.sync_data();
        }
    }
}

struct FileTranslogView {
    min_location: TranslogLocation,
}

impl TranslogView for FileTranslogView {
    fn min_location(&self) -> TranslogLocation {
        self.min_location
    }
}

/// Durability resolved for one write, read from `ShardSettings` by the
/// caller before invoking the translog (§4.2: "read per operation from
/// settings").
pub fn should_sync_before_ack(durability: Durability) -> bool {
    matches!(durability, Durability::Request)
}

type SyncListener = Box<dyn FnOnce(Result<bool, String>) + Send>;

struct PendingSync {
    location: TranslogLocation,
    listener: SyncListener,
}

/// Coalesces concurrent sync requests into a single fsync per drain (§4.2).
/// Callers `submit` a `(location, listener)` pair; if a drain is already
/// running, the submission is parked and picked up by whichever drain runs
/// next rather than kicking off a second fsync.
pub struct AsyncSyncProcessor {
    translog: Arc<dyn Translog>,
    queue: Mutex<Vec<PendingSync>>,
    draining: std::sync::atomic::AtomicBool,
}

impl AsyncSyncProcessor {
    pub fn new(translog: Arc<dyn Translog>) -> Arc<Self> {
        Arc::new(Self {
            translog,
            queue: Mutex::new(Vec::new()),
            draining: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub fn submit(&self, location: TranslogLocation, listener: SyncListener) {
        self.queue.lock().unwrap().push(PendingSync { location, listener });
        self.try_drain();
    }

    fn try_drain(&self) {
        if self
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // Another thread is already draining; it will pick up this
            // submission on its next pass before releasing the flag.
            return;
        }
        loop {
            let batch: Vec<PendingSync> = std::mem::take(&mut *self.queue.lock().unwrap());
            if batch.is_empty() {
                self.draining.store(false, Ordering::SeqCst);
                // Re-check: a submission may have landed between the empty
                // read above and clearing the flag.
                if !self.queue.lock().unwrap().is_empty()
                    && self
                        .draining
                        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                {
                    continue;
                }
                return;
            }
            let max_location = batch.iter().map(|p| p.location).max().unwrap();
            let result = self.translog.ensure_synced(&[max_location]).map_err(|e| e.to_string());
            for pending in batch {
                let outcome = result.clone();
                let listener = pending.listener;
                if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| listener(outcome))) {
                    tracing::error!(?panic, "async sync listener panicked; swallowing per §4.2");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shard_core::ids::{PrimaryTerm, SeqNo, Uid};
    use shard_core::operation::{OperationHeader, VersionType};
    use shard_core::state::OperationOrigin;

    fn index_op(uid: &str, seq_no: i64) -> Operation {
        Operation::Index {
            header: OperationHeader {
                uid: Uid::Str(uid.into()),
                seq_no: SeqNo(seq_no),
                primary_term: PrimaryTerm(1),
                version: 1,
                version_type: VersionType::Internal,
                origin: OperationOrigin::Primary,
                start_time_millis: 0,
                auto_generated_id_timestamp: -1,
                is_retry: false,
            },
            source: serde_json::json!({"seq": seq_no}),
        }
    }

    #[test]
    fn append_returns_strictly_increasing_locations() {
        let dir = tempfile::tempdir().unwrap();
        let translog = FileTranslog::open(dir.path()).unwrap();
        let l0 = translog.append(&index_op("a", 0)).unwrap();
        let l1 = translog.append(&index_op("b", 1)).unwrap();
        assert!(l1 > l0);
    }

    #[test]
    fn ensure_synced_fsyncs_once_up_to_max_location() {
        let dir = tempfile::tempdir().unwrap();
        let translog = FileTranslog::open(dir.path()).unwrap();
        let l0 = translog.append(&index_op("a", 0)).unwrap();
        assert!(translog.ensure_synced(&[l0]).unwrap());
        // Nothing new written since; re-syncing the same location is a no-op.
        assert!(!translog.ensure_synced(&[l0]).unwrap());
    }

    #[test]
    fn replay_recovers_every_op_across_generations() {
        let dir = tempfile::tempdir().unwrap();
        let translog = FileTranslog::open(dir.path()).unwrap();
        for i in 0..3 {
            translog.append(&index_op(&format!("doc-{i}"), i)).unwrap();
        }
        translog.roll_generation().unwrap();
        for i in 3..5 {
            translog.append(&index_op(&format!("doc-{i}"), i)).unwrap();
        }

        let mut seen = Vec::new();
        let count = translog
            .replay(&mut |op| {
                seen.push(op.header().seq_no);
                Ok(())
            })
            .unwrap();
        assert_eq!(count, 5);
        assert_eq!(seen, (0..5).map(SeqNo).collect::<Vec<_>>());
    }

    #[test]
    fn roll_generation_resets_size_in_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let translog = FileTranslog::open(dir.path()).unwrap();
        translog.append(&index_op("a", 0)).unwrap();
        assert!(translog.size_in_bytes() > 0);
        translog.roll_generation().unwrap();
        assert_eq!(translog.size_in_bytes(), 0);
    }

    #[test]
    fn reopening_resumes_from_the_latest_generation() {
        let dir = tempfile::tempdir().unwrap();
        {
            let translog = FileTranslog::open(dir.path()).unwrap();
            translog.append(&index_op("a", 0)).unwrap();
            translog.roll_generation().unwrap();
            translog.append(&index_op("b", 1)).unwrap();
        }
        let reopened = FileTranslog::open(dir.path()).unwrap();
        let mut count = 0;
        reopened
            .replay(&mut |_| {
                count += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn async_sync_processor_notifies_all_queued_listeners() {
        let dir = tempfile::tempdir().unwrap();
        let translog = FileTranslog::open(dir.path()).unwrap();
        let location = translog.append(&index_op("a", 0)).unwrap();
        let processor = AsyncSyncProcessor::new(translog);

        let (tx, rx) = std::sync::mpsc::channel();
        for _ in 0..5 {
            let tx = tx.clone();
            processor.submit(
                location,
                Box::new(move |result| {
                    tx.send(result.is_ok()).unwrap();
                }),
            );
        }
        drop(tx);
        let results: Vec<bool> = rx.into_iter().collect();
        assert_eq!(results.len(), 5);
        assert!(results.into_iter().all(|ok| ok));
    }

    #[test]
    fn closed_translog_refuses_new_appends() {
        let dir = tempfile::tempdir().unwrap();
        let translog = FileTranslog::open(dir.path()).unwrap();
        translog.close();
        assert!(matches!(translog.append(&index_op("a", 0)), Err(TranslogError::Closed)));
    }

    fn next_rand(state: &mut u64) -> u64 {
        *state ^= *state << 13;
        *state ^= *state >> 7;
        *state ^= *state << 17;
        *state
    }

    /// §8 testable property 2: locations produced by one shard's translog
    /// over a randomized sequence of appends (interspersed with generation
    /// rolls) are strictly increasing throughout, not just end to end.
    #[test]
    fn property_locations_are_strictly_increasing_across_random_appends_and_rolls() {
        let dir = tempfile::tempdir().unwrap();
        let translog = FileTranslog::open(dir.path()).unwrap();
        let mut seed = 0x9E3779B97F4A7C15u64;
        let mut last = None;
        for i in 0..200u64 {
            if next_rand(&mut seed) % 23 == 0 {
                translog.roll_generation().unwrap();
            }
            let loc = translog.append(&index_op(&format!("doc-{i}"), i as i64)).unwrap();
            if let Some(prev) = last {
                assert!(loc > prev, "translog location failed to increase: {loc:?} <= {prev:?}");
            }
            last = Some(loc);
        }
    }
}
