//! The logical `shard_state` file (§6): `{primary, index_uuid,
//! allocation_id}`, written atomically whenever primary-ness or allocation
//! changes. Everything else under the shard's data directory (engine
//! commits, translog generations) is opaque to the core and owned by
//! `SegmentEngine`/`Translog`.

use crate::ids::AllocationId;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardStateFile {
    pub primary: bool,
    pub index_uuid: String,
    pub allocation_id: AllocationId,
}

fn state_path(dir: &Path) -> PathBuf {
    dir.join("shard_state")
}

impl ShardStateFile {
    pub fn read(dir: impl AsRef<Path>) -> io::Result<Option<Self>> {
        let path = state_path(dir.as_ref());
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Writes to a temp file in the same directory, then renames it over
    /// the previous `shard_state`, so a crash mid-write never leaves a
    /// half-written file behind (§3 "shard-state persistence").
    pub fn write_atomically(&self, dir: impl AsRef<Path>) -> io::Result<()> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let tmp_path = dir.join("shard_state.tmp");
        let bytes = serde_json::to_vec_pretty(self).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(&tmp_path, bytes)?;
        fs::rename(&tmp_path, state_path(dir))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_atomic_write() {
        let dir = tempfile::tempdir().unwrap();
        let state = ShardStateFile {
            primary: true,
            index_uuid: "uuid-1".into(),
            allocation_id: AllocationId::new("alloc-0"),
        };
        state.write_atomically(dir.path()).unwrap();
        let loaded = ShardStateFile::read(dir.path()).unwrap().unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn missing_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ShardStateFile::read(dir.path()).unwrap().is_none());
    }

    #[test]
    fn overwrite_leaves_no_temp_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let state = ShardStateFile {
            primary: false,
            index_uuid: "uuid-1".into(),
            allocation_id: AllocationId::new("alloc-0"),
        };
        state.write_atomically(dir.path()).unwrap();
        let mut updated = state.clone();
        updated.primary = true;
        updated.write_atomically(dir.path()).unwrap();
        assert!(!dir.path().join("shard_state.tmp").exists());
        assert_eq!(ShardStateFile::read(dir.path()).unwrap().unwrap().primary, true);
    }
}
