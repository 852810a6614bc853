//! Shard-level settings (§2 ambient config concern). Loaded the way the
//! teacher's cluster config loads: plain `serde` over JSON, with a
//! sensible in-code default.

use crate::translog::Durability;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("io error reading settings: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid settings json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardSettings {
    pub durability: Durability,
    /// Translog size, in bytes, past which `should_flush` returns true.
    pub flush_threshold_size_bytes: u64,
    /// Wall-clock deadline for a relocation hand-off before the shard fails.
    pub relocation_handoff_timeout: Duration,
    /// Bound on update-conflict retries (§4.4 step 4).
    pub retry_on_conflict: u32,
    /// `now - last_write >= this` before `checkIdle` fires `onShardInactive`.
    pub inactive_threshold: Duration,
    /// `waitForActiveShards` default when a write doesn't specify one.
    pub default_wait_for_active_shards: usize,
}

impl Default for ShardSettings {
    fn default() -> Self {
        Self {
            durability: Durability::Request,
            flush_threshold_size_bytes: 512 * 1024 * 1024,
            relocation_handoff_timeout: Duration::from_secs(30 * 60),
            retry_on_conflict: 0,
            inactive_threshold: Duration::from_secs(5 * 60),
            default_wait_for_active_shards: 1,
        }
    }
}

impl ShardSettings {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn to_path(&self, path: impl AsRef<Path>) -> Result<(), SettingsError> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shard_settings.json");
        let settings = ShardSettings { retry_on_conflict: 3, ..Default::default() };
        settings.to_path(&path).unwrap();
        let loaded = ShardSettings::from_path(&path).unwrap();
        assert_eq!(loaded.retry_on_conflict, 3);
    }
}
