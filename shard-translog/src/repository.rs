//! The `Repository` port consumed by snapshot recovery (§4.8 `SNAPSHOT`
//! source): an opaque place to push/pull a directory tree of engine
//! commit files. `LocalRepository` is the one concrete, filesystem-backed
//! implementation this workspace ships.

use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot not found: {0}")]
    NotFound(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),
}

/// Restores and captures point-in-time snapshots of a shard's on-disk
/// state. The shard's own store/engine decide *what* bytes go into a
/// snapshot; `Repository` only moves the resulting directory tree.
pub trait Repository: Send + Sync {
    /// Captures `source_dir` under `snapshot_id`, replacing any prior
    /// snapshot with the same id.
    fn snapshot(&self, snapshot_id: &str, source_dir: &Path) -> Result<(), RepositoryError>;

    /// Restores `snapshot_id` into `target_dir`, replacing its contents.
    fn restore(&self, snapshot_id: &str, target_dir: &Path) -> Result<(), RepositoryError>;

    fn exists(&self, snapshot_id: &str) -> Result<bool, RepositoryError>;

    fn delete(&self, snapshot_id: &str) -> Result<(), RepositoryError>;
}

/// Filesystem-backed `Repository`: each snapshot is a directory under
/// `root` named after its snapshot id.
#[derive(Debug, Clone)]
pub struct LocalRepository {
    root: PathBuf,
}

impl LocalRepository {
    pub fn new(root: impl AsRef<Path>) -> Result<Self, RepositoryError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn snapshot_dir(&self, snapshot_id: &str) -> PathBuf {
        self.root.join(snapshot_id)
    }

    fn copy_dir_recursively(src: &Path, dst: &Path) -> Result<(), RepositoryError> {
        fs::create_dir_all(dst)?;
        for entry in WalkDir::new(src) {
            let entry = entry.map_err(|e| RepositoryError::InvalidPath(e.to_string()))?;
            let relative = entry
                .path()
                .strip_prefix(src)
                .map_err(|e| RepositoryError::InvalidPath(e.to_string()))?;
            let dest_path = dst.join(relative);
            if entry.file_type().is_dir() {
                fs::create_dir_all(&dest_path)?;
            } else {
                if let Some(parent) = dest_path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::copy(entry.path(), &dest_path)?;
            }
        }
        Ok(())
    }
}

impl Repository for LocalRepository {
    fn snapshot(&self, snapshot_id: &str, source_dir: &Path) -> Result<(), RepositoryError> {
        let dest = self.snapshot_dir(snapshot_id);
        if dest.exists() {
            fs::remove_dir_all(&dest)?;
        }
        Self::copy_dir_recursively(source_dir, &dest)?;
        Ok(())
    }

    fn restore(&self, snapshot_id: &str, target_dir: &Path) -> Result<(), RepositoryError> {
        let src = self.snapshot_dir(snapshot_id);
        if !src.exists() {
            return Err(RepositoryError::NotFound(snapshot_id.to_string()));
        }
        if target_dir.exists() {
            fs::remove_dir_all(target_dir)?;
        }
        Self::copy_dir_recursively(&src, target_dir)?;
        Ok(())
    }

    fn exists(&self, snapshot_id: &str) -> Result<bool, RepositoryError> {
        Ok(self.snapshot_dir(snapshot_id).exists())
    }

    fn delete(&self, snapshot_id: &str) -> Result<(), RepositoryError> {
        let path = self.snapshot_dir(snapshot_id);
        if path.exists() {
            fs::remove_dir_all(&path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn snapshot_then_restore_round_trips_a_directory_tree() {
        let repo_dir = tempfile::tempdir().unwrap();
        let source_dir = tempfile::tempdir().unwrap();
        fs::write(source_dir.path().join("segment.dat"), b"engine bytes").unwrap();
        fs::create_dir_all(source_dir.path().join("sub")).unwrap();
        fs::write(source_dir.path().join("sub/translog.tlog"), b"wal bytes").unwrap();

        let repo = LocalRepository::new(repo_dir.path()).unwrap();
        repo.snapshot("snap-1", source_dir.path()).unwrap();
        assert!(repo.exists("snap-1").unwrap());

        let restore_dir = tempfile::tempdir().unwrap();
        repo.restore("snap-1", restore_dir.path()).unwrap();
        assert_eq!(fs::read(restore_dir.path().join("segment.dat")).unwrap(), b"engine bytes");
        assert_eq!(fs::read(restore_dir.path().join("sub/translog.tlog")).unwrap(), b"wal bytes");
    }

    #[test]
    fn restore_of_unknown_snapshot_fails() {
        let repo_dir = tempfile::tempdir().unwrap();
        let repo = LocalRepository::new(repo_dir.path()).unwrap();
        let restore_dir = tempfile::tempdir().unwrap();
        assert!(matches!(repo.restore("missing", restore_dir.path()), Err(RepositoryError::NotFound(_))));
    }

    #[test]
    fn delete_removes_a_snapshot() {
        let repo_dir = tempfile::tempdir().unwrap();
        let source_dir = tempfile::tempdir().unwrap();
        fs::write(source_dir.path().join("f"), b"x").unwrap();
        let repo = LocalRepository::new(repo_dir.path()).unwrap();
        repo.snapshot("snap-1", source_dir.path()).unwrap();
        repo.delete("snap-1").unwrap();
        assert!(!repo.exists("snap-1").unwrap());
    }
}
