//! Process-level warehouse locking.
//!
//! DuckDB only allows one writer process per database file, and the loader
//! toggles fact-table indexes off during bulk loads on the assumption that
//! nothing else writes meanwhile. The exclusive lock taken here turns that
//! assumption into a checked precondition.
//!
//! Uses the `fs2` crate for cross-platform file locking (MSRV 1.75 compatible).

use chrono::Utc;
use fs2::FileExt;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors from lock operations.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Database is locked by another process: {0}")]
    Locked(PathBuf),

    #[error("Failed to create lock file: {0}")]
    CreateFailed(#[source] io::Error),

    #[error("Failed to acquire lock: {0}")]
    AcquireFailed(#[source] io::Error),
}

/// Holds an exclusive lock on a database file until dropped.
pub struct DbLockGuard {
    _file: File,
    lock_path: PathBuf,
    sidecar_path: Option<PathBuf>,
}

impl DbLockGuard {
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }
}

impl std::fmt::Debug for DbLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbLockGuard")
            .field("lock_path", &self.lock_path)
            .finish()
    }
}

impl Drop for DbLockGuard {
    fn drop(&mut self) {
        debug!("Releasing database lock: {}", self.lock_path.display());
        if let Some(path) = &self.sidecar_path {
            if let Err(e) = fs::remove_file(path) {
                debug!("Failed to remove lock sidecar {}: {}", path.display(), e);
            }
        }
        // flock is released when the file handle closes
    }
}

/// Who holds the lock, for operators looking at a stuck `.lock` file.
#[derive(Serialize)]
struct LockSidecar {
    pid: u32,
    exe: Option<String>,
    timestamp: String,
}

fn sidecar_path_for(lock_path: &Path) -> PathBuf {
    let ext = lock_path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("lock");
    lock_path.with_extension(format!("{ext}.json"))
}

fn write_lock_sidecar(lock_path: &Path) -> Option<PathBuf> {
    let sidecar = LockSidecar {
        pid: std::process::id(),
        exe: std::env::current_exe().ok().map(|p| p.display().to_string()),
        timestamp: Utc::now().to_rfc3339(),
    };
    let sidecar_path = sidecar_path_for(lock_path);
    match serde_json::to_vec_pretty(&sidecar)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
        .and_then(|payload| fs::write(&sidecar_path, payload))
    {
        Ok(()) => Some(sidecar_path),
        Err(e) => {
            warn!(
                "Failed to write lock sidecar {}: {}",
                sidecar_path.display(),
                e
            );
            None
        }
    }
}

/// Get the lock file path for a database path.
///
/// - `/data/warehouse.duckdb` → `/data/warehouse.duckdb.lock`
/// - `/data/warehouse` → `/data/warehouse.lock`
pub fn lock_path_for(db_path: &Path) -> PathBuf {
    let mut lock_path = db_path.to_path_buf();
    match lock_path.extension() {
        Some(ext) => {
            let new_ext = format!("{}.lock", ext.to_string_lossy());
            lock_path.set_extension(new_ext);
        }
        None => {
            lock_path.set_extension("lock");
        }
    }
    lock_path
}

/// Try to acquire an exclusive lock on a database file without blocking.
///
/// Returns `Err(LockError::Locked)` immediately if another handle holds it.
pub fn try_lock_exclusive(db_path: &Path) -> Result<DbLockGuard, LockError> {
    let lock_path = lock_path_for(db_path);

    debug!("Attempting to acquire exclusive lock: {}", lock_path.display());

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(LockError::CreateFailed)?;

    // Fully qualified: std's File::try_lock_exclusive (1.89+) has a different error type
    match FileExt::try_lock_exclusive(&file) {
        Ok(()) => {
            info!("Acquired exclusive database lock: {}", lock_path.display());
            let sidecar_path = write_lock_sidecar(&lock_path);
            Ok(DbLockGuard {
                _file: file,
                lock_path,
                sidecar_path,
            })
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            debug!("Database is locked by another process");
            Err(LockError::Locked(db_path.to_path_buf()))
        }
        Err(e) => Err(LockError::AcquireFailed(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lock_path_for() {
        assert_eq!(
            lock_path_for(Path::new("/data/warehouse.duckdb")),
            PathBuf::from("/data/warehouse.duckdb.lock")
        );
        assert_eq!(
            lock_path_for(Path::new("/data/warehouse")),
            PathBuf::from("/data/warehouse.lock")
        );
    }

    #[test]
    fn test_lock_released_on_drop() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("warehouse.duckdb");

        let guard = try_lock_exclusive(&db_path).unwrap();
        assert!(guard.lock_path().exists());
        let sidecar = sidecar_path_for(guard.lock_path());
        assert!(sidecar.exists());
        drop(guard);
        assert!(!sidecar.exists());

        let _again = try_lock_exclusive(&db_path).unwrap();
    }

    #[test]
    fn test_lock_contention() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("warehouse.duckdb");

        let _guard = try_lock_exclusive(&db_path).unwrap();
        let result = try_lock_exclusive(&db_path);
        assert!(matches!(result, Err(LockError::Locked(_))));
    }
}
