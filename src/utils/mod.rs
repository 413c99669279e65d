use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::errors::{BackupError, Result};

/// Suffix of archives still being written. A file carrying it is never a
/// valid backup.
pub const PARTIAL_SUFFIX: &str = ".partial";
pub const STAGING_PREFIX: &str = "restore-staging-";

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens the live dataset in WAL mode so backup readers see a stable
/// snapshot while the application keeps writing.
pub async fn open_live_pool(database_path: &Path) -> Result<SqlitePool> {
    let options = connect_options(database_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true);
    SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await
        .map_err(BackupError::from)
}

/// Staged datasets use a rollback journal so nothing but the main file is
/// left behind once the pool is closed.
pub async fn open_staging_pool(database_path: &Path) -> Result<SqlitePool> {
    let options = connect_options(database_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Delete)
        .foreign_keys(false);
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .map_err(BackupError::from)
}

fn connect_options(database_path: &Path) -> SqliteConnectOptions {
    SqliteConnectOptions::new()
        .filename(database_path)
        .busy_timeout(BUSY_TIMEOUT)
}

/// Quotes an SQLite identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Makes a preceding rename or create inside `dir` durable.
pub fn fsync_dir(dir: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        File::open(dir)?.sync_all()
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
        Ok(())
    }
}

/// Removes a file, treating "already gone" as success. Returns the bytes
/// freed.
pub fn remove_file_if_exists(path: &Path) -> io::Result<u64> {
    let size = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    match fs::remove_file(path) {
        Ok(()) => Ok(size),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e),
    }
}

/// SQLite side files of a database in WAL mode.
pub fn sidecar_paths(database_path: &Path) -> [PathBuf; 2] {
    let base = database_path.as_os_str().to_owned();
    let mut wal = base.clone();
    wal.push("-wal");
    let mut shm = base;
    shm.push("-shm");
    [PathBuf::from(wal), PathBuf::from(shm)]
}

/// Size and modification time of the database file and its WAL, as one
/// comparable string. Any committed write changes it. `None` when the
/// database file cannot be read.
pub fn dataset_signature(database_path: &Path) -> Option<String> {
    let stamp = |path: &Path| -> Option<String> {
        let meta = fs::metadata(path).ok()?;
        let modified = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        Some(format!("{}@{}", meta.len(), modified))
    };
    let main = stamp(database_path)?;
    let [wal, _] = sidecar_paths(database_path);
    let wal = stamp(&wal).unwrap_or_else(|| "-".to_string());
    Some(format!("{}/{}", main, wal))
}

/// Deletes leftovers of a process that died mid-operation: `*.partial`
/// archives and `restore-staging-*` directories directly inside `dirs`.
/// Returns how many entries were removed.
pub fn scrub_orphans(dirs: &[&Path]) -> usize {
    let mut removed = 0;
    for dir in dirs {
        if !dir.is_dir() {
            continue;
        }
        let entries = WalkDir::new(dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("Skipping unreadable entry in {}: {}", dir.display(), e);
                    None
                }
            });

        for entry in entries {
            let name = entry.file_name().to_string_lossy();
            let path = entry.path();
            let result = if entry.file_type().is_file() && name.ends_with(PARTIAL_SUFFIX) {
                fs::remove_file(path)
            } else if entry.file_type().is_dir() && name.starts_with(STAGING_PREFIX) {
                fs::remove_dir_all(path)
            } else {
                continue;
            };
            match result {
                Ok(()) => {
                    info!(path = %path.display(), "Removed orphaned artifact");
                    removed += 1;
                }
                Err(e) => warn!(path = %path.display(), "Failed to remove orphaned artifact: {}", e),
            }
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident_doubles_quotes() {
        assert_eq!(quote_ident("sales"), "\"sales\"");
        assert_eq!(quote_ident("odd\"name"), "\"odd\"\"name\"");
    }

    #[test]
    fn test_sidecar_paths() {
        let [wal, shm] = sidecar_paths(Path::new("/data/farm.db"));
        assert_eq!(wal, PathBuf::from("/data/farm.db-wal"));
        assert_eq!(shm, PathBuf::from("/data/farm.db-shm"));
    }

    #[test]
    fn test_dataset_signature_follows_writes() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let db = dir.path().join("farm.db");
        assert_eq!(dataset_signature(&db), None);

        fs::write(&db, b"page")?;
        let first = dataset_signature(&db);
        assert!(first.is_some());
        assert_eq!(dataset_signature(&db), first);

        fs::write(dir.path().join("farm.db-wal"), b"frame")?;
        assert_ne!(dataset_signature(&db), first);
        Ok(())
    }

    #[test]
    fn test_remove_file_if_exists_reports_size() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("a.jsonl");
        fs::write(&path, b"12345")?;
        assert_eq!(remove_file_if_exists(&path)?, 5);
        assert_eq!(remove_file_if_exists(&path)?, 0);
        Ok(())
    }

    #[test]
    fn test_scrub_orphans_removes_only_leftovers() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join(".manual_full_x.jsonl.abc.partial"), b"half")?;
        fs::write(dir.path().join("manual_full_x.jsonl"), b"done")?;
        fs::create_dir(dir.path().join("restore-staging-abc"))?;
        fs::write(dir.path().join("restore-staging-abc").join("farm.db"), b"x")?;
        fs::create_dir(dir.path().join("keep"))?;

        assert_eq!(scrub_orphans(&[dir.path()]), 2);
        assert!(dir.path().join("manual_full_x.jsonl").exists());
        assert!(dir.path().join("keep").exists());
        assert!(!dir.path().join("restore-staging-abc").exists());
        Ok(())
    }
}
