//! Persisted list of completed backups and the last-backup status.
//!
//! Lives in its own JSON file, outside the dataset it describes, so a restore
//! of the primary data never rewrites the backup history. Every change is
//! written to a temp file and renamed over the previous catalog.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tempfile::NamedTempFile;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::backup::BackupMode;
use crate::errors::{BackupError, IoContext, Result};
use crate::utils::fsync_dir;

const CATALOG_VERSION: u32 = 1;

/// A completed, verified archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: Uuid,
    pub filename: String,
    pub path: PathBuf,
    pub is_auto: bool,
    pub size_bytes: u64,
    /// Epoch seconds.
    pub created_at: i64,
    pub mode: BackupMode,
    pub compressed: bool,
    pub row_count: u64,
    /// Hex SHA-256 from the archive trailer.
    pub checksum: String,
    #[serde(default)]
    pub external_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackupStatus {
    /// Epoch seconds of the last successful backup.
    pub last_backup_at: Option<i64>,
    pub is_auto_enabled: bool,
    /// Snapshot start of the last successful backup; the next incremental
    /// backup exports rows changed after it.
    pub change_marker: Option<i64>,
    pub last_mode: Option<BackupMode>,
    /// Size and modification stamp of the dataset files when the last
    /// automatic backup ran. Automatic backups are skipped while it matches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_signature: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CatalogFile {
    version: u32,
    #[serde(default)]
    records: Vec<BackupRecord>,
    #[serde(default)]
    status: BackupStatus,
    #[serde(default)]
    external_backup_path: Option<PathBuf>,
}

pub struct Catalog {
    path: PathBuf,
    state: Mutex<CatalogFile>,
}

fn lock(state: &Mutex<CatalogFile>) -> MutexGuard<'_, CatalogFile> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            error!("Catalog mutex poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

impl Catalog {
    /// Loads the catalog at `path`, or creates it with the given initial
    /// settings. Records whose archive file no longer exists are dropped.
    pub fn open(path: &Path, auto_enabled: bool, external_path: Option<PathBuf>) -> Result<Self> {
        let file = if path.exists() {
            let content = fs::read_to_string(path)
                .io_context(|| format!("Failed to read catalog at {}", path.display()))?;
            let parsed: CatalogFile = serde_json::from_str(&content).map_err(|e| {
                BackupError::Config(format!("Catalog at {} is unreadable: {}", path.display(), e))
            })?;
            if parsed.version > CATALOG_VERSION {
                return Err(BackupError::Config(format!(
                    "Catalog at {} has unsupported version {}",
                    path.display(),
                    parsed.version
                )));
            }
            parsed
        } else {
            info!(path = %path.display(), "Creating new backup catalog");
            CatalogFile {
                version: CATALOG_VERSION,
                records: Vec::new(),
                status: BackupStatus {
                    is_auto_enabled: auto_enabled,
                    ..BackupStatus::default()
                },
                external_backup_path: external_path,
            }
        };

        let catalog = Self {
            path: path.to_path_buf(),
            state: Mutex::new(file),
        };
        let dropped = catalog.mutate(|file| {
            let before = file.records.len();
            file.records.retain(|r| {
                let present = r.path.exists();
                if !present {
                    warn!(filename = %r.filename, "Dropping catalog entry whose archive is missing");
                }
                present
            });
            before - file.records.len()
        })?;
        if dropped > 0 {
            info!(dropped, "Pruned catalog entries with missing archives");
        }
        Ok(catalog)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Newest first.
    pub fn list(&self) -> Vec<BackupRecord> {
        let mut records = lock(&self.state).records.clone();
        records.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.filename.cmp(&a.filename))
        });
        records
    }

    pub fn find(&self, filename: &str) -> Option<BackupRecord> {
        lock(&self.state)
            .records
            .iter()
            .find(|r| r.filename == filename)
            .cloned()
    }

    pub fn status(&self) -> BackupStatus {
        lock(&self.state).status.clone()
    }

    pub fn external_path(&self) -> Option<PathBuf> {
        lock(&self.state).external_backup_path.clone()
    }

    pub fn set_external_path(&self, path: Option<PathBuf>) -> Result<()> {
        self.mutate(|file| file.external_backup_path = path)
    }

    pub fn set_auto_enabled(&self, enabled: bool) -> Result<()> {
        self.mutate(|file| file.status.is_auto_enabled = enabled)
    }

    /// Adds a completed backup and advances the status in one write.
    pub fn record_backup(&self, record: BackupRecord, change_marker: i64) -> Result<()> {
        self.mutate(|file| {
            file.status.last_backup_at = Some(record.created_at);
            file.status.change_marker = Some(change_marker);
            file.status.last_mode = Some(record.mode);
            file.records.push(record);
        })
    }

    /// Forgets the snapshot boundary so the next incremental backup runs as
    /// a full one. Used when the dataset is replaced by a restore.
    pub fn clear_change_marker(&self) -> Result<()> {
        self.mutate(|file| {
            file.status.change_marker = None;
            file.status.data_signature = None;
        })
    }

    pub fn set_data_signature(&self, signature: Option<String>) -> Result<()> {
        self.mutate(|file| file.status.data_signature = signature)
    }

    pub fn remove(&self, ids: &[Uuid]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.mutate(|file| file.records.retain(|r| !ids.contains(&r.id)))
    }

    /// Applies `f` to a copy of the catalog, persists it, then publishes it.
    /// A failed write leaves the in-memory state untouched.
    fn mutate<R>(&self, f: impl FnOnce(&mut CatalogFile) -> R) -> Result<R> {
        let mut state = lock(&self.state);
        let mut next = state.clone();
        let result = f(&mut next);
        self.write(&next)?;
        *state = next;
        Ok(result)
    }

    fn write(&self, file: &CatalogFile) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)
            .io_context(|| format!("Failed to create catalog directory {}", dir.display()))?;

        let mut tmp = NamedTempFile::new_in(&dir)
            .io_context(|| format!("Failed to create temp catalog in {}", dir.display()))?;
        let json = serde_json::to_vec_pretty(file)
            .map_err(std::io::Error::from)
            .io_context(|| "Failed to serialize catalog")?;
        tmp.write_all(&json)
            .io_context(|| "Failed to write catalog")?;
        tmp.as_file()
            .sync_all()
            .io_context(|| "Failed to sync catalog")?;
        tmp.persist(&self.path)
            .map_err(|e| e.error)
            .io_context(|| format!("Failed to replace catalog at {}", self.path.display()))?;
        fsync_dir(&dir).io_context(|| format!("Failed to sync directory {}", dir.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::record;

    #[test]
    fn test_records_survive_reopen_newest_first() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("catalog.json");

        let catalog = Catalog::open(&path, true, None)?;
        catalog.record_backup(record(dir.path(), "a.jsonl", 100), 90)?;
        catalog.record_backup(record(dir.path(), "c.jsonl", 300), 290)?;
        catalog.record_backup(record(dir.path(), "b.jsonl", 200), 190)?;
        drop(catalog);

        let reopened = Catalog::open(&path, false, None)?;
        let names: Vec<String> = reopened.list().into_iter().map(|r| r.filename).collect();
        assert_eq!(names, vec!["c.jsonl", "b.jsonl", "a.jsonl"]);

        let status = reopened.status();
        // The persisted flag wins over the value passed on reopen.
        assert!(status.is_auto_enabled);
        assert_eq!(status.last_backup_at, Some(200));
        assert_eq!(status.change_marker, Some(190));
        assert_eq!(status.last_mode, Some(BackupMode::Full));
        Ok(())
    }

    #[test]
    fn test_settings_are_persisted() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("state").join("catalog.json");

        let catalog = Catalog::open(&path, true, Some(PathBuf::from("/mnt/usb")))?;
        assert_eq!(catalog.external_path(), Some(PathBuf::from("/mnt/usb")));
        catalog.set_external_path(None)?;
        catalog.set_auto_enabled(false)?;
        drop(catalog);

        let reopened = Catalog::open(&path, true, Some(PathBuf::from("/elsewhere")))?;
        assert_eq!(reopened.external_path(), None);
        assert!(!reopened.status().is_auto_enabled);
        Ok(())
    }

    #[test]
    fn test_missing_archives_are_pruned_on_open() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("catalog.json");

        let catalog = Catalog::open(&path, true, None)?;
        let kept = record(dir.path(), "kept.jsonl", 100);
        let gone = record(dir.path(), "gone.jsonl", 200);
        catalog.record_backup(kept, 90)?;
        catalog.record_backup(gone.clone(), 190)?;
        fs::remove_file(&gone.path)?;
        drop(catalog);

        let reopened = Catalog::open(&path, true, None)?;
        assert!(reopened.find("gone.jsonl").is_none());
        assert!(reopened.find("kept.jsonl").is_some());
        Ok(())
    }

    #[test]
    fn test_cleared_marker_and_signature_are_persisted() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("catalog.json");

        let catalog = Catalog::open(&path, true, None)?;
        catalog.record_backup(record(dir.path(), "a.jsonl", 100), 90)?;
        catalog.set_data_signature(Some("4096:17".to_string()))?;
        assert_eq!(catalog.status().data_signature.as_deref(), Some("4096:17"));

        catalog.clear_change_marker()?;
        drop(catalog);

        let status = Catalog::open(&path, true, None)?.status();
        assert_eq!(status.change_marker, None);
        assert_eq!(status.data_signature, None);
        assert_eq!(status.last_backup_at, Some(100));
        Ok(())
    }

    #[test]
    fn test_corrupt_catalog_is_a_config_error() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("catalog.json");
        fs::write(&path, "{ not json")?;
        let err = Catalog::open(&path, true, None).err().unwrap();
        assert_eq!(err.kind(), crate::errors::ErrorKind::Config);
        Ok(())
    }
}
