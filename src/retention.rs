//! Pruning of catalogued backups: by age, and by count for automatic ones.

use serde::Serialize;
use std::path::Path;
use tracing::{info, warn};
use uuid::Uuid;

use crate::catalog::{BackupRecord, Catalog};
use crate::errors::{IoContext, Result};
use crate::utils::remove_file_if_exists;

pub const SECONDS_PER_DAY: i64 = 86_400;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub deleted_count: u32,
    pub freed_bytes: u64,
}

/// Records strictly older than `now - retention_days`, never including the
/// most recent backup.
pub fn plan_cleanup(records: &[BackupRecord], retention_days: u32, now: i64) -> Vec<BackupRecord> {
    let cutoff = now - i64::from(retention_days) * SECONDS_PER_DAY;
    let newest = records
        .iter()
        .max_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.filename.cmp(&b.filename))
        })
        .map(|r| r.id);

    records
        .iter()
        .filter(|r| r.created_at < cutoff && Some(r.id) != newest)
        .cloned()
        .collect()
}

/// Automatic backups beyond the `max_auto` newest. Manual backups are never
/// selected. `max_auto == 0` keeps everything.
pub fn plan_auto_cap(records: &[BackupRecord], max_auto: u32) -> Vec<BackupRecord> {
    if max_auto == 0 {
        return Vec::new();
    }
    let mut auto: Vec<&BackupRecord> = records.iter().filter(|r| r.is_auto).collect();
    auto.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.filename.cmp(&a.filename))
    });
    auto.into_iter()
        .skip(max_auto as usize)
        .cloned()
        .collect()
}

/// Deletes the archive and its external copy. Returns the bytes freed.
pub fn remove_backup_files(record: &BackupRecord) -> Result<u64> {
    let mut freed = remove_archive(&record.path)?;
    if let Some(external) = record.external_path.as_deref() {
        freed += remove_archive(external)?;
    }
    Ok(freed)
}

fn remove_archive(path: &Path) -> Result<u64> {
    remove_file_if_exists(path)
        .io_context(|| format!("Failed to delete backup file {}", path.display()))
}

/// Applies the retention policy at time `now` (epoch seconds). Files that
/// cannot be deleted keep their catalog entry and are retried next time.
pub fn apply_cleanup(catalog: &Catalog, retention_days: u32, now: i64) -> Result<CleanupReport> {
    let doomed = plan_cleanup(&catalog.list(), retention_days, now);
    let report = delete_records(catalog, &doomed, "expired")?;
    info!(
        retention_days,
        deleted = report.deleted_count,
        freed_bytes = report.freed_bytes,
        "Retention cleanup finished"
    );
    Ok(report)
}

/// Keeps at most `max_auto` automatic backups.
pub fn apply_auto_cap(catalog: &Catalog, max_auto: u32) -> Result<CleanupReport> {
    let doomed = plan_auto_cap(&catalog.list(), max_auto);
    if doomed.is_empty() {
        return Ok(CleanupReport::default());
    }
    let report = delete_records(catalog, &doomed, "surplus automatic")?;
    info!(max_auto, deleted = report.deleted_count, "Automatic backups capped");
    Ok(report)
}

fn delete_records(catalog: &Catalog, doomed: &[BackupRecord], reason: &str) -> Result<CleanupReport> {
    let mut report = CleanupReport::default();
    let mut removed: Vec<Uuid> = Vec::with_capacity(doomed.len());

    for record in doomed {
        match remove_backup_files(record) {
            Ok(freed) => {
                info!(filename = %record.filename, freed, "Deleted {} backup", reason);
                report.deleted_count += 1;
                report.freed_bytes += freed;
                removed.push(record.id);
            }
            Err(e) => warn!(filename = %record.filename, "Failed to delete {} backup: {}", reason, e),
        }
    }

    catalog.remove(&removed)?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::record;
    use std::fs;

    const NOW: i64 = 1_760_000_000;

    fn days_ago(days: i64) -> i64 {
        NOW - days * SECONDS_PER_DAY
    }

    #[test]
    fn test_cleanup_removes_exactly_expired_backups() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let catalog = Catalog::open(&dir.path().join("catalog.json"), true, None)?;
        for (name, age) in [("d10.jsonl", 10), ("d40.jsonl", 40), ("d95.jsonl", 95), ("d200.jsonl", 200)] {
            catalog.record_backup(record(dir.path(), name, days_ago(age)), days_ago(age))?;
        }

        let report = apply_cleanup(&catalog, 90, NOW)?;
        assert_eq!(report.deleted_count, 2);
        assert_eq!(report.freed_bytes, 14);
        assert!(!dir.path().join("d95.jsonl").exists());
        assert!(!dir.path().join("d200.jsonl").exists());

        let left: Vec<String> = catalog.list().into_iter().map(|r| r.filename).collect();
        assert_eq!(left, vec!["d10.jsonl", "d40.jsonl"]);

        // Second pass finds nothing to do.
        assert_eq!(apply_cleanup(&catalog, 90, NOW)?, CleanupReport::default());
        Ok(())
    }

    #[test]
    fn test_newest_backup_is_always_retained() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let records = vec![
            record(dir.path(), "old.jsonl", days_ago(400)),
            record(dir.path(), "older.jsonl", days_ago(500)),
        ];
        let planned = plan_cleanup(&records, 30, NOW);
        assert_eq!(planned.len(), 1);
        assert_eq!(planned[0].filename, "older.jsonl");
        Ok(())
    }

    #[test]
    fn test_cutoff_is_strict() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let records = vec![
            record(dir.path(), "newest.jsonl", NOW),
            record(dir.path(), "boundary.jsonl", days_ago(7)),
            record(dir.path(), "past.jsonl", days_ago(7) - 1),
        ];
        let planned = plan_cleanup(&records, 7, NOW);
        let names: Vec<&str> = planned.iter().map(|r| r.filename.as_str()).collect();
        assert_eq!(names, vec!["past.jsonl"]);
        Ok(())
    }

    #[test]
    fn test_auto_cap_keeps_newest_automatic_backups() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let catalog = Catalog::open(&dir.path().join("catalog.json"), true, None)?;
        for age in 1..=5 {
            let mut rec = record(dir.path(), &format!("auto_{age}.jsonl"), days_ago(age));
            rec.is_auto = true;
            catalog.record_backup(rec, days_ago(age))?;
        }
        catalog.record_backup(record(dir.path(), "manual_old.jsonl", days_ago(30)), days_ago(30))?;

        assert!(plan_auto_cap(&catalog.list(), 0).is_empty());

        let report = apply_auto_cap(&catalog, 3)?;
        assert_eq!(report.deleted_count, 2);
        assert!(!dir.path().join("auto_4.jsonl").exists());
        assert!(!dir.path().join("auto_5.jsonl").exists());

        let left: Vec<String> = catalog.list().into_iter().map(|r| r.filename).collect();
        assert_eq!(left, vec!["auto_1.jsonl", "auto_2.jsonl", "auto_3.jsonl", "manual_old.jsonl"]);
        assert_eq!(apply_auto_cap(&catalog, 3)?, CleanupReport::default());
        Ok(())
    }

    #[test]
    fn test_external_copy_is_deleted_too() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let external = tempfile::tempdir()?;
        let mut rec = record(dir.path(), "a.jsonl", days_ago(100));
        let copy = external.path().join("a.jsonl");
        fs::write(&copy, b"archive-copy")?;
        rec.external_path = Some(copy.clone());

        assert_eq!(remove_backup_files(&rec)?, 7 + 12);
        assert!(!copy.exists());
        assert!(!rec.path.exists());
        Ok(())
    }
}
