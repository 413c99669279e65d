pub mod archive;
pub mod replicate;
pub mod snapshot;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::{BackupRecord, Catalog};
use crate::config::EngineConfig;
use crate::errors::{BackupError, IoContext, ReplicationWarning, Result};
use crate::progress::{OperationContext, OperationPhase};
use crate::utils::{fsync_dir, remove_file_if_exists, PARTIAL_SUFFIX};
use archive::{
    verify_archive_with, ArchiveHeader, ArchiveWriter, RowRecord, TableManifest, ARCHIVE_FORMAT,
    ARCHIVE_VERSION,
};
use snapshot::ChangeFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupMode {
    Full,
    Incremental,
}

impl BackupMode {
    fn file_tag(self) -> &'static str {
        match self {
            BackupMode::Full => "full",
            BackupMode::Incremental => "inc",
        }
    }
}

impl fmt::Display for BackupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupMode::Full => f.write_str("full"),
            BackupMode::Incremental => f.write_str("incremental"),
        }
    }
}

impl FromStr for BackupMode {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(BackupMode::Full),
            "incremental" | "inc" => Ok(BackupMode::Incremental),
            other => Err(BackupError::Config(format!(
                "Unknown backup mode '{}', expected 'full' or 'incremental'",
                other
            ))),
        }
    }
}

/// Who asked for the backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupTrigger {
    Manual,
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupRequest {
    pub mode: BackupMode,
    pub compress: bool,
    pub trigger: BackupTrigger,
}

impl BackupRequest {
    pub fn manual(mode: BackupMode, compress: bool) -> Self {
        Self {
            mode,
            compress,
            trigger: BackupTrigger::Manual,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupOutcome {
    pub operation_id: Uuid,
    pub requested_mode: BackupMode,
    /// `record.mode` differs from `requested_mode` when an incremental
    /// request fell back to a full backup.
    pub record: BackupRecord,
    pub warnings: Vec<ReplicationWarning>,
}

/// `{auto|manual}_{full|inc}_{YYYYMMDD_HHMMSS_mmm}.jsonl[.gz]`
pub fn archive_file_name(
    trigger: BackupTrigger,
    mode: BackupMode,
    compress: bool,
    at: DateTime<Utc>,
) -> String {
    let origin = match trigger {
        BackupTrigger::Manual => "manual",
        BackupTrigger::Auto => "auto",
    };
    format!(
        "{}_{}_{}.jsonl{}",
        origin,
        mode.file_tag(),
        at.format("%Y%m%d_%H%M%S_%3f"),
        if compress { ".gz" } else { "" }
    )
}

/// Lower bound for incremental exports: the previous snapshot start minus a
/// safety margin, in SQLite's `datetime('now')` format.
pub fn change_window_start(change_marker: i64, skew_secs: u64) -> Result<String> {
    let skew = i64::try_from(skew_secs).unwrap_or(i64::MAX);
    let since = DateTime::<Utc>::from_timestamp(change_marker.saturating_sub(skew), 0)
        .ok_or_else(|| BackupError::Internal(format!("invalid change marker {}", change_marker)))?;
    Ok(since.format("%Y-%m-%d %H:%M:%S").to_string())
}

struct TablePlan {
    table: snapshot::TableInfo,
    filter: Option<ChangeFilter>,
    rows: u64,
}

/// Produces one archive, verifies it, moves it into place, replicates it and
/// records it in the catalog.
pub(crate) async fn run_backup(
    pool: &SqlitePool,
    config: &EngineConfig,
    catalog: &Catalog,
    request: BackupRequest,
    ctx: &OperationContext,
) -> Result<BackupOutcome> {
    let reporter = ctx.reporter();
    ctx.checkpoint()?;

    let status = catalog.status();
    let (mode, since) = match (request.mode, status.change_marker) {
        (BackupMode::Incremental, Some(marker)) => (
            BackupMode::Incremental,
            Some(change_window_start(marker, config.incremental_skew_secs)?),
        ),
        (BackupMode::Incremental, None) => {
            info!(operation_id = %ctx.id, "No previous backup, running a full backup instead of incremental");
            (BackupMode::Full, None)
        }
        (BackupMode::Full, _) => (BackupMode::Full, None),
    };

    let started = Utc::now();
    let filename = archive_file_name(request.trigger, mode, request.compress, started);
    let final_path = config.backup_dir.join(&filename);
    fs::create_dir_all(&config.backup_dir).io_context(|| {
        format!("Failed to create backup directory: {}", config.backup_dir.display())
    })?;

    info!(
        operation_id = %ctx.id,
        %mode,
        compress = request.compress,
        file = %filename,
        "Starting backup"
    );

    reporter.phase(OperationPhase::Reading, "Reading table layout");
    // One read transaction for the whole export: WAL gives it a stable
    // snapshot while the application keeps writing.
    let mut tx = pool.begin().await?;
    let tables = snapshot::dependency_order(snapshot::list_tables(&mut tx).await?);
    let extra_schema = snapshot::list_extra_schema(&mut tx).await?;
    let sequences = snapshot::list_sequences(&mut tx).await?;

    let mut plan = Vec::with_capacity(tables.len());
    for table in tables {
        ctx.checkpoint()?;
        let filter = since
            .as_ref()
            .filter(|_| table.has_column(&config.change_column))
            .map(|since| ChangeFilter {
                column: config.change_column.clone(),
                since: since.clone(),
            });
        let rows = if table.derived {
            0
        } else {
            snapshot::count_rows(&mut tx, &table, filter.as_ref()).await?
        };
        plan.push(TablePlan { table, filter, rows });
    }
    let total_rows: u64 = plan.iter().map(|p| p.rows).sum();
    let table_count = plan.len() as u32;
    reporter.set_totals(total_rows, table_count);

    let header = ArchiveHeader {
        format: ARCHIVE_FORMAT.to_string(),
        version: ARCHIVE_VERSION,
        mode,
        created_at: started.timestamp(),
        since: since.clone(),
        tables: plan
            .iter()
            .map(|p| TableManifest {
                name: p.table.name.clone(),
                create_sql: p.table.create_sql.clone(),
                columns: p.table.columns.clone(),
                rows: p.rows,
                derived: p.table.derived,
                rebuild: p.table.rebuild.clone(),
            })
            .collect(),
        schema: extra_schema,
        sequences,
    };

    // Dropping `partial_path` on any early return deletes the temp file.
    let (file, partial_path) = tempfile::Builder::new()
        .prefix(&format!(".{}.", filename))
        .suffix(PARTIAL_SUFFIX)
        .tempfile_in(&config.backup_dir)
        .io_context(|| {
            format!("Failed to create archive file in {}", config.backup_dir.display())
        })?
        .into_parts();
    let mut writer = ArchiveWriter::new(file, request.compress);
    writer.write_header(&header)?;

    for (idx, p) in plan.iter().enumerate() {
        ctx.checkpoint()?;
        let position = idx as u32 + 1;
        reporter.enter_table(
            position,
            OperationPhase::Reading,
            format!("Reading {} ({}/{})", p.table.name, position, table_count),
        );

        let mut offset = 0u64;
        while offset < p.rows {
            let batch = snapshot::fetch_batch(
                &mut tx,
                &p.table,
                p.filter.as_ref(),
                config.batch_size,
                offset,
            )
            .await?;
            if batch.is_empty() {
                break;
            }
            let fetched = batch.len() as u64;
            reporter.phase(
                OperationPhase::Converting,
                format!("Converting {} ({}/{})", p.table.name, position, table_count),
            );
            for values in batch {
                writer.write_row(RowRecord {
                    table: p.table.name.clone(),
                    values,
                })?;
            }
            offset += fetched;
            reporter.advance(fetched);
            debug!(table = %p.table.name, rows = offset, "Batch written");
            ctx.checkpoint()?;
        }

        if offset != p.rows {
            return Err(BackupError::Internal(format!(
                "table {} yielded {} rows, {} were counted",
                p.table.name, offset, p.rows
            )));
        }
    }
    tx.rollback().await?;

    ctx.checkpoint()?;
    if request.compress {
        reporter.phase(OperationPhase::Compressing, "Compressing archive");
    } else {
        reporter.phase(OperationPhase::Finalizing, "Flushing archive");
    }
    let (file, written) = writer.finish()?;
    drop(file);
    ctx.checkpoint()?;

    reporter.phase(OperationPhase::Finalizing, "Verifying archive");
    let verified = verify_archive_with(&partial_path, |checked| {
        ctx.checkpoint()?;
        reporter.phase(
            OperationPhase::Finalizing,
            format!("Verifying archive ({} rows checked)", checked),
        );
        Ok(())
    })?;
    if verified.checksum != written.checksum || verified.rows != written.rows {
        return Err(BackupError::Validation(
            "written archive does not match its own trailer".to_string(),
        ));
    }

    partial_path
        .persist_noclobber(&final_path)
        .map_err(|e| e.error)
        .io_context(|| format!("Failed to move archive into place: {}", final_path.display()))?;

    let committed = commit_archive(config, catalog, &final_path, &filename, request, mode, &written, started);
    let (record, warnings) = match committed {
        Ok(done) => done,
        Err(e) => {
            if let Err(cleanup) = remove_file_if_exists(&final_path) {
                warn!(file = %final_path.display(), "Failed to remove uncatalogued archive: {}", cleanup);
            }
            return Err(e);
        }
    };

    info!(
        operation_id = %ctx.id,
        file = %record.filename,
        rows = record.row_count,
        size_bytes = record.size_bytes,
        "Backup completed"
    );
    reporter.complete(format!("Backup completed: {}", record.filename));

    Ok(BackupOutcome {
        operation_id: ctx.id,
        requested_mode: request.mode,
        record,
        warnings,
    })
}

#[allow(clippy::too_many_arguments)]
fn commit_archive(
    config: &EngineConfig,
    catalog: &Catalog,
    final_path: &Path,
    filename: &str,
    request: BackupRequest,
    mode: BackupMode,
    written: &archive::ArchiveSummary,
    started: DateTime<Utc>,
) -> Result<(BackupRecord, Vec<ReplicationWarning>)> {
    fsync_dir(&config.backup_dir).io_context(|| {
        format!("Failed to sync backup directory: {}", config.backup_dir.display())
    })?;
    let size_bytes = fs::metadata(final_path)
        .io_context(|| format!("Failed to stat archive: {}", final_path.display()))?
        .len();

    let mut warnings = Vec::new();
    let external_path = match catalog.external_path() {
        Some(dir) => match replicate::replicate_archive(final_path, &dir) {
            Ok(copy) => Some(copy),
            Err(warning) => {
                warnings.push(warning);
                None
            }
        },
        None => None,
    };

    let record = BackupRecord {
        id: Uuid::new_v4(),
        filename: filename.to_string(),
        path: final_path.to_path_buf(),
        is_auto: request.trigger == BackupTrigger::Auto,
        size_bytes,
        created_at: Utc::now().timestamp(),
        mode,
        compressed: request.compress,
        row_count: written.rows,
        checksum: written.checksum.clone(),
        external_path: external_path.clone(),
    };

    if let Err(e) = catalog.record_backup(record.clone(), started.timestamp()) {
        if let Some(copy) = external_path {
            if let Err(cleanup) = remove_file_if_exists(&copy) {
                warn!(file = %copy.display(), "Failed to remove uncatalogued external copy: {}", cleanup);
            }
        }
        return Err(e);
    }
    Ok((record, warnings))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_archive_file_names() {
        let at = Utc.with_ymd_and_hms(2025, 3, 9, 14, 5, 7).unwrap()
            + chrono::Duration::milliseconds(42);
        assert_eq!(
            archive_file_name(BackupTrigger::Manual, BackupMode::Full, false, at),
            "manual_full_20250309_140507_042.jsonl"
        );
        assert_eq!(
            archive_file_name(BackupTrigger::Auto, BackupMode::Incremental, true, at),
            "auto_inc_20250309_140507_042.jsonl.gz"
        );
    }

    #[test]
    fn test_change_window_start_applies_skew() -> anyhow::Result<()> {
        let marker = Utc.with_ymd_and_hms(2025, 3, 9, 14, 5, 7).unwrap().timestamp();
        assert_eq!(change_window_start(marker, 0)?, "2025-03-09 14:05:07");
        assert_eq!(change_window_start(marker, 300)?, "2025-03-09 14:00:07");
        Ok(())
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("full".parse::<BackupMode>().ok(), Some(BackupMode::Full));
        assert_eq!("Incremental".parse::<BackupMode>().ok(), Some(BackupMode::Incremental));
        assert_eq!("inc".parse::<BackupMode>().ok(), Some(BackupMode::Incremental));
        assert!("weekly".parse::<BackupMode>().is_err());
        assert_eq!(BackupMode::Incremental.to_string(), "incremental");
    }
}
