pub(crate) mod staging;
pub(crate) mod verification;

use serde::Serialize;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::backup::archive::verify_archive_with;
use crate::backup::BackupMode;
use crate::catalog::Catalog;
use crate::config::EngineConfig;
use crate::engine::LiveDatabase;
use crate::errors::{BackupError, IoContext, Result};
use crate::progress::{OperationContext, OperationPhase};
use crate::utils::{fsync_dir, open_live_pool, open_staging_pool, remove_file_if_exists, sidecar_paths, STAGING_PREFIX};

#[derive(Debug, Clone, Serialize)]
pub struct RestoreOutcome {
    pub operation_id: Uuid,
    pub archive: PathBuf,
    pub mode: BackupMode,
    pub tables: usize,
    pub rows: u64,
    /// The live pool was closed for the swap; the host application must
    /// restart before touching the dataset again.
    pub restart_required: bool,
}

/// Validates `archive`, builds a staged dataset from it, verifies the staged
/// copy and swaps it in. Nothing touches the live file before the swap.
pub(crate) async fn run_restore(
    live: &LiveDatabase,
    config: &EngineConfig,
    catalog: &Catalog,
    archive: &Path,
    ctx: &OperationContext,
) -> Result<RestoreOutcome> {
    let reporter = ctx.reporter();
    ctx.checkpoint()?;
    info!(operation_id = %ctx.id, archive = %archive.display(), "Starting restore");

    reporter.phase(OperationPhase::Validating, "Validating archive");
    let summary = verify_archive_with(archive, |checked| {
        ctx.checkpoint()?;
        reporter.phase(
            OperationPhase::Validating,
            format!("Validating archive ({} rows checked)", checked),
        );
        Ok(())
    })?;
    let header = summary.header;
    reporter.set_totals(header.total_rows(), header.tables.len() as u32);
    ctx.checkpoint()?;

    let data_dir = config.data_dir();
    // Removed on drop, whatever happens below.
    let staging = tempfile::Builder::new()
        .prefix(STAGING_PREFIX)
        .tempdir_in(&data_dir)
        .io_context(|| format!("Failed to create staging directory in {}", data_dir.display()))?;
    let db_file_name = config
        .database_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| OsString::from("restored.db"));
    let staged_db = staging.path().join(db_file_name);

    reporter.phase(OperationPhase::Staging, "Staging records");
    let rows = match header.mode {
        BackupMode::Full => staging::stage_full(&staged_db, archive, config.batch_size, ctx).await?,
        BackupMode::Incremental => {
            let pool = live.pool()?;
            staging::stage_incremental(&pool, &staged_db, archive, config.batch_size, ctx).await?
        }
    };
    ctx.checkpoint()?;

    reporter.phase(OperationPhase::Verifying, "Verifying staged dataset");
    let staged_pool = open_staging_pool(&staged_db).await?;
    let verified = verification::verify_staged(&staged_pool, &header, ctx).await;
    staged_pool.close().await;
    verified?;

    // Last point at which cancellation is honored.
    ctx.checkpoint()?;
    reporter.phase(OperationPhase::Swapping, "Swapping");
    // Rows written after the archive was taken are gone once the swap lands,
    // so the previous snapshot boundary no longer describes the dataset.
    catalog.clear_change_marker()?;
    swap_in(live, &config.database_path, &staged_db).await?;
    drop(staging);

    info!(operation_id = %ctx.id, rows, "Restore completed, restart required");
    reporter.complete("Restore completed; restart the application");
    Ok(RestoreOutcome {
        operation_id: ctx.id,
        archive: archive.to_path_buf(),
        mode: header.mode,
        tables: header.tables.len(),
        rows,
        restart_required: true,
    })
}

/// Closes the live pool and renames the staged file over the live one. If
/// the rename fails the previous file is put back and the pool reopened.
async fn swap_in(live: &LiveDatabase, database_path: &Path, staged_db: &Path) -> Result<()> {
    let pool = live.take()?;
    if let Err(e) = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(&pool).await {
        warn!("WAL checkpoint before swap failed: {}", e);
    }
    pool.close().await;

    match swap_files(database_path, staged_db) {
        Ok(()) => Ok(()),
        Err(e) => {
            error!("Swap failed, live dataset kept: {}", e);
            match open_live_pool(database_path).await {
                Ok(pool) => live.put(pool),
                Err(reopen) => error!("Failed to reopen live dataset after aborted swap: {}", reopen),
            }
            Err(e)
        }
    }
}

fn pre_restore_path(database_path: &Path) -> PathBuf {
    let mut name = database_path.as_os_str().to_owned();
    name.push(".pre-restore");
    PathBuf::from(name)
}

fn swap_files(database_path: &Path, staged_db: &Path) -> Result<()> {
    let previous = pre_restore_path(database_path);
    let had_live = database_path.exists();

    if had_live {
        fs::rename(database_path, &previous).io_context(|| {
            format!("Failed to set aside live dataset {}", database_path.display())
        })?;
    }

    let rollback = |cause: BackupError| -> BackupError {
        if had_live {
            if let Err(e) = fs::rename(&previous, database_path) {
                error!(
                    previous = %previous.display(),
                    "Failed to put the previous dataset back: {}", e
                );
            }
        }
        cause
    };

    for sidecar in sidecar_paths(database_path) {
        remove_file_if_exists(&sidecar)
            .io_context(|| format!("Failed to remove {}", sidecar.display()))
            .map_err(rollback)?;
    }

    fs::rename(staged_db, database_path)
        .io_context(|| format!("Failed to move staged dataset to {}", database_path.display()))
        .map_err(rollback)?;

    if let Some(dir) = database_path.parent().filter(|d| !d.as_os_str().is_empty()) {
        if let Err(e) = fsync_dir(dir) {
            warn!("Failed to sync {} after swap: {}", dir.display(), e);
        }
    }
    if had_live {
        if let Err(e) = fs::remove_file(&previous) {
            warn!(path = %previous.display(), "Failed to remove previous dataset: {}", e);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_swap_replaces_live_file_and_clears_sidecars() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let live = dir.path().join("farm.db");
        let staged = dir.path().join("staged.db");
        fs::write(&live, b"old")?;
        fs::write(dir.path().join("farm.db-wal"), b"")?;
        fs::write(&staged, b"new")?;

        swap_files(&live, &staged)?;
        assert_eq!(fs::read(&live)?, b"new");
        assert!(!staged.exists());
        assert!(!dir.path().join("farm.db-wal").exists());
        assert!(!pre_restore_path(&live).exists());
        Ok(())
    }

    #[test]
    fn test_failed_swap_keeps_live_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let live = dir.path().join("farm.db");
        fs::write(&live, b"old")?;

        let err = swap_files(&live, &dir.path().join("missing.db")).unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::Io);
        assert_eq!(fs::read(&live)?, b"old");
        assert!(!pre_restore_path(&live).exists());
        Ok(())
    }
}
