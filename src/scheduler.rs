//! Periodic automatic backups.
//!
//! A tick backs up only when the dataset files changed since the last
//! automatic backup. It runs incremental unless no full backup is newer than
//! `auto_full_interval_days`, and trims automatic backups to
//! `max_auto_backups` afterwards.

use chrono::Utc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backup::{BackupMode, BackupOutcome, BackupRequest, BackupTrigger};
use crate::catalog::BackupRecord;
use crate::engine::BackupEngine;
use crate::errors::{BackupError, Result};
use crate::retention::SECONDS_PER_DAY;
use crate::utils::dataset_signature;

/// Mode of the next automatic backup: full when no full backup, manual or
/// automatic, was taken within `full_every_days` of `now`.
pub fn scheduled_mode(records: &[BackupRecord], full_every_days: u32, now: i64) -> BackupMode {
    if full_every_days == 0 {
        return BackupMode::Incremental;
    }
    let cutoff = now - i64::from(full_every_days) * SECONDS_PER_DAY;
    let recent_full = records
        .iter()
        .any(|r| r.mode == BackupMode::Full && r.created_at > cutoff);
    if recent_full {
        BackupMode::Incremental
    } else {
        BackupMode::Full
    }
}

/// Runs one automatic backup if automatic backups are enabled and the
/// dataset changed since the last one. Returns `Ok(None)` when the tick was
/// skipped: disabled, unchanged, or another operation holds the slot.
pub async fn run_scheduled_backup(engine: &BackupEngine) -> Result<Option<BackupOutcome>> {
    let status = engine.get_status();
    if !status.is_auto_enabled {
        debug!("Automatic backups disabled, skipping tick");
        return Ok(None);
    }

    let signature = dataset_signature(&engine.config().database_path);
    if signature.is_some() && signature == status.data_signature {
        debug!("Dataset unchanged since the last automatic backup, skipping tick");
        return Ok(None);
    }

    let config = engine.config();
    let mode = scheduled_mode(
        &engine.list_backups(),
        config.auto_full_interval_days,
        Utc::now().timestamp(),
    );
    let request = BackupRequest {
        mode,
        compress: config.compress_auto_backups,
        trigger: BackupTrigger::Auto,
    };
    let handle = match engine.start_backup_with(request) {
        Ok(handle) => handle,
        Err(BackupError::Concurrency(kind)) => {
            info!(busy_with = %kind, "Skipping automatic backup, another operation is running");
            return Ok(None);
        }
        Err(e) => return Err(e),
    };
    let outcome = handle.wait().await?;

    // Taken before the backup started: writes made during it trigger the
    // next tick.
    if let Err(e) = engine.record_data_signature(signature) {
        warn!("Failed to record dataset signature: {}", e);
    }
    match engine.prune_auto_backups() {
        Ok(report) if report.deleted_count > 0 => {
            info!(deleted = report.deleted_count, freed_bytes = report.freed_bytes, "Pruned old automatic backups");
        }
        Ok(_) => {}
        Err(e) => warn!("Failed to prune automatic backups: {}", e),
    }
    Ok(Some(outcome))
}

/// Fires [`run_scheduled_backup`] every `auto_backup_interval_hours` until
/// `shutdown` is cancelled or a restore makes the engine unusable.
pub fn spawn_auto_backup(engine: BackupEngine, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = engine.config().auto_backup_interval().max(Duration::from_secs(60));
        let mut ticker = time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        info!(interval_secs = period.as_secs(), "Automatic backup scheduler started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match run_scheduled_backup(&engine).await {
                Ok(Some(outcome)) => {
                    info!(file = %outcome.record.filename, rows = outcome.record.row_count, "Automatic backup finished");
                    for warning in &outcome.warnings {
                        warn!(target_dir = %warning.target.display(), "{}", warning.message);
                    }
                }
                Ok(None) => {}
                Err(BackupError::RestartPending) => {
                    info!("Dataset replaced by a restore, stopping automatic backups");
                    break;
                }
                Err(e) => warn!("Automatic backup failed: {}", e),
            }
        }
        info!("Automatic backup scheduler stopped");
    })
}
