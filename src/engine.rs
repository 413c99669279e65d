//! Public entry point: one engine per dataset.
//!
//! Owns the live pool, the catalog, the progress reporter and the single
//! operation slot. Backups and restores run as background tokio tasks; the
//! start calls return as soon as the slot is claimed.

use chrono::Utc;
use sqlx::SqlitePool;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::backup::{self, BackupMode, BackupOutcome, BackupRequest};
use crate::catalog::{BackupRecord, BackupStatus, Catalog};
use crate::config::EngineConfig;
use crate::errors::{BackupError, IoContext, Result};
use crate::progress::{
    spawn_watchdog, OperationGuard, OperationKind, OperationOutcome, OperationSlot,
    ProgressReporter, ProgressSnapshot,
};
use crate::restore::{self, RestoreOutcome};
use crate::retention::{self, CleanupReport};
use crate::utils::{open_live_pool, scrub_orphans};

/// The live connection pool. Emptied for good by a completed restore.
pub(crate) struct LiveDatabase {
    pool: Mutex<Option<SqlitePool>>,
}

impl LiveDatabase {
    fn new(pool: SqlitePool) -> Self {
        Self {
            pool: Mutex::new(Some(pool)),
        }
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<SqlitePool>> {
        match self.pool.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn pool(&self) -> Result<SqlitePool> {
        self.slot().clone().ok_or(BackupError::RestartPending)
    }

    pub(crate) fn take(&self) -> Result<SqlitePool> {
        self.slot().take().ok_or(BackupError::RestartPending)
    }

    pub(crate) fn put(&self, pool: SqlitePool) {
        *self.slot() = Some(pool);
    }
}

/// A started backup or restore.
pub struct OperationHandle<T> {
    pub id: Uuid,
    pub kind: OperationKind,
    handle: JoinHandle<Result<T>>,
}

impl<T> OperationHandle<T> {
    /// Waits for the background task. A panicked task surfaces as
    /// [`BackupError::Internal`].
    pub async fn wait(self) -> Result<T> {
        match self.handle.await {
            Ok(result) => result,
            Err(join_error) => Err(BackupError::Internal(join_error.to_string())),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

struct EngineInner {
    config: EngineConfig,
    live: LiveDatabase,
    catalog: Catalog,
    reporter: ProgressReporter,
    slot: Arc<OperationSlot>,
    restart_required: AtomicBool,
}

impl EngineInner {
    /// Records the terminal state and frees the slot. Failed and cancelled
    /// operations reset progress to idle; completed ones keep their final
    /// values until the next start.
    fn settle<T>(&self, guard: OperationGuard, result: &Result<T>) {
        let kind = guard.kind();
        let outcome = match result {
            Ok(_) => OperationOutcome::Completed { operation: kind },
            Err(BackupError::Cancelled) => {
                info!(operation_id = %guard.id(), operation = %kind, "Operation cancelled");
                self.reporter.reset();
                OperationOutcome::Cancelled { operation: kind }
            }
            Err(e) => {
                error!(operation_id = %guard.id(), operation = %kind, "Operation failed: {}", e);
                self.reporter.reset();
                OperationOutcome::Failed {
                    operation: kind,
                    kind: e.kind(),
                    message: e.to_string(),
                }
            }
        };
        guard.finish(outcome);
    }
}

#[derive(Clone)]
pub struct BackupEngine {
    inner: Arc<EngineInner>,
}

impl BackupEngine {
    /// Opens the live dataset and the catalog, and clears leftovers of a
    /// previous crash.
    pub async fn open(config: EngineConfig) -> Result<Self> {
        let data_dir = config.data_dir();
        fs::create_dir_all(&data_dir)
            .io_context(|| format!("Failed to create data directory {}", data_dir.display()))?;
        let pool = open_live_pool(&config.database_path).await?;
        Self::with_pool(config, pool)
    }

    /// Uses a pool the host application already opened. The engine takes
    /// it over: a completed restore closes it.
    pub fn with_pool(config: EngineConfig, pool: SqlitePool) -> Result<Self> {
        fs::create_dir_all(&config.backup_dir).io_context(|| {
            format!("Failed to create backup directory {}", config.backup_dir.display())
        })?;

        let catalog = Catalog::open(
            &config.catalog_path,
            config.auto_backup_enabled,
            config.external_backup_path.clone(),
        )?;

        let data_dir = config.data_dir();
        let mut scrub_dirs: Vec<&Path> = vec![config.backup_dir.as_path(), data_dir.as_path()];
        let external = catalog.external_path();
        if let Some(dir) = external.as_deref() {
            scrub_dirs.push(dir);
        }
        let scrubbed = scrub_orphans(&scrub_dirs);
        if scrubbed > 0 {
            warn!(count = scrubbed, "Removed artifacts left by an interrupted operation");
        }

        info!(
            database = %config.database_path.display(),
            backup_dir = %config.backup_dir.display(),
            "Backup engine ready"
        );
        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                live: LiveDatabase::new(pool),
                catalog,
                reporter: ProgressReporter::new(),
                slot: OperationSlot::new(),
                restart_required: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// The live pool, shared with the host application.
    pub fn pool(&self) -> Result<SqlitePool> {
        self.inner.live.pool()
    }

    pub fn start_backup(&self, mode: BackupMode, compress: bool) -> Result<OperationHandle<BackupOutcome>> {
        self.start_backup_with(BackupRequest::manual(mode, compress))
    }

    /// Claims the slot synchronously and runs the backup in the background.
    /// Fails at once with a concurrency error if another operation runs.
    pub fn start_backup_with(&self, request: BackupRequest) -> Result<OperationHandle<BackupOutcome>> {
        let guard = self.inner.slot.try_begin(OperationKind::Backup)?;
        let pool = self.inner.live.pool()?;
        self.inner.reporter.begin(OperationKind::Backup, "Preparing backup");

        let id = guard.id();
        let ctx = guard.context(self.inner.reporter.clone());
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let done = CancellationToken::new();
            let watchdog = spawn_watchdog(inner.reporter.clone(), inner.config.stall_threshold(), done.clone());
            let result = backup::run_backup(&pool, &inner.config, &inner.catalog, request, &ctx).await;
            done.cancel();
            let _ = watchdog.await;
            inner.settle(guard, &result);
            result
        });

        Ok(OperationHandle {
            id,
            kind: OperationKind::Backup,
            handle,
        })
    }

    /// Starts restoring `archive`. Any readable archive path is accepted;
    /// it is validated in full before the live dataset is touched.
    pub fn restore(&self, archive: impl Into<PathBuf>) -> Result<OperationHandle<RestoreOutcome>> {
        let archive = archive.into();
        let guard = self.inner.slot.try_begin(OperationKind::Restore)?;
        if self.restart_required() {
            return Err(BackupError::RestartPending);
        }
        self.inner.live.pool()?;
        self.inner.reporter.begin(OperationKind::Restore, "Preparing restore");

        let id = guard.id();
        let ctx = guard.context(self.inner.reporter.clone());
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let done = CancellationToken::new();
            let watchdog = spawn_watchdog(inner.reporter.clone(), inner.config.stall_threshold(), done.clone());
            let result = restore::run_restore(&inner.live, &inner.config, &inner.catalog, &archive, &ctx).await;
            done.cancel();
            let _ = watchdog.await;
            if result.is_ok() {
                inner.restart_required.store(true, Ordering::SeqCst);
            }
            inner.settle(guard, &result);
            result
        });

        Ok(OperationHandle {
            id,
            kind: OperationKind::Restore,
            handle,
        })
    }

    pub fn get_progress(&self) -> ProgressSnapshot {
        self.inner.reporter.snapshot()
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<ProgressSnapshot> {
        self.inner.reporter.subscribe()
    }

    /// Requests cooperative cancellation. Returns `false` when idle.
    pub fn cancel_operation(&self) -> bool {
        let requested = self.inner.slot.cancel();
        if requested {
            info!("Cancellation requested");
        }
        requested
    }

    pub fn active_operation(&self) -> Option<OperationKind> {
        self.inner.slot.active_kind()
    }

    pub fn last_outcome(&self) -> Option<OperationOutcome> {
        self.inner.slot.last_outcome()
    }

    pub fn restart_required(&self) -> bool {
        self.inner.restart_required.load(Ordering::SeqCst)
    }

    /// Newest first.
    pub fn list_backups(&self) -> Vec<BackupRecord> {
        self.inner.catalog.list()
    }

    pub fn get_status(&self) -> BackupStatus {
        self.inner.catalog.status()
    }

    pub fn external_path(&self) -> Option<PathBuf> {
        self.inner.catalog.external_path()
    }

    /// Persists the secondary location. `None` turns replication off.
    pub fn set_external_path(&self, path: Option<PathBuf>) -> Result<()> {
        if let Some(dir) = path.as_deref() {
            if !dir.is_dir() {
                warn!(path = %dir.display(), "External backup path does not exist yet, copies will fail until it does");
            }
        }
        self.inner.catalog.set_external_path(path.clone())?;
        info!(path = ?path, "External backup path updated");
        Ok(())
    }

    pub fn set_auto_enabled(&self, enabled: bool) -> Result<()> {
        self.inner.catalog.set_auto_enabled(enabled)?;
        info!(enabled, "Automatic backups toggled");
        Ok(())
    }

    /// Deletes backups older than `retention_days`, never the newest one.
    pub fn cleanup(&self, retention_days: u32) -> Result<CleanupReport> {
        self.cleanup_at(retention_days, Utc::now().timestamp())
    }

    pub fn cleanup_at(&self, retention_days: u32, now: i64) -> Result<CleanupReport> {
        retention::apply_cleanup(&self.inner.catalog, retention_days, now)
    }

    /// Applies `max_auto_backups` to the automatic backups in the catalog.
    pub fn prune_auto_backups(&self) -> Result<CleanupReport> {
        retention::apply_auto_cap(&self.inner.catalog, self.inner.config.max_auto_backups)
    }

    pub(crate) fn record_data_signature(&self, signature: Option<String>) -> Result<()> {
        self.inner.catalog.set_data_signature(signature)
    }

    /// Deletes one catalogued backup and its external copy. Returns the
    /// bytes freed.
    pub fn delete_backup(&self, filename: &str) -> Result<u64> {
        let record = self
            .inner
            .catalog
            .find(filename)
            .ok_or_else(|| BackupError::NotFound(filename.to_string()))?;
        let freed = retention::remove_backup_files(&record)?;
        self.inner.catalog.remove(&[record.id])?;
        info!(filename, freed, "Backup deleted");
        Ok(freed)
    }

    /// Compacts and re-analyzes the live dataset. Holds the operation slot
    /// for the whole run, so it is refused while a backup or restore runs and
    /// blocks them while it runs. Not cancellable.
    pub async fn run_maintenance(&self) -> Result<()> {
        let guard = self.inner.slot.try_begin(OperationKind::Maintenance)?;
        let result = self.maintain().await;
        self.inner.settle(guard, &result);
        result
    }

    async fn maintain(&self) -> Result<()> {
        let pool = self.inner.live.pool()?;
        info!("Running database maintenance");
        for statement in ["PRAGMA optimize", "VACUUM", "ANALYZE"] {
            sqlx::query(statement).execute(&pool).await?;
        }
        info!("Database maintenance finished");
        Ok(())
    }
}
