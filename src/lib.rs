//! Backup and restore engine for an embedded SQLite dataset.
//!
//! Full and incremental JSONL archives (optionally gzipped), validated
//! restores swapped in atomically, retention cleanup, external replication
//! and live progress reporting.

pub mod backup;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod errors;
pub mod progress;
pub mod restore;
pub mod retention;
pub mod scheduler;
pub mod utils;

#[cfg(test)]
mod testkit;

pub use backup::{BackupMode, BackupOutcome, BackupRequest, BackupTrigger};
pub use catalog::{BackupRecord, BackupStatus};
pub use config::{AppConfig, EngineConfig};
pub use engine::{BackupEngine, OperationHandle};
pub use errors::{BackupError, ErrorKind, ReplicationWarning};
pub use progress::{OperationKind, OperationOutcome, OperationPhase, ProgressSnapshot};
pub use restore::RestoreOutcome;
pub use retention::CleanupReport;
