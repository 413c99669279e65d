use std::path::PathBuf;

use thiserror::Error;

use crate::progress::OperationKind;

/// Presentation category of a [`BackupError`].
///
/// Callers decide between an alert, a neutral acknowledgment or a silent log
/// by matching on this, never on the error text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Io,
    Validation,
    Cancelled,
    Concurrency,
    Database,
    Config,
    NotFound,
    RestartPending,
    Internal,
}

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Archive validation failed: {0}")]
    Validation(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("A {0} operation is already running")]
    Concurrency(OperationKind),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Backup not found: {0}")]
    NotFound(String),

    #[error("A restore has replaced the live dataset; restart the application before continuing")]
    RestartPending,

    #[error("Background task failed: {0}")]
    Internal(String),
}

impl BackupError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        BackupError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            BackupError::Io { .. } => ErrorKind::Io,
            BackupError::Validation(_) => ErrorKind::Validation,
            BackupError::Cancelled => ErrorKind::Cancelled,
            BackupError::Concurrency(_) => ErrorKind::Concurrency,
            BackupError::Database(_) => ErrorKind::Database,
            BackupError::Config(_) => ErrorKind::Config,
            BackupError::NotFound(_) => ErrorKind::NotFound,
            BackupError::RestartPending => ErrorKind::RestartPending,
            BackupError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, BackupError::Cancelled)
    }
}

impl From<std::io::Error> for BackupError {
    fn from(err: std::io::Error) -> Self {
        BackupError::io("I/O failure", err)
    }
}

/// Failure to write the external copy of an archive. Reported in the backup
/// outcome; the primary backup still succeeds.
#[derive(Error, Debug, Clone, serde::Serialize)]
#[error("Replication to {} failed: {message}", target.display())]
pub struct ReplicationWarning {
    pub target: PathBuf,
    pub message: String,
}

/// Adds a context string to `std::io::Result`, in the spirit of
/// `anyhow::Context`, while keeping the tagged error type.
pub trait IoContext<T> {
    fn io_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn io_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| BackupError::io(f(), e))
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_dispatch_does_not_depend_on_message() {
        let cancelled = BackupError::Cancelled;
        assert_eq!(cancelled.kind(), ErrorKind::Cancelled);
        assert!(cancelled.is_cancelled());

        // A validation error mentioning cancellation is still a validation error.
        let validation = BackupError::Validation("row cancelled by user".to_string());
        assert_eq!(validation.kind(), ErrorKind::Validation);
        assert!(!validation.is_cancelled());
    }

    #[test]
    fn test_io_context_keeps_message_verbatim() {
        let err: Result<()> = Err(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "permission denied",
        ))
        .io_context(|| "Failed to create archive file: /backups/a.jsonl");

        let err = err.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert_eq!(
            err.to_string(),
            "Failed to create archive file: /backups/a.jsonl: permission denied"
        );
    }

    #[test]
    fn test_concurrency_message_names_running_operation() {
        let err = BackupError::Concurrency(OperationKind::Restore);
        assert_eq!(err.kind(), ErrorKind::Concurrency);
        assert_eq!(err.to_string(), "A restore operation is already running");
    }
}
