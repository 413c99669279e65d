// fieldvault/src/restore/verification.rs
use sqlx::{Row, SqlitePool};
use std::collections::BTreeSet;
use tracing::info;

use crate::backup::archive::ArchiveHeader;
use crate::backup::BackupMode;
use crate::errors::{BackupError, Result};
use crate::progress::OperationContext;
use crate::utils::quote_ident;

/// Checks the staged dataset before it may replace the live one:
/// SQLite's own integrity check, foreign key consistency and, for full
/// archives, per-table row counts against the archive header.
pub(crate) async fn verify_staged(
    pool: &SqlitePool,
    header: &ArchiveHeader,
    ctx: &OperationContext,
) -> Result<()> {
    let integrity: Vec<(String,)> = sqlx::query_as("PRAGMA integrity_check")
        .fetch_all(pool)
        .await?;
    let healthy = integrity.len() == 1 && integrity[0].0 == "ok";
    if !healthy {
        let problems: Vec<String> = integrity.into_iter().take(5).map(|(msg,)| msg).collect();
        return Err(BackupError::Validation(format!(
            "staged dataset failed integrity check: {}",
            problems.join("; ")
        )));
    }
    ctx.checkpoint()?;

    let violations = sqlx::query("PRAGMA foreign_key_check")
        .fetch_all(pool)
        .await?;
    if !violations.is_empty() {
        let tables: BTreeSet<String> = violations
            .iter()
            .filter_map(|row| row.try_get::<String, _>(0).ok())
            .collect();
        return Err(BackupError::Validation(format!(
            "staged dataset has {} foreign key violation(s) in: {}",
            violations.len(),
            tables.into_iter().collect::<Vec<_>>().join(", ")
        )));
    }

    if header.mode == BackupMode::Full {
        for table in header.tables.iter().filter(|t| !t.derived) {
            ctx.checkpoint()?;
            let count: i64 = sqlx::query_scalar(&format!(
                "SELECT COUNT(*) FROM {}",
                quote_ident(&table.name)
            ))
            .fetch_one(pool)
            .await?;
            if count.max(0) as u64 != table.rows {
                return Err(BackupError::Validation(format!(
                    "table '{}' has {} rows after staging, archive holds {}",
                    table.name, count, table.rows
                )));
            }
        }
    }

    info!(tables = header.tables.len(), "Staged dataset verified");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::archive::{TableManifest, ARCHIVE_FORMAT, ARCHIVE_VERSION};
    use crate::progress::{OperationKind, OperationSlot, ProgressReporter};
    use crate::utils::open_staging_pool;

    fn header(rows: u64) -> ArchiveHeader {
        ArchiveHeader {
            format: ARCHIVE_FORMAT.to_string(),
            version: ARCHIVE_VERSION,
            mode: BackupMode::Full,
            created_at: 0,
            since: None,
            tables: vec![
                TableManifest {
                    name: "customers".to_string(),
                    create_sql: String::new(),
                    columns: vec!["id".to_string()],
                    rows: 1,
                    ..Default::default()
                },
                TableManifest {
                    name: "sales".to_string(),
                    create_sql: String::new(),
                    columns: vec!["id".to_string(), "customer_id".to_string()],
                    rows,
                    ..Default::default()
                },
                TableManifest {
                    name: "sales_search".to_string(),
                    create_sql: String::new(),
                    columns: vec!["note".to_string()],
                    rows: 0,
                    derived: true,
                    rebuild: None,
                },
            ],
            schema: Vec::new(),
            sequences: Vec::new(),
        }
    }

    async fn staged(dir: &std::path::Path) -> anyhow::Result<SqlitePool> {
        let pool = open_staging_pool(&dir.join("staged.db")).await?;
        sqlx::query("CREATE TABLE customers (id INTEGER PRIMARY KEY)")
            .execute(&pool)
            .await?;
        sqlx::query("CREATE TABLE sales (id INTEGER PRIMARY KEY, customer_id INTEGER REFERENCES customers(id))")
            .execute(&pool)
            .await?;
        sqlx::query("CREATE TABLE sales_search (note TEXT)")
            .execute(&pool)
            .await?;
        sqlx::query("INSERT INTO sales_search (note) VALUES ('not archived')")
            .execute(&pool)
            .await?;
        sqlx::query("INSERT INTO customers (id) VALUES (1)")
            .execute(&pool)
            .await?;
        sqlx::query("INSERT INTO sales (id, customer_id) VALUES (1, 1)")
            .execute(&pool)
            .await?;
        Ok(pool)
    }

    #[tokio::test]
    async fn test_consistent_dataset_passes() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let pool = staged(dir.path()).await?;
        let slot = OperationSlot::new();
        let guard = slot.try_begin(OperationKind::Restore)?;
        let ctx = guard.context(ProgressReporter::new());

        verify_staged(&pool, &header(1), &ctx).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_count_mismatch_and_dangling_reference_fail() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let pool = staged(dir.path()).await?;
        let slot = OperationSlot::new();
        let guard = slot.try_begin(OperationKind::Restore)?;
        let ctx = guard.context(ProgressReporter::new());

        let err = verify_staged(&pool, &header(2), &ctx).await.unwrap_err();
        assert!(err.to_string().contains("'sales' has 1 rows"), "{err}");

        // Staging connections do not enforce foreign keys, the check must.
        sqlx::query("INSERT INTO sales (id, customer_id) VALUES (2, 99)")
            .execute(&pool)
            .await?;
        let err = verify_staged(&pool, &header(2), &ctx).await.unwrap_err();
        assert!(err.to_string().contains("foreign key"), "{err}");
        Ok(())
    }
}
