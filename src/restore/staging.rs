// fieldvault/src/restore/staging.rs
//! Builds the replacement dataset next to the live one.

use serde_json::Value;
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments};
use sqlx::{SqliteConnection, SqlitePool};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::backup::archive::{decode_blob, decode_real, ArchiveHeader, ArchiveReader, TableManifest};
use crate::errors::{BackupError, Result};
use crate::progress::{OperationContext, OperationPhase};
use crate::utils::{open_staging_pool, quote_ident};

type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InsertVerb {
    Insert,
    Upsert,
}

fn insert_sql(verb: InsertVerb, table: &TableManifest) -> String {
    let columns = table
        .columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = vec!["?"; table.columns.len()].join(", ");
    let head = match verb {
        InsertVerb::Insert => "INSERT INTO",
        InsertVerb::Upsert => "INSERT OR REPLACE INTO",
    };
    format!(
        "{} {} ({}) VALUES ({})",
        head,
        quote_ident(&table.name),
        columns,
        placeholders
    )
}

fn bind_value<'q>(query: SqliteQuery<'q>, value: &Value) -> Result<SqliteQuery<'q>> {
    let bound = match value {
        Value::Null => query.bind(None::<i64>),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => query.bind(i),
            (None, Some(f)) => query.bind(f),
            (None, None) => {
                return Err(BackupError::Validation(format!("number {} is out of range", n)));
            }
        },
        Value::String(s) => query.bind(s.clone()),
        Value::Object(_) => {
            if let Some(bytes) = decode_blob(value) {
                query.bind(bytes)
            } else if let Some(real) = decode_real(value) {
                query.bind(real)
            } else {
                return Err(BackupError::Validation("malformed tagged value".to_string()));
            }
        }
        Value::Array(_) => {
            return Err(BackupError::Validation("arrays are not storable".to_string()));
        }
    };
    Ok(bound)
}

/// Streams every row of `reader` into `conn`, reporting progress per batch
/// and honoring cancellation before each table and after each batch.
async fn insert_rows(
    conn: &mut SqliteConnection,
    reader: &mut ArchiveReader,
    header: &ArchiveHeader,
    verb: InsertVerb,
    batch_size: u32,
    ctx: &OperationContext,
) -> Result<u64> {
    let reporter = ctx.reporter();
    let total_tables = header.tables.len();
    let statements: HashMap<&str, (String, usize)> = header
        .tables
        .iter()
        .enumerate()
        .map(|(idx, t)| (t.name.as_str(), (insert_sql(verb, t), idx)))
        .collect();

    let batch_size = u64::from(batch_size.max(1));
    let mut current_table: Option<String> = None;
    let mut pending = 0u64;
    let mut inserted = 0u64;

    ctx.checkpoint()?;
    while let Some(row) = reader.next_row()? {
        let (sql, idx) = statements.get(row.table.as_str()).ok_or_else(|| {
            BackupError::Validation(format!("row for unknown table '{}'", row.table))
        })?;

        if current_table.as_deref() != Some(row.table.as_str()) {
            if pending > 0 {
                reporter.advance(pending);
                pending = 0;
            }
            ctx.checkpoint()?;
            let position = *idx as u32 + 1;
            reporter.enter_table(
                position,
                OperationPhase::Staging,
                format!("Staging records: {} ({}/{})", row.table, position, total_tables),
            );
            current_table = Some(row.table.clone());
        }

        let mut query = sqlx::query(sql.as_str());
        for value in &row.values {
            query = bind_value(query, value)?;
        }
        query.execute(&mut *conn).await?;

        pending += 1;
        inserted += 1;
        if pending >= batch_size {
            reporter.advance(pending);
            pending = 0;
            ctx.checkpoint()?;
        }
    }
    if pending > 0 {
        reporter.advance(pending);
    }
    Ok(inserted)
}

/// Repopulates tables whose content is derived from other tables, such as
/// external-content full-text indexes.
async fn rebuild_derived(conn: &mut SqliteConnection, header: &ArchiveHeader) -> Result<()> {
    for table in header.tables.iter().filter(|t| t.derived) {
        match &table.rebuild {
            Some(sql) => {
                sqlx::query(sql).execute(&mut *conn).await?;
                debug!(table = %table.name, "Rebuilt derived table");
            }
            None => warn!(table = %table.name, "Derived table restored empty"),
        }
    }
    Ok(())
}

/// Raises AUTOINCREMENT counters to the archived high-water marks so ids of
/// deleted rows are not handed out again.
async fn apply_sequences(conn: &mut SqliteConnection, header: &ArchiveHeader) -> Result<()> {
    if header.sequences.is_empty() {
        return Ok(());
    }
    let exists: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'sqlite_sequence'",
    )
    .fetch_one(&mut *conn)
    .await?;
    if exists == 0 {
        warn!("Archive carries AUTOINCREMENT counters but no table uses AUTOINCREMENT");
        return Ok(());
    }

    for entry in &header.sequences {
        if !header.tables.iter().any(|t| t.name == entry.table) {
            continue;
        }
        let updated = sqlx::query("UPDATE sqlite_sequence SET seq = MAX(seq, ?) WHERE name = ?")
            .bind(entry.seq)
            .bind(&entry.table)
            .execute(&mut *conn)
            .await?
            .rows_affected();
        if updated == 0 {
            sqlx::query("INSERT INTO sqlite_sequence (name, seq) VALUES (?, ?)")
                .bind(&entry.table)
                .bind(entry.seq)
                .execute(&mut *conn)
                .await?;
        }
    }
    Ok(())
}

/// Creates a fresh dataset at `staged_db` from a full archive: tables, rows,
/// then indexes, views and triggers.
pub(crate) async fn stage_full(
    staged_db: &Path,
    archive: &Path,
    batch_size: u32,
    ctx: &OperationContext,
) -> Result<u64> {
    let pool = open_staging_pool(staged_db).await?;
    let result = load_full(&pool, archive, batch_size, ctx).await;
    pool.close().await;
    result
}

async fn load_full(
    pool: &SqlitePool,
    archive: &Path,
    batch_size: u32,
    ctx: &OperationContext,
) -> Result<u64> {
    let mut reader = ArchiveReader::open(archive)?;
    let header = reader.header().clone();

    let mut tx = pool.begin().await?;
    for table in &header.tables {
        sqlx::query(&table.create_sql).execute(&mut *tx).await?;
    }
    let inserted = insert_rows(&mut tx, &mut reader, &header, InsertVerb::Insert, batch_size, ctx).await?;
    rebuild_derived(&mut tx, &header).await?;
    apply_sequences(&mut tx, &header).await?;
    for ddl in &header.schema {
        sqlx::query(ddl).execute(&mut *tx).await?;
    }
    tx.commit().await?;

    info!(tables = header.tables.len(), rows = inserted, "Staged full archive");
    Ok(inserted)
}

/// Copies the live dataset to `staged_db` and upserts the rows of an
/// incremental archive on top of it.
pub(crate) async fn stage_incremental(
    live: &SqlitePool,
    staged_db: &Path,
    archive: &Path,
    batch_size: u32,
    ctx: &OperationContext,
) -> Result<u64> {
    sqlx::query("VACUUM INTO ?")
        .bind(staged_db.to_string_lossy().into_owned())
        .execute(live)
        .await?;
    debug!(path = %staged_db.display(), "Copied live dataset for incremental restore");
    ctx.checkpoint()?;

    let pool = open_staging_pool(staged_db).await?;
    let result = load_incremental(&pool, archive, batch_size, ctx).await;
    pool.close().await;
    result
}

async fn load_incremental(
    pool: &SqlitePool,
    archive: &Path,
    batch_size: u32,
    ctx: &OperationContext,
) -> Result<u64> {
    let mut reader = ArchiveReader::open(archive)?;
    let header = reader.header().clone();

    let mut tx = pool.begin().await?;
    for table in &header.tables {
        let exists: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
        )
        .bind(&table.name)
        .fetch_one(&mut *tx)
        .await?;
        if exists == 0 {
            sqlx::query(&table.create_sql).execute(&mut *tx).await?;
        }
    }
    let upserted = insert_rows(&mut tx, &mut reader, &header, InsertVerb::Upsert, batch_size, ctx).await?;
    rebuild_derived(&mut tx, &header).await?;
    apply_sequences(&mut tx, &header).await?;
    tx.commit().await?;

    info!(tables = header.tables.len(), rows = upserted, "Applied incremental archive to staged copy");
    Ok(upserted)
}
