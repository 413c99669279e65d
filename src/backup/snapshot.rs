// fieldvault/src/backup/snapshot.rs
//! Reads schema and rows out of the live dataset.
//!
//! Every function takes a plain connection so the producer can run all of
//! them inside one read transaction and see a single consistent snapshot.

use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, ValueRef};
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, warn};

use super::archive::{encode_blob, encode_real, SequenceEntry};
use crate::errors::{BackupError, Result};
use crate::utils::quote_ident;

/// Shadow tables each known virtual table module keeps next to the table
/// itself, as `<table>_<suffix>`.
fn shadow_suffixes(module: &str) -> &'static [&'static str] {
    match module {
        "fts5" => &["data", "idx", "content", "docsize", "config"],
        "fts3" | "fts4" => &["content", "segments", "segdir", "docsize", "stat"],
        "rtree" | "rtree_i32" | "geopoly" => &["node", "parent", "rowid"],
        _ => &[],
    }
}

/// How rows of a virtual table get into the restored dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
enum VirtualRows {
    /// The module stores its own rows; they are archived like any table.
    Stored { with_rowid: bool },
    /// Rebuilt from the content table after the load.
    Rebuilt(String),
    /// Nothing to carry: contentless indexes and unknown modules.
    Empty,
}

/// `CREATE VIRTUAL TABLE x USING module(args)` split into its module name and
/// top-level arguments.
fn parse_virtual_sql(sql: &str) -> Option<(String, Vec<String>)> {
    let upper = sql.to_ascii_uppercase();
    let using = upper.find(" USING ")? + " USING ".len();
    let rest = &sql[using..];
    let (module, args) = match rest.find('(') {
        Some(open) => {
            let close = rest.rfind(')').unwrap_or(rest.len());
            (&rest[..open], rest.get(open + 1..close).unwrap_or(""))
        }
        None => (rest, ""),
    };

    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut depth = 0usize;
    for ch in args.chars() {
        match (quote, ch) {
            (Some(q), c) if c == q => quote = None,
            (None, '\'' | '"' | '`') => quote = Some(ch),
            (None, '(') => depth += 1,
            (None, ')') => depth = depth.saturating_sub(1),
            (None, ',') if depth == 0 => {
                parts.push(current.trim().to_string());
                current.clear();
                continue;
            }
            _ => {}
        }
        current.push(ch);
    }
    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }
    Some((module.trim().to_ascii_lowercase(), parts))
}

/// Value of a `key=value` module argument, unquoted.
fn module_option<'a>(args: &'a [String], key: &str) -> Option<&'a str> {
    args.iter().find_map(|arg| {
        let (k, v) = arg.split_once('=')?;
        if !k.trim().eq_ignore_ascii_case(key) {
            return None;
        }
        let v = v.trim();
        Some(
            v.strip_prefix('\'')
                .and_then(|v| v.strip_suffix('\''))
                .or_else(|| v.strip_prefix('"').and_then(|v| v.strip_suffix('"')))
                .unwrap_or(v),
        )
    })
}

fn classify_virtual(name: &str, module: &str, args: &[String]) -> VirtualRows {
    match module {
        "fts5" | "fts4" | "fts3" => match module_option(args, "content") {
            None => VirtualRows::Stored { with_rowid: true },
            Some("") => VirtualRows::Empty,
            Some(_) => VirtualRows::Rebuilt(format!(
                "INSERT INTO {0}({0}) VALUES('rebuild')",
                quote_ident(name)
            )),
        },
        "rtree" | "rtree_i32" => VirtualRows::Stored { with_rowid: false },
        _ => VirtualRows::Empty,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableInfo {
    pub name: String,
    pub create_sql: String,
    pub columns: Vec<String>,
    /// Primary key columns in key order.
    pub primary_key: Vec<String>,
    /// Tables this one references through foreign keys.
    pub parents: Vec<String>,
    pub without_rowid: bool,
    /// Rows are not archived; see `TableManifest::derived`.
    pub derived: bool,
    pub rebuild: Option<String>,
}

/// Restricts an export to rows changed after `since`.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeFilter {
    pub column: String,
    pub since: String,
}

impl TableInfo {
    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c.eq_ignore_ascii_case(column))
    }

    fn column_list(&self) -> String {
        self.columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Stable paging order. Tables without a rowid page by primary key.
    fn order_by(&self) -> String {
        if self.without_rowid && !self.primary_key.is_empty() {
            self.primary_key
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", ")
        } else if self.without_rowid {
            (1..=self.columns.len())
                .map(|i| i.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        } else {
            "rowid".to_string()
        }
    }

    fn where_clause(filter: Option<&ChangeFilter>) -> String {
        match filter {
            Some(f) => format!(" WHERE {} > ?", quote_ident(&f.column)),
            None => String::new(),
        }
    }

    pub fn count_sql(&self, filter: Option<&ChangeFilter>) -> String {
        format!(
            "SELECT COUNT(*) FROM {}{}",
            quote_ident(&self.name),
            Self::where_clause(filter)
        )
    }

    pub fn select_sql(&self, filter: Option<&ChangeFilter>) -> String {
        format!(
            "SELECT {} FROM {}{} ORDER BY {} LIMIT ? OFFSET ?",
            self.column_list(),
            quote_ident(&self.name),
            Self::where_clause(filter),
            self.order_by()
        )
    }
}

/// Lists user tables with their columns and foreign key parents, virtual
/// tables included. Shadow tables are left out: they are recreated by their
/// virtual table.
pub async fn list_tables(conn: &mut SqliteConnection) -> Result<Vec<TableInfo>> {
    let rows: Vec<(String, Option<String>)> = sqlx::query_as(
        "SELECT name, sql FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )
    .fetch_all(&mut *conn)
    .await?;

    let mut shadows: HashSet<String> = shadow_tables_reported(conn).await;
    let mut virtuals: HashMap<String, (String, Vec<String>)> = HashMap::new();
    for (name, sql) in &rows {
        let Some(sql) = sql.as_deref() else { continue };
        if !sql.trim_start().to_ascii_uppercase().starts_with("CREATE VIRTUAL TABLE") {
            continue;
        }
        if let Some((module, args)) = parse_virtual_sql(sql) {
            for suffix in shadow_suffixes(&module) {
                shadows.insert(format!("{name}_{suffix}"));
            }
            virtuals.insert(name.clone(), (module, args));
        }
    }

    let mut tables = Vec::with_capacity(rows.len());
    for (name, sql) in rows {
        let Some(create_sql) = sql else { continue };
        if shadows.contains(&name) {
            debug!(table = %name, "Skipping shadow table");
            continue;
        }

        let column_rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT name, pk FROM pragma_table_info(?) ORDER BY cid")
                .bind(&name)
                .fetch_all(&mut *conn)
                .await?;
        let mut primary_key: Vec<(i64, String)> = column_rows
            .iter()
            .filter(|(_, pk)| *pk > 0)
            .map(|(col, pk)| (*pk, col.clone()))
            .collect();
        primary_key.sort();
        let mut columns: Vec<String> = column_rows.into_iter().map(|(col, _)| col).collect();

        let (derived, rebuild) = match virtuals.get(&name) {
            None => (false, None),
            Some((module, args)) => match classify_virtual(&name, module, args) {
                VirtualRows::Stored { with_rowid } => {
                    if with_rowid {
                        columns.insert(0, "rowid".to_string());
                    }
                    (false, None)
                }
                VirtualRows::Rebuilt(sql) => (true, Some(sql)),
                VirtualRows::Empty => {
                    warn!(table = %name, module = %module, "Virtual table rows cannot be archived, only its definition is kept");
                    (true, None)
                }
            },
        };
        if columns.is_empty() {
            columns.push("rowid".to_string());
        }

        let parents: Vec<(String,)> =
            sqlx::query_as("SELECT DISTINCT \"table\" FROM pragma_foreign_key_list(?)")
                .bind(&name)
                .fetch_all(&mut *conn)
                .await?;

        let without_rowid = create_sql
            .to_ascii_uppercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .windows(2)
            .any(|w| w == ["WITHOUT", "ROWID"]);

        tables.push(TableInfo {
            name,
            create_sql,
            columns,
            primary_key: primary_key.into_iter().map(|(_, col)| col).collect(),
            parents: parents.into_iter().map(|(p,)| p).collect(),
            without_rowid,
            derived,
            rebuild,
        });
    }
    Ok(tables)
}

/// Tables SQLite itself flags as shadow tables. Older libraries without
/// `pragma_table_list` report none.
async fn shadow_tables_reported(conn: &mut SqliteConnection) -> HashSet<String> {
    let listed: std::result::Result<Vec<(String,)>, sqlx::Error> =
        sqlx::query_as("SELECT name FROM pragma_table_list WHERE schema = 'main' AND type = 'shadow'")
            .fetch_all(&mut *conn)
            .await;
    match listed {
        Ok(rows) => rows.into_iter().map(|(name,)| name).collect(),
        Err(e) => {
            debug!("pragma_table_list unavailable: {}", e);
            HashSet::new()
        }
    }
}

/// AUTOINCREMENT high-water marks. Empty when no table uses AUTOINCREMENT.
pub async fn list_sequences(conn: &mut SqliteConnection) -> Result<Vec<SequenceEntry>> {
    let exists: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'sqlite_sequence'",
    )
    .fetch_one(&mut *conn)
    .await?;
    if exists == 0 {
        return Ok(Vec::new());
    }
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT name, seq FROM sqlite_sequence ORDER BY name")
            .fetch_all(&mut *conn)
            .await?;
    Ok(rows
        .into_iter()
        .map(|(table, seq)| SequenceEntry { table, seq })
        .collect())
}

/// DDL that is not a table: indexes first, then views, then triggers.
pub async fn list_extra_schema(conn: &mut SqliteConnection) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT sql FROM sqlite_master \
         WHERE type IN ('index', 'view', 'trigger') AND sql IS NOT NULL AND name NOT LIKE 'sqlite_%' \
         ORDER BY CASE type WHEN 'index' THEN 0 WHEN 'view' THEN 1 ELSE 2 END, name",
    )
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows.into_iter().map(|(sql,)| sql).collect())
}

/// Orders tables so every parent comes before its children. Ties are broken
/// by name. Tables caught in a reference cycle are appended by name.
pub fn dependency_order(tables: Vec<TableInfo>) -> Vec<TableInfo> {
    let names: HashSet<&str> = tables.iter().map(|t| t.name.as_str()).collect();
    let mut pending: HashMap<String, usize> = HashMap::new();
    let mut children: HashMap<String, Vec<String>> = HashMap::new();

    for table in &tables {
        let parents: BTreeSet<&str> = table
            .parents
            .iter()
            .map(String::as_str)
            .filter(|p| *p != table.name && names.contains(p))
            .collect();
        pending.insert(table.name.clone(), parents.len());
        for parent in parents {
            children
                .entry(parent.to_string())
                .or_default()
                .push(table.name.clone());
        }
    }

    let mut ready: BTreeSet<String> = pending
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(name, _)| name.clone())
        .collect();
    let mut order: Vec<String> = Vec::with_capacity(tables.len());

    while let Some(name) = ready.pop_first() {
        if let Some(kids) = children.get(&name) {
            for child in kids {
                if let Some(count) = pending.get_mut(child) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(child.clone());
                    }
                }
            }
        }
        order.push(name);
    }

    let placed: HashSet<String> = order.iter().cloned().collect();
    let mut cyclic: Vec<String> = tables
        .iter()
        .map(|t| t.name.clone())
        .filter(|n| !placed.contains(n))
        .collect();
    cyclic.sort();
    order.extend(cyclic);

    let mut by_name: HashMap<String, TableInfo> =
        tables.into_iter().map(|t| (t.name.clone(), t)).collect();
    order
        .into_iter()
        .filter_map(|name| by_name.remove(&name))
        .collect()
}

pub async fn count_rows(
    conn: &mut SqliteConnection,
    table: &TableInfo,
    filter: Option<&ChangeFilter>,
) -> Result<u64> {
    let sql = table.count_sql(filter);
    let mut query = sqlx::query_scalar::<_, i64>(&sql);
    if let Some(f) = filter {
        query = query.bind(f.since.clone());
    }
    let count = query.fetch_one(&mut *conn).await?;
    Ok(count.max(0) as u64)
}

pub async fn fetch_batch(
    conn: &mut SqliteConnection,
    table: &TableInfo,
    filter: Option<&ChangeFilter>,
    limit: u32,
    offset: u64,
) -> Result<Vec<Vec<Value>>> {
    let sql = table.select_sql(filter);
    let mut query = sqlx::query(&sql);
    if let Some(f) = filter {
        query = query.bind(f.since.clone());
    }
    let rows = query
        .bind(i64::from(limit))
        .bind(offset as i64)
        .fetch_all(&mut *conn)
        .await?;
    rows.iter().map(row_values).collect()
}

/// Converts one row to archive values, trying the SQLite storage classes in
/// turn.
fn row_values(row: &SqliteRow) -> Result<Vec<Value>> {
    let mut values = Vec::with_capacity(row.len());
    for idx in 0..row.len() {
        if row.try_get_raw(idx)?.is_null() {
            values.push(Value::Null);
            continue;
        }
        let value = if let Ok(v) = row.try_get::<i64, _>(idx) {
            Value::from(v)
        } else if let Ok(v) = row.try_get::<f64, _>(idx) {
            encode_real(v)
        } else if let Ok(v) = row.try_get::<String, _>(idx) {
            Value::String(v)
        } else if let Ok(v) = row.try_get::<Vec<u8>, _>(idx) {
            encode_blob(&v)
        } else {
            return Err(BackupError::Internal(format!(
                "column {} holds a value of unsupported type",
                idx
            )));
        };
        values.push(value);
    }
    Ok(values)
}
