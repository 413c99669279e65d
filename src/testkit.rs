//! Fixtures shared by the engine tests: a small farm schema, seeding and
//! per-table fingerprints.

use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use std::path::Path;

use crate::backup::snapshot::{fetch_batch, list_tables};
use crate::backup::BackupMode;
use crate::catalog::BackupRecord;
use crate::config::EngineConfig;
use crate::engine::BackupEngine;
use crate::utils::open_live_pool;

pub(crate) const FARM_SCHEMA: &[&str] = &[
    "CREATE TABLE customers (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        photo BLOB,
        balance REAL,
        updated_at TEXT NOT NULL DEFAULT (datetime('now'))
    )",
    "CREATE TABLE sales (
        id INTEGER PRIMARY KEY,
        customer_id INTEGER NOT NULL REFERENCES customers(id),
        amount REAL NOT NULL,
        updated_at TEXT NOT NULL DEFAULT (datetime('now'))
    )",
    "CREATE TABLE sale_items (
        id INTEGER PRIMARY KEY,
        sale_id INTEGER NOT NULL REFERENCES sales(id),
        product TEXT NOT NULL,
        qty INTEGER NOT NULL
    )",
    "CREATE INDEX idx_sales_customer ON sales(customer_id)",
];

pub(crate) const SEED_TIMESTAMP: &str = "2020-01-01 00:00:00";

pub(crate) fn test_config(root: &Path) -> EngineConfig {
    let mut config = EngineConfig::new(root.join("data").join("farm.db"), root.join("backups"));
    config.batch_size = 25;
    config.incremental_skew_secs = 0;
    config
}

/// Opens `<root>/data/farm.db` and creates the farm schema in it.
pub(crate) async fn farm_pool(root: &Path) -> anyhow::Result<SqlitePool> {
    let config = test_config(root);
    std::fs::create_dir_all(config.data_dir())?;
    let pool = open_live_pool(&config.database_path).await?;
    for ddl in FARM_SCHEMA {
        sqlx::query(ddl).execute(&pool).await?;
    }
    Ok(pool)
}

pub(crate) async fn seed_farm(
    pool: &SqlitePool,
    customers: u64,
    sales: u64,
    items: u64,
) -> anyhow::Result<()> {
    let mut tx = pool.begin().await?;
    for i in 1..=customers {
        let photo = (i % 2 == 0).then(|| vec![i as u8; 4]);
        sqlx::query(
            "INSERT INTO customers (id, name, photo, balance, updated_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(i as i64)
        .bind(format!("Customer {i}"))
        .bind(photo)
        .bind(i as f64 * 1.5)
        .bind(SEED_TIMESTAMP)
        .execute(&mut *tx)
        .await?;
    }
    for j in 1..=sales {
        sqlx::query("INSERT INTO sales (id, customer_id, amount, updated_at) VALUES (?, ?, ?, ?)")
            .bind(j as i64)
            .bind((j % customers.max(1) + 1) as i64)
            .bind(j as f64 * 2.25)
            .bind(SEED_TIMESTAMP)
            .execute(&mut *tx)
            .await?;
    }
    for k in 1..=items {
        sqlx::query("INSERT INTO sale_items (id, sale_id, product, qty) VALUES (?, ?, ?, ?)")
            .bind(k as i64)
            .bind((k % sales.max(1) + 1) as i64)
            .bind(format!("maize-{}", k % 3))
            .bind((k % 7 + 1) as i64)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Seeded dataset plus an engine over it.
pub(crate) async fn seeded_engine(
    root: &Path,
    customers: u64,
    sales: u64,
    items: u64,
) -> anyhow::Result<BackupEngine> {
    seeded_engine_with(test_config(root), root, customers, sales, items).await
}

pub(crate) async fn seeded_engine_with(
    config: EngineConfig,
    root: &Path,
    customers: u64,
    sales: u64,
    items: u64,
) -> anyhow::Result<BackupEngine> {
    let pool = farm_pool(root).await?;
    seed_farm(&pool, customers, sales, items).await?;
    Ok(BackupEngine::with_pool(config, pool)?)
}

/// Row count and content hash of every table.
pub(crate) async fn fingerprint(pool: &SqlitePool) -> anyhow::Result<BTreeMap<String, (u64, String)>> {
    let mut conn = pool.acquire().await?;
    let mut prints = BTreeMap::new();
    for table in list_tables(&mut conn).await? {
        let mut hasher = Sha256::new();
        let mut count = 0u64;
        loop {
            let batch = fetch_batch(&mut conn, &table, None, 500, count).await?;
            if batch.is_empty() {
                break;
            }
            for row in &batch {
                hasher.update(serde_json::to_vec(row)?);
                hasher.update(b"\n");
            }
            count += batch.len() as u64;
        }
        prints.insert(table.name.clone(), (count, hex::encode(hasher.finalize())));
    }
    Ok(prints)
}

/// Files in `dir`, sorted, excluding the catalog.
pub(crate) fn archive_files(dir: &Path) -> anyhow::Result<Vec<String>> {
    let mut names = Vec::new();
    if !dir.exists() {
        return Ok(names);
    }
    for entry in std::fs::read_dir(dir)? {
        let name = entry?.file_name().to_string_lossy().into_owned();
        if name != "catalog.json" {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

/// Catalog entry backed by a small placeholder file in `dir`.
pub(crate) fn record(dir: &Path, name: &str, created_at: i64) -> BackupRecord {
    let path = dir.join(name);
    std::fs::write(&path, b"archive").expect("write placeholder archive");
    BackupRecord {
        id: uuid::Uuid::new_v4(),
        filename: name.to_string(),
        path,
        is_auto: false,
        size_bytes: 7,
        created_at,
        mode: BackupMode::Full,
        compressed: false,
        row_count: 0,
        checksum: String::new(),
        external_path: None,
    }
}
