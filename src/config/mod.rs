// fieldvault/src/config/mod.rs
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "config.json";
pub const CONFIG_PATH_ENV: &str = "FIELDVAULT_CONFIG";

pub const DEFAULT_BATCH_SIZE: u32 = 500;
pub const DEFAULT_CHANGE_COLUMN: &str = "updated_at";
pub const DEFAULT_INCREMENTAL_SKEW_SECS: u64 = 300;
pub const DEFAULT_STALL_WARNING_SECS: u64 = 30;
pub const DEFAULT_AUTO_BACKUP_INTERVAL_HOURS: u64 = 6;
pub const DEFAULT_AUTO_FULL_INTERVAL_DAYS: u32 = 7;
pub const DEFAULT_MAX_AUTO_BACKUPS: u32 = 30;

// Structs for deserializing config.json
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawJsonConfig {
    pub database_path: Option<PathBuf>,
    pub backup_dir: Option<PathBuf>,
    pub catalog_path: Option<PathBuf>,
    pub external_backup_path: Option<PathBuf>,
    pub batch_size: Option<u32>,
    pub change_column: Option<String>,
    pub incremental_skew_secs: Option<u64>,
    pub stall_warning_secs: Option<u64>,
    pub auto_backup_interval_hours: Option<u64>,
    pub compress_auto_backups: Option<bool>,
    pub auto_backup_enabled: Option<bool>,
    pub auto_full_interval_days: Option<u32>,
    pub max_auto_backups: Option<u32>,
}

/// Validated engine settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_path: PathBuf,
    pub backup_dir: PathBuf,
    pub catalog_path: PathBuf,
    /// Seeds the catalog on first open; afterwards the persisted value wins.
    pub external_backup_path: Option<PathBuf>,
    pub batch_size: u32,
    pub change_column: String,
    pub incremental_skew_secs: u64,
    pub stall_warning_secs: u64,
    pub auto_backup_interval_hours: u64,
    pub compress_auto_backups: bool,
    /// Seeds the catalog on first open; afterwards the persisted value wins.
    pub auto_backup_enabled: bool,
    /// Automatic backups run as full backups when no full backup is newer
    /// than this. 0 leaves every automatic backup incremental.
    pub auto_full_interval_days: u32,
    /// Automatic backups kept after each automatic run, newest first. 0 keeps
    /// all of them. Manual backups never count against it.
    pub max_auto_backups: u32,
}

impl EngineConfig {
    pub fn new(database_path: impl Into<PathBuf>, backup_dir: impl Into<PathBuf>) -> Self {
        let backup_dir = backup_dir.into();
        Self {
            database_path: database_path.into(),
            catalog_path: backup_dir.join("catalog.json"),
            backup_dir,
            external_backup_path: None,
            batch_size: DEFAULT_BATCH_SIZE,
            change_column: DEFAULT_CHANGE_COLUMN.to_string(),
            incremental_skew_secs: DEFAULT_INCREMENTAL_SKEW_SECS,
            stall_warning_secs: DEFAULT_STALL_WARNING_SECS,
            auto_backup_interval_hours: DEFAULT_AUTO_BACKUP_INTERVAL_HOURS,
            compress_auto_backups: true,
            auto_backup_enabled: true,
            auto_full_interval_days: DEFAULT_AUTO_FULL_INTERVAL_DAYS,
            max_auto_backups: DEFAULT_MAX_AUTO_BACKUPS,
        }
    }

    pub fn stall_threshold(&self) -> Duration {
        Duration::from_secs(self.stall_warning_secs)
    }

    pub fn auto_backup_interval(&self) -> Duration {
        Duration::from_secs(self.auto_backup_interval_hours * 3600)
    }

    /// Directory holding the live database file. Restore staging lives here so
    /// the final swap is a same-filesystem rename.
    pub fn data_dir(&self) -> PathBuf {
        match self.database_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub raw_json_config: RawJsonConfig, // Store the parsed raw config
}

impl AppConfig {
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        let raw_json_config: RawJsonConfig = serde_json::from_str(&config_content)
            .with_context(|| {
                format!(
                    "Failed to parse JSON from config file at {}",
                    config_path.display()
                )
            })?;

        let engine = load_engine_config_from_json(&raw_json_config)?;
        Ok(AppConfig {
            engine,
            raw_json_config,
        })
    }
}

/// `FIELDVAULT_CONFIG` when set, `config.json` in the working directory otherwise.
pub fn resolve_config_path() -> PathBuf {
    std::env::var_os(CONFIG_PATH_ENV)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}

pub fn load_engine_config_from_json(raw_config: &RawJsonConfig) -> Result<EngineConfig> {
    let database_path = raw_config
        .database_path
        .as_ref()
        .context("database_path must be set in config.json")?
        .clone();
    let backup_dir = raw_config
        .backup_dir
        .as_ref()
        .context("backup_dir must be set in config.json")?
        .clone();

    if database_path.as_os_str().is_empty() {
        anyhow::bail!("database_path cannot be empty in config.json.");
    }
    if backup_dir.as_os_str().is_empty() {
        anyhow::bail!("backup_dir cannot be empty in config.json.");
    }

    let mut config = EngineConfig::new(database_path, backup_dir);

    if let Some(catalog_path) = raw_config.catalog_path.clone() {
        config.catalog_path = catalog_path;
    }
    config.external_backup_path = raw_config
        .external_backup_path
        .clone()
        .filter(|p| !p.as_os_str().is_empty());

    if let Some(batch_size) = raw_config.batch_size {
        if batch_size == 0 {
            anyhow::bail!("batch_size must be greater than zero in config.json.");
        }
        config.batch_size = batch_size;
    }

    if let Some(column) = raw_config.change_column.as_ref() {
        let column = column.trim();
        if column.is_empty() {
            anyhow::bail!("change_column cannot be empty in config.json.");
        }
        config.change_column = column.to_string();
    }

    if let Some(hours) = raw_config.auto_backup_interval_hours {
        if hours == 0 {
            anyhow::bail!("auto_backup_interval_hours must be at least 1 in config.json.");
        }
        config.auto_backup_interval_hours = hours;
    }

    config.incremental_skew_secs = raw_config
        .incremental_skew_secs
        .unwrap_or(DEFAULT_INCREMENTAL_SKEW_SECS);
    config.stall_warning_secs = raw_config
        .stall_warning_secs
        .unwrap_or(DEFAULT_STALL_WARNING_SECS)
        .max(1);
    config.compress_auto_backups = raw_config.compress_auto_backups.unwrap_or(true);
    config.auto_backup_enabled = raw_config.auto_backup_enabled.unwrap_or(true);
    config.auto_full_interval_days = raw_config
        .auto_full_interval_days
        .unwrap_or(DEFAULT_AUTO_FULL_INTERVAL_DAYS);
    config.max_auto_backups = raw_config
        .max_auto_backups
        .unwrap_or(DEFAULT_MAX_AUTO_BACKUPS);

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: serde_json::Value) -> anyhow::Result<EngineConfig> {
        let raw: RawJsonConfig = serde_json::from_value(value)?;
        load_engine_config_from_json(&raw)
    }

    #[test]
    fn test_minimal_config_uses_defaults() -> anyhow::Result<()> {
        let config = parse(json!({
            "database_path": "/var/lib/farm/farm.db",
            "backup_dir": "/var/lib/farm/backups"
        }))?;

        assert_eq!(config.catalog_path, PathBuf::from("/var/lib/farm/backups/catalog.json"));
        assert_eq!(config.batch_size, 500);
        assert_eq!(config.change_column, "updated_at");
        assert_eq!(config.incremental_skew_secs, 300);
        assert_eq!(config.stall_warning_secs, 30);
        assert_eq!(config.auto_backup_interval(), Duration::from_secs(6 * 3600));
        assert!(config.compress_auto_backups);
        assert!(config.auto_backup_enabled);
        assert_eq!(config.auto_full_interval_days, 7);
        assert_eq!(config.max_auto_backups, 30);
        assert_eq!(config.external_backup_path, None);
        assert_eq!(config.data_dir(), PathBuf::from("/var/lib/farm"));
        Ok(())
    }

    #[test]
    fn test_overrides_are_applied() -> anyhow::Result<()> {
        let config = parse(json!({
            "database_path": "farm.db",
            "backup_dir": "backups",
            "catalog_path": "state/catalog.json",
            "external_backup_path": "/mnt/usb/farm",
            "batch_size": 50,
            "change_column": " modified_at ",
            "incremental_skew_secs": 0,
            "auto_backup_interval_hours": 24,
            "compress_auto_backups": false,
            "auto_backup_enabled": false,
            "auto_full_interval_days": 0,
            "max_auto_backups": 5
        }))?;

        assert_eq!(config.catalog_path, PathBuf::from("state/catalog.json"));
        assert_eq!(config.external_backup_path, Some(PathBuf::from("/mnt/usb/farm")));
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.change_column, "modified_at");
        assert_eq!(config.incremental_skew_secs, 0);
        assert_eq!(config.auto_backup_interval_hours, 24);
        assert!(!config.compress_auto_backups);
        assert!(!config.auto_backup_enabled);
        assert_eq!(config.auto_full_interval_days, 0);
        assert_eq!(config.max_auto_backups, 5);
        assert_eq!(config.data_dir(), PathBuf::from("."));
        Ok(())
    }

    #[test]
    fn test_missing_required_fields_are_rejected() {
        let err = parse(json!({ "backup_dir": "backups" })).unwrap_err();
        assert!(err.to_string().contains("database_path"));

        let err = parse(json!({ "database_path": "farm.db" })).unwrap_err();
        assert!(err.to_string().contains("backup_dir"));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(parse(json!({
            "database_path": "farm.db",
            "backup_dir": "backups",
            "batch_size": 0
        }))
        .is_err());

        assert!(parse(json!({
            "database_path": "farm.db",
            "backup_dir": "backups",
            "change_column": "  "
        }))
        .is_err());

        assert!(parse(json!({
            "database_path": "farm.db",
            "backup_dir": "backups",
            "auto_backup_interval_hours": 0
        }))
        .is_err());
    }

    #[test]
    fn test_load_from_json_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            json!({ "database_path": "farm.db", "backup_dir": "b" }).to_string(),
        )?;

        let app_config = AppConfig::load_from_json(&path)?;
        assert_eq!(app_config.engine.backup_dir, PathBuf::from("b"));

        let missing = AppConfig::load_from_json(&dir.path().join("nope.json"));
        assert!(missing.is_err());
        Ok(())
    }
}
