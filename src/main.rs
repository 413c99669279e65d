//! fieldvault command line
//!
//! Thin CLI over the backup engine: backups, restores, listing, retention and
//! maintenance for the dataset named in config.json.

use anyhow::{Context, Result};
use fieldvault::config::{resolve_config_path, AppConfig};
use fieldvault::engine::OperationHandle;
use fieldvault::scheduler::spawn_auto_backup;
use fieldvault::{BackupEngine, BackupMode, OperationPhase};
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const PROGRESS_POLL: Duration = Duration::from_millis(200);

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fieldvault=info")),
        )
        .init();

    match run_app().await {
        Ok(_) => {
            println!("✅ Operation completed successfully.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app() -> Result<()> {
    let config_path = resolve_config_path();
    let app_config = AppConfig::load_from_json(&config_path).with_context(|| {
        format!("Failed to load application configuration from {}", config_path.display())
    })?;

    let args: Vec<String> = env::args().skip(1).collect();
    let Some(command) = args.first().map(|a| a.trim().to_string()) else {
        print_usage();
        anyhow::bail!("No command given");
    };

    let engine = BackupEngine::open(app_config.engine.clone())
        .await
        .context("Failed to open the dataset")?;

    match command.as_str() {
        "backup" => {
            let mode = match args.get(1).filter(|a| !a.starts_with("--")) {
                Some(mode) => mode.parse::<BackupMode>()?,
                None => BackupMode::Full,
            };
            let compress = args.iter().any(|a| a == "--compress");
            println!("🚀 Starting {} backup...", mode);
            let handle = engine.start_backup(mode, compress)?;
            let outcome = follow(&engine, handle).await.context("Backup failed")?;
            if outcome.requested_mode != outcome.record.mode {
                println!("ℹ️ No previous backup found, a full backup was taken instead.");
            }
            println!(
                "📦 {} ({} rows, {} bytes)",
                outcome.record.path.display(),
                outcome.record.row_count,
                outcome.record.size_bytes
            );
            for warning in &outcome.warnings {
                println!("⚠️ {}", warning);
            }
        }
        "restore" => {
            let archive = args
                .get(1)
                .map(PathBuf::from)
                .context("Usage: fieldvault restore <archive>")?;
            println!("🔄 Restoring from {}...", archive.display());
            let handle = engine.restore(archive)?;
            let outcome = follow(&engine, handle).await.context("Restore failed")?;
            println!(
                "🗄️ Restored {} rows across {} tables. Restart the application before using the dataset.",
                outcome.rows, outcome.tables
            );
        }
        "list" => {
            let backups = engine.list_backups();
            if backups.is_empty() {
                println!("No backups recorded.");
            }
            for record in backups {
                let when = chrono::DateTime::from_timestamp(record.created_at, 0)
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| record.created_at.to_string());
                println!(
                    "{}  {:<11}  {:>6}  {:>10} B  {}",
                    when,
                    record.mode.to_string(),
                    if record.is_auto { "auto" } else { "manual" },
                    record.size_bytes,
                    record.filename
                );
            }
        }
        "status" => {
            let status = engine.get_status();
            println!("{}", serde_json::to_string_pretty(&status)?);
            match engine.external_path() {
                Some(path) => println!("External copy: {}", path.display()),
                None => println!("External copy: disabled"),
            }
        }
        "cleanup" => {
            let days: u32 = args
                .get(1)
                .context("Usage: fieldvault cleanup <retention_days>")?
                .parse()
                .context("retention_days must be a non-negative integer")?;
            let report = engine.cleanup(days)?;
            println!(
                "🧹 Deleted {} backup(s), freed {} bytes.",
                report.deleted_count, report.freed_bytes
            );
        }
        "delete" => {
            let filename = args.get(1).context("Usage: fieldvault delete <filename>")?;
            let freed = engine.delete_backup(filename)?;
            println!("🗑️ Deleted {} ({} bytes).", filename, freed);
        }
        "maintenance" => {
            println!("⚙️ Running maintenance...");
            engine.run_maintenance().await?;
        }
        "set-external" => {
            let path = args
                .get(1)
                .context("Usage: fieldvault set-external <dir|->")?;
            let path = (path != "-").then(|| PathBuf::from(path));
            engine.set_external_path(path)?;
        }
        "auto" => {
            let shutdown = CancellationToken::new();
            let scheduler = spawn_auto_backup(engine.clone(), shutdown.clone());
            println!(
                "⏱️ Automatic backups every {} hour(s). Press Ctrl-C to stop.",
                engine.config().auto_backup_interval_hours
            );
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;
            engine.cancel_operation();
            shutdown.cancel();
            scheduler.await.context("Scheduler task panicked")?;
        }
        other => {
            print_usage();
            anyhow::bail!("Unknown command '{}'", other);
        }
    }
    Ok(())
}

/// Prints progress until the operation ends. Ctrl-C requests cancellation.
async fn follow<T>(engine: &BackupEngine, handle: OperationHandle<T>) -> fieldvault::errors::Result<T> {
    let mut ticker = tokio::time::interval(PROGRESS_POLL);
    let mut last_line = String::new();
    let mut cancel_sent = false;

    while !handle.is_finished() {
        tokio::select! {
            _ = ticker.tick() => {}
            signal = tokio::signal::ctrl_c(), if !cancel_sent => {
                if signal.is_ok() && engine.cancel_operation() {
                    println!("🛑 Cancelling...");
                }
                cancel_sent = true;
            }
        }

        let progress = engine.get_progress();
        if progress.phase == OperationPhase::Idle {
            continue;
        }
        let line = format!(
            "[{:>5.1}%] {}{}",
            progress.percentage,
            progress.message,
            match progress.estimated_remaining_seconds {
                eta if eta > 0 => format!(" (~{}s left)", eta),
                _ => String::new(),
            }
        );
        if line != last_line {
            println!("{}", line);
            if progress.stalled {
                println!("⚠️ No progress for a while, still working...");
            }
            last_line = line;
        }
    }
    handle.wait().await
}

fn print_usage() {
    println!("Usage: fieldvault <command>");
    println!("  backup [full|incremental] [--compress]");
    println!("  restore <archive>");
    println!("  list");
    println!("  status");
    println!("  cleanup <retention_days>");
    println!("  delete <filename>");
    println!("  maintenance");
    println!("  set-external <dir|->");
    println!("  auto");
}
