// fieldvault/src/backup/replicate.rs
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::Builder;
use tracing::{info, warn};

use crate::errors::ReplicationWarning;
use crate::utils::{fsync_dir, PARTIAL_SUFFIX};

/// Copies a finished archive into `external_dir` under the same file name.
///
/// The copy goes to a `.partial` temp file first and is renamed into place
/// once synced, so a half-written copy never looks like a valid archive.
/// Failures come back as a warning; the primary backup is unaffected.
pub fn replicate_archive(archive: &Path, external_dir: &Path) -> Result<PathBuf, ReplicationWarning> {
    let warning = |message: String| {
        warn!(target_dir = %external_dir.display(), "Replication failed: {}", message);
        ReplicationWarning {
            target: external_dir.to_path_buf(),
            message,
        }
    };

    if !external_dir.is_dir() {
        return Err(warning(format!(
            "External backup directory does not exist: {}",
            external_dir.display()
        )));
    }
    let file_name = archive
        .file_name()
        .ok_or_else(|| warning(format!("Archive path has no file name: {}", archive.display())))?;
    let destination = external_dir.join(file_name);

    copy_atomically(archive, external_dir, &destination)
        .map_err(|e| warning(format!("Failed to copy {}: {}", archive.display(), e)))?;

    info!(
        source = %archive.display(),
        destination = %destination.display(),
        "Replicated backup to external location"
    );
    Ok(destination)
}

fn copy_atomically(source: &Path, dir: &Path, destination: &Path) -> io::Result<()> {
    let mut reader = BufReader::new(File::open(source)?);
    let tmp = Builder::new()
        .prefix(".fieldvault-copy-")
        .suffix(PARTIAL_SUFFIX)
        .tempfile_in(dir)?;

    let mut writer = BufWriter::new(tmp);
    io::copy(&mut reader, &mut writer)?;
    writer.flush()?;
    let tmp = writer.into_inner().map_err(|e| e.into_error())?;
    tmp.as_file().sync_all()?;
    tmp.persist(destination).map_err(|e| e.error)?;
    fsync_dir(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_copy_lands_under_same_name() -> anyhow::Result<()> {
        let primary = tempfile::tempdir()?;
        let external = tempfile::tempdir()?;
        let archive = primary.path().join("manual_full_20250101_000000_000.jsonl.gz");
        fs::write(&archive, b"compressed-bytes")?;

        let copied = replicate_archive(&archive, external.path())
            .map_err(|w| anyhow::anyhow!(w.to_string()))?;
        assert_eq!(copied, external.path().join("manual_full_20250101_000000_000.jsonl.gz"));
        assert_eq!(fs::read(&copied)?, b"compressed-bytes");
        // Copy, not move.
        assert!(archive.exists());

        let leftovers: Vec<_> = fs::read_dir(external.path())?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(PARTIAL_SUFFIX))
            .collect();
        assert!(leftovers.is_empty());
        Ok(())
    }

    #[test]
    fn test_missing_directory_is_a_warning() -> anyhow::Result<()> {
        let primary = tempfile::tempdir()?;
        let archive = primary.path().join("a.jsonl");
        fs::write(&archive, b"x")?;

        let missing = primary.path().join("unplugged-usb");
        let warning = replicate_archive(&archive, &missing).unwrap_err();
        assert_eq!(warning.target, missing);
        assert!(warning.message.contains("does not exist"));
        Ok(())
    }
}
