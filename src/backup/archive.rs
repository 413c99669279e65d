// fieldvault/src/backup/archive.rs
//! JSON Lines archive codec.
//!
//! An archive is a header line, one line per row, and a trailer line carrying
//! the row count and a SHA-256 over the exact bytes of every preceding line.
//! The whole stream is optionally gzip-compressed; readers sniff the gzip
//! magic instead of trusting the file extension.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use super::BackupMode;
use crate::errors::{BackupError, IoContext, Result};

pub const ARCHIVE_FORMAT: &str = "fieldvault-archive";
pub const ARCHIVE_VERSION: u32 = 1;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const BLOB_KEY: &str = "$blob";
const REAL_KEY: &str = "$real";

/// Rows between two validation progress callbacks.
pub const VALIDATION_REPORT_EVERY: u64 = 1_000;

fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableManifest {
    pub name: String,
    pub create_sql: String,
    pub columns: Vec<String>,
    /// Rows of this table present in the archive.
    pub rows: u64,
    /// Content is derived from other tables (external-content full-text
    /// indexes, unknown virtual table modules). No rows are archived and the
    /// row count is not checked after a restore.
    #[serde(default, skip_serializing_if = "is_false")]
    pub derived: bool,
    /// Run once the rows of every table are loaded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rebuild: Option<String>,
}

/// One `sqlite_sequence` entry: the AUTOINCREMENT high-water mark of a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceEntry {
    pub table: String,
    pub seq: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveHeader {
    pub format: String,
    pub version: u32,
    pub mode: BackupMode,
    /// Snapshot start, epoch seconds.
    pub created_at: i64,
    /// Lower bound of the change window for incremental archives.
    pub since: Option<String>,
    /// In restore order: parents before children.
    pub tables: Vec<TableManifest>,
    /// Indexes, views and triggers, applied after the data.
    pub schema: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sequences: Vec<SequenceEntry>,
}

impl ArchiveHeader {
    pub fn total_rows(&self) -> u64 {
        self.tables.iter().map(|t| t.rows).sum()
    }

    fn validate(&self) -> Result<()> {
        if self.format != ARCHIVE_FORMAT {
            return Err(BackupError::Validation(format!(
                "unknown archive format '{}'",
                self.format
            )));
        }
        if self.version == 0 || self.version > ARCHIVE_VERSION {
            return Err(BackupError::Validation(format!(
                "unsupported archive version {}",
                self.version
            )));
        }
        let mut seen = HashSet::new();
        for table in &self.tables {
            if !seen.insert(table.name.as_str()) {
                return Err(BackupError::Validation(format!(
                    "table '{}' listed twice in header",
                    table.name
                )));
            }
            if table.columns.is_empty() {
                return Err(BackupError::Validation(format!(
                    "table '{}' has no columns",
                    table.name
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowRecord {
    pub table: String,
    /// Column values in header column order.
    pub values: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArchiveLine {
    Header(ArchiveHeader),
    Row(RowRecord),
    Trailer { rows: u64, sha256: String },
}

/// Result of writing or verifying an archive.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveSummary {
    pub header: ArchiveHeader,
    pub rows: u64,
    pub checksum: String,
}

pub fn encode_blob(bytes: &[u8]) -> Value {
    let mut map = serde_json::Map::with_capacity(1);
    map.insert(BLOB_KEY.to_string(), Value::String(hex::encode(bytes)));
    Value::Object(map)
}

pub fn decode_blob(value: &Value) -> Option<Vec<u8>> {
    let map = value.as_object()?;
    if map.len() != 1 {
        return None;
    }
    hex::decode(map.get(BLOB_KEY)?.as_str()?).ok()
}

/// JSON numbers cannot hold infinities or NaN; those travel as
/// `{"$real": "inf" | "-inf" | "nan"}`.
pub fn encode_real(v: f64) -> Value {
    match serde_json::Number::from_f64(v) {
        Some(n) => Value::Number(n),
        None => {
            let tag = if v.is_nan() {
                "nan"
            } else if v.is_sign_negative() {
                "-inf"
            } else {
                "inf"
            };
            let mut map = serde_json::Map::with_capacity(1);
            map.insert(REAL_KEY.to_string(), Value::String(tag.to_string()));
            Value::Object(map)
        }
    }
}

pub fn decode_real(value: &Value) -> Option<f64> {
    let map = value.as_object()?;
    if map.len() != 1 {
        return None;
    }
    match map.get(REAL_KEY)?.as_str()? {
        "inf" => Some(f64::INFINITY),
        "-inf" => Some(f64::NEG_INFINITY),
        "nan" => Some(f64::NAN),
        _ => None,
    }
}

/// Scalars, encoded blobs and encoded non-finite reals are the only values a
/// row may carry.
fn is_storable(value: &Value) -> bool {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => true,
        Value::Object(_) => decode_blob(value).is_some() || decode_real(value).is_some(),
        Value::Array(_) => false,
    }
}

enum Sink {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Sink::Plain(w) => w.write(buf),
            Sink::Gzip(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Sink::Plain(w) => w.flush(),
            Sink::Gzip(w) => w.flush(),
        }
    }
}

/// Streams archive lines into a file, optionally through gzip.
pub struct ArchiveWriter {
    sink: Sink,
    hasher: Sha256,
    line: Vec<u8>,
    rows: u64,
    header: Option<ArchiveHeader>,
}

impl ArchiveWriter {
    pub fn new(file: File, compress: bool) -> Self {
        let buffered = BufWriter::new(file);
        let sink = if compress {
            Sink::Gzip(GzEncoder::new(buffered, Compression::default()))
        } else {
            Sink::Plain(buffered)
        };
        Self {
            sink,
            hasher: Sha256::new(),
            line: Vec::with_capacity(512),
            rows: 0,
            header: None,
        }
    }

    pub fn write_header(&mut self, header: &ArchiveHeader) -> Result<()> {
        self.write_line(&ArchiveLine::Header(header.clone()), true)?;
        self.header = Some(header.clone());
        Ok(())
    }

    pub fn write_row(&mut self, record: RowRecord) -> Result<()> {
        self.write_line(&ArchiveLine::Row(record), true)?;
        self.rows += 1;
        Ok(())
    }

    fn write_line(&mut self, line: &ArchiveLine, hashed: bool) -> Result<()> {
        self.line.clear();
        serde_json::to_writer(&mut self.line, line)
            .map_err(io::Error::from)
            .io_context(|| "Failed to serialize archive line")?;
        self.line.push(b'\n');
        if hashed {
            self.hasher.update(&self.line);
        }
        self.sink
            .write_all(&self.line)
            .io_context(|| "Failed to write archive line")
    }

    /// Writes the trailer, finishes compression, flushes and fsyncs. Returns
    /// the underlying file so the caller decides when to close it.
    pub fn finish(mut self) -> Result<(File, ArchiveSummary)> {
        let header = self.header.take().ok_or_else(|| {
            BackupError::Internal("archive finished without a header".to_string())
        })?;
        let checksum = hex::encode(self.hasher.clone().finalize());
        let rows = self.rows;
        self.write_line(&ArchiveLine::Trailer { rows, sha256: checksum.clone() }, false)?;

        let buffered = match self.sink {
            Sink::Plain(w) => w,
            Sink::Gzip(encoder) => encoder
                .finish()
                .io_context(|| "Failed to finish gzip stream")?,
        };
        let file = buffered
            .into_inner()
            .map_err(|e| e.into_error())
            .io_context(|| "Failed to flush archive")?;
        file.sync_all().io_context(|| "Failed to sync archive to disk")?;

        Ok((
            file,
            ArchiveSummary {
                header,
                rows,
                checksum,
            },
        ))
    }
}

/// Decoding failures of the stream itself mean a corrupt archive, not a
/// failing disk.
fn read_error(path: &Path, e: io::Error) -> BackupError {
    match e.kind() {
        io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput | io::ErrorKind::UnexpectedEof => {
            BackupError::Validation(format!("{} is unreadable: {}", path.display(), e))
        }
        _ => BackupError::io(format!("Failed to read archive {}", path.display()), e),
    }
}

/// Sequential, validating archive reader. Every row is checked against the
/// header; the trailer is checked against the running checksum and counts.
pub struct ArchiveReader {
    path: std::path::PathBuf,
    input: Box<dyn BufRead + Send>,
    hasher: Sha256,
    header: ArchiveHeader,
    widths: HashMap<String, usize>,
    seen: HashMap<String, u64>,
    rows: u64,
    line_no: u64,
    buf: String,
    checksum: Option<String>,
}

impl ArchiveReader {
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)
            .io_context(|| format!("Failed to open archive file: {}", path.display()))?;

        let mut magic = [0u8; 2];
        let sniffed = read_prefix(&mut file, &mut magic)
            .io_context(|| format!("Failed to read archive file: {}", path.display()))?;
        file.seek(SeekFrom::Start(0))
            .io_context(|| format!("Failed to rewind archive file: {}", path.display()))?;

        let input: Box<dyn BufRead + Send> = if sniffed == 2 && magic == GZIP_MAGIC {
            Box::new(BufReader::new(GzDecoder::new(file)))
        } else {
            Box::new(BufReader::new(file))
        };

        let mut reader = Self {
            path: path.to_path_buf(),
            input,
            hasher: Sha256::new(),
            header: placeholder_header(),
            widths: HashMap::new(),
            seen: HashMap::new(),
            rows: 0,
            line_no: 0,
            buf: String::new(),
            checksum: None,
        };

        match reader.next_line()? {
            Some(ArchiveLine::Header(header)) => {
                header.validate()?;
                reader.hasher.update(reader.buf.as_bytes());
                reader.widths = header
                    .tables
                    .iter()
                    .map(|t| (t.name.clone(), t.columns.len()))
                    .collect();
                reader.header = header;
                Ok(reader)
            }
            Some(_) => Err(BackupError::Validation(
                "archive does not start with a header".to_string(),
            )),
            None => Err(BackupError::Validation("archive is empty".to_string())),
        }
    }

    pub fn header(&self) -> &ArchiveHeader {
        &self.header
    }

    fn next_line(&mut self) -> Result<Option<ArchiveLine>> {
        self.buf.clear();
        let read = self
            .input
            .read_line(&mut self.buf)
            .map_err(|e| read_error(&self.path, e))?;
        if read == 0 {
            return Ok(None);
        }
        self.line_no += 1;
        if !self.buf.ends_with('\n') {
            return Err(BackupError::Validation(format!(
                "line {} is truncated",
                self.line_no
            )));
        }
        serde_json::from_str(&self.buf)
            .map(Some)
            .map_err(|e| BackupError::Validation(format!("line {}: {}", self.line_no, e)))
    }

    /// Next row, or `None` once the trailer was read and checked.
    pub fn next_row(&mut self) -> Result<Option<RowRecord>> {
        if self.checksum.is_some() {
            return Ok(None);
        }
        match self.next_line()? {
            Some(ArchiveLine::Row(record)) => {
                self.check_row(&record)?;
                self.hasher.update(self.buf.as_bytes());
                *self.seen.entry(record.table.clone()).or_insert(0) += 1;
                self.rows += 1;
                Ok(Some(record))
            }
            Some(ArchiveLine::Trailer { rows, sha256 }) => {
                self.check_trailer(rows, &sha256)?;
                if self.next_line()?.is_some() {
                    return Err(BackupError::Validation(format!(
                        "unexpected data after trailer at line {}",
                        self.line_no
                    )));
                }
                self.checksum = Some(sha256);
                Ok(None)
            }
            Some(ArchiveLine::Header(_)) => Err(BackupError::Validation(format!(
                "unexpected second header at line {}",
                self.line_no
            ))),
            None => Err(BackupError::Validation(
                "archive ends without a trailer".to_string(),
            )),
        }
    }

    fn check_row(&self, record: &RowRecord) -> Result<()> {
        let width = self.widths.get(&record.table).ok_or_else(|| {
            BackupError::Validation(format!(
                "line {}: table '{}' is not in the header",
                self.line_no, record.table
            ))
        })?;
        if record.values.len() != *width {
            return Err(BackupError::Validation(format!(
                "line {}: expected {} values for '{}', found {}",
                self.line_no,
                width,
                record.table,
                record.values.len()
            )));
        }
        if let Some(bad) = record.values.iter().position(|v| !is_storable(v)) {
            return Err(BackupError::Validation(format!(
                "line {}: value {} of '{}' is not a storable scalar",
                self.line_no, bad, record.table
            )));
        }
        Ok(())
    }

    fn check_trailer(&self, rows: u64, sha256: &str) -> Result<()> {
        let actual = hex::encode(self.hasher.clone().finalize());
        if actual != sha256 {
            return Err(BackupError::Validation(format!(
                "checksum mismatch: trailer says {}, content hashes to {}",
                sha256, actual
            )));
        }
        if rows != self.rows {
            return Err(BackupError::Validation(format!(
                "trailer announces {} rows, archive holds {}",
                rows, self.rows
            )));
        }
        for table in &self.header.tables {
            let seen = self.seen.get(&table.name).copied().unwrap_or(0);
            if seen != table.rows {
                return Err(BackupError::Validation(format!(
                    "table '{}': header announces {} rows, archive holds {}",
                    table.name, table.rows, seen
                )));
            }
        }
        Ok(())
    }

    /// Available once `next_row` returned `None`.
    pub fn into_summary(self) -> Result<ArchiveSummary> {
        let checksum = self.checksum.ok_or_else(|| {
            BackupError::Internal("archive summary requested before the trailer".to_string())
        })?;
        Ok(ArchiveSummary {
            header: self.header,
            rows: self.rows,
            checksum,
        })
    }
}

fn read_prefix(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

fn placeholder_header() -> ArchiveHeader {
    ArchiveHeader {
        format: String::new(),
        version: 0,
        mode: BackupMode::Full,
        created_at: 0,
        since: None,
        tables: Vec::new(),
        schema: Vec::new(),
        sequences: Vec::new(),
    }
}

/// Reads the whole archive and checks header, row shapes, per-table counts
/// and the trailer checksum.
pub fn verify_archive(path: &Path) -> Result<ArchiveSummary> {
    verify_archive_with(path, |_| Ok(()))
}

/// Like [`verify_archive`], calling `on_progress` with the number of rows
/// checked so far every [`VALIDATION_REPORT_EVERY`] rows. An error from the
/// callback aborts the pass.
pub fn verify_archive_with<F>(path: &Path, mut on_progress: F) -> Result<ArchiveSummary>
where
    F: FnMut(u64) -> Result<()>,
{
    let mut reader = ArchiveReader::open(path)?;
    let mut checked = 0u64;
    while reader.next_row()?.is_some() {
        checked += 1;
        if checked % VALIDATION_REPORT_EVERY == 0 {
            on_progress(checked)?;
        }
    }
    reader.into_summary()
}
