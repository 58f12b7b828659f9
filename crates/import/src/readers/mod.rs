//! Format readers. Every container kind produces the same `RawTable` through
//! [`read_container`]; archives recurse back into it per entry.

pub mod archive;
pub mod delimited;
pub mod json;
pub mod parquet;
pub mod pdf;
pub mod spreadsheet;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use tally_core::{Amount, RawRecord, RawTable};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ReaderConfig;

const LARGE_INPUT_ROWS: usize = 50_000;
const LARGE_INPUT_BYTES: usize = 50 * 1024 * 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReadError {
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("Corrupt container: {0}")]
    CorruptContainer(String),
    #[error("No data rows")]
    EmptyInput,
    #[error("No table structure found")]
    NoTableFound,
    #[error("Read cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerKind {
    Csv,
    Xlsx,
    Json,
    Txt,
    Parquet,
    Pdf,
    Zip,
}

impl ContainerKind {
    pub const ALL: [ContainerKind; 7] = [
        ContainerKind::Csv,
        ContainerKind::Xlsx,
        ContainerKind::Json,
        ContainerKind::Txt,
        ContainerKind::Parquet,
        ContainerKind::Pdf,
        ContainerKind::Zip,
    ];

    pub fn tag(self) -> &'static str {
        match self {
            ContainerKind::Csv => "csv",
            ContainerKind::Xlsx => "xlsx",
            ContainerKind::Json => "json",
            ContainerKind::Txt => "txt",
            ContainerKind::Parquet => "parquet",
            ContainerKind::Pdf => "pdf",
            ContainerKind::Zip => "zip",
        }
    }

    pub fn from_tag(tag: &str) -> Result<Self, ReadError> {
        let tag = tag.trim().trim_start_matches('.');
        ContainerKind::ALL
            .into_iter()
            .find(|k| k.tag().eq_ignore_ascii_case(tag))
            .ok_or_else(|| ReadError::UnsupportedFormat(tag.to_string()))
    }

    pub fn from_file_name(name: &str) -> Option<Self> {
        let (_, ext) = name.rsplit_once('.')?;
        Self::from_tag(ext).ok()
    }

    /// Identify a container from its leading bytes.
    pub fn sniff(data: &[u8]) -> Option<Self> {
        if data.starts_with(b"%PDF") {
            return Some(ContainerKind::Pdf);
        }
        if data.starts_with(b"PAR1") {
            return Some(ContainerKind::Parquet);
        }
        if data.starts_with(b"PK\x03\x04") {
            return Some(if zip_has_entry(data, "xl/workbook.xml") {
                ContainerKind::Xlsx
            } else {
                ContainerKind::Zip
            });
        }
        let head = String::from_utf8_lossy(&data[..data.len().min(4096)]);
        let text = head.trim_start_matches('\u{feff}').trim_start();
        if text.starts_with('[') || text.starts_with('{') {
            return Some(ContainerKind::Json);
        }
        let first_line = text.lines().next()?;
        if first_line.contains('\t') {
            Some(ContainerKind::Txt)
        } else if first_line.contains(',') || first_line.contains(';') {
            Some(ContainerKind::Csv)
        } else {
            None
        }
    }

    /// Declared kind wins; otherwise magic bytes, then the file extension.
    pub fn detect(declared: Option<ContainerKind>, file_name: &str, data: &[u8]) -> Result<Self, ReadError> {
        if let Some(kind) = declared {
            return Ok(kind);
        }
        let by_name = Self::from_file_name(file_name);
        let by_bytes = Self::sniff(data);
        match (by_bytes, by_name) {
            // Binary signatures are authoritative.
            (Some(k @ (ContainerKind::Pdf | ContainerKind::Parquet | ContainerKind::Xlsx | ContainerKind::Zip)), _) => Ok(k),
            (_, Some(k)) => Ok(k),
            (Some(k), None) => Ok(k),
            (None, None) => Err(ReadError::UnsupportedFormat(file_name.to_string())),
        }
    }
}

impl fmt::Display for ContainerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

fn zip_has_entry(data: &[u8], name: &str) -> bool {
    zip::ZipArchive::new(std::io::Cursor::new(data))
        .map(|archive| archive.file_names().any(|n| n == name))
        .unwrap_or(false)
}

/// Per-read settings plus the cancellation signal checked between row batches.
#[derive(Debug, Clone)]
pub struct ReadContext {
    pub batch_size: usize,
    pub max_archive_depth: usize,
    pub cancel: CancellationToken,
    depth: usize,
}

impl ReadContext {
    pub fn new(config: &ReaderConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            max_archive_depth: config.max_archive_depth,
            cancel: CancellationToken::new(),
            depth: 0,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub(crate) fn nested(&self) -> Self {
        Self {
            depth: self.depth + 1,
            ..self.clone()
        }
    }

    pub(crate) fn check_cancelled(&self) -> Result<(), ReadError> {
        if self.cancel.is_cancelled() {
            Err(ReadError::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl Default for ReadContext {
    fn default() -> Self {
        Self::new(&ReaderConfig::default())
    }
}

/// Output of a read: the table plus archive entries that could not be read.
#[derive(Debug, Default)]
pub struct ReadOutput {
    pub table: RawTable,
    pub skipped: Vec<SkippedEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedEntry {
    pub path: String,
    pub error: ReadError,
}

/// Accumulates records and checks for cancellation every `batch_size` rows.
pub(crate) struct RowCollector<'a> {
    ctx: &'a ReadContext,
    table: RawTable,
    since_check: usize,
}

impl<'a> RowCollector<'a> {
    pub(crate) fn new(ctx: &'a ReadContext) -> Result<Self, ReadError> {
        ctx.check_cancelled()?;
        Ok(Self {
            ctx,
            table: RawTable::new(),
            since_check: 0,
        })
    }

    /// Blank rows are skipped rather than turned into rejects.
    pub(crate) fn push(&mut self, record: RawRecord) -> Result<(), ReadError> {
        if record.is_blank() {
            return Ok(());
        }
        self.table.push(record);
        self.since_check += 1;
        if self.since_check >= self.ctx.batch_size {
            self.since_check = 0;
            self.ctx.check_cancelled()?;
        }
        Ok(())
    }

    pub(crate) fn finish(self) -> Result<RawTable, ReadError> {
        self.ctx.check_cancelled()?;
        if self.table.is_empty() {
            return Err(ReadError::EmptyInput);
        }
        Ok(self.table)
    }
}

/// Read `data` as `kind`. `file_id` becomes the provenance file id.
pub fn read_container(
    kind: ContainerKind,
    file_id: &str,
    data: &[u8],
    ctx: &ReadContext,
) -> Result<ReadOutput, ReadError> {
    if data.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ReadError::EmptyInput);
    }
    if data.len() > LARGE_INPUT_BYTES {
        warn!(file_id, bytes = data.len(), "Large file detected; processing may take longer");
    }

    let output = match kind {
        ContainerKind::Csv => delimited::read(file_id, data, b',', ctx).map(ReadOutput::from)?,
        ContainerKind::Txt => delimited::read(file_id, data, b'\t', ctx).map(ReadOutput::from)?,
        ContainerKind::Json => json::read(file_id, data, ctx).map(ReadOutput::from)?,
        ContainerKind::Xlsx => spreadsheet::read(file_id, data, ctx).map(ReadOutput::from)?,
        ContainerKind::Parquet => parquet::read(file_id, data, ctx).map(ReadOutput::from)?,
        ContainerKind::Pdf => pdf::read(file_id, data, ctx).map(ReadOutput::from)?,
        ContainerKind::Zip => archive::read(file_id, data, ctx)?,
    };

    let rows = output.table.len();
    if rows > LARGE_INPUT_ROWS {
        warn!(file_id, rows, "Large dataset detected");
    }
    info!(file_id, kind = %kind, rows, columns = output.table.labels.len(), "Read container");
    Ok(output)
}

impl From<RawTable> for ReadOutput {
    fn from(table: RawTable) -> Self {
        ReadOutput {
            table,
            skipped: Vec::new(),
        }
    }
}

// ── Header handling ───────────────────────────────────────────────────────────

fn re_date_like() -> &'static Regex {
    static R: OnceLock<Regex> = OnceLock::new();
    R.get_or_init(|| Regex::new(r"^\d{1,4}[-/.]\d{1,2}[-/.]\d{1,4}").expect("invalid regex"))
}

/// True when a cell reads like data rather than a column label.
fn looks_like_value(cell: &str) -> bool {
    let cell = cell.trim();
    !cell.is_empty() && (Amount::parse(cell).is_ok() || re_date_like().is_match(cell))
}

/// Decide whether `row` is a header. Returns cleaned, unique labels if it is,
/// `None` if the file has no header and `row` is already data.
pub(crate) fn header_labels<S: AsRef<str>>(row: &[S]) -> Option<Vec<String>> {
    let cells: Vec<&str> = row
        .iter()
        .map(|c| c.as_ref().trim().trim_start_matches('\u{feff}'))
        .collect();
    let all_blank = cells.iter().all(|c| c.is_empty());
    let all_unnamed = cells.iter().all(|c| c.to_lowercase().starts_with("unnamed"));
    if all_blank || all_unnamed || cells.iter().any(|c| looks_like_value(c)) {
        return None;
    }

    let mut labels: Vec<String> = Vec::with_capacity(cells.len());
    for (i, cell) in cells.iter().enumerate() {
        let base = if cell.is_empty() { format!("col_{i}") } else { cell.to_string() };
        let mut label = base.clone();
        let mut n = 2;
        while labels.iter().any(|l| l == &label) {
            label = format!("{base}_{n}");
            n += 1;
        }
        labels.push(label);
    }
    Some(labels)
}

pub(crate) fn positional_labels(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("col_{i}")).collect()
}
