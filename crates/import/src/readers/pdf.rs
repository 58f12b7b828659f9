use std::panic;
use std::sync::OnceLock;

use regex::Regex;
use tally_core::{Provenance, RawRecord, RawTable};
use tracing::debug;

use super::{header_labels, positional_labels, ReadContext, ReadError, RowCollector};
use crate::mapper::names_canonical_field;

/// Pages in extracted text are separated by form feeds.
const PAGE_BREAK: char = '\u{c}';

fn re_column_gap() -> &'static Regex {
    static R: OnceLock<Regex> = OnceLock::new();
    R.get_or_init(|| Regex::new(r"\t|\s{2,}").expect("invalid regex"))
}

/// A cell of a text line with its character span on that line.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Cell {
    start: usize,
    end: usize,
    text: String,
}

fn split_cells(line: &str) -> Vec<Cell> {
    let mut cells = Vec::new();
    let mut from = 0;
    let gaps = re_column_gap()
        .find_iter(line)
        .map(|m| (m.start(), m.end()))
        .chain(std::iter::once((line.len(), line.len())));
    for (gap_start, gap_end) in gaps {
        let raw = &line[from..gap_start];
        let text = raw.trim();
        if !text.is_empty() {
            let lead = raw.len() - raw.trim_start().len();
            let start = line[..from + lead].chars().count();
            cells.push(Cell {
                start,
                end: start + text.chars().count(),
                text: text.to_string(),
            });
        }
        from = gap_end;
    }
    cells
}

/// The active table header with the column each label starts at.
struct Header {
    labels: Vec<String>,
    starts: Vec<usize>,
}

impl Header {
    fn new(labels: Vec<String>, cells: &[Cell]) -> Self {
        Self {
            labels,
            starts: cells.iter().map(|c| c.start).collect(),
        }
    }

    /// Column whose span overlaps `cell` most; the nearest start when none does.
    fn column_of(&self, cell: &Cell) -> usize {
        let spans = self
            .starts
            .iter()
            .enumerate()
            .map(|(i, &start)| (start, self.starts.get(i + 1).copied().unwrap_or(usize::MAX)));
        let (best, overlap) = spans
            .enumerate()
            .map(|(i, (lo, hi))| (i, cell.end.min(hi).saturating_sub(cell.start.max(lo))))
            .fold((0, 0), |acc, cur| if cur.1 > acc.1 { cur } else { acc });
        if overlap > 0 {
            return best;
        }
        (0..self.starts.len())
            .min_by_key(|&i| self.starts[i].abs_diff(cell.start))
            .unwrap_or(0)
    }

    /// Lay `cells` out under the header. A full row maps one to one. A short
    /// row is placed by column position, leaving blanks where cells are
    /// missing. Rows that cannot be placed keep their order, and cells beyond
    /// the header get positional labels so nothing is lost.
    fn align(&self, cells: Vec<Cell>) -> (Vec<String>, Vec<String>) {
        let width = self.labels.len();
        if cells.len() < width {
            let columns: Vec<usize> = cells.iter().map(|c| self.column_of(c)).collect();
            if columns.windows(2).all(|w| w[0] < w[1]) {
                let mut values = vec![String::new(); width];
                for (cell, column) in cells.into_iter().zip(columns) {
                    values[column] = cell.text;
                }
                return (self.labels.clone(), values);
            }
        }
        let mut labels = self.labels.clone();
        labels.extend((width..cells.len()).map(|i| format!("col_{i}")));
        (labels, cells.into_iter().map(|c| c.text).collect())
    }
}

/// At least two labels must name a canonical field before a header may replace
/// the one already in force.
fn reads_like_schema(labels: &[String]) -> bool {
    labels.iter().filter(|l| names_canonical_field(l)).count() >= 2
}

/// A row recovered from rendered text, with the page it was found on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TextRow {
    pub page: usize,
    pub labels: Vec<String>,
    pub values: Vec<String>,
}

/// Recover table rows from page text. Columns are separated by runs of two or
/// more spaces. A header line opens a table that may continue across pages and
/// is only replaced by a line that reads like a column header; other label-like
/// lines inside a table are prose. Data lines are aligned to the header by
/// column position, so blank cells do not drop the row.
pub(crate) fn detect_rows(text: &str) -> Vec<TextRow> {
    let mut out = Vec::new();
    let mut header: Option<Header> = None;

    for (page, page_text) in text.split(PAGE_BREAK).enumerate() {
        for line in page_text.lines() {
            let cells = split_cells(line);
            if cells.len() < 2 {
                continue;
            }
            let texts: Vec<&str> = cells.iter().map(|c| c.text.as_str()).collect();
            match header_labels(&texts) {
                Some(labels) => match &header {
                    Some(current) if current.labels == labels => {}
                    Some(_) if !reads_like_schema(&labels) => {
                        debug!(page, line, "Skipping label-like line inside table");
                    }
                    _ => header = Some(Header::new(labels, &cells)),
                },
                None => {
                    if header.is_none() && cells.len() >= 3 {
                        header = Some(Header::new(positional_labels(cells.len()), &cells));
                    }
                    if let Some(current) = &header {
                        let (labels, values) = current.align(cells);
                        out.push(TextRow { page, labels, values });
                    }
                }
            }
        }
    }
    out
}

fn extract_text(data: &[u8]) -> Result<String, ReadError> {
    // The extractor panics on some malformed documents.
    match panic::catch_unwind(|| pdf_extract::extract_text_from_mem(data)) {
        Ok(Ok(text)) => Ok(text),
        Ok(Err(e)) => Err(ReadError::CorruptContainer(format!("PDF: {e}"))),
        Err(_) => Err(ReadError::CorruptContainer("PDF: text extraction failed".into())),
    }
}

/// Best-effort extraction of tabular rows from a rendered document.
pub fn read(file_id: &str, data: &[u8], ctx: &ReadContext) -> Result<RawTable, ReadError> {
    let text = extract_text(data)?;
    let detected = detect_rows(&text);
    debug!(file_id, rows = detected.len(), "Detected rows in document text");
    if detected.is_empty() {
        return Err(ReadError::NoTableFound);
    }

    let mut rows = RowCollector::new(ctx)?;
    for (row_index, row) in detected.into_iter().enumerate() {
        let provenance = Provenance::new(file_id, row_index).with_page(row.page);
        rows.push(RawRecord::from_row(&row.labels, &row.values, provenance))?;
    }
    rows.finish()
}
