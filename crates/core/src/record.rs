use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a raw row came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    /// Identifier of the uploaded file (usually its name).
    pub file_id: String,
    /// Path of the entry inside an archive, `/`-joined for nested archives.
    pub inner_path: Option<String>,
    /// Zero-based worksheet index for spreadsheets.
    pub sheet: Option<usize>,
    /// Zero-based page index for rendered documents.
    pub page: Option<usize>,
    /// Zero-based data row index within the innermost container (headers excluded).
    pub row: usize,
}

impl Provenance {
    pub fn new(file_id: impl Into<String>, row: usize) -> Self {
        Self {
            file_id: file_id.into(),
            inner_path: None,
            sheet: None,
            page: None,
            row,
        }
    }

    pub fn with_sheet(mut self, sheet: usize) -> Self {
        self.sheet = Some(sheet);
        self
    }

    pub fn with_page(mut self, page: usize) -> Self {
        self.page = Some(page);
        self
    }

    /// Re-root a record read from an archive entry under the archive itself.
    pub fn nest_under(mut self, archive_file_id: &str) -> Self {
        let inner = match self.inner_path.take() {
            Some(rest) => format!("{}/{}", self.file_id, rest),
            None => self.file_id.clone(),
        };
        self.inner_path = Some(inner);
        self.file_id = archive_file_id.to_string();
        self
    }

    /// Stable textual reference, e.g. `statements/jan.xlsx#sheet=0#row=12`.
    pub fn raw_ref(&self) -> String {
        let mut out = match &self.inner_path {
            Some(inner) => inner.clone(),
            None => String::new(),
        };
        if let Some(sheet) = self.sheet {
            out.push_str(&format!("#sheet={sheet}"));
        }
        if let Some(page) = self.page {
            out.push_str(&format!("#page={page}"));
        }
        out.push_str(&format!("#row={}", self.row));
        out
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.file_id, self.raw_ref())
    }
}

/// One source row: ordered `(label, value)` cells plus where it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    cells: Vec<(String, String)>,
    provenance: Provenance,
}

impl RawRecord {
    pub fn new(cells: Vec<(String, String)>, provenance: Provenance) -> Self {
        Self { cells, provenance }
    }

    /// Zip a header row with a value row. Missing trailing values become empty
    /// cells; extra values beyond the header are dropped.
    pub fn from_row<S: AsRef<str>>(labels: &[String], values: &[S], provenance: Provenance) -> Self {
        let cells = labels
            .iter()
            .enumerate()
            .map(|(i, label)| {
                let value = values.get(i).map(|v| v.as_ref().to_string()).unwrap_or_default();
                (label.clone(), value)
            })
            .collect();
        Self { cells, provenance }
    }

    pub fn get(&self, label: &str) -> Option<&str> {
        self.cells
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, v)| v.as_str())
    }

    pub fn cells(&self) -> &[(String, String)] {
        &self.cells
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.cells.iter().map(|(l, _)| l.as_str())
    }

    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    pub fn into_nested(self, archive_file_id: &str) -> Self {
        Self {
            cells: self.cells,
            provenance: self.provenance.nest_under(archive_file_id),
        }
    }

    pub fn is_blank(&self) -> bool {
        self.cells.iter().all(|(_, v)| v.trim().is_empty())
    }
}

/// Ordered record set produced by a reader. `labels` is the union of every
/// record's labels in first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTable {
    pub labels: Vec<String>,
    pub records: Vec<RawRecord>,
}

impl RawTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: RawRecord) {
        for label in record.labels() {
            if !self.labels.iter().any(|l| l == label) {
                self.labels.push(label.to_string());
            }
        }
        self.records.push(record);
    }

    pub fn append(&mut self, other: RawTable) {
        for record in other.records {
            self.push(record);
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
