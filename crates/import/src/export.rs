//! Lossless export of a transaction set to a delimited file or a workbook.
//!
//! Both containers carry every canonical field plus the stable id and
//! provenance columns, so an exported file re-imports to the same set.

use std::io::Write;

use rust_xlsxwriter::{Format, Workbook, XlsxError};
use tally_core::Transaction;
use thiserror::Error;
use tracing::info;

use crate::mapper::{ID_LABEL, RAW_REF_LABEL, SOURCE_FILE_LABEL};

pub const EXPORT_COLUMNS: [&str; 8] = [
    ID_LABEL,
    "date",
    "description",
    "category",
    "amount",
    "type",
    SOURCE_FILE_LABEL,
    RAW_REF_LABEL,
];

const SHEET_NAME: &str = "Transactions";

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("Workbook error: {0}")]
    Xlsx(#[from] XlsxError),
}

fn row_of(tx: &Transaction) -> [String; 8] {
    [
        tx.id.to_string(),
        tx.date.format("%Y-%m-%d").to_string(),
        tx.description.clone(),
        tx.category.clone(),
        tx.amount.to_string(),
        tx.kind.to_string(),
        tx.source_file.clone(),
        tx.raw_ref.clone(),
    ]
}

/// Write the set as comma-delimited UTF-8 with a header row.
pub fn write_csv<W: Write>(transactions: &[Transaction], writer: W) -> Result<(), ExportError> {
    let mut out = csv::Writer::from_writer(writer);
    out.write_record(EXPORT_COLUMNS)?;
    for tx in transactions {
        out.write_record(row_of(tx))?;
    }
    out.flush()?;
    info!(rows = transactions.len(), "Exported CSV");
    Ok(())
}

pub fn to_csv(transactions: &[Transaction]) -> Result<Vec<u8>, ExportError> {
    let mut buf = Vec::new();
    write_csv(transactions, &mut buf)?;
    Ok(buf)
}

/// Single-sheet workbook. Every cell is written as text so amounts keep their
/// scale and dates are not reinterpreted as serial numbers.
pub fn to_xlsx(transactions: &[Transaction]) -> Result<Vec<u8>, ExportError> {
    let mut workbook = Workbook::new();
    let bold = Format::new().set_bold();
    let sheet = workbook.add_worksheet();
    sheet.set_name(SHEET_NAME)?;

    for (col, label) in EXPORT_COLUMNS.iter().enumerate() {
        sheet.write_string_with_format(0, col as u16, *label, &bold)?;
    }
    for (i, tx) in transactions.iter().enumerate() {
        let row = (i + 1) as u32;
        for (col, value) in row_of(tx).iter().enumerate() {
            sheet.write_string(row, col as u16, value)?;
        }
    }

    let buf = workbook.save_to_buffer()?;
    info!(rows = transactions.len(), bytes = buf.len(), "Exported workbook");
    Ok(buf)
}
