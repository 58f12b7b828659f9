use std::io::Cursor;

use calamine::{Data, Reader, Xlsx};
use chrono::{Duration, NaiveDate};
use tally_core::{Provenance, RawRecord, RawTable};
use tracing::debug;

use super::{header_labels, positional_labels, ReadContext, ReadError, RowCollector};

/// Excel's day zero (serial 1 is 1900-01-01, counting the phantom 1900-02-29).
fn excel_epoch() -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(1899, 12, 30)
}

/// Render an Excel serial as `YYYY-MM-DD`, with a time part only when present.
fn excel_serial_to_string(serial: f64) -> String {
    let days = serial.floor();
    let seconds = ((serial - days) * 86_400.0).round() as i64;
    let Some(date) = excel_epoch().and_then(|epoch| epoch.checked_add_signed(Duration::days(days as i64))) else {
        return serial.to_string();
    };
    if seconds == 0 {
        date.format("%Y-%m-%d").to_string()
    } else {
        let datetime = date.and_hms_opt(0, 0, 0).map(|dt| dt + Duration::seconds(seconds));
        match datetime {
            Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
            None => date.format("%Y-%m-%d").to_string(),
        }
    }
}

fn float_to_string(f: f64) -> String {
    if f.fract() == 0.0 && f.abs() < 1e15 {
        format!("{}", f as i64)
    } else {
        f.to_string()
    }
}

fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::String(s) => s.trim().to_string(),
        Data::Float(f) => float_to_string(*f),
        Data::Int(i) => i.to_string(),
        Data::Bool(b) => b.to_string(),
        Data::DateTime(dt) => excel_serial_to_string(dt.as_f64()),
        Data::DateTimeIso(s) => s.clone(),
        Data::Error(e) => format!("#{e:?}"),
        _ => String::new(),
    }
}

/// Read every worksheet of an xlsx workbook. Each sheet finds its own header;
/// rows from all sheets are concatenated in sheet order.
pub fn read(file_id: &str, data: &[u8], ctx: &ReadContext) -> Result<RawTable, ReadError> {
    let mut workbook: Xlsx<_> =
        Xlsx::new(Cursor::new(data)).map_err(|e| ReadError::CorruptContainer(format!("Failed to open XLSX: {e}")))?;
    let sheet_names = workbook.sheet_names().to_vec();

    let mut rows = RowCollector::new(ctx)?;
    for (sheet_index, name) in sheet_names.iter().enumerate() {
        let range = workbook
            .worksheet_range(name)
            .map_err(|e| ReadError::CorruptContainer(format!("Sheet '{name}': {e}")))?;

        let mut labels: Option<Vec<String>> = None;
        let mut row_index = 0usize;
        for row in range.rows() {
            let values: Vec<String> = row.iter().map(cell_to_string).collect();
            if values.iter().all(|v| v.is_empty()) {
                continue;
            }
            if labels.is_none() {
                match header_labels(&values) {
                    Some(header) => {
                        labels = Some(header);
                        continue;
                    }
                    None => labels = Some(positional_labels(values.len())),
                }
            }
            let labels = labels.get_or_insert_with(Vec::new);
            let provenance = Provenance::new(file_id, row_index).with_sheet(sheet_index);
            rows.push(RawRecord::from_row(labels, &values, provenance))?;
            row_index += 1;
        }
        debug!(file_id, sheet = %name, rows = row_index, "Read worksheet");
    }

    rows.finish()
}
