use tally_core::{Provenance, RawRecord, RawTable};

use super::{header_labels, positional_labels, ReadContext, ReadError, RowCollector};

const CANDIDATE_DELIMITERS: [u8; 4] = [b',', b';', b'\t', b'|'];

/// Pick the delimiter that occurs most often on the first line. Ties and
/// lines without any candidate fall back to `default`.
pub(crate) fn sniff_delimiter(data: &[u8], default: u8) -> u8 {
    let first_line = data.split(|b| *b == b'\n').next().unwrap_or_default();
    let count = |d: u8| first_line.iter().filter(|b| **b == d).count();
    let mut best = (default, count(default));
    for d in CANDIDATE_DELIMITERS {
        let n = count(d);
        if n > best.1 {
            best = (d, n);
        }
    }
    best.0
}

/// Read comma or tab separated text. The first non-blank row is the header
/// unless it looks like data, in which case columns are labelled `col_<i>`.
pub fn read(file_id: &str, data: &[u8], default_delimiter: u8, ctx: &ReadContext) -> Result<RawTable, ReadError> {
    let delimiter = sniff_delimiter(data, default_delimiter);
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(delimiter)
        .from_reader(data);

    let mut rows = RowCollector::new(ctx)?;
    let mut labels: Option<Vec<String>> = None;
    let mut row_index = 0usize;

    for result in reader.byte_records() {
        let record = result.map_err(|e| ReadError::CorruptContainer(e.to_string()))?;
        let values: Vec<String> = record
            .iter()
            .map(|field| String::from_utf8_lossy(field).trim().to_string())
            .collect();

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
        // Rows wider than the header gain positional columns rather than losing cells.
        while labels.len() < values.len() {
            labels.push(format!("col_{}", labels.len()));
        }

        rows.push(RawRecord::from_row(labels, &values, Provenance::new(file_id, row_index)))?;
        row_index += 1;
    }

    rows.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_csv(data: &[u8]) -> Result<RawTable, ReadError> {
        read("a.csv", data, b',', &ReadContext::default())
    }

    // ── delimiter sniffing ────────────────────────────────────────────────────

    #[test]
    fn sniff_prefers_most_frequent() {
        assert_eq!(sniff_delimiter(b"a;b;c\n1;2;3", b','), b';');
        assert_eq!(sniff_delimiter(b"a,b\n", b'\t'), b',');
        assert_eq!(sniff_delimiter(b"single\n", b'\t'), b'\t');
    }

    // ── reading ───────────────────────────────────────────────────────────────

    #[test]
    fn reads_header_and_rows() {
        let data = b"date,description,amount\n2024-01-15,AMAZON,49.99\n2024-01-16,STARBUCKS,-5.00\n";
        let table = read_csv(data).unwrap();
        assert_eq!(table.labels, vec!["date", "description", "amount"]);
        assert_eq!(table.len(), 2);
        assert_eq!(table.records[1].get("description"), Some("STARBUCKS"));
        assert_eq!(table.records[1].provenance().raw_ref(), "#row=1");
    }

    #[test]
    fn headerless_file_gets_positional_labels() {
        let data = b"2024-01-15,Coffee,-4.50\n2024-01-16,Lunch,-12.00\n";
        let table = read_csv(data).unwrap();
        assert_eq!(table.labels, vec!["col_0", "col_1", "col_2"]);
        assert_eq!(table.len(), 2);
        assert_eq!(table.records[0].get("col_1"), Some("Coffee"));
    }

    #[test]
    fn semicolon_file_is_split_correctly() {
        let data = "Datum;Betrag;Text\n15.01.2024;-4,50;Kaffee\n".as_bytes();
        let table = read_csv(data).unwrap();
        assert_eq!(table.records[0].get("Betrag"), Some("-4,50"));
    }

    #[test]
    fn tab_separated_text() {
        let data = b"date\tamount\n2024-01-15\t10\n";
        let table = read("a.txt", data, b'\t', &ReadContext::default()).unwrap();
        assert_eq!(table.records[0].get("amount"), Some("10"));
    }

    #[test]
    fn blank_lines_and_bom_are_ignored() {
        let data = "\u{feff}date,amount\n\n2024-01-15,1\n,\n2024-01-16,2\n".as_bytes();
        let table = read_csv(data).unwrap();
        assert_eq!(table.labels[0], "date");
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn ragged_rows_keep_every_cell() {
        let data = b"date,amount\n2024-01-15,1,note\n2024-01-16\n";
        let table = read_csv(data).unwrap();
        assert_eq!(table.records[0].get("col_2"), Some("note"));
        assert_eq!(table.records[1].get("amount"), Some(""));
    }

    #[test]
    fn header_only_is_empty_input() {
        assert_eq!(read_csv(b"date,description,amount\n").unwrap_err(), ReadError::EmptyInput);
    }
}
