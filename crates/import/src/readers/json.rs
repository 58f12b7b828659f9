use serde_json::{Map, Value};
use tally_core::{Provenance, RawRecord, RawTable};

use super::{header_labels, positional_labels, ReadContext, ReadError, RowCollector};

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.trim().to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Flatten nested objects into dotted labels. Arrays stay as JSON text.
fn flatten_into(prefix: Option<&str>, object: &Map<String, Value>, out: &mut Vec<(String, String)>) {
    for (key, value) in object {
        let label = match prefix {
            Some(p) => format!("{p}.{key}"),
            None => key.clone(),
        };
        match value {
            Value::Object(inner) => flatten_into(Some(&label), inner, out),
            other => out.push((label, scalar_to_string(other))),
        }
    }
}

/// Locate the row array: a top-level array, the first array-of-records
/// member of a wrapping object, or a column-oriented object of arrays.
fn rows_of(document: Value) -> Result<Vec<Value>, ReadError> {
    match document {
        Value::Array(rows) => Ok(rows),
        Value::Object(object) => {
            let wrapped = object
                .values()
                .find(|v| matches!(v, Value::Array(items) if items.iter().any(Value::is_object)));
            if let Some(Value::Array(rows)) = wrapped {
                return Ok(rows.clone());
            }
            if !object.is_empty() && object.values().all(Value::is_array) {
                return Ok(transpose_columns(&object));
            }
            Ok(vec![Value::Object(object)])
        }
        _ => Err(ReadError::CorruptContainer("JSON document holds no records".into())),
    }
}

fn transpose_columns(columns: &Map<String, Value>) -> Vec<Value> {
    let height = columns
        .values()
        .filter_map(Value::as_array)
        .map(Vec::len)
        .max()
        .unwrap_or(0);
    (0..height)
        .map(|i| {
            let row: Map<String, Value> = columns
                .iter()
                .map(|(k, v)| (k.clone(), v.get(i).cloned().unwrap_or(Value::Null)))
                .collect();
            Value::Object(row)
        })
        .collect()
}

fn parse_document(data: &[u8]) -> Result<Value, ReadError> {
    match serde_json::from_slice::<Value>(data) {
        Ok(value) => Ok(value),
        Err(whole_err) => {
            // Newline-delimited records.
            let text = String::from_utf8_lossy(data);
            let lines: Result<Vec<Value>, _> = text
                .lines()
                .filter(|l| !l.trim().is_empty())
                .map(serde_json::from_str::<Value>)
                .collect();
            match lines {
                Ok(rows) if rows.len() > 1 => Ok(Value::Array(rows)),
                _ => Err(ReadError::CorruptContainer(format!("Invalid JSON: {whole_err}"))),
            }
        }
    }
}

/// Read a JSON document as records. Objects become rows keyed by their
/// (flattened) field names; arrays of arrays use the first row as header.
pub fn read(file_id: &str, data: &[u8], ctx: &ReadContext) -> Result<RawTable, ReadError> {
    let rows_in = rows_of(parse_document(data)?)?;

    let mut rows = RowCollector::new(ctx)?;
    let mut array_labels: Option<Vec<String>> = None;
    let mut row_index = 0usize;

    for value in rows_in {
        let provenance = Provenance::new(file_id, row_index);
        let record = match value {
            Value::Object(object) => {
                let mut cells = Vec::with_capacity(object.len());
                flatten_into(None, &object, &mut cells);
                RawRecord::new(cells, provenance)
            }
            Value::Array(items) => {
                let values: Vec<String> = items.iter().map(scalar_to_string).collect();
                if array_labels.is_none() {
                    match header_labels(&values) {
                        Some(header) => {
                            array_labels = Some(header);
                            continue;
                        }
                        None => array_labels = Some(positional_labels(values.len())),
                    }
                }
                let labels = array_labels.get_or_insert_with(Vec::new);
                while labels.len() < values.len() {
                    labels.push(format!("col_{}", labels.len()));
                }
                RawRecord::from_row(labels, &values, provenance)
            }
            Value::Null => continue,
            scalar => RawRecord::new(vec![("value".to_string(), scalar_to_string(&scalar))], provenance),
        };
        rows.push(record)?;
        row_index += 1;
    }

    rows.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_json(data: &str) -> Result<RawTable, ReadError> {
        read("t.json", data.as_bytes(), &ReadContext::default())
    }

    #[test]
    fn array_of_objects_keeps_key_order() {
        let table = read_json(r#"[{"date":"2024-01-15","amount":-4.5,"payee":"Cafe"},{"date":"2024-01-16","amount":10}]"#)
            .unwrap();
        assert_eq!(table.labels, vec!["date", "amount", "payee"]);
        assert_eq!(table.records[0].get("amount"), Some("-4.5"));
        assert_eq!(table.records[1].get("payee"), None);
    }

    #[test]
    fn wrapped_array_is_found() {
        let table = read_json(r#"{"account":"x","transactions":[{"date":"2024-01-15","amount":"1"}]}"#).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.records[0].get("amount"), Some("1"));
    }

    #[test]
    fn nested_objects_are_flattened() {
        let table = read_json(r#"[{"date":"2024-01-15","merchant":{"name":"Cafe","city":"Oslo"},"tags":["a"]}]"#).unwrap();
        assert_eq!(table.records[0].get("merchant.name"), Some("Cafe"));
        assert_eq!(table.records[0].get("tags"), Some(r#"["a"]"#));
    }

    #[test]
    fn column_oriented_object_is_transposed() {
        let table = read_json(r#"{"date":["2024-01-15","2024-01-16"],"amount":[1,2]}"#).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.records[1].get("amount"), Some("2"));
    }

    #[test]
    fn array_of_arrays_uses_header_row() {
        let table = read_json(r#"[["date","amount"],["2024-01-15","3"]]"#).unwrap();
        assert_eq!(table.records[0].get("date"), Some("2024-01-15"));
    }

    #[test]
    fn newline_delimited_records() {
        let table = read_json("{\"amount\":1}\n{\"amount\":2}\n").unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.records[1].provenance().row, 1);
    }

    #[test]
    fn nulls_become_empty_cells() {
        let table = read_json(r#"[{"date":"2024-01-15","category":null}]"#).unwrap();
        assert_eq!(table.records[0].get("category"), Some(""));
    }

    #[test]
    fn errors() {
        assert_eq!(read_json("[]").unwrap_err(), ReadError::EmptyInput);
        assert!(matches!(read_json("{not json"), Err(ReadError::CorruptContainer(_))));
        assert!(matches!(read_json("42"), Err(ReadError::CorruptContainer(_))));
    }
}
