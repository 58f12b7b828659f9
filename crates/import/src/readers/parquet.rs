use arrow_array::Array;
use arrow_cast::display::array_value_to_string;
use bytes::Bytes;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use tally_core::{Provenance, RawRecord, RawTable};

use super::{ReadContext, ReadError, RowCollector};

fn corrupt(e: impl std::fmt::Display) -> ReadError {
    ReadError::CorruptContainer(format!("Parquet: {e}"))
}

/// Read a columnar file in record batches of `ctx.batch_size` rows. Column
/// names come from the file schema; nulls become empty cells.
pub fn read(file_id: &str, data: &[u8], ctx: &ReadContext) -> Result<RawTable, ReadError> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(Bytes::copy_from_slice(data)).map_err(corrupt)?;
    let labels: Vec<String> = builder
        .schema()
        .fields()
        .iter()
        .map(|field| field.name().clone())
        .collect();
    let reader = builder.with_batch_size(ctx.batch_size).build().map_err(corrupt)?;

    let mut rows = RowCollector::new(ctx)?;
    let mut row_index = 0usize;
    for batch in reader {
        let batch = batch.map_err(corrupt)?;
        for r in 0..batch.num_rows() {
            let values = batch
                .columns()
                .iter()
                .map(|column| {
                    if column.is_null(r) {
                        Ok(String::new())
                    } else {
                        array_value_to_string(column, r).map_err(corrupt)
                    }
                })
                .collect::<Result<Vec<_>, _>>()?;
            rows.push(RawRecord::from_row(&labels, &values, Provenance::new(file_id, row_index)))?;
            row_index += 1;
        }
    }

    rows.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_array::{Float64Array, RecordBatch, StringArray};
    use arrow_schema::{DataType, Field, Schema};
    use parquet::arrow::ArrowWriter;
    use std::sync::Arc;

    fn parquet_bytes(dates: Vec<Option<&str>>, amounts: Vec<f64>) -> Vec<u8> {
        let schema = Arc::new(Schema::new(vec![
            Field::new("date", DataType::Utf8, true),
            Field::new("amount", DataType::Float64, false),
        ]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(StringArray::from(dates)),
                Arc::new(Float64Array::from(amounts)),
            ],
        )
        .unwrap();
        let mut buf = Vec::new();
        let mut writer = ArrowWriter::try_new(&mut buf, schema, None).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();
        buf
    }

    #[test]
    fn reads_columns_by_schema_name() {
        let data = parquet_bytes(vec![Some("2024-01-15"), None], vec![-4.5, 10.0]);
        let table = read("c.parquet", &data, &ReadContext::default()).unwrap();
        assert_eq!(table.labels, vec!["date", "amount"]);
        assert_eq!(table.len(), 2);
        assert_eq!(table.records[0].get("amount"), Some("-4.5"));
        assert_eq!(table.records[1].get("date"), Some(""));
    }

    #[test]
    fn small_batches_cover_every_row() {
        let data = parquet_bytes(vec![Some("2024-01-15"); 5], vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        let ctx = ReadContext {
            batch_size: 2,
            ..ReadContext::default()
        };
        let table = read("c.parquet", &data, &ctx).unwrap();
        assert_eq!(table.len(), 5);
        assert_eq!(table.records[4].provenance().row, 4);
    }

    #[test]
    fn not_parquet_is_corrupt() {
        let err = read("c.parquet", b"PAR1garbage", &ReadContext::default()).unwrap_err();
        assert!(matches!(err, ReadError::CorruptContainer(_)));
    }
}
