use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::sync::Arc;

use arrow_array::{ArrayRef, RecordBatch, StringArray};
use arrow_schema::{DataType, Field, Schema};
use parquet::arrow::ArrowWriter;
use tally_core::Transaction;
use tally_import::{
    read_container, to_csv, to_xlsx, CleaningConfig, Clustering, ContainerKind, DedupConfig, EngineConfig, ImportEngine,
    MatchMethod, ReadContext, RejectReason, SchemaMapper, SourceFile,
};
use tokio_util::sync::CancellationToken;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

const ROWS: [[&str; 3]; 4] = [
    ["2024-01-15", "Coffee", "-4.50"],
    ["2024-01-20", "Salary", "2500.00"],
    ["2024-02-03", "Groceries", "-82.17"],
    ["2024-02-10", "Refund", "12.00"],
];

fn delimited(sep: char) -> Vec<u8> {
    let mut out = format!("Date{sep}Description{sep}Amount\n");
    for row in ROWS {
        out.push_str(&row.join(&sep.to_string()));
        out.push('\n');
    }
    out.into_bytes()
}

fn json() -> Vec<u8> {
    let rows: Vec<serde_json::Value> = ROWS
        .iter()
        .map(|r| serde_json::json!({"Date": r[0], "Description": r[1], "Amount": r[2]}))
        .collect();
    serde_json::to_vec(&serde_json::json!({ "transactions": rows })).unwrap()
}

fn xlsx() -> Vec<u8> {
    let mut workbook = rust_xlsxwriter::Workbook::new();
    let sheet = workbook.add_worksheet();
    for (c, label) in ["Date", "Description", "Amount"].iter().enumerate() {
        sheet.write_string(0, c as u16, *label).unwrap();
    }
    for (r, row) in ROWS.iter().enumerate() {
        for (c, value) in row.iter().enumerate() {
            sheet.write_string(r as u32 + 1, c as u16, *value).unwrap();
        }
    }
    workbook.save_to_buffer().unwrap()
}

fn parquet() -> Vec<u8> {
    let schema = Arc::new(Schema::new(vec![
        Field::new("Date", DataType::Utf8, false),
        Field::new("Description", DataType::Utf8, false),
        Field::new("Amount", DataType::Utf8, false),
    ]));
    let columns: Vec<ArrayRef> = (0..3)
        .map(|c| Arc::new(StringArray::from(ROWS.iter().map(|r| r[c]).collect::<Vec<_>>())) as ArrayRef)
        .collect();
    let batch = RecordBatch::try_new(schema.clone(), columns).unwrap();
    let mut buf = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buf, schema, None).unwrap();
    writer.write(&batch).unwrap();
    writer.close().unwrap();
    buf
}

fn pdf() -> Vec<u8> {
    use printpdf::{BuiltinFont, Mm, PdfDocument};

    let (doc, page, layer) = PdfDocument::new("statement", Mm(210.0), Mm(297.0), "rows");
    let font = doc.add_builtin_font(BuiltinFont::Helvetica).unwrap();
    let layer = doc.get_page(page).get_layer(layer);
    let header = ["Date", "Description", "Amount"];
    for (i, row) in std::iter::once(header).chain(ROWS).enumerate() {
        layer.use_text(row.join("    "), 10.0, Mm(20.0), Mm(270.0 - 8.0 * i as f32), &font);
    }
    let mut buf = std::io::BufWriter::new(Vec::new());
    doc.save(&mut buf).unwrap();
    buf.into_inner().unwrap()
}

fn zip(entries: &[(&str, Vec<u8>)]) -> Vec<u8> {
    let mut buf = Vec::new();
    {
        let mut zip = ZipWriter::new(Cursor::new(&mut buf));
        let options: FileOptions<'_, ()> = FileOptions::default().compression_method(CompressionMethod::Stored);
        for (name, body) in entries {
            zip.start_file(*name, options).unwrap();
            zip.write_all(body).unwrap();
        }
        zip.finish().unwrap();
    }
    buf
}

fn engine() -> ImportEngine {
    ImportEngine::new(EngineConfig {
        cleaning: CleaningConfig {
            reference_date: chrono::NaiveDate::from_ymd_opt(2024, 6, 1),
            ..CleaningConfig::default()
        },
        ..EngineConfig::default()
    })
}

async fn import(engine: &ImportEngine, sources: Vec<SourceFile>, prior: &[Transaction]) -> tally_import::BatchOutcome {
    engine
        .import_batch(sources, prior, &HashMap::new(), CancellationToken::new())
        .await
}

fn sorted(mut txs: Vec<Transaction>) -> Vec<Transaction> {
    txs.sort_by(|a, b| a.id.cmp(&b.id));
    txs
}

// ── readers ───────────────────────────────────────────────────────────────────

#[test]
fn every_container_yields_one_record_per_row() {
    let fixtures = [
        (ContainerKind::Csv, "a.csv", delimited(',')),
        (ContainerKind::Txt, "a.txt", delimited('\t')),
        (ContainerKind::Json, "a.json", json()),
        (ContainerKind::Xlsx, "a.xlsx", xlsx()),
        (ContainerKind::Parquet, "a.parquet", parquet()),
        (ContainerKind::Pdf, "a.pdf", pdf()),
        (ContainerKind::Zip, "a.zip", zip(&[("inner/a.csv", delimited(','))])),
    ];
    for (kind, name, bytes) in fixtures {
        assert_eq!(ContainerKind::detect(None, name, &bytes).unwrap(), kind, "{name}");
        let out = read_container(kind, name, &bytes, &ReadContext::default()).unwrap();
        assert_eq!(out.table.len(), ROWS.len(), "{name}");
        assert_eq!(out.table.records[2].get("Amount"), Some("-82.17"), "{name}");
    }
}

#[tokio::test]
async fn every_container_imports_the_same_values() {
    let engine = engine();
    let sources = vec![
        SourceFile::from_bytes("a.csv", delimited(',')),
        SourceFile::from_bytes("b.txt", delimited('\t')),
        SourceFile::from_bytes("c.json", json()),
        SourceFile::from_bytes("d.xlsx", xlsx()),
        SourceFile::from_bytes("e.parquet", parquet()),
        SourceFile::from_bytes("f.pdf", pdf()),
    ];
    let outcome = import(&engine, sources, &[]).await;
    assert!(outcome.failed.is_empty(), "{:?}", outcome.failed);
    assert!(outcome.pending.is_empty());
    for file in &outcome.imported {
        assert_eq!(file.summary.accepted, ROWS.len(), "{}", file.summary.file_id);
        let amounts: Vec<String> = file.report.accepted.iter().map(|t| t.amount.to_string()).collect();
        assert_eq!(amounts, vec!["-4.50", "2500.00", "-82.17", "12.00"]);
    }
    assert_eq!(outcome.merged.transactions.len(), 6 * ROWS.len());
}

#[test]
fn rendered_statement_rows_keep_page_provenance() {
    let out = read_container(ContainerKind::Pdf, "statement.pdf", &pdf(), &ReadContext::default()).unwrap();
    let table = out.table;
    assert_eq!(table.labels, vec!["Date", "Description", "Amount"]);
    assert_eq!(table.len(), ROWS.len());
    assert_eq!(table.records[0].get("Description"), Some("Coffee"));
    assert!(table.records.iter().all(|r| r.provenance().page == Some(0)));
}

// ── mapping ───────────────────────────────────────────────────────────────────

#[test]
fn mapping_is_deterministic_and_exact_wins() {
    let bytes = delimited(',');
    let table = read_container(ContainerKind::Csv, "a.csv", &bytes, &ReadContext::default())
        .unwrap()
        .table;
    let mapper = SchemaMapper::default();
    let first = mapper.propose("a.csv", &table);
    for _ in 0..5 {
        assert_eq!(mapper.propose("a.csv", &table), first);
    }

    let lower = b"date,posted date,amount\n2024-01-15,2024-01-16,1\n";
    let table = read_container(ContainerKind::Csv, "b.csv", lower, &ReadContext::default())
        .unwrap()
        .table;
    let proposal = mapper.propose("b.csv", &table);
    let date = proposal.mapping.get(tally_core::CanonicalField::Date).unwrap();
    assert_eq!(date.label, "date");
    assert_eq!(date.method, MatchMethod::Exact);
}

// ── rejects ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn one_bad_amount_is_one_reject() {
    let body = "Date,Description,Amount\n2024-01-15,Coffee,-4.50\n2024-01-16,Lunch,twelve\n2024-01-17,Bus,-2.75\n";
    let outcome = import(&engine(), vec![SourceFile::from_bytes("a.csv", body.as_bytes().to_vec())], &[]).await;
    let report = &outcome.imported[0].report;
    assert_eq!(report.accepted.len(), 2);
    assert_eq!(report.rejected.len(), 1);
    assert_eq!(report.rejected[0].reason, RejectReason::InvalidAmount("twelve".into()));
    assert_eq!(report.rejected[0].record.get("Description"), Some("Lunch"));
}

// ── export round trip ─────────────────────────────────────────────────────────

#[tokio::test]
async fn export_reimport_round_trip() {
    let engine = engine();
    let first = import(&engine, vec![SourceFile::from_bytes("bank.csv", delimited(','))], &[]).await;
    let original = first.merged.transactions;
    assert_eq!(original.len(), ROWS.len());

    for (name, bytes) in [("export.csv", to_csv(&original).unwrap()), ("export.xlsx", to_xlsx(&original).unwrap())] {
        let again = import(&engine, vec![SourceFile::from_bytes(name, bytes)], &original).await;
        let file = &again.imported[0];
        assert!(file.report.rejected.is_empty(), "{name}");
        assert_eq!(sorted(file.report.accepted.clone()), sorted(original.clone()), "{name}");
        assert_eq!(again.merged.superseded, original.len(), "{name}");
        assert!(again.merged.clusters.is_empty(), "{name}");
        assert_eq!(sorted(again.merged.transactions), sorted(original.clone()), "{name}");
    }
}

// ── same-named files ──────────────────────────────────────────────────────────

const JANUARY: &str = "Date,Description,Amount\n2024-01-05,Rent,-900.00\n2024-01-20,Salary,2500.00\n";
const FEBRUARY: &str = "Date,Description,Amount\n2024-02-05,Rent,-900.00\n2024-02-20,Salary,2500.00\n";

#[tokio::test]
async fn monthly_statements_with_one_name_accumulate() {
    let engine = engine();
    let jan = import(&engine, vec![SourceFile::from_bytes("statement.csv", JANUARY.as_bytes().to_vec())], &[]).await;
    assert_eq!(jan.merged.transactions.len(), 2);

    let feb = import(
        &engine,
        vec![SourceFile::from_bytes("statement.csv", FEBRUARY.as_bytes().to_vec())],
        &jan.merged.transactions,
    )
    .await;
    assert_eq!(feb.merged.superseded, 0);
    assert_eq!(feb.merged.transactions.len(), 4);

    let again = import(
        &engine,
        vec![SourceFile::from_bytes("statement.csv", FEBRUARY.as_bytes().to_vec())],
        &feb.merged.transactions,
    )
    .await;
    assert_eq!(again.merged.superseded, 2);
    assert_eq!(again.merged.transactions.len(), 4);
}

#[tokio::test]
async fn same_named_files_in_one_batch_keep_all_rows() {
    let outcome = import(
        &engine(),
        vec![
            SourceFile::from_bytes("statement.csv", JANUARY.as_bytes().to_vec()),
            SourceFile::from_bytes("statement.csv", FEBRUARY.as_bytes().to_vec()),
        ],
        &[],
    )
    .await;
    assert_eq!(outcome.imported.len(), 2);
    assert_eq!(outcome.merged.transactions.len(), 4);
}

// ── duplicates ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn near_duplicates_across_files() {
    let a = "Date,Description,Amount\n2024-01-15,STARBUCKS  Coffee,-5.00\n2024-03-01,Netflix,-15.99\n";
    let b = "Date,Description,Amount\n2024-01-16,starbucks coffee,-5.00\n2024-03-31,Netflix,-15.99\n";
    let outcome = import(
        &engine(),
        vec![
            SourceFile::from_bytes("a.csv", a.as_bytes().to_vec()),
            SourceFile::from_bytes("b.csv", b.as_bytes().to_vec()),
        ],
        &[],
    )
    .await;
    let clusters = &outcome.merged.clusters;
    assert_eq!(clusters.len(), 1);
    let descriptions: Vec<&str> = outcome
        .merged
        .transactions
        .iter()
        .filter(|t| clusters[0].contains(&t.id))
        .map(|t| t.description.as_str())
        .collect();
    assert_eq!(descriptions.len(), 2);
    assert!(descriptions.iter().all(|d| d.eq_ignore_ascii_case("starbucks coffee")));
}

#[tokio::test]
async fn clustering_mode_changes_chains() {
    let body = "Date,Description,Amount\n2024-01-10,Amazon,-20.00\n2024-01-12,Amazon,-20.00\n2024-01-14,Amazon,-20.00\n";
    let run = |clustering| async move {
        let engine = ImportEngine::new(EngineConfig {
            dedup: DedupConfig {
                clustering,
                ..DedupConfig::default()
            },
            ..EngineConfig::default()
        });
        import(&engine, vec![SourceFile::from_bytes("a.csv", body.as_bytes().to_vec())], &[])
            .await
            .merged
            .clusters
    };
    let transitive = run(Clustering::Transitive).await;
    let pairwise = run(Clustering::Pairwise).await;
    assert_eq!(transitive.len(), 1);
    assert_eq!(transitive[0].members.len(), 3);
    assert_eq!(pairwise.len(), 1);
    assert_eq!(pairwise[0].members.len(), 2);
}

// ── cleaning ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn cleaning_twice_changes_nothing() {
    let body = "Date,Description,Amount\n2024-01-15,,-4.50\n2024-01-15,,-4.50\n1950-01-01,Old,3\n";
    let outcome = import(&engine(), vec![SourceFile::from_bytes("a.csv", body.as_bytes().to_vec())], &[]).await;
    let mut txs = outcome.merged.transactions.clone();
    let cleaner = tally_import::Cleaner::new(&CleaningConfig {
        reference_date: chrono::NaiveDate::from_ymd_opt(2024, 6, 1),
        ..CleaningConfig::default()
    });
    let report = cleaner.clean(&mut txs);
    assert_eq!(report.changed, 0);
    assert_eq!(txs, outcome.merged.transactions);
}
