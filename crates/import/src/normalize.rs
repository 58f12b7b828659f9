use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tally_core::{
    Amount, CanonicalField, CategoryVocabulary, RawRecord, RawTable, Transaction, TransactionId, TransactionType,
    UNCATEGORIZED,
};
use tracing::{debug, info};

use crate::config::NormalizerConfig;
use crate::mapper::ConfirmedMapping;

/// Tried in order; the first format that parses wins. Month-first precedes
/// day-first, so `03/04/2024` is read as March 4.
const DATE_FORMATS: &[&str] = &[
    // ISO
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%Y.%m.%d",
    "%Y%m%d",
    // US
    "%m/%d/%Y",
    "%m-%d-%Y",
    "%m/%d/%y",
    // EU
    "%d/%m/%Y",
    "%d.%m.%Y",
    "%d-%m-%Y",
    "%d.%m.%y",
    // text month
    "%d %b %Y",
    "%d %B %Y",
    "%d-%b-%Y",
    "%b %d, %Y",
    "%B %d, %Y",
    "%b %d %Y",
    "%B %d %Y",
];

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
    "%d.%m.%Y %H:%M",
];

/// Why a row did not become a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "value", rename_all = "snake_case")]
pub enum RejectReason {
    InvalidDate(String),
    InvalidAmount(String),
    InvalidType(String),
    /// A required field has no value in this row.
    MissingField(CanonicalField),
    /// Another row of the same import already produced this id.
    DuplicateId(TransactionId),
}

impl RejectReason {
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::InvalidDate(_) => "invalid_date",
            RejectReason::InvalidAmount(_) => "invalid_amount",
            RejectReason::InvalidType(_) => "invalid_type",
            RejectReason::MissingField(_) => "missing_field",
            RejectReason::DuplicateId(_) => "duplicate_id",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::InvalidDate(v) => write!(f, "Invalid date: '{v}'"),
            RejectReason::InvalidAmount(v) => write!(f, "Invalid amount: '{v}'"),
            RejectReason::InvalidType(v) => write!(f, "Invalid type: '{v}'"),
            RejectReason::MissingField(field) => write!(f, "Missing value for {field}"),
            RejectReason::DuplicateId(id) => write!(f, "Duplicate id {id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedRecord {
    pub record: RawRecord,
    pub reason: RejectReason,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizeReport {
    pub accepted: Vec<Transaction>,
    pub rejected: Vec<RejectedRecord>,
}

impl NormalizeReport {
    /// Reject counts keyed by [`RejectReason::code`].
    pub fn reject_counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for r in &self.rejected {
            *counts.entry(r.reason.code()).or_insert(0) += 1;
        }
        counts
    }

    pub fn append(&mut self, other: NormalizeReport) {
        self.accepted.extend(other.accepted);
        self.rejected.extend(other.rejected);
    }
}

/// `%Y` also accepts short years, which would read `15.01.24` as year 15.
fn full_year(fmt: &str, date: NaiveDate) -> bool {
    !fmt.contains("%Y") || date.year() >= 1000
}

pub struct Normalizer {
    vocabulary: CategoryVocabulary,
    extra_date_formats: Vec<String>,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(&NormalizerConfig::default())
    }
}

impl Normalizer {
    pub fn new(config: &NormalizerConfig) -> Self {
        Self {
            vocabulary: CategoryVocabulary::new(&config.categories),
            extra_date_formats: config.extra_date_formats.clone(),
        }
    }

    pub fn parse_date(&self, raw: &str) -> Option<NaiveDate> {
        let s = raw.trim();
        if s.is_empty() {
            return None;
        }
        for fmt in DATE_FORMATS {
            if let Ok(date) = NaiveDate::parse_from_str(s, fmt) {
                if full_year(fmt, date) {
                    return Some(date);
                }
            }
        }
        for fmt in DATETIME_FORMATS {
            if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
                if full_year(fmt, dt.date()) {
                    return Some(dt.date());
                }
            }
        }
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Some(dt.date_naive());
        }
        for fmt in &self.extra_date_formats {
            if let Ok(date) = NaiveDate::parse_from_str(s, fmt) {
                return Some(date);
            }
            if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
                return Some(dt.date());
            }
        }
        None
    }

    /// Convert every record of `table` into a transaction or a reject.
    pub fn normalize(&self, table: &RawTable, mapping: &ConfirmedMapping) -> NormalizeReport {
        let mut report = NormalizeReport::default();
        let mut seen_ids: HashSet<TransactionId> = HashSet::new();

        for record in &table.records {
            match self.normalize_record(record, mapping) {
                Ok(tx) => {
                    if seen_ids.insert(tx.id.clone()) {
                        report.accepted.push(tx);
                    } else {
                        report.rejected.push(RejectedRecord {
                            record: record.clone(),
                            reason: RejectReason::DuplicateId(tx.id),
                        });
                    }
                }
                Err(reason) => {
                    debug!(row = %record.provenance(), %reason, "Rejected row");
                    report.rejected.push(RejectedRecord {
                        record: record.clone(),
                        reason,
                    });
                }
            }
        }

        info!(
            accepted = report.accepted.len(),
            rejected = report.rejected.len(),
            reasons = ?report.reject_counts(),
            "Normalized records"
        );
        report
    }

    fn normalize_record(&self, record: &RawRecord, mapping: &ConfirmedMapping) -> Result<Transaction, RejectReason> {
        let mapping = mapping.mapping();
        let value = |field: CanonicalField| {
            mapping
                .label(field)
                .and_then(|label| record.get(label))
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };
        let passthrough = |label: &Option<String>| -> Option<String> {
            label
                .as_deref()
                .and_then(|l| record.get(l))
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let raw_date = value(CanonicalField::Date).ok_or(RejectReason::MissingField(CanonicalField::Date))?;
        let date = self
            .parse_date(raw_date)
            .ok_or_else(|| RejectReason::InvalidDate(raw_date.to_string()))?;

        let raw_amount = value(CanonicalField::Amount).ok_or(RejectReason::MissingField(CanonicalField::Amount))?;
        let mut amount = Amount::parse(raw_amount).map_err(|_| RejectReason::InvalidAmount(raw_amount.to_string()))?;

        let kind = match value(CanonicalField::Type) {
            Some(raw_type) => {
                let kind =
                    TransactionType::from_label(raw_type).ok_or_else(|| RejectReason::InvalidType(raw_type.to_string()))?;
                amount = kind.sign(amount);
                kind
            }
            None => TransactionType::from_amount(amount),
        };

        let description = value(CanonicalField::Description)
            .map(|d| d.split_whitespace().collect::<Vec<_>>().join(" "))
            .unwrap_or_default();
        let category = match value(CanonicalField::Category) {
            Some(raw) => self.vocabulary.canonicalize(raw),
            None => UNCATEGORIZED.to_string(),
        };

        let provenance = record.provenance();
        let source_file = passthrough(&mapping.source_file_label).unwrap_or_else(|| provenance.file_id.clone());
        let raw_ref = passthrough(&mapping.raw_ref_label).unwrap_or_else(|| provenance.raw_ref());
        let id = passthrough(&mapping.id_label)
            .map(TransactionId)
            .unwrap_or_else(|| TransactionId::derive_for_row(&source_file, &raw_ref, record.cells()));

        Ok(Transaction {
            id,
            date,
            description,
            category,
            amount,
            kind,
            source_file,
            raw_ref,
            annotations: BTreeSet::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::SchemaMapper;
    use tally_core::Provenance;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn table(labels: &[&str], rows: &[&[&str]]) -> RawTable {
        let labels: Vec<String> = labels.iter().map(|s| s.to_string()).collect();
        let mut t = RawTable::new();
        for (i, row) in rows.iter().copied().enumerate() {
            t.push(RawRecord::from_row(&labels, row, Provenance::new("a.csv", i)));
        }
        t
    }

    fn run(labels: &[&str], rows: &[&[&str]]) -> NormalizeReport {
        let t = table(labels, rows);
        let mapping = SchemaMapper::default().propose("a.csv", &t).try_auto_confirm().unwrap();
        Normalizer::default().normalize(&t, &mapping)
    }

    // ── dates ─────────────────────────────────────────────────────────────────

    #[test]
    fn parses_every_date_family() {
        let n = Normalizer::default();
        assert_eq!(n.parse_date("2024-01-15"), Some(d(2024, 1, 15)));
        assert_eq!(n.parse_date("2024/01/15"), Some(d(2024, 1, 15)));
        assert_eq!(n.parse_date("01/15/2024"), Some(d(2024, 1, 15)));
        assert_eq!(n.parse_date("15.01.2024"), Some(d(2024, 1, 15)));
        assert_eq!(n.parse_date("15/01/2024"), Some(d(2024, 1, 15)));
        assert_eq!(n.parse_date("15 Jan 2024"), Some(d(2024, 1, 15)));
        assert_eq!(n.parse_date("January 15, 2024"), Some(d(2024, 1, 15)));
        assert_eq!(n.parse_date("2024-01-15 13:45:00"), Some(d(2024, 1, 15)));
        assert_eq!(n.parse_date("2024-01-15T13:45:00+02:00"), Some(d(2024, 1, 15)));
    }

    #[test]
    fn ambiguous_dates_read_month_first() {
        assert_eq!(Normalizer::default().parse_date("03/04/2024"), Some(d(2024, 3, 4)));
    }

    #[test]
    fn extra_formats_come_last() {
        let config = NormalizerConfig {
            extra_date_formats: vec!["%Y_%m_%d".into()],
            ..NormalizerConfig::default()
        };
        assert_eq!(Normalizer::new(&config).parse_date("2024_01_15"), Some(d(2024, 1, 15)));
        assert_eq!(Normalizer::default().parse_date("2024_01_15"), None);
    }

    #[test]
    fn short_years_use_two_digit_formats() {
        let n = Normalizer::default();
        assert_eq!(n.parse_date("15.01.24"), Some(d(2024, 1, 15)));
        assert_eq!(n.parse_date("01/15/24"), Some(d(2024, 1, 15)));
    }

    #[test]
    fn garbage_dates_fail() {
        let n = Normalizer::default();
        assert_eq!(n.parse_date("yesterday"), None);
        assert_eq!(n.parse_date("2024-02-30"), None);
    }

    // ── records ───────────────────────────────────────────────────────────────

    #[test]
    fn well_formed_rows_are_accepted() {
        let report = run(
            &["date", "description", "amount", "category"],
            &[
                &["2024-01-15", "  Coffee   Shop ", "-4.50", "dining"],
                &["2024-01-16", "Salary", "2,500.00", ""],
            ],
        );
        assert_eq!(report.accepted.len(), 2);
        assert!(report.rejected.is_empty());
        let coffee = &report.accepted[0];
        assert_eq!(coffee.description, "Coffee Shop");
        assert_eq!(coffee.category, "Dining");
        assert_eq!(coffee.kind, TransactionType::Expense);
        assert_eq!(coffee.source_file, "a.csv");
        assert_eq!(coffee.raw_ref, "#row=0");
        assert!(coffee.id.as_str().starts_with("tx_"));
        assert_ne!(coffee.id, report.accepted[1].id);
        assert_eq!(report.accepted[1].category, UNCATEGORIZED);
        assert_eq!(report.accepted[1].kind, TransactionType::Income);
    }

    #[test]
    fn single_malformed_amount_rejects_one_row() {
        let report = run(
            &["date", "amount"],
            &[&["2024-01-15", "1.00"], &["2024-01-16", "12abc"], &["2024-01-17", "3"]],
        );
        assert_eq!(report.accepted.len(), 2);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].reason, RejectReason::InvalidAmount("12abc".into()));
        assert_eq!(report.rejected[0].record.provenance().row, 1);
        assert_eq!(report.reject_counts().get("invalid_amount"), Some(&1));
    }

    #[test]
    fn zero_amounts_are_accepted() {
        let report = run(&["date", "amount"], &[&["2024-01-15", "0.00"]]);
        assert_eq!(report.accepted.len(), 1);
        assert!(report.accepted[0].amount.is_zero());
    }

    #[test]
    fn reject_reasons() {
        let report = run(
            &["date", "amount", "type"],
            &[
                &["someday", "1", ""],
                &["", "1", ""],
                &["2024-01-15", "", ""],
                &["2024-01-15", "1", "refund?"],
            ],
        );
        let reasons: Vec<&RejectReason> = report.rejected.iter().map(|r| &r.reason).collect();
        assert_eq!(
            reasons,
            vec![
                &RejectReason::InvalidDate("someday".into()),
                &RejectReason::MissingField(CanonicalField::Date),
                &RejectReason::MissingField(CanonicalField::Amount),
                &RejectReason::InvalidType("refund?".into()),
            ]
        );
    }

    #[test]
    fn explicit_type_forces_the_sign() {
        let report = run(
            &["date", "amount", "type"],
            &[&["2024-01-15", "12.00", "Expense"], &["2024-01-16", "-3", "credit"]],
        );
        assert_eq!(report.accepted[0].amount.to_string(), "-12.00");
        assert_eq!(report.accepted[0].kind, TransactionType::Expense);
        assert_eq!(report.accepted[1].amount.to_string(), "3");
        assert!(report.accepted.iter().all(Transaction::is_consistent));
    }

    #[test]
    fn passthrough_columns_keep_ids() {
        let report = run(
            &["id", "date", "amount", "source_file", "raw_ref"],
            &[&["tx_abc", "2024-01-15", "1", "jan.csv", "#row=7"]],
        );
        let tx = &report.accepted[0];
        assert_eq!(tx.id.as_str(), "tx_abc");
        assert_eq!(tx.source_file, "jan.csv");
        assert_eq!(tx.raw_ref, "#row=7");
    }

    #[test]
    fn repeated_ids_are_rejected() {
        let report = run(
            &["id", "date", "amount"],
            &[&["same", "2024-01-15", "1"], &["same", "2024-01-16", "2"]],
        );
        assert_eq!(report.accepted.len(), 1);
        assert_eq!(report.rejected[0].reason, RejectReason::DuplicateId(TransactionId("same".into())));
    }
}
