use chrono::{NaiveDate, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tally_core::{Annotation, DateRange, Transaction, TransactionId, NO_DESCRIPTION};
use tracing::info;

use crate::config::CleaningConfig;

/// Consistency factor that makes the MAD comparable to a standard deviation.
const MAD_SCALE: f64 = 0.6745;
/// Files with fewer rows than this are too small to judge outliers.
const MIN_OUTLIER_SAMPLE: usize = 5;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleaningReport {
    pub descriptions_filled: usize,
    pub out_of_range: usize,
    pub outliers: usize,
    pub exact_duplicates: usize,
    /// Transactions modified by this pass. Zero on a second pass.
    pub changed: usize,
}

/// Annotates transactions for review. Never removes a row, and running it
/// again over its own output changes nothing.
pub struct Cleaner {
    range: DateRange,
    outlier_threshold: f64,
}

impl Default for Cleaner {
    fn default() -> Self {
        Self::new(&CleaningConfig::default())
    }
}

impl Cleaner {
    pub fn new(config: &CleaningConfig) -> Self {
        let reference = config.reference_date.unwrap_or_else(|| Utc::now().date_naive());
        Self {
            range: DateRange::plausible(reference, config.min_year, config.max_future_years),
            outlier_threshold: config.outlier_mad_threshold,
        }
    }

    pub fn plausible_range(&self) -> DateRange {
        self.range
    }

    pub fn clean(&self, transactions: &mut [Transaction]) -> CleaningReport {
        let mut report = CleaningReport::default();
        let mut changed = vec![false; transactions.len()];

        for (i, tx) in transactions.iter_mut().enumerate() {
            if tx.description.trim().is_empty() {
                tx.description = NO_DESCRIPTION.to_string();
                changed[i] = true;
            }
            if tx.description == NO_DESCRIPTION {
                changed[i] |= tx.annotations.insert(Annotation::DescriptionFilled);
                report.descriptions_filled += 1;
            }
            if !self.range.contains(tx.date) {
                changed[i] |= tx.annotations.insert(Annotation::OutOfRange);
                report.out_of_range += 1;
            }
        }

        for i in self.outlier_indices(transactions) {
            changed[i] |= transactions[i].annotations.insert(Annotation::Outlier);
            report.outliers += 1;
        }

        for (i, original) in exact_duplicate_pairs(transactions) {
            changed[i] |= transactions[i].annotations.insert(Annotation::ExactDuplicateOf(original));
            report.exact_duplicates += 1;
        }

        report.changed = changed.iter().filter(|c| **c).count();
        info!(
            filled = report.descriptions_filled,
            out_of_range = report.out_of_range,
            outliers = report.outliers,
            exact_duplicates = report.exact_duplicates,
            changed = report.changed,
            "Cleaned transactions"
        );
        report
    }

    /// Amounts whose robust z-score within their own file exceeds the threshold.
    fn outlier_indices(&self, transactions: &[Transaction]) -> Vec<usize> {
        let mut by_file: HashMap<&str, Vec<(usize, f64)>> = HashMap::new();
        for (i, tx) in transactions.iter().enumerate() {
            if let Some(v) = tx.amount.value().abs().to_f64() {
                by_file.entry(tx.source_file.as_str()).or_default().push((i, v));
            }
        }

        let mut out = Vec::new();
        for values in by_file.values() {
            if values.len() < MIN_OUTLIER_SAMPLE {
                continue;
            }
            let median = median(values.iter().map(|(_, v)| *v).collect());
            let mad = median_abs_deviation(values, median);
            if mad == 0.0 {
                continue;
            }
            for (i, v) in values {
                if MAD_SCALE * (v - median).abs() / mad > self.outlier_threshold {
                    out.push(*i);
                }
            }
        }
        out.sort_unstable();
        out
    }
}

fn median(mut values: Vec<f64>) -> f64 {
    values.sort_by(f64::total_cmp);
    let n = values.len();
    if n == 0 {
        return 0.0;
    }
    if n % 2 == 1 {
        values[n / 2]
    } else {
        (values[n / 2 - 1] + values[n / 2]) / 2.0
    }
}

fn median_abs_deviation(values: &[(usize, f64)], center: f64) -> f64 {
    median(values.iter().map(|(_, v)| (v - center).abs()).collect())
}

/// `(index, id of first occurrence)` for every later row of the same file
/// with identical date, amount and description.
fn exact_duplicate_pairs(transactions: &[Transaction]) -> Vec<(usize, TransactionId)> {
    let mut first: HashMap<(&str, NaiveDate, Decimal, &str), &TransactionId> = HashMap::new();
    let mut out = Vec::new();
    for (i, tx) in transactions.iter().enumerate() {
        let key = (
            tx.source_file.as_str(),
            tx.date,
            tx.amount.value().normalize(),
            tx.description.as_str(),
        );
        match first.get(&key) {
            Some(original) if **original != tx.id => out.push((i, (*original).clone())),
            Some(_) => {}
            None => {
                first.insert(key, &tx.id);
            }
        }
    }
    out
}
