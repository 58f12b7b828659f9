use chrono::{Months, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Inclusive calendar range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} to {}", self.start, self.end)
    }
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        DateRange { start, end }
    }

    /// Range of dates a bank export can reasonably contain: January 1 of
    /// `min_year` up to `max_future_years` after `reference`.
    pub fn plausible(reference: NaiveDate, min_year: i32, max_future_years: u32) -> Self {
        let start = NaiveDate::from_ymd_opt(min_year, 1, 1).unwrap_or(NaiveDate::MIN);
        let end = reference
            .checked_add_months(Months::new(max_future_years.saturating_mul(12)))
            .unwrap_or(NaiveDate::MAX);
        DateRange { start, end }
    }

    pub fn contains(self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }
}
