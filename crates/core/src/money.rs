use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Neg, Sub};
use std::str::FromStr;
use thiserror::Error;

/// Signed decimal amount in whatever unit the source file used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Amount(Decimal);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AmountParseError {
    #[error("Amount is blank")]
    Blank,
    #[error("Not a number: '{0}'")]
    NotANumber(String),
}

const CURRENCY_SYMBOLS: &[char] = &['$', '€', '£', '¥', '₹', '₩', '₽', '₺', '₪', '¢', '₫', '₱'];

const CURRENCY_CODES: &[&str] = &[
    "USD", "EUR", "GBP", "JPY", "CAD", "AUD", "NZD", "CHF", "INR", "CNY", "SEK", "NOK", "DKK",
    "MXN", "BRL", "ZAR", "SGD", "HKD",
];

impl Amount {
    pub fn from_decimal(decimal: Decimal) -> Self {
        Amount(decimal)
    }

    pub fn zero() -> Self {
        Amount(Decimal::ZERO)
    }

    pub fn value(self) -> Decimal {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0.is_zero()
    }

    pub fn is_negative(self) -> bool {
        self.0.is_sign_negative() && !self.0.is_zero()
    }

    pub fn abs(self) -> Self {
        Amount(self.0.abs())
    }

    /// Parse a raw cell the way bank exports write money: currency symbols or
    /// ISO codes, thousands separators, accounting parentheses, a trailing minus,
    /// and decimal commas (`1.234,56`).
    pub fn parse(raw: &str) -> Result<Amount, AmountParseError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(AmountParseError::Blank);
        }

        let (mut negative, body) = if trimmed.starts_with('(') && trimmed.ends_with(')') {
            (true, &trimmed[1..trimmed.len() - 1])
        } else {
            (false, trimmed)
        };

        let without_codes: String = body
            .split_whitespace()
            .filter(|tok| !CURRENCY_CODES.iter().any(|c| tok.eq_ignore_ascii_case(c)))
            .collect::<Vec<_>>()
            .join("");

        let mut s: String = without_codes
            .chars()
            .filter(|c| !CURRENCY_SYMBOLS.contains(c))
            .filter(|c| !matches!(c, ' ' | '\u{a0}' | '\'' | '_'))
            .collect();

        if let Some(stripped) = s.strip_suffix('-') {
            if !stripped.contains('-') {
                negative = !negative;
                s = stripped.to_string();
            }
        }
        if let Some(stripped) = s.strip_prefix('+') {
            s = stripped.to_string();
        }

        let not_a_number = || AmountParseError::NotANumber(raw.trim().to_string());
        let s = normalize_separators(&s).ok_or_else(not_a_number)?;
        let dec = Decimal::from_str(&s)
            .or_else(|_| Decimal::from_scientific(&s))
            .map_err(|_| not_a_number())?;

        Ok(Amount(if negative { -dec } else { dec }))
    }
}

/// Resolve `,` vs `.` into a plain `1234.56` form. `None` when the separators
/// do not form a valid grouping (`1,23,4`).
fn normalize_separators(s: &str) -> Option<String> {
    let last_comma = s.rfind(',');
    let last_dot = s.rfind('.');
    let (int_part, frac, group_sep) = match (last_comma, last_dot) {
        // 1.234,56
        (Some(c), Some(d)) if c > d => (&s[..c], Some(&s[c + 1..]), '.'),
        // 1,234.56
        (Some(_), Some(d)) => (&s[..d], Some(&s[d + 1..]), ','),
        // 12,50 and 1,5 are decimal commas; 1,234 groups thousands
        (Some(c), None) => {
            let tail = &s[c + 1..];
            let decimal = s.matches(',').count() == 1
                && (1..=2).contains(&tail.len())
                && tail.chars().all(|ch| ch.is_ascii_digit());
            if decimal {
                (&s[..c], Some(tail), ',')
            } else {
                (s, None, ',')
            }
        }
        // 1.234.567
        (None, Some(_)) if s.matches('.').count() > 1 => (s, None, '.'),
        _ => return Some(s.to_string()),
    };

    if frac.is_some_and(|f| f.contains([',', '.'])) {
        return None;
    }
    let digits = int_part.trim_start_matches('-');
    let groups: Vec<&str> = digits.split(group_sep).collect();
    if groups.len() > 1 {
        let lead_ok = (1..=3).contains(&groups[0].len());
        if !lead_ok || groups[1..].iter().any(|g| g.len() != 3) {
            return None;
        }
    }

    let mut out = String::with_capacity(s.len());
    if int_part.starts_with('-') {
        out.push('-');
    }
    out.push_str(&groups.concat());
    if let Some(frac) = frac {
        out.push('.');
        out.push_str(frac);
    }
    Some(out)
}

impl FromStr for Amount {
    type Err = AmountParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Amount::parse(s)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add for Amount {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Amount(self.0 + rhs.0)
    }
}

impl Sub for Amount {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Amount(self.0 - rhs.0)
    }
}

impl Neg for Amount {
    type Output = Self;
    fn neg(self) -> Self {
        Amount(-self.0)
    }
}
