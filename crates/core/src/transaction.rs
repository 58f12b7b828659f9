use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;

use super::money::Amount;

pub const NO_DESCRIPTION: &str = "(no description)";

/// Opaque, stable identifier derived from source file, row reference and row content.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(pub String);

impl TransactionId {
    pub fn derive(source_file: &str, raw_ref: &str) -> Self {
        Self::derive_for_row(source_file, raw_ref, &[])
    }

    /// Like [`TransactionId::derive`], but the row's cells are part of the
    /// hash, so two different files sharing a name (monthly `statement.csv`)
    /// never collide on the same row position.
    pub fn derive_for_row(source_file: &str, raw_ref: &str, cells: &[(String, String)]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(source_file.as_bytes());
        hasher.update([0u8]);
        hasher.update(raw_ref.as_bytes());
        for (label, value) in cells {
            hasher.update([0x1e]);
            hasher.update(label.as_bytes());
            hasher.update([0x1f]);
            hasher.update(value.trim().as_bytes());
        }
        let digest = hasher.finalize();
        let hex: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
        TransactionId(format!("tx_{hex}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionType {
    Income,
    Expense,
}

impl TransactionType {
    /// Negative amounts are expenses; zero and positive amounts are income.
    pub fn from_amount(amount: Amount) -> Self {
        if amount.is_negative() {
            TransactionType::Expense
        } else {
            TransactionType::Income
        }
    }

    /// Case-insensitive match against the vocabulary banks use in type columns.
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "income" | "credit" | "cr" | "deposit" | "inflow" | "in" | "received" => {
                Some(TransactionType::Income)
            }
            "expense" | "debit" | "dr" | "withdrawal" | "outflow" | "out" | "payment" | "spent" => {
                Some(TransactionType::Expense)
            }
            _ => None,
        }
    }

    /// Force the sign of `amount` to agree with this type.
    pub fn sign(self, amount: Amount) -> Amount {
        match self {
            TransactionType::Income => amount.abs(),
            TransactionType::Expense => -amount.abs(),
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionType::Income => write!(f, "Income"),
            TransactionType::Expense => write!(f, "Expense"),
        }
    }
}

/// Review markers attached by the cleaning stage. Never cause data loss.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum Annotation {
    /// Description was blank and replaced by the sentinel.
    DescriptionFilled,
    /// Date falls outside the plausible range.
    OutOfRange,
    /// Amount is far from the file's typical magnitude.
    Outlier,
    /// Same date, amount and description as an earlier row of the same file.
    ExactDuplicateOf(TransactionId),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub date: NaiveDate,
    pub description: String,
    pub category: String,
    pub amount: Amount,
    #[serde(rename = "type")]
    pub kind: TransactionType,
    pub source_file: String,
    pub raw_ref: String,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub annotations: BTreeSet<Annotation>,
}

impl Transaction {
    /// Amount sign agrees with the type (zero is compatible with either).
    pub fn is_consistent(&self) -> bool {
        self.amount.is_zero() || (self.amount.is_negative() == (self.kind == TransactionType::Expense))
    }

    pub fn duplicate_of(&self) -> Option<&TransactionId> {
        self.annotations.iter().find_map(|a| match a {
            Annotation::ExactDuplicateOf(id) => Some(id),
            _ => None,
        })
    }
}
