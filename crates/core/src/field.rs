use serde::{Deserialize, Serialize};
use std::fmt;

/// Target columns every import is normalized into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalField {
    Date,
    Description,
    Category,
    Amount,
    Type,
}

impl CanonicalField {
    pub const ALL: [CanonicalField; 5] = [
        CanonicalField::Date,
        CanonicalField::Description,
        CanonicalField::Category,
        CanonicalField::Amount,
        CanonicalField::Type,
    ];

    pub fn name(self) -> &'static str {
        match self {
            CanonicalField::Date => "date",
            CanonicalField::Description => "description",
            CanonicalField::Category => "category",
            CanonicalField::Amount => "amount",
            CanonicalField::Type => "type",
        }
    }

    /// Fields that must be mapped before a file can be normalized.
    pub fn is_required(self) -> bool {
        matches!(self, CanonicalField::Date | CanonicalField::Amount)
    }
}

impl fmt::Display for CanonicalField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for CanonicalField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CanonicalField::ALL
            .into_iter()
            .find(|f| f.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("Unknown field: '{s}'"))
    }
}
