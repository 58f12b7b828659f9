use std::collections::HashMap;

pub const UNCATEGORIZED: &str = "Uncategorized";

pub const DEFAULT_CATEGORIES: &[&str] = &[
    "Groceries",
    "Dining",
    "Transport",
    "Fuel",
    "Utilities",
    "Rent",
    "Housing",
    "Entertainment",
    "Shopping",
    "Health",
    "Travel",
    "Education",
    "Insurance",
    "Subscriptions",
    "Fees",
    "Taxes",
    "Gifts",
    "Salary",
    "Income",
    "Transfer",
    UNCATEGORIZED,
];

/// Case and whitespace folding used for every category comparison.
pub fn fold(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Bounded category vocabulary. Values that fold onto a known entry are
/// rewritten to its canonical spelling; anything else passes through trimmed.
#[derive(Debug, Clone)]
pub struct CategoryVocabulary {
    by_folded: HashMap<String, String>,
}

impl CategoryVocabulary {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut by_folded = HashMap::new();
        for entry in entries {
            let canonical = entry.as_ref().split_whitespace().collect::<Vec<_>>().join(" ");
            if canonical.is_empty() {
                continue;
            }
            by_folded.entry(fold(&canonical)).or_insert(canonical);
        }
        by_folded
            .entry(fold(UNCATEGORIZED))
            .or_insert_with(|| UNCATEGORIZED.to_string());
        Self { by_folded }
    }

    pub fn canonicalize(&self, raw: &str) -> String {
        let folded = fold(raw);
        if folded.is_empty() {
            return UNCATEGORIZED.to_string();
        }
        match self.by_folded.get(&folded) {
            Some(canonical) => canonical.clone(),
            None => raw.split_whitespace().collect::<Vec<_>>().join(" "),
        }
    }

    pub fn contains(&self, raw: &str) -> bool {
        self.by_folded.contains_key(&fold(raw))
    }
}

impl Default for CategoryVocabulary {
    fn default() -> Self {
        Self::new(DEFAULT_CATEGORIES.iter().copied())
    }
}
