use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use tally_core::{CanonicalField, DEFAULT_CATEGORIES};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid setting: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub reader: ReaderConfig,
    pub mapper: MapperConfig,
    pub normalizer: NormalizerConfig,
    pub cleaning: CleaningConfig,
    pub dedup: DedupConfig,
}

impl EngineConfig {
    pub fn from_toml(toml_content: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(toml_content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let unit = |name: &str, v: f32| {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(ConfigError::Invalid(format!("{name} must be within [0, 1], got {v}")))
            }
        };
        unit("mapper.accept_threshold", self.mapper.accept_threshold)?;
        unit("mapper.auto_confirm_threshold", self.mapper.auto_confirm_threshold)?;
        unit("dedup.threshold", self.dedup.threshold)?;
        if self.mapper.auto_confirm_threshold < self.mapper.accept_threshold {
            return Err(ConfigError::Invalid(
                "mapper.auto_confirm_threshold must not be below mapper.accept_threshold".into(),
            ));
        }
        let weights = self.dedup.date_weight + self.dedup.amount_weight + self.dedup.description_weight;
        if weights <= 0.0 || [self.dedup.date_weight, self.dedup.amount_weight, self.dedup.description_weight]
            .iter()
            .any(|w| *w < 0.0)
        {
            return Err(ConfigError::Invalid("dedup weights must be non-negative with a positive sum".into()));
        }
        if self.dedup.amount_tolerance.is_sign_negative() {
            return Err(ConfigError::Invalid("dedup.amount_tolerance must not be negative".into()));
        }
        for field in self.mapper.synonyms.keys() {
            CanonicalField::from_str(field).map_err(ConfigError::Invalid)?;
        }
        if self.reader.batch_size == 0 {
            return Err(ConfigError::Invalid("reader.batch_size must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Rows read between cancellation checks.
    pub batch_size: usize,
    pub max_archive_depth: usize,
    /// Extra attempts after a failed read of the source file.
    pub io_retries: u32,
    /// First retry delay; doubles on every further attempt.
    pub retry_backoff_ms: u64,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 1024,
            max_archive_depth: 4,
            io_retries: 3,
            retry_backoff_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MapperConfig {
    /// Minimum fuzzy score for a label to be proposed at all.
    pub accept_threshold: f32,
    /// Minimum confidence for a field to be applied without confirmation.
    pub auto_confirm_threshold: f32,
    /// Additional synonyms per canonical field, merged with the built-in table.
    pub synonyms: BTreeMap<String, Vec<String>>,
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self {
            accept_threshold: 0.75,
            auto_confirm_threshold: 0.9,
            synonyms: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizerConfig {
    pub categories: Vec<String>,
    /// chrono formats tried after the built-in list.
    pub extra_date_formats: Vec<String>,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            categories: DEFAULT_CATEGORIES.iter().map(|c| c.to_string()).collect(),
            extra_date_formats: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleaningConfig {
    pub max_future_years: u32,
    pub min_year: i32,
    /// Robust z-score (median absolute deviation) above which an amount is an outlier.
    pub outlier_mad_threshold: f64,
    /// Day the plausible range is measured from; today when unset.
    pub reference_date: Option<NaiveDate>,
}

impl Default for CleaningConfig {
    fn default() -> Self {
        Self {
            max_future_years: 1,
            min_year: 1970,
            outlier_mad_threshold: 6.0,
            reference_date: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Clustering {
    /// Union of all above-threshold pairs (connected components).
    Transitive,
    /// Every member must score above threshold against every other member.
    Pairwise,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub date_window_days: i64,
    pub date_weight: f32,
    pub amount_weight: f32,
    pub description_weight: f32,
    pub threshold: f32,
    /// Absolute difference still counted as an equal amount.
    pub amount_tolerance: Decimal,
    pub clustering: Clustering,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            date_window_days: 3,
            date_weight: 0.3,
            amount_weight: 0.3,
            description_weight: 0.4,
            threshold: 0.8,
            amount_tolerance: Decimal::ZERO,
            clustering: Clustering::Transitive,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_is_default() {
        let config = EngineConfig::from_toml("").unwrap();
        assert_eq!(config.reader.batch_size, 1024);
        assert_eq!(config.dedup.date_window_days, 3);
        assert_eq!(config.dedup.clustering, Clustering::Transitive);
        assert!(config.normalizer.categories.iter().any(|c| c == "Groceries"));
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = EngineConfig::from_toml(
            r#"
            [dedup]
            threshold = 0.85
            clustering = "pairwise"
            amount_tolerance = "0.01"

            [mapper.synonyms]
            description = ["Counterparty"]
            "#,
        )
        .unwrap();
        assert_eq!(config.dedup.threshold, 0.85);
        assert_eq!(config.dedup.clustering, Clustering::Pairwise);
        assert_eq!(config.dedup.amount_tolerance, Decimal::new(1, 2));
        assert_eq!(config.dedup.date_window_days, 3);
        assert_eq!(
            config.mapper.synonyms.get("description"),
            Some(&vec!["Counterparty".to_string()])
        );
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let err = EngineConfig::from_toml("[dedup]\nthreshold = 1.5\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_inverted_mapper_thresholds() {
        let toml = "[mapper]\naccept_threshold = 0.9\nauto_confirm_threshold = 0.5\n";
        assert!(EngineConfig::from_toml(toml).is_err());
    }

    #[test]
    fn rejects_unknown_synonym_field() {
        let toml = "[mapper.synonyms]\nmemo = [\"Notes\"]\n";
        assert!(matches!(EngineConfig::from_toml(toml), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_malformed_toml() {
        assert!(matches!(EngineConfig::from_toml("[dedup"), Err(ConfigError::Toml(_))));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tally.toml");
        std::fs::write(&path, "[cleaning]\nreference_date = \"2024-06-01\"\nmax_future_years = 2\n").unwrap();
        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.cleaning.reference_date, NaiveDate::from_ymd_opt(2024, 6, 1));
        assert_eq!(config.cleaning.max_future_years, 2);
    }
}
