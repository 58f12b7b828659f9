//! Schema mapping: assigns raw column labels to canonical fields.
//!
//! Matching runs in three stages. Exact matches against the field name win
//! over normalized synonym matches, which win over fuzzy ones; within a stage
//! the highest confidence wins, then field order, then the leftmost label.
//! Every label and every field is used at most once.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use tally_core::{Amount, CanonicalField, RawTable};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::MapperConfig;
use crate::similarity::{normalize, text_similarity};

/// Labels carried through verbatim so exported files re-import with identical ids.
pub const ID_LABEL: &str = "id";
pub const SOURCE_FILE_LABEL: &str = "source_file";
pub const RAW_REF_LABEL: &str = "raw_ref";

const NORMALIZED_FULL: f32 = 0.95;
const NORMALIZED_HEAD: f32 = 0.9;
const NORMALIZED_PARTIAL: f32 = 0.8;
/// Confidence of an amount guessed from column contents alone.
const NUMERIC_GUESS: f32 = 0.5;

const ABBREVIATIONS: &[(&str, &str)] = &[
    ("txn", "transaction"),
    ("trans", "transaction"),
    ("tx", "transaction"),
    ("amt", "amount"),
    ("desc", "description"),
    ("descr", "description"),
    ("dt", "date"),
    ("cat", "category"),
];

fn builtin_synonyms(field: CanonicalField) -> &'static [&'static str] {
    match field {
        CanonicalField::Date => &[
            "date",
            "time",
            "day",
            "when",
            "timestamp",
            "transaction date",
            "posted date",
            "posting date",
            "value date",
            "booking date",
        ],
        CanonicalField::Description => &[
            "description",
            "name",
            "merchant",
            "vendor",
            "store",
            "transaction",
            "details",
            "item",
            "payee",
            "memo",
            "narrative",
        ],
        CanonicalField::Category => &["category", "group", "label", "classification"],
        CanonicalField::Amount => &[
            "amount", "sum", "price", "cost", "total", "payment", "value", "expense",
        ],
        CanonicalField::Type => &[
            "type",
            "kind",
            "direction",
            "transaction type",
            "dr cr",
            "debit credit",
        ],
    }
}

/// Normalize a label and expand known abbreviations token by token.
fn canonical_label(raw: &str) -> String {
    normalize(raw)
        .split(' ')
        .filter(|t| !t.is_empty())
        .map(|token| {
            ABBREVIATIONS
                .iter()
                .find(|(abbr, _)| *abbr == token)
                .map(|(_, full)| *full)
                .unwrap_or(token)
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// True when `raw` names a canonical field outright or contains one of its
/// built-in synonyms as a whole phrase.
pub(crate) fn names_canonical_field(raw: &str) -> bool {
    let label = canonical_label(raw);
    if label.is_empty() {
        return false;
    }
    let tokens: Vec<&str> = label.split(' ').collect();
    CanonicalField::ALL.into_iter().any(|field| {
        raw.trim().eq_ignore_ascii_case(field.name())
            || builtin_synonyms(field).iter().any(|synonym| {
                let phrase: Vec<&str> = synonym.split(' ').collect();
                phrase.len() <= tokens.len() && tokens.windows(phrase.len()).any(|w| w == phrase.as_slice())
            })
    })
}

/// True when every non-blank value under `label` parses as an amount and at
/// least one value is present.
fn is_numeric_column(table: &RawTable, label: &str) -> bool {
    let mut seen = false;
    for value in table.records.iter().filter_map(|r| r.get(label)).map(str::trim) {
        if value.is_empty() {
            continue;
        }
        if Amount::parse(value).is_err() {
            return false;
        }
        seen = true;
    }
    seen
}

/// Stable key of a file layout: the hash of its normalized label list.
pub fn layout_key<S: AsRef<str>>(labels: &[S]) -> String {
    let mut hasher = Sha256::new();
    for label in labels {
        hasher.update(normalize(label.as_ref()).as_bytes());
        hasher.update([0x1f]);
    }
    let digest = hasher.finalize();
    digest.iter().take(16).map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    Exact,
    Normalized,
    Fuzzy,
    /// Reused from a stored mapping for the same layout.
    Template,
    /// Chosen by the user during confirmation.
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMatch {
    pub label: String,
    pub confidence: f32,
    pub method: MatchMethod,
}

/// Canonical field → source label, plus the optional passthrough columns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub fields: BTreeMap<CanonicalField, FieldMatch>,
    #[serde(default)]
    pub id_label: Option<String>,
    #[serde(default)]
    pub source_file_label: Option<String>,
    #[serde(default)]
    pub raw_ref_label: Option<String>,
}

impl ColumnMapping {
    pub fn get(&self, field: CanonicalField) -> Option<&FieldMatch> {
        self.fields.get(&field)
    }

    pub fn label(&self, field: CanonicalField) -> Option<&str> {
        self.fields.get(&field).map(|m| m.label.as_str())
    }

    pub fn unmapped(&self) -> Vec<CanonicalField> {
        CanonicalField::ALL
            .into_iter()
            .filter(|f| !self.fields.contains_key(f))
            .collect()
    }

    /// Every label this mapping reads from.
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.fields
            .values()
            .map(|m| m.label.as_str())
            .chain(self.id_label.as_deref())
            .chain(self.source_file_label.as_deref())
            .chain(self.raw_ref_label.as_deref())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MappingError {
    #[error("Column '{0}' does not exist in this file")]
    UnknownLabel(String),
    #[error("Column '{label}' is assigned to more than one field")]
    LabelInUse { label: String },
    #[error("Required field '{0}' is not mapped")]
    MissingRequired(CanonicalField),
    #[error("Mapping needs confirmation for: {0:?}")]
    NeedsConfirmation(Vec<CanonicalField>),
}

/// A caller decision fed back through [`MappingProposal::confirm`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum MappingDecision {
    /// Keep the proposed label for this field.
    Accept { field: CanonicalField },
    /// Use this label instead.
    Assign { field: CanonicalField, label: String },
    /// Leave the field unmapped.
    Unmap { field: CanonicalField },
}

/// Mapping awaiting confirmation. Only [`ConfirmedMapping`] can drive the
/// normalizer, so low-confidence guesses are never applied implicitly.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MappingProposal {
    pub file_id: String,
    pub labels: Vec<String>,
    pub layout_key: String,
    pub mapping: ColumnMapping,
    /// Ranked candidates per field, for presenting alternatives.
    pub alternatives: BTreeMap<CanonicalField, Vec<FieldMatch>>,
    auto_confirm_threshold: f32,
}

impl MappingProposal {
    /// Fields that need a caller decision: matches below the auto-confirm
    /// threshold and required fields with no match at all.
    pub fn pending(&self) -> Vec<CanonicalField> {
        CanonicalField::ALL
            .into_iter()
            .filter(|field| match self.mapping.get(*field) {
                Some(m) => m.confidence < self.auto_confirm_threshold,
                None => field.is_required(),
            })
            .collect()
    }

    pub fn is_confident(&self) -> bool {
        self.pending().is_empty()
    }

    /// Confirm without user input when every match is confident. Hands the
    /// proposal back unchanged otherwise.
    pub fn try_auto_confirm(self) -> Result<ConfirmedMapping, MappingProposal> {
        if !self.is_confident() {
            return Err(self);
        }
        Ok(ConfirmedMapping {
            layout_key: self.layout_key,
            mapping: self.mapping,
        })
    }

    /// Apply caller decisions. Undecided matches below the auto-confirm
    /// threshold are dropped; required fields must end up mapped.
    pub fn confirm(self, decisions: &[MappingDecision]) -> Result<ConfirmedMapping, MappingError> {
        let mut mapping = self.mapping;
        let mut decided = BTreeSet::new();

        for decision in decisions {
            match decision {
                MappingDecision::Accept { field } => {
                    decided.insert(*field);
                }
                MappingDecision::Assign { field, label } => {
                    if !self.labels.iter().any(|l| l == label) {
                        return Err(MappingError::UnknownLabel(label.clone()));
                    }
                    mapping.fields.insert(
                        *field,
                        FieldMatch {
                            label: label.clone(),
                            confidence: 1.0,
                            method: MatchMethod::Manual,
                        },
                    );
                    decided.insert(*field);
                }
                MappingDecision::Unmap { field } => {
                    mapping.fields.remove(field);
                    decided.insert(*field);
                }
            }
        }

        let threshold = self.auto_confirm_threshold;
        mapping
            .fields
            .retain(|field, m| decided.contains(field) || m.confidence >= threshold);

        let mut seen = BTreeSet::new();
        for label in mapping.labels() {
            if !seen.insert(label) {
                return Err(MappingError::LabelInUse { label: label.to_string() });
            }
        }
        if let Some(field) = CanonicalField::ALL
            .into_iter()
            .find(|f| f.is_required() && !mapping.fields.contains_key(f))
        {
            return Err(MappingError::MissingRequired(field));
        }

        Ok(ConfirmedMapping {
            layout_key: self.layout_key,
            mapping,
        })
    }
}

/// A mapping the caller has signed off on.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmedMapping {
    layout_key: String,
    mapping: ColumnMapping,
}

impl ConfirmedMapping {
    pub fn mapping(&self) -> &ColumnMapping {
        &self.mapping
    }

    pub fn layout_key(&self) -> &str {
        &self.layout_key
    }

    pub fn into_mapping(self) -> ColumnMapping {
        self.mapping
    }
}

struct Candidate {
    field: CanonicalField,
    label_index: usize,
    confidence: f32,
    method: MatchMethod,
}

pub struct SchemaMapper {
    synonyms: BTreeMap<CanonicalField, Vec<String>>,
    accept_threshold: f32,
    auto_confirm_threshold: f32,
}

impl Default for SchemaMapper {
    fn default() -> Self {
        Self::new(&MapperConfig::default())
    }
}

impl SchemaMapper {
    /// Built-in synonyms plus any configured extras. Unknown field names in the
    /// config are ignored here; `EngineConfig::validate` reports them.
    pub fn new(config: &MapperConfig) -> Self {
        let mut synonyms = BTreeMap::new();
        for field in CanonicalField::ALL {
            let mut list: Vec<String> = builtin_synonyms(field).iter().map(|s| canonical_label(s)).collect();
            if let Some((_, extra)) = config
                .synonyms
                .iter()
                .find(|(name, _)| name.parse::<CanonicalField>().ok() == Some(field))
            {
                list.extend(extra.iter().map(|s| canonical_label(s)));
            }
            list.dedup();
            synonyms.insert(field, list);
        }
        Self {
            synonyms,
            accept_threshold: config.accept_threshold,
            auto_confirm_threshold: config.auto_confirm_threshold,
        }
    }

    fn score(&self, field: CanonicalField, raw_label: &str) -> Option<(MatchMethod, f32)> {
        if raw_label.trim().eq_ignore_ascii_case(field.name()) {
            return Some((MatchMethod::Exact, 1.0));
        }
        let label = canonical_label(raw_label);
        if label.is_empty() {
            return None;
        }
        let synonyms = &self.synonyms[&field];
        if synonyms.iter().any(|s| *s == label) {
            return Some((MatchMethod::Normalized, NORMALIZED_FULL));
        }

        let tokens: Vec<&str> = label.split(' ').collect();
        let mut partial: Option<f32> = None;
        for synonym in synonyms {
            let phrase: Vec<&str> = synonym.split(' ').collect();
            if phrase.len() >= tokens.len() {
                continue;
            }
            if let Some(pos) = tokens.windows(phrase.len()).position(|w| w == phrase.as_slice()) {
                let score = if pos + phrase.len() == tokens.len() {
                    NORMALIZED_HEAD
                } else {
                    NORMALIZED_PARTIAL
                };
                partial = Some(partial.map_or(score, |p| p.max(score)));
            }
        }
        if let Some(score) = partial {
            return Some((MatchMethod::Normalized, score));
        }

        let best = synonyms
            .iter()
            .map(|s| text_similarity(&label, s))
            .fold(0.0f32, f32::max);
        (best >= self.accept_threshold).then_some((MatchMethod::Fuzzy, best))
    }

    /// Propose a mapping for `table`'s labels.
    pub fn propose(&self, file_id: &str, table: &RawTable) -> MappingProposal {
        let labels = table.labels.clone();
        let mut mapping = ColumnMapping::default();
        let mut excluded = vec![false; labels.len()];

        for (i, label) in labels.iter().enumerate() {
            let slot = match label.trim().to_lowercase().as_str() {
                ID_LABEL => &mut mapping.id_label,
                SOURCE_FILE_LABEL => &mut mapping.source_file_label,
                RAW_REF_LABEL => &mut mapping.raw_ref_label,
                _ => continue,
            };
            if slot.is_none() {
                *slot = Some(label.clone());
                excluded[i] = true;
            }
        }

        let mut candidates: Vec<Candidate> = Vec::new();
        for field in CanonicalField::ALL {
            for (label_index, label) in labels.iter().enumerate() {
                if excluded[label_index] {
                    continue;
                }
                if let Some((method, confidence)) = self.score(field, label) {
                    candidates.push(Candidate {
                        field,
                        label_index,
                        confidence,
                        method,
                    });
                }
            }
        }
        candidates.sort_by(|a, b| {
            a.method
                .cmp(&b.method)
                .then_with(|| b.confidence.total_cmp(&a.confidence))
                .then_with(|| a.field.cmp(&b.field))
                .then_with(|| a.label_index.cmp(&b.label_index))
        });

        let mut used = vec![false; labels.len()];
        let mut alternatives: BTreeMap<CanonicalField, Vec<FieldMatch>> = BTreeMap::new();
        for c in &candidates {
            let m = FieldMatch {
                label: labels[c.label_index].clone(),
                confidence: c.confidence,
                method: c.method,
            };
            let alts = alternatives.entry(c.field).or_default();
            if alts.len() < 3 {
                alts.push(m.clone());
            }
            if used[c.label_index] || mapping.fields.contains_key(&c.field) {
                continue;
            }
            used[c.label_index] = true;
            debug!(field = %c.field, label = %m.label, method = ?m.method, confidence = m.confidence, "Mapped column");
            mapping.fields.insert(c.field, m);
        }

        if !mapping.fields.contains_key(&CanonicalField::Amount) {
            let numeric = (0..labels.len()).find(|&i| !used[i] && !excluded[i] && is_numeric_column(table, &labels[i]));
            if let Some(i) = numeric {
                let alts = alternatives.entry(CanonicalField::Amount).or_default();
                if !alts.iter().any(|m| m.label == labels[i]) {
                    debug!(label = %labels[i], "Offering numeric column as amount");
                    alts.push(FieldMatch {
                        label: labels[i].clone(),
                        confidence: NUMERIC_GUESS,
                        method: MatchMethod::Fuzzy,
                    });
                }
            }
        }

        let proposal = MappingProposal {
            file_id: file_id.to_string(),
            layout_key: layout_key(&labels),
            labels,
            mapping,
            alternatives,
            auto_confirm_threshold: self.auto_confirm_threshold,
        };
        info!(
            file_id,
            mapped = proposal.mapping.fields.len(),
            pending = ?proposal.pending(),
            "Proposed column mapping"
        );
        proposal
    }

    /// Reuse a stored mapping when every label it reads is present in `table`;
    /// otherwise fall back to [`SchemaMapper::propose`].
    pub fn propose_with_template(
        &self,
        file_id: &str,
        table: &RawTable,
        template: Option<&ColumnMapping>,
    ) -> MappingProposal {
        let Some(template) = template else {
            return self.propose(file_id, table);
        };
        let fits = template.labels().all(|l| table.labels.iter().any(|t| t == l))
            && CanonicalField::ALL
                .into_iter()
                .filter(|f| f.is_required())
                .all(|f| template.fields.contains_key(&f));
        if !fits {
            debug!(file_id, "Stored mapping does not fit this file");
            return self.propose(file_id, table);
        }

        let mut mapping = template.clone();
        for m in mapping.fields.values_mut() {
            m.confidence = 1.0;
            m.method = MatchMethod::Template;
        }
        info!(file_id, "Reusing stored column mapping");
        MappingProposal {
            file_id: file_id.to_string(),
            layout_key: layout_key(&table.labels),
            labels: table.labels.clone(),
            mapping,
            alternatives: BTreeMap::new(),
            auto_confirm_threshold: self.auto_confirm_threshold,
        }
    }
}
