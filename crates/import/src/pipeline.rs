//! End-to-end import: read, propose a mapping, normalize, clean, merge and
//! cluster duplicates.
//!
//! Files are independent until [`ImportEngine::merge`]: each is read and
//! normalized into its own accumulator, and duplicate detection runs once over
//! the merged set.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tally_core::{RawTable, Transaction, TransactionId};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::clean::{Cleaner, CleaningReport};
use crate::config::EngineConfig;
use crate::dedup::{DuplicateCluster, DuplicateDetector};
use crate::mapper::{layout_key, ColumnMapping, ConfirmedMapping, MappingError, MappingProposal, SchemaMapper};
use crate::normalize::{NormalizeReport, Normalizer};
use crate::readers::{read_container, ContainerKind, ReadContext, ReadError, SkippedEntry};
use crate::source::SourceFile;

/// A file-level failure tagged with the file it belongs to.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{file_id}: {error}")]
pub struct FileError {
    pub file_id: String,
    pub error: ReadError,
}

impl FileError {
    fn new(file_id: &str, error: ReadError) -> Self {
        Self {
            file_id: file_id.to_string(),
            error,
        }
    }
}

/// A file that has been read and has a mapping proposal, awaiting confirmation.
#[derive(Debug, Clone)]
pub struct StagedFile {
    pub file_id: String,
    pub kind: ContainerKind,
    pub table: RawTable,
    pub skipped: Vec<SkippedEntry>,
    pub proposal: MappingProposal,
}

impl StagedFile {
    /// Confirm the proposal as-is, or report the fields that need a decision.
    pub fn auto_confirm(&self) -> Result<ConfirmedMapping, MappingError> {
        self.proposal
            .clone()
            .try_auto_confirm()
            .map_err(|p| MappingError::NeedsConfirmation(p.pending()))
    }
}

/// Upload history entry for one file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImportSummary {
    pub file_id: String,
    pub kind: ContainerKind,
    pub rows_read: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub skipped_entries: usize,
    pub imported_at: DateTime<Utc>,
}

/// One file after normalization and cleaning, not yet merged.
#[derive(Debug, Clone)]
pub struct FileImport {
    pub summary: ImportSummary,
    pub report: NormalizeReport,
    pub cleaning: CleaningReport,
    pub mapping: ConfirmedMapping,
}

#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    pub transactions: Vec<Transaction>,
    pub clusters: Vec<DuplicateCluster>,
    /// Prior transactions replaced by an incoming one with the same id.
    pub superseded: usize,
}

#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub imported: Vec<FileImport>,
    /// Files whose mapping needs a caller decision; not merged.
    pub pending: Vec<StagedFile>,
    pub failed: Vec<FileError>,
    pub merged: MergeOutcome,
    /// The batch was cancelled and nothing was merged.
    pub cancelled: bool,
}

struct Stages {
    config: EngineConfig,
    mapper: SchemaMapper,
    normalizer: Normalizer,
    cleaner: Cleaner,
    detector: DuplicateDetector,
}

/// Cheap to clone; clones share the same stages.
#[derive(Clone)]
pub struct ImportEngine {
    inner: Arc<Stages>,
}

impl Default for ImportEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl ImportEngine {
    pub fn new(config: EngineConfig) -> Self {
        let stages = Stages {
            mapper: SchemaMapper::new(&config.mapper),
            normalizer: Normalizer::new(&config.normalizer),
            cleaner: Cleaner::new(&config.cleaning),
            detector: DuplicateDetector::new(&config.dedup),
            config,
        };
        Self { inner: Arc::new(stages) }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn detector(&self) -> &DuplicateDetector {
        &self.inner.detector
    }

    /// Detect the kind, read the file and propose a mapping. A stored template
    /// for the file's layout is reused when it fits.
    pub fn stage(
        &self,
        source: &SourceFile,
        templates: &HashMap<String, ColumnMapping>,
        cancel: &CancellationToken,
    ) -> Result<StagedFile, FileError> {
        let file_id = source.file_id.as_str();
        let kind = source.kind().map_err(|e| FileError::new(file_id, e))?;
        info!(file_id, kind = %kind, bytes = source.bytes.len(), "Detected container kind");

        let ctx = ReadContext::new(&self.inner.config.reader).with_cancel(cancel.clone());
        let output = read_container(kind, file_id, &source.bytes, &ctx).map_err(|e| FileError::new(file_id, e))?;
        for entry in &output.skipped {
            warn!(file_id, entry = %entry.path, error = %entry.error, "Skipped archive entry");
        }

        let template = templates.get(&layout_key(&output.table.labels));
        let proposal = self
            .inner
            .mapper
            .propose_with_template(file_id, &output.table, template);

        Ok(StagedFile {
            file_id: file_id.to_string(),
            kind,
            table: output.table,
            skipped: output.skipped,
            proposal,
        })
    }

    /// Normalize and clean a staged file under a confirmed mapping.
    pub fn ingest(&self, staged: &StagedFile, mapping: ConfirmedMapping) -> FileImport {
        let mut report = self.inner.normalizer.normalize(&staged.table, &mapping);
        let cleaning = self.inner.cleaner.clean(&mut report.accepted);

        for (reason, count) in report.reject_counts() {
            info!(file_id = %staged.file_id, reason, count, "Rejected rows");
        }
        let summary = ImportSummary {
            file_id: staged.file_id.clone(),
            kind: staged.kind,
            rows_read: staged.table.len(),
            accepted: report.accepted.len(),
            rejected: report.rejected.len(),
            skipped_entries: staged.skipped.len(),
            imported_at: Utc::now(),
        };
        FileImport {
            summary,
            report,
            cleaning,
            mapping,
        }
    }

    /// Merge incoming transactions into the prior set and cluster duplicates.
    /// An incoming id already present in `prior` replaces the stored copy, and
    /// among incoming transactions the last occurrence of an id wins.
    pub fn merge(&self, prior: &[Transaction], incoming: Vec<Transaction>) -> MergeOutcome {
        let mut latest: HashMap<TransactionId, usize> = HashMap::new();
        for (i, tx) in incoming.iter().enumerate() {
            latest.insert(tx.id.clone(), i);
        }
        let incoming: Vec<Transaction> = incoming
            .into_iter()
            .enumerate()
            .filter(|(i, tx)| latest.get(&tx.id) == Some(i))
            .map(|(_, tx)| tx)
            .collect();

        let incoming_ids: HashSet<&TransactionId> = incoming.iter().map(|t| &t.id).collect();
        let kept_prior: Vec<Transaction> = prior
            .iter()
            .filter(|t| !incoming_ids.contains(&t.id))
            .cloned()
            .collect();
        let superseded = prior.len() - kept_prior.len();

        let clusters = self.inner.detector.detect_against(&incoming, &kept_prior);
        info!(
            prior = prior.len(),
            incoming = incoming.len(),
            superseded,
            clusters = clusters.len(),
            "Merged transactions"
        );

        let mut transactions = kept_prior;
        transactions.extend(incoming);
        MergeOutcome {
            transactions,
            clusters,
            superseded,
        }
    }

    /// Import a batch of files in parallel. Files with a confident mapping are
    /// ingested and merged into `prior`; the rest are returned as pending.
    /// A file failure never aborts the batch. On cancellation nothing is merged.
    pub async fn import_batch(
        &self,
        sources: Vec<SourceFile>,
        prior: &[Transaction],
        templates: &HashMap<String, ColumnMapping>,
        cancel: CancellationToken,
    ) -> BatchOutcome {
        let templates = Arc::new(templates.clone());
        let mut handles = Vec::with_capacity(sources.len());
        for source in sources {
            let engine = self.clone();
            let templates = Arc::clone(&templates);
            let cancel = cancel.clone();
            let file_id = source.file_id.clone();
            let handle = tokio::task::spawn_blocking(move || {
                let staged = engine.stage(&source, &templates, &cancel)?;
                Ok::<_, FileError>(match staged.auto_confirm() {
                    Ok(mapping) => FileOutcome::Imported(Box::new(engine.ingest(&staged, mapping))),
                    Err(_) => FileOutcome::Pending(Box::new(staged)),
                })
            });
            handles.push((file_id, handle));
        }

        let mut outcome = BatchOutcome::default();
        for (file_id, handle) in handles {
            match handle.await {
                Ok(Ok(FileOutcome::Imported(file))) => outcome.imported.push(*file),
                Ok(Ok(FileOutcome::Pending(staged))) => {
                    info!(file_id, pending = ?staged.proposal.pending(), "Mapping needs confirmation");
                    outcome.pending.push(*staged);
                }
                Ok(Err(e)) => {
                    warn!(file_id = %e.file_id, error = %e.error, "File failed");
                    outcome.failed.push(e);
                }
                Err(join) => {
                    warn!(file_id, error = %join, "Import task failed");
                    outcome
                        .failed
                        .push(FileError::new(&file_id, ReadError::CorruptContainer(join.to_string())));
                }
            }
        }

        if cancel.is_cancelled() {
            warn!(files = outcome.imported.len(), "Batch cancelled; nothing merged");
            outcome.cancelled = true;
            outcome.merged.transactions = prior.to_vec();
            return outcome;
        }

        let incoming: Vec<Transaction> = outcome
            .imported
            .iter()
            .flat_map(|f| f.report.accepted.iter().cloned())
            .collect();
        outcome.merged = self.merge(prior, incoming);
        info!(
            imported = outcome.imported.len(),
            pending = outcome.pending.len(),
            failed = outcome.failed.len(),
            "Batch complete"
        );
        outcome
    }
}

enum FileOutcome {
    Imported(Box<FileImport>),
    Pending(Box<StagedFile>),
}
