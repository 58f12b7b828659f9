pub mod clean;
pub mod config;
pub mod dedup;
pub mod export;
pub mod mapper;
pub mod normalize;
pub mod pipeline;
pub mod readers;
pub mod source;
pub(crate) mod similarity;

pub use clean::{Cleaner, CleaningReport};
pub use config::{
    CleaningConfig, Clustering, ConfigError, DedupConfig, EngineConfig, MapperConfig, NormalizerConfig, ReaderConfig,
};
pub use dedup::{
    apply_resolutions, restore_resolutions, DuplicateCluster, DuplicateDetector, PairScore, Resolution, ResolutionError,
};
pub use export::{to_csv, to_xlsx, write_csv, ExportError};
pub use mapper::{
    layout_key, ColumnMapping, ConfirmedMapping, FieldMatch, MappingDecision, MappingError, MappingProposal,
    MatchMethod, SchemaMapper,
};
pub use normalize::{NormalizeReport, Normalizer, RejectReason, RejectedRecord};
pub use pipeline::{BatchOutcome, FileError, FileImport, ImportEngine, ImportSummary, MergeOutcome, StagedFile};
pub use readers::{read_container, ContainerKind, ReadContext, ReadError, ReadOutput, SkippedEntry};
pub use source::{read_source, SourceFile};
