//! Collection orchestration, duplicate detection and merge, enrichment, run reports
//! and scheduling for the event catalog.

pub mod config;
pub mod cycle;
pub mod enrichment;
pub mod fingerprint;
pub mod merge;
pub mod orchestrator;
pub mod report;
pub mod schedule;
pub mod similarity;

pub use config::{
    CatalogConfig, ConfigError, HttpSettings, LocationConfig, MergeConfig, OrchestratorConfig,
    PersistenceConfig, ScheduleConfig, ScoreWeights, ScoringConfig, SourceConfig,
};
pub use cycle::{
    CollectionCycle, CollectionReport, CycleError, CycleRun, PersistenceFailure, RecordDecision,
};
pub use enrichment::{
    apply_enrichment, Enrichment, EnrichmentHook, NoopEnrichmentHook, RuleEnrichmentHook,
};
pub use fingerprint::{BucketKey, Fingerprinter};
pub use merge::{BestMatch, MergeOutcome, MergeResolver};
pub use orchestrator::{
    CollectionResult, FailureReason, Orchestrator, SourceHandle, SourceOutcome,
    SourcePartialFailure, SourceRecords, SourceStatus,
};
pub use report::{report_markdown, summary_markdown, write_run, ParquetManifest, RunArtifacts};
pub use schedule::{build_scheduler, CycleRunner};
pub use similarity::{EventView, MatchScores, SimilarityScorer};

pub const CRATE_NAME: &str = "evcat-sync";
