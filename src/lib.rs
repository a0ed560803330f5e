//! # xsd-concordance
//!
//! Builds a canonical field concordance across versioned XML schema sets and
//! audits it against real documents.
//!
//! The pipeline loads each schema version (following includes), resolves type
//! extension and group references, extracts leaf fields with their xpaths,
//! reconciles field identity across versions, checks the result against a raw
//! scan of the schemas, and finally compares it with the xpaths observed in
//! real filings.

pub mod auditor;
pub mod cli;
pub mod concordance;
pub mod config;
pub mod coverage;
pub mod error;
pub mod field_extractor;
pub mod file_discovery;
pub mod filing;
pub mod fuzzy;
pub mod labels;
pub mod output;
pub mod pipeline;
pub mod reconciler;
pub mod schema_loader;
pub mod schema_model;
pub mod type_resolver;
pub mod version;

pub use auditor::{
    AuditFinding, AuditOptions, AuditReport, FilingAuditor, GapClassification, ObservationTally,
    PatchDocument, PatchStatus, PatchSuggestion,
};
pub use cli::{Cli, OutputFormat, VerbosityLevel};
pub use concordance::{CanonicalField, ConcordanceDocument, ConcordanceIndex, TabularProjection};
pub use config::{Config, ConfigError, ConfigManager};
pub use coverage::{CoverageReport, CoverageValidator, RawSchemaIndex, StructuralCategory};
pub use error::{ConcordanceError, FilingError, LoadError, ReconcileError, ResolutionError};
pub use field_extractor::{ExtractionIssue, FieldExtractor, ResolvedField, VersionFieldCatalog};
pub use file_discovery::FileDiscovery;
pub use filing::{FilingFailure, FilingObservation, FilingParser};
pub use fuzzy::{FuzzyCandidate, FuzzyConfig, FuzzyMatcher, MatchStrategy};
pub use output::{Output, RunSummary};
pub use pipeline::{
    Artifacts, BuildOutcome, ConcordanceEngine, EngineConfig, PipelineMetrics, PipelinePhase,
    PipelineProgress, ProgressCallback, SchemaSnapshot, VersionFailure, load_concordance,
    write_artifacts,
};
pub use reconciler::{CrossVersionReconciler, ReconcileReport, Reconciliation};
pub use schema_loader::{LoadedSchema, SchemaLoader};
pub use type_resolver::{ResolvedVersion, TypeGraphResolver, resolve_all};
pub use version::SchemaVersion;
