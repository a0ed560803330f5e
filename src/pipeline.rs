//! Concurrent build and audit engine
//!
//! - **Async I/O**: directory walking and document reads go through tokio::fs
//! - **Sync CPU-bound work**: XML parsing, type resolution and extraction run directly inside tasks
//! - **Bounded concurrency**: a Semaphore caps the number of live tasks
//! - **Barrier**: reconciliation starts only after every version task has joined

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::auditor::{AuditOptions, AuditReport, FilingAuditor, ObservationTally};
use crate::concordance::{ConcordanceDocument, ConcordanceIndex};
use crate::config::{Config, ConfigManager};
use crate::coverage::{CoverageReport, CoverageValidator, RawSchemaIndex};
use crate::error::{ConcordanceError, Result};
use crate::field_extractor::{ExtractionIssue, FieldExtractor, VersionFieldCatalog};
use crate::file_discovery::FileDiscovery;
use crate::filing::{FilingFailure, FilingParser};
use crate::reconciler::{CrossVersionReconciler, ReconcileReport};
use crate::schema_loader::{LoadedSchema, SchemaLoader};
use crate::type_resolver::{FormFailure, resolve_all};
use crate::version::SchemaVersion;

/// Engine settings derived from the layered configuration
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Maximum number of concurrently running tasks
    pub max_concurrency: usize,
    /// Filings handled by one audit task
    pub batch_size: usize,
    pub wrappers: Vec<String>,
    pub version_attribute: String,
    pub audit: AuditOptions,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: num_cpus::get(),
            batch_size: 64,
            wrappers: vec!["Return".to_string(), "ReturnData".to_string()],
            version_attribute: "returnVersion".to_string(),
            audit: AuditOptions::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_concurrency: ConfigManager::get_thread_count(config),
            batch_size: config.pipeline.batch_size,
            wrappers: config.files.wrapper_elements.clone(),
            version_attribute: config.audit.version_attribute.clone(),
            audit: config.audit.audit_options(),
        }
    }
}

/// Phase of a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PipelinePhase {
    /// Walking schema or filing directories
    Discovery,
    /// Loading, resolving and extracting one version
    Resolution,
    /// Merging every version into the concordance
    Reconciliation,
    /// Comparing raw schemas against the concordance
    Coverage,
    /// Reading filings
    Audit,
    Complete,
}

/// Progress update for a pipeline run
#[derive(Debug, Clone)]
pub struct PipelineProgress {
    pub phase: PipelinePhase,
    /// Version id or filing path currently finished
    pub current: Option<String>,
    pub completed: usize,
    pub total: usize,
}

/// Progress callback type for pipeline updates
pub type ProgressCallback = Arc<dyn Fn(PipelineProgress) + Send + Sync>;

fn notify(
    progress: &Option<ProgressCallback>,
    phase: PipelinePhase,
    current: Option<String>,
    completed: usize,
    total: usize,
) {
    if let Some(callback) = progress {
        callback(PipelineProgress {
            phase,
            current,
            completed,
            total,
        });
    }
}

/// Timings of a build run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineMetrics {
    pub total_duration: Duration,
    pub discovery_duration: Duration,
    pub resolution_duration: Duration,
    pub reconciliation_duration: Duration,
    pub concurrent_tasks: usize,
    pub versions_processed: usize,
    pub fields_extracted: usize,
}

/// A schema version that could not be loaded; the other versions proceed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VersionFailure {
    pub version: String,
    pub reason: String,
}

/// Everything a build run produces
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    /// Every discovered version, including those that failed to load
    pub versions: Vec<SchemaVersion>,
    pub index: ConcordanceIndex,
    pub reconcile_report: ReconcileReport,
    pub version_failures: Vec<VersionFailure>,
    pub form_failures: Vec<FormFailure>,
    pub extraction_issues: Vec<ExtractionIssue>,
    pub loaded: Vec<Arc<LoadedSchema>>,
    pub metrics: PipelineMetrics,
}

impl BuildOutcome {
    pub fn raw_index(&self) -> RawSchemaIndex {
        RawSchemaIndex::from_loaded(&self.loaded)
    }
}

/// Loaded schemas without resolution, used when auditing a stored concordance
#[derive(Debug, Clone)]
pub struct SchemaSnapshot {
    pub versions: Vec<SchemaVersion>,
    pub loaded: Vec<Arc<LoadedSchema>>,
    pub raw: RawSchemaIndex,
    pub version_failures: Vec<VersionFailure>,
}

struct VersionBuild {
    loaded: Arc<LoadedSchema>,
    catalog: Option<VersionFieldCatalog>,
    form_failures: Vec<FormFailure>,
    issues: Vec<ExtractionIssue>,
}

type VersionResult = std::result::Result<VersionBuild, VersionFailure>;

/// Drives discovery, per-version resolution, reconciliation and audit
pub struct ConcordanceEngine {
    config: EngineConfig,
    schema_discovery: FileDiscovery,
    filing_discovery: FileDiscovery,
    loader: Arc<SchemaLoader>,
    parser: Arc<FilingParser>,
}

impl ConcordanceEngine {
    pub fn new(
        config: EngineConfig,
        schema_discovery: FileDiscovery,
        filing_discovery: FileDiscovery,
    ) -> Self {
        let loader = Arc::new(SchemaLoader::new(
            schema_discovery.clone(),
            config.wrappers.clone(),
        ));
        let parser = Arc::new(FilingParser::new(
            config.version_attribute.clone(),
            config.wrappers.clone(),
        ));

        Self {
            config,
            schema_discovery,
            filing_discovery,
            loader,
            parser,
        }
    }

    /// Build an engine from the merged application configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        let schema_discovery =
            FileDiscovery::schemas().with_extensions(config.files.schema_extensions.clone());
        let filing_discovery = FileDiscovery::new()
            .with_extensions(config.files.filing_extensions.clone())
            .with_include_patterns(config.files.include_patterns.clone())?
            .with_exclude_patterns(config.files.exclude_patterns.clone())?;

        Ok(Self::new(
            EngineConfig::from_config(config),
            schema_discovery,
            filing_discovery,
        ))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Build the concordance for every version below `schema_root`.
    ///
    /// Only a reconciliation invariant violation or an unreadable root is fatal.
    pub async fn build(
        &self,
        schema_root: &Path,
        progress: Option<ProgressCallback>,
    ) -> Result<BuildOutcome> {
        let start = Instant::now();
        let mut metrics = PipelineMetrics {
            concurrent_tasks: self.config.max_concurrency,
            ..PipelineMetrics::default()
        };

        notify(&progress, PipelinePhase::Discovery, None, 0, 0);
        let discovery_start = Instant::now();
        let versions = self.schema_discovery.discover_versions(schema_root).await?;
        metrics.discovery_duration = discovery_start.elapsed();
        info!(
            root = %schema_root.display(),
            versions = versions.len(),
            "discovered schema versions"
        );

        let resolution_start = Instant::now();
        let results = self
            .process_versions(&versions, true, progress.clone())
            .await?;

        let mut loaded = Vec::new();
        let mut catalogs = Vec::new();
        let mut version_failures = Vec::new();
        let mut form_failures = Vec::new();
        let mut extraction_issues = Vec::new();
        for result in results {
            match result {
                Ok(build) => {
                    loaded.push(build.loaded);
                    catalogs.extend(build.catalog);
                    form_failures.extend(build.form_failures);
                    extraction_issues.extend(build.issues);
                }
                Err(failure) => version_failures.push(failure),
            }
        }
        metrics.resolution_duration = resolution_start.elapsed();
        metrics.versions_processed = catalogs.len();
        metrics.fields_extracted = catalogs.iter().map(|c| c.fields.len()).sum();

        // Barrier: every version task has joined by now
        notify(
            &progress,
            PipelinePhase::Reconciliation,
            None,
            0,
            catalogs.len(),
        );
        let reconciliation_start = Instant::now();
        let reconciliation = CrossVersionReconciler::reconcile(catalogs)?;
        metrics.reconciliation_duration = reconciliation_start.elapsed();
        info!(
            versions = reconciliation.report.versions.len(),
            input_fields = reconciliation.report.input_fields,
            canonical_fields = reconciliation.index.len(),
            "reconciled concordance"
        );

        metrics.total_duration = start.elapsed();
        notify(
            &progress,
            PipelinePhase::Complete,
            None,
            versions.len(),
            versions.len(),
        );

        Ok(BuildOutcome {
            versions,
            index: reconciliation.index,
            reconcile_report: reconciliation.report,
            version_failures,
            form_failures,
            extraction_issues,
            loaded,
            metrics,
        })
    }

    /// Load every version's raw schema without resolving it
    pub async fn load_schemas(
        &self,
        schema_root: &Path,
        progress: Option<ProgressCallback>,
    ) -> Result<SchemaSnapshot> {
        notify(&progress, PipelinePhase::Discovery, None, 0, 0);
        let versions = self.schema_discovery.discover_versions(schema_root).await?;

        let mut loaded = Vec::new();
        let mut version_failures = Vec::new();
        for result in self.process_versions(&versions, false, progress).await? {
            match result {
                Ok(build) => loaded.push(build.loaded),
                Err(failure) => version_failures.push(failure),
            }
        }

        let raw = RawSchemaIndex::from_loaded(&loaded);
        Ok(SchemaSnapshot {
            versions,
            loaded,
            raw,
            version_failures,
        })
    }

    async fn process_versions(
        &self,
        versions: &[SchemaVersion],
        resolve: bool,
        progress: Option<ProgressCallback>,
    ) -> Result<Vec<VersionResult>> {
        if versions.is_empty() {
            return Ok(Vec::new());
        }

        let total = versions.len();
        let completed = Arc::new(AtomicUsize::new(0));
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));

        let tasks: Vec<_> = versions
            .iter()
            .cloned()
            .map(|version| {
                let loader = Arc::clone(&self.loader);
                let semaphore = Arc::clone(&semaphore);
                let completed = Arc::clone(&completed);
                let progress = progress.clone();

                tokio::spawn(async move {
                    let _permit =
                        semaphore
                            .acquire()
                            .await
                            .map_err(|_| ConcordanceError::Concurrency {
                                details: "Failed to acquire version semaphore".to_string(),
                            })?;

                    let result = match loader.load_version(&version).await {
                        Ok(loaded) => Ok(Self::process_loaded(loaded, resolve)),
                        Err(e) => {
                            warn!(version = %version.id, error = %e, "skipping schema version");
                            Err(VersionFailure {
                                version: version.id.clone(),
                                reason: e.to_string(),
                            })
                        }
                    };

                    let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                    notify(
                        &progress,
                        PipelinePhase::Resolution,
                        Some(version.id),
                        done,
                        total,
                    );

                    Ok::<VersionResult, ConcordanceError>(result)
                })
            })
            .collect();

        let joined = try_join_all(tasks)
            .await
            .map_err(|e| ConcordanceError::Concurrency {
                details: format!("Task join error: {}", e),
            })?;

        joined.into_iter().collect()
    }

    fn process_loaded(loaded: LoadedSchema, resolve: bool) -> VersionBuild {
        if !resolve {
            return VersionBuild {
                loaded: Arc::new(loaded),
                catalog: None,
                form_failures: Vec::new(),
                issues: Vec::new(),
            };
        }

        let resolved = resolve_all(&loaded);
        let (catalog, issues) = FieldExtractor::extract(&resolved);
        info!(
            version = %loaded.version.id,
            documents = loaded.documents.len(),
            forms = resolved.forms.len(),
            failed_forms = resolved.failures.len(),
            fields = catalog.fields.len(),
            "extracted fields"
        );

        VersionBuild {
            loaded: Arc::new(loaded),
            catalog: Some(catalog),
            form_failures: resolved.failures,
            issues,
        }
    }

    /// Coverage of every successfully loaded version of a build
    pub fn validate_coverage(outcome: &BuildOutcome) -> Vec<CoverageReport> {
        Self::coverage_for(&outcome.loaded, &outcome.index)
    }

    /// Coverage of the given raw schemas against any concordance
    pub fn coverage_for(
        loaded: &[Arc<LoadedSchema>],
        index: &ConcordanceIndex,
    ) -> Vec<CoverageReport> {
        loaded
            .iter()
            .filter(|schema| {
                let known = index.has_version(&schema.version.id);
                if !known {
                    debug!(version = %schema.version.id, "version absent from concordance, no coverage");
                }
                known
            })
            .map(|schema| {
                let report = CoverageValidator::validate(schema, index);
                info!(
                    version = %report.version,
                    coverage_pct = report.coverage_pct,
                    missing_leaves = report.missing_leaves.len(),
                    incomplete_containers = report.incomplete_containers.len(),
                    "coverage checked"
                );
                report
            })
            .collect()
    }

    /// Audit every filing below `filings` against the concordance
    pub async fn audit(
        &self,
        filings: &Path,
        index: &ConcordanceIndex,
        raw: &RawSchemaIndex,
        progress: Option<ProgressCallback>,
    ) -> Result<AuditReport> {
        let start = Instant::now();

        notify(&progress, PipelinePhase::Discovery, None, 0, 0);
        let files = self.filing_discovery.discover_files(filings).await?;
        info!(path = %filings.display(), filings = files.len(), "discovered filings");

        let tally = self.tally_filings(files, progress.clone()).await?;
        let report = FilingAuditor::audit(&tally, index, raw, &self.config.audit);

        debug!(
            duration_ms = start.elapsed().as_millis() as u64,
            "audit pipeline finished"
        );
        notify(
            &progress,
            PipelinePhase::Complete,
            None,
            report.filings_audited,
            report.filings_audited,
        );

        Ok(report)
    }

    /// Parse filings in batches and sum-merge the partial tallies
    pub async fn tally_filings(
        &self,
        files: Vec<PathBuf>,
        progress: Option<ProgressCallback>,
    ) -> Result<ObservationTally> {
        if files.is_empty() {
            return Ok(ObservationTally::new());
        }

        let total = files.len();
        let completed = Arc::new(AtomicUsize::new(0));
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));

        let tasks: Vec<_> = files
            .chunks(self.config.batch_size.max(1))
            .map(|batch| {
                let batch = batch.to_vec();
                let parser = Arc::clone(&self.parser);
                let semaphore = Arc::clone(&semaphore);
                let completed = Arc::clone(&completed);
                let progress = progress.clone();

                tokio::spawn(async move {
                    let _permit =
                        semaphore
                            .acquire()
                            .await
                            .map_err(|_| ConcordanceError::Concurrency {
                                details: "Failed to acquire audit semaphore".to_string(),
                            })?;

                    let mut tally = ObservationTally::new();
                    for path in batch {
                        match parser.parse_file(&path).await {
                            Ok(observation) => tally.record(&observation),
                            Err(e) => {
                                warn!(path = %path.display(), error = %e, "skipping filing");
                                tally.record_failure(FilingFailure::from_error(&path, &e));
                            }
                        }

                        let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                        notify(
                            &progress,
                            PipelinePhase::Audit,
                            Some(path.display().to_string()),
                            done,
                            total,
                        );
                    }

                    Ok::<ObservationTally, ConcordanceError>(tally)
                })
            })
            .collect();

        let partials = try_join_all(tasks)
            .await
            .map_err(|e| ConcordanceError::Concurrency {
                details: format!("Task join error: {}", e),
            })?;

        let mut tally = ObservationTally::new();
        for partial in partials {
            tally.merge(partial?);
        }
        Ok(tally)
    }
}

/// Read a previously written `concordance.json`
pub async fn load_concordance(path: &Path) -> Result<ConcordanceIndex> {
    let content = tokio::fs::read_to_string(path).await?;
    let document: ConcordanceDocument = serde_json::from_str(&content)?;
    Ok(ConcordanceIndex::from_document(document)?)
}

/// Contents of `coverage_report.json`
#[derive(Debug, Serialize)]
pub struct CoverageDocument<'a> {
    pub generated_at: DateTime<Utc>,
    pub total_defects: usize,
    pub versions: &'a [CoverageReport],
}

/// Results to persist after a run
#[derive(Debug, Clone, Copy)]
pub struct Artifacts<'a> {
    pub index: &'a ConcordanceIndex,
    pub coverage: Option<&'a [CoverageReport]>,
    pub audit: Option<&'a AuditReport>,
    pub min_filings_for_patch: usize,
    pub generated_at: DateTime<Utc>,
}

async fn write_json<T: Serialize>(dir: &Path, name: &str, value: &T) -> Result<PathBuf> {
    let path = dir.join(name);
    let json = serde_json::to_vec_pretty(value)?;
    tokio::fs::write(&path, json).await?;
    debug!(path = %path.display(), "wrote artifact");
    Ok(path)
}

/// Write every available artifact into `dir`, returning the written paths
pub async fn write_artifacts(dir: &Path, artifacts: &Artifacts<'_>) -> Result<Vec<PathBuf>> {
    tokio::fs::create_dir_all(dir).await?;
    let mut written = Vec::new();

    let document = artifacts.index.to_document(artifacts.generated_at);
    written.push(write_json(dir, "concordance.json", &document).await?);

    let csv_path = dir.join("concordance.csv");
    tokio::fs::write(&csv_path, artifacts.index.tabular().to_csv_bytes()?).await?;
    written.push(csv_path);

    if let Some(coverage) = artifacts.coverage {
        let document = CoverageDocument {
            generated_at: artifacts.generated_at,
            total_defects: coverage.iter().map(CoverageReport::defect_count).sum(),
            versions: coverage,
        };
        written.push(write_json(dir, "coverage_report.json", &document).await?);
    }

    if let Some(audit) = artifacts.audit {
        written.push(write_json(dir, "audit_report.json", audit).await?);
        let patch = audit.patch_document(artifacts.generated_at, artifacts.min_filings_for_patch);
        written.push(write_json(dir, "concordance_patch.json", &patch).await?);
    }

    info!(dir = %dir.display(), artifacts = written.len(), "artifacts written");
    Ok(written)
}
