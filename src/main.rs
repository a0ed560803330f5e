use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;
use tracing_subscriber::EnvFilter;

use xsd_concordance::{
    Artifacts, Cli, ConcordanceEngine, Config, ConfigManager, Output, OutputFormat,
    PipelineProgress, ProgressCallback, RawSchemaIndex, RunSummary, VerbosityLevel, load_concordance,
    write_artifacts,
};

fn verbosity(config: &Config) -> VerbosityLevel {
    if config.output.quiet {
        VerbosityLevel::Quiet
    } else if config.output.verbose {
        VerbosityLevel::Verbose
    } else {
        VerbosityLevel::Normal
    }
}

fn init_tracing(verbosity: VerbosityLevel) {
    let level = match verbosity {
        VerbosityLevel::Quiet => "error",
        VerbosityLevel::Normal => "warn",
        VerbosityLevel::Verbose => "info",
        VerbosityLevel::Debug => "debug",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("xsd_concordance={}", level)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn progress_printer() -> ProgressCallback {
    Arc::new(|progress: PipelineProgress| {
        let current = progress.current.unwrap_or_default();
        eprintln!(
            "[{:?}] {}/{} {}",
            progress.phase, progress.completed, progress.total, current
        );
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();
    if let Err(message) = cli.validate() {
        anyhow::bail!(message);
    }

    let config = ConfigManager::load_config(&cli)
        .await
        .context("Failed to load configuration")?;
    let verbosity = verbosity(&config);
    init_tracing(verbosity);

    let start = Instant::now();
    let engine = ConcordanceEngine::from_config(&config)?;
    let progress = config.pipeline.show_progress.then(progress_printer);
    let output = Output::new(verbosity);
    let mut report = String::new();
    let mut summary = RunSummary::default();

    let (index, loaded) = match &cli.concordance {
        Some(path) => {
            let index = load_concordance(path)
                .await
                .with_context(|| format!("Failed to read concordance {}", path.display()))?;
            let snapshot = engine
                .load_schemas(&cli.schema_dir, progress.clone())
                .await
                .context("Failed to load schemas")?;
            info!(
                fields = index.len(),
                versions = index.versions().len(),
                "loaded stored concordance"
            );
            summary.versions = snapshot.versions.iter().map(|v| v.id.clone()).collect();
            summary.version_failures = snapshot.version_failures.len();
            (index, snapshot.loaded)
        }
        None => {
            let outcome = engine
                .build(&cli.schema_dir, progress.clone())
                .await
                .context("Concordance build failed")?;
            report.push_str(&output.format_build(&outcome));
            summary.versions = outcome.versions.iter().map(|v| v.id.clone()).collect();
            summary.version_failures = outcome.version_failures.len();
            summary.form_failures = outcome.form_failures.len();
            (outcome.index, outcome.loaded)
        }
    };
    summary.canonical_fields = index.len();

    let coverage = ConcordanceEngine::coverage_for(&loaded, &index);
    report.push_str(&output.format_coverage(&coverage));
    summary.coverage_defects = coverage.iter().map(|c| c.defect_count()).sum();

    let audit = match &cli.filings {
        Some(filings) => {
            let audit_start = Instant::now();
            let raw = RawSchemaIndex::from_loaded(&loaded);
            let audit = engine
                .audit(filings, &index, &raw, progress.clone())
                .await
                .context("Filing audit failed")?;
            report.push_str(&output.format_audit(&audit, audit_start.elapsed()));
            summary = summary.with_audit(&audit);
            Some(audit)
        }
        None => None,
    };

    let written = write_artifacts(
        &config.pipeline.output_dir,
        &Artifacts {
            index: &index,
            coverage: Some(coverage.as_slice()),
            audit: audit.as_ref(),
            min_filings_for_patch: config.audit.min_filings_for_patch,
            generated_at: Utc::now(),
        },
    )
    .await
    .context("Failed to write artifacts")?;
    report.push_str(&output.format_artifacts(&written));
    summary.artifacts = written;
    summary.duration = start.elapsed();

    match OutputFormat::from(config.output.format) {
        OutputFormat::Human => print!("{}", report),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
        OutputFormat::Summary => println!("{}", output.format_summary_line(&summary)),
    }

    Ok(())
}
