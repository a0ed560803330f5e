//! Run summaries for the terminal
//!
//! Human-readable text at three verbosity levels, a one-line summary and a
//! JSON summary for scripts.

use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::auditor::{AuditReport, GapClassification};
use crate::cli::VerbosityLevel;
use crate::coverage::CoverageReport;
use crate::field_extractor::ExtractionIssue;
use crate::pipeline::{BuildOutcome, PipelineMetrics};

/// Headline numbers of one run, printed for `--format json|summary`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub versions: Vec<String>,
    pub version_failures: usize,
    pub form_failures: usize,
    pub canonical_fields: usize,
    pub coverage_defects: usize,
    pub filings_audited: Option<usize>,
    pub filing_failures: Option<usize>,
    pub unknown_xpaths: Option<usize>,
    pub patches: Option<usize>,
    pub artifacts: Vec<PathBuf>,
    pub duration: Duration,
}

impl RunSummary {
    pub fn with_audit(mut self, report: &AuditReport) -> Self {
        self.filings_audited = Some(report.filings_audited);
        self.filing_failures = Some(report.filing_failures.len());
        self.unknown_xpaths = Some(report.unknown_xpaths);
        self.patches = Some(report.patches.len());
        self
    }
}

/// Output formatter for human-readable results
pub struct Output {
    verbosity: VerbosityLevel,
    show_colors: bool,
}

impl Output {
    pub fn new(verbosity: VerbosityLevel) -> Self {
        Self {
            verbosity,
            show_colors: atty::is(atty::Stream::Stdout),
        }
    }

    pub fn with_colors(mut self, show_colors: bool) -> Self {
        self.show_colors = show_colors;
        self
    }

    fn colorize(&self, text: &str, color: &str) -> String {
        if self.show_colors {
            format!("\x1b[{}m{}\x1b[0m", color, text)
        } else {
            text.to_string()
        }
    }

    fn pct_color(pct: f64) -> &'static str {
        if pct >= 99.0 {
            "32"
        } else if pct >= 90.0 {
            "33"
        } else {
            "31"
        }
    }

    pub fn format_build(&self, outcome: &BuildOutcome) -> String {
        let mut output = String::new();
        let failures = outcome.version_failures.len() + outcome.form_failures.len();

        if self.verbosity == VerbosityLevel::Quiet {
            if failures > 0 {
                output.push_str(&format!(
                    "Failed versions: {} Failed forms: {}\n",
                    outcome.version_failures.len(),
                    outcome.form_failures.len()
                ));
            }
            return output;
        }

        let report = &outcome.reconcile_report;
        output.push_str("Concordance Build:\n");
        output.push_str(&format!(
            "  Versions: {} ({} loaded)\n",
            outcome.versions.len(),
            outcome.loaded.len()
        ));
        output.push_str(&format!("  Leaf fields extracted: {}\n", report.input_fields));
        output.push_str(&format!(
            "  {} {}\n",
            self.colorize("Canonical fields:", "32"),
            outcome.index.len()
        ));
        output.push_str(&format!(
            "  Tracked across versions: {}\n",
            report.multi_version_clusters
        ));
        output.push_str(&format!(
            "  Merged by leaf name: {}  by description: {}\n",
            report.leaf_name_merges, report.description_merges
        ));
        if !report.ambiguous_description_groups.is_empty() {
            output.push_str(&format!(
                "  {} {}\n",
                self.colorize("Needs review:", "33"),
                report.ambiguous_description_groups.len()
            ));
        }
        if !outcome.version_failures.is_empty() {
            output.push_str(&format!(
                "  {} {}\n",
                self.colorize("Failed versions:", "31"),
                outcome.version_failures.len()
            ));
        }
        if !outcome.form_failures.is_empty() {
            output.push_str(&format!(
                "  {} {}\n",
                self.colorize("Failed forms:", "33"),
                outcome.form_failures.len()
            ));
        }
        output.push_str(&format!(
            "  Duration: {}\n",
            format_duration(outcome.metrics.total_duration)
        ));

        if self.verbosity >= VerbosityLevel::Verbose {
            for failure in &outcome.version_failures {
                output.push_str(&format!(
                    "{}  {} - {}\n",
                    self.colorize("✗ VERSION", "31"),
                    failure.version,
                    failure.reason
                ));
            }
            for failure in &outcome.form_failures {
                output.push_str(&format!(
                    "{}  {}/{} - {}\n",
                    self.colorize("⚠ FORM", "33"),
                    failure.version,
                    failure.form,
                    failure.reason
                ));
            }
            for issue in &outcome.extraction_issues {
                let ExtractionIssue::DuplicateXpath {
                    version,
                    schedule,
                    xpath,
                } = issue;
                output.push_str(&format!(
                    "{}  {} {} {}\n",
                    self.colorize("⚠ DUPLICATE", "33"),
                    version,
                    schedule,
                    xpath
                ));
            }
            for group in &report.ambiguous_description_groups {
                output.push_str(&format!(
                    "{}  {} \"{}\"\n",
                    self.colorize("? REVIEW", "36"),
                    group.schedule,
                    group.description
                ));
                for candidate in &group.candidates {
                    output.push_str(&format!("    {}\n", candidate));
                }
            }
            output.push_str(&self.format_metrics(&outcome.metrics));
        }

        output
    }

    fn format_metrics(&self, metrics: &PipelineMetrics) -> String {
        let mut output = String::new();
        output.push_str("\nPerformance Metrics:\n");
        output.push_str(&format!("  Concurrent tasks: {}\n", metrics.concurrent_tasks));
        output.push_str(&format!(
            "  Versions processed: {}\n",
            metrics.versions_processed
        ));

        if self.verbosity == VerbosityLevel::Debug {
            output.push_str(&format!(
                "  Discovery: {}\n",
                format_duration(metrics.discovery_duration)
            ));
            output.push_str(&format!(
                "  Resolution: {}\n",
                format_duration(metrics.resolution_duration)
            ));
            output.push_str(&format!(
                "  Reconciliation: {}\n",
                format_duration(metrics.reconciliation_duration)
            ));
        }
        output
    }

    pub fn format_coverage(&self, reports: &[CoverageReport]) -> String {
        let mut output = String::new();
        let defects: usize = reports.iter().map(CoverageReport::defect_count).sum();

        if self.verbosity == VerbosityLevel::Quiet {
            if defects > 0 {
                output.push_str(&format!("Coverage defects: {}\n", defects));
            }
            return output;
        }

        output.push_str("Schema Coverage:\n");
        for report in reports {
            let pct = format!("{:5.1}%", report.coverage_pct);
            output.push_str(&format!(
                "  {:<12} {}  missing leaves: {}  incomplete containers: {}  unreachable: {}\n",
                report.version,
                self.colorize(&pct, Self::pct_color(report.coverage_pct)),
                report.missing_leaves.len(),
                report.incomplete_containers.len(),
                report.unreachable.len()
            ));

            if self.verbosity >= VerbosityLevel::Verbose {
                for missing in report
                    .missing_leaves
                    .iter()
                    .chain(&report.incomplete_containers)
                {
                    output.push_str(&format!(
                        "    {} {} ({}:{}, {:?}, {})\n",
                        self.colorize("✗", "31"),
                        missing.name,
                        missing.document.display(),
                        missing.line,
                        missing.category,
                        missing.pattern
                    ));
                }
            }
        }

        output
    }

    pub fn format_audit(&self, report: &AuditReport, duration: Duration) -> String {
        let mut output = String::new();

        if self.verbosity == VerbosityLevel::Quiet {
            if !report.filing_failures.is_empty() || !report.patches.is_empty() {
                output.push_str(&format!(
                    "Failed filings: {} Patches: {}\n",
                    report.filing_failures.len(),
                    report.patches.len()
                ));
            }
            return output;
        }

        output.push_str("Filing Audit:\n");
        output.push_str(&format!("  Filings audited: {}\n", report.filings_audited));
        if !report.filing_failures.is_empty() {
            output.push_str(&format!(
                "  {} {}\n",
                self.colorize("Unreadable:", "33"),
                report.filing_failures.len()
            ));
        }
        output.push_str(&format!(
            "  {} {}\n",
            self.colorize("Matched xpaths:", "32"),
            report.matched_xpaths
        ));
        output.push_str(&format!(
            "  Containers: {}\n",
            report.covered_containers
        ));
        if report.unknown_xpaths > 0 {
            output.push_str(&format!(
                "  {} {} ({} builder gaps, {} version mismatches)\n",
                self.colorize("Unknown xpaths:", "31"),
                report.unknown_xpaths,
                report.unknowns_version_covered,
                report.unknowns_version_missing
            ));
        }
        let pct = format!("{:.1}%", report.coverage_pct);
        output.push_str(&format!(
            "  Coverage: {}\n",
            self.colorize(&pct, Self::pct_color(report.coverage_pct))
        ));
        output.push_str(&format!("  Fuzzy matched: {}\n", report.fuzzy_matched));
        output.push_str(&format!("  Patch suggestions: {}\n", report.patches.len()));
        output.push_str(&format!("  Duration: {}\n", format_duration(duration)));

        for warning in &report.warnings {
            output.push_str(&format!("{}  {}\n", self.colorize("⚠", "33"), warning));
        }

        if self.verbosity >= VerbosityLevel::Verbose {
            output.push_str("\nPer version:\n");
            for version in &report.versions {
                output.push_str(&format!(
                    "  {:<12} filings: {:<5} matched: {:<5} unknown: {:<5} coverage: {:.1}%\n",
                    version.version,
                    version.filings,
                    version.matched,
                    version.unknown,
                    version.coverage_pct
                ));
            }

            for finding in report.findings() {
                let marker = match finding.classification {
                    GapClassification::VersionCovered => self.colorize("✗ GAP", "31"),
                    GapClassification::VersionMissing => self.colorize("? MISMATCH", "36"),
                };
                output.push_str(&format!(
                    "{}  {} {} ({} filing{})\n",
                    marker,
                    finding.version,
                    finding.xpath,
                    finding.filing_count,
                    if finding.filing_count == 1 { "" } else { "s" }
                ));
                if let Some(best) = finding.best_candidate() {
                    output.push_str(&format!(
                        "    -> {} [{} {:.2}]\n",
                        best.canonical_name, best.strategy, best.confidence
                    ));
                }
            }

            for failure in &report.filing_failures {
                output.push_str(&format!(
                    "{}  {} - {}\n",
                    self.colorize("⚠ ERROR", "33"),
                    failure.path.display(),
                    failure.reason
                ));
            }
        }

        if self.verbosity == VerbosityLevel::Debug {
            output.push_str("\nForm types:\n");
            for (form, count) in &report.form_types {
                output.push_str(&format!("  {}: {}\n", form, count));
            }
        }

        output
    }

    pub fn format_artifacts(&self, paths: &[PathBuf]) -> String {
        if self.verbosity == VerbosityLevel::Quiet {
            return String::new();
        }
        let mut output = String::from("Artifacts:\n");
        for path in paths {
            output.push_str(&format!("  {}\n", path.display()));
        }
        output
    }

    /// One line per run, for `--format summary`
    pub fn format_summary_line(&self, summary: &RunSummary) -> String {
        let mut line = format!(
            "versions={} failed_versions={} failed_forms={} fields={} coverage_defects={}",
            summary.versions.len(),
            summary.version_failures,
            summary.form_failures,
            summary.canonical_fields,
            summary.coverage_defects
        );
        if let Some(filings) = summary.filings_audited {
            line.push_str(&format!(
                " filings={} failed_filings={} unknown={} patches={}",
                filings,
                summary.filing_failures.unwrap_or(0),
                summary.unknown_xpaths.unwrap_or(0),
                summary.patches.unwrap_or(0)
            ));
        }
        line.push_str(&format!(" duration={}", format_duration(summary.duration)));
        line
    }
}

pub fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs_f64();
    if total_secs < 1.0 {
        format!("{:.0}ms", duration.as_millis())
    } else if total_secs < 60.0 {
        format!("{:.2}s", total_secs)
    } else {
        let mins = (total_secs / 60.0) as u64;
        let secs = total_secs % 60.0;
        format!("{}m{:.1}s", mins, secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auditor::AuditFinding;
    use crate::auditor::VersionAudit;
    use crate::filing::FilingFailure;

    fn audit_report() -> AuditReport {
        AuditReport {
            filings_audited: 4,
            filing_failures: vec![FilingFailure {
                path: PathBuf::from("bad.xml"),
                reason: "Malformed filing bad.xml: unbalanced end tag".to_string(),
            }],
            matched_xpaths: 9,
            unknown_xpaths: 1,
            coverage_pct: 90.0,
            unknowns_version_covered: 1,
            versions: vec![VersionAudit {
                version: "2020v4.2".to_string(),
                in_concordance: true,
                filings: 4,
                observed_xpaths: 10,
                matched: 9,
                containers: 0,
                unknown: 1,
                coverage_pct: 90.0,
                findings: vec![AuditFinding {
                    version: "2020v4.2".to_string(),
                    xpath: "/IRS990/GrantsPaidAmt".to_string(),
                    schedule: "IRS990".to_string(),
                    element_name: "GrantsPaidAmt".to_string(),
                    parent_xpath: "/IRS990".to_string(),
                    classification: GapClassification::VersionCovered,
                    filing_count: 3,
                    total_occurrences: 3,
                    is_repeating: false,
                    sample_value: Some("5".to_string()),
                    data_type_guess: "integer".to_string(),
                    match_strategy: None,
                    candidates: vec![],
                }],
                unused_fields: vec![],
            }],
            warnings: vec!["LOW COVERAGE: example".to_string()],
            ..AuditReport::default()
        }
    }

    #[test]
    fn test_audit_summary() {
        let output = Output::new(VerbosityLevel::Normal).with_colors(false);
        let formatted = output.format_audit(&audit_report(), Duration::from_millis(250));

        assert!(formatted.contains("Filing Audit:"));
        assert!(formatted.contains("Filings audited: 4"));
        assert!(formatted.contains("Unknown xpaths: 1 (1 builder gaps, 0 version mismatches)"));
        assert!(formatted.contains("LOW COVERAGE"));
        assert!(formatted.contains("250ms"));
        assert!(!formatted.contains("GrantsPaidAmt"));
    }

    #[test]
    fn test_audit_verbose_lists_findings() {
        let output = Output::new(VerbosityLevel::Verbose).with_colors(false);
        let formatted = output.format_audit(&audit_report(), Duration::ZERO);

        assert!(formatted.contains("✗ GAP  2020v4.2 /IRS990/GrantsPaidAmt (3 filings)"));
        assert!(formatted.contains("bad.xml"));
    }

    #[test]
    fn test_quiet_audit_only_reports_problems() {
        let output = Output::new(VerbosityLevel::Quiet).with_colors(false);
        let formatted = output.format_audit(&audit_report(), Duration::ZERO);
        assert_eq!(formatted, "Failed filings: 1 Patches: 0\n");

        let clean = AuditReport::default();
        assert!(output.format_audit(&clean, Duration::ZERO).is_empty());
    }

    #[test]
    fn test_coverage_colors() {
        let report = CoverageReport {
            version: "2020v4.2".to_string(),
            coverage_pct: 50.0,
            ..CoverageReport::default()
        };
        let colored = Output::new(VerbosityLevel::Normal).with_colors(true);
        assert!(colored.format_coverage(&[report.clone()]).contains("\x1b[31m"));

        let plain = Output::new(VerbosityLevel::Normal).with_colors(false);
        let formatted = plain.format_coverage(&[report]);
        assert!(formatted.contains("2020v4.2"));
        assert!(formatted.contains("50.0%"));
        assert!(!formatted.contains("\x1b["));
    }

    #[test]
    fn test_summary_line() {
        let summary = RunSummary {
            versions: vec!["2019v5.0".to_string(), "2020v4.2".to_string()],
            canonical_fields: 12,
            duration: Duration::from_secs(2),
            ..RunSummary::default()
        }
        .with_audit(&audit_report());

        let line = Output::new(VerbosityLevel::Normal).format_summary_line(&summary);
        assert_eq!(
            line,
            "versions=2 failed_versions=0 failed_forms=0 fields=12 coverage_defects=0 \
             filings=4 failed_filings=1 unknown=1 patches=0 duration=2.00s"
        );
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(12)), "12ms");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.50s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m30.0s");
    }
}
