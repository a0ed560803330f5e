//! Filing audit: aggregate observations from real documents, find xpaths the
//! concordance does not know, classify them and propose fixes.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, info};

use crate::concordance::ConcordanceIndex;
use crate::coverage::RawSchemaIndex;
use crate::filing::{FilingFailure, FilingObservation, guess_data_type};
use crate::fuzzy::{FuzzyCandidate, FuzzyConfig, FuzzyMatcher, MatchQuery, MatchStrategy, split_xpath};
use crate::labels::xpath_slug;
use crate::version::compare_versions;

const PROBABLE_RENAME: f64 = 0.8;
const POSSIBLE_RENAME: f64 = 0.6;
const LOW_COVERAGE_PCT: f64 = 50.0;
const LOW_COVERAGE_MIN_XPATHS: usize = 5;

/// Aggregate for one `(version, xpath)` across filings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct XpathTally {
    pub filing_count: usize,
    pub total_occurrences: usize,
    pub max_per_filing: usize,
    pub sample: Option<String>,
}

impl XpathTally {
    fn absorb(&mut self, other: &XpathTally) {
        self.filing_count += other.filing_count;
        self.total_occurrences += other.total_occurrences;
        self.max_per_filing = self.max_per_filing.max(other.max_per_filing);
        self.sample = match (self.sample.take(), other.sample.as_ref()) {
            (Some(a), Some(b)) => Some(if b < &a { b.clone() } else { a }),
            (a, b) => a.or_else(|| b.cloned()),
        };
    }
}

/// Sum-merged observations; merge order never changes the result
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObservationTally {
    entries: BTreeMap<(String, String), XpathTally>,
    filings_per_version: BTreeMap<String, usize>,
    form_types: BTreeMap<String, usize>,
    total_elements: usize,
    failures: Vec<FilingFailure>,
}

impl ObservationTally {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, observation: &FilingObservation) {
        *self
            .filings_per_version
            .entry(observation.version.clone())
            .or_default() += 1;
        for form in &observation.form_types {
            *self.form_types.entry(form.clone()).or_default() += 1;
        }
        self.total_elements += observation.total_elements;

        for (xpath, seen) in &observation.xpaths {
            let single = XpathTally {
                filing_count: 1,
                total_occurrences: seen.occurrences,
                max_per_filing: seen.occurrences,
                sample: seen.sample.clone(),
            };
            self.entries
                .entry((observation.version.clone(), xpath.clone()))
                .or_default()
                .absorb(&single);
        }
    }

    pub fn record_failure(&mut self, failure: FilingFailure) {
        self.failures.push(failure);
    }

    pub fn merge(&mut self, other: ObservationTally) {
        for (key, tally) in other.entries {
            self.entries.entry(key).or_default().absorb(&tally);
        }
        for (version, count) in other.filings_per_version {
            *self.filings_per_version.entry(version).or_default() += count;
        }
        for (form, count) in other.form_types {
            *self.form_types.entry(form).or_default() += count;
        }
        self.total_elements += other.total_elements;
        self.failures.extend(other.failures);
        self.failures
            .sort_by(|a, b| a.path.cmp(&b.path).then_with(|| a.reason.cmp(&b.reason)));
    }

    pub fn filings(&self) -> usize {
        self.filings_per_version.values().sum()
    }

    pub fn get(&self, version: &str, xpath: &str) -> Option<&XpathTally> {
        self.entries.get(&(version.to_string(), xpath.to_string()))
    }

    pub fn versions(&self) -> impl Iterator<Item = &str> {
        self.filings_per_version.keys().map(String::as_str)
    }

    pub fn failures(&self) -> &[FilingFailure] {
        &self.failures
    }

    fn xpaths_for<'t>(&'t self, version: &'t str) -> impl Iterator<Item = (&'t str, &'t XpathTally)> {
        self.entries
            .range((version.to_string(), String::new())..)
            .take_while(move |((v, _), _)| v == version)
            .map(|((_, xpath), tally)| (xpath.as_str(), tally))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GapClassification {
    /// Declared in that version's schema; the builder missed it
    VersionCovered,
    /// Not declared in that version's schema at all
    VersionMissing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PatchStatus {
    ProbableRename,
    PossibleRename,
    NeedsReview,
}

impl PatchStatus {
    pub fn from_confidence(confidence: Option<f64>) -> Self {
        match confidence {
            Some(c) if c >= PROBABLE_RENAME => PatchStatus::ProbableRename,
            Some(c) if c >= POSSIBLE_RENAME => PatchStatus::PossibleRename,
            _ => PatchStatus::NeedsReview,
        }
    }
}

/// One observed xpath the concordance does not know
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditFinding {
    pub version: String,
    pub xpath: String,
    pub schedule: String,
    pub element_name: String,
    pub parent_xpath: String,
    pub classification: GapClassification,
    pub filing_count: usize,
    pub total_occurrences: usize,
    pub is_repeating: bool,
    pub sample_value: Option<String>,
    pub data_type_guess: String,
    pub match_strategy: Option<MatchStrategy>,
    pub candidates: Vec<FuzzyCandidate>,
}

impl AuditFinding {
    pub fn best_candidate(&self) -> Option<&FuzzyCandidate> {
        self.candidates.first()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScheduleCoverage {
    pub total_xpaths: usize,
    pub matched: usize,
    pub unknown: usize,
    pub containers: usize,
    pub coverage_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VersionAudit {
    pub version: String,
    pub in_concordance: bool,
    pub filings: usize,
    pub observed_xpaths: usize,
    pub matched: usize,
    pub containers: usize,
    pub unknown: usize,
    pub coverage_pct: f64,
    pub findings: Vec<AuditFinding>,
    /// Canonical fields mapped for this version but never observed in it
    pub unused_fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PatchSuggestion {
    pub xpath: String,
    pub version: String,
    pub schedule: String,
    pub proposed_name: String,
    pub filing_count: usize,
    pub classification: GapClassification,
    pub data_type_guess: String,
    pub sample_value: Option<String>,
    pub best_candidate: Option<FuzzyCandidate>,
    pub status: PatchStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AuditReport {
    pub filings_audited: usize,
    pub filing_failures: Vec<FilingFailure>,
    pub total_elements: usize,
    pub form_types: BTreeMap<String, usize>,
    pub versions_in_concordance: Vec<String>,
    pub versions_in_filings: Vec<String>,
    pub missing_versions: Vec<String>,
    pub matched_xpaths: usize,
    pub unknown_xpaths: usize,
    pub covered_containers: usize,
    pub coverage_pct: f64,
    pub unknowns_version_covered: usize,
    pub unknowns_version_missing: usize,
    pub fuzzy_matched: usize,
    pub versions: Vec<VersionAudit>,
    pub schedule_coverage: BTreeMap<String, ScheduleCoverage>,
    /// Canonical fields never observed in any filing
    pub unused_fields: Vec<String>,
    pub warnings: Vec<String>,
    pub patches: Vec<PatchSuggestion>,
}

impl AuditReport {
    pub fn findings(&self) -> impl Iterator<Item = &AuditFinding> {
        self.versions.iter().flat_map(|v| v.findings.iter())
    }

    pub fn patch_document(&self, generated_at: DateTime<Utc>, min_filings: usize) -> PatchDocument {
        let mut by_status: BTreeMap<String, usize> = BTreeMap::new();
        for patch in &self.patches {
            let key = serde_json::to_value(patch.status)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            *by_status.entry(key).or_default() += 1;
        }
        PatchDocument {
            generated_at,
            min_filings_for_patch: min_filings,
            total: self.patches.len(),
            by_status,
            patches: self.patches.clone(),
        }
    }
}

/// Contents of `concordance_patch.json`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PatchDocument {
    pub generated_at: DateTime<Utc>,
    pub min_filings_for_patch: usize,
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
    pub patches: Vec<PatchSuggestion>,
}

/// Runtime audit settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AuditOptions {
    pub fuzzy: FuzzyConfig,
    pub min_filings_for_patch: usize,
}

impl Default for AuditOptions {
    fn default() -> Self {
        Self {
            fuzzy: FuzzyConfig::default(),
            min_filings_for_patch: 2,
        }
    }
}

fn percent(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

/// Xpaths that are unknown but carry only known or container children
fn containers(observed: &BTreeMap<&str, &XpathTally>, known: &dyn Fn(&str) -> bool) -> HashSet<String> {
    let mut children: HashMap<&str, Vec<&str>> = HashMap::new();
    for &xpath in observed.keys() {
        let (_, parent, _) = split_xpath(xpath);
        if !parent.is_empty() {
            children.entry(parent).or_default().push(xpath);
        }
    }

    let mut result: HashSet<String> = HashSet::new();
    // a child always sorts after its parent
    for &xpath in observed.keys().rev() {
        if known(xpath) {
            continue;
        }
        let single_segment = xpath.trim_matches('/').split('/').count() == 1;
        let is_container = match children.get(xpath) {
            Some(kids) => kids.iter().all(|&k| known(k) || result.contains(k)),
            None => false,
        };
        if is_container || single_segment {
            result.insert(xpath.to_string());
        }
    }
    result
}

pub struct FilingAuditor;

impl FilingAuditor {
    pub fn audit(
        tally: &ObservationTally,
        index: &ConcordanceIndex,
        raw: &RawSchemaIndex,
        options: &AuditOptions,
    ) -> AuditReport {
        let matcher = FuzzyMatcher::new(index, options.fuzzy);
        let mut report = AuditReport {
            filings_audited: tally.filings(),
            total_elements: tally.total_elements,
            form_types: tally.form_types.clone(),
            versions_in_concordance: index.versions().to_vec(),
            ..AuditReport::default()
        };
        report.filing_failures = tally.failures.clone();
        report
            .filing_failures
            .sort_by(|a, b| a.path.cmp(&b.path).then_with(|| a.reason.cmp(&b.reason)));

        let mut versions: Vec<&str> = tally.versions().collect();
        versions.sort_by(|a, b| compare_versions(a, b));
        report.versions_in_filings = versions.iter().map(|v| v.to_string()).collect();
        report.missing_versions = versions
            .iter()
            .filter(|v| !index.has_version(v))
            .map(|v| v.to_string())
            .collect();

        let mut seen_fields: HashSet<&str> = HashSet::new();
        let mut claimed: HashSet<String> = HashSet::new();

        for version in versions {
            let observed: BTreeMap<&str, &XpathTally> = tally.xpaths_for(version).collect();
            let known = |xpath: &str| index.contains(version, xpath);
            let container_set = containers(&observed, &known);

            let mut audit = VersionAudit {
                version: version.to_string(),
                in_concordance: index.has_version(version),
                filings: tally.filings_per_version.get(version).copied().unwrap_or(0),
                observed_xpaths: observed.len(),
                matched: 0,
                containers: 0,
                unknown: 0,
                coverage_pct: 0.0,
                findings: Vec::new(),
                unused_fields: Vec::new(),
            };

            let mut seen_here: HashSet<&str> = HashSet::new();
            let mut siblings: HashMap<&str, BTreeSet<String>> = HashMap::new();
            let mut unknown: Vec<(&str, &XpathTally)> = Vec::new();

            for (&xpath, &entry) in &observed {
                let (schedule, parent, leaf) = split_xpath(xpath);
                siblings.entry(parent).or_default().insert(leaf.to_string());
                let coverage = report.schedule_coverage.entry(schedule.to_string()).or_default();

                if let Some(field) = index.lookup(version, xpath) {
                    audit.matched += 1;
                    coverage.matched += 1;
                    seen_here.insert(field.canonical_name.as_str());
                } else if container_set.contains(xpath) {
                    audit.containers += 1;
                    coverage.containers += 1;
                } else {
                    audit.unknown += 1;
                    coverage.unknown += 1;
                    unknown.push((xpath, entry));
                }
            }

            audit.unused_fields = index
                .fields()
                .filter(|f| f.xpaths.contains_key(version))
                .map(|f| f.canonical_name.as_str())
                .filter(|name| !seen_here.contains(name))
                .map(str::to_string)
                .collect();
            let mut available: HashSet<String> = audit.unused_fields.iter().cloned().collect();
            seen_fields.extend(seen_here);

            for (xpath, entry) in unknown {
                let (schedule, parent, leaf) = split_xpath(xpath);
                available.retain(|name| !claimed.contains(name));
                let empty = BTreeSet::new();
                let query = MatchQuery {
                    xpath,
                    observed_siblings: siblings.get(parent).unwrap_or(&empty),
                    available: &available,
                };
                let found = matcher.find(&query);
                if let Some(best) = found.as_ref().and_then(|m| m.best()) {
                    claimed.insert(best.canonical_name.clone());
                }

                let classification = if raw.declares_xpath(version, xpath) {
                    GapClassification::VersionCovered
                } else {
                    GapClassification::VersionMissing
                };

                audit.findings.push(AuditFinding {
                    version: version.to_string(),
                    xpath: xpath.to_string(),
                    schedule: schedule.to_string(),
                    element_name: leaf.to_string(),
                    parent_xpath: parent.to_string(),
                    classification,
                    filing_count: entry.filing_count,
                    total_occurrences: entry.total_occurrences,
                    is_repeating: entry.max_per_filing > 1,
                    sample_value: entry.sample.clone(),
                    data_type_guess: guess_data_type(entry.sample.as_deref()).to_string(),
                    match_strategy: found.as_ref().map(|m| m.strategy),
                    candidates: found.map(|m| m.candidates).unwrap_or_default(),
                });
            }

            audit.coverage_pct = percent(audit.matched, audit.matched + audit.unknown);
            debug!(
                version = %audit.version,
                matched = audit.matched,
                unknown = audit.unknown,
                containers = audit.containers,
                "version audited"
            );
            report.versions.push(audit);
        }

        for audit in &report.versions {
            report.matched_xpaths += audit.matched;
            report.unknown_xpaths += audit.unknown;
            report.covered_containers += audit.containers;
        }
        report.coverage_pct = percent(
            report.matched_xpaths,
            report.matched_xpaths + report.unknown_xpaths,
        );
        for coverage in report.schedule_coverage.values_mut() {
            coverage.total_xpaths = coverage.matched + coverage.unknown;
            coverage.coverage_pct = percent(coverage.matched, coverage.total_xpaths);
        }

        let findings: Vec<&AuditFinding> = report
            .versions
            .iter()
            .flat_map(|v| v.findings.iter())
            .collect();
        report.unknowns_version_covered = findings
            .iter()
            .filter(|f| f.classification == GapClassification::VersionCovered)
            .count();
        report.unknowns_version_missing = findings.len() - report.unknowns_version_covered;
        report.fuzzy_matched = findings.iter().filter(|f| !f.candidates.is_empty()).count();

        report.unused_fields = index
            .fields()
            .map(|f| f.canonical_name.as_str())
            .filter(|name| !seen_fields.contains(name))
            .map(str::to_string)
            .collect();

        report.patches = Self::patches(&findings, options.min_filings_for_patch);
        report.warnings = Self::warnings(&report, &findings, index);

        info!(
            filings = report.filings_audited,
            failures = report.filing_failures.len(),
            matched = report.matched_xpaths,
            unknown = report.unknown_xpaths,
            patches = report.patches.len(),
            "audit complete"
        );
        report
    }

    fn patches(findings: &[&AuditFinding], min_filings: usize) -> Vec<PatchSuggestion> {
        let mut patches: Vec<PatchSuggestion> = findings
            .iter()
            .filter(|f| f.filing_count >= min_filings)
            .map(|f| {
                let best = f.best_candidate().cloned();
                PatchSuggestion {
                    xpath: f.xpath.clone(),
                    version: f.version.clone(),
                    schedule: f.schedule.clone(),
                    proposed_name: xpath_slug(&f.schedule, &f.xpath),
                    filing_count: f.filing_count,
                    classification: f.classification,
                    data_type_guess: f.data_type_guess.clone(),
                    sample_value: f.sample_value.clone(),
                    status: PatchStatus::from_confidence(best.as_ref().map(|c| c.confidence)),
                    best_candidate: best,
                }
            })
            .collect();
        patches.sort_by(|a, b| {
            b.filing_count
                .cmp(&a.filing_count)
                .then_with(|| compare_versions(&a.version, &b.version))
                .then_with(|| a.xpath.cmp(&b.xpath))
        });
        patches
    }

    fn warnings(
        report: &AuditReport,
        findings: &[&AuditFinding],
        index: &ConcordanceIndex,
    ) -> Vec<String> {
        let mut warnings = Vec::new();

        for version in &report.missing_versions {
            warnings.push(format!(
                "MISSING VERSION: filings use schema version '{}' which is not in the concordance",
                version
            ));
        }

        let threshold = (report.filings_audited as f64 * 0.1).max(2.0);
        let frequent: Vec<&&AuditFinding> = findings
            .iter()
            .filter(|f| f.filing_count as f64 >= threshold)
            .collect();
        if !frequent.is_empty() {
            let covered = frequent
                .iter()
                .filter(|f| f.classification == GapClassification::VersionCovered)
                .count();
            warnings.push(format!(
                "HIGH-FREQUENCY UNKNOWNS: {} unknown xpaths appear in 10%+ of filings \
                 ({} declared in their version's schema, {} not declared)",
                frequent.len(),
                covered,
                frequent.len() - covered
            ));
        }

        if report.fuzzy_matched > 0 {
            let confidence = |f: &&&AuditFinding| f.best_candidate().map(|c| c.confidence);
            let high = findings
                .iter()
                .filter(|f| confidence(f).is_some_and(|c| c >= PROBABLE_RENAME))
                .count();
            let medium = findings
                .iter()
                .filter(|f| confidence(f).is_some_and(|c| (POSSIBLE_RENAME..PROBABLE_RENAME).contains(&c)))
                .count();
            warnings.push(format!(
                "FUZZY MATCHES: {} unknown xpaths have probable concordance matches \
                 ({} high confidence, {} medium, {} low)",
                report.fuzzy_matched,
                high,
                medium,
                report.fuzzy_matched - high - medium
            ));
        }

        for (schedule, coverage) in &report.schedule_coverage {
            if coverage.coverage_pct >= LOW_COVERAGE_PCT
                || coverage.total_xpaths <= LOW_COVERAGE_MIN_XPATHS
            {
                continue;
            }
            let has_schedule = index.fields_in_schedule(schedule).next().is_some();
            if has_schedule && coverage.matched == 0 {
                warnings.push(format!(
                    "XPATH MISMATCH: {} has concordance entries but zero matched observed xpaths",
                    schedule
                ));
            } else if !has_schedule {
                warnings.push(format!(
                    "MISSING SCHEDULE: {} appears in filings but has no concordance entries",
                    schedule
                ));
            } else {
                warnings.push(format!(
                    "LOW COVERAGE: {} has only {:.1}% concordance coverage ({}/{} xpaths matched)",
                    schedule, coverage.coverage_pct, coverage.matched, coverage.total_xpaths
                ));
            }
        }

        warnings
    }
}
