//! Fuzzy matching of unknown xpaths against canonical fields.
//!
//! Strategies run in a fixed order and the first one that yields any
//! candidate at or above the minimum confidence decides the match.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

use crate::concordance::ConcordanceIndex;
use crate::labels::normalize_name;

const MAX_CANDIDATES: usize = 5;
const SUBSTRING_MIN_LEN: usize = 5;
const AFFIX_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    ExactLeaf,
    Abbreviation,
    Substring,
    BigramSimilarity,
    SiblingStructure,
}

impl MatchStrategy {
    pub const ALL: [MatchStrategy; 5] = [
        MatchStrategy::ExactLeaf,
        MatchStrategy::Abbreviation,
        MatchStrategy::Substring,
        MatchStrategy::BigramSimilarity,
        MatchStrategy::SiblingStructure,
    ];
}

impl fmt::Display for MatchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MatchStrategy::ExactLeaf => "exact leaf",
            MatchStrategy::Abbreviation => "abbreviation",
            MatchStrategy::Substring => "substring",
            MatchStrategy::BigramSimilarity => "bigram similarity",
            MatchStrategy::SiblingStructure => "sibling structure",
        };
        write!(f, "{}", name)
    }
}

/// Tunables for the matcher
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FuzzyConfig {
    pub bigram_threshold: f64,
    pub min_confidence: f64,
    pub max_candidates: usize,
}

impl Default for FuzzyConfig {
    fn default() -> Self {
        Self {
            bigram_threshold: 0.6,
            min_confidence: 0.45,
            max_candidates: MAX_CANDIDATES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FuzzyCandidate {
    pub canonical_name: String,
    pub xpath: String,
    pub strategy: MatchStrategy,
    pub confidence: f64,
    pub edit_distance: usize,
    pub reason: String,
}

impl FuzzyCandidate {
    fn rank(&self, other: &Self) -> Ordering {
        other
            .confidence
            .total_cmp(&self.confidence)
            .then(self.edit_distance.cmp(&other.edit_distance))
            .then_with(|| self.canonical_name.cmp(&other.canonical_name))
    }
}

/// Ranked candidates produced by the winning strategy
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FuzzyMatch {
    pub strategy: MatchStrategy,
    pub candidates: Vec<FuzzyCandidate>,
}

impl FuzzyMatch {
    pub fn best(&self) -> Option<&FuzzyCandidate> {
        self.candidates.first()
    }
}

/// One unknown xpath to match
#[derive(Debug, Clone, Copy)]
pub struct MatchQuery<'q> {
    pub xpath: &'q str,
    /// Leaf names observed next to the unknown under the same parent
    pub observed_siblings: &'q BTreeSet<String>,
    /// Canonical fields still eligible for structural matching
    pub available: &'q HashSet<String>,
}

/// `/Sched/A/B` -> (`Sched`, `/Sched/A`, `B`)
pub fn split_xpath(xpath: &str) -> (&str, &str, &str) {
    let trimmed = xpath.trim_end_matches('/');
    let (parent, leaf) = trimmed.rsplit_once('/').unwrap_or(("", trimmed));
    let schedule = trimmed
        .trim_start_matches('/')
        .split('/')
        .next()
        .unwrap_or_default();
    (schedule, parent, leaf)
}

struct PoolEntry<'a> {
    canonical_name: &'a str,
    schedule: &'a str,
    xpath: &'a str,
    parent: &'a str,
    leaf: &'a str,
    lower: String,
    normalized: String,
}

struct Target<'q> {
    schedule: &'q str,
    parent: &'q str,
    leaf: &'q str,
    lower: String,
    normalized: String,
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

fn shares_affix(a: &str, b: &str, len: usize) -> bool {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.len() <= len || b.len() <= len {
        return false;
    }
    a[a.len() - len..] == b[b.len() - len..] || a[..len] == b[..len]
}

/// Dice coefficient over the sets of character bigrams.
///
/// Repeated bigrams count once, unlike `strsim::sorensen_dice`.
fn bigram_dice(a: &str, b: &str) -> f64 {
    fn bigrams(s: &str) -> HashSet<(char, char)> {
        let chars: Vec<char> = s.chars().collect();
        chars.windows(2).map(|w| (w[0], w[1])).collect()
    }

    let left = bigrams(a);
    let right = bigrams(b);
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }
    let overlap = left.intersection(&right).count();
    2.0 * overlap as f64 / (left.len() + right.len()) as f64
}

/// Candidate pool over every `(canonical field, xpath)` pair of a concordance
pub struct FuzzyMatcher<'a> {
    config: FuzzyConfig,
    entries: Vec<PoolEntry<'a>>,
    children: HashMap<&'a str, BTreeSet<&'a str>>,
}

impl<'a> FuzzyMatcher<'a> {
    pub fn new(index: &'a ConcordanceIndex, config: FuzzyConfig) -> Self {
        let mut entries = Vec::new();
        let mut children: HashMap<&str, BTreeSet<&str>> = HashMap::new();
        let mut seen = HashSet::new();

        for field in index.fields() {
            for xpath in field.xpaths.values() {
                if !seen.insert((field.canonical_name.as_str(), xpath.as_str())) {
                    continue;
                }
                let (schedule, parent, leaf) = split_xpath(xpath);
                children.entry(parent).or_default().insert(leaf);
                entries.push(PoolEntry {
                    canonical_name: &field.canonical_name,
                    schedule,
                    xpath,
                    parent,
                    leaf,
                    lower: leaf.to_lowercase(),
                    normalized: normalize_name(leaf),
                });
            }
        }

        Self {
            config,
            entries,
            children,
        }
    }

    pub fn config(&self) -> &FuzzyConfig {
        &self.config
    }

    /// Run the strategies in order; `None` when nothing clears the minimum confidence
    pub fn find(&self, query: &MatchQuery<'_>) -> Option<FuzzyMatch> {
        let (schedule, parent, leaf) = split_xpath(query.xpath);
        let target = Target {
            schedule,
            parent,
            leaf,
            lower: leaf.to_lowercase(),
            normalized: normalize_name(leaf),
        };

        for strategy in MatchStrategy::ALL {
            let mut best: HashMap<&str, FuzzyCandidate> = HashMap::new();
            for entry in &self.entries {
                let Some((confidence, reason)) = self.score(strategy, &target, entry, query) else {
                    continue;
                };
                let confidence = round3(confidence);
                if confidence < self.config.min_confidence {
                    continue;
                }
                let candidate = FuzzyCandidate {
                    canonical_name: entry.canonical_name.to_string(),
                    xpath: entry.xpath.to_string(),
                    strategy,
                    confidence,
                    edit_distance: strsim::levenshtein(leaf, entry.leaf),
                    reason,
                };
                match best.get(entry.canonical_name) {
                    Some(current) if candidate.rank(current) != Ordering::Less => {}
                    _ => {
                        best.insert(entry.canonical_name, candidate);
                    }
                }
            }

            if !best.is_empty() {
                let mut candidates: Vec<FuzzyCandidate> = best.into_values().collect();
                candidates.sort_by(|a, b| a.rank(b).then_with(|| a.xpath.cmp(&b.xpath)));
                candidates.truncate(self.config.max_candidates);
                return Some(FuzzyMatch {
                    strategy,
                    candidates,
                });
            }
        }
        None
    }

    fn score(
        &self,
        strategy: MatchStrategy,
        target: &Target<'_>,
        entry: &PoolEntry<'_>,
        query: &MatchQuery<'_>,
    ) -> Option<(f64, String)> {
        let same_schedule = entry.schedule == target.schedule;
        let pick = |same: f64, other: f64| if same_schedule { same } else { other };

        match strategy {
            MatchStrategy::ExactLeaf => (entry.leaf == target.leaf).then(|| {
                let reason = if same_schedule {
                    "exact leaf name, same schedule".to_string()
                } else {
                    format!("exact leaf name in {}", entry.schedule)
                };
                (pick(0.9, 0.7), reason)
            }),
            MatchStrategy::Abbreviation => (entry.leaf != target.leaf
                && !target.normalized.is_empty()
                && entry.normalized == target.normalized)
                .then(|| {
                    (
                        pick(0.85, 0.65),
                        format!("abbreviation match '{}'", target.normalized),
                    )
                }),
            MatchStrategy::Substring => {
                let (un, cn) = (&target.lower, &entry.lower);
                if un.chars().count() > SUBSTRING_MIN_LEN && cn.chars().count() > SUBSTRING_MIN_LEN
                {
                    if cn.contains(un.as_str()) {
                        return Some((
                            pick(0.75, 0.55),
                            format!("'{}' is substring of '{}'", target.leaf, entry.leaf),
                        ));
                    }
                    if un.contains(cn.as_str()) {
                        return Some((
                            pick(0.75, 0.55),
                            format!("'{}' is substring of '{}'", entry.leaf, target.leaf),
                        ));
                    }
                }
                shares_affix(un, cn, AFFIX_LEN)
                    .then(|| (pick(0.6, 0.45), "shared prefix or suffix".to_string()))
            }
            MatchStrategy::BigramSimilarity => {
                if !same_schedule {
                    return None;
                }
                let similarity = bigram_dice(&target.lower, &entry.lower);
                (similarity >= self.config.bigram_threshold).then(|| {
                    (
                        similarity,
                        format!("name similarity ({:.0}%)", similarity * 100.0),
                    )
                })
            }
            MatchStrategy::SiblingStructure => {
                if !same_schedule || !query.available.contains(entry.canonical_name) {
                    return None;
                }
                let observed: BTreeSet<&str> = query
                    .observed_siblings
                    .iter()
                    .map(String::as_str)
                    .filter(|s| *s != target.leaf)
                    .collect();
                let known: BTreeSet<&str> = self
                    .children
                    .get(entry.parent)
                    .map(|c| c.iter().copied().filter(|s| *s != entry.leaf).collect())
                    .unwrap_or_default();
                let union = observed.union(&known).count();
                let jaccard = if union == 0 {
                    0.0
                } else {
                    observed.intersection(&known).count() as f64 / union as f64
                };

                let same_parent = entry.parent == target.parent;
                if !same_parent && jaccard == 0.0 {
                    return None;
                }
                let mut score = 0.45 + 0.35 * jaccard;
                if same_parent {
                    score = score.max(0.5);
                }
                Some((
                    score,
                    format!("unused field with similar siblings ({:.0}% overlap)", jaccard * 100.0),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concordance::CanonicalField;

    fn field(name: &str, xpaths: &[(&str, &str)]) -> CanonicalField {
        let first = xpaths.first().unwrap();
        let last = xpaths.last().unwrap();
        let (schedule, _, leaf) = split_xpath(last.1);
        CanonicalField {
            canonical_name: name.to_string(),
            schedule: schedule.to_string(),
            element_name: leaf.to_string(),
            human_label: String::new(),
            data_type: String::new(),
            raw_type: String::new(),
            description: String::new(),
            parent_group: None,
            is_repeating: false,
            version_start: first.0.to_string(),
            version_end: last.0.to_string(),
            xpaths: xpaths
                .iter()
                .map(|(v, x)| (v.to_string(), x.to_string()))
                .collect(),
        }
    }

    fn index(fields: Vec<CanonicalField>) -> ConcordanceIndex {
        ConcordanceIndex::new(vec!["2019v5.1".to_string()], fields).unwrap()
    }

    fn find(index: &ConcordanceIndex, xpath: &str) -> Option<FuzzyMatch> {
        let siblings = BTreeSet::new();
        let available = HashSet::new();
        FuzzyMatcher::new(index, FuzzyConfig::default()).find(&MatchQuery {
            xpath,
            observed_siblings: &siblings,
            available: &available,
        })
    }

    #[test]
    fn test_split_xpath() {
        assert_eq!(split_xpath("/IRS990/Grp/Amt"), ("IRS990", "/IRS990/Grp", "Amt"));
        assert_eq!(split_xpath("/IRS990"), ("IRS990", "", "IRS990"));
    }

    #[test]
    fn test_exact_leaf_prefers_same_schedule() {
        let index = index(vec![
            field("IRS990_Old_TotalAmt", &[("2019v5.1", "/IRS990/Old/TotalAmt")]),
            field("IRS990EZ_TotalAmt", &[("2019v5.1", "/IRS990EZ/TotalAmt")]),
        ]);

        let found = find(&index, "/IRS990/New/TotalAmt").unwrap();
        assert_eq!(found.strategy, MatchStrategy::ExactLeaf);
        assert_eq!(found.candidates.len(), 2);
        assert_eq!(found.candidates[0].canonical_name, "IRS990_Old_TotalAmt");
        assert_eq!(found.candidates[0].confidence, 0.9);
        assert_eq!(found.candidates[1].confidence, 0.7);
    }

    #[test]
    fn test_abbreviation_match() {
        let index = index(vec![field(
            "IRS990ScheduleJ_BaseCompensationFilingOrganizationAmount",
            &[("2019v5.1", "/IRS990ScheduleJ/BaseCompensationFilingOrganizationAmount")],
        )]);

        let found = find(&index, "/IRS990ScheduleJ/BsCmpnstnFlngOrgAmt").unwrap();
        assert_eq!(found.strategy, MatchStrategy::Abbreviation);
        assert_eq!(found.candidates[0].confidence, 0.85);
    }

    #[test]
    fn test_substring_match() {
        let index = index(vec![field(
            "IRS990_CYTotalRevenueAmt",
            &[("2019v5.1", "/IRS990/CYTotalRevenueAmt")],
        )]);

        let found = find(&index, "/IRS990/TotalRevenueAmt").unwrap();
        assert_eq!(found.strategy, MatchStrategy::Substring);
        assert_eq!(found.candidates[0].confidence, 0.75);
    }

    #[test]
    fn test_bigram_dice_counts_distinct_bigrams() {
        assert_eq!(bigram_dice("aaaa", "aa"), 1.0);
        assert_eq!(bigram_dice("night", "nacht"), 0.25);
        assert_eq!(bigram_dice("totalamt", "totalamt"), 1.0);
        assert_eq!(bigram_dice("a", "ab"), 0.0);
        assert_eq!(bigram_dice("", "amt"), 0.0);
    }

    #[test]
    fn test_bigram_only_within_schedule() {
        let index = index(vec![field(
            "IRS990_PolicyDescTxt",
            &[("2019v5.1", "/IRS990/PolicyDescTxt")],
        )]);

        let found = find(&index, "/IRS990/PolicyDscrptnTxt").unwrap();
        assert_eq!(found.strategy, MatchStrategy::BigramSimilarity);
        assert!(found.candidates[0].confidence >= 0.6);

        assert!(find(&index, "/IRS990EZ/PolicyDscrptnTxt").is_none());
    }

    #[test]
    fn test_sibling_structure_uses_only_available_fields() {
        let index = index(vec![
            field("IRS990_Grp_AlphaQ", &[("2019v5.1", "/IRS990/Grp/AlphaQ")]),
            field("IRS990_Grp_KeptInd", &[("2019v5.1", "/IRS990/Grp/KeptInd")]),
        ]);
        let matcher = FuzzyMatcher::new(&index, FuzzyConfig::default());
        let siblings: BTreeSet<String> = ["KeptInd", "ZuluW"].iter().map(|s| s.to_string()).collect();

        let none_available = HashSet::new();
        let query = MatchQuery {
            xpath: "/IRS990/Grp/ZuluW",
            observed_siblings: &siblings,
            available: &none_available,
        };
        assert!(matcher.find(&query).is_none());

        let available: HashSet<String> = ["IRS990_Grp_AlphaQ".to_string()].into_iter().collect();
        let query = MatchQuery {
            available: &available,
            ..query
        };
        let found = matcher.find(&query).unwrap();
        assert_eq!(found.strategy, MatchStrategy::SiblingStructure);
        assert_eq!(found.candidates.len(), 1);
        // siblings {KeptInd} vs {KeptInd}: full overlap
        assert_eq!(found.candidates[0].confidence, 0.8);
    }

    #[test]
    fn test_candidates_ranked_and_capped() {
        let fields = (0..7)
            .map(|i| {
                let xpath = format!("/IRS990/Grp{}/TotalAmt", i);
                field(&format!("IRS990_Grp{}_TotalAmt", i), &[("2019v5.1", xpath.as_str())])
            })
            .collect();
        let index = index(fields);

        let found = find(&index, "/IRS990/Other/TotalAmt").unwrap();
        assert_eq!(found.candidates.len(), 5);
        let names: Vec<&str> = found.candidates.iter().map(|c| c.canonical_name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "IRS990_Grp0_TotalAmt",
                "IRS990_Grp1_TotalAmt",
                "IRS990_Grp2_TotalAmt",
                "IRS990_Grp3_TotalAmt",
                "IRS990_Grp4_TotalAmt"
            ]
        );
    }

    #[test]
    fn test_no_candidate() {
        let index = index(vec![field("IRS990_Amt", &[("2019v5.1", "/IRS990/Amt")])]);
        assert!(find(&index, "/IRS990ScheduleA/Zq").is_none());
    }
}
