//! Cross-version reconciliation.
//!
//! Three ordered passes merge per-version leaves into canonical fields:
//! identical xpaths, then unique leaf names within a schedule, then identical
//! documentation within a schedule and parent group. Clusters merged in the
//! leaf-name pass are no longer candidates for the description pass.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::{debug, info};

use crate::concordance::{CanonicalField, ConcordanceIndex};
use crate::error::{ReconcileError, ReconcileResult};
use crate::field_extractor::{ResolvedField, VersionFieldCatalog};
use crate::labels::{friendly_type, human_label, infer_description, normalize_description, xpath_slug};
use crate::version::compare_versions;

/// More than two unmatched fields shared one description; left for manual review
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AmbiguousDescriptionGroup {
    pub schedule: String,
    pub parent_group: Option<String>,
    pub description: String,
    /// Newest xpath of every candidate
    pub candidates: Vec<String>,
}

/// Counters and review items produced while reconciling
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    pub versions: Vec<String>,
    pub input_fields: usize,
    pub exact_clusters: usize,
    pub multi_version_clusters: usize,
    pub leaf_name_merges: usize,
    pub ambiguous_leaf_groups: usize,
    pub description_merges: usize,
    pub ambiguous_description_groups: Vec<AmbiguousDescriptionGroup>,
    pub single_version_fields: usize,
    pub canonical_fields: usize,
}

/// Output of a reconciliation run
#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub index: ConcordanceIndex,
    pub report: ReconcileReport,
}

#[derive(Debug, Clone)]
struct Cluster {
    schedule: String,
    /// (version position, field), ordered by version
    members: Vec<(usize, ResolvedField)>,
}

impl Cluster {
    fn newest(&self) -> &ResolvedField {
        // clusters are never empty
        &self.members[self.members.len() - 1].1
    }

    fn leaf_name(&self) -> &str {
        &self.newest().element_name
    }

    fn version_positions(&self) -> impl Iterator<Item = usize> + '_ {
        self.members.iter().map(|(pos, _)| *pos)
    }

    /// Newest non-empty documentation
    fn documentation(&self) -> Option<&str> {
        self.members
            .iter()
            .rev()
            .filter_map(|(_, f)| f.description.as_deref())
            .find(|d| !d.trim().is_empty())
    }

    fn absorb(&mut self, other: Cluster) {
        self.members.extend(other.members);
        self.members.sort_by_key(|(pos, _)| *pos);
    }
}

fn pairwise_disjoint<'a>(clusters: impl IntoIterator<Item = &'a Cluster>) -> bool {
    let mut seen = HashSet::new();
    clusters
        .into_iter()
        .flat_map(Cluster::version_positions)
        .all(|pos| seen.insert(pos))
}

/// Merge a set of live clusters into the first one, returning how many were absorbed
fn merge_into_first(slots: &mut [Option<Cluster>], members: &[usize]) -> usize {
    let Some((&target, rest)) = members.split_first() else {
        return 0;
    };
    let mut absorbed = 0;
    for &idx in rest {
        if let Some(other) = slots[idx].take()
            && let Some(cluster) = slots[target].as_mut()
        {
            cluster.absorb(other);
            absorbed += 1;
        }
    }
    absorbed
}

/// Merges every version's leaf catalog into one concordance
pub struct CrossVersionReconciler;

impl CrossVersionReconciler {
    /// Reconcile all catalogs. Needs every version up front.
    pub fn reconcile(mut catalogs: Vec<VersionFieldCatalog>) -> ReconcileResult<Reconciliation> {
        if catalogs.is_empty() {
            return Err(ReconcileError::NoCatalogs);
        }
        catalogs.sort_by(|a, b| compare_versions(&a.version, &b.version));

        let versions: Vec<String> = catalogs.iter().map(|c| c.version.clone()).collect();
        let mut report = ReconcileReport {
            versions: versions.clone(),
            input_fields: catalogs.iter().map(|c| c.fields.len()).sum(),
            ..ReconcileReport::default()
        };

        // Pass 1: identical xpath within a schedule
        let mut by_xpath: BTreeMap<(String, String), Cluster> = BTreeMap::new();
        for (pos, catalog) in catalogs.into_iter().enumerate() {
            for field in catalog.fields {
                let key = (field.schedule.clone(), field.xpath.clone());
                let cluster = by_xpath.entry(key).or_insert_with(|| Cluster {
                    schedule: field.schedule.clone(),
                    members: Vec::new(),
                });
                if cluster.members.last().is_some_and(|(p, _)| *p == pos) {
                    debug!(xpath = %field.xpath, "ignoring repeated xpath within one version");
                    continue;
                }
                cluster.members.push((pos, field));
            }
        }
        let mut slots: Vec<Option<Cluster>> = by_xpath.into_values().map(Some).collect();
        report.exact_clusters = slots.len();
        report.multi_version_clusters = slots
            .iter()
            .flatten()
            .filter(|c| c.members.len() > 1)
            .count();

        // Pass 2: unique leaf name within a schedule
        let mut by_leaf: BTreeMap<(String, String), Vec<usize>> = BTreeMap::new();
        for (idx, cluster) in slots.iter().enumerate() {
            if let Some(cluster) = cluster {
                by_leaf
                    .entry((cluster.schedule.clone(), cluster.leaf_name().to_string()))
                    .or_default()
                    .push(idx);
            }
        }
        let mut touched: HashSet<usize> = HashSet::new();
        // Chain merge: every cluster sharing the leaf name joins, including
        // multi-version clusters from pass 1, as long as no version holds two
        // of them. A single overlapping version leaves the whole group alone.
        for members in by_leaf.values().filter(|m| m.len() > 1) {
            if pairwise_disjoint(members.iter().filter_map(|&i| slots[i].as_ref())) {
                report.leaf_name_merges += merge_into_first(&mut slots, members);
                touched.extend(members.iter().copied());
            } else {
                report.ambiguous_leaf_groups += 1;
            }
        }

        // Pass 3: identical documentation within schedule and parent group
        let mut by_description: BTreeMap<(String, Option<String>, String), Vec<usize>> =
            BTreeMap::new();
        for (idx, cluster) in slots.iter().enumerate() {
            let Some(cluster) = cluster else { continue };
            if touched.contains(&idx) {
                continue;
            }
            let Some(doc) = cluster.documentation() else {
                continue;
            };
            let key = (
                cluster.schedule.clone(),
                cluster.newest().parent_group.clone(),
                normalize_description(doc),
            );
            by_description.entry(key).or_default().push(idx);
        }
        for ((schedule, parent_group, description), members) in &by_description {
            match members.len() {
                0 | 1 => {}
                2 => {
                    if pairwise_disjoint(members.iter().filter_map(|&i| slots[i].as_ref())) {
                        report.description_merges += merge_into_first(&mut slots, members);
                    }
                }
                _ => report
                    .ambiguous_description_groups
                    .push(AmbiguousDescriptionGroup {
                        schedule: schedule.clone(),
                        parent_group: parent_group.clone(),
                        description: description.clone(),
                        candidates: members
                            .iter()
                            .filter_map(|&i| slots[i].as_ref())
                            .map(|c| c.newest().xpath.clone())
                            .collect(),
                    }),
            }
        }

        let mut clusters: Vec<Cluster> = slots.into_iter().flatten().collect();
        clusters.sort_by(|a, b| {
            (a.schedule.as_str(), a.newest().xpath.as_str())
                .cmp(&(b.schedule.as_str(), b.newest().xpath.as_str()))
        });

        let mut used_names: HashSet<String> = HashSet::new();
        let mut fields = Vec::with_capacity(clusters.len());
        for cluster in clusters {
            let base = xpath_slug(&cluster.schedule, &cluster.newest().xpath);
            let mut name = base.clone();
            let mut suffix = 2;
            while used_names.contains(&name) {
                name = format!("{}__{}", base, suffix);
                suffix += 1;
            }
            used_names.insert(name.clone());
            fields.push(canonical_field(name, &cluster, &versions));
        }

        report.single_version_fields = fields.iter().filter(|f| f.xpaths.len() == 1).count();
        report.canonical_fields = fields.len();

        info!(
            versions = report.versions.len(),
            input_fields = report.input_fields,
            exact_clusters = report.exact_clusters,
            leaf_name_merges = report.leaf_name_merges,
            description_merges = report.description_merges,
            ambiguous = report.ambiguous_description_groups.len(),
            canonical_fields = report.canonical_fields,
            "reconciled concordance"
        );

        let index = ConcordanceIndex::new(versions, fields)?;
        Ok(Reconciliation { index, report })
    }
}

fn canonical_field(name: String, cluster: &Cluster, versions: &[String]) -> CanonicalField {
    let newest = cluster.newest();
    let xpaths: BTreeMap<String, String> = cluster
        .members
        .iter()
        .map(|(pos, f)| (versions[*pos].clone(), f.xpath.clone()))
        .collect();
    let version_start = versions[cluster.members[0].0].clone();
    let version_end = versions[cluster.members[cluster.members.len() - 1].0].clone();

    CanonicalField {
        canonical_name: name,
        schedule: cluster.schedule.clone(),
        element_name: newest.element_name.clone(),
        human_label: human_label(&newest.element_name),
        data_type: friendly_type(&newest.data_type),
        raw_type: newest.data_type.clone(),
        description: cluster
            .documentation()
            .map(str::to_string)
            .unwrap_or_else(|| infer_description(&newest.xpath)),
        parent_group: newest.parent_group.clone(),
        is_repeating: newest.is_repeating,
        version_start,
        version_end,
        xpaths,
    }
}

/// Schedules present per version
pub fn schedules_by_version(index: &ConcordanceIndex) -> BTreeMap<String, BTreeSet<String>> {
    let mut out: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for field in index.fields() {
        for version in field.xpaths.keys() {
            out.entry(version.clone())
                .or_default()
                .insert(field.schedule.clone());
        }
    }
    out
}
