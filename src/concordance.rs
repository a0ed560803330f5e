//! The finished concordance: canonical fields plus the inverted
//! `(version, xpath) -> canonical_name` index.
//!
//! A [`ConcordanceIndex`] is immutable once built. Every constructor checks
//! that the index is injective per version.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

use crate::error::{ReconcileError, ReconcileResult};
use crate::version::{compare_versions, sort_version_ids};

/// One stable semantic data point tracked across schema versions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalField {
    pub canonical_name: String,
    pub schedule: String,
    pub element_name: String,
    pub human_label: String,
    pub data_type: String,
    pub raw_type: String,
    pub description: String,
    pub parent_group: Option<String>,
    pub is_repeating: bool,
    pub version_start: String,
    pub version_end: String,
    /// version -> xpath
    pub xpaths: BTreeMap<String, String>,
}

impl CanonicalField {
    /// Versions this field exists in, oldest first
    pub fn versions(&self) -> Vec<&str> {
        let mut versions: Vec<&str> = self.xpaths.keys().map(String::as_str).collect();
        versions.sort_by(|a, b| compare_versions(a, b));
        versions
    }

    pub fn newest_xpath(&self) -> Option<&str> {
        self.xpaths.get(&self.version_end).map(String::as_str)
    }

    /// Distinct leaf element names across all versions
    pub fn leaf_names(&self) -> BTreeSet<&str> {
        self.xpaths
            .values()
            .filter_map(|xp| xp.rsplit('/').next())
            .collect()
    }

    /// `version_start`/`version_end` must be the oldest and newest mapped versions
    fn check_range(&self) -> ReconcileResult<()> {
        let versions = self.versions();
        let first = versions.first().copied().unwrap_or_default();
        let last = versions.last().copied().unwrap_or_default();
        if versions.is_empty() || first != self.version_start || last != self.version_end {
            return Err(ReconcileError::VersionRangeMismatch {
                field: self.canonical_name.clone(),
                start: self.version_start.clone(),
                end: self.version_end.clone(),
                first: first.to_string(),
                last: last.to_string(),
            });
        }
        Ok(())
    }
}

/// Canonical fields keyed by name, with the per-version inverted index
#[derive(Debug, Clone, PartialEq)]
pub struct ConcordanceIndex {
    versions: Vec<String>,
    fields: BTreeMap<String, CanonicalField>,
    xpath_index: BTreeMap<String, BTreeMap<String, String>>,
}

impl ConcordanceIndex {
    /// Build the index, failing if any `(version, xpath)` is claimed twice or a
    /// field's version range disagrees with its xpath mapping
    pub fn new(
        mut versions: Vec<String>,
        fields: impl IntoIterator<Item = CanonicalField>,
    ) -> ReconcileResult<Self> {
        let mut by_name = BTreeMap::new();
        let mut xpath_index: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();

        for field in fields {
            for (version, xpath) in &field.xpaths {
                let slot = xpath_index.entry(version.clone()).or_default();
                if let Some(existing) = slot.get(xpath)
                    && existing != &field.canonical_name
                {
                    return Err(ReconcileError::NonInjectiveIndex {
                        version: version.clone(),
                        xpath: xpath.clone(),
                        first: existing.clone(),
                        second: field.canonical_name.clone(),
                    });
                }
                slot.insert(xpath.clone(), field.canonical_name.clone());
            }
            field.check_range()?;
            by_name.insert(field.canonical_name.clone(), field);
        }

        for version in xpath_index.keys() {
            if !versions.contains(version) {
                versions.push(version.clone());
            }
        }
        sort_version_ids(&mut versions);
        versions.dedup();

        Ok(Self {
            versions,
            fields: by_name,
            xpath_index,
        })
    }

    pub fn versions(&self) -> &[String] {
        &self.versions
    }

    pub fn has_version(&self, version: &str) -> bool {
        self.versions.iter().any(|v| v == version)
    }

    pub fn fields(&self) -> impl Iterator<Item = &CanonicalField> {
        self.fields.values()
    }

    pub fn field(&self, canonical_name: &str) -> Option<&CanonicalField> {
        self.fields.get(canonical_name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// The lookup contract: which canonical field does `(version, xpath)` denote?
    pub fn lookup(&self, version: &str, xpath: &str) -> Option<&CanonicalField> {
        self.xpath_index
            .get(version)
            .and_then(|index| index.get(xpath))
            .and_then(|name| self.fields.get(name))
    }

    pub fn contains(&self, version: &str, xpath: &str) -> bool {
        self.xpath_index
            .get(version)
            .is_some_and(|index| index.contains_key(xpath))
    }

    /// Every xpath known for a version, sorted
    pub fn xpaths_for(&self, version: &str) -> impl Iterator<Item = &str> {
        self.xpath_index
            .get(version)
            .into_iter()
            .flat_map(|index| index.keys().map(String::as_str))
    }

    pub fn xpath_index(&self) -> &BTreeMap<String, BTreeMap<String, String>> {
        &self.xpath_index
    }

    pub fn fields_in_schedule<'a>(
        &'a self,
        schedule: &'a str,
    ) -> impl Iterator<Item = &'a CanonicalField> + 'a {
        self.fields.values().filter(move |f| f.schedule == schedule)
    }

    pub fn schedules(&self) -> BTreeSet<&str> {
        self.fields.values().map(|f| f.schedule.as_str()).collect()
    }

    pub fn to_document(&self, generated_at: DateTime<Utc>) -> ConcordanceDocument {
        ConcordanceDocument {
            metadata: ConcordanceMetadata {
                versions: self.versions.clone(),
                total_fields: self.fields.len(),
                generated_by: format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
                generated_at,
            },
            fields: self.fields.clone(),
            xpath_index: self.xpath_index.clone(),
        }
    }

    /// Rebuild from a previously written document, re-checking injectivity
    pub fn from_document(document: ConcordanceDocument) -> ReconcileResult<Self> {
        let stored_index = document.xpath_index;
        let index = Self::new(document.metadata.versions, document.fields.into_values())?;
        if stored_index != index.xpath_index {
            warn!("stored xpath_index differs from field mappings; using the rebuilt index");
        }
        Ok(index)
    }

    /// One row per field, one `xpath_<version>` column per known version
    pub fn tabular(&self) -> TabularProjection {
        let mut headers: Vec<String> = [
            "canonical_name",
            "schedule",
            "human_label",
            "data_type",
            "raw_type",
            "description",
            "parent_group",
            "is_repeating",
            "version_start",
            "version_end",
        ]
        .iter()
        .map(|h| h.to_string())
        .collect();
        headers.extend(self.versions.iter().map(|v| format!("xpath_{}", v)));

        let rows = self
            .fields
            .values()
            .map(|f| {
                let mut row = vec![
                    f.canonical_name.clone(),
                    f.schedule.clone(),
                    f.human_label.clone(),
                    f.data_type.clone(),
                    f.raw_type.clone(),
                    f.description.clone(),
                    f.parent_group.clone().unwrap_or_default(),
                    f.is_repeating.to_string(),
                    f.version_start.clone(),
                    f.version_end.clone(),
                ];
                row.extend(
                    self.versions
                        .iter()
                        .map(|v| f.xpaths.get(v).cloned().unwrap_or_default()),
                );
                row
            })
            .collect();

        TabularProjection { headers, rows }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcordanceMetadata {
    pub versions: Vec<String>,
    pub total_fields: usize,
    pub generated_by: String,
    pub generated_at: DateTime<Utc>,
}

/// Serialized form written to `concordance.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcordanceDocument {
    pub metadata: ConcordanceMetadata,
    pub fields: BTreeMap<String, CanonicalField>,
    pub xpath_index: BTreeMap<String, BTreeMap<String, String>>,
}

/// Flat table view of the concordance
#[derive(Debug, Clone, PartialEq)]
pub struct TabularProjection {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl TabularProjection {
    pub fn to_csv_bytes(&self) -> Result<Vec<u8>, csv::Error> {
        let mut writer = csv::WriterBuilder::new().from_writer(Vec::new());
        writer.write_record(&self.headers)?;
        for row in &self.rows {
            writer.write_record(row)?;
        }
        writer
            .into_inner()
            .map_err(|e| csv::Error::from(e.into_error()))
    }
}
