use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::warn;

use crate::type_resolver::{ExpandedElement, ResolvedVersion};

/// One data-bearing leaf of one schema version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedField {
    pub xpath: String,
    pub element_name: String,
    pub schedule: String,
    /// Nearest repeating ancestor, the element itself included
    pub parent_group: Option<String>,
    pub data_type: String,
    pub description: Option<String>,
    pub is_repeating: bool,
    pub min_occurs: u32,
    /// `None` when unbounded
    pub max_occurs: Option<u32>,
}

/// Leaf fields of one version in extraction order
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VersionFieldCatalog {
    pub version: String,
    pub fields: Vec<ResolvedField>,
}

impl VersionFieldCatalog {
    pub fn schedules(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.fields
            .iter()
            .map(|f| f.schedule.as_str())
            .filter(|s| seen.insert(*s))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtractionIssue {
    /// The same xpath was produced twice inside one schedule
    DuplicateXpath {
        version: String,
        schedule: String,
        xpath: String,
    },
}

/// Walks expanded forms and emits their leaves
pub struct FieldExtractor;

struct WalkContext<'a> {
    schedule: &'a str,
    parent_group: Option<&'a str>,
    repeating: bool,
}

impl FieldExtractor {
    /// Extract one catalog per version. The first occurrence of a duplicate
    /// xpath is kept; later ones are reported.
    pub fn extract(resolved: &ResolvedVersion) -> (VersionFieldCatalog, Vec<ExtractionIssue>) {
        let mut fields = Vec::new();
        let mut issues = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        for form in &resolved.forms {
            let mut emitted = Vec::new();
            let context = WalkContext {
                schedule: &form.name,
                parent_group: None,
                repeating: false,
            };
            Self::walk(form, "", &context, &mut emitted);

            for field in emitted {
                if seen.insert(field.xpath.clone()) {
                    fields.push(field);
                } else {
                    warn!(version = %resolved.version, xpath = %field.xpath, "duplicate xpath");
                    issues.push(ExtractionIssue::DuplicateXpath {
                        version: resolved.version.clone(),
                        schedule: field.schedule,
                        xpath: field.xpath,
                    });
                }
            }
        }

        (
            VersionFieldCatalog {
                version: resolved.version.clone(),
                fields,
            },
            issues,
        )
    }

    fn walk(
        element: &ExpandedElement,
        parent_xpath: &str,
        context: &WalkContext<'_>,
        out: &mut Vec<ResolvedField>,
    ) {
        let xpath = format!("{}/{}", parent_xpath, element.name);
        let repeats_here = element.occurs.is_repeating();
        let context = WalkContext {
            schedule: context.schedule,
            parent_group: if repeats_here {
                Some(element.name.as_str())
            } else {
                context.parent_group
            },
            repeating: context.repeating || repeats_here,
        };

        if element.is_leaf() {
            out.push(ResolvedField {
                element_name: element.name.clone(),
                schedule: context.schedule.to_string(),
                parent_group: context.parent_group.map(str::to_string),
                data_type: element.data_type.clone(),
                description: element.documentation.clone(),
                is_repeating: context.repeating,
                min_occurs: element.occurs.min,
                max_occurs: element.occurs.max_value(),
                xpath,
            });
            return;
        }

        for child in &element.children {
            Self::walk(child, &xpath, &context, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema_model::Occurs;

    fn leaf(name: &str) -> ExpandedElement {
        ExpandedElement {
            name: name.to_string(),
            occurs: Occurs::ONCE,
            documentation: None,
            data_type: "string".to_string(),
            children: Vec::new(),
        }
    }

    fn node(name: &str, occurs: Occurs, children: Vec<ExpandedElement>) -> ExpandedElement {
        ExpandedElement {
            name: name.to_string(),
            occurs,
            documentation: None,
            data_type: String::new(),
            children,
        }
    }

    fn repeating() -> Occurs {
        Occurs::parse(Some("0"), Some("unbounded")).unwrap()
    }

    #[test]
    fn test_leaves_only_with_full_xpaths() {
        let form = node(
            "IRS990ScheduleJ",
            Occurs::ONCE,
            vec![
                leaf("TotalAmt"),
                node("Address", Occurs::ONCE, vec![leaf("CityNm")]),
            ],
        );
        let resolved = ResolvedVersion {
            version: "2020v4.2".to_string(),
            forms: vec![form],
            failures: Vec::new(),
        };

        let (catalog, issues) = FieldExtractor::extract(&resolved);
        assert!(issues.is_empty());
        let xpaths: Vec<&str> = catalog.fields.iter().map(|f| f.xpath.as_str()).collect();
        assert_eq!(
            xpaths,
            vec![
                "/IRS990ScheduleJ/TotalAmt",
                "/IRS990ScheduleJ/Address/CityNm"
            ]
        );
        assert!(catalog.fields.iter().all(|f| f.schedule == "IRS990ScheduleJ"));
        assert_eq!(catalog.schedules(), vec!["IRS990ScheduleJ"]);
    }

    #[test]
    fn test_repeating_group_marks_descendants() {
        let form = node(
            "IRS990",
            Occurs::ONCE,
            vec![node(
                "OfficerGrp",
                repeating(),
                vec![
                    leaf("PersonNm"),
                    node("InnerGrp", repeating(), vec![leaf("RateTxt")]),
                ],
            )],
        );
        let resolved = ResolvedVersion {
            version: "2020v4.2".to_string(),
            forms: vec![form],
            failures: Vec::new(),
        };

        let (catalog, _) = FieldExtractor::extract(&resolved);
        let person = &catalog.fields[0];
        assert!(person.is_repeating);
        assert_eq!(person.parent_group.as_deref(), Some("OfficerGrp"));
        let rate = &catalog.fields[1];
        assert_eq!(rate.parent_group.as_deref(), Some("InnerGrp"));
    }

    #[test]
    fn test_repeating_leaf_is_its_own_group() {
        let mut items = leaf("ItemTxt");
        items.occurs = repeating();
        let form = node("IRS990", Occurs::ONCE, vec![items, leaf("Other")]);
        let resolved = ResolvedVersion {
            version: "v".to_string(),
            forms: vec![form],
            failures: Vec::new(),
        };

        let (catalog, _) = FieldExtractor::extract(&resolved);
        assert_eq!(catalog.fields[0].parent_group.as_deref(), Some("ItemTxt"));
        assert_eq!(catalog.fields[0].max_occurs, None);
        assert_eq!(catalog.fields[1].parent_group, None);
        assert!(!catalog.fields[1].is_repeating);
    }

    #[test]
    fn test_duplicate_xpath_reported() {
        let form = node("IRS990", Occurs::ONCE, vec![leaf("A"), leaf("A")]);
        let resolved = ResolvedVersion {
            version: "2013v3.0".to_string(),
            forms: vec![form],
            failures: Vec::new(),
        };

        let (catalog, issues) = FieldExtractor::extract(&resolved);
        assert_eq!(catalog.fields.len(), 1);
        assert_eq!(
            issues,
            vec![ExtractionIssue::DuplicateXpath {
                version: "2013v3.0".to_string(),
                schedule: "IRS990".to_string(),
                xpath: "/IRS990/A".to_string(),
            }]
        );
    }

    #[test]
    fn test_same_group_under_two_parents_gives_distinct_fields() {
        let group = || node("PersonGrp", Occurs::ONCE, vec![leaf("PersonNm")]);
        let form = node(
            "IRS990",
            Occurs::ONCE,
            vec![
                node("Preparer", repeating(), vec![group()]),
                node("Officer", repeating(), vec![group()]),
            ],
        );
        let resolved = ResolvedVersion {
            version: "v".to_string(),
            forms: vec![form],
            failures: Vec::new(),
        };

        let (catalog, issues) = FieldExtractor::extract(&resolved);
        assert!(issues.is_empty());
        assert_eq!(catalog.fields.len(), 2);
        assert_ne!(catalog.fields[0].xpath, catalog.fields[1].xpath);
        assert_eq!(catalog.fields[0].parent_group.as_deref(), Some("Preparer"));
        assert_eq!(catalog.fields[1].parent_group.as_deref(), Some("Officer"));
    }
}
