//! Coverage validation.
//!
//! Re-reads every named element declaration straight from the schema text,
//! independently of the resolver, and diffs the names against the xpaths the
//! concordance holds for that version. Read-only with respect to the
//! concordance.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::concordance::ConcordanceIndex;
use crate::schema_loader::{LoadedSchema, XmlNode, parse_tree};
use crate::schema_model::{
    ElementShape, Particle, SymbolTable, XsdDocument, XsdElementNode, XsdTypeNode, local_name,
};

/// Where in the schema structure a declaration sits
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StructuralCategory {
    Direct,
    Extension,
    GroupReference,
    IncludeChain,
}

/// One `element` declaration with a `name`, as found in the raw text
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawElementOccurrence {
    pub name: String,
    pub document: PathBuf,
    pub line: usize,
    pub pattern: String,
    pub context: String,
    pub schedule: Option<String>,
    pub category: StructuralCategory,
    pub children: Vec<String>,
    pub reachable: bool,
}

/// Coverage findings for one version
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CoverageReport {
    pub version: String,
    pub total_elements: usize,
    pub covered_leaves: usize,
    pub covered_containers: usize,
    pub missing_leaves: Vec<RawElementOccurrence>,
    /// Containers whose children are all covered; not defects
    pub missing_containers: Vec<RawElementOccurrence>,
    /// Containers with at least one uncovered child
    pub incomplete_containers: Vec<RawElementOccurrence>,
    /// Declared only inside types, groups or elements no form reaches
    pub unreachable: Vec<RawElementOccurrence>,
    pub misses_by_category: BTreeMap<StructuralCategory, Vec<String>>,
    pub misses_by_pattern: BTreeMap<String, Vec<String>>,
    pub coverage_pct: f64,
}

impl CoverageReport {
    pub fn defect_count(&self) -> usize {
        self.missing_leaves.len() + self.incomplete_containers.len()
    }
}

/// Element names and parent/child edges declared per version, shared with
/// the filing auditor
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawSchemaIndex {
    names: BTreeMap<String, BTreeSet<String>>,
    children: BTreeMap<String, BTreeMap<String, BTreeSet<String>>>,
}

impl RawSchemaIndex {
    pub fn from_loaded(loaded: &[Arc<LoadedSchema>]) -> Self {
        let mut index = Self::default();
        for schema in loaded {
            index.insert_version(schema);
        }
        index
    }

    pub fn insert_version(&mut self, loaded: &LoadedSchema) {
        let mut names = BTreeSet::new();
        let mut children: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for occurrence in scan_elements(loaded) {
            // same-named declarations in different contexts union their children
            children
                .entry(occurrence.name.clone())
                .or_default()
                .extend(occurrence.children);
            names.insert(occurrence.name);
        }
        let version = loaded.version.id.clone();
        self.names.insert(version.clone(), names);
        self.children.insert(version, children);
    }

    pub fn has_version(&self, version: &str) -> bool {
        self.names.contains_key(version)
    }

    /// Is an element with this name declared anywhere in the version's schema?
    pub fn declares(&self, version: &str, element_name: &str) -> bool {
        self.names
            .get(version)
            .is_some_and(|names| names.contains(element_name))
    }

    /// Is `child` declared among the child elements of `parent`?
    pub fn declares_child(&self, version: &str, parent: &str, child: &str) -> bool {
        self.children
            .get(version)
            .and_then(|edges| edges.get(parent))
            .is_some_and(|names| names.contains(child))
    }

    /// Is the element at this xpath present in the version's schema?
    ///
    /// Each ancestor must be declared as a child of the one above it, starting
    /// from a declared root. The leaf itself only needs a declaration somewhere
    /// in the version, which keeps elements defined in types the builder never
    /// reached classified as present.
    pub fn declares_xpath(&self, version: &str, xpath: &str) -> bool {
        let segments: Vec<&str> = xpath.split('/').filter(|s| !s.is_empty()).collect();
        let Some((leaf, ancestors)) = segments.split_last() else {
            return false;
        };

        let mut parent: Option<&str> = None;
        for segment in ancestors {
            let declared = match parent {
                None => self.declares(version, segment),
                Some(parent) => self.declares_child(version, parent, segment),
            };
            if !declared {
                return false;
            }
            parent = Some(segment);
        }
        self.declares(version, leaf)
    }

    pub fn versions(&self) -> impl Iterator<Item = &str> {
        self.names.keys().map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ContextPart {
    Element(String),
    Type(String),
    Group(String),
}

impl ContextPart {
    fn label(&self) -> String {
        match self {
            ContextPart::Element(name) => name.clone(),
            ContextPart::Type(name) => format!("[type:{}]", name),
            ContextPart::Group(name) => format!("[group:{}]", name),
        }
    }
}

/// Names of every type, group and element transitively reachable from a form
#[derive(Debug, Default)]
struct Reachability {
    types: HashSet<String>,
    groups: HashSet<String>,
    elements: HashSet<String>,
}

impl Reachability {
    fn compute(loaded: &LoadedSchema) -> Self {
        let mut reach = Self::default();
        for form in &loaded.forms {
            reach.elements.insert(form.name.clone());
            reach.visit_element(form, &loaded.symbols);
        }
        reach
    }

    fn visit_element(&mut self, element: &XsdElementNode, symbols: &SymbolTable) {
        match &element.shape {
            ElementShape::TypeRef(name) => self.visit_type_name(name, symbols),
            ElementShape::ElementRef(name) => {
                if self.elements.insert(name.clone())
                    && let Some(target) = symbols.elements.get(name)
                {
                    self.visit_element(target, symbols);
                }
            }
            ElementShape::Inline(node) => self.visit_type_node(node, symbols),
            ElementShape::Simple { .. } => {}
        }
    }

    fn visit_type_name(&mut self, name: &str, symbols: &SymbolTable) {
        if self.types.insert(name.to_string())
            && let Some(node) = symbols.types.get(name)
        {
            self.visit_type_node(node, symbols);
        }
    }

    fn visit_type_node(&mut self, node: &XsdTypeNode, symbols: &SymbolTable) {
        if let Some(base) = node.derivation.base() {
            self.visit_type_name(base, symbols);
        }
        self.visit_particles(&node.particles, symbols);
    }

    fn visit_particles(&mut self, particles: &[Particle], symbols: &SymbolTable) {
        for particle in particles {
            match particle {
                Particle::Element(element) => self.visit_element(element, symbols),
                Particle::GroupRef { name, .. } => {
                    if self.groups.insert(name.clone())
                        && let Some(group) = symbols.groups.get(name)
                    {
                        self.visit_particles(&group.particles, symbols);
                    }
                }
                Particle::Compositor { particles, .. } => self.visit_particles(particles, symbols),
                Particle::Wildcard => {}
            }
        }
    }

    fn contains(&self, part: &ContextPart) -> bool {
        match part {
            ContextPart::Element(name) => self.elements.contains(name),
            ContextPart::Type(name) => self.types.contains(name),
            ContextPart::Group(name) => self.groups.contains(name),
        }
    }
}

/// Structural pattern of an element declaration
pub fn classify_pattern(node: &XmlNode) -> String {
    let has_type = node.attr("type").is_some_and(|t| !t.is_empty());
    let Some(inline) = node.child("complexType") else {
        return if has_type { "simple_typed" } else { "untyped" }.to_string();
    };

    for content in ["simpleContent", "complexContent"] {
        if let Some(wrapper) = inline.child(content) {
            for derivation in ["extension", "restriction"] {
                if let Some(d) = wrapper.child(derivation) {
                    return format!(
                        "{}/{}[base={}]",
                        content,
                        derivation,
                        d.attr("base").unwrap_or("?")
                    );
                }
            }
            return format!("{}/other", content);
        }
    }

    let children: Vec<&str> = inline.children.iter().map(|c| c.name.as_str()).collect();
    if children.is_empty() {
        "complexType[empty]".to_string()
    } else {
        format!("complexType[{}]", children.join("+"))
    }
}

fn particle_names(
    particles: &[Particle],
    symbols: &SymbolTable,
    visited: &mut HashSet<String>,
    out: &mut Vec<String>,
) {
    for particle in particles {
        match particle {
            Particle::Element(element) => out.push(element.name.clone()),
            Particle::GroupRef { name, .. } => {
                if visited.insert(format!("group:{}", name))
                    && let Some(group) = symbols.groups.get(name)
                {
                    particle_names(&group.particles, symbols, visited, out);
                }
            }
            Particle::Compositor { particles, .. } => particle_names(particles, symbols, visited, out),
            Particle::Wildcard => {}
        }
    }
}

fn type_children(
    type_name: &str,
    symbols: &SymbolTable,
    visited: &mut HashSet<String>,
    out: &mut Vec<String>,
) {
    if !visited.insert(format!("type:{}", type_name)) {
        return;
    }
    let Some(node) = symbols.types.get(type_name) else {
        return;
    };
    if node.simple_content {
        return;
    }
    if let Some(base) = node.derivation.base() {
        type_children(base, symbols, visited, out);
    }
    particle_names(&node.particles, symbols, visited, out);
}

/// Child element names declared below an inline type, not descending into nested elements
fn inline_children(
    node: &XmlNode,
    symbols: &SymbolTable,
    visited: &mut HashSet<String>,
    out: &mut Vec<String>,
) {
    for child in &node.children {
        match child.name.as_str() {
            "element" => {
                if let Some(name) = child.attr("name").or(child.attr("ref")) {
                    out.push(local_name(name).to_string());
                }
            }
            "group" => {
                if let Some(reference) = child.attr("ref") {
                    let name = local_name(reference);
                    if visited.insert(format!("group:{}", name))
                        && let Some(group) = symbols.groups.get(name)
                    {
                        particle_names(&group.particles, symbols, visited, out);
                    }
                }
            }
            "extension" => {
                if let Some(base) = child.attr("base") {
                    type_children(local_name(base), symbols, visited, out);
                }
                inline_children(child, symbols, visited, out);
            }
            "simpleContent" | "annotation" | "attribute" => {}
            _ => inline_children(child, symbols, visited, out),
        }
    }
}

fn element_children(node: &XmlNode, symbols: &SymbolTable) -> Vec<String> {
    let mut visited = HashSet::new();
    let mut out = Vec::new();
    if let Some(type_name) = node.attr("type") {
        type_children(local_name(type_name), symbols, &mut visited, &mut out);
    } else if let Some(inline) = node.child("complexType") {
        inline_children(inline, symbols, &mut visited, &mut out);
    }
    let mut seen = HashSet::new();
    out.retain(|name| seen.insert(name.clone()));
    out
}

struct Scanner<'a> {
    loaded: &'a LoadedSchema,
    reach: Reachability,
    forms: HashSet<&'a str>,
}

impl Scanner<'_> {
    fn walk(
        &self,
        node: &XmlNode,
        doc: &XsdDocument,
        context: &mut Vec<ContextPart>,
        in_extension: bool,
        out: &mut Vec<RawElementOccurrence>,
    ) {
        let name = node.attr("name");
        let part = match (node.name.as_str(), name) {
            ("element", Some(name)) => {
                out.push(self.occurrence(node, name, doc, context, in_extension));
                Some(ContextPart::Element(name.to_string()))
            }
            ("complexType", Some(name)) => Some(ContextPart::Type(name.to_string())),
            ("group", Some(name)) => Some(ContextPart::Group(name.to_string())),
            _ => None,
        };
        let in_extension = in_extension || node.name == "extension";

        let pushed = part.is_some();
        if let Some(part) = part {
            context.push(part);
        }
        for child in &node.children {
            self.walk(child, doc, context, in_extension, out);
        }
        if pushed {
            context.pop();
        }
    }

    fn occurrence(
        &self,
        node: &XmlNode,
        name: &str,
        doc: &XsdDocument,
        context: &[ContextPart],
        in_extension: bool,
    ) -> RawElementOccurrence {
        let own = ContextPart::Element(name.to_string());
        let root = context.first().unwrap_or(&own);
        let mut labels: Vec<String> = context.iter().map(ContextPart::label).collect();
        labels.push(name.to_string());

        let schedule = context
            .iter()
            .chain(std::iter::once(&own))
            .find_map(|part| match part {
                ContextPart::Element(n) if self.forms.contains(n.as_str()) => Some(n.clone()),
                _ => None,
            });

        let category = if in_extension {
            StructuralCategory::Extension
        } else if context.iter().any(|p| matches!(p, ContextPart::Group(_))) {
            StructuralCategory::GroupReference
        } else if doc.included_from.is_some() {
            StructuralCategory::IncludeChain
        } else {
            StructuralCategory::Direct
        };

        RawElementOccurrence {
            name: name.to_string(),
            document: doc.path.clone(),
            line: node.line,
            pattern: classify_pattern(node),
            context: labels.join("/"),
            schedule,
            category,
            children: element_children(node, &self.loaded.symbols),
            reachable: self.reach.contains(root),
        }
    }
}

/// Every named element declaration of a loaded version, in document order
pub fn scan_elements(loaded: &LoadedSchema) -> Vec<RawElementOccurrence> {
    let scanner = Scanner {
        loaded,
        reach: Reachability::compute(loaded),
        forms: loaded.forms.iter().map(|f| f.name.as_str()).collect(),
    };

    let mut out = Vec::new();
    for doc in &loaded.documents {
        match parse_tree(&doc.path, &doc.source) {
            Ok(root) => {
                let mut context = Vec::new();
                for child in &root.children {
                    scanner.walk(child, doc, &mut context, false, &mut out);
                }
            }
            Err(e) => warn!(document = %doc.path.display(), error = %e, "skipping unparsable document"),
        }
    }
    out
}

/// Cross-checks a concordance against the raw schema declarations
pub struct CoverageValidator;

impl CoverageValidator {
    pub fn validate(loaded: &LoadedSchema, index: &ConcordanceIndex) -> CoverageReport {
        let version = loaded.version.id.as_str();
        let mut leaf_segments: HashSet<&str> = HashSet::new();
        let mut path_segments: HashSet<&str> = HashSet::new();
        for xpath in index.xpaths_for(version) {
            let segments: Vec<&str> = xpath.trim_matches('/').split('/').collect();
            if let Some((leaf, parents)) = segments.split_last() {
                leaf_segments.insert(leaf);
                path_segments.extend(parents.iter().copied());
            }
        }

        // one decision per element name: prefer reachable, then richer context
        let mut unique: BTreeMap<String, RawElementOccurrence> = BTreeMap::new();
        for occurrence in scan_elements(loaded) {
            let replace = match unique.get(&occurrence.name) {
                None => true,
                Some(current) => {
                    (occurrence.reachable, occurrence.context.len())
                        > (current.reachable, current.context.len())
                }
            };
            if replace {
                unique.insert(occurrence.name.clone(), occurrence);
            }
        }

        let mut report = CoverageReport {
            version: version.to_string(),
            total_elements: unique.len(),
            ..CoverageReport::default()
        };
        let is_covered = |name: &str| leaf_segments.contains(name) || path_segments.contains(name);

        let mut reachable_total = 0usize;
        for (name, occurrence) in unique {
            if occurrence.reachable {
                reachable_total += 1;
            }
            if leaf_segments.contains(name.as_str()) {
                report.covered_leaves += 1;
            } else if path_segments.contains(name.as_str()) {
                report.covered_containers += 1;
            } else if !occurrence.reachable {
                report.unreachable.push(occurrence);
            } else if occurrence.children.is_empty() {
                report.record_miss(&occurrence);
                report.missing_leaves.push(occurrence);
            } else if occurrence.children.iter().all(|c| is_covered(c)) {
                report.missing_containers.push(occurrence);
            } else {
                report.record_miss(&occurrence);
                report.incomplete_containers.push(occurrence);
            }
        }

        let covered = report.covered_leaves + report.covered_containers;
        report.coverage_pct = if reachable_total > 0 {
            (covered as f64 / reachable_total as f64 * 100.0).min(100.0)
        } else {
            0.0
        };

        debug!(
            version = %report.version,
            covered,
            missing = report.defect_count(),
            unreachable = report.unreachable.len(),
            "coverage validated"
        );
        report
    }
}

impl CoverageReport {
    fn record_miss(&mut self, occurrence: &RawElementOccurrence) {
        self.misses_by_category
            .entry(occurrence.category)
            .or_default()
            .push(occurrence.name.clone());
        self.misses_by_pattern
            .entry(occurrence.pattern.clone())
            .or_default()
            .push(occurrence.name.clone());
    }
}
