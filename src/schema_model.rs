//! In-memory model of parsed XSD documents.
//!
//! Every node shape the resolver has to handle is a closed enum, so a new
//! construct shows up as a compile error in the traversal instead of being
//! skipped silently.

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

/// Strip a namespace prefix from a QName reference (`xs:string` -> `string`)
pub fn local_name(qname: &str) -> &str {
    match qname.rsplit_once(':') {
        Some((_, local)) => local,
        None => qname,
    }
}

/// Upper occurrence bound of a particle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MaxOccurs {
    Bounded(u32),
    Unbounded,
}

/// Occurrence bounds of a particle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Occurs {
    pub min: u32,
    pub max: MaxOccurs,
}

impl Occurs {
    pub const ONCE: Occurs = Occurs {
        min: 1,
        max: MaxOccurs::Bounded(1),
    };

    /// Parse `minOccurs` / `maxOccurs` attribute values, defaulting both to 1
    pub fn parse(min: Option<&str>, max: Option<&str>) -> Option<Self> {
        let min = match min {
            Some(value) => value.trim().parse::<u32>().ok()?,
            None => 1,
        };
        let max = match max.map(str::trim) {
            Some("unbounded") => MaxOccurs::Unbounded,
            Some(value) => MaxOccurs::Bounded(value.parse::<u32>().ok()?),
            None => MaxOccurs::Bounded(1),
        };
        Some(Self { min, max })
    }

    /// An element may occur more than once per parent instance
    pub fn is_repeating(&self) -> bool {
        match self.max {
            MaxOccurs::Unbounded => true,
            MaxOccurs::Bounded(n) => n > 1,
        }
    }

    /// Effective bounds of a particle nested inside a container with `outer` bounds
    pub fn within(self, outer: Occurs) -> Occurs {
        let max = match (self.max, outer.max) {
            (MaxOccurs::Bounded(0), _) | (_, MaxOccurs::Bounded(0)) => MaxOccurs::Bounded(0),
            (MaxOccurs::Unbounded, _) | (_, MaxOccurs::Unbounded) => MaxOccurs::Unbounded,
            (MaxOccurs::Bounded(a), MaxOccurs::Bounded(b)) => MaxOccurs::Bounded(a.saturating_mul(b)),
        };
        Occurs {
            min: self.min.saturating_mul(outer.min),
            max,
        }
    }

    /// Same bounds with the lower bound relaxed to zero
    pub fn optional(self) -> Occurs {
        Occurs { min: 0, ..self }
    }

    /// Upper bound as a plain number, `None` when unbounded
    pub fn max_value(&self) -> Option<u32> {
        match self.max {
            MaxOccurs::Bounded(n) => Some(n),
            MaxOccurs::Unbounded => None,
        }
    }
}

impl Default for Occurs {
    fn default() -> Self {
        Self::ONCE
    }
}

/// How an element declaration gets its content
#[derive(Debug, Clone, PartialEq)]
pub enum ElementShape {
    /// `type="SomeType"`
    TypeRef(String),
    /// `ref="TopLevelElement"`
    ElementRef(String),
    /// anonymous `complexType` child
    Inline(Box<XsdTypeNode>),
    /// anonymous `simpleType` child, or no type information at all
    Simple { base: Option<String> },
}

/// Kind of model group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositorKind {
    Sequence,
    Choice,
    All,
}

impl CompositorKind {
    pub fn from_local_name(name: &str) -> Option<Self> {
        match name {
            "sequence" => Some(Self::Sequence),
            "choice" => Some(Self::Choice),
            "all" => Some(Self::All),
            _ => None,
        }
    }
}

/// One entry of a content model
#[derive(Debug, Clone, PartialEq)]
pub enum Particle {
    Element(XsdElementNode),
    GroupRef {
        name: String,
        occurs: Occurs,
    },
    Compositor {
        kind: CompositorKind,
        occurs: Occurs,
        particles: Vec<Particle>,
    },
    Wildcard,
}

/// Base-type relationship of a complex type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Derivation {
    None,
    Extension(String),
    Restriction(String),
}

impl Derivation {
    pub fn base(&self) -> Option<&str> {
        match self {
            Derivation::None => None,
            Derivation::Extension(base) | Derivation::Restriction(base) => Some(base),
        }
    }
}

/// A complex type or a named model group
#[derive(Debug, Clone, PartialEq)]
pub struct XsdTypeNode {
    /// `None` for anonymous types
    pub name: Option<String>,
    pub derivation: Derivation,
    pub particles: Vec<Particle>,
    /// Uses `simpleContent`: a value-carrying leaf whose attributes are metadata
    pub simple_content: bool,
    pub attributes: Vec<String>,
}

impl XsdTypeNode {
    pub fn anonymous() -> Self {
        Self {
            name: None,
            derivation: Derivation::None,
            particles: Vec::new(),
            simple_content: false,
            attributes: Vec::new(),
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::anonymous()
        }
    }
}

/// An element declaration, top-level or local
#[derive(Debug, Clone, PartialEq)]
pub struct XsdElementNode {
    pub name: String,
    pub shape: ElementShape,
    pub occurs: Occurs,
    pub documentation: Option<String>,
}

/// A named simple type; only its base is kept
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XsdSimpleType {
    pub name: String,
    pub base: Option<String>,
}

/// One parsed schema document and its document-local declarations
#[derive(Debug, Clone)]
pub struct XsdDocument {
    pub path: PathBuf,
    pub source: String,
    /// `schemaLocation` values of include, redefine and import elements
    pub includes: Vec<String>,
    /// Document that first pulled this one in, `None` for version roots
    pub included_from: Option<PathBuf>,
    pub types: Vec<XsdTypeNode>,
    pub groups: Vec<XsdTypeNode>,
    pub simple_types: Vec<XsdSimpleType>,
    pub elements: Vec<XsdElementNode>,
}

/// What kind of declaration a symbol names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolKind {
    ComplexType,
    Group,
    SimpleType,
    Element,
}

impl fmt::Display for SymbolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SymbolKind::ComplexType => "complex type",
            SymbolKind::Group => "group",
            SymbolKind::SimpleType => "simple type",
            SymbolKind::Element => "element",
        };
        f.write_str(label)
    }
}

/// Non-fatal observation made while merging documents
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadWarning {
    pub kind: SymbolKind,
    pub name: String,
    pub document: PathBuf,
}

impl fmt::Display for LoadWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "duplicate {} '{}' in {} ignored",
            self.kind,
            self.name,
            self.document.display()
        )
    }
}

/// Version-wide symbol table merged from every loaded document
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    pub types: HashMap<String, XsdTypeNode>,
    pub groups: HashMap<String, XsdTypeNode>,
    pub simple_types: HashMap<String, XsdSimpleType>,
    pub elements: HashMap<String, XsdElementNode>,
}

fn insert_first<T: Clone>(
    table: &mut HashMap<String, T>,
    name: &str,
    value: &T,
    kind: SymbolKind,
    document: &std::path::Path,
    warnings: &mut Vec<LoadWarning>,
) {
    if table.contains_key(name) {
        warnings.push(LoadWarning {
            kind,
            name: name.to_string(),
            document: document.to_path_buf(),
        });
    } else {
        table.insert(name.to_string(), value.clone());
    }
}

impl SymbolTable {
    /// Merge documents in load order; the first definition of a name wins
    pub fn from_documents(documents: &[XsdDocument]) -> (Self, Vec<LoadWarning>) {
        let mut table = SymbolTable::default();
        let mut warnings = Vec::new();

        for doc in documents {
            for node in &doc.types {
                if let Some(name) = &node.name {
                    insert_first(
                        &mut table.types,
                        name,
                        node,
                        SymbolKind::ComplexType,
                        &doc.path,
                        &mut warnings,
                    );
                }
            }
            for node in &doc.groups {
                if let Some(name) = &node.name {
                    insert_first(
                        &mut table.groups,
                        name,
                        node,
                        SymbolKind::Group,
                        &doc.path,
                        &mut warnings,
                    );
                }
            }
            for simple in &doc.simple_types {
                insert_first(
                    &mut table.simple_types,
                    &simple.name,
                    simple,
                    SymbolKind::SimpleType,
                    &doc.path,
                    &mut warnings,
                );
            }
            for element in &doc.elements {
                insert_first(
                    &mut table.elements,
                    &element.name,
                    element,
                    SymbolKind::Element,
                    &doc.path,
                    &mut warnings,
                );
            }
        }

        (table, warnings)
    }
}
