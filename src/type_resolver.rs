//! Type-graph resolution.
//!
//! Named complex types and groups are resolved at most once per version and
//! memoised in a name-keyed state map. A name found `InProgress` while it is
//! being resolved is a cycle, reported with the full chain.

use serde::Serialize;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::{debug, warn};

use crate::error::{ResolutionError, ResolutionResult};
use crate::schema_loader::LoadedSchema;
use crate::schema_model::{
    CompositorKind, Derivation, ElementShape, Occurs, Particle, SymbolTable, XsdElementNode,
    XsdTypeNode,
};

enum ResolutionState<T> {
    InProgress,
    Resolved(T),
}

/// An element declaration with its occurrence bounds after flattening
#[derive(Debug, Clone, PartialEq)]
pub struct FlatElement {
    pub element: XsdElementNode,
    pub occurs: Occurs,
}

/// Fully resolved content of a type
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedType {
    /// Carries a single value; attributes are metadata only
    Simple {
        base: Option<String>,
        attributes: Vec<String>,
    },
    /// Child elements in document order, base type's elements first
    Complex { elements: Vec<FlatElement> },
}

/// A top-level form expanded down to its leaves
#[derive(Debug, Clone, PartialEq)]
pub struct ExpandedElement {
    pub name: String,
    pub occurs: Occurs,
    pub documentation: Option<String>,
    pub data_type: String,
    pub children: Vec<ExpandedElement>,
}

impl ExpandedElement {
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Number of leaves below (or at) this element
    pub fn leaf_count(&self) -> usize {
        if self.is_leaf() {
            1
        } else {
            self.children.iter().map(ExpandedElement::leaf_count).sum()
        }
    }
}

/// A form that could not be expanded; its siblings are unaffected
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormFailure {
    pub version: String,
    pub form: String,
    pub reason: String,
}

/// Every expandable form of one version
#[derive(Debug, Clone)]
pub struct ResolvedVersion {
    pub version: String,
    pub forms: Vec<ExpandedElement>,
    pub failures: Vec<FormFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PathKey {
    Type(String),
    Element(String),
}

impl PathKey {
    fn label(&self) -> String {
        match self {
            PathKey::Type(name) => name.clone(),
            PathKey::Element(name) => format!("element {}", name),
        }
    }
}

/// Resolves extension chains and group references against one symbol table
pub struct TypeGraphResolver<'a> {
    symbols: &'a SymbolTable,
    types: HashMap<String, ResolutionState<Rc<ResolvedType>>>,
    groups: HashMap<String, ResolutionState<Rc<Vec<FlatElement>>>>,
    type_chain: Vec<String>,
    group_chain: Vec<String>,
}

impl<'a> TypeGraphResolver<'a> {
    pub fn new(symbols: &'a SymbolTable) -> Self {
        Self {
            symbols,
            types: HashMap::new(),
            groups: HashMap::new(),
            type_chain: Vec::new(),
            group_chain: Vec::new(),
        }
    }

    /// Resolve a type by name. Names that are not complex types resolve to `Simple`.
    pub fn resolve_type(&mut self, name: &str) -> ResolutionResult<Rc<ResolvedType>> {
        match self.types.get(name) {
            Some(ResolutionState::Resolved(resolved)) => return Ok(Rc::clone(resolved)),
            Some(ResolutionState::InProgress) => {
                let start = self
                    .type_chain
                    .iter()
                    .position(|n| n == name)
                    .unwrap_or_default();
                let mut chain = self.type_chain[start..].to_vec();
                chain.push(name.to_string());
                return Err(ResolutionError::CyclicExtension { chain });
            }
            None => {}
        }

        let symbols = self.symbols;
        let Some(node) = symbols.types.get(name) else {
            let base = symbols
                .simple_types
                .get(name)
                .and_then(|s| s.base.clone())
                .or_else(|| Some(name.to_string()));
            return Ok(Rc::new(ResolvedType::Simple {
                base,
                attributes: Vec::new(),
            }));
        };

        self.types
            .insert(name.to_string(), ResolutionState::InProgress);
        self.type_chain.push(name.to_string());
        let result = self.resolve_type_node(node);
        self.type_chain.pop();

        match result {
            Ok(resolved) => {
                let resolved = Rc::new(resolved);
                self.types.insert(
                    name.to_string(),
                    ResolutionState::Resolved(Rc::clone(&resolved)),
                );
                Ok(resolved)
            }
            Err(e) => {
                self.types.remove(name);
                Err(e)
            }
        }
    }

    /// Resolve a type definition, named or anonymous
    pub fn resolve_type_node(&mut self, node: &XsdTypeNode) -> ResolutionResult<ResolvedType> {
        if node.simple_content {
            return Ok(ResolvedType::Simple {
                base: node.derivation.base().map(str::to_string),
                attributes: node.attributes.clone(),
            });
        }

        let mut elements = match &node.derivation {
            Derivation::Extension(base) => match self.resolve_type(base)?.as_ref() {
                ResolvedType::Complex { elements } => elements.clone(),
                ResolvedType::Simple { base, .. } if node.particles.is_empty() => {
                    return Ok(ResolvedType::Simple {
                        base: base.clone(),
                        attributes: node.attributes.clone(),
                    });
                }
                ResolvedType::Simple { .. } => Vec::new(),
            },
            Derivation::Restriction(_) | Derivation::None => Vec::new(),
        };

        elements.extend(self.flatten(&node.particles, Occurs::ONCE)?);
        Ok(ResolvedType::Complex { elements })
    }

    /// Inline a named group's elements
    pub fn resolve_group(&mut self, name: &str) -> ResolutionResult<Rc<Vec<FlatElement>>> {
        match self.groups.get(name) {
            Some(ResolutionState::Resolved(resolved)) => return Ok(Rc::clone(resolved)),
            Some(ResolutionState::InProgress) => {
                let start = self
                    .group_chain
                    .iter()
                    .position(|n| n == name)
                    .unwrap_or_default();
                let mut chain = self.group_chain[start..].to_vec();
                chain.push(name.to_string());
                return Err(ResolutionError::CyclicGroup { chain });
            }
            None => {}
        }

        let symbols = self.symbols;
        let node = symbols
            .groups
            .get(name)
            .ok_or_else(|| ResolutionError::UnknownGroup {
                name: name.to_string(),
            })?;

        self.groups
            .insert(name.to_string(), ResolutionState::InProgress);
        self.group_chain.push(name.to_string());
        let result = self.flatten(&node.particles, Occurs::ONCE);
        self.group_chain.pop();

        match result {
            Ok(elements) => {
                let elements = Rc::new(elements);
                self.groups.insert(
                    name.to_string(),
                    ResolutionState::Resolved(Rc::clone(&elements)),
                );
                Ok(elements)
            }
            Err(e) => {
                self.groups.remove(name);
                Err(e)
            }
        }
    }

    /// Flatten compositors and group references into element declarations.
    /// Container bounds multiply into every contained element.
    fn flatten(
        &mut self,
        particles: &[Particle],
        outer: Occurs,
    ) -> ResolutionResult<Vec<FlatElement>> {
        let mut out = Vec::new();
        for particle in particles {
            match particle {
                Particle::Element(element) => {
                    let element = self.dereference(element)?;
                    let occurs = element.occurs.within(outer);
                    out.push(FlatElement { element, occurs });
                }
                Particle::GroupRef { name, occurs } => {
                    let effective = occurs.within(outer);
                    for flat in self.resolve_group(name)?.iter() {
                        out.push(FlatElement {
                            element: flat.element.clone(),
                            occurs: flat.occurs.within(effective),
                        });
                    }
                }
                Particle::Compositor {
                    kind,
                    occurs,
                    particles,
                } => {
                    let mut effective = occurs.within(outer);
                    if *kind == CompositorKind::Choice {
                        effective = effective.optional();
                    }
                    out.extend(self.flatten(particles, effective)?);
                }
                Particle::Wildcard => {}
            }
        }
        Ok(out)
    }

    /// Replace an element reference with the referenced top-level declaration
    fn dereference(&self, element: &XsdElementNode) -> ResolutionResult<XsdElementNode> {
        let ElementShape::ElementRef(target) = &element.shape else {
            return Ok(element.clone());
        };
        let declared =
            self.symbols
                .elements
                .get(target)
                .ok_or_else(|| ResolutionError::UnknownElementRef {
                    name: target.clone(),
                })?;
        Ok(XsdElementNode {
            name: declared.name.clone(),
            shape: declared.shape.clone(),
            occurs: element.occurs,
            documentation: element
                .documentation
                .clone()
                .or_else(|| declared.documentation.clone()),
        })
    }

    /// Expand a top-level form into a tree with no unresolved references
    pub fn expand_form(&mut self, form: &XsdElementNode) -> ResolutionResult<ExpandedElement> {
        let form = self.dereference(form)?;
        let mut path = Vec::new();
        self.expand_element(&form, form.occurs, &mut path)
    }

    fn expand_element(
        &mut self,
        element: &XsdElementNode,
        occurs: Occurs,
        path: &mut Vec<PathKey>,
    ) -> ResolutionResult<ExpandedElement> {
        let (key, resolved, data_type) = match &element.shape {
            ElementShape::TypeRef(type_name) => {
                let resolved = self.resolve_type(type_name)?;
                (
                    Some(PathKey::Type(type_name.clone())),
                    resolved,
                    type_name.clone(),
                )
            }
            ElementShape::Inline(node) => {
                let resolved = Rc::new(self.resolve_type_node(node)?);
                let data_type = match resolved.as_ref() {
                    ResolvedType::Simple { base, .. } => {
                        base.clone().unwrap_or_else(|| "string".to_string())
                    }
                    ResolvedType::Complex { .. } => String::new(),
                };
                (None, resolved, data_type)
            }
            ElementShape::Simple { base } => {
                let data_type = base.clone().unwrap_or_else(|| "anyType".to_string());
                let resolved = Rc::new(ResolvedType::Simple {
                    base: base.clone(),
                    attributes: Vec::new(),
                });
                (None, resolved, data_type)
            }
            ElementShape::ElementRef(_) => {
                let target = self.dereference(element)?;
                let element_key = PathKey::Element(target.name.clone());
                if path.contains(&element_key) {
                    return Err(recursion_error(path, element_key));
                }
                path.push(element_key);
                let expanded = self.expand_element(&target, occurs, path);
                path.pop();
                return expanded;
            }
        };

        let ResolvedType::Complex { elements } = resolved.as_ref() else {
            return Ok(ExpandedElement {
                name: element.name.clone(),
                occurs,
                documentation: element.documentation.clone(),
                data_type,
                children: Vec::new(),
            });
        };

        if let Some(key) = &key
            && path.contains(key)
        {
            return Err(recursion_error(path, key.clone()));
        }
        if let Some(key) = &key {
            path.push(key.clone());
        }

        let mut children = Vec::with_capacity(elements.len());
        let mut failure = None;
        for flat in elements {
            match self.expand_element(&flat.element, flat.occurs, path) {
                Ok(child) => children.push(child),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if key.is_some() {
            path.pop();
        }
        if let Some(e) = failure {
            return Err(e);
        }

        Ok(ExpandedElement {
            name: element.name.clone(),
            occurs,
            documentation: element.documentation.clone(),
            data_type,
            children,
        })
    }
}

fn recursion_error(path: &[PathKey], repeated: PathKey) -> ResolutionError {
    let start = path.iter().position(|k| *k == repeated).unwrap_or_default();
    let mut chain: Vec<String> = path[start..].iter().map(PathKey::label).collect();
    chain.push(repeated.label());
    ResolutionError::RecursiveElement { chain }
}

/// Expand every form of a loaded version; failing forms are recorded and skipped
pub fn resolve_all(loaded: &LoadedSchema) -> ResolvedVersion {
    let mut resolver = TypeGraphResolver::new(&loaded.symbols);
    let mut forms = Vec::new();
    let mut failures = Vec::new();

    for form in &loaded.forms {
        match resolver.expand_form(form) {
            Ok(expanded) => forms.push(expanded),
            Err(e) => {
                warn!(version = %loaded.version.id, form = %form.name, error = %e, "skipping form");
                failures.push(FormFailure {
                    version: loaded.version.id.clone(),
                    form: form.name.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }

    debug!(
        version = %loaded.version.id,
        forms = forms.len(),
        failed = failures.len(),
        "resolved forms"
    );

    ResolvedVersion {
        version: loaded.version.id.clone(),
        forms,
        failures,
    }
}
