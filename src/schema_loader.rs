use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

use crate::error::{LoadError, LoadResult};
use crate::file_discovery::FileDiscovery;
use crate::schema_model::{
    CompositorKind, Derivation, ElementShape, LoadWarning, Occurs, Particle, SymbolTable,
    XsdDocument, XsdElementNode, XsdSimpleType, XsdTypeNode, local_name,
};
use crate::version::SchemaVersion;

/// Minimal element tree built from a schema document.
///
/// Element names are stored without their namespace prefix; attribute keys
/// are kept verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct XmlNode {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<XmlNode>,
    pub text: String,
    pub line: usize,
}

impl XmlNode {
    fn from_start(e: &BytesStart<'_>, line: usize) -> Self {
        let name = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
        let attributes = e
            .attributes()
            .flatten()
            .map(|attr| {
                (
                    String::from_utf8_lossy(attr.key.as_ref()).to_string(),
                    String::from_utf8_lossy(&attr.value).to_string(),
                )
            })
            .collect();
        Self {
            name,
            attributes,
            children: Vec::new(),
            text: String::new(),
            line,
        }
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn child(&self, name: &str) -> Option<&XmlNode> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Text of this node and all descendants, in document order
    pub fn text_content(&self) -> String {
        let mut out = self.text.clone();
        for child in &self.children {
            out.push(' ');
            out.push_str(&child.text_content());
        }
        out
    }
}

pub(crate) fn predefined_entity(name: &[u8]) -> Option<char> {
    match name {
        b"amp" => Some('&'),
        b"lt" => Some('<'),
        b"gt" => Some('>'),
        b"quot" => Some('"'),
        b"apos" => Some('\''),
        _ => None,
    }
}

/// Parse a document into an [`XmlNode`] tree
pub fn parse_tree(path: &Path, text: &str) -> LoadResult<XmlNode> {
    let malformed = |details: String| LoadError::MalformedDocument {
        path: path.to_path_buf(),
        details,
    };

    let mut reader = Reader::from_str(text);
    let mut buf = Vec::new();
    let mut stack: Vec<XmlNode> = Vec::new();
    let mut root: Option<XmlNode> = None;
    let mut line = 1usize;
    let mut cursor = 0usize;

    loop {
        let position = reader.buffer_position() as usize;
        if position > cursor {
            line += text.as_bytes()[cursor..position.min(text.len())]
                .iter()
                .filter(|b| **b == b'\n')
                .count();
            cursor = position.min(text.len());
        }

        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => stack.push(XmlNode::from_start(e, line)),
            Ok(Event::Empty(ref e)) => {
                let node = XmlNode::from_start(e, line);
                match stack.last_mut() {
                    Some(parent) => parent.children.push(node),
                    None if root.is_none() => root = Some(node),
                    None => return Err(malformed("multiple root elements".to_string())),
                }
            }
            Ok(Event::End(_)) => {
                let Some(node) = stack.pop() else {
                    return Err(malformed("unbalanced end tag".to_string()));
                };
                match stack.last_mut() {
                    Some(parent) => parent.children.push(node),
                    None if root.is_none() => root = Some(node),
                    None => return Err(malformed("multiple root elements".to_string())),
                }
            }
            Ok(Event::Text(ref e)) => {
                if let Some(node) = stack.last_mut() {
                    node.text.push_str(&String::from_utf8_lossy(e.as_ref()));
                }
            }
            Ok(Event::CData(ref e)) => {
                if let Some(node) = stack.last_mut() {
                    node.text.push_str(&String::from_utf8_lossy(e.as_ref()));
                }
            }
            Ok(Event::GeneralRef(ref e)) => {
                if let Some(node) = stack.last_mut() {
                    if let Some(ch) = predefined_entity(e.as_ref()) {
                        node.text.push(ch);
                    } else if let Ok(Some(ch)) = e.resolve_char_ref() {
                        node.text.push(ch);
                    }
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(malformed(format!(
                    "{} at byte {}",
                    e,
                    reader.error_position()
                )));
            }
        }
        buf.clear();
    }

    if !stack.is_empty() {
        return Err(malformed(format!(
            "unexpected end of document inside <{}>",
            stack.last().map(|n| n.name.as_str()).unwrap_or_default()
        )));
    }
    root.ok_or_else(|| malformed("document has no root element".to_string()))
}

/// Collapse runs of whitespace; `None` when nothing is left
pub fn collapse_whitespace(text: &str) -> Option<String> {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    (!collapsed.is_empty()).then_some(collapsed)
}

fn documentation_of(node: &XmlNode) -> Option<String> {
    let annotation = node.child("annotation")?;
    let text = annotation
        .children
        .iter()
        .filter(|c| c.name == "documentation")
        .map(XmlNode::text_content)
        .collect::<Vec<_>>()
        .join(" ");
    collapse_whitespace(&text)
}

struct DocumentParser<'a> {
    path: &'a Path,
}

impl DocumentParser<'_> {
    fn malformed(&self, node: &XmlNode, details: impl Into<String>) -> LoadError {
        LoadError::MalformedDocument {
            path: self.path.to_path_buf(),
            details: format!("line {}: {}", node.line, details.into()),
        }
    }

    fn occurs(&self, node: &XmlNode) -> LoadResult<Occurs> {
        Occurs::parse(node.attr("minOccurs"), node.attr("maxOccurs")).ok_or_else(|| {
            self.malformed(
                node,
                format!(
                    "invalid occurrence bounds on <{}> (minOccurs={:?}, maxOccurs={:?})",
                    node.name,
                    node.attr("minOccurs"),
                    node.attr("maxOccurs")
                ),
            )
        })
    }

    fn element(&self, node: &XmlNode) -> LoadResult<XsdElementNode> {
        let occurs = self.occurs(node)?;
        let documentation = documentation_of(node);

        if let Some(reference) = node.attr("ref") {
            let target = local_name(reference).to_string();
            return Ok(XsdElementNode {
                name: target.clone(),
                shape: ElementShape::ElementRef(target),
                occurs,
                documentation,
            });
        }

        let name = node
            .attr("name")
            .ok_or_else(|| self.malformed(node, "element without name or ref"))?
            .to_string();

        let shape = if let Some(type_name) = node.attr("type") {
            ElementShape::TypeRef(local_name(type_name).to_string())
        } else if let Some(inline) = node.child("complexType") {
            ElementShape::Inline(Box::new(self.complex_type(inline, None)?))
        } else if let Some(simple) = node.child("simpleType") {
            ElementShape::Simple {
                base: simple_base(simple),
            }
        } else {
            ElementShape::Simple { base: None }
        };

        Ok(XsdElementNode {
            name,
            shape,
            occurs,
            documentation,
        })
    }

    fn particle(&self, node: &XmlNode) -> LoadResult<Option<Particle>> {
        if let Some(kind) = CompositorKind::from_local_name(&node.name) {
            let mut particles = Vec::new();
            for child in &node.children {
                if let Some(p) = self.particle(child)? {
                    particles.push(p);
                }
            }
            return Ok(Some(Particle::Compositor {
                kind,
                occurs: self.occurs(node)?,
                particles,
            }));
        }

        match node.name.as_str() {
            "element" => Ok(Some(Particle::Element(self.element(node)?))),
            "group" => {
                let reference = node
                    .attr("ref")
                    .ok_or_else(|| self.malformed(node, "local group without ref"))?;
                Ok(Some(Particle::GroupRef {
                    name: local_name(reference).to_string(),
                    occurs: self.occurs(node)?,
                }))
            }
            "any" => Ok(Some(Particle::Wildcard)),
            _ => Ok(None),
        }
    }

    /// Content of an `extension` / `restriction` inside complex or simple content
    fn derived_content(&self, node: &XmlNode, target: &mut XsdTypeNode) -> LoadResult<()> {
        for child in &node.children {
            match child.name.as_str() {
                "extension" | "restriction" => {
                    let base = child
                        .attr("base")
                        .map(|b| local_name(b).to_string())
                        .ok_or_else(|| self.malformed(child, "derivation without base"))?;
                    target.derivation = if child.name == "extension" {
                        Derivation::Extension(base)
                    } else {
                        Derivation::Restriction(base)
                    };
                    self.content_model(child, target)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn content_model(&self, node: &XmlNode, target: &mut XsdTypeNode) -> LoadResult<()> {
        for child in &node.children {
            match child.name.as_str() {
                "attribute" => {
                    if let Some(name) = child.attr("name").or(child.attr("ref")) {
                        target.attributes.push(local_name(name).to_string());
                    }
                }
                "attributeGroup" | "anyAttribute" | "annotation" => {}
                _ => {
                    if let Some(p) = self.particle(child)? {
                        target.particles.push(p);
                    }
                }
            }
        }
        Ok(())
    }

    fn complex_type(&self, node: &XmlNode, name: Option<String>) -> LoadResult<XsdTypeNode> {
        let mut target = XsdTypeNode {
            name,
            ..XsdTypeNode::anonymous()
        };

        if let Some(simple) = node.child("simpleContent") {
            target.simple_content = true;
            self.derived_content(simple, &mut target)?;
        } else if let Some(complex) = node.child("complexContent") {
            self.derived_content(complex, &mut target)?;
        } else {
            self.content_model(node, &mut target)?;
        }

        Ok(target)
    }

    fn group(&self, node: &XmlNode, name: String) -> LoadResult<XsdTypeNode> {
        let mut target = XsdTypeNode::named(name);
        self.content_model(node, &mut target)?;
        Ok(target)
    }
}

fn simple_base(node: &XmlNode) -> Option<String> {
    node.child("restriction")
        .and_then(|r| r.attr("base"))
        .map(|b| local_name(b).to_string())
}

/// Parse one schema document into its document-local declarations
pub fn parse_document(path: &Path, text: &str) -> LoadResult<XsdDocument> {
    let root = parse_tree(path, text)?;
    if root.name != "schema" {
        return Err(LoadError::MalformedDocument {
            path: path.to_path_buf(),
            details: format!("root element is <{}>, expected <schema>", root.name),
        });
    }

    let parser = DocumentParser { path };
    let mut doc = XsdDocument {
        path: path.to_path_buf(),
        source: text.to_string(),
        includes: Vec::new(),
        included_from: None,
        types: Vec::new(),
        groups: Vec::new(),
        simple_types: Vec::new(),
        elements: Vec::new(),
    };

    collect_declarations(&parser, &root, &mut doc)?;
    Ok(doc)
}

fn collect_declarations(
    parser: &DocumentParser<'_>,
    parent: &XmlNode,
    doc: &mut XsdDocument,
) -> LoadResult<()> {
    for child in &parent.children {
        match child.name.as_str() {
            "include" | "import" | "redefine" => {
                if let Some(location) = child.attr("schemaLocation") {
                    doc.includes.push(location.to_string());
                }
                if child.name == "redefine" {
                    collect_declarations(parser, child, doc)?;
                }
            }
            "complexType" => {
                if let Some(name) = child.attr("name") {
                    doc.types
                        .push(parser.complex_type(child, Some(name.to_string()))?);
                }
            }
            "group" => {
                if let Some(name) = child.attr("name") {
                    doc.groups.push(parser.group(child, name.to_string())?);
                }
            }
            "simpleType" => {
                if let Some(name) = child.attr("name") {
                    doc.simple_types.push(XsdSimpleType {
                        name: name.to_string(),
                        base: simple_base(child),
                    });
                }
            }
            "element" => doc.elements.push(parser.element(child)?),
            _ => {}
        }
    }
    Ok(())
}

/// Every document of one schema version plus the merged symbol table
#[derive(Debug, Clone)]
pub struct LoadedSchema {
    pub version: SchemaVersion,
    pub documents: Vec<XsdDocument>,
    pub symbols: SymbolTable,
    /// Top-level element declarations that are not filing wrappers
    pub forms: Vec<XsdElementNode>,
    pub warnings: Vec<LoadWarning>,
}

impl LoadedSchema {
    /// Assemble a loaded version from already-parsed documents
    pub fn from_documents(
        version: SchemaVersion,
        documents: Vec<XsdDocument>,
        wrappers: &[String],
    ) -> Self {
        let (symbols, warnings) = SymbolTable::from_documents(&documents);

        let mut seen = HashSet::new();
        let forms = documents
            .iter()
            .flat_map(|doc| doc.elements.iter())
            .filter(|el| !wrappers.iter().any(|w| w == &el.name))
            .filter(|el| seen.insert(el.name.clone()))
            .cloned()
            .collect();

        Self {
            version,
            documents,
            symbols,
            forms,
            warnings,
        }
    }

    pub fn form_names(&self) -> Vec<&str> {
        self.forms.iter().map(|f| f.name.as_str()).collect()
    }
}

fn is_remote(location: &str) -> bool {
    location.starts_with("http://") || location.starts_with("https://")
}

/// Loads one schema version's document set, following include references
#[derive(Debug, Clone)]
pub struct SchemaLoader {
    discovery: FileDiscovery,
    wrappers: Vec<String>,
}

impl SchemaLoader {
    pub fn new(discovery: FileDiscovery, wrappers: Vec<String>) -> Self {
        Self {
            discovery,
            wrappers,
        }
    }

    pub fn wrappers(&self) -> &[String] {
        &self.wrappers
    }

    /// Load every document reachable from the version's schema files.
    ///
    /// Include locations resolve against the including document's directory.
    /// Each document is parsed once, which also makes include cycles harmless.
    pub async fn load_version(&self, version: &SchemaVersion) -> LoadResult<LoadedSchema> {
        let roots = self
            .discovery
            .discover_files(&version.root)
            .await
            .map_err(|e| LoadError::Io {
                path: version.root.clone(),
                details: e.to_string(),
            })?;

        if roots.is_empty() {
            return Err(LoadError::NoDocuments {
                version: version.id.clone(),
            });
        }

        let mut seen: HashSet<PathBuf> = HashSet::new();
        let mut queue: VecDeque<(PathBuf, Option<PathBuf>)> = VecDeque::new();
        for root in roots {
            let canonical = fs::canonicalize(&root).await.map_err(|e| LoadError::Io {
                path: root.clone(),
                details: e.to_string(),
            })?;
            if seen.insert(canonical.clone()) {
                queue.push_back((canonical, None));
            }
        }

        let mut documents = Vec::new();
        while let Some((path, included_from)) = queue.pop_front() {
            let text = fs::read_to_string(&path).await.map_err(|e| LoadError::Io {
                path: path.clone(),
                details: e.to_string(),
            })?;
            let mut doc = parse_document(&path, &text)?;
            doc.included_from = included_from;

            let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
            for location in &doc.includes {
                if is_remote(location) {
                    warn!(document = %path.display(), location = %location, "skipping remote schema reference");
                    continue;
                }
                let target = fs::canonicalize(base_dir.join(location))
                    .await
                    .map_err(|_| LoadError::UnresolvableInclude {
                        document: path.clone(),
                        location: location.clone(),
                    })?;
                if seen.insert(target.clone()) {
                    queue.push_back((target, Some(path.clone())));
                }
            }

            documents.push(doc);
        }

        let loaded = LoadedSchema::from_documents(version.clone(), documents, &self.wrappers);
        for warning in &loaded.warnings {
            debug!(version = %version.id, "{}", warning);
        }
        debug!(
            version = %version.id,
            documents = loaded.documents.len(),
            forms = loaded.forms.len(),
            "loaded schema version"
        );
        Ok(loaded)
    }
}

impl Default for SchemaLoader {
    fn default() -> Self {
        Self::new(
            FileDiscovery::schemas(),
            vec!["Return".to_string(), "ReturnData".to_string()],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema_model::MaxOccurs;
    use tempfile::TempDir;

    const SCHEMA: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<xsd:schema xmlns:xsd="http://www.w3.org/2001/XMLSchema" xmlns="http://www.irs.gov/efile">
  <xsd:include schemaLocation="../Common/efileTypes.xsd"/>
  <xsd:element name="IRS990">
    <xsd:annotation>
      <xsd:documentation>IRS Form   990
        main return</xsd:documentation>
    </xsd:annotation>
    <xsd:complexType>
      <xsd:sequence>
        <xsd:element name="TotalRevenueAmt" type="USAmountType" minOccurs="0"/>
        <xsd:element name="Officer" type="OfficerType" minOccurs="0" maxOccurs="unbounded"/>
        <xsd:group ref="AddressGrp"/>
        <xsd:choice>
          <xsd:element ref="Preparer"/>
          <xsd:any/>
        </xsd:choice>
      </xsd:sequence>
      <xsd:attribute name="documentId" type="xsd:string"/>
    </xsd:complexType>
  </xsd:element>
  <xsd:complexType name="AmountWithIdType">
    <xsd:simpleContent>
      <xsd:extension base="USAmountType">
        <xsd:attribute name="referenceDocumentId" type="xsd:string"/>
      </xsd:extension>
    </xsd:simpleContent>
  </xsd:complexType>
  <xsd:complexType name="DetailedOfficerType">
    <xsd:complexContent>
      <xsd:extension base="efile:OfficerType">
        <xsd:sequence>
          <xsd:element name="TitleTxt" type="xsd:string"/>
        </xsd:sequence>
      </xsd:extension>
    </xsd:complexContent>
  </xsd:complexType>
  <xsd:simpleType name="USAmountType">
    <xsd:restriction base="xsd:integer"/>
  </xsd:simpleType>
</xsd:schema>"#;

    #[test]
    fn test_parse_document_declarations() {
        let doc = parse_document(Path::new("IRS990.xsd"), SCHEMA).unwrap();

        assert_eq!(doc.includes, vec!["../Common/efileTypes.xsd"]);
        assert_eq!(doc.elements.len(), 1);
        assert_eq!(doc.types.len(), 2);
        assert_eq!(doc.simple_types[0].base.as_deref(), Some("integer"));

        let form = &doc.elements[0];
        assert_eq!(form.name, "IRS990");
        assert_eq!(
            form.documentation.as_deref(),
            Some("IRS Form 990 main return")
        );

        let ElementShape::Inline(node) = &form.shape else {
            panic!("expected inline complex type");
        };
        assert_eq!(node.attributes, vec!["documentId"]);
        let Particle::Compositor { kind, particles, .. } = &node.particles[0] else {
            panic!("expected sequence");
        };
        assert_eq!(*kind, CompositorKind::Sequence);
        assert_eq!(particles.len(), 4);

        let Particle::Element(officer) = &particles[1] else {
            panic!("expected element");
        };
        assert_eq!(officer.shape, ElementShape::TypeRef("OfficerType".to_string()));
        assert_eq!(officer.occurs.max, MaxOccurs::Unbounded);

        assert!(matches!(&particles[2], Particle::GroupRef { name, .. } if name == "AddressGrp"));

        let Particle::Compositor { particles: choice, .. } = &particles[3] else {
            panic!("expected choice");
        };
        assert!(matches!(
            &choice[0],
            Particle::Element(XsdElementNode { shape: ElementShape::ElementRef(r), .. }) if r == "Preparer"
        ));
        assert_eq!(choice[1], Particle::Wildcard);
    }

    #[test]
    fn test_parse_derivations() {
        let doc = parse_document(Path::new("IRS990.xsd"), SCHEMA).unwrap();

        let simple = &doc.types[0];
        assert!(simple.simple_content);
        assert_eq!(
            simple.derivation,
            Derivation::Extension("USAmountType".to_string())
        );
        assert_eq!(simple.attributes, vec!["referenceDocumentId"]);
        assert!(simple.particles.is_empty());

        let extended = &doc.types[1];
        assert!(!extended.simple_content);
        assert_eq!(
            extended.derivation,
            Derivation::Extension("OfficerType".to_string())
        );
        assert_eq!(extended.particles.len(), 1);
    }

    #[test]
    fn test_malformed_documents() {
        let err = parse_document(Path::new("bad.xsd"), "<xsd:schema><xsd:element name=\"A\">")
            .unwrap_err();
        assert!(matches!(err, LoadError::MalformedDocument { .. }));

        let err = parse_document(Path::new("bad.xsd"), "<root/>").unwrap_err();
        assert!(err.to_string().contains("expected <schema>"));

        let bad_occurs = r#"<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema">
            <xs:element name="A" maxOccurs="lots"/></xs:schema>"#;
        let err = parse_document(Path::new("bad.xsd"), bad_occurs).unwrap_err();
        assert!(err.to_string().contains("maxOccurs"));
    }

    #[test]
    fn test_parse_tree_tracks_lines() {
        let tree = parse_tree(Path::new("x.xsd"), "<a>\n  <b/>\n  <c>t &amp; u</c>\n</a>").unwrap();
        assert_eq!(tree.line, 1);
        assert_eq!(tree.children[0].line, 2);
        assert_eq!(tree.children[1].line, 3);
        assert_eq!(tree.children[1].text, "t & u");
    }

    #[tokio::test]
    async fn test_load_version_follows_relative_includes() {
        let temp_dir = TempDir::new().unwrap();
        let version_dir = temp_dir.path().join("2016v3.0");
        fs::create_dir_all(version_dir.join("TEGE/IRS990"))
            .await
            .unwrap();
        fs::create_dir_all(version_dir.join("Common")).await.unwrap();

        fs::write(
            version_dir.join("TEGE/IRS990/IRS990.xsd"),
            r#"<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema">
                <xs:include schemaLocation="../../Common/efileTypes.xsd"/>
                <xs:element name="IRS990" type="IRS990Type"/>
            </xs:schema>"#,
        )
        .await
        .unwrap();
        fs::write(
            version_dir.join("Common/efileTypes.xsd"),
            r#"<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema">
                <xs:include schemaLocation="../TEGE/IRS990/IRS990.xsd"/>
                <xs:complexType name="IRS990Type"><xs:sequence>
                  <xs:element name="TotalAmt" type="xs:integer"/>
                </xs:sequence></xs:complexType>
                <xs:element name="Return"/>
            </xs:schema>"#,
        )
        .await
        .unwrap();

        let version = SchemaVersion::new("2016v3.0", &version_dir);
        let loaded = SchemaLoader::default().load_version(&version).await.unwrap();

        assert_eq!(loaded.documents.len(), 2);
        assert!(loaded.symbols.types.contains_key("IRS990Type"));
        assert_eq!(loaded.form_names(), vec!["IRS990"]);
    }

    #[tokio::test]
    async fn test_load_version_unresolvable_include() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(
            temp_dir.path().join("Main.xsd"),
            r#"<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema">
                <xs:include schemaLocation="Missing.xsd"/>
            </xs:schema>"#,
        )
        .await
        .unwrap();

        let version = SchemaVersion::new("2013v3.0", temp_dir.path());
        let err = SchemaLoader::default()
            .load_version(&version)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            LoadError::UnresolvableInclude { ref location, .. } if location == "Missing.xsd"
        ));
    }

    #[tokio::test]
    async fn test_load_version_without_documents() {
        let temp_dir = TempDir::new().unwrap();
        let version = SchemaVersion::new("2013v3.0", temp_dir.path());
        let err = SchemaLoader::default()
            .load_version(&version)
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::NoDocuments { .. }));
    }
}
