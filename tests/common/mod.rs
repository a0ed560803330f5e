//! Shared fixtures: schema trees and filings written into temp directories

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use xsd_concordance::{ConcordanceEngine, EngineConfig, FileDiscovery};

pub const XS: &str = r#"xmlns:xs="http://www.w3.org/2001/XMLSchema""#;

/// Wrap declarations in an `xs:schema` root
pub fn schema(body: &str) -> String {
    format!("<xs:schema {}>\n{}\n</xs:schema>", XS, body)
}

/// A leaf element declaration with optional documentation
pub fn leaf(name: &str, doc: Option<&str>) -> String {
    match doc {
        Some(doc) => format!(
            r#"<xs:element name="{}" type="xs:string"><xs:annotation><xs:documentation>{}</xs:documentation></xs:annotation></xs:element>"#,
            name, doc
        ),
        None => format!(r#"<xs:element name="{}" type="xs:string"/>"#, name),
    }
}

/// A top-level form with an inline sequence of children
pub fn form(name: &str, children: &[String]) -> String {
    format!(
        "<xs:element name=\"{}\"><xs:complexType><xs:sequence>\n{}\n</xs:sequence></xs:complexType></xs:element>",
        name,
        children.join("\n")
    )
}

/// Temp directory laid out as `<root>/<version>/<file>`
pub struct SchemaTree {
    pub dir: TempDir,
}

impl SchemaTree {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create temp dir"),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn write(&self, version: &str, file: &str, content: &str) -> PathBuf {
        let path = self.dir.path().join(version).join(file);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("Failed to create version dir");
        }
        fs::write(&path, content).expect("Failed to write schema");
        path
    }
}

/// A filing wrapped in the usual `Return`/`ReturnData` envelope
pub fn filing(version: &str, form: &str, body: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<Return xmlns="http://www.irs.gov/efile" returnVersion="{}">
  <ReturnHeader><Filer><EIN>123456789</EIN></Filer></ReturnHeader>
  <ReturnData><{}>{}</{}></ReturnData>
</Return>"#,
        version, form, body, form
    )
}

pub fn write_filing(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, content).expect("Failed to write filing");
    path
}

pub fn engine() -> ConcordanceEngine {
    ConcordanceEngine::new(
        EngineConfig {
            max_concurrency: 4,
            batch_size: 2,
            ..EngineConfig::default()
        },
        FileDiscovery::schemas(),
        FileDiscovery::new(),
    )
}

/// Two IRS990 versions: one field renamed, one re-documented, one stable
pub fn two_version_tree() -> SchemaTree {
    let tree = SchemaTree::new();
    tree.write(
        "2019v5.0",
        "IRS990/IRS990.xsd",
        &schema(&form(
            "IRS990",
            &[
                leaf("EIN", Some("Employer identification number")),
                leaf("VotingMembersCnt", Some("Number of voting members of the governing body")),
                leaf("WebsiteAddressTxt", None),
            ],
        )),
    );
    tree.write(
        "2020v4.2",
        "IRS990/IRS990.xsd",
        &schema(&form(
            "IRS990",
            &[
                leaf("EIN", Some("Employer identification number")),
                leaf(
                    "GoverningBodyVotingMembersCnt",
                    Some("Number of voting members of the governing body"),
                ),
                leaf("WebsiteAddressTxt", None),
                leaf("GrantsPaidAmt", None),
            ],
        )),
    );
    tree
}
