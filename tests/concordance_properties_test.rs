mod common;

use common::*;
use std::collections::HashSet;
use xsd_concordance::{ConcordanceIndex, FieldExtractor, resolve_all};

fn xpaths(index: &ConcordanceIndex, version: &str) -> Vec<String> {
    let mut xpaths: Vec<String> = index.xpaths_for(version).map(str::to_string).collect();
    xpaths.sort();
    xpaths
}

#[tokio::test]
async fn test_no_extracted_field_is_lost() {
    let tree = two_version_tree();
    let outcome = engine().build(tree.root(), None).await.unwrap();

    for loaded in &outcome.loaded {
        let (catalog, _) = FieldExtractor::extract(&resolve_all(loaded));
        assert!(!catalog.fields.is_empty());
        for field in &catalog.fields {
            assert!(
                outcome.index.contains(&catalog.version, &field.xpath),
                "{} {} missing from index",
                catalog.version,
                field.xpath
            );
        }
    }
}

#[tokio::test]
async fn test_index_is_injective_per_version() {
    let tree = two_version_tree();
    let outcome = engine().build(tree.root(), None).await.unwrap();

    for version in outcome.index.versions() {
        let mut seen = HashSet::new();
        for field in outcome.index.fields() {
            if let Some(xpath) = field.xpaths.get(version) {
                assert!(seen.insert(xpath.clone()), "{} claimed twice", xpath);
                assert_eq!(
                    outcome.index.lookup(version, xpath).map(|f| &f.canonical_name),
                    Some(&field.canonical_name)
                );
            }
        }
    }
}

#[tokio::test]
async fn test_rebuild_is_deterministic() {
    let tree = two_version_tree();
    let first = engine().build(tree.root(), None).await.unwrap();
    let second = engine().build(tree.root(), None).await.unwrap();

    assert_eq!(first.index.xpath_index(), second.index.xpath_index());
    let names = |index: &ConcordanceIndex| {
        index
            .fields()
            .map(|f| f.canonical_name.clone())
            .collect::<Vec<_>>()
    };
    assert_eq!(names(&first.index), names(&second.index));
}

#[tokio::test]
async fn test_documentation_merges_renamed_field() {
    let tree = two_version_tree();
    let outcome = engine().build(tree.root(), None).await.unwrap();
    let index = &outcome.index;

    let old = index
        .lookup("2019v5.0", "/IRS990/VotingMembersCnt")
        .expect("old xpath indexed");
    let new = index
        .lookup("2020v4.2", "/IRS990/GoverningBodyVotingMembersCnt")
        .expect("new xpath indexed");
    assert_eq!(old.canonical_name, new.canonical_name);
    assert_eq!(old.xpaths.len(), 2);
    assert_eq!(outcome.reconcile_report.description_merges, 1);

    let stable = index.lookup("2019v5.0", "/IRS990/WebsiteAddressTxt").unwrap();
    assert_eq!(
        Some(&stable.canonical_name),
        index
            .lookup("2020v4.2", "/IRS990/WebsiteAddressTxt")
            .map(|f| &f.canonical_name)
    );
}

#[tokio::test]
async fn test_extension_order_base_first() {
    let tree = SchemaTree::new();
    tree.write(
        "2020v4.2",
        "Form.xsd",
        &schema(
            r#"<xs:complexType name="A"><xs:sequence>
                 <xs:element name="P1" type="xs:string"/>
                 <xs:element name="P2" type="xs:string"/>
               </xs:sequence></xs:complexType>
               <xs:complexType name="B"><xs:complexContent>
                 <xs:extension base="A"><xs:sequence>
                   <xs:element name="P3" type="xs:string"/>
                 </xs:sequence></xs:extension>
               </xs:complexContent></xs:complexType>
               <xs:element name="Form" type="B"/>"#,
        ),
    );

    let outcome = engine().build(tree.root(), None).await.unwrap();
    let loaded = &outcome.loaded[0];
    let (catalog, _) = FieldExtractor::extract(&resolve_all(loaded));
    let order: Vec<&str> = catalog.fields.iter().map(|f| f.xpath.as_str()).collect();
    assert_eq!(order, vec!["/Form/P1", "/Form/P2", "/Form/P3"]);
}

#[tokio::test]
async fn test_simple_content_attribute_is_not_a_field() {
    let tree = SchemaTree::new();
    tree.write(
        "2020v4.2",
        "Form.xsd",
        &schema(
            r#"<xs:complexType name="AmountWithRefType"><xs:simpleContent>
                 <xs:extension base="xs:decimal">
                   <xs:attribute name="referenceDocumentId" type="xs:string"/>
                 </xs:extension>
               </xs:simpleContent></xs:complexType>
               <xs:element name="Form"><xs:complexType><xs:sequence>
                 <xs:element name="TotalAmt" type="AmountWithRefType"/>
               </xs:sequence></xs:complexType></xs:element>"#,
        ),
    );

    let outcome = engine().build(tree.root(), None).await.unwrap();
    assert_eq!(xpaths(&outcome.index, "2020v4.2"), vec!["/Form/TotalAmt"]);
    assert_eq!(outcome.index.len(), 1);
}

#[tokio::test]
async fn test_shared_group_yields_independent_fields() {
    let tree = SchemaTree::new();
    tree.write(
        "2020v4.2",
        "Form.xsd",
        &schema(
            r#"<xs:group name="AddressGrp"><xs:sequence>
                 <xs:element name="CityNm" type="xs:string"/>
               </xs:sequence></xs:group>
               <xs:element name="Form"><xs:complexType><xs:sequence>
                 <xs:element name="Officer" maxOccurs="unbounded">
                   <xs:complexType><xs:sequence><xs:group ref="AddressGrp"/></xs:sequence></xs:complexType>
                 </xs:element>
                 <xs:element name="Preparer" maxOccurs="unbounded">
                   <xs:complexType><xs:sequence><xs:group ref="AddressGrp"/></xs:sequence></xs:complexType>
                 </xs:element>
               </xs:sequence></xs:complexType></xs:element>"#,
        ),
    );

    let outcome = engine().build(tree.root(), None).await.unwrap();
    let index = &outcome.index;
    let officer = index.lookup("2020v4.2", "/Form/Officer/CityNm").unwrap();
    let preparer = index.lookup("2020v4.2", "/Form/Preparer/CityNm").unwrap();

    assert_ne!(officer.canonical_name, preparer.canonical_name);
    assert_eq!(officer.parent_group.as_deref(), Some("Officer"));
    assert_eq!(preparer.parent_group.as_deref(), Some("Preparer"));
    assert!(officer.is_repeating);
}

#[tokio::test]
async fn test_include_chain_is_followed() {
    let tree = SchemaTree::new();
    tree.write(
        "2020v4.2",
        "IRS990/IRS990.xsd",
        &schema(
            r#"<xs:include schemaLocation="../Common/Types.xsd"/>
               <xs:element name="IRS990" type="ReturnType"/>"#,
        ),
    );
    tree.write(
        "2020v4.2",
        "Common/Types.xsd",
        &schema(
            r#"<xs:complexType name="ReturnType"><xs:sequence>
                 <xs:element name="TotalAmt" type="xs:integer"/>
               </xs:sequence></xs:complexType>"#,
        ),
    );

    let outcome = engine().build(tree.root(), None).await.unwrap();
    assert!(outcome.version_failures.is_empty());
    assert!(outcome.index.contains("2020v4.2", "/IRS990/TotalAmt"));
}

#[tokio::test]
async fn test_unresolvable_include_fails_only_its_version() {
    let tree = two_version_tree();
    tree.write(
        "2021v4.0",
        "IRS990.xsd",
        &schema(r#"<xs:include schemaLocation="Missing.xsd"/>"#),
    );

    let outcome = engine().build(tree.root(), None).await.unwrap();
    assert_eq!(outcome.version_failures.len(), 1);
    assert_eq!(outcome.version_failures[0].version, "2021v4.0");
    assert_eq!(
        outcome.index.versions(),
        &["2019v5.0".to_string(), "2020v4.2".to_string()]
    );
}

#[tokio::test]
async fn test_cyclic_extension_skips_only_that_form() {
    let tree = SchemaTree::new();
    tree.write(
        "2020v4.2",
        "Forms.xsd",
        &schema(
            r#"<xs:complexType name="X"><xs:complexContent><xs:extension base="Y"/></xs:complexContent></xs:complexType>
               <xs:complexType name="Y"><xs:complexContent><xs:extension base="X"/></xs:complexContent></xs:complexType>
               <xs:element name="Broken" type="X"/>
               <xs:element name="Fine"><xs:complexType><xs:sequence>
                 <xs:element name="OkTxt" type="xs:string"/>
               </xs:sequence></xs:complexType></xs:element>"#,
        ),
    );

    let outcome = engine().build(tree.root(), None).await.unwrap();
    assert_eq!(outcome.form_failures.len(), 1);
    assert_eq!(outcome.form_failures[0].form, "Broken");
    assert!(outcome.index.contains("2020v4.2", "/Fine/OkTxt"));
}
