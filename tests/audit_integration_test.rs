mod common;

use common::*;
use tempfile::TempDir;
use xsd_concordance::{GapClassification, MatchStrategy, PatchStatus};

const VERSION: &str = "2020v4.2";

#[tokio::test]
async fn test_container_with_known_children_is_not_a_gap() {
    let tree = SchemaTree::new();
    tree.write(
        VERSION,
        "IRS990.xsd",
        &schema(&form(
            "IRS990",
            &[r#"<xs:element name="Address"><xs:complexType><xs:sequence>
                   <xs:element name="CityNm" type="xs:string"/>
                 </xs:sequence></xs:complexType></xs:element>"#
                .to_string()],
        )),
    );
    let filings = TempDir::new().unwrap();
    let body = "<Address><CityNm>Springfield</CityNm></Address>";
    write_filing(filings.path(), "a.xml", &filing(VERSION, "IRS990", body));

    let engine = engine();
    let outcome = engine.build(tree.root(), None).await.unwrap();
    let report = engine
        .audit(filings.path(), &outcome.index, &outcome.raw_index(), None)
        .await
        .unwrap();

    assert_eq!(report.filings_audited, 1);
    assert_eq!(report.unknown_xpaths, 0);
    assert!(report.findings().all(|f| f.xpath != "/IRS990/Address"));
    assert!(report.covered_containers >= 1);
}

#[tokio::test]
async fn test_patch_requires_two_filings() {
    let tree = two_version_tree();
    let filings = TempDir::new().unwrap();
    let body = "<EIN>123456789</EIN><NewThingAmt>5</NewThingAmt>";
    write_filing(filings.path(), "a.xml", &filing(VERSION, "IRS990", body));

    let engine = engine();
    let outcome = engine.build(tree.root(), None).await.unwrap();
    let raw = outcome.raw_index();

    let report = engine
        .audit(filings.path(), &outcome.index, &raw, None)
        .await
        .unwrap();
    assert_eq!(report.unknown_xpaths, 1);
    assert!(report.patches.is_empty());

    write_filing(filings.path(), "b.xml", &filing(VERSION, "IRS990", body));
    let report = engine
        .audit(filings.path(), &outcome.index, &raw, None)
        .await
        .unwrap();
    assert_eq!(report.patches.len(), 1);
    assert_eq!(report.patches[0].xpath, "/IRS990/NewThingAmt");
    assert_eq!(report.patches[0].filing_count, 2);
}

#[tokio::test]
async fn test_gap_classification() {
    let tree = SchemaTree::new();
    // DeclaredOnlyInTypeTxt is declared in the raw schema but no form reaches it
    tree.write(
        VERSION,
        "IRS990.xsd",
        &schema(&format!(
            "{}\n{}",
            form("IRS990", &[leaf("EIN", None)]),
            r#"<xs:complexType name="OrphanType"><xs:sequence>
                 <xs:element name="DeclaredOnlyInTypeTxt" type="xs:string"/>
               </xs:sequence></xs:complexType>"#
        )),
    );
    let filings = TempDir::new().unwrap();
    let body = "<EIN>1</EIN><DeclaredOnlyInTypeTxt>x</DeclaredOnlyInTypeTxt><NeverDeclaredTxt>y</NeverDeclaredTxt>";
    write_filing(filings.path(), "a.xml", &filing(VERSION, "IRS990", body));

    let engine = engine();
    let outcome = engine.build(tree.root(), None).await.unwrap();
    let report = engine
        .audit(filings.path(), &outcome.index, &outcome.raw_index(), None)
        .await
        .unwrap();

    let class = |xpath: &str| {
        report
            .findings()
            .find(|f| f.xpath == xpath)
            .map(|f| f.classification)
    };
    assert_eq!(
        class("/IRS990/DeclaredOnlyInTypeTxt"),
        Some(GapClassification::VersionCovered)
    );
    assert_eq!(
        class("/IRS990/NeverDeclaredTxt"),
        Some(GapClassification::VersionMissing)
    );
    assert_eq!(report.unknowns_version_covered, 1);
    assert_eq!(report.unknowns_version_missing, 1);
}

#[tokio::test]
async fn test_known_leaf_under_undeclared_parent_is_version_missing() {
    let tree = SchemaTree::new();
    tree.write(
        VERSION,
        "IRS990.xsd",
        &schema(&form(
            "IRS990",
            &[
                leaf("EIN", None),
                r#"<xs:element name="Address"><xs:complexType><xs:sequence>
                     <xs:element name="CityNm" type="xs:string"/>
                   </xs:sequence></xs:complexType></xs:element>"#
                    .to_string(),
            ],
        )),
    );
    let filings = TempDir::new().unwrap();
    let body = "<EIN>1</EIN><NeverDeclaredGrp><EIN>2</EIN><CityNm>X</CityNm></NeverDeclaredGrp>";
    write_filing(filings.path(), "a.xml", &filing(VERSION, "IRS990", body));

    let engine = engine();
    let outcome = engine.build(tree.root(), None).await.unwrap();
    let report = engine
        .audit(filings.path(), &outcome.index, &outcome.raw_index(), None)
        .await
        .unwrap();

    let class = |xpath: &str| {
        report
            .findings()
            .find(|f| f.xpath == xpath)
            .map(|f| f.classification)
    };
    // EIN and CityNm are declared, but never below NeverDeclaredGrp
    for xpath in [
        "/IRS990/NeverDeclaredGrp",
        "/IRS990/NeverDeclaredGrp/EIN",
        "/IRS990/NeverDeclaredGrp/CityNm",
    ] {
        assert_eq!(
            class(xpath),
            Some(GapClassification::VersionMissing),
            "{}",
            xpath
        );
    }
    assert_eq!(report.unknowns_version_covered, 0);
}

#[tokio::test]
async fn test_moved_field_found_by_leaf_name() {
    let tree = two_version_tree();
    let filings = TempDir::new().unwrap();
    // EIN moved under a new parent in the filing
    let body = "<Filer><EIN>1</EIN></Filer>";
    for name in ["a.xml", "b.xml", "c.xml"] {
        write_filing(filings.path(), name, &filing(VERSION, "IRS990", body));
    }

    let engine = engine();
    let outcome = engine.build(tree.root(), None).await.unwrap();
    let report = engine
        .audit(filings.path(), &outcome.index, &outcome.raw_index(), None)
        .await
        .unwrap();

    let finding = report
        .findings()
        .find(|f| f.xpath == "/IRS990/Filer/EIN")
        .expect("moved EIN reported");
    assert_eq!(finding.match_strategy, Some(MatchStrategy::ExactLeaf));
    let best = finding.best_candidate().unwrap();
    assert_eq!(best.xpath, "/IRS990/EIN");
    assert!(best.confidence >= 0.8);

    let patch = report
        .patches
        .iter()
        .find(|p| p.xpath == "/IRS990/Filer/EIN")
        .unwrap();
    assert_eq!(patch.status, PatchStatus::ProbableRename);
}

#[tokio::test]
async fn test_filing_for_unknown_version() {
    let tree = two_version_tree();
    let filings = TempDir::new().unwrap();
    write_filing(
        filings.path(),
        "a.xml",
        &filing("2030v1.0", "IRS990", "<EIN>1</EIN>"),
    );

    let engine = engine();
    let outcome = engine.build(tree.root(), None).await.unwrap();
    let report = engine
        .audit(filings.path(), &outcome.index, &outcome.raw_index(), None)
        .await
        .unwrap();

    assert_eq!(report.missing_versions, vec!["2030v1.0"]);
    assert!(report.warnings.iter().any(|w| w.contains("MISSING VERSION")));
}

#[tokio::test]
async fn test_bad_filings_are_recorded_not_fatal() {
    let tree = two_version_tree();
    let filings = TempDir::new().unwrap();
    write_filing(
        filings.path(),
        "good.xml",
        &filing(VERSION, "IRS990", "<EIN>1</EIN>"),
    );
    write_filing(filings.path(), "truncated.xml", "<Return returnVersion=\"2020v4.2\"><ReturnData>");
    write_filing(filings.path(), "unversioned.xml", "<Return><ReturnData/></Return>");

    let engine = engine();
    let outcome = engine.build(tree.root(), None).await.unwrap();
    let report = engine
        .audit(filings.path(), &outcome.index, &outcome.raw_index(), None)
        .await
        .unwrap();

    assert_eq!(report.filings_audited, 1);
    assert_eq!(report.filing_failures.len(), 2);
    assert!(report.filing_failures[0].path.ends_with("truncated.xml"));
    assert!(report.filing_failures[1].reason.contains("returnVersion"));
}
