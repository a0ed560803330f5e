mod common;

use common::*;
use std::fs;
use std::process::Command;
use tempfile::TempDir;

fn binary() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_xsd-concordance"));
    // keep the user's config files and env out of the run
    command.env_remove("RUST_LOG");
    for key in [
        "THREADS",
        "SIMILARITY_THRESHOLD",
        "MIN_FILINGS",
        "VERSION_ATTRIBUTE",
        "OUTPUT_DIR",
        "FORMAT",
        "VERBOSE",
        "QUIET",
        "FILING_EXTENSIONS",
    ] {
        command.env_remove(format!("XSD_CONCORDANCE_{}", key));
    }
    command
}

#[test]
fn test_cli_help_output() {
    let output = binary().arg("--help").output().unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    for flag in [
        "--filings",
        "--concordance",
        "--output-dir",
        "--threads",
        "--similarity-threshold",
        "--min-filings",
        "--format",
        "--quiet",
    ] {
        assert!(stdout.contains(flag), "help lacks {}", flag);
    }
}

#[test]
fn test_cli_version_output() {
    let output = binary().arg("--version").output().unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("xsd-concordance"));
}

#[test]
fn test_cli_missing_schema_dir_fails() {
    let work = TempDir::new().unwrap();
    let output = binary()
        .current_dir(work.path())
        .arg("/nonexistent/schema/root")
        .output()
        .unwrap();

    assert!(!output.status.success());
    let stderr = String::from_utf8(output.stderr).unwrap();
    assert!(stderr.contains("Schema directory does not exist"));
}

#[test]
fn test_cli_conflicting_options() {
    let tree = two_version_tree();
    let output = binary()
        .args(["--verbose", "--quiet"])
        .arg(tree.root())
        .output()
        .unwrap();

    assert!(!output.status.success());
}

#[test]
fn test_cli_build_and_audit_writes_artifacts() {
    let tree = two_version_tree();
    let filings = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let body = "<EIN>1</EIN><NewThingAmt>5</NewThingAmt>";
    write_filing(filings.path(), "a.xml", &filing("2020v4.2", "IRS990", body));
    write_filing(filings.path(), "b.xml", &filing("2020v4.2", "IRS990", body));

    let output = binary()
        .current_dir(out.path())
        .arg(tree.root())
        .arg("--filings")
        .arg(filings.path())
        .arg("--output-dir")
        .arg(out.path())
        .args(["--format", "json"])
        .output()
        .unwrap();

    assert!(
        output.status.success(),
        "{}",
        String::from_utf8_lossy(&output.stderr)
    );
    for artifact in [
        "concordance.json",
        "concordance.csv",
        "coverage_report.json",
        "audit_report.json",
        "concordance_patch.json",
    ] {
        assert!(out.path().join(artifact).is_file(), "{} not written", artifact);
    }

    let summary: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(summary["versions"].as_array().unwrap().len(), 2);
    assert_eq!(summary["filings_audited"], 2);
    assert_eq!(summary["patches"], 1);

    let patch: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(out.path().join("concordance_patch.json")).unwrap())
            .unwrap();
    assert_eq!(patch["total"], 1);
    assert_eq!(patch["patches"][0]["xpath"], "/IRS990/NewThingAmt");

    let csv = fs::read_to_string(out.path().join("concordance.csv")).unwrap();
    let header = csv.lines().next().unwrap();
    assert!(header.contains("xpath_2019v5.0"));
    assert!(header.contains("xpath_2020v4.2"));
}

#[test]
fn test_cli_audits_stored_concordance() {
    let tree = two_version_tree();
    let first = TempDir::new().unwrap();
    let second = TempDir::new().unwrap();
    let filings = TempDir::new().unwrap();
    write_filing(
        filings.path(),
        "a.xml",
        &filing("2020v4.2", "IRS990", "<EIN>1</EIN>"),
    );

    let build = binary()
        .current_dir(first.path())
        .arg(tree.root())
        .arg("--output-dir")
        .arg(first.path())
        .arg("--quiet")
        .output()
        .unwrap();
    assert!(build.status.success());
    assert!(!first.path().join("audit_report.json").exists());

    let audit = binary()
        .current_dir(second.path())
        .arg(tree.root())
        .arg("--concordance")
        .arg(first.path().join("concordance.json"))
        .arg("--filings")
        .arg(filings.path())
        .arg("--output-dir")
        .arg(second.path())
        .args(["--format", "summary"])
        .output()
        .unwrap();

    assert!(
        audit.status.success(),
        "{}",
        String::from_utf8_lossy(&audit.stderr)
    );
    let stdout = String::from_utf8(audit.stdout).unwrap();
    assert!(stdout.contains("filings=1"));
    assert!(stdout.contains("unknown=0"));
    assert!(second.path().join("audit_report.json").is_file());
}

#[test]
fn test_cli_rejects_invalid_threshold() {
    let tree = two_version_tree();
    let work = TempDir::new().unwrap();
    let output = binary()
        .current_dir(work.path())
        .arg(tree.root())
        .args(["--similarity-threshold", "1.5"])
        .output()
        .unwrap();

    assert!(!output.status.success());
    let stderr = String::from_utf8(output.stderr).unwrap();
    assert!(stderr.contains("Similarity threshold"));
}
