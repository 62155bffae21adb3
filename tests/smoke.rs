//! Smoke tests -- verify the binary runs and key subcommands exist.

use assert_cmd::Command;

#[test]
fn test_cli_help() {
    Command::cargo_bin("chainsentry")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains(
            "Rate-limited anomaly detection",
        ));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("chainsentry")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicates::str::contains("chainsentry"));
}

#[test]
fn test_cycle_subcommand_exists() {
    Command::cargo_bin("chainsentry")
        .unwrap()
        .args(["cycle", "--help"])
        .assert()
        .success();
}

#[test]
fn test_stats_on_fresh_db() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("smoke.db");

    Command::cargo_bin("chainsentry")
        .unwrap()
        .args(["--db", db.to_str().unwrap(), "stats", "--hours", "24"])
        .assert()
        .success()
        .stdout(predicates::str::contains("Escalations:       0"));
}

#[test]
fn test_baseline_on_fresh_db_reports_not_ready() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("smoke.db");

    Command::cargo_bin("chainsentry")
        .unwrap()
        .args(["--db", db.to_str().unwrap(), "baseline"])
        .assert()
        .success()
        .stdout(predicates::str::contains("Baseline not ready"));
}
