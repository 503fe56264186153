use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use tempfile::{TempDir, tempdir};

const ITEMS: &str = r#"[
  {"guid": "a", "feed": "Reuters", "title": "Climate risk assessment gains traction",
   "summary": "Banks and insurers are building climate risk models into lending decisions.",
   "published_at": "2026-03-08T09:00:00Z"},
  {"guid": "b", "feed": "FT", "title": "Insurers price in flood exposure",
   "summary": "Rising sea levels push insurers to reprice coastal climate exposure.",
   "published_at": "2026-03-07T09:00:00Z"},
  {"guid": "c", "feed": "Bloomberg", "title": "Offshore wind auctions attract record bids",
   "summary": "Developers bid for new offshore wind capacity in the North Sea.",
   "published_at": "2026-03-06T09:00:00Z"},
  {"guid": "d", "feed": "Guardian", "title": "Drought threatens harvests",
   "summary": "A prolonged drought raises climate and food security risk across the region.",
   "published_at": "2026-03-01T09:00:00Z"}
]"#;

fn ferret(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("ferret").unwrap();
    cmd.env("FERRET_DATA_DIR", dir)
        .env("FERRET_CONFIG", dir.join("config.toml"))
        .env_remove("RUST_LOG");
    cmd
}

fn robot_json(dir: &Path, args: &[&str]) -> Value {
    let output = ferret(dir).arg("--robot").args(args).output().unwrap();
    assert!(
        output.status.success(),
        "ferret {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).unwrap()
}

fn imported() -> TempDir {
    let dir = tempdir().unwrap();
    let file = dir.path().join("items.json");
    std::fs::write(&file, ITEMS).unwrap();
    let json = robot_json(dir.path(), &["import", file.to_str().unwrap()]);
    assert_eq!(json["data"]["imported"], 4);
    dir
}

#[test]
fn test_cli_help() {
    let mut cmd = Command::cargo_bin("ferret").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Usage:"));
}

#[test]
fn test_cli_version() {
    let mut cmd = Command::cargo_bin("ferret").unwrap();
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_tui_requires_terminal() {
    let dir = tempdir().unwrap();
    ferret(dir.path())
        .arg("tui")
        .assert()
        .failure()
        .stderr(predicate::str::contains("interactive terminal"));
}

#[test]
fn test_import_rejects_malformed_file() {
    let dir = tempdir().unwrap();
    let file = dir.path().join("bad.json");
    std::fs::write(&file, "{\"entries\": 3}").unwrap();
    let output = ferret(dir.path())
        .args(["--robot", "import", file.to_str().unwrap()])
        .output()
        .unwrap();
    assert!(!output.status.success());
    let json: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert!(json["status"]["error"]["message"]
        .as_str()
        .unwrap()
        .contains("invalid item file"));
}

#[test]
fn test_search_ranks_and_records_history() {
    let dir = imported();

    let json = robot_json(dir.path(), &["search", "climate risk"]);
    let results = json["data"]["results"].as_array().unwrap();
    assert!(!results.is_empty());
    assert_eq!(results[0]["title"], "Climate risk assessment gains traction");
    assert_eq!(json["data"]["stages"]["lexical"], "ready");

    // Same query, different spelling: one history entry, used twice.
    robot_json(dir.path(), &["search", "  Climate   RISK "]);
    let history = robot_json(dir.path(), &["history", "list"]);
    let entries = history["data"].as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["normalized_query"], "climate risk");
    assert_eq!(entries[0]["use_count"], 2);
}

#[test]
fn test_embed_enables_semantic_stage() {
    let dir = imported();

    let json = robot_json(dir.path(), &["embed"]);
    assert_eq!(json["data"]["embedded"], 4);
    assert_eq!(json["data"]["remaining"], 0);

    let json = robot_json(dir.path(), &["search", "offshore wind"]);
    assert_eq!(json["data"]["stages"]["embedding"], "ready");
    assert_eq!(json["data"]["stages"]["corpus"], "ready");
    assert_eq!(
        json["data"]["results"][0]["title"],
        "Offshore wind auctions attract record bids"
    );
}

#[test]
fn test_pinned_search_refreshes_as_saved_view() {
    let dir = imported();
    robot_json(dir.path(), &["search", "climate risk"]);
    let history = robot_json(dir.path(), &["history", "list"]);
    let id = history["data"][0]["id"].as_i64().unwrap().to_string();

    let views = robot_json(dir.path(), &["views", "list"]);
    assert_eq!(views["data"].as_array().unwrap().len(), 0);

    robot_json(dir.path(), &["history", "pin", &id]);
    let reports = robot_json(dir.path(), &["views", "refresh"]);
    let reports = reports["data"].as_array().unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0]["status"], "updated");
    assert!(reports[0]["rows"].as_u64().unwrap() > 0);

    let shown = robot_json(dir.path(), &["history", "show", &id]);
    assert!(!shown["data"]["results"].as_array().unwrap().is_empty());
}

#[test]
fn test_history_rm_unknown_entry_fails() {
    let dir = tempdir().unwrap();
    ferret(dir.path())
        .args(["history", "rm", "42"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("history entry 42"));
}
