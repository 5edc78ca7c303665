//! Binary-driven integration tests for the `kb` CLI.
//!
//! Each test runs against a fresh tempdir config using the SQLite backend
//! and the offline hashing provider.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn kb_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("kb");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    fs::create_dir_all(root.join("config")).unwrap();
    fs::create_dir_all(root.join("data")).unwrap();
    fs::create_dir_all(root.join("files")).unwrap();

    fs::write(
        root.join("files").join("alpha.md"),
        "# Alpha\n\nSourdough fermentation depends on wild yeast cultures.\n\n\
         Long proofing times develop flavor in the sourdough loaf.",
    )
    .unwrap();
    fs::write(
        root.join("files").join("beta.txt"),
        "Glacier meltwater carves channels beneath the alpine ice sheet.\n\n\
         Crevasse patterns reveal the stress history of glacier flow.",
    )
    .unwrap();

    let config_content = format!(
        r#"[store]
backend = "sqlite"
path = "{}/data/kb.sqlite"

[chunking]
chunk_size = 40
overlap = 8

[embedding]
provider = "hashing"
dims = 64

[retrieval]
k = 5
min_similarity = 0.0
"#,
        root.display()
    );

    let config_path = root.join("config").join("kb.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_kb(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = kb_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run kb binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

#[test]
fn init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_kb(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data").join("kb.sqlite").exists());
}

#[test]
fn init_is_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, first) = run_kb(&config_path, &["init"]);
    assert!(first, "first init failed");
    let (_, _, second) = run_kb(&config_path, &["init"]);
    assert!(second, "second init failed (not idempotent)");
}

#[test]
fn ingest_and_search_round_trip() {
    let (tmp, config_path) = setup_test_env();
    run_kb(&config_path, &["init"]);

    let alpha = tmp.path().join("files").join("alpha.md");
    let (stdout, stderr, success) =
        run_kb(&config_path, &["ingest", alpha.to_str().unwrap()]);
    assert!(success, "ingest failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("chunks written"));
    assert!(stdout.contains("ok"));

    let (stdout, _, success) = run_kb(&config_path, &["search", "sourdough fermentation"]);
    assert!(success, "search failed");
    assert!(stdout.contains("document 1"), "expected hit, got: {}", stdout);
}

#[test]
fn search_is_deterministic() {
    let (tmp, config_path) = setup_test_env();
    run_kb(&config_path, &["init"]);
    let alpha = tmp.path().join("files").join("alpha.md");
    run_kb(&config_path, &["ingest", alpha.to_str().unwrap()]);

    let (first, _, _) = run_kb(&config_path, &["search", "yeast cultures"]);
    let (second, _, _) = run_kb(&config_path, &["search", "yeast cultures"]);
    assert_eq!(first, second, "search output should be deterministic");
}

#[test]
fn empty_query_reports_no_results() {
    let (_tmp, config_path) = setup_test_env();
    run_kb(&config_path, &["init"]);

    let (stdout, _, success) = run_kb(&config_path, &["search", ""]);
    assert!(success, "empty query should not panic");
    assert!(stdout.contains("No results"));
}

#[test]
fn min_similarity_excludes_weak_matches() {
    let (tmp, config_path) = setup_test_env();
    run_kb(&config_path, &["init"]);
    let alpha = tmp.path().join("files").join("alpha.md");
    run_kb(&config_path, &["ingest", alpha.to_str().unwrap()]);

    let (stdout, _, success) = run_kb(
        &config_path,
        &["search", "entirely unrelated query terms", "--min-similarity", "0.9"],
    );
    assert!(success);
    assert!(stdout.contains("No results"));
}

#[test]
fn unsupported_format_fails_closed() {
    let (tmp, config_path) = setup_test_env();
    run_kb(&config_path, &["init"]);

    let payload = tmp.path().join("files").join("payload.exe");
    fs::write(&payload, b"MZ").unwrap();

    let (_, stderr, success) = run_kb(&config_path, &["ingest", payload.to_str().unwrap()]);
    assert!(!success, "unsupported format should fail");
    assert!(
        stderr.contains("unsupported format"),
        "expected unsupported-format error, got: {}",
        stderr
    );
}

#[test]
fn corrupt_pdf_names_document_and_stage() {
    let (tmp, config_path) = setup_test_env();
    run_kb(&config_path, &["init"]);

    let bad = tmp.path().join("files").join("broken.pdf");
    fs::write(&bad, b"not a pdf at all").unwrap();

    let (_, stderr, success) = run_kb(&config_path, &["ingest", bad.to_str().unwrap()]);
    assert!(!success);
    assert!(stderr.contains("broken.pdf"));
    assert!(stderr.contains("extraction failed"));
}

#[test]
fn delete_removes_document_from_results() {
    let (tmp, config_path) = setup_test_env();
    run_kb(&config_path, &["init"]);
    let beta = tmp.path().join("files").join("beta.txt");
    run_kb(&config_path, &["ingest", beta.to_str().unwrap()]);

    let (stdout, _, success) = run_kb(&config_path, &["delete", "1"]);
    assert!(success, "delete failed: {}", stdout);
    assert!(stdout.contains("deleted document 1"));

    let (stdout, _, _) = run_kb(&config_path, &["search", "glacier meltwater"]);
    assert!(stdout.contains("No results"));

    let (_, stderr, success) = run_kb(&config_path, &["delete", "1"]);
    assert!(!success, "double delete should fail");
    assert!(stderr.contains("not found"));
}

#[test]
fn stats_reports_counts_and_breakdown() {
    let (tmp, config_path) = setup_test_env();
    run_kb(&config_path, &["init"]);
    let alpha = tmp.path().join("files").join("alpha.md");
    let beta = tmp.path().join("files").join("beta.txt");
    run_kb(&config_path, &["ingest", alpha.to_str().unwrap()]);
    run_kb(&config_path, &["ingest", beta.to_str().unwrap()]);

    let (stdout, _, success) = run_kb(&config_path, &["stats"]);
    assert!(success);
    assert!(stdout.contains("Documents:   2"));
    assert!(stdout.contains("alpha.md"));
    assert!(stdout.contains("beta.txt"));
    assert!(stdout.contains("indexed"));
}

#[test]
fn rebuild_reports_batches() {
    let (tmp, config_path) = setup_test_env();
    run_kb(&config_path, &["init"]);
    let alpha = tmp.path().join("files").join("alpha.md");
    run_kb(&config_path, &["ingest", alpha.to_str().unwrap()]);

    let (stdout, stderr, success) =
        run_kb(&config_path, &["rebuild", "--batch-size", "2"]);
    assert!(success, "rebuild failed: {}", stderr);
    assert!(stdout.contains("batches committed"));
    assert!(stdout.contains("ok"));
}

#[test]
fn search_enrich_prints_entities() {
    let (tmp, config_path) = setup_test_env();
    run_kb(&config_path, &["init"]);

    let gamma = tmp.path().join("files").join("gamma.txt");
    fs::write(
        &gamma,
        "Marie Curie pioneered radioactivity research with Pierre Curie. \
         Marie Curie later won a second prize. Pierre Curie lectured in Paris.",
    )
    .unwrap();
    run_kb(&config_path, &["ingest", gamma.to_str().unwrap()]);

    let (stdout, _, success) = run_kb(
        &config_path,
        &["search", "Marie Curie radioactivity", "--enrich"],
    );
    assert!(success);
    assert!(
        stdout.contains("Marie Curie"),
        "expected entity in output: {}",
        stdout
    );
}

#[test]
fn unknown_document_filter_returns_empty_not_error() {
    let (tmp, config_path) = setup_test_env();
    run_kb(&config_path, &["init"]);
    let alpha = tmp.path().join("files").join("alpha.md");
    run_kb(&config_path, &["ingest", alpha.to_str().unwrap()]);

    let (stdout, _, success) = run_kb(
        &config_path,
        &["search", "sourdough", "--document-id", "42"],
    );
    assert!(success, "filtered search should succeed");
    assert!(stdout.contains("No results"));
}
