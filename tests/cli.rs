use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn dgov_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_dgov"))
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let files_dir = root.join("files");
    fs::create_dir_all(files_dir.join("hr")).unwrap();
    fs::write(
        files_dir.join("handbook.md"),
        "# Employee Handbook\n\nOffice hours and holiday calendar.\n\nExpense policy for travel.",
    )
    .unwrap();
    fs::write(
        files_dir.join("hr/payroll.md"),
        "# Payroll\n\nSalary bands and bonus schedule for engineering.",
    )
    .unwrap();
    fs::write(
        files_dir.join("hr/payroll.md.meta.json"),
        r#"{"confidentiality_level": "confidential", "document_type": "policy", "tags": ["hr"]}"#,
    )
    .unwrap();
    fs::write(
        files_dir.join("notes.txt"),
        "Deployment notes.\n\nKubernetes upgrade checklist and rollback plan.",
    )
    .unwrap();

    let config_content = format!(
        r#"[store]
backend = "sqlite"
path = "{root}/data/dgov.sqlite"

[chunking]
max_tokens = 700

[pipeline]
concurrency = 2
batch_timeout_secs = 60

[representation]
provider = "hashing"
dims = 64

[policy]
version = "test-1"

[[policy.rules]]
name = "deployment"
level = "internal"
content_pattern = "(?i)kubernetes"

[connectors.filesystem]
root = "{root}/files"
include_globs = ["**/*.md", "**/*.txt"]
source = "wiki"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("dgov.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_dgov(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = dgov_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .arg("--progress")
        .arg("off")
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run dgov binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn synced_and_processed() -> (TempDir, PathBuf) {
    let (tmp, config_path) = setup_test_env();
    let (stdout, stderr, success) = run_dgov(&config_path, &["sync"]);
    assert!(success, "sync failed: stdout={}, stderr={}", stdout, stderr);
    let (stdout, stderr, success) = run_dgov(&config_path, &["process", "all"]);
    assert!(success, "process failed: stdout={}, stderr={}", stdout, stderr);
    (tmp, config_path)
}

#[test]
fn test_init_is_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_dgov(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));

    let (_, _, success) = run_dgov(&config_path, &["init"]);
    assert!(success, "second init failed");
}

#[test]
fn test_sync_reports_counts() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_dgov(&config_path, &["sync"]);
    assert!(success, "sync failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("3 scanned"), "stdout: {}", stdout);
    assert!(stdout.contains("3 written"), "stdout: {}", stdout);
    assert!(stdout.contains("0 rejected"), "stdout: {}", stdout);
}

#[test]
fn test_unchanged_resync_keeps_index_current() {
    let (_tmp, config_path) = synced_and_processed();

    let (stdout, _, success) = run_dgov(&config_path, &["sync"]);
    assert!(success);
    assert!(stdout.contains("0 written"), "stdout: {}", stdout);
    assert!(stdout.contains("3 unchanged"), "stdout: {}", stdout);

    let (stdout, _, success) = run_dgov(&config_path, &["status"]);
    assert!(success);
    assert!(stdout.contains("indexed:   3  (0 pending)"), "stdout: {}", stdout);
}

#[test]
fn test_process_is_idempotent() {
    let (_tmp, config_path) = synced_and_processed();

    let (stdout, _, success) = run_dgov(&config_path, &["process", "all"]);
    assert!(success);
    assert!(stdout.contains("enrich: 0 discovered"), "stdout: {}", stdout);
    assert!(stdout.contains("index: 0 discovered"), "stdout: {}", stdout);

    let (stdout, _, success) = run_dgov(&config_path, &["status"]);
    assert!(success);
    assert!(stdout.contains("raw:       3"), "stdout: {}", stdout);
    assert!(stdout.contains("indexed:   3  (0 pending)"), "stdout: {}", stdout);
}

#[test]
fn test_query_respects_caller_levels() {
    let (_tmp, config_path) = synced_and_processed();

    let (stdout, _, success) = run_dgov(&config_path, &["query", "salary", "--level", "public"]);
    assert!(success);
    assert!(stdout.contains("No results."), "stdout: {}", stdout);

    let (stdout, _, success) = run_dgov(
        &config_path,
        &["query", "salary", "--level", "public", "--level", "confidential"],
    );
    assert!(success);
    assert!(stdout.contains("confidential"), "stdout: {}", stdout);
    assert!(stdout.contains("Salary"), "stdout: {}", stdout);
}

#[test]
fn test_query_without_levels_sees_nothing() {
    let (_tmp, config_path) = synced_and_processed();

    let (stdout, _, success) = run_dgov(&config_path, &["query", "handbook"]);
    assert!(success);
    assert!(stdout.contains("No results."));

    let (stdout, _, success) = run_dgov(&config_path, &["query", "handbook", "--level", "secret"]);
    assert!(success);
    assert!(stdout.contains("No results."));
}

#[test]
fn test_policy_tightens_unlabeled_file() {
    let (_tmp, config_path) = synced_and_processed();

    let (stdout, _, success) = run_dgov(
        &config_path,
        &["query", "kubernetes", "--level", "public", "--json"],
    );
    assert!(success);
    let hits: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(hits.as_array().unwrap().len(), 0);

    let (stdout, _, success) = run_dgov(
        &config_path,
        &["query", "kubernetes", "--level", "internal", "--json"],
    );
    assert!(success);
    let hits: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    let hits = hits.as_array().unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0]["metadata"]["confidentiality_level"], "internal");
}

#[test]
fn test_ingest_and_get() {
    let (tmp, config_path) = setup_test_env();
    let file = tmp.path().join("memo.txt");
    fs::write(&file, "Board memo.\n\nAcquisition timeline.").unwrap();

    let (stdout, stderr, success) = run_dgov(
        &config_path,
        &[
            "ingest",
            file.to_str().unwrap(),
            "--attr",
            "doc_id=memo-1",
            "--attr",
            "confidentiality_level=highly_confidential",
        ],
    );
    assert!(success, "ingest failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("memo-1"));
    assert!(stdout.contains("highly_confidential"));

    run_dgov(&config_path, &["process", "all"]);

    let (stdout, _, success) = run_dgov(&config_path, &["get", "raw", "memo-1"]);
    assert!(success);
    assert!(stdout.contains("Acquisition timeline."));

    let (_, stderr, success) = run_dgov(
        &config_path,
        &["get", "indexed", "memo-1", "--level", "internal"],
    );
    assert!(!success, "unauthorized read must fail");
    assert!(stderr.contains("not found"), "stderr: {}", stderr);

    let (stdout, _, success) = run_dgov(
        &config_path,
        &["get", "indexed", "memo-1", "--level", "highly_confidential"],
    );
    assert!(success);
    assert!(stdout.contains("chunk 0"));
}

#[test]
fn test_ingest_rejects_unknown_level() {
    let (tmp, config_path) = setup_test_env();
    let file = tmp.path().join("memo.txt");
    fs::write(&file, "body").unwrap();

    let (_, stderr, success) = run_dgov(
        &config_path,
        &["ingest", file.to_str().unwrap(), "--attr", "confidentiality_level=top-secret"],
    );
    assert!(!success);
    assert!(stderr.contains("top-secret"), "stderr: {}", stderr);

    let (stdout, _, _) = run_dgov(&config_path, &["status"]);
    assert!(stdout.contains("raw:       0"), "stdout: {}", stdout);
}

#[test]
fn test_downgrade_requires_flag() {
    let (tmp, config_path) = setup_test_env();
    let file = tmp.path().join("memo.txt");
    fs::write(&file, "body").unwrap();
    let path = file.to_str().unwrap();

    let (_, _, success) = run_dgov(
        &config_path,
        &["ingest", path, "--attr", "doc_id=m", "--attr", "confidentiality_level=confidential"],
    );
    assert!(success);

    let (_, stderr, success) = run_dgov(
        &config_path,
        &["ingest", path, "--attr", "doc_id=m", "--attr", "confidentiality_level=public"],
    );
    assert!(!success);
    assert!(stderr.contains("refusing to lower"), "stderr: {}", stderr);

    let (stdout, _, success) = run_dgov(
        &config_path,
        &[
            "ingest",
            path,
            "--attr",
            "doc_id=m",
            "--attr",
            "confidentiality_level=public",
            "--allow-downgrade",
        ],
    );
    assert!(success);
    assert!(stdout.contains("lowered"));
}

#[test]
fn test_failures_lists_corrupt_document() {
    let (tmp, config_path) = setup_test_env();
    let file = tmp.path().join("blob.bin");
    fs::write(&file, [0xffu8, 0xfe, 0xfd]).unwrap();

    let (_, _, success) = run_dgov(
        &config_path,
        &["ingest", file.to_str().unwrap(), "--attr", "doc_id=blob"],
    );
    assert!(success);

    let (stdout, _, success) = run_dgov(&config_path, &["process", "enrich"]);
    assert!(success);
    assert!(stdout.contains("1 invalid"), "stdout: {}", stdout);

    let (stdout, _, success) = run_dgov(&config_path, &["failures"]);
    assert!(success);
    assert!(stdout.contains("blob"));
    assert!(stdout.contains("UTF-8"));
}

#[test]
fn test_audit_and_purge() {
    let (_tmp, config_path) = synced_and_processed();

    let (stdout, stderr, success) = run_dgov(&config_path, &["audit"]);
    assert!(success, "audit failed: stdout={}, stderr={}", stdout, stderr);
    assert_eq!(stdout.lines().filter(|l| l.contains("  ok  ")).count(), 3);

    let (stdout, _, success) = run_dgov(&config_path, &["query", "--level", "public", "--json"]);
    assert!(success);
    let hits: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    let doc_id = hits[0]["doc_id"].as_str().unwrap().to_string();

    let (stdout, _, success) = run_dgov(&config_path, &["purge", &doc_id]);
    assert!(success);
    assert!(stdout.contains("indexed, enriched, raw"), "stdout: {}", stdout);

    let (stdout, _, _) = run_dgov(&config_path, &["status"]);
    assert!(stdout.contains("raw:       2"), "stdout: {}", stdout);
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_dgov(&tmp.path().join("absent.toml"), &["status"]);
    assert!(!success);
    assert!(!stderr.is_empty());
}
