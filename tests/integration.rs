use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn maint_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("maint");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::create_dir_all(root.join("data")).unwrap();

    fs::write(
        root.join("interventions.json"),
        r#"[{
            "reference": "INT-ABC123",
            "pk": 7,
            "subject": "Hydraulic leak",
            "criticality": "high",
            "intervention_date": "2024-03-05T14:30:00",
            "created_at": "2024-03-04T09:00:00"
        }]"#,
    )
    .unwrap();

    let config_content = format!(
        r#"[server]
bind = "127.0.0.1:5001"

[broker]
backend = "memory"

[cache]
backend = "memory"

[knowledge]
path = "{}/data/knowledge.sqlite"

[logging]
filter = "warn"
"#,
        root.display()
    );

    let config_path = config_dir.join("maint.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_maint(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = maint_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run maint binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_maint(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/knowledge.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_maint(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_maint(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_stats_on_empty_store() {
    let (_tmp, config_path) = setup_test_env();

    run_maint(&config_path, &["init"]);
    let (stdout, stderr, success) = run_maint(&config_path, &["stats"]);
    assert!(success, "stats failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Available:      yes"));
    assert!(stdout.contains("Documents:      0"));
    assert!(stdout.contains("Interventions:  0"));
    assert!(stdout.contains("Last update:    never"));
}

#[test]
fn test_stats_before_init_reports_uninitialized() {
    let (tmp, config_path) = setup_test_env();
    let db_path = tmp.path().join("data/knowledge.sqlite");

    let (stdout, stderr, success) = run_maint(&config_path, &["stats"]);
    assert!(success, "stats failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("not initialized"), "unexpected output: {}", stdout);
    assert!(!db_path.exists(), "stats must not create the database");
}

#[test]
fn test_stats_on_schemaless_file_reports_uninitialized() {
    let (tmp, config_path) = setup_test_env();
    let db_path = tmp.path().join("data/knowledge.sqlite");
    fs::write(&db_path, b"").unwrap();

    let (stdout, _, success) = run_maint(&config_path, &["stats"]);
    assert!(success);
    assert!(stdout.contains("not initialized"), "unexpected output: {}", stdout);
    assert!(!stdout.contains("Documents:"));
}

#[test]
fn test_index_errors_when_embeddings_disabled() {
    let (tmp, config_path) = setup_test_env();

    run_maint(&config_path, &["init"]);
    let file = tmp.path().join("interventions.json");
    let (_, stderr, success) = run_maint(&config_path, &["index", file.to_str().unwrap()]);
    assert!(!success, "index should fail without an embedding model");
    assert!(
        stderr.contains("embedding model"),
        "unexpected error: {}",
        stderr
    );
}

#[test]
fn test_index_unknown_format_errors() {
    let (tmp, config_path) = setup_test_env();
    let file = tmp.path().join("interventions.json");

    let (_, stderr, success) = run_maint(
        &config_path,
        &["index", file.to_str().unwrap(), "--format", "csv"],
    );
    assert!(!success);
    assert!(stderr.contains("Unknown index format"), "stderr: {}", stderr);
}

#[test]
fn test_invalid_broker_backend_rejected() {
    let (_tmp, config_path) = setup_test_env();
    let content = fs::read_to_string(&config_path)
        .unwrap()
        .replace("backend = \"memory\"\n\n[cache]", "backend = \"amqp\"\n\n[cache]");
    fs::write(&config_path, content).unwrap();

    let (_, stderr, success) = run_maint(&config_path, &["init"]);
    assert!(!success);
    assert!(stderr.contains("Unknown broker backend"), "stderr: {}", stderr);
}

#[test]
fn test_worker_refuses_memory_broker() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_maint(&config_path, &["worker"]);
    assert!(!success);
    assert!(stderr.contains("memory broker"), "stderr: {}", stderr);
}

#[test]
fn test_serve_memory_broker_needs_workers() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_maint(&config_path, &["serve"]);
    assert!(!success);
    assert!(stderr.contains("--workers"), "stderr: {}", stderr);
}

#[test]
fn test_missing_config_errors() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_maint(&tmp.path().join("nope.toml"), &["stats"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"), "stderr: {}", stderr);
}
