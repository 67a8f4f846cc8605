//! CLI tests that run the built `smartdrive` binary. None of them reach the
//! network: they exercise config validation and the local policy cache.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn smartdrive_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_smartdrive"))
}

fn setup_test_env(extra: &str) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();
    fs::create_dir_all(root.join("config")).unwrap();

    let config_content = format!(
        r#"[index]
host = "https://smartdrive-test.svc.example.io"

[state]
token_cache = "{root}/token.json"
folder_cache = "{root}/folders.json"
{extra}
"#,
        root = root.display(),
        extra = extra
    );
    let config_path = root.join("config").join("smartdrive.toml");
    fs::write(&config_path, config_content).unwrap();
    (tmp, config_path)
}

fn write_policy(tmp: &TempDir, json: &str) -> PathBuf {
    let path = tmp.path().join("folders.json");
    fs::write(&path, json).unwrap();
    path
}

fn run_smartdrive(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = smartdrive_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run smartdrive binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_folders_list_empty() {
    let (_tmp, config_path) = setup_test_env("");
    let (stdout, stderr, success) = run_smartdrive(&config_path, &["folders", "list"]);
    assert!(success, "folders list failed: {}", stderr);
    assert!(stdout.contains("No folder decisions saved"));
}

#[test]
fn test_folders_list_shows_decisions() {
    let (tmp, config_path) = setup_test_env("");
    write_policy(
        &tmp,
        r#"{"/Documents/Taxes": "process", "/Documents/Photos": "skip", "/Documents/Scans": "list-only"}"#,
    );

    let (stdout, stderr, success) = run_smartdrive(&config_path, &["folders", "list"]);
    assert!(success, "folders list failed: {}", stderr);
    assert!(stdout.contains("/Documents/Taxes"));
    assert!(stdout.contains("list-only"));
    assert!(stdout.contains("3 folders: 1 process, 1 list-only, 1 skip"));
}

#[test]
fn test_folders_cycle_persists() {
    let (tmp, config_path) = setup_test_env("");
    let policy = write_policy(&tmp, r#"{"/Documents/Taxes": "process"}"#);

    let (stdout, stderr, success) =
        run_smartdrive(&config_path, &["folders", "cycle", "/Documents/Taxes"]);
    assert!(success, "cycle failed: {}", stderr);
    assert!(stdout.contains("list-only"));

    let saved = fs::read_to_string(&policy).unwrap();
    assert!(saved.contains("\"list-only\""));
}

#[test]
fn test_folders_remove_unknown_fails() {
    let (_tmp, config_path) = setup_test_env("");
    let (_, stderr, success) =
        run_smartdrive(&config_path, &["folders", "remove", "/Documents/Nowhere"]);
    assert!(!success);
    assert!(stderr.contains("No saved decision"));
}

#[test]
fn test_folders_reset_clears_cache() {
    let (tmp, config_path) = setup_test_env("");
    let policy = write_policy(
        &tmp,
        r#"{"/Documents/A": "process", "/Documents/B": "skip"}"#,
    );

    let (stdout, _, success) = run_smartdrive(&config_path, &["folders", "reset"]);
    assert!(success);
    assert!(stdout.contains("Cleared 2 folder decisions."));
    assert_eq!(fs::read_to_string(&policy).unwrap().trim(), "{}");
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) =
        run_smartdrive(&tmp.path().join("absent.toml"), &["folders", "list"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}

#[test]
fn test_invalid_config_rejected_before_work() {
    let (_tmp, config_path) = setup_test_env("[crawl]\nmax_files = 0\n");
    let (_, stderr, success) = run_smartdrive(&config_path, &["folders", "list"]);
    assert!(!success);
    assert!(stderr.contains("max_files"));
}

#[test]
fn test_search_empty_query() {
    let (_tmp, config_path) = setup_test_env("");
    let (stdout, _, success) = run_smartdrive(&config_path, &["search", "   "]);
    assert!(success);
    assert!(stdout.contains("No results."));
}

#[test]
fn test_search_requires_embeddings() {
    let (_tmp, config_path) = setup_test_env("");
    let (_, stderr, success) = run_smartdrive(&config_path, &["search", "w-2"]);
    assert!(!success);
    assert!(stderr.contains("requires embeddings"));
}

#[test]
fn test_delete_folder_rejects_relative_path() {
    let (_tmp, config_path) = setup_test_env("");
    let (_, stderr, success) = run_smartdrive(&config_path, &["delete-folder", "Documents/Old"]);
    assert!(!success);
    assert!(stderr.contains("must start with '/'"));
}
