//! End-to-end tests for the dock-store binary

mod common;

use common::*;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

const ENV_VARS: &[&str] = &[
    "DOCK_STORE_PATH",
    "DOCK_STORE_TIMEOUT_MS",
    "DOCK_DB",
    "DOCK_ADMIN_USER",
    "DOCK_ADMIN_PASS",
    "DOCK_APP_USER",
    "DOCK_APP_PASS",
];

fn dock_store(db_path: &Path, extra_args: &[&str]) -> Output {
    let mut command = Command::new(env!("CARGO_BIN_EXE_dock-store"));
    for var in ENV_VARS {
        command.env_remove(var);
    }
    command
        .env("LOG_LEVEL", "warn")
        .env("DOCK_STORE_PATH", db_path)
        .env("DOCK_DB", APP_SCOPE)
        .env("DOCK_ADMIN_USER", ADMIN_USER)
        .env("DOCK_ADMIN_PASS", ADMIN_PASS)
        .args(extra_args)
        .output()
        .expect("Failed to run dock-store")
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}

#[test]
fn test_bootstrap_exits_zero_and_is_repeatable() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("store.db");

    let first = dock_store(&db_path, &["bootstrap"]);
    assert!(first.status.success(), "stderr: {}", stderr(&first));
    let stdout = String::from_utf8_lossy(&first.stdout);
    assert!(stdout.contains("3 containers and 5 indexes created"));

    let second = dock_store(&db_path, &["bootstrap"]);
    assert!(second.status.success(), "stderr: {}", stderr(&second));
    assert!(String::from_utf8_lossy(&second.stdout).contains("0 containers and 0 indexes created"));
}

#[test]
fn test_strict_rerun_fails_with_one_line() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("store.db");
    assert!(dock_store(&db_path, &["bootstrap"]).status.success());

    let output = dock_store(&db_path, &["--strict-principals", "bootstrap"]);

    assert_eq!(output.status.code(), Some(1));
    let stderr = stderr(&output);
    let error_lines: Vec<&str> = stderr.lines().filter(|l| l.starts_with("error: ")).collect();
    assert_eq!(error_lines.len(), 1);
    assert!(error_lines[0].contains("already exists"));
    assert!(!stderr.contains(ADMIN_PASS));
}

#[test]
fn test_missing_secret_exits_one() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("store.db");

    let output = Command::new(env!("CARGO_BIN_EXE_dock-store"))
        .env_clear()
        .env("DOCK_STORE_PATH", &db_path)
        .env("DOCK_DB", APP_SCOPE)
        .env("DOCK_ADMIN_USER", ADMIN_USER)
        .arg("bootstrap")
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("error: admin secret must be specified"));
}

#[test]
fn test_reap_once_after_bootstrap() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("store.db");
    assert!(dock_store(&db_path, &["bootstrap"]).status.success());

    let output = dock_store(&db_path, &["reap", "--once"]);

    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert!(String::from_utf8_lossy(&output.stdout).contains("reaped 0 expired documents"));
}

#[test]
fn test_reap_once_needs_no_principals() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("store.db");
    assert!(dock_store(&db_path, &["bootstrap"]).status.success());

    let output = Command::new(env!("CARGO_BIN_EXE_dock-store"))
        .env_clear()
        .env("LOG_LEVEL", "warn")
        .env("DOCK_STORE_PATH", &db_path)
        .args(["reap", "--once"])
        .output()
        .unwrap();

    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert!(String::from_utf8_lossy(&output.stdout).contains("reaped 0 expired documents"));
}

#[test]
fn test_usage_error_is_one_line_and_exits_one() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("store.db");

    let output = dock_store(&db_path, &["--no-such-flag", "bootstrap"]);

    assert_eq!(output.status.code(), Some(1));
    let stderr = stderr(&output);
    let lines: Vec<&str> = stderr.lines().collect();
    assert_eq!(lines.len(), 1, "stderr: {}", stderr);
    assert!(lines[0].starts_with("error: "));
    assert!(lines[0].contains("--no-such-flag"));
}

#[test]
fn test_help_still_exits_zero() {
    let output = Command::new(env!("CARGO_BIN_EXE_dock-store"))
        .arg("--help")
        .output()
        .unwrap();

    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("bootstrap"));
}
