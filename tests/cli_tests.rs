/// End-to-end runs of the binary
///
/// Run with: cargo test --test cli_tests

use std::path::Path;
use std::process::{Command, Output};

fn binary() -> &'static Path {
    Path::new(env!("CARGO_BIN_EXE_concurrency-token-repro"))
}

fn run(args: &[&str]) -> Output {
    Command::new(binary())
        .args(args)
        .env_remove("CONCURRENCY_REPRO_CONNECTION")
        .env("RUST_LOG", "off")
        .output()
        .expect("failed to spawn binary")
}

#[test]
fn test_missing_connection_string_fails() {
    let output = run(&[]);

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("connection string required"),
        "unexpected stderr: {stderr}"
    );
}

#[test]
fn test_unsupported_connection_string_fails() {
    let output = run(&["mysql://localhost/db"]);
    assert!(!output.status.success());
}

#[test]
fn test_memory_run_reports_conflict() {
    let output = run(&["memory://cli", "--json"]);
    assert!(output.status.success());

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["policy"], "session-managed");
    assert_eq!(report["second_save"]["outcome"], "conflict");
    assert_eq!(report["lost_update"], false);
}

#[test]
fn test_memory_run_reproduces_lost_update() {
    let output = run(&["memory://cli", "--policy", "unchecked", "--json"]);
    assert!(output.status.success());

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["lost_update"], true);
}

#[test]
fn test_connection_string_from_environment() {
    let output = Command::new(binary())
        .env("CONCURRENCY_REPRO_CONNECTION", "memory://env")
        .env("RUST_LOG", "off")
        .output()
        .expect("failed to spawn binary");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("memory://env"));
    assert!(stdout.contains("conflict detected"));
}
