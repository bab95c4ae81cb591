//! Integration tests for the sandbox-deploy CLI.
//!
//! These tests run the actual executable and check output and exit codes.
//! None of them needs a container engine.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

// -----------------------------------------------------------------------------
// Test helpers
// -----------------------------------------------------------------------------

/// Creates a Command for the sandbox-deploy binary with a clean environment.
#[allow(deprecated)]
fn sandbox_deploy() -> Command {
    let mut cmd = Command::cargo_bin("sandbox-deploy").expect("failed to find binary");
    cmd.env_remove("SANDBOX_CONFIG")
        .env_remove("SANDBOX_LOG_DIR")
        .env_remove("RUST_LOG");
    cmd
}

/// Creates a Command running in a specific directory.
fn sandbox_deploy_in(dir: &TempDir) -> Command {
    let mut cmd = sandbox_deploy();
    cmd.current_dir(dir.path());
    cmd
}

// -----------------------------------------------------------------------------
// Help and version tests
// -----------------------------------------------------------------------------

#[test]
fn test_help_shows_all_commands() {
    sandbox_deploy()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("sandbox-deploy"))
        .stdout(predicate::str::contains("deploy"))
        .stdout(predicate::str::contains("clean"))
        .stdout(predicate::str::contains("config"));
}

#[test]
fn test_version_shows_version() {
    sandbox_deploy()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("sandbox-deploy"));
}

#[test]
fn test_deploy_help_shows_all_options() {
    sandbox_deploy()
        .args(["deploy", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--session"))
        .stdout(predicate::str::contains("--user"))
        .stdout(predicate::str::contains("--ttl"))
        .stdout(predicate::str::contains("--json"))
        .stdout(predicate::str::contains("--once"));
}

#[test]
fn test_global_logging_flags_in_help() {
    sandbox_deploy()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--verbose"))
        .stdout(predicate::str::contains("--json-logs"))
        .stdout(predicate::str::contains("--log-dir"));
}

// -----------------------------------------------------------------------------
// Config command tests
// -----------------------------------------------------------------------------

#[test]
fn test_config_shows_defaults() {
    let dir = TempDir::new().unwrap();

    sandbox_deploy_in(&dir)
        .env("XDG_CONFIG_HOME", dir.path().join("xdg"))
        .env("HOME", dir.path())
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("[ports]"))
        .stdout(predicate::str::contains("start = 9000"))
        .stdout(predicate::str::contains("[health]"))
        .stdout(predicate::str::contains("retries = 30"));
}

#[test]
fn test_config_reads_local_file() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("sandbox.toml"),
        "[ports]\nstart = 9100\nend = 9199\n\n[ttl]\nmax_minutes = 60\n",
    )
    .unwrap();

    sandbox_deploy_in(&dir)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("sandbox.toml"))
        .stdout(predicate::str::contains("start = 9100"))
        .stdout(predicate::str::contains("max_minutes = 60"));
}

#[test]
fn test_config_explicit_path() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("custom.toml");
    fs::write(&path, "[container]\nmemory = \"1g\"\n").unwrap();

    sandbox_deploy()
        .arg("--config")
        .arg(&path)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("custom.toml"))
        .stdout(predicate::str::contains("memory = \"1g\""));
}

#[test]
fn test_invalid_config_fails() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("sandbox.toml"),
        "[ports]\nstart = 9999\nend = 9000\n",
    )
    .unwrap();

    sandbox_deploy_in(&dir)
        .arg("config")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid"));
}

#[test]
fn test_malformed_config_fails() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("sandbox.toml"), "[ports\nstart = ").unwrap();

    sandbox_deploy_in(&dir)
        .arg("config")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to parse config file"));
}

// -----------------------------------------------------------------------------
// Deploy command tests
// -----------------------------------------------------------------------------

#[test]
fn test_deploy_missing_dir_fails() {
    let dir = TempDir::new().unwrap();

    sandbox_deploy_in(&dir)
        .args(["deploy", "does-not-exist", "--once"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Not a directory"));
}

#[test]
fn test_deploy_empty_dir_fails() {
    let dir = TempDir::new().unwrap();
    fs::create_dir(dir.path().join("app")).unwrap();

    sandbox_deploy_in(&dir)
        .args(["deploy", "app", "--once"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("No source files found"));
}

#[test]
fn test_deploy_requires_dir_argument() {
    sandbox_deploy().arg("deploy").assert().failure();
}

#[test]
fn test_log_dir_is_created() {
    let dir = TempDir::new().unwrap();
    let logs = dir.path().join("logs");

    sandbox_deploy_in(&dir)
        .arg("--log-dir")
        .arg(&logs)
        .arg("config")
        .assert()
        .success();

    assert!(logs.is_dir());
}
