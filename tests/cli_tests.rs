//! CLI integration tests
//!
//! Tests the command-line interface using assert_cmd

mod common;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn gossip_cmd() -> Command {
    let mut cmd = Command::cargo_bin("gossip-consensus").unwrap();
    // Keep a developer's own config out of the tests
    cmd.env("HOME", env!("CARGO_TARGET_TMPDIR"))
        .env("XDG_CONFIG_HOME", env!("CARGO_TARGET_TMPDIR"))
        .env_remove("GOSSIP_CONFIG");
    cmd
}

// ─────────────────────────────────────────────────────────────────
// Help and Version Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_help_flag() {
    gossip_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("master"))
        .stdout(predicate::str::contains("agent"))
        .stdout(predicate::str::contains("config"))
        .stdout(predicate::str::contains("version"));
}

#[test]
fn test_version_command() {
    gossip_cmd()
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains("gossip-consensus"))
        .stdout(predicate::str::contains("Protocol:"))
        .stdout(predicate::str::contains("Target:"));
}

#[test]
fn test_short_version_flag() {
    gossip_cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("gossip-consensus"));
}

#[test]
fn test_agent_help_lists_flags() {
    gossip_cmd()
        .args(["agent", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--token"))
        .stdout(predicate::str::contains("--total-agents"))
        .stdout(predicate::str::contains("--leader"))
        .stdout(predicate::str::contains("--epsilon"));
}

#[test]
fn test_master_help_lists_flags() {
    gossip_cmd()
        .args(["master", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--bind"))
        .stdout(predicate::str::contains("--topology"))
        .stdout(predicate::str::contains("--stats"));
}

// ─────────────────────────────────────────────────────────────────
// Config Command Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_config_show_default() {
    gossip_cmd()
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[master]"))
        .stdout(predicate::str::contains("[agent]"))
        .stdout(predicate::str::contains("round_cap = 2000"));
}

#[test]
fn test_config_show_fixture() {
    gossip_cmd()
        .args(["config", "show", "--config"])
        .arg(common::valid_config_fixture())
        .assert()
        .success()
        .stdout(predicate::str::contains("token = 1"))
        .stdout(predicate::str::contains("level = \"debug\""));
}

#[test]
fn test_config_validate_invalid_fixture() {
    gossip_cmd()
        .args(["config", "validate", "--config"])
        .arg(common::invalid_config_fixture())
        .assert()
        .code(10)
        .stderr(predicate::str::contains("E102"));
}

#[test]
fn test_config_validate_nonexistent_file() {
    gossip_cmd()
        .args(["config", "validate", "--config", "/nonexistent/gossip.toml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found").or(predicate::str::contains("E100")));
}

#[test]
fn test_config_init_writes_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("gossip.toml");

    gossip_cmd()
        .args(["config", "init", "--path"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration written"));
    assert!(path.exists());

    gossip_cmd()
        .args(["config", "validate", "--config"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid."));

    // Refuses to overwrite without --force
    gossip_cmd().args(["config", "init", "--path"]).arg(&path).assert().failure();
}

// ─────────────────────────────────────────────────────────────────
// Master and Agent Startup Errors
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_master_missing_topology() {
    gossip_cmd()
        .args(["-q", "master", "--bind", "127.0.0.1:0", "--topology", "/nonexistent/ring.txt"])
        .assert()
        .code(10)
        .stderr(predicate::str::contains("E100"));
}

#[test]
fn test_master_malformed_topology() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bad.txt");
    std::fs::write(&path, "0 1\n1 two\n").unwrap();

    gossip_cmd()
        .args(["-q", "master", "--bind", "127.0.0.1:0", "--topology"])
        .arg(&path)
        .assert()
        .code(10)
        .stderr(predicate::str::contains("line 2"));
}

#[test]
fn test_agent_requires_token() {
    gossip_cmd()
        .args(["-q", "agent", "--master", "127.0.0.1:7000"])
        .assert()
        .code(10)
        .stderr(predicate::str::contains("agent.token").or(predicate::str::contains("token")));
}

#[test]
fn test_agent_rejects_bad_epsilon() {
    gossip_cmd()
        .args(["-q", "agent", "--token", "0", "--epsilon", "0"])
        .assert()
        .code(10);
}

// ─────────────────────────────────────────────────────────────────
// Argument Errors
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_unknown_command() {
    gossip_cmd()
        .arg("unknown-command")
        .assert()
        .failure()
        .stderr(predicate::str::contains("error"));
}

#[test]
fn test_missing_subcommand() {
    gossip_cmd().assert().failure().stderr(predicate::str::contains("Usage"));
}
