//! Configuration system tests
//!
//! Tests configuration loading, validation, and conversion into runtime settings

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use tempfile::TempDir;

use gossip_consensus::config::ConsensusConfig;
use gossip_consensus::Error;

/// Test fixture for configuration testing
struct ConfigFixture {
    _temp_dir: TempDir,
    config_path: PathBuf,
}

impl ConfigFixture {
    fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        Self {
            _temp_dir: temp_dir,
            config_path,
        }
    }

    fn write_config(&self, content: &str) {
        fs::write(&self.config_path, content).unwrap();
    }

    fn path(&self) -> &str {
        self.config_path.to_str().unwrap()
    }

    fn validate_cmd(&self) -> assert_cmd::assert::Assert {
        assert_cmd::Command::cargo_bin("gossip-consensus")
            .unwrap()
            .args(["config", "validate", "--config"])
            .arg(self.path())
            .assert()
    }
}

// ─────────────────────────────────────────────────────────────────
// Valid Configuration Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_empty_config_uses_defaults() {
    let fixture = ConfigFixture::new();
    fixture.write_config("");

    let config = ConsensusConfig::load(Some(fixture.path())).unwrap();
    assert_eq!(config, ConsensusConfig::default());
    fixture.validate_cmd().success();
}

#[test]
fn test_full_config() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[master]
bind = "0.0.0.0:7000"
topology = "/srv/topologies/grid.txt"
register_timeout_ms = 5000

[agent]
token = 7
listen = "0.0.0.0:7107"
advertise = "10.1.0.7:7107"
master = "10.1.0.1:7000"
total_agents = 16
leader = true
epsilon = 0.001
round_cap = 500
max_poison_retries = 1

[network]
connect_timeout_ms = 2000
handshake_timeout_ms = 3000
initial_reconnect_delay_ms = 50
max_reconnect_delay_ms = 1000
max_reconnect_attempts = 10
max_frame_bytes = 1048576
inbound_queue = 64

[telemetry]
stats_file = "/tmp/gossip-stats.jsonl"
stale_bucket_secs = 120
queue_size = 32

[trainer]
epochs = 2
dataset_size = 1600
batch_size = 10
dimension = 32
learning_rate = 0.05
noise = 0.0
seed = 1
telemetry_every = 5

[logging]
level = "debug"
file = "/tmp/gossip.log"
max_files = 3
json_format = true
"#,
    );

    let config = ConsensusConfig::load(Some(fixture.path())).unwrap();
    assert_eq!(config.master.register_timeout_ms, 5000);
    assert_eq!(config.telemetry.queue_size, 32);
    assert_eq!(config.stale_after(), Some(Duration::from_secs(120)));

    let master = config.master_config();
    assert_eq!(master.register_timeout, Duration::from_secs(5));
    assert_eq!(master.max_frame_bytes, 1_048_576);
    assert_eq!(master.telemetry_queue, 32);

    let agent = config.agent_config().unwrap();
    assert_eq!(agent.token, 7);
    assert_eq!(agent.listen.port(), 7107);
    assert_eq!(agent.advertise, Some("10.1.0.7:7107".parse().unwrap()));
    assert_eq!(agent.max_reconnect_attempts, 10);
    assert_eq!(agent.engine.round_cap, 500);
    assert_eq!(agent.engine.max_poison_retries, 1);
    assert_eq!(agent.mesh.handshake_timeout, Duration::from_secs(3));
    assert_eq!(agent.mesh.inbound_queue, 64);

    fixture.validate_cmd().success();
}

// ─────────────────────────────────────────────────────────────────
// Invalid Configuration Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_invalid_epsilon() {
    let fixture = ConfigFixture::new();
    fixture.write_config("[agent]\nepsilon = 0.0\n");

    assert!(matches!(
        ConsensusConfig::load(Some(fixture.path())),
        Err(Error::ConfigValidation { .. })
    ));
    fixture.validate_cmd().failure();
}

#[test]
fn test_invalid_log_level() {
    let fixture = ConfigFixture::new();
    fixture.write_config("[logging]\nlevel = \"invalid_level\"\n");

    fixture.validate_cmd().failure();
}

#[test]
fn test_wrong_field_type() {
    let fixture = ConfigFixture::new();
    fixture.write_config("[agent]\ntoken = \"three\"\n");

    assert!(matches!(
        ConsensusConfig::load(Some(fixture.path())),
        Err(Error::ConfigParse { .. })
    ));
}

#[test]
fn test_malformed_toml() {
    let fixture = ConfigFixture::new();
    fixture.write_config("[master\nbind = \"127.0.0.1:7000\"\n");

    fixture.validate_cmd().failure();
}

#[test]
fn test_unresolvable_agent_address() {
    let fixture = ConfigFixture::new();
    fixture.write_config("[agent]\ntoken = 1\nmaster = \"not an address\"\n");

    let config = ConsensusConfig::load(Some(fixture.path())).unwrap();
    match config.agent_config() {
        Err(Error::ConfigValidation { field, .. }) => assert_eq!(field.as_deref(), Some("agent.master")),
        other => panic!("expected validation error, got {:?}", other.map(|c| c.token)),
    }
}

// ─────────────────────────────────────────────────────────────────
// Config Show Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_config_show_custom() {
    let fixture = ConfigFixture::new();
    fixture.write_config("[agent]\ntoken = 9\nleader = true\n");

    assert_cmd::Command::cargo_bin("gossip-consensus")
        .unwrap()
        .args(["config", "show", "--config"])
        .arg(fixture.path())
        .assert()
        .success()
        .stdout(predicates::str::contains("token = 9"))
        .stdout(predicates::str::contains("leader = true"));
}
