//! CLI tests for `mk-agent state` and config handling.
//!
//! Spawns the agent binary against a config whose paths point into a temp
//! dir and checks output and exit codes.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use mk_agent::core::types::{Phase, PhaseStatus};
use mk_agent::exit_codes;
use mk_agent::io::config::write_config;
use mk_agent::io::state_store::StateStore;
use mk_agent::test_support::TestNode;

fn agent(config: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_mk-agent"))
        .arg("--config")
        .arg(config)
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("run mk-agent")
}

fn fresh_node() -> (TestNode, std::path::PathBuf) {
    let node = TestNode::new().expect("node");
    let config_path = node.root().join("mk_conf.toml");
    let mut config = node.config(None);
    config.paths.state_file = node.root().join("cli_state.json");
    write_config(&config_path, &config).expect("write config");
    (node, config_path)
}

#[test]
fn seed_then_show_lists_every_phase() {
    let (_node, config) = fresh_node();

    let seeded = agent(&config, &["state", "seed"]);
    assert_eq!(seeded.status.code(), Some(exit_codes::OK));

    let shown = agent(&config, &["state", "show"]);
    assert_eq!(shown.status.code(), Some(exit_codes::OK));
    let stdout = String::from_utf8_lossy(&shown.stdout);
    assert_eq!(
        stdout,
        "bios: none\nbmc: none\nfirmware: none\nilo: none\nraid: none\n"
    );
}

#[test]
fn reset_clears_recorded_statuses() {
    let (node, config) = fresh_node();
    let store = StateStore::new(node.root().join("cli_state.json"));
    store.seed(&Phase::ALL).expect("seed");
    store.set(Phase::Raid, PhaseStatus::Running).expect("set");

    let shown = agent(&config, &["state", "show"]);
    assert!(String::from_utf8_lossy(&shown.stdout).contains("raid: running"));

    let reset = agent(&config, &["state", "reset"]);
    assert_eq!(reset.status.code(), Some(exit_codes::OK));
    assert_eq!(store.get(Phase::Raid), None);
}

#[test]
fn invalid_config_exits_with_invalid_code() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = temp.path().join("mk_conf.toml");
    fs::write(&config, "mk_checkin_interval = 0\n").expect("write");

    let output = agent(&config, &["state", "show"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("mk_checkin_interval"));
}
