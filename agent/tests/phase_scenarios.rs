//! Phase lifecycle end to end: start, background completion, failure, reset.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use mk_agent::core::command::Enabled;
use mk_agent::core::types::{Phase, PhaseStatus};
use mk_agent::io::config::{AgentConfig, write_config};
use mk_agent::io::jobs::{DetachedJobRunner, JobRunner, JobSpec, execute_job};
use mk_agent::io::mount_gate::MountGate;
use mk_agent::io::transport::{Transport, UreqTransport};
use mk_agent::phases::{PhaseMachine, PhaseSettings, StartOutcome};
use mk_agent::signals::LoopSignals;
use mk_agent::test_support::{FakeOs, FakeTransport, RecordingJobRunner, TestNode};
use mk_agent::web::{self, ControlState};

const VMODEL: &str = "http://hanlon:8026/hanlon/api/v1/vmodel";

fn settings(node: &TestNode) -> PhaseSettings {
    PhaseSettings {
        vmodel_url: Some(VMODEL.to_string()),
        staging_dir: node.staging_dir(),
        callback_url: "http://127.0.0.1:2156/vmodel".to_string(),
    }
}

fn files(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| name.to_string()).collect()
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(50));
    }
    done()
}

fn control_endpoint(node: &TestNode, config_path: &Path) -> web::ControlServer {
    let signals = LoopSignals::new();
    let state = ControlState::new(
        Arc::new(node.open_store()),
        config_path,
        AgentConfig::default(),
        signals.sender(),
    );
    web::spawn("127.0.0.1:0", state).expect("spawn control endpoint")
}

/// Stage `script`, write the node's config, and start the real `run-job` binary.
fn run_real_job(node: &TestNode, script: &str, log_file: &Path) -> web::ControlServer {
    let config_path = node.root().join("mk_conf.toml");
    write_config(&config_path, &node.config(None)).expect("write config");
    let server = control_endpoint(node, &config_path);

    let staged = node.staging_dir().join("setup.sh");
    fs::write(&staged, script).expect("stage script");
    let runner = DetachedJobRunner::new(
        env!("CARGO_BIN_EXE_mk-agent"),
        &config_path,
        Some(log_file.to_path_buf()),
    );
    let job = JobSpec {
        phase: Phase::Raid,
        script: staged,
        callback_url: format!("http://{}/vmodel", server.addr),
    };
    assert!(runner.run_detached(&job).expect("run detached"));
    server
}

#[test]
fn start_with_mount_present_runs_first_script() {
    let node = TestNode::new().expect("node");
    let os = FakeOs::mounted("10.0.0.2");
    let jobs = RecordingJobRunner::default();
    let transport = FakeTransport::default();
    transport.respond("/bios/file", "#!/bin/sh\necho bios\n");

    let gate = MountGate::new(&os, Some("10.0.0.2".to_string()), "/nfs", "/nfs");
    let mut machine = PhaseMachine::new(node.store(), gate, &jobs, &transport, settings(&node));
    machine.adopt_identity(TestNode::identity());

    let outcome = machine
        .start_phase(Phase::Bios, Enabled::from_param(Some(&"true".into())), &files(&["setup.sh"]))
        .expect("start");

    assert_eq!(outcome, StartOutcome::Started(Phase::Bios));
    assert_eq!(node.store().get(Phase::Bios), Some(PhaseStatus::Running));
    let spawned = jobs.spawned();
    assert_eq!(spawned.len(), 1);
    assert_eq!(spawned[0].script, node.staging_dir().join("setup.sh"));

    let requests = transport.requests();
    let urls: Vec<String> = requests
        .iter()
        .map(|request| request.url().to_string())
        .collect();
    assert_eq!(
        urls,
        [format!("{VMODEL}/bios/start"), format!("{VMODEL}/bios/file")]
    );
    assert_eq!(requests[1].query_param("name"), Some("setup"));
}

#[test]
fn repeated_start_sends_nothing_more() {
    let node = TestNode::new().expect("node");
    let os = FakeOs::mounted("10.0.0.2");
    let jobs = RecordingJobRunner::default();
    let transport = FakeTransport::default();
    transport.respond("/raid/file", "#!/bin/sh\n");

    let gate = MountGate::new(&os, Some("10.0.0.2".to_string()), "/nfs", "/nfs");
    let mut machine = PhaseMachine::new(node.store(), gate, &jobs, &transport, settings(&node));
    machine.adopt_identity(TestNode::identity());

    let first = machine
        .start_phase(Phase::Raid, Enabled::Yes, &files(&["setup.sh"]))
        .expect("first");
    let sent = transport.requests().len();
    let second = machine
        .start_phase(Phase::Raid, Enabled::Yes, &files(&["setup.sh"]))
        .expect("second");

    assert_eq!(first, StartOutcome::Started(Phase::Raid));
    assert_eq!(second, StartOutcome::AlreadyRunning);
    assert_eq!(transport.requests().len(), sent);
    assert_eq!(jobs.spawned().len(), 1);
}

#[test]
fn disabled_start_skips_regardless_of_files() {
    for names in [&[][..], &["setup.sh"][..], &["a.sh", "b.sh"][..]] {
        let node = TestNode::new().expect("node");
        let os = FakeOs::mounted("10.0.0.2");
        let jobs = RecordingJobRunner::default();
        let transport = FakeTransport::default();

        let gate = MountGate::new(&os, Some("10.0.0.2".to_string()), "/nfs", "/nfs");
        let mut machine = PhaseMachine::new(node.store(), gate, &jobs, &transport, settings(&node));
        machine.adopt_identity(TestNode::identity());

        let disabled = Enabled::from_param(Some(&serde_json::Value::Bool(false)));
        let outcome = machine
            .start_phase(Phase::Bmc, disabled, &files(names))
            .expect("start");
        assert_eq!(outcome, StartOutcome::Skipped);
        assert_eq!(node.store().get(Phase::Bmc), Some(PhaseStatus::Skip));
        assert!(jobs.spawned().is_empty());
    }
}

#[test]
fn successful_job_callback_completes_phase_through_control_endpoint() {
    let node = TestNode::new().expect("node");
    node.store().set(Phase::Raid, PhaseStatus::Running).expect("set");
    let signals = LoopSignals::new();
    let state = ControlState::new(
        Arc::new(node.open_store()),
        node.root().join("mk_conf.toml"),
        AgentConfig::default(),
        signals.sender(),
    );
    let server = web::spawn("127.0.0.1:0", state).expect("spawn control endpoint");
    let callback_url = format!("http://{}/vmodel", server.addr);

    let os = FakeOs::default();
    let transport = UreqTransport::new(Duration::from_secs(5));
    let job = JobSpec {
        phase: Phase::Raid,
        script: node.staging_dir().join("setup.sh"),
        callback_url: callback_url.clone(),
    };
    let report = execute_job(&os, &transport, &job);

    assert!(report.succeeded());
    assert!(report.callback_sent);
    assert_eq!(node.store().get(Phase::Raid), Some(PhaseStatus::Done));

    let again = transport
        .post_form(&callback_url, &[("phase", "raid"), ("action", "end")])
        .expect("second callback");
    assert_eq!(again, "Raid is not running");
    assert_eq!(node.store().get(Phase::Raid), Some(PhaseStatus::Done));
}

#[test]
fn control_endpoint_reports_completion_message() {
    let node = TestNode::new().expect("node");
    node.store().set(Phase::Bios, PhaseStatus::Running).expect("set");
    let signals = LoopSignals::new();
    let state = ControlState::new(
        Arc::new(node.open_store()),
        node.root().join("mk_conf.toml"),
        AgentConfig::default(),
        signals.sender(),
    );
    let server = web::spawn("127.0.0.1:0", state).expect("spawn control endpoint");
    let transport = UreqTransport::new(Duration::from_secs(5));

    let reply = transport
        .post_form(
            &format!("http://{}/vmodel", server.addr),
            &[("phase", "bios"), ("action", "end")],
        )
        .expect("callback");
    assert_eq!(reply, "Bios completed");

    let health = transport
        .get(&format!("http://{}/health", server.addr), &[])
        .expect("health");
    assert_eq!(health, b"ok");
}

#[test]
fn failed_job_leaves_phase_running_until_reset() {
    let node = TestNode::new().expect("node");
    let store = node.store();
    store.set(Phase::Raid, PhaseStatus::Running).expect("set");

    let os = FakeOs::default();
    os.set_script_exit(2, "controller not found");
    let transport = FakeTransport::default();
    let job = JobSpec {
        phase: Phase::Raid,
        script: node.staging_dir().join("setup.sh"),
        callback_url: "http://127.0.0.1:2156/vmodel".to_string(),
    };
    let report = execute_job(&os, &transport, &job);

    assert_eq!(report.exit_code, Some(2));
    assert!(report.stderr.starts_with("Error Code: 2"));
    assert!(transport.requests().is_empty());
    assert_eq!(store.get(Phase::Raid), Some(PhaseStatus::Running));

    let jobs = RecordingJobRunner::default();
    let gate = MountGate::new(&os, Some("10.0.0.2".to_string()), "/nfs", "/nfs");
    let machine = PhaseMachine::new(store, gate, &jobs, &transport, settings(&node));
    machine.reset_vmodel_state().expect("reset");
    assert_eq!(store.get(Phase::Raid), None);
}

#[test]
fn detached_job_exiting_zero_marks_phase_done() {
    let node = TestNode::new().expect("node");
    node.store().set(Phase::Raid, PhaseStatus::Running).expect("set");
    let log_file = node.root().join("mk.log");

    let _server = run_real_job(&node, "echo configuring raid\nexit 0\n", &log_file);

    let done = wait_until(Duration::from_secs(10), || {
        node.store().get(Phase::Raid) == Some(PhaseStatus::Done)
    });
    let log = fs::read_to_string(&log_file).unwrap_or_default();
    assert!(done, "raid never reached done; job log:\n{log}");
}

#[test]
fn detached_job_exiting_nonzero_leaves_phase_running() {
    let node = TestNode::new().expect("node");
    node.store().set(Phase::Raid, PhaseStatus::Running).expect("set");
    let log_file = node.root().join("mk.log");

    let _server = run_real_job(&node, "echo controller not found >&2\nexit 1\n", &log_file);

    let reported = wait_until(Duration::from_secs(10), || {
        fs::read_to_string(&log_file).is_ok_and(|log| log.contains("Raid script failed"))
    });
    let log = fs::read_to_string(&log_file).unwrap_or_default();
    assert!(reported, "job never reported its failure; job log:\n{log}");
    assert!(log.contains("Error Code: 1"), "job log:\n{log}");
    assert_eq!(node.store().get(Phase::Raid), Some(PhaseStatus::Running));
}
