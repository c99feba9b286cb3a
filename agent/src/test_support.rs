//! Test doubles for the agent's I/O seams and a temp-dir node fixture.

use std::collections::BTreeMap;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;

use crate::core::types::{NodeIdentity, Phase, TrackedPhase};
use crate::io::config::{AgentConfig, PathsConfig};
use crate::io::facts::{FactMap, FactSource};
use crate::io::jobs::{JobRunner, JobSpec};
use crate::io::os::OsActions;
use crate::io::process::CommandOutput;
use crate::io::registration::Registrar;
use crate::io::state_store::StateStore;
use crate::io::transport::Transport;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A node's persisted files in a temp dir, with every phase seeded.
pub struct TestNode {
    temp: TempDir,
    store: StateStore,
}

impl TestNode {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create temp dir")?;
        std::fs::create_dir_all(temp.path().join("staging")).context("create staging dir")?;
        let store = StateStore::new(temp.path().join("vmodel_state.json"));
        store.seed(&Phase::ALL)?;
        Ok(Self { temp, store })
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// A second handle on the same state file.
    pub fn open_store(&self) -> StateStore {
        StateStore::new(self.store.path())
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root().join("staging")
    }

    /// Config pointing every path into this node's temp dir.
    pub fn config(&self, mk_uri: Option<&str>) -> AgentConfig {
        AgentConfig {
            mk_uri: mk_uri.map(str::to_string),
            mk_nfs_server_ip: Some("10.0.0.2".to_string()),
            mk_checkin_skew: 0,
            privileged_prefix: Vec::new(),
            paths: PathsConfig {
                state_file: self.store.path().to_path_buf(),
                first_checkin_file: self.root().join("first_checkin.json"),
                staging_dir: self.staging_dir(),
                facts_file: self.root().join("prev_facts.json"),
            },
            ..AgentConfig::default()
        }
    }

    pub fn identity() -> NodeIdentity {
        NodeIdentity {
            mac_id: vec!["525400abcd01".to_string()],
            uuid: "4C4C4544-0042-3510-8057-B4C04F335931".to_string(),
        }
    }
}

/// Calls recorded by [`FakeOs`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OsCall {
    Reboot,
    Poweroff,
    Mount { source: String, mount_point: PathBuf },
    Unmount { mount_point: PathBuf },
    RunScript { script: PathBuf },
}

#[derive(Debug)]
struct FakeOsState {
    calls: Vec<OsCall>,
    /// `None` makes the mount table unreadable.
    mount_table: Option<String>,
    unmount_fails: bool,
    script_exit: i32,
    script_stderr: String,
}

/// Recording [`OsActions`]; never touches the host.
#[derive(Debug)]
pub struct FakeOs {
    state: Mutex<FakeOsState>,
}

impl Default for FakeOs {
    fn default() -> Self {
        Self {
            state: Mutex::new(FakeOsState {
                calls: Vec::new(),
                mount_table: Some(String::new()),
                unmount_fails: false,
                script_exit: 0,
                script_stderr: String::new(),
            }),
        }
    }
}

impl FakeOs {
    /// A host whose mount table already holds the share from `server_ip`.
    pub fn mounted(server_ip: &str) -> Self {
        let os = Self::default();
        os.set_mount_table(&format!("{server_ip}:/nfs /nfs nfs rw,nolock 0 0\n"));
        os
    }

    pub fn calls(&self) -> Vec<OsCall> {
        lock(&self.state).calls.clone()
    }

    pub fn set_mount_table(&self, table: &str) {
        lock(&self.state).mount_table = Some(table.to_string());
    }

    pub fn fail_mount_table(&self) {
        lock(&self.state).mount_table = None;
    }

    pub fn fail_unmount(&self) {
        lock(&self.state).unmount_fails = true;
    }

    pub fn set_script_exit(&self, code: i32, stderr: &str) {
        let mut state = lock(&self.state);
        state.script_exit = code;
        state.script_stderr = stderr.to_string();
    }

    fn record(&self, call: OsCall) {
        lock(&self.state).calls.push(call);
    }
}

impl OsActions for FakeOs {
    fn reboot(&self) -> Result<()> {
        self.record(OsCall::Reboot);
        Ok(())
    }

    fn poweroff(&self) -> Result<()> {
        self.record(OsCall::Poweroff);
        Ok(())
    }

    fn mount_share(&self, source: &str, mount_point: &Path) -> Result<()> {
        self.record(OsCall::Mount {
            source: source.to_string(),
            mount_point: mount_point.to_path_buf(),
        });
        Ok(())
    }

    fn unmount_share(&self, mount_point: &Path) -> Result<()> {
        self.record(OsCall::Unmount {
            mount_point: mount_point.to_path_buf(),
        });
        if lock(&self.state).unmount_fails {
            return Err(anyhow!("umount: target is busy"));
        }
        Ok(())
    }

    fn mount_table(&self) -> Result<String> {
        lock(&self.state)
            .mount_table
            .clone()
            .ok_or_else(|| anyhow!("mount table unavailable"))
    }

    fn run_script(&self, script: &Path) -> Result<CommandOutput> {
        self.record(OsCall::RunScript {
            script: script.to_path_buf(),
        });
        let state = lock(&self.state);
        Ok(CommandOutput {
            status: ExitStatus::from_raw(state.script_exit << 8),
            stdout: b"done\n".to_vec(),
            stderr: state.script_stderr.as_bytes().to_vec(),
            stdout_truncated: 0,
            stderr_truncated: 0,
            timed_out: false,
            duration: Duration::from_millis(5),
        })
    }
}

/// Requests recorded by [`FakeTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Get {
        url: String,
        query: Vec<(String, String)>,
    },
    PostForm {
        url: String,
        fields: Vec<(String, String)>,
    },
    PostJson {
        url: String,
        content_type: String,
        body: String,
    },
}

impl Request {
    pub fn url(&self) -> &str {
        match self {
            Request::Get { url, .. } | Request::PostForm { url, .. } | Request::PostJson { url, .. } => url,
        }
    }

    /// Value of a query parameter on a GET.
    pub fn query_param(&self, key: &str) -> Option<&str> {
        match self {
            Request::Get { query, .. } => query
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
enum Reply {
    Body(Vec<u8>),
    Fail,
}

/// Scripted [`Transport`].
///
/// Each rule matches URLs containing its pattern; the most recently added
/// matching rule wins. Unmatched requests succeed with an empty body.
#[derive(Debug, Default)]
pub struct FakeTransport {
    rules: Mutex<Vec<(String, Reply)>>,
    requests: Mutex<Vec<Request>>,
}

impl FakeTransport {
    pub fn respond(&self, pattern: &str, body: &str) {
        lock(&self.rules).push((pattern.to_string(), Reply::Body(body.as_bytes().to_vec())));
    }

    pub fn fail(&self, pattern: &str) {
        lock(&self.rules).push((pattern.to_string(), Reply::Fail));
    }

    pub fn requests(&self) -> Vec<Request> {
        lock(&self.requests).clone()
    }

    pub fn clear_requests(&self) {
        lock(&self.requests).clear();
    }

    fn reply(&self, request: Request) -> Result<Vec<u8>> {
        let url = request.url().to_string();
        lock(&self.requests).push(request);
        let rules = lock(&self.rules);
        match rules.iter().rev().find(|(pattern, _)| url.contains(pattern.as_str())) {
            Some((_, Reply::Body(body))) => Ok(body.clone()),
            Some((_, Reply::Fail)) => Err(anyhow!("connection refused: {url}")),
            None => Ok(Vec::new()),
        }
    }
}

fn owned_pairs(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

impl Transport for FakeTransport {
    fn get(&self, url: &str, query: &[(&str, &str)]) -> Result<Vec<u8>> {
        self.reply(Request::Get {
            url: url.to_string(),
            query: owned_pairs(query),
        })
    }

    fn post_form(&self, url: &str, fields: &[(&str, &str)]) -> Result<String> {
        let body = self.reply(Request::PostForm {
            url: url.to_string(),
            fields: owned_pairs(fields),
        })?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    fn post_json(&self, url: &str, content_type: &str, body: &str) -> Result<String> {
        let reply = self.reply(Request::PostJson {
            url: url.to_string(),
            content_type: content_type.to_string(),
            body: body.to_string(),
        })?;
        Ok(String::from_utf8_lossy(&reply).into_owned())
    }
}

/// Recording [`JobRunner`]; reports a job as started only if its script exists.
#[derive(Debug, Default)]
pub struct RecordingJobRunner {
    spawned: Mutex<Vec<JobSpec>>,
    reap_calls: Mutex<usize>,
}

impl RecordingJobRunner {
    pub fn spawned(&self) -> Vec<JobSpec> {
        lock(&self.spawned).clone()
    }

    pub fn reap_calls(&self) -> usize {
        *lock(&self.reap_calls)
    }
}

impl JobRunner for RecordingJobRunner {
    fn run_detached(&self, job: &JobSpec) -> Result<bool> {
        if !job.script.is_file() {
            return Ok(false);
        }
        lock(&self.spawned).push(job.clone());
        Ok(true)
    }

    fn reap_exited(&self) -> usize {
        *lock(&self.reap_calls) += 1;
        0
    }
}

/// Fixed [`FactSource`].
#[derive(Debug)]
pub struct StaticFacts {
    identity: NodeIdentity,
    facts: FactMap,
    last_saved: Mutex<Option<SystemTime>>,
}

impl StaticFacts {
    pub fn new(uuid: &str, mac_id: &[&str]) -> Self {
        Self {
            identity: NodeIdentity {
                mac_id: mac_id.iter().map(|m| m.to_string()).collect(),
                uuid: uuid.to_string(),
            },
            facts: BTreeMap::new(),
            last_saved: Mutex::new(None),
        }
    }

    pub fn for_identity(identity: NodeIdentity) -> Self {
        Self {
            identity,
            facts: BTreeMap::new(),
            last_saved: Mutex::new(None),
        }
    }

    pub fn with_fact(mut self, key: &str, value: &str) -> Self {
        self.facts.insert(key.to_string(), value.to_string());
        self
    }

    pub fn set_last_saved(&self, at: Option<SystemTime>) {
        *lock(&self.last_saved) = at;
    }
}

impl FactSource for StaticFacts {
    fn identity(&self) -> NodeIdentity {
        self.identity.clone()
    }

    fn collect(&self) -> Result<FactMap> {
        Ok(self.facts.clone())
    }

    fn last_saved(&self) -> Option<SystemTime> {
        *lock(&self.last_saved)
    }
}

/// Calls recorded by [`RecordingRegistrar`], with the `last_state` passed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrarCall {
    Register(TrackedPhase),
    IfChanged(TrackedPhase),
}

/// Recording [`Registrar`] that accepts every registration unless told not to.
#[derive(Debug)]
pub struct RecordingRegistrar {
    accept: bool,
    calls: Mutex<Vec<RegistrarCall>>,
}

impl Default for RecordingRegistrar {
    fn default() -> Self {
        Self {
            accept: true,
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl RecordingRegistrar {
    pub fn rejecting() -> Self {
        Self {
            accept: false,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<RegistrarCall> {
        lock(&self.calls).clone()
    }
}

impl Registrar for RecordingRegistrar {
    fn register_node(&self, last_state: TrackedPhase) -> Result<bool> {
        lock(&self.calls).push(RegistrarCall::Register(last_state));
        Ok(self.accept)
    }

    fn register_if_changed(&self, last_state: TrackedPhase) -> Result<bool> {
        lock(&self.calls).push(RegistrarCall::IfChanged(last_state));
        Ok(false)
    }
}
