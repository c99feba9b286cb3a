//! Phase state machine: start, skip, run and end configuration phases.
//!
//! A phase moves `none -> running -> done`, or `none -> skip` when the
//! server starts it disabled. Only `reset` returns phases to `none`. A phase
//! in `running` is never restarted, so a repeated start command from the
//! server is harmless.

use std::path::PathBuf;

use anyhow::Result;
use tracing::{debug, error, info, instrument};

use crate::core::command::Enabled;
use crate::core::types::{NodeIdentity, Phase, PhaseStatus, TrackedPhase};
use crate::io::config::AgentConfig;
use crate::io::jobs::{JobRunner, JobSpec};
use crate::io::mount_gate::MountGate;
use crate::io::os::OsActions;
use crate::io::server::{ServerClient, VmodelAction};
use crate::io::state_store::{StateStore, Transition};
use crate::io::transport::Transport;

/// Result of [`PhaseMachine::start_phase`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// The share was not mounted; a mount was attempted and nothing else done.
    MountPending,
    /// The phase is already `running`.
    AlreadyRunning,
    /// The phase was started disabled and recorded as `skip`.
    Skipped,
    /// The phase is now `running`.
    Started(Phase),
}

impl StartOutcome {
    /// The phase the control loop should report afterwards.
    pub fn tracked(self) -> TrackedPhase {
        match self {
            StartOutcome::Started(phase) => TrackedPhase::Active(phase),
            _ => TrackedPhase::Idle,
        }
    }
}

/// Settings the machine takes from [`AgentConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseSettings {
    pub vmodel_url: Option<String>,
    pub staging_dir: PathBuf,
    pub callback_url: String,
}

impl PhaseSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            vmodel_url: config.vmodel_url(),
            staging_dir: config.paths.staging_dir.clone(),
            callback_url: config.completion_callback_url(),
        }
    }
}

pub struct PhaseMachine<'a, O: OsActions, J: JobRunner, T: Transport> {
    store: &'a StateStore,
    gate: MountGate<'a, O>,
    jobs: &'a J,
    server: ServerClient<'a, T>,
    callback_url: String,
    identity: Option<NodeIdentity>,
}

impl<'a, O: OsActions, J: JobRunner, T: Transport> PhaseMachine<'a, O, J, T> {
    pub fn new(
        store: &'a StateStore,
        gate: MountGate<'a, O>,
        jobs: &'a J,
        transport: &'a T,
        settings: PhaseSettings,
    ) -> Self {
        Self {
            store,
            gate,
            jobs,
            server: ServerClient::new(transport, settings.vmodel_url, settings.staging_dir),
            callback_url: settings.callback_url,
            identity: None,
        }
    }

    pub fn identity(&self) -> Option<&NodeIdentity> {
        self.identity.as_ref()
    }

    /// Cache `identity` unless a usable one is already known.
    ///
    /// The first identity with a UUID is kept for the life of the process.
    pub fn adopt_identity(&mut self, identity: NodeIdentity) {
        let known = self.identity.as_ref().is_some_and(|id| !id.uuid.is_empty());
        if !known {
            debug!(uuid = %identity.uuid, "node identity resolved");
            self.identity = Some(identity);
        }
    }

    pub fn status(&self, phase: Phase) -> Option<PhaseStatus> {
        self.store.get(phase)
    }

    #[instrument(skip_all, fields(%phase, ?enabled, files = files.len()))]
    pub fn start_phase(&self, phase: Phase, enabled: Enabled, files: &[String]) -> Result<StartOutcome> {
        if !self.gate.is_mounted() {
            info!("share not mounted, mounting before {phase} can start");
            self.gate.mount();
            return Ok(StartOutcome::MountPending);
        }

        if self.store.get(phase) == Some(PhaseStatus::Running) {
            debug!("{} is already running", phase.title());
            return Ok(StartOutcome::AlreadyRunning);
        }

        info!("Start {phase} with [{enabled:?}, {files:?}]");
        if enabled == Enabled::No {
            self.request_from_server(phase.as_str(), VmodelAction::Skip, None);
            if let Transition::Rejected(_) =
                self.store.transition(phase, not_running, PhaseStatus::Skip)?
            {
                debug!("{} was started concurrently", phase.title());
                return Ok(StartOutcome::AlreadyRunning);
            }
            return Ok(StartOutcome::Skipped);
        }

        self.request_from_server(phase.as_str(), VmodelAction::Start, None);
        if files.is_empty() {
            debug!("No file defined");
        }
        for file in files {
            self.request_from_server(phase.as_str(), VmodelAction::File, Some(file));
        }
        if let Transition::Rejected(_) =
            self.store.transition(phase, not_running, PhaseStatus::Running)?
        {
            debug!("{} was started concurrently", phase.title());
            return Ok(StartOutcome::AlreadyRunning);
        }

        match files.first() {
            Some(first) => {
                let job = JobSpec {
                    phase,
                    script: self.server.staging_dir().join(first),
                    callback_url: self.callback_url.clone(),
                };
                match self.jobs.run_detached(&job) {
                    Ok(true) => {}
                    Ok(false) => error!("{} script was not started", phase.title()),
                    Err(err) => error!(err = %format!("{err:#}"), "failed to start {phase} script"),
                }
            }
            None => error!("{} has no script to run; it stays running until reset", phase.title()),
        }
        Ok(StartOutcome::Started(phase))
    }

    pub fn end_phase(&self, phase: Phase) -> Result<String> {
        end_phase(self.store, phase)
    }

    /// Collect background jobs that have exited.
    pub fn reap_jobs(&self) -> usize {
        self.jobs.reap_exited()
    }

    /// Identity-scoped request to `{vmodel}/{target}/{action}`.
    pub fn request_from_server(
        &self,
        target: &str,
        action: VmodelAction,
        filename: Option<&str>,
    ) -> Option<String> {
        self.server
            .request(self.identity.as_ref(), target, action, filename)
    }

    pub fn reset_vmodel_state(&self) -> Result<()> {
        info!("resetting phase state");
        self.store.reset_all()
    }
}

fn not_running(status: Option<PhaseStatus>) -> bool {
    status != Some(PhaseStatus::Running)
}

/// Mark a `running` phase `done`; other statuses are left untouched.
pub fn end_phase(store: &StateStore, phase: Phase) -> Result<String> {
    let running = |status: Option<PhaseStatus>| status == Some(PhaseStatus::Running);
    match store.transition(phase, running, PhaseStatus::Done)? {
        Transition::Applied => {
            info!(%phase, "phase completed");
            Ok(format!("{} completed", phase.title()))
        }
        Transition::Rejected(_) | Transition::Unseeded => {
            debug!(%phase, "end requested for phase that is not running");
            Ok(format!("{} is not running", phase.title()))
        }
    }
}
