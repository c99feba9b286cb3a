//! Periodic checkin with the provisioning server and command dispatch.
//!
//! Each iteration checks in, dispatches the returned command, looks for
//! changed facts, then sleeps until the next interval. Errors end only the
//! current iteration; the loop itself stops only on a [`LoopSignal`].

use std::time::{Instant, SystemTime};

use anyhow::{Context, Result};
use rand::Rng;
use tracing::{debug, error, info, instrument, warn};

use crate::core::command::{CheckinReply, Command};
use crate::core::timing::{remaining_sleep, startup_skew};
use crate::core::types::{PhaseStatus, TrackedPhase};
use crate::io::config::AgentConfig;
use crate::io::facts::FactSource;
use crate::io::first_checkin::FirstCheckinFlag;
use crate::io::jobs::JobRunner;
use crate::io::os::OsActions;
use crate::io::registration::Registrar;
use crate::io::server::VmodelAction;
use crate::io::transport::Transport;
use crate::phases::{PhaseMachine, StartOutcome};
use crate::signals::{LoopSignal, LoopSignals};

/// Why [`ControlLoop::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    Shutdown,
    Restart,
}

impl From<LoopSignal> for LoopExit {
    fn from(signal: LoopSignal) -> Self {
        match signal {
            LoopSignal::Shutdown => LoopExit::Shutdown,
            LoopSignal::Restart => LoopExit::Restart,
        }
    }
}

/// What one iteration did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Iteration {
    /// No server configured.
    Offline,
    /// The server answered with a non-zero `errcode`.
    CheckinRejected,
    Handled(Command),
}

pub struct ControlLoop<'a, O: OsActions, J: JobRunner, T: Transport> {
    config: &'a AgentConfig,
    machine: PhaseMachine<'a, O, J, T>,
    os: &'a O,
    transport: &'a T,
    facts: &'a dyn FactSource,
    registrar: Option<&'a dyn Registrar>,
    first_checkin: FirstCheckinFlag,
    tracked: TrackedPhase,
}

impl<'a, O: OsActions, J: JobRunner, T: Transport> ControlLoop<'a, O, J, T> {
    pub fn new(
        config: &'a AgentConfig,
        machine: PhaseMachine<'a, O, J, T>,
        os: &'a O,
        transport: &'a T,
        facts: &'a dyn FactSource,
        registrar: Option<&'a dyn Registrar>,
        first_checkin: FirstCheckinFlag,
    ) -> Self {
        Self {
            config,
            machine,
            os,
            transport,
            facts,
            registrar,
            first_checkin,
            tracked: TrackedPhase::Idle,
        }
    }

    pub fn tracked(&self) -> TrackedPhase {
        self.tracked
    }

    pub fn machine(&self) -> &PhaseMachine<'a, O, J, T> {
        &self.machine
    }

    /// Sleep a random skew, then iterate until a signal arrives.
    pub fn run<R: Rng + ?Sized>(&mut self, signals: &LoopSignals, rng: &mut R) -> LoopExit {
        let skew = startup_skew(rng, self.config.checkin_skew());
        info!(skew_ms = skew.as_millis() as u64, "delaying first checkin");
        if let Some(signal) = signals.wait(skew) {
            return signal.into();
        }

        let interval = self.config.checkin_interval();
        loop {
            let started = Instant::now();
            let t1 = SystemTime::now();
            // OS commands run on this thread, so no wait is in flight here.
            let reaped = self.machine.reap_jobs();
            if reaped > 0 {
                debug!(reaped, "collected exited background jobs");
            }
            match self.run_iteration(t1) {
                Ok(iteration) => debug!(?iteration, "iteration finished"),
                Err(err) => {
                    error!("checkin iteration failed: {err:#}");
                    debug!("{err:?}");
                }
            }

            let remaining = remaining_sleep(interval, started.elapsed());
            debug!(remaining_ms = remaining.as_millis() as u64, "sleeping until next checkin");
            if let Some(signal) = signals.wait(remaining) {
                info!(?signal, "control loop stopping");
                return signal.into();
            }
        }
    }

    /// One checkin cycle started at `t1`.
    ///
    /// The fact check runs even when the checkin failed, except after a
    /// reboot or poweroff.
    pub fn run_iteration(&mut self, t1: SystemTime) -> Result<Iteration> {
        let outcome = self.checkin_and_dispatch();
        if matches!(
            outcome,
            Ok(Iteration::Handled(Command::Reboot | Command::Poweroff))
        ) {
            return outcome;
        }
        self.register_if_facts_changed(t1);
        outcome
    }

    #[instrument(skip_all, fields(last_state))]
    fn checkin_and_dispatch(&mut self) -> Result<Iteration> {
        let Some(checkin_url) = self.config.checkin_url() else {
            debug!("no server configured, skipping checkin");
            return Ok(Iteration::Offline);
        };

        let identity = self.facts.identity();
        self.machine.adopt_identity(identity.clone());
        self.refresh_tracked();
        tracing::Span::current().record("last_state", self.tracked.as_str());

        let first_checkin = self.first_checkin.is_set();
        let mac_id = identity.mac_id_param();
        let mut query = vec![
            ("uuid", identity.uuid.as_str()),
            ("mac_id", mac_id.as_str()),
            ("last_state", self.tracked.as_str()),
        ];
        if first_checkin {
            query.push(("first_checkin", "true"));
        }
        debug!(url = %checkin_url, first_checkin, "checking in");
        let body = self
            .transport
            .get(&checkin_url, &query)
            .context("checkin")?;
        let reply = CheckinReply::parse(&String::from_utf8_lossy(&body))?;
        let errcode = reply.errcode;
        let Some(directive) = reply.into_directive() else {
            debug!(?errcode, "checkin not successful");
            return Ok(Iteration::CheckinRejected);
        };

        let changed_config = directive
            .client_config
            .as_ref()
            .filter(|map| self.config.has_changed(map));

        match &directive.command {
            Command::Acknowledge => debug!("acknowledged"),
            Command::Register => self.register(first_checkin)?,
            Command::Reboot => {
                self.os.reboot().context("reboot")?;
                return Ok(Iteration::Handled(Command::Reboot));
            }
            Command::Poweroff => {
                self.os.poweroff().context("poweroff")?;
                return Ok(Iteration::Handled(Command::Poweroff));
            }
            Command::Reset => {
                self.machine.reset_vmodel_state()?;
                self.machine
                    .request_from_server("reset", VmodelAction::Do, None);
                self.tracked = TrackedPhase::Idle;
            }
            Command::StartPhase {
                phase,
                enabled,
                files,
            } => {
                if changed_config.is_some() {
                    info!(%phase, "configuration change pending, {phase} not started");
                } else {
                    match self.machine.start_phase(*phase, *enabled, files)? {
                        StartOutcome::AlreadyRunning => {}
                        outcome => self.tracked = outcome.tracked(),
                    }
                }
            }
            Command::Unknown(name) => debug!(command = %name, "ignoring unknown command"),
        }

        if let Some(map) = changed_config {
            let url = self.config.reconfigure_url();
            info!(%url, "server configuration changed, applying");
            let body = serde_json::to_string(map).context("serialize client_config")?;
            self.transport
                .post_json(&url, "text/json", &body)
                .context("apply client_config")?;
        }

        Ok(Iteration::Handled(directive.command))
    }

    /// Drop the tracked phase once it is no longer running.
    fn refresh_tracked(&mut self) {
        let TrackedPhase::Active(phase) = self.tracked else {
            return;
        };
        match self.machine.status(phase) {
            Some(PhaseStatus::Running) => debug!(%phase, "phase still running"),
            Some(PhaseStatus::Done) => {
                info!(%phase, "phase finished, notifying server");
                self.machine
                    .request_from_server(phase.as_str(), VmodelAction::End, None);
                self.tracked = TrackedPhase::Idle;
            }
            _ => self.tracked = TrackedPhase::Idle,
        }
    }

    fn register(&self, first_checkin: bool) -> Result<()> {
        let Some(registrar) = self.registrar else {
            debug!("no registrar configured, register ignored");
            return Ok(());
        };
        if registrar.register_node(self.tracked).context("register node")? {
            if first_checkin {
                self.first_checkin.clear()?;
            }
        } else {
            warn!("registration not accepted");
        }
        Ok(())
    }

    fn register_if_facts_changed(&self, t1: SystemTime) {
        let Some(registrar) = self.registrar else {
            return;
        };
        if self.facts.last_saved().is_some_and(|saved| t1 <= saved) {
            return;
        }
        if let Err(err) = registrar.register_if_changed(self.tracked) {
            warn!(err = %format!("{err:#}"), "fact change registration failed");
        }
    }
}
