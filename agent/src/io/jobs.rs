//! Background execution of phase scripts.
//!
//! A phase script runs as a detached `mk-agent run-job` process so it
//! survives agent restarts. When the script exits 0, the job posts
//! `{phase, action: "end"}` to the agent's local control endpoint, which
//! moves the phase from `running` to `done`. Failures are logged only; the
//! phase stays `running` until the server resets it.
//!
//! Jobs outlive a re-exec of the agent, which drops the threads waiting on
//! them. [`reap_exited_children`] collects such jobs once they exit.

use std::fs::OpenOptions;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use tracing::{debug, error, info, instrument, warn};

use crate::core::types::Phase;
use crate::io::os::OsActions;
use crate::io::transport::Transport;

/// One phase script to run in the background.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub phase: Phase,
    pub script: PathBuf,
    pub callback_url: String,
}

pub trait JobRunner {
    /// Start `job` without waiting for it.
    ///
    /// Returns `Ok(false)` when the staged script does not exist, in which
    /// case nothing was started.
    fn run_detached(&self, job: &JobSpec) -> Result<bool>;

    /// Collect jobs that have exited; returns how many were collected.
    fn reap_exited(&self) -> usize {
        0
    }
}

/// [`JobRunner`] that re-executes the agent binary as `run-job`.
#[derive(Debug, Clone)]
pub struct DetachedJobRunner {
    exe: PathBuf,
    config_path: PathBuf,
    log_file: Option<PathBuf>,
}

impl DetachedJobRunner {
    /// `config_path` is handed to the job so it loads the same configuration
    /// as the agent that started it.
    pub fn new(
        exe: impl Into<PathBuf>,
        config_path: impl Into<PathBuf>,
        log_file: Option<PathBuf>,
    ) -> Self {
        Self {
            exe: exe.into(),
            config_path: config_path.into(),
            log_file,
        }
    }

    /// Runner for the currently executing binary.
    pub fn current(config_path: impl Into<PathBuf>, log_file: Option<PathBuf>) -> Result<Self> {
        let exe = std::env::current_exe().context("locate agent binary")?;
        Ok(Self::new(exe, config_path, log_file))
    }

    fn command(&self, job: &JobSpec) -> Command {
        let mut cmd = Command::new(&self.exe);
        cmd.arg("--config")
            .arg(&self.config_path)
            .arg("run-job")
            .arg("--phase")
            .arg(job.phase.as_str())
            .arg("--script")
            .arg(&job.script)
            .arg("--callback")
            .arg(&job.callback_url);
        if let Some(log_file) = &self.log_file {
            cmd.arg("--log-file").arg(log_file);
        }
        cmd
    }
}

impl JobRunner for DetachedJobRunner {
    #[instrument(skip_all, fields(phase = %job.phase, script = %job.script.display()))]
    fn run_detached(&self, job: &JobSpec) -> Result<bool> {
        if !job.script.is_file() {
            error!("script {} not found, phase not started", job.script.display());
            return Ok(false);
        }

        let mut cmd = self.command(job);
        cmd.stdin(Stdio::null()).process_group(0);
        match &self.log_file {
            // Job output joins the agent log rather than a terminal that may be gone.
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_context(|| format!("open job log {}", path.display()))?;
                let err_file = file.try_clone().context("clone job log handle")?;
                cmd.stdout(file).stderr(err_file);
            }
            None => {
                cmd.stdout(Stdio::null());
            }
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn job for {}", job.phase))?;
        let pid = child.id();
        info!(pid, "background job started");

        thread::Builder::new()
            .name(format!("reap-{}", job.phase))
            .spawn(move || match child.wait() {
                Ok(status) => debug!(pid, exit_code = ?status.code(), "background job exited"),
                Err(err) if err.raw_os_error() == Some(Errno::ECHILD as i32) => {
                    debug!(pid, "background job already reaped");
                }
                Err(err) => warn!(pid, err = %err, "failed to wait for background job"),
            })
            .context("spawn job reaper thread")?;
        Ok(true)
    }

    fn reap_exited(&self) -> usize {
        reap_exited_children()
    }
}

/// Reap every child of this process that has already exited, without blocking.
///
/// This includes jobs started before the agent re-executed itself, which no
/// thread waits on. A thread still blocked in `Child::wait` on a child reaped
/// here gets `ECHILD`.
pub fn reap_exited_children() -> usize {
    let mut reaped = 0;
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(Errno::ECHILD) => return reaped,
            Ok(status) => {
                reaped += 1;
                debug!(pid = ?status.pid(), ?status, "reaped exited child");
            }
            Err(Errno::EINTR) => {}
            Err(err) => {
                warn!(err = %err, "failed to reap exited children");
                return reaped;
            }
        }
    }
}

/// What happened inside a detached job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    /// `None` when the script could not be run or was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    /// Script stderr, prefixed with the failure reason when it did not exit 0.
    pub stderr: String,
    pub duration: Duration,
    pub callback_sent: bool,
}

impl JobReport {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Body of the `run-job` process: run the script, then report success.
#[instrument(skip_all, fields(phase = %job.phase, script = %job.script.display()))]
pub fn execute_job<O: OsActions, T: Transport>(os: &O, transport: &T, job: &JobSpec) -> JobReport {
    let mut report = match os.run_script(&job.script) {
        Ok(output) => JobReport {
            exit_code: output.status.code(),
            stdout: output.stdout_lossy(),
            stderr: output.stderr_lossy(),
            duration: output.duration,
            callback_sent: false,
        },
        Err(err) => JobReport {
            exit_code: None,
            stdout: String::new(),
            stderr: format!("{err:#}"),
            duration: Duration::ZERO,
            callback_sent: false,
        },
    };
    info!(
        exit_code = ?report.exit_code,
        duration_ms = report.duration.as_millis() as u64,
        "script finished"
    );

    if !report.succeeded() {
        let code = report
            .exit_code
            .map_or_else(|| "none".to_string(), |code| code.to_string());
        report.stderr = format!("Error Code: {code}\n{}", report.stderr);
        error!(stderr = %report.stderr, "{} script failed", job.phase.title());
        return report;
    }

    debug!(stdout = %report.stdout, "script output");
    let fields = [("phase", job.phase.as_str()), ("action", "end")];
    match transport.post_form(&job.callback_url, &fields) {
        Ok(reply) => {
            debug!(reply = %reply, "completion reported");
            report.callback_sent = true;
        }
        Err(err) => error!(err = %format!("{err:#}"), "failed to report completion"),
    }
    report
}
