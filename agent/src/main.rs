//! Provisioning node agent.
//!
//! Checks in with the provisioning server, runs the configuration phases it
//! asks for, and reports their completion. Phase state lives in
//! `/tmp/vmodel_state.json` by default.

use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command as Process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use mk_agent::control_loop::{ControlLoop, LoopExit};
use mk_agent::core::types::{Phase, status_label};
use mk_agent::exit_codes;
use mk_agent::io::config::{DEFAULT_CONFIG_PATH, load_config};
use mk_agent::io::facts::{SavedFacts, SysfsFacts};
use mk_agent::io::first_checkin::FirstCheckinFlag;
use mk_agent::io::jobs::{DetachedJobRunner, JobSpec, execute_job};
use mk_agent::io::mount_gate::MountGate;
use mk_agent::io::os::SystemOs;
use mk_agent::io::registration::{HttpRegistrar, Registrar};
use mk_agent::io::state_store::StateStore;
use mk_agent::io::transport::UreqTransport;
use mk_agent::logging;
use mk_agent::phases::{PhaseMachine, PhaseSettings};
use mk_agent::signals::{LoopSignal, LoopSignals};
use mk_agent::web::{self, ControlState};

#[derive(Parser)]
#[command(name = "mk-agent", version, about = "Provisioning node agent")]
struct Cli {
    /// Agent configuration file (TOML). Defaults apply when it is missing.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check in with the server and run phases until stopped.
    Run {
        /// Append logs to this file instead of stderr.
        #[arg(long)]
        log_file: Option<PathBuf>,
    },
    /// Inspect or change the persisted phase state.
    State {
        #[command(subcommand)]
        action: StateAction,
    },
    /// Run one phase script and report its completion.
    #[command(hide = true)]
    RunJob {
        #[arg(long)]
        phase: Phase,
        #[arg(long)]
        script: PathBuf,
        #[arg(long)]
        callback: String,
        #[arg(long)]
        log_file: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum StateAction {
    /// Print every phase and its status.
    Show,
    /// Clear every phase back to none.
    Reset,
    /// Create entries for phases that have none.
    Seed,
}

fn main() {
    let cli = Cli::parse();
    let code = match dispatch(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn dispatch(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Run { log_file } => cmd_run(&cli.config, log_file),
        Command::State { action } => cmd_state(&cli.config, &action),
        Command::RunJob {
            phase,
            script,
            callback,
            log_file,
        } => cmd_run_job(
            &cli.config,
            JobSpec {
                phase,
                script,
                callback_url: callback,
            },
            log_file.as_deref(),
        ),
    }
}

fn cmd_run(config_path: &Path, log_file: Option<PathBuf>) -> Result<i32> {
    let config = load_config(config_path)?;
    let guard = logging::init(config.log_level(), log_file.as_deref())?;
    info!(config = %config_path.display(), server = ?config.mk_uri, "starting mk-agent");

    let store = Arc::new(StateStore::new(&config.paths.state_file));
    store.seed(&Phase::ALL).context("seed phase state")?;

    let os = SystemOs::new(config.privileged_prefix.clone(), config.os_command_timeout());
    let transport = UreqTransport::new(config.request_timeout());
    let jobs = DetachedJobRunner::current(config_path, log_file)?;
    let facts =
        SysfsFacts::new("/", &config.paths.facts_file).with_exclusion(config.fact_exclusion()?);
    let registrar = config.register_url().map(|url| {
        HttpRegistrar::new(
            &transport,
            url,
            &facts,
            SavedFacts::new(&config.paths.facts_file),
        )
    });
    if registrar.is_none() {
        warn!("mk_uri not set, running without a server");
    }

    let signals = LoopSignals::new();
    let shutdown = signals.sender();
    ctrlc::set_handler(move || shutdown.send(LoopSignal::Shutdown))
        .context("install signal handler")?;

    let control = ControlState::new(
        Arc::clone(&store),
        config_path,
        config.clone(),
        signals.sender(),
    );
    web::spawn(&config.control_listen, control)?;

    let gate = MountGate::new(
        &os,
        config.mk_nfs_server_ip.clone(),
        config.nfs_export.clone(),
        config.nfs_mount_point.clone(),
    );
    let machine = PhaseMachine::new(
        &store,
        gate,
        &jobs,
        &transport,
        PhaseSettings::from_config(&config),
    );
    let mut control_loop = ControlLoop::new(
        &config,
        machine,
        &os,
        &transport,
        &facts,
        registrar.as_ref().map(|r| r as &dyn Registrar),
        FirstCheckinFlag::new(&config.paths.first_checkin_file),
    );

    match control_loop.run(&signals, &mut rand::thread_rng()) {
        LoopExit::Shutdown => {
            info!("mk-agent stopped");
            Ok(exit_codes::OK)
        }
        LoopExit::Restart => {
            info!("restarting mk-agent with new configuration");
            drop(guard);
            restart_self()
        }
    }
}

/// Replace this process with a fresh copy started with the same arguments.
fn restart_self() -> Result<i32> {
    let exe = std::env::current_exe().context("locate agent binary")?;
    let err = Process::new(&exe).args(std::env::args_os().skip(1)).exec();
    Err(err).with_context(|| format!("re-exec {}", exe.display()))
}

fn cmd_state(config_path: &Path, action: &StateAction) -> Result<i32> {
    let config = load_config(config_path)?;
    let _guard = logging::init("warn", None)?;
    let store = StateStore::new(&config.paths.state_file);
    match action {
        StateAction::Show => {
            for (phase, status) in store.snapshot() {
                println!("{phase}: {}", status_label(status));
            }
        }
        StateAction::Reset => {
            store.reset_all()?;
            println!("phase state reset");
        }
        StateAction::Seed => {
            store.seed(&Phase::ALL)?;
            println!("phase state seeded");
        }
    }
    Ok(exit_codes::OK)
}

fn cmd_run_job(config_path: &Path, job: JobSpec, log_file: Option<&Path>) -> Result<i32> {
    let config = load_config(config_path)?;
    let _guard = logging::init(config.log_level(), log_file)?;
    let os = SystemOs::new(config.privileged_prefix.clone(), config.os_command_timeout());
    let transport = UreqTransport::new(config.request_timeout());
    let report = execute_job(&os, &transport, &job);
    Ok(if report.succeeded() {
        exit_codes::OK
    } else {
        exit_codes::INVALID
    })
}
