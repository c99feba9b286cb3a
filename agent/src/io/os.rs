//! Privileged OS actions.
//!
//! The [`OsActions`] trait is the only place the agent touches the host:
//! power state, NFS mounts, the live mount table, and phase scripts. Tests use
//! a recording fake instead of spawning anything.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::io::process::{CommandOutput, run_command};

/// Bytes of stdout/stderr kept from privileged commands.
const OS_OUTPUT_LIMIT_BYTES: usize = 64 * 1024;
/// Bytes of stdout/stderr kept from phase scripts.
pub const SCRIPT_OUTPUT_LIMIT_BYTES: usize = 1_000_000;

pub trait OsActions {
    fn reboot(&self) -> Result<()>;
    fn poweroff(&self) -> Result<()>;
    /// Mount NFS `source` (`ip:/export`) on `mount_point`, read/write, without locking.
    fn mount_share(&self, source: &str, mount_point: &Path) -> Result<()>;
    fn unmount_share(&self, mount_point: &Path) -> Result<()>;
    /// Contents of the live mount table.
    fn mount_table(&self) -> Result<String>;
    /// Run `script` with `sh` to completion, capturing its output.
    fn run_script(&self, script: &Path) -> Result<CommandOutput>;
}

/// [`OsActions`] backed by the host's commands.
#[derive(Debug, Clone)]
pub struct SystemOs {
    privileged_prefix: Vec<String>,
    timeout: Duration,
    mount_table_path: PathBuf,
}

impl SystemOs {
    pub fn new(privileged_prefix: Vec<String>, timeout: Duration) -> Self {
        Self {
            privileged_prefix,
            timeout,
            mount_table_path: PathBuf::from("/proc/mounts"),
        }
    }

    fn privileged(&self, program: &str) -> Command {
        match self.privileged_prefix.split_first() {
            Some((first, rest)) => {
                let mut cmd = Command::new(first);
                cmd.args(rest).arg(program);
                cmd
            }
            None => Command::new(program),
        }
    }

    fn run_privileged(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let mut cmd = self.privileged(program);
        cmd.args(args);
        let output = run_command(cmd, Some(self.timeout), OS_OUTPUT_LIMIT_BYTES)
            .with_context(|| format!("run {program}"))?;
        if output.timed_out {
            return Err(anyhow!("{program} timed out after {:?}", self.timeout));
        }
        if !output.status.success() {
            return Err(anyhow!(
                "{program} failed with status {:?}: {}",
                output.status.code(),
                output.stderr_lossy()
            ));
        }
        Ok(output)
    }
}

impl OsActions for SystemOs {
    #[instrument(skip_all)]
    fn reboot(&self) -> Result<()> {
        info!("rebooting node");
        self.run_privileged("reboot", &["now"]).map(|_| ())
    }

    #[instrument(skip_all)]
    fn poweroff(&self) -> Result<()> {
        info!("powering off node");
        self.run_privileged("poweroff", &["now"]).map(|_| ())
    }

    #[instrument(skip_all, fields(source = %source, mount_point = %mount_point.display()))]
    fn mount_share(&self, source: &str, mount_point: &Path) -> Result<()> {
        let point = mount_point.to_string_lossy();
        self.run_privileged("mkdir", &["-p", &point])
            .context("create mount point")?;
        debug!("mounting share");
        self.run_privileged("mount", &["-t", "nfs", "-o", "rw,nolock", source, &point])
            .map(|_| ())
    }

    #[instrument(skip_all, fields(mount_point = %mount_point.display()))]
    fn unmount_share(&self, mount_point: &Path) -> Result<()> {
        let point = mount_point.to_string_lossy();
        self.run_privileged("umount", &[&point]).map(|_| ())
    }

    fn mount_table(&self) -> Result<String> {
        fs::read_to_string(&self.mount_table_path)
            .with_context(|| format!("read {}", self.mount_table_path.display()))
    }

    #[instrument(skip_all, fields(script = %script.display()))]
    fn run_script(&self, script: &Path) -> Result<CommandOutput> {
        let mut cmd = Command::new("sh");
        cmd.arg(script);
        if let Some(dir) = script.parent() {
            cmd.current_dir(dir);
        }
        let output = run_command(cmd, None, SCRIPT_OUTPUT_LIMIT_BYTES)
            .with_context(|| format!("run script {}", script.display()))?;
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "script exited unsuccessfully");
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn privileged_commands_carry_prefix() {
        let os = SystemOs::new(
            vec!["sudo".to_string(), "-n".to_string()],
            Duration::from_secs(1),
        );
        let cmd = os.privileged("umount");
        assert_eq!(cmd.get_program(), "sudo");
        let args: Vec<_> = cmd.get_args().collect();
        assert_eq!(args, ["-n", "umount"]);
    }

    #[test]
    fn empty_prefix_runs_program_directly() {
        let os = SystemOs::new(Vec::new(), Duration::from_secs(1));
        assert_eq!(os.privileged("reboot").get_program(), "reboot");
    }

    #[test]
    fn failing_privileged_command_reports_status() {
        let os = SystemOs::new(Vec::new(), Duration::from_secs(5));
        let err = os.run_privileged("false", &[]).unwrap_err();
        assert!(err.to_string().contains("false failed"));
    }

    #[test]
    fn run_script_captures_exit_code() {
        let temp = tempfile::tempdir().expect("tempdir");
        let script = temp.path().join("phase.sh");
        fs::write(&script, "echo configuring\nexit 4\n").expect("write");

        let os = SystemOs::new(Vec::new(), Duration::from_secs(5));
        let output = os.run_script(&script).expect("run");
        assert_eq!(output.status.code(), Some(4));
        assert_eq!(output.stdout_lossy(), "configuring");
    }

    #[test]
    fn mount_table_reads_configured_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let table = temp.path().join("mounts");
        fs::write(&table, "10.0.0.2:/nfs /nfs nfs rw 0 0\n").expect("write");
        let os = SystemOs {
            mount_table_path: table,
            ..SystemOs::new(Vec::new(), Duration::from_secs(1))
        };
        assert!(os.mount_table().expect("read").contains("10.0.0.2:/nfs"));
    }
}
