//! Agent configuration stored as TOML (default `/tmp/mk_conf.toml`).
//!
//! The server pushes configuration as a JSON `client_config` map whose keys
//! match the field names below; the local reconfiguration endpoint merges that
//! map into the current configuration and persists the result here.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

pub const DEFAULT_CONFIG_PATH: &str = "/tmp/mk_conf.toml";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Agent configuration (TOML).
///
/// Missing fields default to values that let the agent run in local-only mode
/// (no `mk_uri`, 30s checkin interval, 5s startup skew).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Base URI of the provisioning server. Unset means no network activity.
    pub mk_uri: Option<String>,
    pub mk_checkin_path: String,
    pub mk_register_path: String,
    pub mk_vmodel_path: String,
    /// Seconds between checkins.
    pub mk_checkin_interval: u64,
    /// Upper bound (seconds) of the random delay before the first checkin.
    pub mk_checkin_skew: u64,
    pub mk_log_level: String,
    /// Regex over fact names; matching facts are left out of registration.
    pub mk_fact_excl_pattern: Option<String>,
    /// IPv4 address of the NFS server holding phase tooling.
    pub mk_nfs_server_ip: Option<String>,
    /// Export mounted from `mk_nfs_server_ip`.
    pub nfs_export: String,
    pub nfs_mount_point: PathBuf,
    /// Listen address of the local control endpoint.
    pub control_listen: String,
    /// Timeout for each outbound HTTP request.
    pub request_timeout_secs: u64,
    /// Timeout for privileged OS commands (mount, umount, reboot).
    pub os_command_timeout_secs: u64,
    /// Prepended to privileged OS commands (e.g. `["sudo"]`).
    pub privileged_prefix: Vec<String>,
    pub paths: PathsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub state_file: PathBuf,
    pub first_checkin_file: PathBuf,
    pub staging_dir: PathBuf,
    pub facts_file: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_file: PathBuf::from("/tmp/vmodel_state.json"),
            first_checkin_file: PathBuf::from("/tmp/first_checkin.json"),
            staging_dir: PathBuf::from("/tmp"),
            facts_file: PathBuf::from("/tmp/prev_facts.json"),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            mk_uri: None,
            mk_checkin_path: "/hanlon/api/v1/node/checkin".to_string(),
            mk_register_path: "/hanlon/api/v1/node/register".to_string(),
            mk_vmodel_path: "hanlon/api/v1/vmodel".to_string(),
            mk_checkin_interval: 30,
            mk_checkin_skew: 5,
            mk_log_level: "info".to_string(),
            mk_fact_excl_pattern: None,
            mk_nfs_server_ip: None,
            nfs_export: "/nfs".to_string(),
            nfs_mount_point: PathBuf::from("/nfs"),
            control_listen: "127.0.0.1:2156".to_string(),
            request_timeout_secs: 30,
            os_command_timeout_secs: 120,
            privileged_prefix: vec!["sudo".to_string()],
            paths: PathsConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.mk_checkin_interval == 0 {
            return Err(anyhow!("mk_checkin_interval must be > 0"));
        }
        if self.request_timeout_secs == 0 {
            return Err(anyhow!("request_timeout_secs must be > 0"));
        }
        if self.os_command_timeout_secs == 0 {
            return Err(anyhow!("os_command_timeout_secs must be > 0"));
        }
        if let Some(uri) = &self.mk_uri
            && uri.trim().is_empty()
        {
            return Err(anyhow!("mk_uri must not be empty when set"));
        }
        if !LOG_LEVELS.contains(&self.log_level()) {
            return Err(anyhow!(
                "mk_log_level must be one of {} (got '{}')",
                LOG_LEVELS.join(", "),
                self.mk_log_level
            ));
        }
        if self.control_listen.trim().is_empty() {
            return Err(anyhow!("control_listen must not be empty"));
        }
        self.fact_exclusion()?;
        Ok(())
    }

    /// Compiled `mk_fact_excl_pattern`; an empty pattern excludes nothing.
    pub fn fact_exclusion(&self) -> Result<Option<Regex>> {
        match self.mk_fact_excl_pattern.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(pattern) => Regex::new(pattern)
                .map(Some)
                .with_context(|| format!("mk_fact_excl_pattern is not a valid regex: '{pattern}'")),
        }
    }

    /// Normalized tracing level; accepts `Logger::DEBUG` style names too.
    pub fn log_level(&self) -> &'static str {
        let raw = self.mk_log_level.trim();
        let raw = raw.strip_prefix("Logger::").unwrap_or(raw);
        let lowered = raw.to_ascii_lowercase();
        match lowered.as_str() {
            "trace" => "trace",
            "debug" => "debug",
            "info" => "info",
            "warn" | "warning" => "warn",
            "error" | "fatal" => "error",
            _ => "invalid",
        }
    }

    pub fn checkin_interval(&self) -> Duration {
        Duration::from_secs(self.mk_checkin_interval)
    }

    pub fn checkin_skew(&self) -> Duration {
        Duration::from_secs(self.mk_checkin_skew)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn os_command_timeout(&self) -> Duration {
        Duration::from_secs(self.os_command_timeout_secs)
    }

    /// Checkin endpoint, or `None` in local-only mode.
    pub fn checkin_url(&self) -> Option<String> {
        self.mk_uri
            .as_deref()
            .map(|base| join_url(base, &self.mk_checkin_path))
    }

    pub fn register_url(&self) -> Option<String> {
        self.mk_uri
            .as_deref()
            .map(|base| join_url(base, &self.mk_register_path))
    }

    /// Base of the phase lifecycle endpoints (`{vmodel}/{phase}/{action}`).
    pub fn vmodel_url(&self) -> Option<String> {
        self.mk_uri
            .as_deref()
            .map(|base| join_url(base, &self.mk_vmodel_path))
    }

    /// Local endpoint that background jobs call when a script finishes.
    pub fn completion_callback_url(&self) -> String {
        format!("http://{}/vmodel", self.control_listen)
    }

    /// Local endpoint that persists a new configuration and restarts the agent.
    pub fn reconfigure_url(&self) -> String {
        format!("http://{}/setMkConfig", self.control_listen)
    }

    /// Apply a server `client_config` map on top of this configuration.
    ///
    /// Keys the agent does not know are ignored; keys the map omits keep
    /// their current values.
    pub fn merged_with(&self, client_config: &Value) -> Result<AgentConfig> {
        let overrides = client_config
            .as_object()
            .ok_or_else(|| anyhow!("client_config must be a JSON object"))?;
        let mut current = serde_json::to_value(self).context("serialize current config")?;
        let Some(fields) = current.as_object_mut() else {
            return Err(anyhow!("config did not serialize to an object"));
        };
        for (key, value) in overrides {
            fields.insert(key.clone(), value.clone());
        }
        let merged: AgentConfig =
            serde_json::from_value(current).context("decode merged client_config")?;
        merged.validate()?;
        Ok(merged)
    }

    /// Whether applying `client_config` would change this configuration.
    ///
    /// A map that cannot be applied is logged and reported as unchanged.
    pub fn has_changed(&self, client_config: &Value) -> bool {
        match self.merged_with(client_config) {
            Ok(merged) => merged != *self,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "ignoring unusable client_config");
                false
            }
        }
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `AgentConfig::default()`.
pub fn load_config(path: &Path) -> Result<AgentConfig> {
    if !path.exists() {
        let cfg = AgentConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: AgentConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &AgentConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    super::write_atomic(path, &buf)
}
