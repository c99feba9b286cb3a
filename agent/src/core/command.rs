//! Decoding of the server's checkin reply into a [`Command`].

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use super::types::Phase;

/// Raw checkin reply: `{errcode, response: {command_name, command_param}, client_config}`.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckinReply {
    #[serde(default)]
    pub errcode: Option<i64>,
    #[serde(default)]
    pub response: Option<CommandBody>,
    #[serde(default)]
    pub client_config: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandBody {
    #[serde(default)]
    pub command_name: String,
    #[serde(default)]
    pub command_param: Option<CommandParam>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommandParam {
    /// Files to stage for a phase; the server sends either one name or a list.
    #[serde(default, deserialize_with = "one_or_many")]
    pub file: Vec<String>,
    /// `"false"` (or JSON `false`) disables the phase.
    #[serde(default)]
    pub enabled: Option<Value>,
}

/// Whether a phase start carries the "disabled" sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enabled {
    Yes,
    No,
}

impl Enabled {
    pub fn from_param(value: Option<&Value>) -> Self {
        match value {
            Some(Value::Bool(false)) => Enabled::No,
            Some(Value::String(s)) if s == "false" => Enabled::No,
            _ => Enabled::Yes,
        }
    }
}

/// Action requested by the server for this checkin cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Acknowledge,
    Register,
    Reboot,
    Poweroff,
    Reset,
    StartPhase {
        phase: Phase,
        enabled: Enabled,
        files: Vec<String>,
    },
    /// Anything else; ignored by the control loop.
    Unknown(String),
}

/// A successful checkin: the command plus the optional configuration map.
#[derive(Debug, Clone)]
pub struct Directive {
    pub command: Command,
    pub client_config: Option<Value>,
}

impl CheckinReply {
    pub fn parse(body: &str) -> Result<Self> {
        serde_json::from_str(body).context("parse checkin reply")
    }

    pub fn is_success(&self) -> bool {
        self.errcode == Some(0)
    }

    /// Decode the command, or `None` when the checkin was not successful.
    pub fn into_directive(self) -> Option<Directive> {
        if !self.is_success() {
            return None;
        }
        let command = match self.response {
            Some(body) => decode_command(body),
            None => Command::Unknown(String::new()),
        };
        Some(Directive {
            command,
            client_config: self.client_config,
        })
    }
}

fn decode_command(body: CommandBody) -> Command {
    let param = body.command_param.unwrap_or_default();
    match body.command_name.as_str() {
        "acknowledge" => Command::Acknowledge,
        "register" => Command::Register,
        "reboot" => Command::Reboot,
        "poweroff" => Command::Poweroff,
        "reset" => Command::Reset,
        other => match other.parse::<Phase>() {
            Ok(phase) => Command::StartPhase {
                phase,
                enabled: Enabled::from_param(param.enabled.as_ref()),
                files: param.file,
            },
            Err(_) => Command::Unknown(other.to_string()),
        },
    }
}

fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(name)) => vec![name],
        Some(OneOrMany::Many(names)) => names,
    })
}
