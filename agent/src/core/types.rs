//! Shared types for phase bookkeeping.
//!
//! These types define the vocabulary exchanged between the control loop, the
//! phase state machine and the persisted state store. They carry no I/O.

use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

/// One out-of-band configuration step the server can drive a node through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Firmware,
    Bmc,
    Ilo,
    Raid,
    Bios,
}

impl Phase {
    /// Every phase, in the order the server normally schedules them.
    pub const ALL: [Phase; 5] = [
        Phase::Firmware,
        Phase::Bmc,
        Phase::Ilo,
        Phase::Raid,
        Phase::Bios,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Firmware => "firmware",
            Phase::Bmc => "bmc",
            Phase::Ilo => "ilo",
            Phase::Raid => "raid",
            Phase::Bios => "bios",
        }
    }

    /// Capitalized name used in human-readable status messages (`"Raid"`).
    pub fn title(self) -> String {
        let name = self.as_str();
        let mut chars = name.chars();
        match chars.next() {
            Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
            None => String::new(),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Phase::ALL
            .into_iter()
            .find(|phase| phase.as_str() == s)
            .ok_or_else(|| anyhow!("unknown phase '{s}'"))
    }
}

/// Persisted status of a phase.
///
/// "Never started or reset" is represented by the absence of a status
/// (`Option<PhaseStatus>::None`), which serializes as JSON `null`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseStatus {
    Running,
    Skip,
    Done,
}

impl PhaseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PhaseStatus::Running => "running",
            PhaseStatus::Skip => "skip",
            PhaseStatus::Done => "done",
        }
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Render an optional status the way operators see it (`none` when absent).
pub fn status_label(status: Option<PhaseStatus>) -> &'static str {
    status.map_or("none", PhaseStatus::as_str)
}

/// The phase the control loop reports as `last_state` on checkin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackedPhase {
    /// Nothing in flight.
    #[default]
    Idle,
    /// A phase was started and has not been reported as ended yet.
    Active(Phase),
}

impl TrackedPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            TrackedPhase::Idle => "idle",
            TrackedPhase::Active(phase) => phase.as_str(),
        }
    }
}

impl fmt::Display for TrackedPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity scoping every outbound request to this node.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// MAC-derived identifiers, one per matching network interface.
    pub mac_id: Vec<String>,
    /// BIOS UUID. Empty when the fact source could not determine it.
    pub uuid: String,
}

impl NodeIdentity {
    /// `mac_id` as it travels in query strings: a JSON array.
    pub fn mac_id_param(&self) -> String {
        serde_json::to_string(&self.mac_id).unwrap_or_else(|_| "[]".to_string())
    }
}
