//! Durable phase status (`/tmp/vmodel_state.json` by default).
//!
//! The file is a flat JSON object mapping phase name to status, with `null`
//! for phases that were never started or have been reset:
//!
//! ```json
//! { "bios": "running", "raid": null }
//! ```
//!
//! A status can only be recorded for a phase that already has an entry;
//! entries are created by [`StateStore::seed`] when the configuration is
//! loaded. Keys the agent does not recognize are preserved across rewrites.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::core::types::{Phase, PhaseStatus};

type StateMap = BTreeMap<String, Option<PhaseStatus>>;

/// Result of [`StateStore::transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    /// The current status did not satisfy the guard; nothing was written.
    Rejected(Option<PhaseStatus>),
    /// The phase has no entry, so its status is not tracked.
    Unseeded,
}

/// File-backed phase status store.
///
/// Read-modify-write cycles are serialized by an internal lock so the control
/// loop and the local control endpoint can share one store.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persisted status of `phase`; `None` when absent, reset, or unreadable.
    pub fn get(&self, phase: Phase) -> Option<PhaseStatus> {
        let _guard = self.guard();
        self.load().get(phase.as_str()).copied().flatten()
    }

    /// Record `status` for `phase` if the phase has been seeded.
    ///
    /// Unseeded phases are left untouched.
    pub fn set(&self, phase: Phase, status: PhaseStatus) -> Result<()> {
        self.transition(phase, |_| true, status).map(drop)
    }

    /// Record `to` for `phase` only if `allowed` accepts its current status.
    ///
    /// The check and the write happen under one lock, so no other update of
    /// this store can land between them.
    pub fn transition(
        &self,
        phase: Phase,
        allowed: impl FnOnce(Option<PhaseStatus>) -> bool,
        to: PhaseStatus,
    ) -> Result<Transition> {
        let _guard = self.guard();
        let mut map = self.load();
        let Some(entry) = map.get_mut(phase.as_str()) else {
            debug!(%phase, status = %to, "phase not seeded, status not recorded");
            return Ok(Transition::Unseeded);
        };
        let current = *entry;
        if !allowed(current) {
            debug!(%phase, status = %to, ?current, "status change rejected");
            return Ok(Transition::Rejected(current));
        }
        *entry = Some(to);
        debug!(%phase, status = %to, "recording phase status");
        self.store(&map)?;
        Ok(Transition::Applied)
    }

    /// Clear every existing entry back to `null`.
    pub fn reset_all(&self) -> Result<()> {
        let _guard = self.guard();
        let mut map = self.load();
        if map.is_empty() {
            debug!("state store empty, nothing to reset");
            return Ok(());
        }
        for entry in map.values_mut() {
            *entry = None;
        }
        self.store(&map)
    }

    /// Create a `null` entry for each phase that has none.
    ///
    /// Existing entries, including in-flight `running` ones, are kept so a
    /// restarted agent does not lose track of them.
    pub fn seed(&self, phases: &[Phase]) -> Result<()> {
        let _guard = self.guard();
        let mut map = self.load();
        let mut added = false;
        for phase in phases {
            if !map.contains_key(phase.as_str()) {
                map.insert(phase.as_str().to_string(), None);
                added = true;
            }
        }
        if added || !self.path.exists() {
            self.store(&map)?;
        }
        Ok(())
    }

    /// Every entry currently persisted, including unrecognized keys.
    pub fn snapshot(&self) -> BTreeMap<String, Option<PhaseStatus>> {
        let _guard = self.guard();
        self.load()
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        // The lock guards no data, so a poisoned lock is still usable.
        self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn load(&self) -> StateMap {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return StateMap::new(),
            Err(err) => {
                warn!(path = %self.path.display(), err = %err, "unreadable state file, treating as empty");
                return StateMap::new();
            }
        };
        match parse_state(&contents) {
            Ok(map) => map,
            Err(err) => {
                warn!(path = %self.path.display(), err = %format!("{err:#}"), "corrupt state file, treating as empty");
                StateMap::new()
            }
        }
    }

    fn store(&self, map: &StateMap) -> Result<()> {
        let mut buf = serde_json::to_string_pretty(map).context("serialize phase state")?;
        buf.push('\n');
        super::write_atomic(&self.path, &buf)
            .with_context(|| format!("write phase state {}", self.path.display()))
    }
}

/// Parse the state file, mapping unknown status strings to `null`.
fn parse_state(contents: &str) -> Result<StateMap> {
    let raw: BTreeMap<String, Option<serde_json::Value>> =
        serde_json::from_str(contents).context("parse phase state")?;
    Ok(raw
        .into_iter()
        .map(|(key, value)| {
            let status = value.and_then(|v| serde_json::from_value(v).ok());
            (key, status)
        })
        .collect())
}
