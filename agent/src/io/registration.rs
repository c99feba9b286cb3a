//! Node registration with the provisioning server.

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::types::TrackedPhase;
use crate::io::facts::{FactMap, FactSource, SavedFacts, fingerprint};
use crate::io::transport::Transport;

pub trait Registrar {
    /// Register unconditionally. `Ok(false)` when the server did not accept it.
    fn register_node(&self, last_state: TrackedPhase) -> Result<bool>;
    /// Register only when the facts differ from the last registration.
    fn register_if_changed(&self, last_state: TrackedPhase) -> Result<bool>;
}

#[derive(Debug, Serialize)]
struct RegistrationBody<'a> {
    uuid: &'a str,
    mac_id: &'a [String],
    last_state: &'a str,
    facts: &'a FactMap,
}

/// [`Registrar`] posting the fact snapshot as JSON to the register endpoint.
pub struct HttpRegistrar<'a, T: Transport> {
    transport: &'a T,
    url: String,
    facts: &'a dyn FactSource,
    saved: SavedFacts,
}

impl<'a, T: Transport> HttpRegistrar<'a, T> {
    pub fn new(transport: &'a T, url: impl Into<String>, facts: &'a dyn FactSource, saved: SavedFacts) -> Self {
        Self {
            transport,
            url: url.into(),
            facts,
            saved,
        }
    }

    fn send(&self, last_state: TrackedPhase, facts: &FactMap, print: &str) -> Result<bool> {
        let identity = self.facts.identity();
        let body = RegistrationBody {
            uuid: &identity.uuid,
            mac_id: &identity.mac_id,
            last_state: last_state.as_str(),
            facts,
        };
        let json = serde_json::to_string(&body).context("serialize registration")?;
        match self.transport.post_json(&self.url, "application/json", &json) {
            Ok(reply) => {
                debug!(reply = %reply, "registration accepted");
                self.saved.record(print)?;
                Ok(true)
            }
            Err(err) => {
                warn!(err = %format!("{err:#}"), "registration failed");
                Ok(false)
            }
        }
    }
}

impl<T: Transport> Registrar for HttpRegistrar<'_, T> {
    #[instrument(skip_all, fields(url = %self.url, last_state = %last_state))]
    fn register_node(&self, last_state: TrackedPhase) -> Result<bool> {
        let facts = self.facts.collect().context("collect facts")?;
        let print = fingerprint(&facts)?;
        info!(facts = facts.len(), "registering node");
        self.send(last_state, &facts, &print)
    }

    #[instrument(skip_all, fields(url = %self.url, last_state = %last_state))]
    fn register_if_changed(&self, last_state: TrackedPhase) -> Result<bool> {
        let facts = self.facts.collect().context("collect facts")?;
        let print = fingerprint(&facts)?;
        if self.saved.fingerprint().as_deref() == Some(print.as_str()) {
            debug!("facts unchanged, registration skipped");
            return Ok(false);
        }
        info!("facts changed, registering node");
        self.send(last_state, &facts, &print)
    }
}
