//! Outbound HTTP.
//!
//! [`Transport`] decouples the phase machine and control loop from the HTTP
//! client so tests can script server replies and inspect what was sent.

use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, instrument};

pub trait Transport {
    /// `GET url?query`, returning the raw body.
    fn get(&self, url: &str, query: &[(&str, &str)]) -> Result<Vec<u8>>;
    /// `POST` an `application/x-www-form-urlencoded` body.
    fn post_form(&self, url: &str, fields: &[(&str, &str)]) -> Result<String>;
    /// `POST` a JSON document with an explicit content type.
    fn post_json(&self, url: &str, content_type: &str, body: &str) -> Result<String>;
}

/// [`Transport`] backed by a blocking `ureq` agent.
///
/// Non-2xx responses are errors.
#[derive(Debug, Clone)]
pub struct UreqTransport {
    agent: ureq::Agent,
}

impl UreqTransport {
    pub fn new(timeout: Duration) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build();
        Self {
            agent: config.into(),
        }
    }
}

impl Transport for UreqTransport {
    #[instrument(skip_all, fields(url = %url))]
    fn get(&self, url: &str, query: &[(&str, &str)]) -> Result<Vec<u8>> {
        let mut request = self.agent.get(url);
        for (key, value) in query {
            request = request.query(*key, *value);
        }
        let mut response = request.call().with_context(|| format!("GET {url}"))?;
        let body = response
            .body_mut()
            .read_to_vec()
            .with_context(|| format!("read response body from {url}"))?;
        debug!(bytes = body.len(), "response received");
        Ok(body)
    }

    #[instrument(skip_all, fields(url = %url))]
    fn post_form(&self, url: &str, fields: &[(&str, &str)]) -> Result<String> {
        let mut response = self
            .agent
            .post(url)
            .send_form(fields.iter().copied())
            .with_context(|| format!("POST {url}"))?;
        response
            .body_mut()
            .read_to_string()
            .with_context(|| format!("read response body from {url}"))
    }

    #[instrument(skip_all, fields(url = %url, content_type = %content_type))]
    fn post_json(&self, url: &str, content_type: &str, body: &str) -> Result<String> {
        let mut response = self
            .agent
            .post(url)
            .header("Content-Type", content_type)
            .send(body)
            .with_context(|| format!("POST {url}"))?;
        response
            .body_mut()
            .read_to_string()
            .with_context(|| format!("read response body from {url}"))
    }
}
