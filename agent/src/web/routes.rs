//! Handlers for the local control endpoint.

use axum::Router;
use axum::extract::{Form, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::core::types::Phase;
use crate::io::config::write_config;
use crate::io::state_store::StateStore;
use crate::phases::end_phase;
use crate::signals::LoopSignal;
use crate::web::state::ControlState;

type HandlerError = (StatusCode, String);

pub fn router() -> Router<ControlState> {
    Router::new()
        .route("/health", get(health))
        .route("/vmodel", post(vmodel))
        .route("/setMkConfig", post(set_mk_config))
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Clone, Deserialize)]
pub struct PhaseActionForm {
    pub phase: String,
    pub action: String,
}

/// POST /vmodel - completion callback from background jobs.
async fn vmodel(
    State(state): State<ControlState>,
    Form(form): Form<PhaseActionForm>,
) -> Result<String, HandlerError> {
    phase_action(&state.store, &form)
}

/// POST /setMkConfig - persist a server configuration and restart.
///
/// The body is JSON but arrives as `text/json`, so it is read as text.
async fn set_mk_config(State(state): State<ControlState>, body: String) -> Result<String, HandlerError> {
    apply_config(&state, &body)
}

pub fn phase_action(store: &StateStore, form: &PhaseActionForm) -> Result<String, HandlerError> {
    let phase: Phase = form.phase.parse().map_err(|err: anyhow::Error| {
        warn!(phase = %form.phase, "rejecting phase action");
        (StatusCode::BAD_REQUEST, err.to_string())
    })?;
    if form.action != "end" {
        warn!(%phase, action = %form.action, "rejecting phase action");
        return Err((
            StatusCode::BAD_REQUEST,
            format!("unsupported action '{}'", form.action),
        ));
    }
    end_phase(store, phase).map_err(|err| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("{err:#}"),
        )
    })
}

pub fn apply_config(state: &ControlState, body: &str) -> Result<String, HandlerError> {
    let map: Value = serde_json::from_str(body)
        .map_err(|err| (StatusCode::BAD_REQUEST, format!("invalid JSON: {err}")))?;
    let mut current = state.config();
    let merged = current
        .merged_with(&map)
        .map_err(|err| (StatusCode::BAD_REQUEST, format!("{err:#}")))?;
    write_config(&state.config_path, &merged)
        .map_err(|err| (StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}")))?;
    info!(path = %state.config_path.display(), "configuration saved, restarting agent");
    *current = merged;
    drop(current);
    state.signals.send(LoopSignal::Restart);
    Ok("ok".to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::core::types::PhaseStatus;
    use crate::io::config::{AgentConfig, load_config};
    use crate::signals::LoopSignals;
    use crate::test_support::TestNode;
    use std::time::Duration;

    fn form(phase: &str, action: &str) -> PhaseActionForm {
        PhaseActionForm {
            phase: phase.to_string(),
            action: action.to_string(),
        }
    }

    #[test]
    fn end_action_completes_running_phase() {
        let node = TestNode::new().expect("node");
        node.store().set(Phase::Raid, PhaseStatus::Running).expect("set");

        let reply = phase_action(node.store(), &form("raid", "end")).expect("end");
        assert_eq!(reply, "Raid completed");
        assert_eq!(node.store().get(Phase::Raid), Some(PhaseStatus::Done));
    }

    #[test]
    fn unknown_phase_or_action_is_bad_request() {
        let node = TestNode::new().expect("node");
        let (status, _) = phase_action(node.store(), &form("gpu", "end")).unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = phase_action(node.store(), &form("raid", "start")).unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn config_is_persisted_and_restart_requested() {
        let node = TestNode::new().expect("node");
        let signals = LoopSignals::new();
        let path = node.root().join("mk_conf.toml");
        let state = ControlState::new(
            Arc::new(node.open_store()),
            &path,
            AgentConfig::default(),
            signals.sender(),
        );

        let reply = apply_config(&state, r#"{"mk_checkin_interval": 90, "mk_uri": "http://hanlon:8026"}"#)
            .expect("apply");
        assert_eq!(reply, "ok");
        let saved = load_config(&path).expect("load");
        assert_eq!(saved.mk_checkin_interval, 90);
        assert_eq!(saved.mk_uri.as_deref(), Some("http://hanlon:8026"));
        assert_eq!(signals.wait(Duration::ZERO), Some(LoopSignal::Restart));
    }

    #[test]
    fn invalid_config_is_rejected_without_restart() {
        let node = TestNode::new().expect("node");
        let signals = LoopSignals::new();
        let path = node.root().join("mk_conf.toml");
        let state = ControlState::new(
            Arc::new(node.open_store()),
            &path,
            AgentConfig::default(),
            signals.sender(),
        );

        for body in ["not json", r#"{"mk_checkin_interval": 0}"#, "[1, 2]"] {
            let (status, _) = apply_config(&state, body).unwrap_err();
            assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
        }
        assert!(!path.exists());
        assert_eq!(signals.wait(Duration::ZERO), None);
    }
}
