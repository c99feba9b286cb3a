//! Shared state for the control endpoint handlers.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::io::config::AgentConfig;
use crate::io::state_store::StateStore;
use crate::signals::SignalSender;

#[derive(Clone)]
pub struct ControlState {
    pub store: Arc<StateStore>,
    /// Where `/setMkConfig` persists the merged configuration.
    pub config_path: PathBuf,
    /// Latest configuration, updated by each accepted `/setMkConfig`.
    config: Arc<Mutex<AgentConfig>>,
    pub signals: SignalSender,
}

impl ControlState {
    pub fn new(
        store: Arc<StateStore>,
        config_path: impl Into<PathBuf>,
        config: AgentConfig,
        signals: SignalSender,
    ) -> Self {
        Self {
            store,
            config_path: config_path.into(),
            config: Arc::new(Mutex::new(config)),
            signals,
        }
    }

    pub(crate) fn config(&self) -> MutexGuard<'_, AgentConfig> {
        self.config.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
