//! Signals that end the control loop's sleep.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopSignal {
    /// Stop the agent (SIGINT/SIGTERM).
    Shutdown,
    /// Re-execute the agent so it picks up a new configuration.
    Restart,
}

/// Receiving end, owned by the control loop.
#[derive(Debug)]
pub struct LoopSignals {
    tx: Sender<LoopSignal>,
    rx: Receiver<LoopSignal>,
}

/// Cloneable sending end for signal handlers and the control endpoint.
#[derive(Debug, Clone)]
pub struct SignalSender {
    tx: Sender<LoopSignal>,
}

impl LoopSignals {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self { tx, rx }
    }

    pub fn sender(&self) -> SignalSender {
        SignalSender {
            tx: self.tx.clone(),
        }
    }

    /// Sleep up to `timeout`, returning early with the first signal.
    pub fn wait(&self, timeout: Duration) -> Option<LoopSignal> {
        match self.rx.recv_timeout(timeout) {
            Ok(signal) => Some(signal),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }
}

impl Default for LoopSignals {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalSender {
    pub fn send(&self, signal: LoopSignal) {
        if self.tx.send(signal).is_err() {
            warn!(?signal, "control loop gone, signal dropped");
        }
    }
}
