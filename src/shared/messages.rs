//! Run events broadcast to observers

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use uuid::Uuid;

use super::state::RunPhase;
use crate::run::RunToken;
use crate::vision::ModelSlot;

/// Notifications emitted by the run controller
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    /// A run moved to a new phase
    PhaseChanged { token: RunToken, phase: RunPhase },
    /// A run published its results
    Completed { token: RunToken, word_count: usize },
    /// A run failed; the message is what the user sees
    Failed { token: RunToken, message: String },
    /// A run finished after being superseded; its result was dropped
    Discarded { token: RunToken },
    /// Displayed results were cleared by a model change or reset
    Cleared,
    /// A model slot was reconfigured
    ModelSelected { slot: ModelSlot, architecture: &'static str },
    /// Hover highlight changed
    WordActivated { id: Uuid, active: bool },
}

/// Fan-out of [`RunEvent`]s to any number of receivers
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<RunEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new receiver
    pub fn subscribe(&self) -> Receiver<RunEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Send to every live receiver, dropping the disconnected ones
    pub fn emit(&self, event: RunEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}
