//! Progress reporting
//!
//! The orchestrator is the single writer of progress events for a
//! request; each observer gets its own channel, so every observer sees
//! the same wave-ordered sequence. Emission is best effort: a slow or
//! dropped observer never stalls the pipeline.

use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use super::stage::AgentKind;

/// Stage transition carried by a progress event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProgressStatus {
    Started,
    Completed,
    Failed,
}

/// One stage transition, as observers see it
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub request_id: String,
    pub stage: AgentKind,
    pub status: ProgressStatus,
    pub elapsed_ms: u64,
    pub used_fallback: bool,
}

/// Per-observer capacity; a full channel drops events for that observer
const OBSERVER_BUFFER: usize = 256;

/// Fan-out of progress events to any number of observers
#[derive(Default)]
pub struct ProgressBroadcaster {
    observers: Mutex<Vec<mpsc::Sender<ProgressEvent>>>,
}

impl ProgressBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new observer; the stream ends when the pipeline's
    /// broadcaster is dropped
    pub fn subscribe(&self) -> mpsc::Receiver<ProgressEvent> {
        let (tx, rx) = mpsc::channel(OBSERVER_BUFFER);
        self.observers.lock().expect("observer lock poisoned").push(tx);
        rx
    }

    /// Deliver an event to every live observer
    pub fn emit(&self, event: ProgressEvent) {
        let mut observers = self.observers.lock().expect("observer lock poisoned");
        observers.retain(|observer| match observer.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                // Observer failures are tolerated, not propagated
                debug!(stage = %event.stage, "Observer buffer full, event dropped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().expect("observer lock poisoned").len()
    }
}
