use tokio::sync::broadcast;

use crate::trial::{TrialId, TrialState};

/// Experiment lifecycle events published by the scheduler.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum ExperimentEvent {
    /// A trial was created from an oracle suggestion (or batch builder).
    TrialCreated { trial: TrialId },
    /// A trial's jobs were submitted to their runners.
    TrialDispatched { trial: TrialId },
    /// The monitor observed a trial state change.
    TrialStateChanged { trial: TrialId, state: TrialState },
}

/// In-process event bus using a tokio broadcast channel.
///
/// Fan-out to all active subscribers; publishing never blocks, and a
/// subscriber that lags past the channel capacity observes `Lagged` rather
/// than stalling the monitor loop. Publishing with no subscribers is a
/// no-op.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<ExperimentEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: ExperimentEvent) {
        // An Err here only means nobody is listening.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExperimentEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
