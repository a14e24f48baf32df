//! Progress channel: a push observer for structured progress events.
//!
//! A `None` observer is legal and drops events. Observers must not fail;
//! the notify signature is infallible so emitters never handle sink errors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Progress events emitted by the resolver, planner, and executor.
///
/// The replay-run events carry a monotonically increasing per-replay `seq`
/// assigned by the executor.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum ProgressEvent {
    /// An inferred destination matched no registered job. Not an error;
    /// the upstream may live outside Optimus.
    UnknownDependencyUsed { job: String, dependency: String },
    /// A job spec finished dependency resolution.
    JobResolved { project: String, job: String },
    /// The planner added a node to the execution tree.
    ReplayPlanNodeAdded {
        project: String,
        job: String,
        runs: usize,
    },
    /// The executor cleared and re-triggered a run instant.
    ReplayRunTriggered {
        replay_id: Uuid,
        project: String,
        job: String,
        run: DateTime<Utc>,
        seq: u64,
    },
    /// A re-triggered run instant reached a terminal scheduler state.
    ReplayRunTerminal {
        replay_id: Uuid,
        project: String,
        job: String,
        run: DateTime<Utc>,
        /// Terminal scheduler state, `"success"` or `"failed"`.
        state: String,
        seq: u64,
    },
}

/// Observer sink. Implementations must be cheap and non-blocking; the core
/// calls notify inline.
pub trait ProgressObserver: Send + Sync {
    fn notify(&self, event: &ProgressEvent);
}

/// Notify helper tolerating an absent observer.
pub fn notify(observer: Option<&dyn ProgressObserver>, event: ProgressEvent) {
    if let Some(observer) = observer {
        observer.notify(&event);
    }
}

/// Observer that records every event, for tests and dry-run display.
#[derive(Default)]
pub struct RecordingObserver {
    events: std::sync::Mutex<Vec<ProgressEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl ProgressObserver for RecordingObserver {
    fn notify(&self, event: &ProgressEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
