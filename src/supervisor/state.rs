//! Worker lifecycle state machine.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a worker.
///
/// `Starting -> Ready <-> Working -> Stopping -> Stopped`. Any live state may
/// also jump straight to `Stopped` when the process dies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    #[default]
    Starting,
    Ready,
    Working,
    Stopping,
    Stopped,
}

impl WorkerState {
    /// Whether `self -> next` is a defined edge.
    #[must_use]
    pub fn can_transition(self, next: Self) -> bool {
        use WorkerState::{Ready, Starting, Stopped, Stopping, Working};

        matches!(
            (self, next),
            (Starting, Ready | Working | Stopping | Stopped)
                | (Ready, Working | Stopping | Stopped)
                | (Working, Ready | Stopping | Stopped)
                | (Stopping, Stopped)
        )
    }

    /// Stopping or stopped; such workers take no input and are not swept.
    #[must_use]
    pub fn is_shutting_down(self) -> bool {
        matches!(self, Self::Stopping | Self::Stopped)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Working => "working",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a requested transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// State changed.
    Applied,
    /// Already in the requested state.
    Unchanged,
    /// Not a defined edge; state left as is.
    Rejected,
}

/// Apply `next` to `state` if the edge is defined.
pub fn transition(state: &mut WorkerState, next: WorkerState) -> Transition {
    if *state == next {
        return Transition::Unchanged;
    }
    if state.can_transition(next) {
        tracing::debug!(from = %state, to = %next, "State transition");
        *state = next;
        Transition::Applied
    } else {
        tracing::debug!(from = %state, to = %next, "Ignoring undefined state transition");
        Transition::Rejected
    }
}
