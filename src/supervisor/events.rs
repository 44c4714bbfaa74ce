//! Lifecycle events published by the supervisor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

/// Default capacity for the event broadcast channel.
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Kind-specific payload of a [`SupervisorEvent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    /// The worker finished initializing.
    Ready { session_token: String },
    /// Any protocol record, passed through verbatim.
    Output { record: serde_json::Value },
    /// A turn completed.
    Result {
        text: String,
        duration_ms: Option<u64>,
        is_error: bool,
    },
    /// A process-level failure that did not by itself stop the worker.
    Error { message: String },
    /// The process is gone and the worker has been removed.
    Exit {
        code: Option<i32>,
        signal: Option<i32>,
        /// False when the process exited without being dismissed.
        expected: bool,
    },
    /// The worker has just become unhealthy.
    Unhealthy { idle_ms: u64, restart_count: u32 },
    /// The worker replaced an earlier one with the same handle.
    Restart {
        previous_id: String,
        restart_count: u32,
    },
}

impl EventKind {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ready { .. } => "ready",
            Self::Output { .. } => "output",
            Self::Result { .. } => "result",
            Self::Error { .. } => "error",
            Self::Exit { .. } => "exit",
            Self::Unhealthy { .. } => "unhealthy",
            Self::Restart { .. } => "restart",
        }
    }
}

/// An event about one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorEvent {
    pub worker_id: String,
    pub handle: String,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl SupervisorEvent {
    #[must_use]
    pub fn new(worker_id: impl Into<String>, handle: impl Into<String>, kind: EventKind) -> Self {
        Self {
            worker_id: worker_id.into(),
            handle: handle.into(),
            at: Utc::now(),
            kind,
        }
    }
}

/// Fan-out of supervisor events to any number of subscribers.
///
/// Each subscriber sees events in publish order. A subscriber that falls more
/// than the channel capacity behind skips the oldest events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SupervisorEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CHANNEL_CAPACITY)
    }
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: SupervisorEvent) {
        tracing::trace!(
            worker_id = %event.worker_id,
            handle = %event.handle,
            kind = event.kind.name(),
            "Publishing event"
        );
        let _ = self.tx.send(event);
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.tx.subscribe()
    }

    /// Subscribe as a stream, logging and skipping over lag gaps.
    pub fn stream(&self) -> impl futures_core::Stream<Item = SupervisorEvent> {
        BroadcastStream::new(self.tx.subscribe()).filter_map(|item| match item {
            Ok(event) => Some(event),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Event subscriber lagged");
                None
            }
        })
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
