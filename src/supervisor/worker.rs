//! Worker records held in the supervisor registry.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::supervisor::{HealthTier, OutputBuffer, WorkerState};

/// Parameters for spawning a worker.
#[derive(Debug, Clone, Default)]
pub struct SpawnRequest {
    /// Unique name among live workers.
    pub handle: String,
    /// Grouping label; the configured default when absent.
    pub team_name: Option<String>,
    /// Directory to run in; the current directory when absent.
    pub working_directory: Option<PathBuf>,
    /// Message sent once the process has had time to start.
    pub initial_message: Option<String>,
    /// Session to resume.
    pub session_token: Option<String>,
    /// Opaque reference to an external task.
    pub task_id: Option<String>,
}

impl SpawnRequest {
    #[must_use]
    pub fn new(handle: impl Into<String>) -> Self {
        Self {
            handle: handle.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn team(mut self, team: impl Into<String>) -> Self {
        self.team_name = Some(team.into());
        self
    }

    #[must_use]
    pub fn working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    #[must_use]
    pub fn initial_message(mut self, message: impl Into<String>) -> Self {
        self.initial_message = Some(message.into());
        self
    }

    #[must_use]
    pub fn resume(mut self, session_token: impl Into<String>) -> Self {
        self.session_token = Some(session_token.into());
        self
    }

    #[must_use]
    pub fn task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }
}

/// Signals the driver task forwards to the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProcessSignal {
    Terminate,
    Kill,
}

/// Public snapshot of a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: String,
    pub handle: String,
    pub team_name: String,
    pub session_token: Option<String>,
    pub working_directory: PathBuf,
    pub state: WorkerState,
    pub health: HealthTier,
    pub restart_count: u32,
    pub current_task_id: Option<String>,
    pub spawned_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub pid: Option<u32>,
}

/// Registry entry for a live worker.
#[derive(Debug)]
pub(crate) struct Worker {
    pub id: String,
    pub handle: String,
    pub team_name: String,
    pub session_token: Option<String>,
    pub working_directory: PathBuf,
    pub state: WorkerState,
    pub health: HealthTier,
    pub restart_count: u32,
    pub current_task_id: Option<String>,
    pub spawned_at: DateTime<Utc>,
    pub last_heartbeat: Instant,
    pub last_heartbeat_at: DateTime<Utc>,
    pub pid: Option<u32>,
    pub output: OutputBuffer,
    /// Lines for the stdin writer; dropping it closes stdin.
    pub input: Option<mpsc::UnboundedSender<String>>,
    pub signals: mpsc::UnboundedSender<ProcessSignal>,
    /// Cancelled once the worker has been finalized and removed.
    pub exited: CancellationToken,
    /// A restart has claimed this worker.
    pub restarting: bool,
}

impl Worker {
    pub fn heartbeat(&mut self) {
        self.last_heartbeat = Instant::now();
        self.last_heartbeat_at = Utc::now();
    }

    /// Time since the last heartbeat as seen from `now`.
    pub fn idle_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_heartbeat)
    }

    pub fn info(&self) -> WorkerInfo {
        WorkerInfo {
            id: self.id.clone(),
            handle: self.handle.clone(),
            team_name: self.team_name.clone(),
            session_token: self.session_token.clone(),
            working_directory: self.working_directory.clone(),
            state: self.state,
            health: self.health,
            restart_count: self.restart_count,
            current_task_id: self.current_task_id.clone(),
            spawned_at: self.spawned_at,
            last_heartbeat: self.last_heartbeat_at,
            pid: self.pid,
        }
    }
}
