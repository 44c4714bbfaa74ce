//! Supervisor for a fleet of long-lived Claude Code workers.
//!
//! This module owns the worker registry and connects the process spawner,
//! line framer, event classifier, output buffers and health monitor
//! together. Every worker gets two background tasks: a writer that feeds its
//! stdin and a driver that reads its output, forwards termination signals and
//! finalizes the worker once the process is gone.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::future::join_all;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::process::{ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cli::{
    classify, describe_exit, encode_user_message, framed_lines, Classified, ResultRecord,
    SpawnError, WorkerProcess, WorkerRecord,
};
use crate::config::FleetConfig;
use crate::supervisor::worker::{ProcessSignal, Worker};
use crate::supervisor::{
    transition, EventBus, EventKind, HealthCounts, HealthMonitor, HealthSweep, HealthTier,
    OutputBuffer, SpawnRequest, SupervisorEvent, Transition, WorkerInfo, WorkerState,
};

/// How long to keep reading stdout after the process has been reaped.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Error type for supervisor operations.
#[derive(thiserror::Error, Debug)]
pub enum SupervisorError {
    /// Maximum concurrent workers reached.
    #[error("Maximum workers reached: {limit}")]
    CapacityReached { limit: usize },

    /// A live worker already uses this handle.
    #[error("Handle already in use: {handle}")]
    DuplicateHandle { handle: String },

    /// Handles must contain a non-whitespace character.
    #[error("Worker handle must not be empty")]
    EmptyHandle,

    /// No live worker matches the id or handle.
    #[error("Worker not found: {key}")]
    WorkerNotFound { key: String },

    /// Another restart of this worker is already under way.
    #[error("Restart already in progress for {handle}")]
    RestartInProgress { handle: String },

    /// The handle has used up its restarts.
    #[error("Restart limit reached for {handle}: {attempts} attempts")]
    RestartLimitReached { handle: String, attempts: u32 },

    /// The supervisor no longer accepts new workers.
    #[error("Supervisor is shutting down")]
    ShuttingDown,

    /// The worker process could not be started.
    #[error("Failed to spawn worker: {0}")]
    Spawn(#[from] SpawnError),
}

#[derive(Debug, Default)]
struct Registry {
    workers: HashMap<String, Worker>,
    handles: HashMap<String, String>,
}

impl Registry {
    /// Resolve an id or a handle to a worker id.
    fn resolve(&self, key: &str) -> Option<String> {
        if self.workers.contains_key(key) {
            return Some(key.to_string());
        }
        self.handles.get(key).cloned()
    }

    fn lookup_mut(&mut self, key: &str) -> Option<&mut Worker> {
        let id = self.resolve(key)?;
        self.workers.get_mut(&id)
    }

    fn lookup(&self, key: &str) -> Option<&Worker> {
        let id = self.resolve(key)?;
        self.workers.get(&id)
    }

    fn insert(&mut self, worker: Worker) {
        self.handles.insert(worker.handle.clone(), worker.id.clone());
        self.workers.insert(worker.id.clone(), worker);
    }

    fn remove(&mut self, id: &str) -> Option<Worker> {
        let worker = self.workers.remove(id)?;
        if self.handles.get(&worker.handle).map(String::as_str) == Some(id) {
            self.handles.remove(&worker.handle);
        }
        Some(worker)
    }
}

#[derive(Debug)]
struct MonitorHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Debug)]
struct Inner {
    config: FleetConfig,
    registry: Mutex<Registry>,
    events: EventBus,
    shutdown: CancellationToken,
    monitor: Mutex<Option<MonitorHandle>>,
}

/// Supervisor for a set of long-lived worker processes.
///
/// Cloning is cheap and every clone refers to the same registry. All
/// operations must be called from within a tokio runtime.
#[derive(Debug, Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    #[must_use]
    pub fn new(config: FleetConfig) -> Self {
        let events = EventBus::new(config.event_capacity);
        Self {
            inner: Arc::new(Inner {
                config,
                registry: Mutex::new(Registry::default()),
                events,
                shutdown: CancellationToken::new(),
                monitor: Mutex::new(None),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &FleetConfig {
        &self.inner.config
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.inner
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, worker_id: &str, handle: &str, kind: EventKind) {
        self.inner
            .events
            .publish(SupervisorEvent::new(worker_id, handle, kind));
    }

    /// Receive every event published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.inner.events.subscribe()
    }

    /// Like [`Supervisor::subscribe`], as a stream that skips lag gaps.
    pub fn event_stream(&self) -> impl futures_core::Stream<Item = SupervisorEvent> {
        self.inner.events.stream()
    }

    /// Whether [`Supervisor::shutdown`] has been called.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Spawn a new worker.
    ///
    /// The worker starts in [`WorkerState::Starting`]; readiness arrives later
    /// as a `ready` event. An initial message, if any, is sent after the
    /// configured delay.
    ///
    /// # Errors
    ///
    /// Fails without touching the registry when shutting down, at capacity,
    /// when the handle is empty or taken, or when the process cannot start.
    /// The registry is not locked while the process launches, so the checks
    /// run again afterwards; a process that loses that race is killed.
    pub fn spawn(&self, mut request: SpawnRequest) -> Result<WorkerInfo, SupervisorError> {
        let initial_message = request.initial_message.take();
        let info = self.spawn_worker(request, 0)?;

        if let Some(message) = initial_message {
            let supervisor = self.clone();
            let id = info.id.clone();
            let delay = self.inner.config.initial_message_delay();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if !supervisor.send(&id, &message) {
                    tracing::warn!(worker_id = %id, "Initial message not delivered");
                }
            });
        }

        Ok(info)
    }

    /// Check that a worker named `handle` may join the registry.
    fn admit(&self, registry: &Registry, handle: &str) -> Result<(), SupervisorError> {
        if self.is_shutting_down() {
            return Err(SupervisorError::ShuttingDown);
        }
        if registry.handles.contains_key(handle) {
            return Err(SupervisorError::DuplicateHandle {
                handle: handle.to_string(),
            });
        }
        let limit = self.inner.config.max_workers;
        if registry.workers.len() >= limit {
            return Err(SupervisorError::CapacityReached { limit });
        }
        Ok(())
    }

    fn spawn_worker(
        &self,
        request: SpawnRequest,
        restart_count: u32,
    ) -> Result<WorkerInfo, SupervisorError> {
        let handle = request.handle.trim().to_string();
        if handle.is_empty() {
            return Err(SupervisorError::EmptyHandle);
        }

        let config = &self.inner.config;
        self.admit(&self.registry(), &handle)?;

        let working_directory = request
            .working_directory
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));

        let mut builder = config.command.builder().working_dir(&working_directory);
        if let Some(token) = &request.session_token {
            builder = builder.resume(token);
        }

        let mut process = WorkerProcess::spawn(&builder)?;
        let stdin = process
            .take_stdin()
            .ok_or(SpawnError::MissingPipe("stdin"))?;
        let stdout = process
            .take_stdout()
            .ok_or(SpawnError::MissingPipe("stdout"))?;
        let stderr = process
            .take_stderr()
            .ok_or(SpawnError::MissingPipe("stderr"))?;

        // The registry was unlocked while the process started.
        let mut registry = self.registry();
        if let Err(e) = self.admit(&registry, &handle) {
            tracing::debug!(
                handle = %handle,
                error = %e,
                "Worker rejected after start, killing process"
            );
            return Err(e);
        }

        let id = Uuid::new_v4().to_string();
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let now = Utc::now();

        let worker = Worker {
            id: id.clone(),
            handle: handle.clone(),
            team_name: request
                .team_name
                .unwrap_or_else(|| config.default_team.clone()),
            session_token: request.session_token,
            working_directory,
            state: WorkerState::Starting,
            health: HealthTier::Healthy,
            restart_count,
            current_task_id: request.task_id,
            spawned_at: now,
            last_heartbeat: Instant::now(),
            last_heartbeat_at: now,
            pid: process.id(),
            output: OutputBuffer::new(config.output_capacity),
            input: Some(input_tx),
            signals: signal_tx,
            exited: CancellationToken::new(),
            restarting: false,
        };
        let info = worker.info();
        registry.insert(worker);
        drop(registry);

        tokio::spawn(
            self.clone()
                .write_input(id.clone(), handle.clone(), stdin, input_rx),
        );
        tokio::spawn(self.clone().drive(
            id.clone(),
            handle.clone(),
            process,
            stdout,
            stderr,
            signal_rx,
        ));

        tracing::info!(
            worker_id = %id,
            handle = %handle,
            pid = ?info.pid,
            restart_count,
            resume = info.session_token.is_some(),
            "Worker spawned"
        );
        Ok(info)
    }

    /// Send a user message to a worker.
    ///
    /// Returns false, with no side effects, if no live worker matches or the
    /// worker is stopping. Delivery is asynchronous; write failures show up
    /// as `error` events.
    pub fn send(&self, id_or_handle: &str, message: &str) -> bool {
        let line = match encode_user_message(message) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode user message");
                return false;
            }
        };

        let mut registry = self.registry();
        let Some(worker) = registry.lookup_mut(id_or_handle) else {
            tracing::debug!(key = %id_or_handle, "Send to unknown worker");
            return false;
        };
        if worker.state.is_shutting_down() {
            return false;
        }
        let Some(input) = worker.input.as_ref() else {
            return false;
        };
        if input.send(line).is_err() {
            tracing::debug!(worker_id = %worker.id, "Worker input closed");
            return false;
        }

        transition(&mut worker.state, WorkerState::Working);
        worker.output.push(format!("[user] {message}"));
        true
    }

    /// Stop a worker and wait until it is gone.
    ///
    /// Closes stdin and sends SIGTERM, waits up to the dismiss grace period,
    /// then kills the process and waits up to the force-kill timeout. A
    /// process that still has not been reaped is evicted from the registry
    /// anyway. Returns false if no live worker matches.
    pub async fn dismiss(&self, id_or_handle: &str) -> bool {
        let (id, handle, exited, signals) = {
            let mut registry = self.registry();
            let Some(worker) = registry.lookup_mut(id_or_handle) else {
                return false;
            };
            let first = transition(&mut worker.state, WorkerState::Stopping) == Transition::Applied;
            worker.input.take();
            if first {
                let _ = worker.signals.send(ProcessSignal::Terminate);
            }
            (
                worker.id.clone(),
                worker.handle.clone(),
                worker.exited.clone(),
                worker.signals.clone(),
            )
        };

        tracing::info!(worker_id = %id, handle = %handle, "Dismissing worker");

        let config = &self.inner.config;
        if tokio::time::timeout(config.dismiss_grace(), exited.cancelled())
            .await
            .is_ok()
        {
            return true;
        }

        tracing::warn!(
            worker_id = %id,
            handle = %handle,
            grace_ms = config.dismiss_grace_ms,
            "Worker did not exit within grace period, killing"
        );
        let _ = signals.send(ProcessSignal::Kill);
        if tokio::time::timeout(config.force_kill_timeout(), exited.cancelled())
            .await
            .is_ok()
        {
            return true;
        }

        tracing::error!(
            worker_id = %id,
            handle = %handle,
            "Worker not reaped after kill, evicting"
        );
        self.evict(&id);
        true
    }

    /// Dismiss every live worker concurrently. Returns how many were dismissed.
    pub async fn dismiss_all(&self) -> usize {
        let ids: Vec<String> = self.registry().workers.keys().cloned().collect();
        join_all(ids.iter().map(|id| self.dismiss(id)))
            .await
            .into_iter()
            .filter(|dismissed| *dismissed)
            .count()
    }

    /// Replace a worker with a fresh one under the same handle.
    ///
    /// The new worker keeps the handle, team, working directory, session
    /// token and task reference, and carries the incremented restart count
    /// from the moment it is created.
    ///
    /// # Errors
    ///
    /// Fails if the worker is unknown, is already being restarted or has used
    /// up its restarts, or if the re-spawn fails. A failed re-spawn is also
    /// published as an `error` event; it is not retried.
    pub async fn restart(&self, id_or_handle: &str) -> Result<WorkerInfo, SupervisorError> {
        let (id, request, restart_count) = {
            let mut registry = self.registry();
            let worker = registry.lookup_mut(id_or_handle).ok_or_else(|| {
                SupervisorError::WorkerNotFound {
                    key: id_or_handle.to_string(),
                }
            })?;
            if worker.restarting {
                return Err(SupervisorError::RestartInProgress {
                    handle: worker.handle.clone(),
                });
            }
            let max = self.inner.config.max_restart_attempts;
            if worker.restart_count >= max {
                return Err(SupervisorError::RestartLimitReached {
                    handle: worker.handle.clone(),
                    attempts: max,
                });
            }
            worker.restarting = true;
            let request = SpawnRequest {
                handle: worker.handle.clone(),
                team_name: Some(worker.team_name.clone()),
                working_directory: Some(worker.working_directory.clone()),
                initial_message: None,
                session_token: worker.session_token.clone(),
                task_id: worker.current_task_id.clone(),
            };
            (worker.id.clone(), request, worker.restart_count + 1)
        };

        let handle = request.handle.clone();
        self.dismiss(&id).await;

        match self.spawn_worker(request, restart_count) {
            Ok(info) => {
                tracing::info!(
                    previous_id = %id,
                    worker_id = %info.id,
                    handle = %handle,
                    restart_count,
                    "Worker restarted"
                );
                self.publish(
                    &info.id,
                    &handle,
                    EventKind::Restart {
                        previous_id: id,
                        restart_count,
                    },
                );
                Ok(info)
            }
            Err(e) => {
                tracing::error!(worker_id = %id, handle = %handle, error = %e, "Restart failed");
                self.publish(
                    &id,
                    &handle,
                    EventKind::Error {
                        message: format!("Restart failed: {e}"),
                    },
                );
                Err(e)
            }
        }
    }

    /// Recompute health tiers as of `now` and publish `unhealthy` events.
    ///
    /// Returns the ids of workers that just became unhealthy and are due an
    /// automatic restart. Stopping workers are skipped, and a worker that is
    /// already unhealthy is not reported again.
    pub fn sweep_health_at(&self, now: Instant) -> Vec<String> {
        let config = &self.inner.config;
        let thresholds = config.thresholds();
        let mut events = Vec::new();
        let mut due = Vec::new();

        {
            let mut registry = self.registry();
            for worker in registry.workers.values_mut() {
                if worker.state.is_shutting_down() {
                    continue;
                }
                let idle = worker.idle_at(now);
                let tier = HealthTier::from_idle(idle, &thresholds);
                let previous = std::mem::replace(&mut worker.health, tier);
                if tier == previous {
                    continue;
                }
                tracing::debug!(
                    worker_id = %worker.id,
                    from = ?previous,
                    to = ?tier,
                    "Health changed"
                );
                if tier != HealthTier::Unhealthy {
                    continue;
                }

                let idle_ms = u64::try_from(idle.as_millis()).unwrap_or(u64::MAX);
                tracing::warn!(
                    worker_id = %worker.id,
                    handle = %worker.handle,
                    idle_ms,
                    "Worker unhealthy"
                );
                events.push(SupervisorEvent::new(
                    &worker.id,
                    &worker.handle,
                    EventKind::Unhealthy {
                        idle_ms,
                        restart_count: worker.restart_count,
                    },
                ));

                if !config.auto_restart {
                    continue;
                }
                if worker.restart_count < config.max_restart_attempts {
                    due.push(worker.id.clone());
                } else {
                    tracing::error!(
                        worker_id = %worker.id,
                        handle = %worker.handle,
                        attempts = worker.restart_count,
                        "Restart attempts exhausted, leaving worker as is"
                    );
                }
            }
        }

        for event in events {
            self.inner.events.publish(event);
        }
        due
    }

    /// Sweep health as of `now` and restart the workers that are due.
    ///
    /// Returns the replacement workers that started successfully.
    pub async fn check_health_at(&self, now: Instant) -> Vec<WorkerInfo> {
        let due = self.sweep_health_at(now);
        join_all(due.iter().map(|id| self.restart(id)))
            .await
            .into_iter()
            .filter_map(Result::ok)
            .collect()
    }

    /// Sweep health now and restart the workers that are due.
    pub async fn check_health(&self) -> Vec<WorkerInfo> {
        self.check_health_at(Instant::now()).await
    }

    /// Start the periodic health monitor. Does nothing if it already runs
    /// or the supervisor is shutting down.
    pub fn start_health_monitor(&self) {
        let mut slot = self
            .inner
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() || self.is_shutting_down() {
            return;
        }
        let monitor = HealthMonitor::new(self.inner.config.health_check_interval());
        let cancel = monitor.cancellation_token();
        let task = monitor.spawn(self.clone());
        *slot = Some(MonitorHandle { cancel, task });
    }

    /// Stop the health monitor, refuse new workers and dismiss all workers.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();

        let monitor = self
            .inner
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(monitor) = monitor {
            monitor.cancel.cancel();
            if let Err(e) = monitor.task.await {
                tracing::warn!(error = %e, "Health monitor task failed");
            }
        }

        let dismissed = self.dismiss_all().await;
        tracing::info!(dismissed, "Supervisor shut down");
    }

    /// Attach or clear the external task reference of a worker.
    pub fn set_current_task(&self, id_or_handle: &str, task_id: Option<String>) -> bool {
        let mut registry = self.registry();
        let Some(worker) = registry.lookup_mut(id_or_handle) else {
            return false;
        };
        worker.current_task_id = task_id;
        true
    }

    /// Snapshots of all live workers, oldest first.
    #[must_use]
    pub fn list(&self) -> Vec<WorkerInfo> {
        let mut workers: Vec<WorkerInfo> =
            self.registry().workers.values().map(Worker::info).collect();
        workers.sort_by_key(|w| w.spawned_at);
        workers
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<WorkerInfo> {
        self.registry().workers.get(id).map(Worker::info)
    }

    #[must_use]
    pub fn get_by_handle(&self, handle: &str) -> Option<WorkerInfo> {
        let registry = self.registry();
        let id = registry.handles.get(handle)?;
        registry.workers.get(id).map(Worker::info)
    }

    #[must_use]
    pub fn live_count(&self) -> usize {
        self.registry().workers.len()
    }

    #[must_use]
    pub fn health_counts(&self) -> HealthCounts {
        let mut counts = HealthCounts::default();
        for worker in self.registry().workers.values() {
            counts.record(worker.health);
        }
        counts
    }

    /// Recent output lines of a worker, oldest first.
    #[must_use]
    pub fn recent_output(&self, id_or_handle: &str) -> Option<Vec<String>> {
        self.registry()
            .lookup(id_or_handle)
            .map(|worker| worker.output.snapshot())
    }

    /// Feed queued input lines to the worker's stdin until the queue closes.
    async fn write_input(
        self,
        id: String,
        handle: String,
        mut stdin: ChildStdin,
        mut input: mpsc::UnboundedReceiver<String>,
    ) {
        while let Some(line) = input.recv().await {
            let written: std::io::Result<()> = async {
                stdin.write_all(line.as_bytes()).await?;
                stdin.flush().await
            }
            .await;
            if let Err(e) = written {
                tracing::warn!(worker_id = %id, error = %e, "Failed to write to worker stdin");
                self.publish(
                    &id,
                    &handle,
                    EventKind::Error {
                        message: format!("Failed to write to worker stdin: {e}"),
                    },
                );
                break;
            }
        }
        tracing::trace!(worker_id = %id, "Worker stdin closed");
    }

    /// Pump a worker's output until the process exits, then finalize it.
    async fn drive(
        self,
        id: String,
        handle: String,
        mut process: WorkerProcess,
        stdout: ChildStdout,
        stderr: ChildStderr,
        mut signals: mpsc::UnboundedReceiver<ProcessSignal>,
    ) {
        let stdout_lines = framed_lines(stdout);
        let stderr_lines = framed_lines(stderr);
        tokio::pin!(stdout_lines);
        tokio::pin!(stderr_lines);
        let mut stdout_open = true;
        let mut stderr_open = true;

        let status = loop {
            tokio::select! {
                line = stdout_lines.next(), if stdout_open => match line {
                    Some(Ok(line)) => self.handle_line(&id, &line),
                    Some(Err(e)) => {
                        stdout_open = false;
                        self.report_read_error(&id, &handle, "stdout", &e);
                    }
                    None => stdout_open = false,
                },
                line = stderr_lines.next(), if stderr_open => match line {
                    Some(Ok(line)) => self.handle_stderr(&id, &line),
                    Some(Err(e)) => {
                        stderr_open = false;
                        self.report_read_error(&id, &handle, "stderr", &e);
                    }
                    None => stderr_open = false,
                },
                Some(signal) = signals.recv() => {
                    let delivered = match signal {
                        ProcessSignal::Terminate => process.terminate(),
                        ProcessSignal::Kill => process.force_kill(),
                    };
                    if let Err(e) = delivered {
                        tracing::warn!(worker_id = %id, ?signal, error = %e, "Failed to signal worker");
                    }
                }
                status = process.wait() => break status,
            }
        };

        if stdout_open {
            let drain = async {
                while let Some(Ok(line)) = stdout_lines.next().await {
                    self.handle_line(&id, &line);
                }
            };
            if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, drain).await.is_err() {
                tracing::debug!(worker_id = %id, "Stdout still open after exit");
            }
        }

        self.finalize(&id, &handle, status);
    }

    /// Classify one stdout line and apply its effects to the worker.
    fn handle_line(&self, id: &str, line: &str) {
        let classified = classify(line);
        let mut events = Vec::new();
        let mut registry = self.registry();
        let Some(worker) = registry.workers.get_mut(id) else {
            return;
        };

        let (raw, record) = match classified {
            Classified::Blank => return,
            Classified::Text(text) => {
                worker.output.push(text);
                return;
            }
            Classified::Record { raw, record } => (raw, record),
        };

        worker.heartbeat();
        events.push(EventKind::Output { record: raw });

        match record {
            WorkerRecord::Init { session_id } => {
                worker.session_token = Some(session_id.clone());
                if transition(&mut worker.state, WorkerState::Ready) != Transition::Rejected {
                    tracing::info!(worker_id = %id, session_id = %session_id, "Worker ready");
                    events.push(EventKind::Ready {
                        session_token: session_id,
                    });
                }
            }
            WorkerRecord::Assistant { texts } => {
                transition(&mut worker.state, WorkerState::Working);
                for text in texts {
                    worker.output.push(text);
                }
            }
            WorkerRecord::Result(result) => {
                transition(&mut worker.state, WorkerState::Ready);
                worker.output.push(format_result(&result));
                events.push(EventKind::Result {
                    text: result.result,
                    duration_ms: result.duration_ms,
                    is_error: result.is_error,
                });
            }
            WorkerRecord::Unrecognized => {}
        }

        let handle = worker.handle.clone();
        drop(registry);
        for kind in events {
            self.publish(id, &handle, kind);
        }
    }

    fn report_read_error(&self, id: &str, handle: &str, stream: &str, error: &std::io::Error) {
        tracing::warn!(worker_id = %id, stream, error = %error, "Failed to read worker output");
        self.publish(
            id,
            handle,
            EventKind::Error {
                message: format!("Failed to read worker {stream}: {error}"),
            },
        );
    }

    fn handle_stderr(&self, id: &str, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        tracing::debug!(worker_id = %id, line = %line, "Worker stderr");
        if let Some(worker) = self.registry().workers.get_mut(id) {
            worker.output.push(format!("[stderr] {line}"));
        }
    }

    /// Mark a worker stopped, remove it, publish `exit` and wake waiters.
    fn finalize(&self, id: &str, handle: &str, status: std::io::Result<ExitStatus>) {
        let (code, signal) = match &status {
            Ok(status) => describe_exit(status),
            Err(e) => {
                tracing::warn!(worker_id = %id, error = %e, "Failed to wait for worker");
                self.publish(
                    id,
                    handle,
                    EventKind::Error {
                        message: format!("Failed to wait for worker: {e}"),
                    },
                );
                (None, None)
            }
        };

        let Some(mut worker) = self.registry().remove(id) else {
            // Already evicted by dismiss.
            return;
        };
        let expected = worker.state == WorkerState::Stopping;
        transition(&mut worker.state, WorkerState::Stopped);

        if expected {
            tracing::info!(worker_id = %id, handle = %handle, ?code, ?signal, "Worker exited");
        } else {
            tracing::warn!(
                worker_id = %id,
                handle = %handle,
                ?code,
                ?signal,
                "Worker exited unexpectedly"
            );
        }
        self.publish(
            id,
            handle,
            EventKind::Exit {
                code,
                signal,
                expected,
            },
        );
        worker.exited.cancel();
    }

    /// Drop a worker whose process could not be reaped.
    fn evict(&self, id: &str) {
        let Some(mut worker) = self.registry().remove(id) else {
            return;
        };
        transition(&mut worker.state, WorkerState::Stopped);
        self.publish(
            id,
            &worker.handle,
            EventKind::Exit {
                code: None,
                signal: None,
                expected: true,
            },
        );
        worker.exited.cancel();
    }
}

#[async_trait::async_trait]
impl HealthSweep for Supervisor {
    async fn sweep(&self) {
        let restarted = self.check_health().await;
        if !restarted.is_empty() {
            tracing::info!(count = restarted.len(), "Health sweep restarted workers");
        }
    }
}

/// Output buffer line for a finished turn.
fn format_result(result: &ResultRecord) -> String {
    let label = if result.is_error { "[error]" } else { "[result]" };
    match result.duration_ms {
        Some(ms) => format!(
            "{label} {} ({:.1}s)",
            result.result,
            Duration::from_millis(ms).as_secs_f64()
        ),
        None => format!("{label} {}", result.result),
    }
}
