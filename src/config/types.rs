//! Configuration types.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cli::{WorkerProcessBuilder, DEFAULT_ARGS, DEFAULT_PROGRAM};
use crate::supervisor::{HealthThresholds, DEFAULT_EVENT_CHANNEL_CAPACITY, DEFAULT_OUTPUT_CAPACITY};

/// Command used to launch each worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCommand {
    /// Program to execute.
    #[serde(default = "default_program")]
    pub program: String,
    /// Arguments placed before `--resume`.
    #[serde(default = "default_args")]
    pub args: Vec<String>,
}

fn default_program() -> String {
    DEFAULT_PROGRAM.to_string()
}

fn default_args() -> Vec<String> {
    DEFAULT_ARGS.iter().map(|s| (*s).to_string()).collect()
}

impl Default for WorkerCommand {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: default_args(),
        }
    }
}

impl WorkerCommand {
    /// A command running `sh -c <script>`, handy for fake workers.
    #[must_use]
    pub fn shell(script: impl Into<String>) -> Self {
        Self {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.into()],
        }
    }

    #[must_use]
    pub fn builder(&self) -> WorkerProcessBuilder {
        WorkerProcessBuilder::new(&self.program).args(self.args.iter().cloned())
    }
}

/// Configuration for the worker fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Maximum number of live workers.
    pub max_workers: usize,
    /// Team used when a spawn request names none.
    pub default_team: String,
    /// Period of the health sweep.
    pub health_check_interval_ms: u64,
    /// Idle time after which a worker is degraded.
    pub degraded_after_ms: u64,
    /// Idle time after which a worker is unhealthy.
    pub unhealthy_after_ms: u64,
    /// How long dismiss waits after SIGTERM before killing.
    pub dismiss_grace_ms: u64,
    /// How long dismiss waits after SIGKILL before evicting the worker.
    pub force_kill_timeout_ms: u64,
    /// Automatic restarts allowed per handle.
    pub max_restart_attempts: u32,
    /// Restart workers that become unhealthy.
    pub auto_restart: bool,
    /// Lines of recent output kept per worker.
    pub output_capacity: usize,
    /// Delay before sending a spawn's initial message.
    pub initial_message_delay_ms: u64,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
    /// Worker command line.
    pub command: WorkerCommand,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            max_workers: 10,
            default_team: "default".to_string(),
            health_check_interval_ms: 15_000,
            degraded_after_ms: 30_000,
            unhealthy_after_ms: 60_000,
            dismiss_grace_ms: 5_000,
            force_kill_timeout_ms: 5_000,
            max_restart_attempts: 3,
            auto_restart: true,
            output_capacity: DEFAULT_OUTPUT_CAPACITY,
            initial_message_delay_ms: 2_000,
            event_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            command: WorkerCommand::default(),
        }
    }
}

impl FleetConfig {
    #[must_use]
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    #[must_use]
    pub fn thresholds(&self) -> HealthThresholds {
        HealthThresholds {
            degraded_after: Duration::from_millis(self.degraded_after_ms),
            unhealthy_after: Duration::from_millis(self.unhealthy_after_ms),
        }
    }

    #[must_use]
    pub fn dismiss_grace(&self) -> Duration {
        Duration::from_millis(self.dismiss_grace_ms)
    }

    #[must_use]
    pub fn force_kill_timeout(&self) -> Duration {
        Duration::from_millis(self.force_kill_timeout_ms)
    }

    #[must_use]
    pub fn initial_message_delay(&self) -> Duration {
        Duration::from_millis(self.initial_message_delay_ms)
    }

    /// Check the values for internal consistency.
    ///
    /// # Errors
    ///
    /// Returns a description of the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_workers == 0 {
            return Err("max_workers must be at least 1".to_string());
        }
        if self.output_capacity == 0 {
            return Err("output_capacity must be at least 1".to_string());
        }
        if self.event_capacity == 0 {
            return Err("event_capacity must be at least 1".to_string());
        }
        if self.health_check_interval_ms == 0 {
            return Err("health_check_interval_ms must be positive".to_string());
        }
        if self.degraded_after_ms >= self.unhealthy_after_ms {
            return Err("degraded_after_ms must be below unhealthy_after_ms".to_string());
        }
        if self.command.program.trim().is_empty() {
            return Err("command.program must not be empty".to_string());
        }
        Ok(())
    }
}
