//! Heartbeat-based health tiers and the periodic health monitor.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Health classification derived from time since the last heartbeat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthTier {
    #[default]
    Healthy,
    Degraded,
    Unhealthy,
}

/// Idle thresholds separating the health tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthThresholds {
    /// Idle time beyond which a worker is degraded.
    pub degraded_after: Duration,
    /// Idle time beyond which a worker is unhealthy.
    pub unhealthy_after: Duration,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            degraded_after: Duration::from_secs(30),
            unhealthy_after: Duration::from_secs(60),
        }
    }
}

impl HealthTier {
    /// Classify an idle duration. Both bounds are exclusive: exactly
    /// `unhealthy_after` is still degraded.
    #[must_use]
    pub fn from_idle(idle: Duration, thresholds: &HealthThresholds) -> Self {
        if idle > thresholds.unhealthy_after {
            Self::Unhealthy
        } else if idle > thresholds.degraded_after {
            Self::Degraded
        } else {
            Self::Healthy
        }
    }
}

/// Number of live workers in each tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCounts {
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
}

impl HealthCounts {
    pub fn record(&mut self, tier: HealthTier) {
        match tier {
            HealthTier::Healthy => self.healthy += 1,
            HealthTier::Degraded => self.degraded += 1,
            HealthTier::Unhealthy => self.unhealthy += 1,
        }
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.healthy + self.degraded + self.unhealthy
    }
}

/// Something the monitor can sweep on each tick.
#[async_trait::async_trait]
pub trait HealthSweep: Send + Sync {
    /// Recompute health and apply remediation.
    async fn sweep(&self);
}

/// Runs a [`HealthSweep`] on a fixed period until cancelled.
#[derive(Debug)]
pub struct HealthMonitor {
    period: Duration,
    cancel: CancellationToken,
}

impl HealthMonitor {
    #[must_use]
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Token that stops the monitor when cancelled.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Start sweeping on a background task.
    ///
    /// The first sweep happens one period after the call. A sweep that takes
    /// longer than the period delays the next one rather than bunching ticks.
    pub fn spawn<S>(self, target: S) -> JoinHandle<()>
    where
        S: HealthSweep + 'static,
    {
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + self.period;
            let mut interval = tokio::time::interval_at(start, self.period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            tracing::debug!(period = ?self.period, "Health monitor started");
            loop {
                tokio::select! {
                    biased;

                    () = self.cancel.cancelled() => break,
                    _ = interval.tick() => target.sweep().await,
                }
            }
            tracing::debug!("Health monitor stopped");
        })
    }
}
