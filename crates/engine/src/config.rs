//! Scheduler tuning.
//!
//! Retry counts, backoff and timeouts have no built-in defaults: they are
//! product decisions and must be supplied by the deployment, usually through
//! [`EngineSettings`] loaded from a config file or the environment.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Tuning knobs for the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Total attempts per node, first try included (`>= 1`).
    pub max_attempts: u32,
    /// Base delay for exponential back-off between retries.
    pub retry_base_delay: Duration,
    /// Upper bound on a single back-off delay.
    pub retry_max_delay: Duration,
    /// Budget for the whole run, measured from when it starts running.
    pub run_timeout: Duration,
    /// Budget for a single executor attempt; an attempt that overruns is
    /// abandoned and counted as a transient failure.
    pub node_timeout: Duration,
    /// Budget for a single credential resolution.
    pub credential_timeout: Duration,
}

impl SchedulerConfig {
    /// Delay before retrying after the `failed_attempt`-th failure (1-based):
    /// `base * 2^(n-1)`, capped at `retry_max_delay`.
    pub fn backoff(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(31);
        self.retry_base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.retry_max_delay)
            .min(self.retry_max_delay)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.max_attempts == 0 {
            return Err(EngineError::InvalidSettings("max_attempts must be at least 1".into()));
        }
        if self.retry_base_delay > self.retry_max_delay {
            return Err(EngineError::InvalidSettings(
                "retry base delay exceeds retry max delay".into(),
            ));
        }
        for (name, value) in [
            ("run_timeout", self.run_timeout),
            ("node_timeout", self.node_timeout),
            ("credential_timeout", self.credential_timeout),
        ] {
            if value.is_zero() {
                return Err(EngineError::InvalidSettings(format!("{name} must be non-zero")));
            }
        }
        Ok(())
    }
}

/// Serializable form of [`SchedulerConfig`]. Every field is required.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSettings {
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub run_timeout_secs: u64,
    pub node_timeout_secs: u64,
    pub credential_timeout_secs: u64,
}

impl TryFrom<EngineSettings> for SchedulerConfig {
    type Error = EngineError;

    fn try_from(settings: EngineSettings) -> Result<Self, Self::Error> {
        let config = SchedulerConfig {
            max_attempts: settings.max_attempts,
            retry_base_delay: Duration::from_millis(settings.retry_base_delay_ms),
            retry_max_delay: Duration::from_millis(settings.retry_max_delay_ms),
            run_timeout: Duration::from_secs(settings.run_timeout_secs),
            node_timeout: Duration::from_secs(settings.node_timeout_secs),
            credential_timeout: Duration::from_secs(settings.credential_timeout_secs),
        };
        config.validate()?;
        Ok(config)
    }
}
