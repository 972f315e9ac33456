//! Reconnection policy: how many times and how long to wait between
//! attempts to re-establish a dropped connection.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::millis;
use crate::error::LinkError;

/// Delay growth between successive reconnection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// `base × attempt`
    #[default]
    Linear,
    /// `base × 2^(attempt - 1)`
    Exponential,
}

/// Bounded reconnection policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Attempts allowed before giving up. Zero disables reconnection.
    pub max_attempts: u32,
    #[serde(rename = "base_delay_ms", with = "millis")]
    pub base_delay: Duration,
    pub backoff: Backoff,
    /// Upper bound on any single delay. [`validate`](ReconnectPolicy::validate)
    /// rejects a bound that would truncate a delay within the budget.
    #[serde(rename = "max_delay_ms", with = "millis")]
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            backoff: Backoff::Linear,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl ReconnectPolicy {
    /// A policy that never reconnects.
    pub fn disabled() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    /// Delay before the given attempt (1-based), capped by `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.uncapped_delay(attempt).min(self.max_delay)
    }

    fn uncapped_delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self.backoff {
            Backoff::Linear => self.base_delay.saturating_mul(attempt),
            Backoff::Exponential => self
                .base_delay
                .saturating_mul(2u32.saturating_pow(attempt - 1)),
        }
    }

    /// Check that each delay within the attempt budget is strictly longer
    /// than the one before it.
    ///
    /// # Errors
    ///
    /// Returns `LinkError::Configuration` when the base delay is zero or
    /// `max_delay` would cap the delay before the last allowed attempt.
    pub fn validate(&self) -> Result<(), LinkError> {
        if self.max_attempts < 2 {
            return Ok(());
        }
        if self.base_delay.is_zero() {
            return Err(LinkError::Configuration(
                "Reconnect base delay must be positive".to_string(),
            ));
        }
        let last = self.uncapped_delay(self.max_attempts);
        if last > self.max_delay {
            return Err(LinkError::Configuration(format!(
                "Reconnect max delay {:?} is shorter than the {:?} wait before attempt {}",
                self.max_delay, last, self.max_attempts
            )));
        }
        Ok(())
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    pub fn allows(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}
