//! Exponential backoff between failed sync passes.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for backoff behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackoffConfig {
    /// Delay after the first failure, in milliseconds.
    pub initial_delay_millis: u64,
    /// Cap for exponential growth, in milliseconds.
    pub max_delay_millis: u64,
    /// Multiplier applied per consecutive failure.
    pub multiplier: f64,
    /// Whether to add jitter to delays.
    pub jitter: bool,
}

impl BackoffConfig {
    /// Create a new backoff configuration.
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay_millis: initial_delay.as_millis() as u64,
            max_delay_millis: max_delay.as_millis() as u64,
            ..Self::default()
        }
    }

    /// Set backoff multiplier.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Calculate delay for a given attempt number (0 = first failure).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let base_delay = self.initial_delay_millis as f64 * self.multiplier.powi(exponent);

        let capped_delay = base_delay.min(self.max_delay_millis as f64);

        let final_delay = if self.jitter {
            // Add random jitter of +/- 25%
            let jitter_factor = 0.75 + (rand::random::<f64>() * 0.5);
            capped_delay * jitter_factor
        } else {
            capped_delay
        };

        Duration::from_millis(final_delay as u64)
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_millis: 1_000,
            max_delay_millis: 60_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}
