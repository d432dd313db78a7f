use crate::config::{env_parse, env_string};
use std::time::Duration;

/// Upper bound on the doubling exponent; larger attempts are capped anyway
const MAX_EXPONENT: u32 = 20;

/// Floor for every reconnect delay
pub const MIN_BASE_DELAY: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    Fixed,
    Exponential,
}

/// Reconnect delay as a pure function of the attempt counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub strategy: BackoffStrategy,
    pub base: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base: Duration::from_secs(2),
            max: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    pub fn fixed(delay: Duration) -> Self {
        let delay = delay.max(MIN_BASE_DELAY);
        Self {
            strategy: BackoffStrategy::Fixed,
            base: delay,
            max: delay,
        }
    }

    /// Load policy from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let strategy = match env_string("RECONNECT_STRATEGY").as_deref() {
            Some("fixed") => BackoffStrategy::Fixed,
            _ => BackoffStrategy::Exponential,
        };
        let mut base = Duration::from_millis(env_parse(
            "RECONNECT_BASE_MS",
            defaults.base.as_millis() as u64,
        ));
        if base < MIN_BASE_DELAY {
            tracing::warn!(
                "RECONNECT_BASE_MS={} is below the {}ms floor, using the floor",
                base.as_millis(),
                MIN_BASE_DELAY.as_millis()
            );
            base = MIN_BASE_DELAY;
        }
        let max = Duration::from_millis(env_parse(
            "RECONNECT_MAX_MS",
            defaults.max.as_millis() as u64,
        ));

        Self {
            strategy,
            base,
            max: max.max(base),
        }
    }

    /// Delay before reconnect attempt number `attempt` (0-based).
    /// Never shorter than [`MIN_BASE_DELAY`].
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base.max(MIN_BASE_DELAY);
        let delay = match self.strategy {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Exponential => {
                let factor = 1u32 << attempt.min(MAX_EXPONENT);
                base.saturating_mul(factor)
            }
        };
        delay.min(self.max.max(base))
    }
}
