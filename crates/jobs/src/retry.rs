//! Refire policy.
//!
//! A failed attempt is run again when its failure is retryable and the
//! attempt count is still under the configured maximum. A negative maximum
//! means "retry forever".

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::{FailureKind, JobError};

/// Backoff strategy for refires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay every time
    #[default]
    Fixed,
    /// base * attempt
    Linear,
    /// base * 2^(attempt - 1)
    Exponential,
}

/// Delay between a failed attempt and its refire. Defaults to immediate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Backoff {
    pub strategy: BackoffStrategy,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Backoff {
    pub fn immediate() -> Self {
        Self::default()
    }

    pub fn fixed(delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Fixed,
            base_delay: delay,
            max_delay: delay,
        }
    }

    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base_delay,
            max_delay,
        }
    }

    /// Delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 || self.base_delay.is_zero() {
            return Duration::ZERO;
        }

        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
            BackoffStrategy::Exponential => {
                let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
        };

        if self.max_delay.is_zero() {
            delay
        } else {
            delay.min(self.max_delay)
        }
    }
}

/// Outcome of a retry decision for one failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryDecision {
    pub retry: bool,
    pub reason: FailureKind,
    /// Zero-based attempt that just failed.
    pub attempt: u32,
    pub delay: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Negative means unlimited.
    pub max_retries: i32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_MAX_RETRIES)
    }
}

impl RetryPolicy {
    pub fn new(max_retries: i32) -> Self {
        Self {
            max_retries,
            backoff: Backoff::immediate(),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(-1)
    }

    pub fn no_retry() -> Self {
        Self::new(0)
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn is_unlimited(&self) -> bool {
        self.max_retries < 0
    }

    /// Pure decision for a failed attempt.
    pub fn decide(&self, attempt: u32, kind: FailureKind) -> RetryDecision {
        let under_limit = self.is_unlimited() || i64::from(attempt) < i64::from(self.max_retries);
        let retry = kind.is_retryable() && under_limit;
        RetryDecision {
            retry,
            reason: kind,
            attempt,
            delay: if retry {
                self.backoff.delay_for_attempt(attempt.saturating_add(1))
            } else {
                Duration::ZERO
            },
        }
    }

    /// Decide and log. Every retryable failure is logged at error level,
    /// whether or not it will be refired.
    pub fn should_retry(&self, attempt: u32, kind: FailureKind, cause: &JobError) -> RetryDecision {
        let decision = self.decide(attempt, kind);
        error!(
            attempt,
            max_retries = self.max_retries,
            reason = kind.as_str(),
            refire = decision.retry,
            error = %cause,
            "job attempt failed"
        );
        decision
    }
}
