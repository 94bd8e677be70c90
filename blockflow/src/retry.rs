//! Retry policy with linear backoff, jitter and a total time budget.
//!
//! Each logical operation (one block, one stage) owns its own [`RetryPolicy`];
//! the attempt counter is never shared between blocks.
//!
//! ```text
//! delay = min(remaining_budget, attempt * unit + uniform(0, max_jitter))
//! ```

use crate::cancellation::CancellationToken;
use crate::errors::{BlockflowError, ItemError};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Delays at or below this value end the retry sequence.
pub const MIN_DELAY: Duration = Duration::from_millis(1);

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum total duration of the retry sequence, in seconds.
    #[serde(default = "default_budget_secs")]
    pub budget_secs: u64,
    /// Backoff unit multiplied by the attempt number, in milliseconds.
    #[serde(default = "default_unit_ms")]
    pub unit_ms: u64,
    /// Upper bound of the random jitter, in milliseconds.
    #[serde(default = "default_max_jitter_ms")]
    pub max_jitter_ms: u64,
}

fn default_budget_secs() -> u64 {
    300
}

fn default_unit_ms() -> u64 {
    1000
}

fn default_max_jitter_ms() -> u64 {
    100
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            budget_secs: default_budget_secs(),
            unit_ms: default_unit_ms(),
            max_jitter_ms: default_max_jitter_ms(),
        }
    }
}

impl RetryConfig {
    /// Creates a new retry config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the total budget.
    #[must_use]
    pub fn with_budget_secs(mut self, secs: u64) -> Self {
        self.budget_secs = secs;
        self
    }

    /// Sets the backoff unit.
    #[must_use]
    pub fn with_unit_ms(mut self, unit: u64) -> Self {
        self.unit_ms = unit;
        self
    }

    /// Sets the jitter bound.
    #[must_use]
    pub fn with_max_jitter_ms(mut self, jitter: u64) -> Self {
        self.max_jitter_ms = jitter;
        self
    }

    /// Builds a fresh policy for one logical operation.
    pub fn policy(&self) -> Result<RetryPolicy, BlockflowError> {
        Ok(RetryPolicy::new(Duration::from_secs(self.budget_secs))?
            .with_unit(Duration::from_millis(self.unit_ms))
            .with_max_jitter(Duration::from_millis(self.max_jitter_ms)))
    }
}

/// Outcome of asking the policy for the next delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    /// Whether another attempt may be made.
    pub can_retry: bool,
    /// How long to wait before that attempt. Zero when `can_retry` is false.
    pub delay: Duration,
}

impl RetryDecision {
    const EXHAUSTED: Self = Self {
        can_retry: false,
        delay: Duration::ZERO,
    };
}

/// Stateful backoff calculator for one logical operation.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    budget: Duration,
    unit: Duration,
    max_jitter: Duration,
    attempt: u32,
    started_at: Instant,
    exhausted: bool,
}

impl RetryPolicy {
    /// Creates a policy whose whole retry sequence fits in `budget`.
    ///
    /// # Errors
    ///
    /// Returns [`BlockflowError::InvalidArgument`] if `budget` is zero.
    pub fn new(budget: Duration) -> Result<Self, BlockflowError> {
        if budget.is_zero() {
            return Err(BlockflowError::InvalidArgument(
                "retry budget must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            budget,
            unit: Duration::from_millis(default_unit_ms()),
            max_jitter: Duration::from_millis(default_max_jitter_ms()),
            attempt: 0,
            started_at: Instant::now(),
            exhausted: false,
        })
    }

    /// Sets the backoff unit.
    #[must_use]
    pub fn with_unit(mut self, unit: Duration) -> Self {
        self.unit = unit;
        self
    }

    /// Sets the jitter bound. Zero disables jitter.
    #[must_use]
    pub fn with_max_jitter(mut self, jitter: Duration) -> Self {
        self.max_jitter = jitter;
        self
    }

    /// Number of delays handed out so far.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Total budget of the sequence.
    #[must_use]
    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Budget left, measured from policy creation.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.started_at.elapsed())
    }

    /// Delay before jitter for a 1-based attempt number.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        self.unit.saturating_mul(attempt)
    }

    /// Computes the delay before the next attempt and advances the counter.
    ///
    /// Once this returns `can_retry == false` it keeps doing so.
    pub fn next_delay(&mut self) -> RetryDecision {
        if self.exhausted {
            return RetryDecision::EXHAUSTED;
        }
        self.attempt = self.attempt.saturating_add(1);

        let remaining = self.remaining();
        if remaining.is_zero() {
            self.exhausted = true;
            return RetryDecision::EXHAUSTED;
        }

        let delay = (self.base_delay(self.attempt) + self.jitter()).min(remaining);
        if delay <= MIN_DELAY {
            self.exhausted = true;
            return RetryDecision::EXHAUSTED;
        }

        RetryDecision {
            can_retry: true,
            delay,
        }
    }

    fn jitter(&self) -> Duration {
        let max = u64::try_from(self.max_jitter.as_millis()).unwrap_or(u64::MAX);
        if max == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=max))
        }
    }
}

/// Runs `operation` until it succeeds, the policy is exhausted or `token` fires.
///
/// The operation receives the 1-based attempt number. Cancellation-kind errors
/// are returned as-is without retrying. Backoff sleeps wake up on cancellation.
///
/// # Errors
///
/// Returns [`ItemError::RetryExhausted`] wrapping the last failure once the
/// budget is consumed, or [`ItemError::Cancelled`] if the token fires.
pub async fn with_retry<T, F, Fut>(
    mut policy: RetryPolicy,
    token: &CancellationToken,
    key: &str,
    mut operation: F,
) -> Result<T, ItemError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ItemError>>,
{
    let mut attempts = 0u32;

    loop {
        if token.is_cancelled() {
            return Err(cancelled_error(token));
        }
        attempts += 1;

        let error = match operation(attempts).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_cancellation() => return Err(e),
            Err(e) => e,
        };

        let decision = policy.next_delay();
        if !decision.can_retry {
            return Err(ItemError::RetryExhausted {
                attempts,
                last_error: Box::new(error),
            });
        }

        debug!(
            key = %key,
            attempt = attempts,
            delay_ms = u64::try_from(decision.delay.as_millis()).unwrap_or(u64::MAX),
            error = %error,
            "Retrying after error"
        );

        if token
            .run_until_cancelled(tokio::time::sleep(decision.delay))
            .await
            .is_none()
        {
            return Err(cancelled_error(token));
        }
    }
}

fn cancelled_error(token: &CancellationToken) -> ItemError {
    ItemError::cancelled(token.reason().unwrap_or_else(|| "cancelled".to_string()))
}
