//! Bounded retry with backoff for flaky post-creation steps
//!
//! Machine creation polls for a DHCP address and retries the in-guest rename
//! a fixed number of times with linearly growing pauses. Both loops share
//! [`BoundedRetry`], which owns the attempt counter, computes delays from a
//! [`BackoffStrategy`], sleeps through an injectable [`Clock`] and aborts
//! promptly when its [`CancellationToken`] fires.

use crate::error::{HvnodeError, HvnodeResult};
use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Backoff strategy for retry operations
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed(Duration),
    /// Linear increase in delay (base * attempt)
    Linear { base: Duration, max: Duration },
}

impl BackoffStrategy {
    /// Calculate the delay for a given attempt
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            BackoffStrategy::Fixed(duration) => *duration,
            BackoffStrategy::Linear { base, max } => {
                let delay = base.saturating_mul(attempt);
                std::cmp::min(delay, *max)
            }
        }
    }
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Linear {
            base: Duration::from_secs(10),
            max: Duration::from_secs(60),
        }
    }
}

/// Configuration for a bounded retry loop
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the initial attempt)
    pub max_attempts: u32,
    /// Backoff strategy to use
    pub backoff: BackoffStrategy,
    /// Pause before the first attempt as well, not only between attempts
    pub delay_first: bool,
    /// Operation name used in log messages
    pub operation_name: String,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffStrategy::default(),
            delay_first: false,
            operation_name: "operation".to_string(),
        }
    }
}

impl RetryConfig {
    /// Linear backoff of `base * attempt`
    pub fn linear(attempts: u32, base: Duration) -> Self {
        Self {
            max_attempts: attempts,
            backoff: BackoffStrategy::Linear {
                base,
                max: base.saturating_mul(attempts.max(1)),
            },
            ..Default::default()
        }
    }

    /// Create a simple fixed delay retry config
    pub fn fixed(attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: attempts,
            backoff: BackoffStrategy::Fixed(delay),
            ..Default::default()
        }
    }

    pub fn with_operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = name.into();
        self
    }

    pub fn with_delay_first(mut self, delay_first: bool) -> Self {
        self.delay_first = delay_first;
        self
    }
}

/// Source of time for retry pauses.
#[async_trait]
pub trait Clock: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Clock backed by the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Sleep on `clock`, returning `Cancelled` if `cancel` fires first.
pub async fn cancellable_sleep(
    clock: &dyn Clock,
    cancel: &CancellationToken,
    duration: Duration,
    operation: &str,
) -> HvnodeResult<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(HvnodeError::cancelled(operation)),
        _ = clock.sleep(duration) => Ok(()),
    }
}

/// Caller-driven retry loop.
///
/// ```rust,ignore
/// let mut retry = BoundedRetry::new(&config, &clock, &cancel);
/// while retry.next_attempt().await? {
///     match step().await {
///         Ok(value) => return Ok(value),
///         Err(e) => last_error = Some(e),
///     }
/// }
/// ```
///
/// The loop body keeps full access to the caller's state, which a closure
/// based retry cannot offer when each attempt needs `&mut` borrows.
pub struct BoundedRetry<'a> {
    config: &'a RetryConfig,
    clock: &'a dyn Clock,
    cancel: &'a CancellationToken,
    attempt: u32,
}

impl<'a> BoundedRetry<'a> {
    pub fn new(config: &'a RetryConfig, clock: &'a dyn Clock, cancel: &'a CancellationToken) -> Self {
        Self {
            config,
            clock,
            cancel,
            attempt: 0,
        }
    }

    /// The attempt currently in progress, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Advance to the next attempt, pausing first where the backoff calls for it.
    ///
    /// Returns `Ok(false)` once the attempt budget is spent and
    /// `Err(Cancelled)` if the token fires during the pause.
    pub async fn next_attempt(&mut self) -> HvnodeResult<bool> {
        if self.cancel.is_cancelled() {
            return Err(HvnodeError::cancelled(self.config.operation_name.as_str()));
        }
        if self.attempt >= self.config.max_attempts {
            debug!(
                "{}: attempt budget of {} exhausted",
                self.config.operation_name, self.config.max_attempts
            );
            return Ok(false);
        }

        self.attempt += 1;

        let backoff_index = if self.config.delay_first {
            self.attempt
        } else {
            self.attempt - 1
        };
        if backoff_index > 0 {
            let delay = self.config.backoff.delay(backoff_index);
            info!(
                "{}: waiting {:?} before attempt {}/{}",
                self.config.operation_name, delay, self.attempt, self.config.max_attempts
            );
            cancellable_sleep(self.clock, self.cancel, delay, &self.config.operation_name).await?;
        }

        Ok(true)
    }
}
