//! Bounded retry for idempotent bootstrap steps.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{MigrateResult, MigrationError};

/// Computes the delay before the retry following a failed attempt.
pub type DelayFn = dyn Fn(u32) -> Duration + Send + Sync;

/// Retry policy for schema, table and index creation.
///
/// ```rust
/// use std::time::Duration;
/// use strata_migrate::RetryPolicy;
///
/// let policy = RetryPolicy::new()
///     .max_attempts(5)
///     .initial_delay(Duration::from_millis(50));
/// assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
/// ```
#[derive(Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    #[serde(with = "duration_ms")]
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    #[serde(skip)]
    delay_fn: Option<Arc<DelayFn>>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            delay_fn: None,
        }
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("custom_delay", &self.delay_fn.is_some())
            .finish()
    }
}

impl RetryPolicy {
    /// Create the default policy.
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that retries without sleeping.
    pub fn immediate() -> Self {
        Self::default().with_delay_fn(|_| Duration::ZERO)
    }

    /// Set the attempt budget. Values below one are treated as one.
    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }

    /// Set initial delay.
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay.
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier.
    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Replace the backoff computation.
    pub fn with_delay_fn<F>(mut self, delay: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        self.delay_fn = Some(Arc::new(delay));
        self
    }

    /// Delay to wait after failed attempt `attempt` (zero based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if let Some(delay_fn) = &self.delay_fn {
            return delay_fn(attempt);
        }

        let base = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let capped = base.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Run `op` until it succeeds or the attempt budget is exhausted.
    ///
    /// `op` receives the zero-based attempt number. Every failure is logged;
    /// the error of the last attempt is returned.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> MigrateResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = MigrateResult<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut last_error: Option<MigrationError> = None;

        for attempt in 0..attempts {
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(operation, attempt = attempt + 1, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => {
                    warn!(
                        operation,
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        error = %err,
                        "Attempt failed"
                    );
                    last_error = Some(err);
                    if attempt + 1 < attempts {
                        let delay = self.delay_for_attempt(attempt);
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| MigrationError::database(format!("{} was never attempted", operation))))
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
