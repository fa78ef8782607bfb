//! Deadlines and bounded exponential backoff for optimistic-concurrency retries.

use std::future::Future;
use std::time::{Duration, Instant};

use super::EngineError;

/// Point in time after which an operation must give up cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    pub fn none() -> Self {
        Self(None)
    }

    pub fn at(instant: Instant) -> Self {
        Self(Some(instant))
    }

    pub fn within(budget: Duration) -> Self {
        Self(Some(Instant::now() + budget))
    }

    pub fn expired(&self) -> bool {
        self.0.is_some_and(|at| Instant::now() >= at)
    }

    /// Time left, or `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.0.map(|at| at.saturating_duration_since(Instant::now()))
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts in total, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_delay: Duration::from_millis(2),
            max_delay: Duration::from_millis(250),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .backoff_multiplier
            .powi(attempt.saturating_sub(1).min(32) as i32);
        let delay = self.base_delay.mul_f64(exp);
        delay.min(self.max_delay)
    }
}

/// Run `attempt` until it stops returning a retryable conflict.
///
/// Conflicts never escape: once the attempt budget or the deadline runs out
/// they surface as `Timeout`. Any other error, and success, return at once.
pub(crate) async fn with_retry<T, F, Fut>(
    op: &'static str,
    policy: &RetryPolicy,
    deadline: Deadline,
    mut attempt: F,
) -> Result<T, EngineError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    let mut n = 0;
    loop {
        if deadline.expired() {
            return Err(EngineError::Timeout { op, attempts: n });
        }
        n += 1;
        match attempt(n).await {
            Err(e) if e.is_retryable() => {
                metrics::counter!(crate::observability::CONFLICT_RETRIES_TOTAL, "op" => op)
                    .increment(1);
                if n >= policy.max_attempts {
                    return Err(EngineError::Timeout { op, attempts: n });
                }
                let mut delay = policy.delay_for(n);
                if let Some(left) = deadline.remaining() {
                    if left.is_zero() {
                        return Err(EngineError::Timeout { op, attempts: n });
                    }
                    delay = delay.min(left);
                }
                tracing::debug!("{op}: {e}, retry {n} in {delay:?}");
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}
