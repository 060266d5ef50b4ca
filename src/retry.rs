//! Bounded retry with fixed delay and optional per-attempt deadline.
//!
//! The executor runs only on a cache miss; a cache hit bypasses rate
//! limiting, retries, and the deadline entirely, so cached results never
//! re-incur cost, latency, or failure risk. The delay between attempts is
//! fixed; there is no exponential backoff.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{CallError, Error, Result};

/// Decides whether a failed attempt consumes a retry slot or propagates.
pub type RetryPredicate = Arc<dyn Fn(&CallError) -> bool + Send + Sync>;

/// Default predicate: retry the provider's rate-limited rejections and
/// per-attempt timeouts; everything else propagates on the first attempt.
pub fn default_retryable(error: &CallError) -> bool {
    matches!(
        error,
        CallError::RateLimited(_) | CallError::AttemptTimeout(_)
    )
}

/// Retry policy for one wrapped operation.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Total number of attempts.
    pub max_retries: u32,
    /// Fixed delay between attempts.
    pub retry_delay: Duration,
    /// Per-attempt deadline. Asynchronous execution only: the blocking
    /// executor cannot cancel an in-flight attempt and ignores it.
    pub timeout: Option<Duration>,
    pub retryable: RetryPredicate,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_delay: Duration::from_secs(10),
            timeout: None,
            retryable: Arc::new(default_retryable),
        }
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("retry_delay", &self.retry_delay)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            max_retries,
            retry_delay,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retryable(
        mut self,
        retryable: impl Fn(&CallError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.retryable = Arc::new(retryable);
        self
    }

    /// Run `attempt` until it succeeds, a non-retryable error propagates, or
    /// all attempts are used up. Exhaustion surfaces
    /// [`Error::MaxRetriesExceeded`] carrying every recorded failure in
    /// order.
    pub async fn execute<T, F, Fut>(&self, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut failures = Vec::new();
        for n in 0..self.max_retries {
            let outcome = match self.timeout {
                Some(limit) => match tokio::time::timeout(limit, attempt()).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::Call(CallError::AttemptTimeout(limit))),
                },
                None => attempt().await,
            };
            match outcome {
                Ok(value) => return Ok(value),
                Err(Error::Call(e)) if (self.retryable)(&e) => {
                    tracing::debug!(attempt = n + 1, max = self.max_retries, "retryable failure: {e}");
                    failures.push(e);
                    if n + 1 < self.max_retries {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
                Err(other) => return Err(other),
            }
        }
        Err(Error::MaxRetriesExceeded { attempts: failures })
    }

    /// Synchronous twin of [`execute`](Self::execute). Sleeps block the
    /// calling thread; the per-attempt deadline does not apply.
    pub fn execute_blocking<T>(&self, mut attempt: impl FnMut() -> Result<T>) -> Result<T> {
        let mut failures = Vec::new();
        for n in 0..self.max_retries {
            match attempt() {
                Ok(value) => return Ok(value),
                Err(Error::Call(e)) if (self.retryable)(&e) => {
                    tracing::debug!(attempt = n + 1, max = self.max_retries, "retryable failure: {e}");
                    failures.push(e);
                    if n + 1 < self.max_retries {
                        std::thread::sleep(self.retry_delay);
                    }
                }
                Err(other) => return Err(other),
            }
        }
        Err(Error::MaxRetriesExceeded { attempts: failures })
    }
}
