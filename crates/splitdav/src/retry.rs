//! Bounded retries with exponential backoff for backend requests.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{ProxyError, ProxyResult};

/// How often and how patiently a failed backend request is retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Factor applied to the delay after every retry.
    pub backoff_multiplier: f64,
    /// Upper bound for a single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::from_millis(200),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(10),
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::new(0)
    }

    /// Delay before retry number `attempt` (0-based), capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay_ms =
            self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        if !delay_ms.is_finite() || delay_ms >= self.max_delay.as_millis() as f64 {
            return self.max_delay;
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Duration::from_millis(delay_ms as u64)
    }

    /// Runs `op` until it succeeds, fails with an error `retryable` rejects,
    /// or the retry budget is spent. `op` receives the attempt number.
    pub async fn run<T, F, Fut>(
        &self,
        what: &str,
        retryable: impl Fn(&ProxyError) -> bool,
        mut op: F,
    ) -> ProxyResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = ProxyResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.max_retries && retryable(&e) => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        "{what} failed (attempt {}/{}): {e}; retrying in {delay:?}",
                        attempt + 1,
                        self.max_retries + 1
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Retry predicate for idempotent metadata and pass-through requests.
pub fn is_transient(e: &ProxyError) -> bool {
    e.is_transient()
}

/// Retry predicate for chunk uploads: anything but a client error from the
/// backend is worth another attempt.
pub fn is_chunk_retryable(e: &ProxyError) -> bool {
    match e {
        ProxyError::BackendStatus { status, .. } => {
            status.is_server_error() || status.as_u16() == 408 || status.as_u16() == 429
        }
        ProxyError::BackendUnavailable(_) | ProxyError::BackendTimeout(_) | ProxyError::Io(_) => {
            true
        }
        _ => false,
    }
}
