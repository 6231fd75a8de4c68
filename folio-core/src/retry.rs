use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::error::{Error, Result};

const MAX_JITTER_MS: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first.
    pub retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            base_delay: Duration::from_millis(300),
            max_delay: Duration::from_millis(3_000),
        }
    }
}

impl RetryPolicy {
    /// Backoff before the attempt following `attempt` (0-based), without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Runs `operation` until it succeeds, `should_retry` rejects the error, or
/// `policy.retries` attempts have been made. [`Error::Aborted`] is returned
/// immediately whatever `should_retry` says.
pub async fn with_retry<T, F, Fut, S>(policy: &RetryPolicy, should_retry: S, mut operation: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
    S: Fn(&Error) -> bool,
{
    let attempts = policy.retries.max(1);
    let mut attempt = 0;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(Error::Aborted) => return Err(Error::Aborted),
            Err(err) => {
                if attempt + 1 >= attempts || !should_retry(&err) {
                    return Err(err);
                }
                let jitter = rand::thread_rng().gen_range(0..=MAX_JITTER_MS);
                let delay = policy.backoff(attempt) + Duration::from_millis(jitter);
                debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after failure"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorCode, StructuredError};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn recoverable() -> Error {
        StructuredError::http_status(ErrorCode::NetworkManifestFetch, "u", 503).into()
    }

    fn fatal() -> Error {
        StructuredError::http_status(ErrorCode::NetworkManifestFetch, "u", 404).into()
    }

    async fn run_counting(policy: RetryPolicy, error: Error) -> (Result<()>, u32) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result = with_retry(&policy, Error::is_recoverable, move |_| {
            let counter = Arc::clone(&counter);
            let error = error.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(error)
            }
        })
        .await;
        (result, calls.load(Ordering::SeqCst))
    }

    #[tokio::test(start_paused = true)]
    async fn recoverable_errors_use_every_attempt() {
        let policy = RetryPolicy {
            retries: 4,
            ..RetryPolicy::default()
        };
        let (result, calls) = run_counting(policy, recoverable()).await;
        assert_eq!(calls, 4);
        assert_eq!(result.unwrap_err(), recoverable());
    }

    #[tokio::test(start_paused = true)]
    async fn non_recoverable_errors_are_attempted_once() {
        let (result, calls) = run_counting(RetryPolicy::default(), fatal()).await;
        assert_eq!(calls, 1);
        assert_eq!(result.unwrap_err().code(), Some(ErrorCode::NetworkManifestFetch));
    }

    #[tokio::test(start_paused = true)]
    async fn aborted_bypasses_should_retry() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result = with_retry(&RetryPolicy::default(), |_| true, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(Error::Aborted) }
        })
        .await;
        assert!(result.unwrap_err().is_aborted());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let result = with_retry(&RetryPolicy::default(), Error::is_recoverable, |attempt| async move {
            if attempt < 2 {
                Err(recoverable())
            } else {
                Ok(attempt)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            retries: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(3), Duration::from_millis(500));
        assert_eq!(policy.backoff(40), Duration::from_millis(500));
    }
}
