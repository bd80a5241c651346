//! Retry policy for caller-side connect and enumerate loops
//!
//! The broker client never retries on its own. Callers that want the classic
//! "try again every second until it works" behaviour wrap single fallible
//! calls in a [`RetryPolicy`]; tests substitute [`RetryPolicy::immediate`].

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default delay between attempts
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

type Backoff = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// How often and how long to wait between attempts
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: Option<u32>,
    backoff: Backoff,
}

impl RetryPolicy {
    /// Unbounded retries with a fixed delay
    pub fn fixed(delay: Duration) -> Self {
        Self {
            max_attempts: None,
            backoff: Arc::new(move |_| delay),
        }
    }

    /// Unbounded retries without sleeping
    pub fn immediate() -> Self {
        Self::fixed(Duration::ZERO)
    }

    /// Give up after `attempts` tries (the first try counts)
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts.max(1));
        self
    }

    /// Replace the backoff function; it receives the 1-based number of the failed attempt
    pub fn with_backoff<F>(mut self, backoff: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        self.backoff = Arc::new(backoff);
        self
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    /// Delay to wait after the given failed attempt
    pub fn delay_after(&self, attempt: u32) -> Duration {
        (self.backoff)(attempt)
    }

    /// Run `op` until it succeeds or the attempt budget is spent
    pub async fn retry<T, E, F, Fut>(&self, operation: &str, op: F) -> Result<T, E>
    where
        E: fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.retry_if(operation, op, |_| true).await
    }

    /// Like [`retry`](Self::retry), but errors rejected by `should_retry` are returned at once
    pub async fn retry_if<T, E, F, Fut, P>(
        &self,
        operation: &str,
        mut op: F,
        mut should_retry: P,
    ) -> Result<T, E>
    where
        E: fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnMut(&E) -> bool,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation, attempt, "Succeeded after retrying");
                    }
                    return Ok(value);
                }
                Err(e) => {
                    if !should_retry(&e) {
                        return Err(e);
                    }
                    if self.max_attempts.is_some_and(|max| attempt >= max) {
                        warn!(operation, attempt, error = %e, "Giving up");
                        return Err(e);
                    }

                    let delay = self.delay_after(attempt);
                    warn!(
                        operation,
                        attempt,
                        error = %e,
                        "Attempt failed, retrying in {:?}",
                        delay
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    } else {
                        tokio::task::yield_now().await;
                    }
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(DEFAULT_RETRY_DELAY)
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("first_delay", &self.delay_after(1))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retry_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = RetryPolicy::immediate()
            .retry("test", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 4 {
                    Err(format!("failure {}", n))
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(result, Ok(4));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_retry_respects_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = RetryPolicy::immediate()
            .with_max_attempts(3)
            .retry("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("nope".to_string())
            })
            .await;

        assert_eq!(result, Err("nope".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_if_stops_on_other_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<(), &str> = RetryPolicy::immediate()
            .retry_if(
                "test",
                || async {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n == 0 {
                        Err("transient")
                    } else {
                        Err("fatal")
                    }
                },
                |e| *e == "transient",
            )
            .await;

        assert_eq!(result, Err("fatal"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_policy_waits_one_second() {
        let calls = AtomicU32::new(0);
        let start = tokio::time::Instant::now();
        let result: Result<(), &str> = RetryPolicy::default()
            .retry("test", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("not yet")
                } else {
                    Ok(())
                }
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[test]
    fn test_custom_backoff() {
        let policy = RetryPolicy::default()
            .with_backoff(|attempt| Duration::from_millis(100 * u64::from(attempt)));
        assert_eq!(policy.delay_after(3), Duration::from_millis(300));
        assert_eq!(policy.max_attempts(), None);
    }
}
