// Bounded retry with capped exponential backoff

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::warn;

use crate::types::AppResult;

/// Capped exponential delay schedule: `base * 2^attempt`, never above `max`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            jitter: false,
        }
    }

    /// Scale each delay by a random factor in `[0.5, 1.0]`.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        let delay = self.base.saturating_mul(factor).min(self.max);

        if self.jitter {
            delay.mul_f64(rand::thread_rng().gen_range(0.5..=1.0))
        } else {
            delay
        }
    }
}

/// Result of a retried operation together with the attempt it ended on.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: AppResult<T>,
    pub attempt: u32,
}

/// Run `operation` starting at `start_attempt`, retrying transient errors
/// until `max_attempts` operations have been made in total.
///
/// Non-transient errors are returned immediately.
pub async fn with_retry<F, Fut, T>(
    backoff: &Backoff,
    max_attempts: u32,
    start_attempt: u32,
    mut operation: F,
) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    let mut attempt = start_attempt;

    loop {
        match operation(attempt).await {
            Ok(value) => {
                return RetryOutcome {
                    result: Ok(value),
                    attempt,
                }
            }
            Err(error) if error.is_transient() && attempt + 1 < max_attempts => {
                let delay = backoff.delay(attempt - start_attempt);
                warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Transient failure, retrying"
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(error) => {
                return RetryOutcome {
                    result: Err(error),
                    attempt,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AppError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_doubles_and_caps() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(500));
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(2), Duration::from_millis(400));
        assert_eq!(backoff.delay(3), Duration::from_millis(500));
        assert_eq!(backoff.delay(60), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let backoff =
            Backoff::new(Duration::from_millis(100), Duration::from_secs(1)).with_jitter(true);
        for attempt in 0..5 {
            let delay = backoff.delay(attempt);
            let ceiling = Backoff::new(Duration::from_millis(100), Duration::from_secs(1)).delay(attempt);
            assert!(delay <= ceiling);
            assert!(delay * 2 + Duration::from_micros(1) >= ceiling);
        }
    }

    #[tokio::test]
    async fn test_retries_transient_errors_until_success() {
        let calls = AtomicU32::new(0);
        let backoff = Backoff::new(Duration::from_millis(1), Duration::from_millis(2));

        let outcome = with_retry(&backoff, 5, 0, |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(AppError::TransientService("503".into()))
                } else {
                    Ok("job-1")
                }
            }
        })
        .await;

        assert_eq!(outcome.result.unwrap(), "job-1");
        assert_eq!(outcome.attempt, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let backoff = Backoff::new(Duration::from_millis(1), Duration::from_millis(2));

        let outcome: RetryOutcome<()> = with_retry(&backoff, 5, 0, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(AppError::PermanentService("400 bad request".into())) }
        })
        .await;

        assert!(matches!(outcome.result, Err(AppError::PermanentService(_))));
        assert_eq!(outcome.attempt, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_budget_counts_from_start_attempt() {
        let calls = AtomicU32::new(0);
        let backoff = Backoff::new(Duration::from_millis(1), Duration::from_millis(2));

        let outcome: RetryOutcome<()> = with_retry(&backoff, 3, 1, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(AppError::TransientService("timeout".into())) }
        })
        .await;

        assert!(outcome.result.is_err());
        assert_eq!(outcome.attempt, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
