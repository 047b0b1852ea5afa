//! Bounded exponential backoff for store calls.

use std::future::Future;
use std::time::Duration;

use chaintwin_db::DbError;

/// Delay before the first retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(100);

/// Upper bound on any single delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(2);

/// Retry schedule for transient store failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first retry. Doubles on each subsequent retry.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Total attempts per call, including the first. At least 1.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            max_attempts: 3,
        }
    }
}

/// Store calls made on behalf of one ingest call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    /// Store calls issued, successful or not.
    pub store_calls: u32,
    /// Calls that failed with a transient connectivity fault.
    pub connectivity_faults: u32,
    /// Conditional writes rejected for a stale version.
    pub version_conflicts: u32,
}

impl Tally {
    /// Whether any fault was absorbed along the way.
    pub const fn had_faults(&self) -> bool {
        self.connectivity_faults > 0 || self.version_conflicts > 0
    }
}

impl RetryPolicy {
    /// A policy with the default delays and `max_attempts` total attempts.
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (0-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.base_delay
            .saturating_mul(2_u32.saturating_pow(retry))
            .min(self.max_delay)
    }

    /// Run `call`, retrying transient failures with backoff.
    ///
    /// Every attempt is counted in `tally`. Non-transient errors and
    /// successes return immediately; the last transient error is returned
    /// once attempts are exhausted.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &'static str,
        tally: &mut Tally,
        mut call: F,
    ) -> Result<T, DbError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DbError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            tally.store_calls = tally.store_calls.saturating_add(1);
            match call().await {
                Err(e) if e.is_transient() => {
                    tally.connectivity_faults = tally.connectivity_faults.saturating_add(1);
                    if attempt >= self.max_attempts {
                        return Err(e);
                    }
                    let delay = self.delay_for(attempt.saturating_sub(1));
                    tracing::debug!(
                        operation,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "Transient store failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn outage() -> DbError {
        DbError::Connectivity {
            operation: "node fetch",
            message: String::from("refused"),
        }
    }

    #[test]
    fn delays_double_and_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(4), Duration::from_millis(1600));
        assert_eq!(policy.delay_for(5), Duration::from_secs(2));
        assert_eq!(policy.delay_for(40), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_within_budget() {
        let calls = AtomicU32::new(0);
        let mut tally = Tally::default();
        let started = tokio::time::Instant::now();

        let result = RetryPolicy::default()
            .run("node fetch", &mut tally, || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(outage())
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(tally.store_calls, 3);
        assert_eq!(tally.connectivity_faults, 2);
        assert_eq!(started.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let mut tally = Tally::default();
        let result: Result<(), DbError> = RetryPolicy::with_max_attempts(3)
            .run("node fetch", &mut tally, || async { Err(outage()) })
            .await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(tally.store_calls, 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let mut tally = Tally::default();
        let result: Result<(), DbError> = RetryPolicy::default()
            .run("node fetch", &mut tally, || async {
                Err(DbError::Decode(String::from("bad row")))
            })
            .await;
        assert!(matches!(result, Err(DbError::Decode(_))));
        assert_eq!(tally.store_calls, 1);
        assert!(!tally.had_faults());
    }
}
