//! Retry and backoff envelope (§4.6).
//!
//! Every collection operation runs through [`with_retry`], which merges the
//! effective [`RetryPolicy`] (operation over collection over database),
//! checks cancellation at entry and before each attempt, and sleeps an
//! exponential backoff — interruptible by cancellation — between failures.

use std::time::{Duration, Instant};

use docbase_core::cancel::{race_with_abort, sleep_interruptible, CancellationToken};
use docbase_core::error::{format_delay, Error, Result};

/// Governs whether and how a failed operation is retried.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// `false` disables retries unconditionally regardless of the other
    /// fields — the single attempt's result, success or failure, is final.
    pub enabled: bool,
    /// Maximum number of retry attempts after the first (so `retries: 3`
    /// allows up to 4 total attempts).
    pub retries: u32,
    pub min_timeout: Duration,
    pub max_timeout: Duration,
    pub factor: f64,
    /// Caps total elapsed time spent retrying; once exceeded, the last
    /// error is returned instead of sleeping again.
    pub max_retry_time: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            retries: 3,
            min_timeout: Duration::from_millis(100),
            max_timeout: Duration::from_secs(5),
            factor: 2.0,
            max_retry_time: None,
        }
    }
}

impl RetryPolicy {
    /// A policy equivalent to `retry: false` — exactly one attempt, ever.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            retries: 0,
            ..Self::default()
        }
    }

    /// `min(maxTimeout, minTimeout * factor^(attempt-1))`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let scaled = self.min_timeout.as_secs_f64() * self.factor.powi(attempt as i32 - 1);
        Duration::from_secs_f64(scaled.min(self.max_timeout.as_secs_f64()))
    }

    /// Merges operation-level over collection-level over database-level
    /// policy. The first `Some` wins in full — there is no field-by-field
    /// merge, matching a caller's expectation that supplying a policy at a
    /// more specific level replaces the less specific one outright.
    pub fn merge<'a>(
        database: &'a RetryPolicy,
        collection: Option<&'a RetryPolicy>,
        operation: Option<&'a RetryPolicy>,
    ) -> RetryPolicy {
        operation.or(collection).unwrap_or(database).clone()
    }
}

/// Context passed to an `onFailedAttempt` hook after each failed attempt.
#[derive(Debug, Clone)]
pub struct FailedAttempt<'a> {
    pub error: &'a Error,
    pub attempt_number: u32,
    pub retries_left: u32,
    pub elapsed: Duration,
    pub delay: Duration,
}

/// Runs `op` under `policy`, retrying per §4.6. `on_failed_attempt`, if
/// given, is invoked after every failed attempt (including the last).
pub fn with_retry<T>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    mut on_failed_attempt: Option<&mut dyn FnMut(FailedAttempt<'_>)>,
    mut op: impl FnMut() -> Result<T>,
) -> Result<T> {
    token.throw_if_aborted()?;
    let start = Instant::now();
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        match race_with_abort(token, &mut op) {
            Ok(value) => return Ok(value),
            Err(err) => {
                let retries_left = policy.retries.saturating_sub(attempt);
                let can_retry = policy.enabled && err.is_retryable() && attempt <= policy.retries;
                if !can_retry {
                    return Err(err);
                }

                let delay = policy.delay_for_attempt(attempt);
                if let Some(max_retry_time) = policy.max_retry_time {
                    if start.elapsed() + delay > max_retry_time {
                        return Err(err);
                    }
                }

                tracing::warn!(
                    attempt,
                    retries_left,
                    delay = %format_delay(delay),
                    error = %err,
                    "retrying operation after transient failure"
                );

                if let Some(hook) = on_failed_attempt.as_deref_mut() {
                    hook(FailedAttempt {
                        error: &err,
                        attempt_number: attempt,
                        retries_left,
                        elapsed: start.elapsed(),
                        delay,
                    });
                }

                sleep_interruptible(token, delay, Duration::from_millis(20))?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn disabled_policy_makes_exactly_one_attempt() {
        let policy = RetryPolicy::disabled();
        let token = CancellationToken::new();
        let attempts = Cell::new(0);
        let result = with_retry(&policy, &token, None, || {
            attempts.set(attempts.get() + 1);
            Err::<(), _>(Error::Connection("down".into()))
        });
        assert!(result.is_err());
        assert_eq!(attempts.get(), 1);
    }

    #[test]
    fn retries_exactly_n_plus_one_times_on_permanent_failure() {
        let mut policy = RetryPolicy::default();
        policy.retries = 2;
        policy.min_timeout = Duration::from_millis(1);
        policy.max_timeout = Duration::from_millis(2);
        let token = CancellationToken::new();
        let attempts = Cell::new(0);
        let result = with_retry(&policy, &token, None, || {
            attempts.set(attempts.get() + 1);
            Err::<(), _>(Error::Transaction("busy".into()))
        });
        assert!(result.is_err());
        assert_eq!(attempts.get(), 3);
    }

    #[test]
    fn non_retryable_error_stops_after_one_attempt() {
        let policy = RetryPolicy::default();
        let token = CancellationToken::new();
        let attempts = Cell::new(0);
        let result = with_retry(&policy, &token, None, || {
            attempts.set(attempts.get() + 1);
            Err::<(), _>(Error::validation("email", "required"))
        });
        assert!(result.is_err());
        assert_eq!(attempts.get(), 1);
    }

    #[test]
    fn succeeds_without_retry_when_op_succeeds_first_try() {
        let policy = RetryPolicy::default();
        let token = CancellationToken::new();
        let result = with_retry(&policy, &token, None, || Ok::<_, Error>(7));
        assert_eq!(result.unwrap(), 7);
    }

    #[test]
    fn merge_picks_most_specific_policy() {
        let db = RetryPolicy::default();
        let coll = RetryPolicy::disabled();
        assert_eq!(RetryPolicy::merge(&db, None, None), db);
        assert_eq!(RetryPolicy::merge(&db, Some(&coll), None), coll);
        let op = RetryPolicy { retries: 9, ..RetryPolicy::default() };
        assert_eq!(RetryPolicy::merge(&db, Some(&coll), Some(&op)), op);
    }

    #[test]
    fn delay_for_attempt_grows_and_caps() {
        let policy = RetryPolicy {
            min_timeout: Duration::from_millis(100),
            max_timeout: Duration::from_millis(300),
            factor: 2.0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(300));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(300));
    }
}
