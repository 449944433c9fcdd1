//! Cooperative cancellation primitives.
//!
//! The store is single-threaded from the perspective of any one connection,
//! but a [`CancellationToken`] is `Send + Sync` so it can be cancelled from
//! another thread (a timeout timer, a signal handler) while the owning
//! thread is blocked inside the SQL engine. Per §5 of the design, an
//! already-dispatched SQL call is never interrupted mid-flight; instead its
//! result is discarded if the token fired while it was running.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

#[derive(Debug)]
struct Inner {
    cancelled: AtomicBool,
    reason: Mutex<Option<String>>,
}

/// A cheaply cloneable, cooperative cancellation signal.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                reason: Mutex::new(None),
            }),
        }
    }

    /// Returns an already-cancelled token carrying `reason`. Useful for
    /// tests and for adapting a fired external timeout into this type.
    pub fn already_cancelled(reason: impl Into<String>) -> Self {
        let token = Self::new();
        token.cancel(reason);
        token
    }

    /// Signals cancellation. Idempotent: the first reason wins.
    pub fn cancel(&self, reason: impl Into<String>) {
        if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
            *self.inner.reason.lock().unwrap_or_else(|e| e.into_inner()) = Some(reason.into());
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<String> {
        self.inner
            .reason
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Returns `Err(Error::OperationAborted)` if this token has fired.
    pub fn throw_if_aborted(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::aborted(
                self.reason().unwrap_or_else(|| "cancelled".to_string()),
            ))
        } else {
            Ok(())
        }
    }
}

/// Runs `op`, checking the token immediately before and immediately after.
///
/// If the token is already cancelled, `op` never runs. If the token fires
/// while `op` is running (from another thread), `op`'s result — success or
/// failure — is discarded and an aborted error is returned instead: the SQL
/// call is assumed to have already committed or failed on its own terms,
/// but the caller must not trust or act on its outcome.
pub fn race_with_abort<T>(token: &CancellationToken, op: impl FnOnce() -> Result<T>) -> Result<T> {
    token.throw_if_aborted()?;
    let result = op();
    if token.is_cancelled() {
        return Err(Error::aborted(
            token.reason().unwrap_or_else(|| "cancelled".to_string()),
        ));
    }
    result
}

/// Sleeps for `duration`, polling `token` every `poll_interval` so a
/// cancellation fired mid-delay resolves the sleep immediately instead of
/// running to completion.
pub fn sleep_interruptible(token: &CancellationToken, duration: Duration, poll_interval: Duration) -> Result<()> {
    let deadline = Instant::now() + duration;
    loop {
        token.throw_if_aborted()?;
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        let remaining = deadline - now;
        std::thread::sleep(remaining.min(poll_interval));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_token_is_not_cancelled() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert!(token.throw_if_aborted().is_ok());
    }

    #[test]
    fn cancel_sets_reason() {
        let token = CancellationToken::new();
        token.cancel("timeout");
        assert!(token.is_cancelled());
        assert_eq!(token.reason().as_deref(), Some("timeout"));
        let err = token.throw_if_aborted().unwrap_err();
        assert!(matches!(err, Error::OperationAborted { .. }));
    }

    #[test]
    fn cancel_is_idempotent_first_reason_wins() {
        let token = CancellationToken::new();
        token.cancel("first");
        token.cancel("second");
        assert_eq!(token.reason().as_deref(), Some("first"));
    }

    #[test]
    fn race_with_abort_runs_op_when_not_cancelled() {
        let token = CancellationToken::new();
        let result = race_with_abort(&token, || Ok::<_, Error>(42));
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn race_with_abort_short_circuits_if_already_cancelled() {
        let token = CancellationToken::already_cancelled("nope");
        let mut ran = false;
        let result = race_with_abort(&token, || {
            ran = true;
            Ok::<_, Error>(1)
        });
        assert!(result.is_err());
        assert!(!ran);
    }

    #[test]
    fn race_with_abort_discards_result_if_cancelled_during() {
        let token = CancellationToken::new();
        let inner = token.clone();
        let result = race_with_abort(&token, || {
            inner.cancel("raced");
            Ok::<_, Error>(99)
        });
        assert!(result.is_err());
    }

    #[test]
    fn sleep_interruptible_returns_early_on_cancel() {
        let token = CancellationToken::new();
        let inner = token.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(5));
            inner.cancel("done waiting");
        });
        let start = Instant::now();
        let result = sleep_interruptible(&token, Duration::from_secs(5), Duration::from_millis(5));
        assert!(result.is_err());
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
