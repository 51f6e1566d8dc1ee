//! Retry hooks and the retry completion latch.
//!
//! Requests are never retried because of a timeout. They are retried only
//! when the transport reports a reconnect, and only if they were still
//! pending at the moment the connection dropped. Before such a request is
//! resubmitted, its [`RetryValidator`] (if any) decides whether the retry
//! still makes sense.

use super::{lock_ignore_poison, wait_ignore_poison};
use crate::{Failure, Request};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Verdict of a [`RetryValidator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Resubmit the (possibly rewritten) request.
    Resubmit,
    /// Do not resubmit. `None` completes the request as successful with an
    /// empty payload; `Some(failure)` completes it with that failure.
    Veto(Option<Failure>),
}

/// Hook consulted before a request is resubmitted after a reconnect.
///
/// The validator may rewrite the request target (for example when the
/// remote session was renumbered) and return [`RetryDecision::Resubmit`],
/// or refuse the retry with [`RetryDecision::Veto`].
pub trait RetryValidator: Send + Sync {
    fn validate(&self, request: &mut Request) -> RetryDecision;
}

impl<F> RetryValidator for F
where
    F: Fn(&mut Request) -> RetryDecision + Send + Sync,
{
    fn validate(&self, request: &mut Request) -> RetryDecision {
        self(request)
    }
}

/// One-shot latch released once every request flagged by a `retry_all`
/// pass has reached a terminal outcome.
#[derive(Clone, Default)]
pub struct RetrySignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl RetrySignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Release the latch and wake every waiter. Idempotent.
    pub fn release(&self) {
        let (released, cv) = &*self.inner;
        *lock_ignore_poison(released) = true;
        cv.notify_all();
    }

    pub fn is_released(&self) -> bool {
        *lock_ignore_poison(&self.inner.0)
    }

    /// Block until released.
    pub fn wait(&self) {
        // ---
        let (released, cv) = &*self.inner;
        let mut guard = lock_ignore_poison(released);
        while !*guard {
            guard = wait_ignore_poison(cv, guard);
        }
    }

    /// Block until released or `timeout` elapses. Returns true if released.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        // ---
        let deadline = Instant::now() + timeout;
        let (released, cv) = &*self.inner;
        let mut guard = lock_ignore_poison(released);
        while !*guard {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            guard = match cv.wait_timeout(guard, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::thread;

    #[test]
    fn test_signal_wakes_waiter() {
        // ---
        let signal = RetrySignal::new();
        let waiter = {
            let signal = signal.clone();
            thread::spawn(move || signal.wait())
        };

        thread::sleep(Duration::from_millis(20));
        assert!(!signal.is_released());
        signal.release();

        waiter.join().unwrap();
        assert!(signal.is_released());
    }

    #[test]
    fn test_signal_wait_timeout() {
        // ---
        let signal = RetrySignal::new();
        assert!(!signal.wait_timeout(Duration::from_millis(30)));

        signal.release();
        signal.release();
        assert!(signal.wait_timeout(Duration::from_millis(30)));
    }

    #[test]
    fn test_closure_validator() {
        // ---
        use crate::TargetSelector;
        use bytes::Bytes;

        let validator = |req: &mut Request| {
            req.set_target(TargetSelector::new(9, req.target().object));
            RetryDecision::Resubmit
        };

        let mut req = Request::new(TargetSelector::new(1, 2), Bytes::new());
        assert_eq!(validator.validate(&mut req), RetryDecision::Resubmit);
        assert_eq!(req.target(), TargetSelector::new(9, 2));
    }
}
