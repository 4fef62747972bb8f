//! Bounded retry primitives.
//!
//! Every cloud-facing call in the farm goes through a [`RetryExecutor`].
//! Errors are classified by the caller into transient and fatal ones:
//!
//! - **Transient**: network hiccups, throttling, a render that may succeed on
//!   another attempt. Retried after a fixed pause.
//! - **Fatal**: propagated immediately, never retried.
//!
//! # Invariants
//!
//! - At most `max_attempts` transient failures are absorbed inside one
//!   reset window; the next one escalates to [`RetryError::Exhausted`].
//! - A failure observed after the window has expired restarts the count,
//!   so a long-running stable process is not punished for old failures.
//! - Retry state is scoped to one call of [`RetryExecutor::run`] (or one
//!   [`Attempts`] value) and is never persisted.

use std::fmt;
use std::future::Future;
use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Whether an error is worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry after a pause.
    Transient,

    /// Give up immediately.
    Fatal,
}

impl ErrorClass {
    /// Returns true for [`ErrorClass::Transient`].
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient)
    }
}

/// Errors that know their own retry class.
pub trait Classify {
    fn class(&self) -> ErrorClass;
}

impl Classify for io::Error {
    fn class(&self) -> ErrorClass {
        match self.kind() {
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::TimedOut
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::Interrupted => ErrorClass::Transient,
            _ => ErrorClass::Fatal,
        }
    }
}

/// Retry budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Failures tolerated inside one window (the last one escalates).
    pub max_attempts: u32,

    /// Length of the window after which the failure count is forgiven.
    pub reset_period: Duration,

    /// Sleep between attempts.
    pub pause: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            reset_period: Duration::from_secs(3600),
            pause: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Policy that retries without pausing. Used by tests and by inner
    /// loops that already sit behind a slower outer retry.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            pause: Duration::ZERO,
            ..Self::default()
        }
    }
}

/// Terminal outcome of a retried action.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The action failed with a non-transient error.
    #[error(transparent)]
    Fatal(E),

    /// The retry budget ran out.
    #[error("failed after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: E,
    },
}

impl<E> RetryError<E> {
    /// The error that ended the retry loop.
    pub fn into_inner(self) -> E {
        match self {
            Self::Fatal(e) => e,
            Self::Exhausted { last, .. } => last,
        }
    }

    /// Number of attempts made, if the budget was exhausted.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::Fatal(_) => None,
            Self::Exhausted { attempts, .. } => Some(*attempts),
        }
    }
}

/// Failure counter with a sliding reset window.
#[derive(Debug, Clone)]
pub struct RetryState {
    attempts: u32,
    window_start: Instant,
}

impl RetryState {
    pub fn new(now: Instant) -> Self {
        Self {
            attempts: 0,
            window_start: now,
        }
    }

    /// Failures counted in the current window.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Record one transient failure observed at `now` and return the
    /// attempt number inside the current window.
    pub fn record_failure(&mut self, now: Instant, reset_period: Duration) -> u32 {
        if now > self.window_start + reset_period {
            info!(
                previous_attempts = self.attempts,
                "Retry window expired, resetting attempt count"
            );
            self.attempts = 0;
            self.window_start = now;
        }
        self.attempts += 1;
        self.attempts
    }
}

/// One retry session: the state of a single logical operation.
///
/// Useful when the retried body needs `&mut` access to its owner, which a
/// closure passed to [`RetryExecutor::run`] cannot borrow across awaits.
#[derive(Debug)]
pub struct Attempts<'a> {
    policy: &'a RetryPolicy,
    state: RetryState,
}

impl Attempts<'_> {
    /// Decide what to do with a failure.
    ///
    /// Returns `Ok(())` after sleeping when the caller should try again,
    /// or the terminal error otherwise.
    pub async fn backoff<E>(&mut self, err: E) -> Result<(), RetryError<E>>
    where
        E: Classify + fmt::Display,
    {
        if !err.class().is_transient() {
            return Err(RetryError::Fatal(err));
        }

        let attempt = self
            .state
            .record_failure(Instant::now(), self.policy.reset_period);

        if attempt < self.policy.max_attempts {
            warn!(
                attempt,
                max_attempts = self.policy.max_attempts,
                wait_secs = self.policy.pause.as_secs_f64(),
                error = %err,
                "Transient failure, retrying"
            );
            tokio::time::sleep(self.policy.pause).await;
            Ok(())
        } else {
            error!(
                attempts = attempt,
                error = %err,
                "Retry budget exhausted"
            );
            Err(RetryError::Exhausted {
                attempts: attempt,
                last: err,
            })
        }
    }

    pub fn attempts(&self) -> u32 {
        self.state.attempts()
    }
}

/// Runs actions under a [`RetryPolicy`].
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Start a fresh retry session.
    pub fn begin(&self) -> Attempts<'_> {
        Attempts {
            policy: &self.policy,
            state: RetryState::new(Instant::now()),
        }
    }

    /// Invoke `action` until it succeeds, fails fatally, or the budget
    /// runs out.
    pub async fn run<T, E, F, Fut>(&self, mut action: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + fmt::Display,
    {
        let mut attempts = self.begin();
        loop {
            match action().await {
                Ok(value) => return Ok(value),
                Err(err) => attempts.backoff(err).await?,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use rstest::rstest;

    use super::*;

    #[derive(Debug)]
    struct TestError(ErrorClass);

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "test error ({:?})", self.0)
        }
    }

    impl Classify for TestError {
        fn class(&self) -> ErrorClass {
            self.0
        }
    }

    #[tokio::test]
    async fn test_always_transient_exhausts_after_max_attempts() {
        let executor = RetryExecutor::new(RetryPolicy::immediate(3));
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = executor
            .run(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError(ErrorClass::Transient))
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let err = result.unwrap_err();
        assert_eq!(err.attempts(), Some(3));
        assert!(matches!(err, RetryError::Exhausted { .. }));
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let executor = RetryExecutor::new(RetryPolicy::immediate(5));
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = executor
            .run(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError(ErrorClass::Fatal))
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(RetryError::Fatal(_))));
    }

    #[tokio::test]
    async fn test_success_after_transient_failures() {
        let executor = RetryExecutor::new(RetryPolicy::immediate(5));
        let calls = AtomicU32::new(0);

        let result = executor
            .run(|| async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(TestError(ErrorClass::Transient))
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_reset_forgives_old_failures() {
        // Pause 10s, window 15s: the third failure lands at t=20s, outside
        // the window, so the count restarts instead of escalating.
        let executor = RetryExecutor::new(RetryPolicy {
            max_attempts: 3,
            reset_period: Duration::from_secs(15),
            pause: Duration::from_secs(10),
        });
        let calls = AtomicU32::new(0);

        let result = executor
            .run(|| async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n <= 5 {
                    Err(TestError(ErrorClass::Transient))
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_between_attempts() {
        let executor = RetryExecutor::new(RetryPolicy {
            max_attempts: 2,
            reset_period: Duration::from_secs(3600),
            pause: Duration::from_secs(30),
        });
        let start = Instant::now();

        let _: Result<(), _> = executor
            .run(|| async { Err(TestError(ErrorClass::Transient)) })
            .await;

        assert_eq!(start.elapsed(), Duration::from_secs(30));
    }

    #[test]
    fn test_retry_state_counts_within_window() {
        let start = Instant::now();
        let mut state = RetryState::new(start);
        let period = Duration::from_secs(60);

        assert_eq!(state.record_failure(start, period), 1);
        assert_eq!(state.record_failure(start + Duration::from_secs(30), period), 2);
        assert_eq!(state.record_failure(start + Duration::from_secs(61), period), 1);
        assert_eq!(state.attempts(), 1);
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.reset_period, Duration::from_secs(3600));
        assert_eq!(policy.pause, Duration::from_secs(30));
    }

    #[rstest]
    #[case(io::ErrorKind::ConnectionReset, ErrorClass::Transient)]
    #[case(io::ErrorKind::TimedOut, ErrorClass::Transient)]
    #[case(io::ErrorKind::UnexpectedEof, ErrorClass::Transient)]
    #[case(io::ErrorKind::NotFound, ErrorClass::Fatal)]
    #[case(io::ErrorKind::PermissionDenied, ErrorClass::Fatal)]
    fn test_io_error_classification(#[case] kind: io::ErrorKind, #[case] expected: ErrorClass) {
        assert_eq!(io::Error::from(kind).class(), expected);
    }
}
