//! Managed-transaction retry coordination.
//!
//! [`RetryState`] drives the bounded retry loop behind
//! `execute_read`/`execute_write`: it classifies failures, sleeps with
//! jittered exponential backoff between attempts, enforces the
//! `max_transaction_retry_time` deadline measured from the first failure,
//! and aggregates everything it observed into a
//! [`DriverError::TransactionExecutionLimit`] when the budget runs out.
//!
//! Clock and sleeper are injected so tests run without wall time.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use rand::Rng;

use super::error::DriverError;

/// Initial backoff before the first retry.
const THROTTLE_INITIAL: Duration = Duration::from_secs(1);
/// Backoff growth factor.
const THROTTLE_MULTIPLIER: f64 = 2.0;
/// Relative jitter applied to every delay.
const THROTTLE_JITTER: f64 = 0.2;

/// Time source, injectable for tests.
pub type Clock = Arc<dyn Fn() -> Instant + Send + Sync>;

/// Sleep implementation, injectable for tests.
pub type Sleeper = Arc<dyn Fn(Duration) -> BoxFuture<'static, ()> + Send + Sync>;

/// Retry policy carried by the session.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Budget for the whole retry loop, measured from the first failure
    pub max_retry_time: Duration,
    /// Time source
    pub clock: Clock,
    /// Sleep implementation
    pub sleeper: Sleeper,
}

impl RetryPolicy {
    /// Policy on real time with the given budget.
    pub fn new(max_retry_time: Duration) -> Self {
        Self {
            max_retry_time,
            clock: Arc::new(Instant::now),
            sleeper: Arc::new(|delay| -> BoxFuture<'static, ()> {
                Box::pin(tokio::time::sleep(delay))
            }),
        }
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retry_time", &self.max_retry_time)
            .finish()
    }
}

/// Jittered exponential backoff.
#[derive(Debug)]
pub(crate) struct Throttler {
    next: Duration,
    max: Duration,
}

impl Throttler {
    pub fn new(max: Duration) -> Self {
        Self {
            next: THROTTLE_INITIAL,
            max,
        }
    }

    /// The next delay: current step with ±20% jitter, then grow the step.
    pub fn step(&mut self) -> Duration {
        let base = self.next.min(self.max);
        let factor = rand::thread_rng().gen_range(1.0 - THROTTLE_JITTER..=1.0 + THROTTLE_JITTER);
        let delay = base.mul_f64(factor);
        self.next = base.mul_f64(THROTTLE_MULTIPLIER).min(self.max);
        delay
    }
}

/// Whether a failure may be handed back to the loop for another attempt.
///
/// Connectivity loss during COMMIT is special: the outcome is unknown, so
/// replaying could apply the work twice. The loop stops and reports the
/// cause instead.
pub(crate) fn is_retryable(err: &DriverError, during_commit: bool) -> bool {
    match err {
        DriverError::Connectivity(_) | DriverError::Timeout(_) => !during_commit,
        DriverError::Database { .. } => {
            !err.is_token_expired() && !err.is_authorization_expired() && err.is_retryable()
        }
        _ => false,
    }
}

/// State of one retry loop.
pub struct RetryState {
    policy: RetryPolicy,
    throttle: Throttler,
    start: Option<Instant>,
    errors: Vec<DriverError>,
    causes: Vec<String>,
    last_was_retryable: bool,
}

impl RetryState {
    /// Fresh state for one `execute_read`/`execute_write` call.
    pub fn new(policy: RetryPolicy) -> Self {
        let throttle = Throttler::new(policy.max_retry_time);
        Self {
            policy,
            throttle,
            start: None,
            errors: Vec::new(),
            causes: Vec::new(),
            last_was_retryable: false,
        }
    }

    /// Whether the loop should run (another) attempt.
    pub fn should_continue(&self) -> bool {
        let Some(start) = self.start else {
            // No failure yet
            return true;
        };
        if !self.last_was_retryable {
            return false;
        }
        (self.policy.clock)() - start < self.policy.max_retry_time
    }

    /// Record a failed attempt; sleeps before returning when the failure
    /// class permits another attempt.
    pub async fn on_failure(&mut self, err: DriverError, during_commit: bool) {
        let retryable = is_retryable(&err, during_commit);
        if during_commit && matches!(err, DriverError::Connectivity(_) | DriverError::Timeout(_)) {
            self.causes
                .push("commit outcome unknown: connection lost during commit".to_string());
        }
        if self.start.is_none() {
            self.start = Some((self.policy.clock)());
        }
        self.last_was_retryable = retryable;
        tracing::debug!(error = %err, retryable, "transaction attempt failed");
        self.errors.push(err);

        if retryable {
            let delay = self.throttle.step();
            tracing::debug!(?delay, "throttling retry");
            (self.policy.sleeper)(delay).await;
        }
    }

    /// Whether any failure has been recorded.
    pub fn has_failures(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Whether the last recorded failure was retryable.
    pub fn last_was_retryable(&self) -> bool {
        self.last_was_retryable
    }

    /// The terminal error for an exhausted loop: the aggregate when the
    /// loop kept retrying into the deadline, otherwise the fatal error
    /// itself.
    pub fn into_error(mut self) -> DriverError {
        if self.last_was_retryable {
            return DriverError::TransactionExecutionLimit {
                errors: self.errors.iter().map(|e| e.to_string()).collect(),
                causes: self.causes,
            };
        }
        self.errors
            .pop()
            .unwrap_or_else(|| DriverError::usage("retry loop never ran"))
    }
}

impl std::fmt::Debug for RetryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryState")
            .field("errors", &self.errors.len())
            .field("last_was_retryable", &self.last_was_retryable)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::testing::fake_time_policy;

    fn transient() -> DriverError {
        DriverError::database("Neo.TransientError.General.TemporarilyUnavailable", "busy")
    }

    #[test]
    fn test_throttler_growth_and_jitter() {
        let mut throttler = Throttler::new(Duration::from_secs(30));
        let first = throttler.step();
        let second = throttler.step();
        let third = throttler.step();

        // Each delay is its base step ±20%
        assert!(first >= Duration::from_millis(800) && first <= Duration::from_millis(1200));
        assert!(second >= Duration::from_millis(1600) && second <= Duration::from_millis(2400));
        assert!(third >= Duration::from_millis(3200) && third <= Duration::from_millis(4800));
    }

    #[test]
    fn test_throttler_caps_at_max() {
        let mut throttler = Throttler::new(Duration::from_secs(2));
        for _ in 0..10 {
            let delay = throttler.step();
            assert!(delay <= Duration::from_secs(2).mul_f64(1.2));
        }
    }

    #[test]
    fn test_is_retryable() {
        assert!(is_retryable(&DriverError::connectivity("lost"), false));
        assert!(is_retryable(&transient(), false));
        assert!(is_retryable(
            &DriverError::database("Neo.ClientError.Cluster.NotALeader", "moved"),
            false
        ));

        // Commit with a lost connection: outcome unknown, no replay
        assert!(!is_retryable(&DriverError::connectivity("lost"), true));
        // Transient during commit is still fine: commit did not happen
        assert!(is_retryable(&transient(), true));

        assert!(!is_retryable(&DriverError::usage("bad"), false));
        assert!(!is_retryable(
            &DriverError::database("Neo.ClientError.Security.TokenExpired", "old"),
            false
        ));
        assert!(!is_retryable(
            &DriverError::database("Neo.ClientError.Statement.SyntaxError", "bad"),
            false
        ));
    }

    #[tokio::test]
    async fn test_retry_state_sleeps_between_retryable_failures() {
        let (policy, _elapsed, sleeps) = fake_time_policy(Duration::from_secs(30));
        let mut state = RetryState::new(policy);

        assert!(state.should_continue());
        state.on_failure(transient(), false).await;
        assert!(state.should_continue());
        assert_eq!(sleeps.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_retry_state_stops_on_fatal() {
        let (policy, _elapsed, sleeps) = fake_time_policy(Duration::from_secs(30));
        let mut state = RetryState::new(policy);

        state
            .on_failure(
                DriverError::database("Neo.ClientError.Statement.SyntaxError", "bad"),
                false,
            )
            .await;
        assert!(!state.should_continue());
        // Fatal failures do not throttle
        assert!(sleeps.lock().is_empty());

        let err = state.into_error();
        assert_eq!(err.code(), Some("Neo.ClientError.Statement.SyntaxError"));
    }

    #[tokio::test]
    async fn test_retry_state_deadline() {
        let (policy, elapsed, _sleeps) = fake_time_policy(Duration::from_secs(3));
        let mut state = RetryState::new(policy);

        state.on_failure(transient(), false).await;
        assert!(state.should_continue());

        // Push past the budget
        *elapsed.lock() += Duration::from_secs(10);
        state.on_failure(transient(), false).await;
        assert!(!state.should_continue());

        let err = state.into_error();
        let DriverError::TransactionExecutionLimit { errors, .. } = err else {
            panic!("expected execution limit, got {:?}", err);
        };
        assert_eq!(errors.len(), 2);
    }

    #[tokio::test]
    async fn test_commit_connectivity_records_cause() {
        let (policy, _elapsed, _sleeps) = fake_time_policy(Duration::from_secs(30));
        let mut state = RetryState::new(policy);

        state
            .on_failure(DriverError::connectivity("lost"), true)
            .await;
        assert!(!state.should_continue());
        assert_eq!(state.causes.len(), 1);
        assert!(state.causes[0].contains("commit outcome unknown"));
    }
}
