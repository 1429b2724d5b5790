//! A three-state circuit breaker (`Closed` / `Open` / `HalfOpen`) guarding
//! an async operation behind a failure threshold and a retry timer.

use std::sync::Mutex as StdMutex;

use flowgate_time::{Duration, Timer};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors a breaker-guarded call can resolve to.
#[derive(Debug, Error)]
pub enum Error<E: std::fmt::Debug> {
    /// The circuit is open; the call was rejected without running.
    #[error("circuit open for {open_for:?}, retries in {time_to_close:?}")]
    CircuitOpen {
        open_for: Duration,
        time_to_close: Duration,
    },
    /// The guarded operation itself failed.
    #[error("operation failed: {0:?}")]
    Inner(E),
}

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Open,
    HalfOpen,
}

/// Configuration for [`CircuitBreaker`].
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub retry_after: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            retry_after: Duration::from_millis(5_000),
        }
    }
}

struct Inner {
    state: State,
    failure_count: u32,
    opened_at: Option<Timer>,
}

/// Decides whether an outcome of a guarded call counts as success.
///
/// Default behaviour (used by [`CircuitBreaker::invoke`]) is "no error".
/// A custom evaluator lets callers treat, say, a 404 response as success
/// even though the call returned an application-level error value.
pub trait ResponseEvaluator<T, E>: Send + Sync {
    fn is_success(&self, duration: Duration, outcome: &Result<T, E>) -> bool;
}

struct DefaultEvaluator;

impl<T, E> ResponseEvaluator<T, E> for DefaultEvaluator {
    fn is_success(&self, _duration: Duration, outcome: &Result<T, E>) -> bool {
        outcome.is_ok()
    }
}

/// Snapshot of breaker counters, for diagnostics.
#[derive(Debug, Clone, Copy)]
pub struct Stats {
    pub state: State,
    pub failure_count: u32,
}

/// A circuit breaker guarding repeated calls to a fallible async
/// operation.
///
/// `CLOSED` lets every call through. `failure_threshold` consecutive
/// failures trip it to `OPEN`, which rejects immediately until
/// `retry_after` elapses, then allows exactly one `HALF_OPEN` probe:
/// success closes the circuit, failure reopens it and rearms the timer.
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: StdMutex<Inner>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: StdMutex::new(Inner {
                state: State::Closed,
                failure_count: 0,
                opened_at: None,
            }),
        }
    }

    /// Current state, resolving a pending `Open` → `HalfOpen` transition
    /// first if the retry timer has elapsed.
    #[must_use]
    pub fn state(&self) -> State {
        self.poll_half_open(&mut self.inner.lock().unwrap())
    }

    /// Current failure count and state, for metrics/diagnostics.
    #[must_use]
    pub fn stats(&self) -> Stats {
        let mut st = self.inner.lock().unwrap();
        let state = self.poll_half_open(&mut st);
        Stats {
            state,
            failure_count: st.failure_count,
        }
    }

    fn poll_half_open(&self, st: &mut Inner) -> State {
        if st.state == State::Open {
            if let Some(timer) = st.opened_at {
                if timer.elapsed() >= self.config.retry_after {
                    st.state = State::HalfOpen;
                    st.opened_at = None;
                    debug!("circuit breaker: open -> half-open");
                }
            }
        }
        st.state
    }

    /// Runs `op` under breaker protection using the default evaluator
    /// (any `Err` counts as failure).
    ///
    /// # Errors
    ///
    /// Returns [`Error::CircuitOpen`] if the circuit is open, or
    /// [`Error::Inner`] carrying `op`'s error.
    pub async fn invoke<F, Fut, T, E>(&self, op: F) -> Result<T, Error<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Debug,
    {
        self.invoke_with(&DefaultEvaluator, op).await
    }

    /// Runs `op` under breaker protection, using `evaluator` to decide
    /// whether the outcome counts as a success.
    ///
    /// An error outcome the evaluator marks as success still closes the
    /// breaker's failure count, but the error is still propagated to the
    /// caller unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CircuitOpen`] if the circuit is open, or
    /// [`Error::Inner`] carrying `op`'s error.
    pub async fn invoke_with<F, Fut, T, E>(
        &self,
        evaluator: &dyn ResponseEvaluator<T, E>,
        op: F,
    ) -> Result<T, Error<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Debug,
    {
        {
            let mut st = self.inner.lock().unwrap();
            match self.poll_half_open(&mut st) {
                State::Open => {
                    let timer = st.opened_at.expect("Open implies opened_at is set");
                    let open_for = timer.elapsed();
                    let time_to_close = (self.config.retry_after - open_for).max(Duration::ZERO);
                    return Err(Error::CircuitOpen {
                        open_for,
                        time_to_close,
                    });
                }
                State::Closed | State::HalfOpen => {}
            }
        }

        let timer = Timer::start();
        let outcome = op().await;
        let duration = timer.elapsed();
        let success = evaluator.is_success(duration, &outcome);

        let mut st = self.inner.lock().unwrap();
        if success {
            st.failure_count = 0;
            st.state = State::Closed;
            st.opened_at = None;
        } else {
            st.failure_count += 1;
            if st.state == State::HalfOpen || st.failure_count >= self.config.failure_threshold {
                warn!(failures = st.failure_count, "circuit breaker: tripping open");
                st.state = State::Open;
                st.opened_at = Some(Timer::start());
            }
        }
        drop(st);

        outcome.map_err(Error::Inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fail() -> Result<(), &'static str> {
        Err("boom")
    }

    async fn ok() -> Result<(), &'static str> {
        Ok(())
    }

    #[tokio::test]
    async fn threshold_failures_trip_open() {
        let breaker = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 3,
            ..Default::default()
        });

        for _ in 0..3 {
            assert!(breaker.invoke(fail).await.is_err());
        }
        assert_eq!(breaker.state(), State::Open);

        match breaker.invoke(ok).await {
            Err(Error::CircuitOpen { .. }) => {}
            other => panic!("expected CircuitOpen, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_success_closes_failure_reopens() {
        let breaker = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 1,
            retry_after: Duration::from_millis(100),
        });

        assert!(breaker.invoke(fail).await.is_err());
        assert_eq!(breaker.state(), State::Open);

        tokio::time::advance(std::time::Duration::from_millis(150)).await;
        assert_eq!(breaker.state(), State::HalfOpen);

        assert!(breaker.invoke(fail).await.is_err());
        assert_eq!(breaker.state(), State::Open);

        tokio::time::advance(std::time::Duration::from_millis(150)).await;
        assert_eq!(breaker.state(), State::HalfOpen);
        assert!(breaker.invoke(ok).await.is_ok());
        let stats = breaker.stats();
        assert_eq!(stats.state, State::Closed);
        assert_eq!(stats.failure_count, 0);
    }

    #[tokio::test]
    async fn evaluator_can_override_error_outcome() {
        struct AlwaysSuccess;
        impl ResponseEvaluator<(), &'static str> for AlwaysSuccess {
            fn is_success(&self, _duration: Duration, _outcome: &Result<(), &'static str>) -> bool {
                true
            }
        }

        let breaker = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        });

        let result = breaker.invoke_with(&AlwaysSuccess, fail).await;
        assert!(matches!(result, Err(Error::Inner("boom"))));
        assert_eq!(breaker.state(), State::Closed);
    }
}
