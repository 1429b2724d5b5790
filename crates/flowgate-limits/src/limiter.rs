use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use flowgate_sync::Semaphore;
use flowgate_time::Timer;
use tracing::debug;

use crate::LimitAlgorithm;

/// Binds a [`LimitAlgorithm`] (in practice, a [`crate::Vegas`]) to a
/// resizable [`Semaphore`].
///
/// Whenever the algorithm publishes a new limit, a background task
/// resizes the semaphore to match; the task ends on its own once the
/// last `Limiter` handle (and with it the last `Arc<dyn LimitAlgorithm>`
/// clone) is dropped, because that drops the algorithm's `watch::Sender`
/// and the receiver's `changed()` then returns an error.
pub struct Limiter {
    algo: Arc<dyn LimitAlgorithm>,
    sem: Arc<Semaphore>,
    in_flight: Arc<AtomicU32>,
}

impl Limiter {
    /// Creates a limiter whose semaphore starts at the algorithm's
    /// current limit, and spawns the resize-on-change subscriber.
    #[must_use]
    pub fn new(algo: Arc<dyn LimitAlgorithm>) -> Self {
        let sem = Arc::new(Semaphore::new(algo.limit()));
        let mut changed = algo.changed();
        let resize_target = sem.clone();
        tokio::spawn(async move {
            while changed.changed().await.is_ok() {
                let new_limit = *changed.borrow();
                debug!(new_limit, "limiter: resizing semaphore to new vegas limit");
                let _ = resize_target.resize(new_limit);
            }
        });

        Self {
            algo,
            sem,
            in_flight: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Current algorithm-chosen limit.
    #[must_use]
    pub fn limit(&self) -> u32 {
        self.algo.limit()
    }

    /// Current number of operations in flight.
    #[must_use]
    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Attempts to start an operation, returning `None` if the limit is
    /// currently saturated.
    pub fn try_acquire(&self) -> Option<LimitedOperation> {
        let permit = self.sem.try_acquire()?;
        permit.forget();
        let observed_in_flight = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;

        Some(LimitedOperation {
            algo: self.algo.clone(),
            sem: self.sem.clone(),
            in_flight: self.in_flight.clone(),
            observed_in_flight,
            timer: Timer::start(),
        })
    }
}

/// A single-use token for one in-flight operation.
///
/// Exactly one of [`LimitedOperation::success`], [`LimitedOperation::ignore`],
/// or [`LimitedOperation::dropped`] must be called to release the
/// underlying semaphore permit. Each consumes `self` by value, so the
/// type system rules out the double-release spec.md guards against
/// with a runtime `AlreadyFinished` error — reusing a token after it is
/// gone is a compile error here, not a runtime one.
pub struct LimitedOperation {
    algo: Arc<dyn LimitAlgorithm>,
    sem: Arc<Semaphore>,
    in_flight: Arc<AtomicU32>,
    observed_in_flight: u32,
    timer: Timer,
}

impl LimitedOperation {
    /// The operation completed normally; its measured RTT feeds the
    /// algorithm.
    pub fn success(self) {
        self.finish(false);
    }

    /// The operation completed but should not influence the algorithm
    /// (for example, a cache hit with no meaningful network RTT).
    pub fn ignore(self) {
        self.release();
    }

    /// The operation was rejected or failed in a way that indicates
    /// overload; reports a drop to the algorithm.
    pub fn dropped(self) {
        self.finish(true);
    }

    fn finish(self, dropped: bool) {
        let rtt = self.timer.elapsed();
        let in_flight = self.observed_in_flight;
        self.algo.update(rtt, in_flight, dropped);
        self.release();
    }

    fn release(self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.sem.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vegas::{Vegas, VegasConfig};

    #[tokio::test]
    async fn saturates_at_limit_then_frees_on_release() {
        let algo: Arc<dyn LimitAlgorithm> = Arc::new(Vegas::new(VegasConfig {
            initial_limit: 2,
            ..Default::default()
        }));
        let limiter = Limiter::new(algo);
        tokio::task::yield_now().await;

        let a = limiter.try_acquire().expect("first permit");
        let b = limiter.try_acquire().expect("second permit");
        assert!(limiter.try_acquire().is_none(), "limit of 2 should be saturated");

        a.success();
        let c = limiter.try_acquire().expect("permit freed by a.success()");
        c.ignore();
        b.dropped();
    }

    #[tokio::test]
    async fn limit_changes_propagate_to_semaphore() {
        let algo = Arc::new(Vegas::new(VegasConfig {
            initial_limit: 1,
            max_limit: 64,
            probe_multiplier: 1.0,
            ..Default::default()
        }));
        let limiter = Limiter::new(algo.clone() as Arc<dyn LimitAlgorithm>);
        tokio::task::yield_now().await;

        for _ in 0..200 {
            algo.update(flowgate_time::Duration::from_millis(1), 0, false);
        }
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        assert!(limiter.limit() >= 1);
    }
}
