use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;

use flowgate_time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

use crate::{Error, WaiterId};

struct State {
    limit: u32,
    running: u32,
    waiters: VecDeque<(WaiterId, oneshot::Sender<()>)>,
}

/// A counted permit pool with non-blocking `try_acquire`, timed `acquire`,
/// FIFO wake order, and a live [`Semaphore::resize`].
///
/// `running` may transiently exceed `limit` right after a shrinking
/// `resize`; nothing is evicted forcibly, subsequent releases simply bring
/// `running` back down as outstanding permits are returned.
pub struct Semaphore {
    state: StdMutex<State>,
    next_id: AtomicU64,
}

impl Semaphore {
    /// Creates a semaphore with `limit` initial permits.
    ///
    /// # Panics
    ///
    /// Panics if `limit` is zero — a semaphore must start with at least
    /// one permit to ever grant an acquire.
    #[must_use]
    pub fn new(limit: u32) -> Self {
        assert!(limit >= 1, "Semaphore limit must be >= 1");
        Self {
            state: StdMutex::new(State {
                limit,
                running: 0,
                waiters: VecDeque::new(),
            }),
            next_id: AtomicU64::new(0),
        }
    }

    /// Current configured limit.
    #[must_use]
    pub fn limit(&self) -> u32 {
        self.state.lock().unwrap().limit
    }

    /// Number of permits currently held.
    #[must_use]
    pub fn running(&self) -> u32 {
        self.state.lock().unwrap().running
    }

    /// `max(0, limit - running)`.
    #[must_use]
    pub fn available(&self) -> u32 {
        let s = self.state.lock().unwrap();
        s.limit.saturating_sub(s.running)
    }

    /// Attempts to acquire a permit without suspending.
    pub fn try_acquire(&self) -> Option<SemaphorePermit<'_>> {
        let mut s = self.state.lock().unwrap();
        if s.running < s.limit {
            s.running += 1;
            Some(SemaphorePermit {
                sem: self,
                forgotten: false,
            })
        } else {
            None
        }
    }

    /// Acquires a permit, suspending until one is free or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] if `timeout` is given and elapses first.
    pub async fn acquire(&self, timeout: Option<Duration>) -> Result<SemaphorePermit<'_>, Error> {
        if let Some(p) = self.try_acquire() {
            return Ok(p);
        }

        let (tx, rx) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut s = self.state.lock().unwrap();
            if s.running < s.limit {
                s.running += 1;
                return Ok(SemaphorePermit {
                    sem: self,
                    forgotten: false,
                });
            }
            s.waiters.push_back((id, tx));
        }

        let granted = match timeout {
            None => rx.await.is_ok(),
            Some(d) => match tokio::time::timeout(d.into(), rx).await {
                Ok(Ok(())) => true,
                _ => {
                    self.state.lock().unwrap().waiters.retain(|(wid, _)| *wid != id);
                    debug!(waiter = id, "semaphore: acquire timed out");
                    false
                }
            },
        };

        if granted {
            Ok(SemaphorePermit {
                sem: self,
                forgotten: false,
            })
        } else {
            Err(Error::Timeout)
        }
    }

    /// Releases one permit.
    ///
    /// If a waiter is queued, the permit is handed directly to it
    /// (`running` is unchanged — ownership transfers, it does not
    /// round-trip through zero); otherwise `running` decrements.
    pub fn release(&self) {
        let mut s = self.state.lock().unwrap();
        match s.waiters.pop_front() {
            Some((_, tx)) => {
                drop(s);
                let _ = tx.send(());
            }
            None => s.running = s.running.saturating_sub(1),
        }
    }

    /// Changes the permit limit.
    ///
    /// On increase, exactly `min(new - old, waiters.len())` head waiters
    /// are woken and `running` grows by that same amount — these are
    /// brand-new permits, not ones transferred from a release. On
    /// decrease, nothing is evicted; `running` catches up as outstanding
    /// permits are released.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `new_limit` is zero.
    pub fn resize(&self, new_limit: u32) -> Result<(), Error> {
        if new_limit == 0 {
            return Err(Error::InvalidArgument("resize limit must be >= 1"));
        }
        let mut s = self.state.lock().unwrap();
        let old_limit = s.limit;
        s.limit = new_limit;
        debug!(old_limit, new_limit, "semaphore: resized");

        if new_limit > old_limit {
            let delta = new_limit - old_limit;
            let wake_count = delta.min(s.waiters.len() as u32);
            let mut woken = Vec::with_capacity(wake_count as usize);
            for _ in 0..wake_count {
                if let Some((_, tx)) = s.waiters.pop_front() {
                    s.running += 1;
                    woken.push(tx);
                }
            }
            drop(s);
            for tx in woken {
                let _ = tx.send(());
            }
        }
        Ok(())
    }
}

/// RAII permit returned by [`Semaphore::try_acquire`]/[`Semaphore::acquire`].
///
/// Dropping the permit releases it automatically. [`SemaphorePermit::forget`]
/// consumes the permit without releasing, for callers (like a
/// `Limiter`'s token) that manage their own release timing and call
/// [`Semaphore::release`] directly later.
pub struct SemaphorePermit<'a> {
    sem: &'a Semaphore,
    forgotten: bool,
}

impl SemaphorePermit<'_> {
    /// Consumes the permit without releasing it back to the semaphore.
    pub fn forget(mut self) {
        self.forgotten = true;
    }
}

impl Drop for SemaphorePermit<'_> {
    fn drop(&mut self) {
        if !self.forgotten {
            self.sem.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn run_cap_respected_single_threaded() {
        let sem = Semaphore::new(2);
        let p1 = sem.try_acquire().unwrap();
        let p2 = sem.try_acquire().unwrap();
        assert!(sem.try_acquire().is_none());
        assert_eq!(sem.running(), 2);
        drop(p1);
        assert_eq!(sem.running(), 1);
        drop(p2);
        assert_eq!(sem.running(), 0);
    }

    #[tokio::test]
    async fn resize_up_wakes_exactly_delta_waiters() {
        let sem = Arc::new(Semaphore::new(1));
        let _held = sem.try_acquire().unwrap();

        let mut waiters = Vec::new();
        for _ in 0..3 {
            let sem = sem.clone();
            waiters.push(tokio::spawn(async move { sem.acquire(None).await.is_ok() }));
        }
        tokio::task::yield_now().await;

        sem.resize(3).unwrap();

        let mut granted = 0;
        for w in waiters {
            if w.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 2);
        assert_eq!(sem.running(), 3);
    }

    #[test]
    fn resize_to_zero_is_invalid() {
        let sem = Semaphore::new(4);
        assert_eq!(sem.resize(0), Err(Error::InvalidArgument("resize limit must be >= 1")));
    }

    #[tokio::test]
    async fn concurrent_peak_matches_limit() {
        use std::sync::atomic::{AtomicU32, Ordering as O};
        let sem = Arc::new(Semaphore::new(4));
        let peak = Arc::new(AtomicU32::new(0));
        let current = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let sem = sem.clone();
            let peak = peak.clone();
            let current = current.clone();
            handles.push(tokio::spawn(async move {
                let permit = sem.acquire(None).await.unwrap();
                let now = current.fetch_add(1, O::SeqCst) + 1;
                peak.fetch_max(now, O::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                current.fetch_sub(1, O::SeqCst);
                drop(permit);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(peak.load(O::SeqCst), 4);
        assert_eq!(sem.running(), 0);
    }

    proptest::proptest! {
        #[test]
        fn running_never_exceeds_limit_for_arbitrary_acquire_release_sequences(limit in 1u32..16, ops in proptest::collection::vec(proptest::bool::ANY, 0..64)) {
            let sem = Semaphore::new(limit);
            let mut held = Vec::new();
            for acquire in ops {
                if acquire {
                    if let Some(p) = sem.try_acquire() {
                        held.push(p);
                    }
                } else if let Some(p) = held.pop() {
                    drop(p);
                }
                proptest::prop_assert!(sem.running() <= limit);
            }
        }
    }
}
