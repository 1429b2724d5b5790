use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;

use flowgate_time::Duration;
use tokio::sync::oneshot;

use crate::{Error, WaiterId};

struct State {
    locked: bool,
    waiters: VecDeque<(WaiterId, oneshot::Sender<()>)>,
}

/// A single-holder async lock with strict FIFO fairness.
///
/// `release` never leaves the lock observably unlocked while a waiter is
/// queued: ownership is handed directly to the head waiter instead, so a
/// concurrent `try_lock` can never steal the lock out from under a
/// waiter that has been queued longer.
///
/// ```
/// # tokio_test::block_on(async {
/// use flowgate_sync::Mutex;
///
/// let m = Mutex::new();
/// let guard = m.lock(None).await.unwrap();
/// assert!(m.try_lock().is_none());
/// drop(guard);
/// assert!(m.try_lock().is_some());
/// # });
/// ```
pub struct Mutex {
    state: StdMutex<State>,
    next_id: AtomicU64,
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Mutex {
    /// Creates a new, unlocked mutex.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: StdMutex::new(State {
                locked: false,
                waiters: VecDeque::new(),
            }),
            next_id: AtomicU64::new(0),
        }
    }

    /// Attempts to acquire the lock without suspending.
    ///
    /// Returns `Some(guard)` iff the mutex was previously unlocked.
    pub fn try_lock(&self) -> Option<MutexGuard<'_>> {
        let mut state = self.state.lock().unwrap();
        if state.locked {
            None
        } else {
            state.locked = true;
            Some(MutexGuard { mutex: self })
        }
    }

    /// Acquires the lock, suspending until it is free or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] if `timeout` is given and elapses before
    /// the lock becomes available.
    pub async fn lock(&self, timeout: Option<Duration>) -> Result<MutexGuard<'_>, Error> {
        if let Some(guard) = self.try_lock() {
            return Ok(guard);
        }

        let (tx, rx) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.state.lock().unwrap();
            if !state.locked {
                state.locked = true;
                return Ok(MutexGuard { mutex: self });
            }
            state.waiters.push_back((id, tx));
        }

        let handed_off = match timeout {
            None => rx.await.is_ok(),
            Some(d) => match tokio::time::timeout(d.into(), rx).await {
                Ok(Ok(())) => true,
                _ => {
                    self.state.lock().unwrap().waiters.retain(|(wid, _)| *wid != id);
                    false
                }
            },
        };

        if handed_off {
            Ok(MutexGuard { mutex: self })
        } else {
            Err(Error::Timeout)
        }
    }

    fn release(&self) {
        let mut state = self.state.lock().unwrap();
        match state.waiters.pop_front() {
            Some((_, tx)) => {
                // Hand off directly: `locked` stays true the whole time.
                drop(state);
                let _ = tx.send(());
            }
            None => state.locked = false,
        }
    }
}

/// RAII guard returned by [`Mutex::try_lock`]/[`Mutex::lock`]; releases the
/// mutex (or hands it to the next waiter) on drop.
pub struct MutexGuard<'a> {
    mutex: &'a Mutex,
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.release();
    }
}
