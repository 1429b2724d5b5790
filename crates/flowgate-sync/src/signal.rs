use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;

use flowgate_time::Duration;
use tokio::sync::oneshot;

use crate::WaiterId;

/// A broadcastable wake primitive with an ordered waiter queue.
///
/// `notify_one` wakes the longest-waiting caller; `notify_all` wakes
/// every current waiter. A notification that arrives with nobody waiting
/// is lost — `Signal` never accumulates permits, unlike a semaphore.
#[derive(Debug, Default)]
pub struct Signal {
    waiters: StdMutex<VecDeque<(WaiterId, oneshot::Sender<()>)>>,
    next_id: AtomicU64,
}

impl Signal {
    /// Creates a new signal with no waiters.
    #[must_use]
    pub fn new() -> Self {
        Self {
            waiters: StdMutex::new(VecDeque::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Suspends until notified or, if `timeout` is given, until it elapses.
    ///
    /// Returns `true` if woken by a notification, `false` on timeout. A
    /// timed-out call always removes its own waiter entry first, so a
    /// notification racing the timeout never reaches a caller that has
    /// already moved on.
    pub async fn wait(&self, timeout: Option<Duration>) -> bool {
        let (tx, rx) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.waiters.lock().unwrap().push_back((id, tx));

        match timeout {
            None => rx.await.is_ok(),
            Some(d) => match tokio::time::timeout(d.into(), rx).await {
                Ok(Ok(())) => true,
                _ => {
                    self.waiters.lock().unwrap().retain(|(wid, _)| *wid != id);
                    false
                }
            },
        }
    }

    /// Wakes the longest-waiting caller, if any.
    pub fn notify_one(&self) {
        if let Some((_, tx)) = self.waiters.lock().unwrap().pop_front() {
            let _ = tx.send(());
        }
    }

    /// Wakes every caller currently waiting.
    pub fn notify_all(&self) {
        let drained: VecDeque<_> = std::mem::take(&mut *self.waiters.lock().unwrap());
        for (_, tx) in drained {
            let _ = tx.send(());
        }
    }

    /// Number of callers currently suspended in [`Signal::wait`].
    #[must_use]
    pub fn waiter_count(&self) -> usize {
        self.waiters.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn notify_one_wakes_single_waiter() {
        let sig = Arc::new(Signal::new());
        let waiter = {
            let sig = sig.clone();
            tokio::spawn(async move { sig.wait(None).await })
        };
        tokio::task::yield_now().await;
        sig.notify_one();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn notify_with_no_waiters_is_lost() {
        let sig = Signal::new();
        sig.notify_one();
        sig.notify_all();
        // No panics, no accumulation: a later waiter still has to time out.
        assert!(!sig.wait(Some(Duration::from_millis(10))).await);
    }

    #[tokio::test]
    async fn timeout_removes_waiter_before_late_notify() {
        let sig = Arc::new(Signal::new());
        let woken = sig.wait(Some(Duration::from_millis(5))).await;
        assert!(!woken);
        assert_eq!(sig.waiter_count(), 0);
        // A notification arriving after the timeout must not resurrect it.
        sig.notify_one();
    }

    #[tokio::test]
    async fn notify_all_wakes_every_waiter_fifo() {
        let sig = Arc::new(Signal::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let sig = sig.clone();
            handles.push(tokio::spawn(async move { sig.wait(None).await }));
        }
        tokio::task::yield_now().await;
        sig.notify_all();
        for h in handles {
            assert!(h.await.unwrap());
        }
    }
}
