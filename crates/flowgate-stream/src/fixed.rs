use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use flowgate_sync::Semaphore;
use flowgate_time::Duration;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// A streaming stage that runs `transform` over each upstream item with
/// at most `max_concurrency` permits checked out, releasing a permit
/// only once the previous output has been taken by the downstream
/// consumer.
///
/// This is the default, safe mode: unread outputs back-pressure the
/// upstream by simply not calling `transform` again until a permit
/// frees up.
pub struct FixedConcurrencyStream<Out> {
    inner: ReceiverStream<Out>,
    driver: JoinHandle<()>,
}

impl<Out: Send + 'static> FixedConcurrencyStream<Out> {
    /// Wraps `upstream`, running `transform(x) -> Option<Out>` with up
    /// to `max_concurrency` items in flight at once. A `None` result is
    /// dropped rather than forwarded downstream.
    pub fn new<S, In, F, Fut>(upstream: S, max_concurrency: u32, transform: F) -> Self
    where
        S: Stream<Item = In> + Send + 'static,
        In: Send + 'static,
        F: Fn(In) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Option<Out>> + Send + 'static,
    {
        let sem = Arc::new(Semaphore::new(max_concurrency.max(1)));
        let (tx, rx) = mpsc::channel::<Out>(1);

        let transform = Arc::new(transform);
        let driver = tokio::spawn(async move {
            tokio::pin!(upstream);
            while let Some(item) = upstream.next().await {
                let permit = loop {
                    match sem.acquire(Some(ACQUIRE_POLL_INTERVAL)).await {
                        Ok(p) => break p,
                        Err(_) => continue,
                    }
                };
                permit.forget();

                let sem = sem.clone();
                let tx = tx.clone();
                let transform = transform.clone();
                tokio::spawn(async move {
                    let out = (transform)(item).await;
                    if let Some(value) = out {
                        let _ = tx.send(value).await;
                    }
                    sem.release();
                });
            }
        });

        Self {
            inner: ReceiverStream::new(rx),
            driver,
        }
    }

    /// Stops the background driver task that pulls from the upstream
    /// and spawns per-item transforms. Any in-flight transform tasks
    /// are left to finish on their own; their outputs are simply never
    /// read once the stream itself is dropped.
    pub async fn shutdown(self) {
        self.driver.abort();
        let _ = self.driver.await;
    }
}

impl<Out> Stream for FixedConcurrencyStream<Out> {
    type Item = Out;
    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Out>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[tokio::test]
    async fn processes_all_items_and_drops_none_results() {
        let upstream = stream::iter(0..10);
        let out = FixedConcurrencyStream::new(upstream, 3, |x: i32| async move {
            if x % 2 == 0 {
                Some(x * 10)
            } else {
                None
            }
        });

        let results: Vec<i32> = out.collect().await;
        assert_eq!(results, vec![0, 20, 40, 60, 80]);
    }

    #[tokio::test]
    async fn never_exceeds_max_concurrency() {
        use std::sync::atomic::{AtomicU32, Ordering};
        let peak = Arc::new(AtomicU32::new(0));
        let current = Arc::new(AtomicU32::new(0));

        let upstream = stream::iter(0..20);
        let peak2 = peak.clone();
        let current2 = current.clone();
        let out = FixedConcurrencyStream::new(upstream, 4, move |x: i32| {
            let peak = peak2.clone();
            let current = current2.clone();
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                Some(x)
            }
        });

        let _results: Vec<i32> = out.collect().await;
        assert!(peak.load(Ordering::SeqCst) <= 4);
    }

    #[tokio::test]
    async fn shutdown_stops_the_driver_task() {
        // An upstream that never ends on its own; only `shutdown` can stop the driver.
        let upstream = stream::repeat(1);
        let out = FixedConcurrencyStream::new(upstream, 2, |x: i32| async move { Some(x) });
        let result = tokio::time::timeout(std::time::Duration::from_secs(5), out.shutdown()).await;
        assert!(result.is_ok(), "shutdown should resolve even with an unbounded upstream");
    }
}
