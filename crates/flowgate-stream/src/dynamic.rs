use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use flowgate_sync::Semaphore;
use flowgate_time::{Duration, Timer};
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

use crate::controller::{ControllerConfig, DynamicController};

const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// As [`crate::FixedConcurrencyStream`], but the concurrency limit is
/// continuously retuned by a background [`DynamicController`] instead
/// of held fixed.
pub struct DynamicConcurrencyStream<Out> {
    inner: ReceiverStream<Out>,
    driver: JoinHandle<()>,
    controller: JoinHandle<()>,
}

impl<Out: Send + 'static> DynamicConcurrencyStream<Out> {
    pub fn new<S, In, F, Fut>(upstream: S, config: ControllerConfig, transform: F) -> Self
    where
        S: Stream<Item = In> + Send + 'static,
        In: Send + 'static,
        F: Fn(In) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Option<Out>> + Send + 'static,
    {
        let sem = Arc::new(Semaphore::new(config.range_min.max(1)));
        let controller = DynamicController::new(sem.clone(), config);
        let throughput = controller.throughput_counter();
        let controller = tokio::spawn(controller.run());

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
                let throughput = throughput.clone();
                tokio::spawn(async move {
                    let transform_timer = Timer::start();
                    let out = (transform)(item).await;
                    crate::metrics::record_dynamic_transform(transform_timer.elapsed());

                    if let Some(value) = out {
                        let read_timer = Timer::start();
                        match tx.try_send(value) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(value)) => {
                                crate::metrics::record_dynamic_backpressure();
                                let _ = tx.send(value).await;
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => {}
                        }
                        crate::metrics::record_dynamic_read(read_timer.elapsed());
                    }

                    throughput.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    sem.release();
                });
            }
        });

        Self {
            inner: ReceiverStream::new(rx),
            driver,
            controller,
        }
    }

    /// Stops both background tasks: the driver loop that pulls from the
    /// upstream and spawns per-item transforms, and the hill-climbing
    /// controller that retunes the concurrency limit. Any in-flight
    /// transform tasks are left to finish on their own.
    pub async fn shutdown(self) {
        self.driver.abort();
        self.controller.abort();
        let _ = self.driver.await;
        let _ = self.controller.await;
    }
}

impl<Out> Stream for DynamicConcurrencyStream<Out> {
    type Item = Out;
    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Out>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
