use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use flowgate_sync::Signal;
use flowgate_time::Duration as FgDuration;
use futures::future::BoxFuture;
use futures::FutureExt;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Errors a queued task's future can resolve to.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MlpqError {
    /// The task's deadline passed before a worker picked it up.
    #[error("task timed out waiting in queue")]
    Timeout,
    /// The queue was shut down before the task ran.
    #[error("queue is shutting down")]
    Closed,
    /// The task's future panicked before it could complete.
    #[error("task panicked")]
    WorkerPanicked,
}

/// The four priority tiers, lowest value scanned first by workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(usize)]
pub enum Priority {
    Critical = 0,
    High = 1,
    Medium = 2,
    Low = 3,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

const PRIORITY_LEVELS: usize = 4;

/// Options controlling how a task is scheduled.
#[derive(Debug, Clone, Copy)]
pub struct QueueOptions {
    pub priority: Priority,
    /// How long the task may wait in queue before the curator times it out.
    pub timeout: FgDuration,
    /// If set, the curator promotes the task one priority tier after this
    /// much time has passed, provided it is not already `Critical`.
    pub escalate_after: Option<FgDuration>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            priority: Priority::Medium,
            timeout: FgDuration::from_secs(15),
            escalate_after: None,
        }
    }
}

struct QueuedTask {
    deadline: Instant,
    escalate_at: Option<Instant>,
    execute: Box<dyn FnOnce(Option<MlpqError>) -> BoxFuture<'static, ()> + Send>,
}

struct State {
    queues: [VecDeque<QueuedTask>; PRIORITY_LEVELS],
    shutting_down: bool,
}

impl State {
    fn pop_highest(&mut self) -> Option<QueuedTask> {
        for q in self.queues.iter_mut() {
            if let Some(t) = q.pop_front() {
                return Some(t);
            }
        }
        None
    }

    fn is_empty(&self) -> bool {
        self.queues.iter().all(|q| q.is_empty())
    }
}

/// A four-tier priority queue with a worker pool and a background
/// curator that enforces per-task deadlines and priority escalation.
///
/// Workers scan priorities `Critical..=Low`; the curator scans in the
/// opposite order so it sweeps the lowest, longest-waiting tiers first
/// on every tick.
pub struct MultiLevelQueue {
    state: Arc<StdMutex<State>>,
    signal: Arc<Signal>,
    shutting_down: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
    curator: Option<JoinHandle<()>>,
}

impl MultiLevelQueue {
    /// Spawns `worker_count` cooperative workers and one curator task.
    ///
    /// # Panics
    ///
    /// Panics if `worker_count` is zero.
    #[must_use]
    pub fn new(worker_count: usize) -> Self {
        assert!(worker_count >= 1, "worker_count must be >= 1");
        let state = Arc::new(StdMutex::new(State {
            queues: Default::default(),
            shutting_down: false,
        }));
        let signal = Arc::new(Signal::new());
        let shutting_down = Arc::new(AtomicBool::new(false));

        let workers = (0..worker_count)
            .map(|id| {
                tokio::spawn(worker_loop(id, state.clone(), signal.clone(), shutting_down.clone()))
            })
            .collect();

        let curator = Some(tokio::spawn(curator_loop(
            state.clone(),
            signal.clone(),
            shutting_down.clone(),
        )));

        Self {
            state,
            signal,
            shutting_down,
            workers,
            curator,
        }
    }

    /// Enqueues `work` with default [`QueueOptions`] (medium priority,
    /// 15s timeout) and returns a future that resolves when a worker
    /// runs it or the curator times it out.
    pub fn queue<F, Fut, T>(&self, work: F) -> impl Future<Output = Result<T, MlpqError>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.queue_with(QueueOptions::default(), work)
    }

    /// Enqueues `work` with explicit [`QueueOptions`].
    pub fn queue_with<F, Fut, T>(
        &self,
        options: QueueOptions,
        work: F,
    ) -> impl Future<Output = Result<T, MlpqError>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = tokio::sync::oneshot::channel::<Result<T, MlpqError>>();
        let execute: Box<dyn FnOnce(Option<MlpqError>) -> BoxFuture<'static, ()> + Send> =
            Box::new(move |err| {
                Box::pin(async move {
                    match err {
                        Some(e) => {
                            let _ = tx.send(Err(e));
                        }
                        None => match std::panic::AssertUnwindSafe(work()).catch_unwind().await {
                            Ok(out) => {
                                let _ = tx.send(Ok(out));
                            }
                            Err(_payload) => {
                                let _ = tx.send(Err(MlpqError::WorkerPanicked));
                            }
                        },
                    }
                })
            });

        let now = Instant::now();
        let task = QueuedTask {
            deadline: now + options.timeout.into(),
            escalate_at: options.escalate_after.map(|d| now + d.into()),
            execute,
        };

        {
            let mut s = self.state.lock().unwrap();
            if s.shutting_down {
                drop(s);
                // Reject immediately rather than enqueue into a dead queue.
                tokio::spawn((task.execute)(Some(MlpqError::Closed)));
            } else {
                s.queues[options.priority as usize].push_back(task);
            }
        }
        self.signal.notify_one();

        async move { rx.await.unwrap_or(Err(MlpqError::Closed)) }
    }

    /// Signals all workers and the curator to stop, rejects any tasks
    /// still queued, and waits for the background tasks to finish.
    pub async fn shutdown(self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        {
            let mut s = self.state.lock().unwrap();
            s.shutting_down = true;
        }
        self.signal.notify_all();

        for w in self.workers {
            let _ = w.await;
        }
        if let Some(c) = self.curator {
            let _ = c.await;
        }

        let leftover = {
            let mut s = self.state.lock().unwrap();
            let mut drained = Vec::new();
            while let Some(t) = s.pop_highest() {
                drained.push(t);
            }
            drained
        };
        for task in leftover {
            (task.execute)(Some(MlpqError::Closed)).await;
        }
    }
}

async fn worker_loop(
    _id: usize,
    state: Arc<StdMutex<State>>,
    signal: Arc<Signal>,
    shutting_down: Arc<AtomicBool>,
) {
    loop {
        if shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let next = {
            let mut s = state.lock().unwrap();
            s.pop_highest()
        };
        match next {
            Some(task) => {
                (task.execute)(None).await;
            }
            None => {
                if shutting_down.load(Ordering::SeqCst) {
                    return;
                }
                signal.wait(Some(FgDuration::from_millis(500))).await;
            }
        }
    }
}

async fn curator_loop(state: Arc<StdMutex<State>>, signal: Arc<Signal>, shutting_down: Arc<AtomicBool>) {
    let mut interval = tokio::time::interval(std::time::Duration::from_millis(250));
    loop {
        interval.tick().await;
        if shutting_down.load(Ordering::SeqCst) {
            return;
        }

        let now = Instant::now();
        let mut timed_out = Vec::new();
        let mut did_work = false;
        {
            let mut s = state.lock().unwrap();
            for p in (0..PRIORITY_LEVELS).rev() {
                loop {
                    let expired = matches!(s.queues[p].front(), Some(t) if t.deadline < now);
                    if !expired {
                        break;
                    }
                    if let Some(t) = s.queues[p].pop_front() {
                        timed_out.push(t);
                        did_work = true;
                    }
                }
                loop {
                    let should_escalate =
                        matches!(s.queues[p].front(), Some(t) if matches!(t.escalate_at, Some(at) if at <= now))
                            && p > 0;
                    if !should_escalate {
                        break;
                    }
                    if let Some(t) = s.queues[p].pop_front() {
                        s.queues[p - 1].push_back(t);
                        did_work = true;
                    }
                }
            }
        }

        for task in timed_out {
            warn!("curator: task timed out waiting in queue");
            (task.execute)(Some(MlpqError::Timeout)).await;
        }
        if did_work {
            debug!("curator: escalated or timed out tasks, waking workers");
            signal.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn higher_priority_runs_before_lower() {
        let mlpq = MultiLevelQueue::new(1);
        let order = Arc::new(StdMutex::new(Vec::new()));

        let o1 = order.clone();
        let low = mlpq.queue_with(
            QueueOptions {
                priority: Priority::Low,
                ..Default::default()
            },
            move || async move {
                o1.lock().unwrap().push("low");
            },
        );
        let o2 = order.clone();
        let crit = mlpq.queue_with(
            QueueOptions {
                priority: Priority::Critical,
                ..Default::default()
            },
            move || async move {
                o2.lock().unwrap().push("critical");
            },
        );

        tokio::time::advance(std::time::Duration::from_millis(1)).await;
        let _ = tokio::join!(low, crit);
        assert_eq!(*order.lock().unwrap(), vec!["critical", "low"]);
    }

    #[tokio::test(start_paused = true)]
    async fn task_times_out_when_worker_busy() {
        let mlpq = MultiLevelQueue::new(1);

        let busy = mlpq.queue(|| async move {
            tokio::time::sleep(std::time::Duration::from_secs(2)).await;
            "a"
        });

        tokio::time::advance(std::time::Duration::from_millis(10)).await;

        let quick = mlpq.queue_with(
            QueueOptions {
                priority: Priority::Critical,
                timeout: FgDuration::from_millis(300),
                ..Default::default()
            },
            || async move { "b" },
        );

        tokio::time::advance(std::time::Duration::from_millis(2500)).await;

        let (a, b) = tokio::join!(busy, quick);
        assert_eq!(a, Ok("a"));
        assert_eq!(b, Err(MlpqError::Timeout));
    }

    #[tokio::test]
    async fn panicking_task_rejects_future_and_worker_keeps_running() {
        let mlpq = MultiLevelQueue::new(1);

        let panicking = mlpq.queue(|| async move {
            panic!("boom");
            #[allow(unreachable_code)]
            1
        });
        assert_eq!(panicking.await, Err(MlpqError::WorkerPanicked));

        // The same (only) worker must still be alive to pick up the next task.
        let after = mlpq.queue(|| async move { "still alive" });
        assert_eq!(after.await, Ok("still alive"));
    }

    #[tokio::test]
    async fn shutdown_rejects_queued_tasks() {
        let mlpq = MultiLevelQueue::new(1);
        // Fill the only worker with long-running work so the second task stays queued.
        let busy = mlpq.queue(|| async move {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        });
        tokio::task::yield_now().await;
        let queued = mlpq.queue(|| async move { 1 });
        tokio::task::yield_now().await;

        mlpq.shutdown().await;
        let _ = busy.await;
        assert_eq!(queued.await, Err(MlpqError::Closed));
    }
}
