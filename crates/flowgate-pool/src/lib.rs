//! A resizable resource pool with a floating soft limit, breaker-guarded
//! item creation, and an RAII item handle that reclaims itself on drop.

mod metrics;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use flowgate_breaker::{BreakerConfig, CircuitBreaker, State as BreakerState};
use flowgate_sync::Signal;
use flowgate_time::{Duration, Timer};
use futures::future::BoxFuture;
use thiserror::Error;
use tracing::warn;

/// Errors a pool operation can resolve to.
#[derive(Debug, Error)]
pub enum PoolError {
    /// No item could be obtained before the timeout, the breaker was
    /// open, or the pool is shutting down.
    #[error("no item available from pool")]
    NoItemAvailable,
}

/// Subtype-provided hooks for creating, validating, and recycling pooled
/// items. Mirrors a SQL connection pool's `createConnection` /
/// `isValid` / `close` trio.
pub trait PoolManager<T>: Send + Sync {
    /// The error type [`PoolManager::create_item`] can fail with.
    type Error: std::fmt::Debug + Send + 'static;

    /// Creates one new item. May suspend; errors are swallowed by the
    /// pool (the breaker reacts to them instead).
    fn create_item(&self) -> BoxFuture<'_, Result<T, Self::Error>>;

    /// Whether a reclaimed item may be returned to the idle set.
    /// `reason` carries why the item is being reclaimed, if known.
    fn check_if_valid(&self, item: &T, reason: Option<&str>) -> bool;

    /// Destroys an item that failed validation or exceeded the floating
    /// limit. Errors are swallowed.
    fn recycle_item(&self, item: T) -> BoxFuture<'_, ()>;
}

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub name: String,
    pub initial_size: u32,
    pub maximum_size: u32,
    pub scale_in_threshold: u32,
    pub lazy_creation: bool,
    pub default_timeout: Duration,
    pub breaker: BreakerConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "pool".to_string(),
            initial_size: 1,
            maximum_size: 4,
            scale_in_threshold: 25,
            lazy_creation: false,
            default_timeout: Duration::from_secs(60),
            breaker: BreakerConfig::default(),
        }
    }
}

struct PoolInner<T, M> {
    manager: M,
    config: PoolConfig,
    idle: StdMutex<VecDeque<T>>,
    size: AtomicU32,
    floating_limit: AtomicU32,
    hits: AtomicU32,
    waiting: AtomicU32,
    signal: Signal,
    breaker: CircuitBreaker,
    shutting_down: AtomicBool,
}

/// A shared handle to a resource pool. Cheap to clone (an `Arc` around
/// shared state), so it can be handed to background tasks and RAII
/// item handles alike.
pub struct Pool<T, M: PoolManager<T>> {
    inner: Arc<PoolInner<T, M>>,
}

impl<T, M: PoolManager<T>> Clone for Pool<T, M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T, M> Pool<T, M>
where
    T: Send + 'static,
    M: PoolManager<T> + 'static,
{
    /// Builds a pool and, unless `config.lazy_creation` is set, blocks
    /// until `config.initial_size` items are created.
    pub async fn new(config: PoolConfig, manager: M) -> Self {
        let initial_size = config.initial_size;
        let breaker = CircuitBreaker::new(config.breaker);
        let inner = Arc::new(PoolInner {
            manager,
            floating_limit: AtomicU32::new(initial_size.max(1)),
            config,
            idle: StdMutex::new(VecDeque::new()),
            size: AtomicU32::new(0),
            hits: AtomicU32::new(0),
            waiting: AtomicU32::new(0),
            signal: Signal::new(),
            breaker,
            shutting_down: AtomicBool::new(false),
        });

        let pool = Self { inner };
        if !pool.inner.config.lazy_creation {
            for _ in 0..initial_size {
                try_create_item(&pool.inner).await;
            }
        }
        pool.report_size();
        pool
    }

    /// Non-suspending fast path: returns an idle item immediately if
    /// one exists and nobody is already waiting for one.
    pub fn get_now(&self) -> Option<PoolItem<T, M>> {
        if self.inner.waiting.load(Ordering::Acquire) > 0 {
            return None;
        }
        let item = self.inner.idle.lock().unwrap().pop_front()?;

        let hits = self.inner.hits.fetch_add(1, Ordering::AcqRel) + 1;
        if hits > self.inner.config.scale_in_threshold {
            self.inner.hits.store(0, Ordering::Release);
            let _ = self.inner.floating_limit.fetch_update(
                Ordering::AcqRel,
                Ordering::Acquire,
                |n| Some(n.saturating_sub(1).max(1)),
            );
        }

        Some(PoolItem::new(self.clone(), item))
    }

    /// Obtains an item, suspending up to `config.default_timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::NoItemAvailable`] if the breaker is open, no
    /// item becomes available before the timeout, or growing the pool
    /// past the floating limit also fails.
    pub async fn get(&self) -> Result<PoolItem<T, M>, PoolError> {
        self.get_timeout(self.inner.config.default_timeout).await
    }

    /// As [`Pool::get`], with an explicit timeout.
    pub async fn get_timeout(&self, timeout: Duration) -> Result<PoolItem<T, M>, PoolError> {
        if let Some(item) = self.get_now() {
            return Ok(item);
        }
        self.inner.hits.store(0, Ordering::Release);

        if self.inner.breaker.state() == BreakerState::Open {
            metrics::record_pool_retrieval_failure(&self.inner.config.name);
            return Err(PoolError::NoItemAvailable);
        }

        if self.inner.size.load(Ordering::Acquire) < self.inner.floating_limit.load(Ordering::Acquire) {
            let spawn_inner = self.inner.clone();
            tokio::spawn(async move {
                try_create_item(&spawn_inner).await;
            });
        }

        let wait_timer = Timer::start();
        self.inner.waiting.fetch_add(1, Ordering::AcqRel);
        let found = loop {
            let elapsed = wait_timer.elapsed();
            if elapsed >= timeout {
                break None;
            }
            self.inner.signal.wait(Some(timeout - elapsed)).await;
            if let Some(item) = self.inner.idle.lock().unwrap().pop_front() {
                break Some(item);
            }
        };
        self.inner.waiting.fetch_sub(1, Ordering::AcqRel);
        metrics::record_pool_wait(&self.inner.config.name, wait_timer.elapsed());

        if let Some(item) = found {
            return Ok(PoolItem::new(self.clone(), item));
        }

        if self.inner.floating_limit.load(Ordering::Acquire) < self.inner.config.maximum_size {
            self.inner.floating_limit.fetch_add(1, Ordering::AcqRel);
            if try_create_item(&self.inner).await {
                if let Some(item) = self.inner.idle.lock().unwrap().pop_front() {
                    return Ok(PoolItem::new(self.clone(), item));
                }
                // Creation succeeded but a concurrent waiter already popped
                // the new item: floating_limit legitimately grew, so it must
                // not be reverted even though this call still has nothing.
            } else {
                self.inner.floating_limit.fetch_sub(1, Ordering::AcqRel);
            }
        }

        metrics::record_pool_retrieval_failure(&self.inner.config.name);
        Err(PoolError::NoItemAvailable)
    }

    /// Current idle + in-use item count.
    #[must_use]
    pub fn size(&self) -> u32 {
        self.inner.size.load(Ordering::Acquire)
    }

    /// Current soft upper bound on the pool's size.
    #[must_use]
    pub fn floating_limit(&self) -> u32 {
        self.inner.floating_limit.load(Ordering::Acquire)
    }

    /// Marks the pool shut down and destroys every idle item.
    /// In-flight items are reclaimed normally as their handles drop.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::Release);
        let idle: Vec<T> = {
            let mut guard = self.inner.idle.lock().unwrap();
            std::mem::take(&mut *guard).into_iter().collect()
        };
        for item in idle {
            self.inner.manager.recycle_item(item).await;
            self.inner.size.fetch_sub(1, Ordering::AcqRel);
        }
        self.report_size();
    }

    fn report_size(&self) {
        metrics::record_pool_size(&self.inner.config.name, self.inner.size.load(Ordering::Acquire));
    }

    fn reclaim(&self, item: T, reason: Option<&'static str>) {
        let valid = !self.inner.shutting_down.load(Ordering::Acquire)
            && self.inner.manager.check_if_valid(&item, reason)
            && self.inner.size.load(Ordering::Acquire) <= self.inner.floating_limit.load(Ordering::Acquire);

        if valid {
            self.inner.idle.lock().unwrap().push_back(item);
            self.inner.signal.notify_one();
        } else {
            self.inner.size.fetch_sub(1, Ordering::AcqRel);
            let inner = self.inner.clone();
            tokio::spawn(async move {
                inner.manager.recycle_item(item).await;
            });
        }
        self.report_size();
    }
}

async fn try_create_item<T, M>(inner: &Arc<PoolInner<T, M>>) -> bool
where
    T: Send + 'static,
    M: PoolManager<T> + 'static,
{
    if inner.shutting_down.load(Ordering::Acquire) {
        return false;
    }
    match inner.breaker.invoke(|| inner.manager.create_item()).await {
        Ok(item) => {
            inner.idle.lock().unwrap().push_back(item);
            inner.size.fetch_add(1, Ordering::AcqRel);
            inner.signal.notify_one();
            true
        }
        Err(err) => {
            warn!(pool = %inner.config.name, error = ?err, "pool: item creation failed");
            false
        }
    }
}

/// An RAII handle to one pooled item.
///
/// Dropping the handle reclaims the item: if it still validates and the
/// pool isn't over its floating limit, it returns to the idle set;
/// otherwise it is recycled. [`PoolItem::release`] does the same thing
/// explicitly with a caller-supplied reason, for callers that know
/// *why* they're giving the item back (e.g. "connection reset").
pub struct PoolItem<T: Send + 'static, M: PoolManager<T> + 'static> {
    pool: Pool<T, M>,
    item: Option<T>,
}

impl<T, M> PoolItem<T, M>
where
    T: Send + 'static,
    M: PoolManager<T> + 'static,
{
    fn new(pool: Pool<T, M>, item: T) -> Self {
        Self {
            pool,
            item: Some(item),
        }
    }

    /// Reclaims the item immediately with an explicit reason, rather
    /// than waiting for `Drop`.
    pub fn release(mut self, reason: &'static str) {
        if let Some(item) = self.item.take() {
            self.pool.reclaim(item, Some(reason));
        }
    }
}

impl<T: Send + 'static, M: PoolManager<T> + 'static> std::ops::Deref for PoolItem<T, M> {
    type Target = T;
    fn deref(&self) -> &T {
        self.item.as_ref().expect("item taken only on drop/release")
    }
}

impl<T: Send + 'static, M: PoolManager<T> + 'static> std::ops::DerefMut for PoolItem<T, M> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().expect("item taken only on drop/release")
    }
}

impl<T, M> Drop for PoolItem<T, M>
where
    T: Send + 'static,
    M: PoolManager<T> + 'static,
{
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.pool.reclaim(item, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    struct CountingManager {
        next_id: AtomicU64,
        valid_until_reclaim: AtomicU64,
        reclaims: AtomicU64,
    }

    impl PoolManager<u64> for CountingManager {
        type Error = &'static str;

        fn create_item(&self) -> BoxFuture<'_, Result<u64, &'static str>> {
            Box::pin(async move { Ok(self.next_id.fetch_add(1, Ordering::AcqRel)) })
        }

        fn check_if_valid(&self, _item: &u64, _reason: Option<&str>) -> bool {
            self.reclaims.load(Ordering::Acquire) < self.valid_until_reclaim.load(Ordering::Acquire)
        }

        fn recycle_item(&self, _item: u64) -> BoxFuture<'_, ()> {
            Box::pin(async move {})
        }
    }

    #[tokio::test]
    async fn identity_changes_after_scale_in_threshold_reclaims() {
        let manager = CountingManager {
            next_id: AtomicU64::new(0),
            valid_until_reclaim: AtomicU64::new(25),
            reclaims: AtomicU64::new(0),
        };
        let pool = Pool::new(
            PoolConfig {
                initial_size: 1,
                maximum_size: 1,
                scale_in_threshold: 1_000,
                ..Default::default()
            },
            manager,
        )
        .await;

        let mut first = None;
        for i in 0..25 {
            let item = pool.get().await.unwrap();
            let id = *item;
            match first {
                Some(first) => assert_eq!(id, first, "still reusing original item at cycle {i}"),
                None => first = Some(id),
            }
            item.release("cycle");
            pool.inner.manager.reclaims.fetch_add(1, Ordering::AcqRel);
        }
        let first = first.unwrap();

        // The 26th reclaim sees `reclaims == 25`, so `check_if_valid` now
        // returns false and this release destroys the item instead of
        // returning it to idle.
        let stale = pool.get().await.unwrap();
        assert_eq!(*stale, first);
        stale.release("cycle");
        pool.inner.manager.reclaims.fetch_add(1, Ordering::AcqRel);

        let fresh = pool.get().await.unwrap();
        assert_ne!(*fresh, first, "26th reclaim should have destroyed the original item");
    }

    #[tokio::test]
    async fn lost_pop_race_after_successful_create_does_not_revert_floating_limit() {
        let manager = CountingManager {
            next_id: AtomicU64::new(0),
            valid_until_reclaim: AtomicU64::new(u64::MAX),
            reclaims: AtomicU64::new(0),
        };
        let pool = Pool::new(
            PoolConfig {
                initial_size: 0,
                maximum_size: 2,
                lazy_creation: true,
                ..Default::default()
            },
            manager,
        )
        .await;

        // Mirror what `get_timeout` does once its own wait loop times out:
        // bump `floating_limit`, create an item, then have a concurrent
        // waiter race in and pop it first.
        let before = pool.floating_limit();
        pool.inner.floating_limit.fetch_add(1, Ordering::AcqRel);
        let created = try_create_item(&pool.inner).await;
        assert!(created, "item creation should succeed");

        let stolen = pool.inner.idle.lock().unwrap().pop_front();
        assert!(stolen.is_some(), "simulated race: another waiter takes the new item first");

        // `get_timeout`'s own pop now finds nothing, but floating_limit must
        // stay at its bumped value since creation itself succeeded.
        assert!(pool.inner.idle.lock().unwrap().pop_front().is_none());
        assert_eq!(
            pool.floating_limit(),
            before + 1,
            "a successful create must not be reverted just because this caller lost the pop race"
        );
    }

    #[tokio::test]
    async fn get_now_returns_none_when_empty() {
        let manager = CountingManager {
            next_id: AtomicU64::new(0),
            valid_until_reclaim: AtomicU64::new(u64::MAX),
            reclaims: AtomicU64::new(0),
        };
        let pool = Pool::new(
            PoolConfig {
                initial_size: 0,
                lazy_creation: true,
                ..Default::default()
            },
            manager,
        )
        .await;
        assert!(pool.get_now().is_none());
    }
}
