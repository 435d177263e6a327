//! Generic keyed resource pool
//!
//! One pool guards one class of expensive resources (browsers, HTTP
//! sessions, database connections). Capacity is enforced by a fair FIFO
//! semaphore; the idle list is a small mutex-guarded LRU. Entries are
//! keyed so one pool can serve several targets (e.g. DB connections per
//! connection string); unkeyed pools use the empty key.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{EngineError, Result};

/// Async constructor for pool entries, invoked with the entry key
pub type ResourceFactory<R> =
    Arc<dyn Fn(String) -> BoxFuture<'static, Result<R>> + Send + Sync>;

/// Static pool limits
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Pool name used in logs and errors
    pub name: &'static str,
    /// Maximum live resources (in use + idle)
    pub max: usize,
    /// How long an acquire may wait for capacity
    pub acquire_timeout: Duration,
}

struct IdleEntry<R> {
    key: String,
    resource: Arc<R>,
    since: Instant,
}

struct PoolState<R> {
    /// Front is least recently used
    idle: VecDeque<IdleEntry<R>>,
    /// Resources currently alive (in use + idle)
    live: usize,
}

struct PoolInner<R: Send + Sync + 'static> {
    config: PoolConfig,
    semaphore: Arc<Semaphore>,
    state: Mutex<PoolState<R>>,
    factory: ResourceFactory<R>,
}

/// A keyed LRU pool
pub struct Pool<R: Send + Sync + 'static> {
    inner: Arc<PoolInner<R>>,
}

impl<R: Send + Sync + 'static> Clone for Pool<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: Send + Sync + 'static> Pool<R> {
    pub fn new(config: PoolConfig, factory: ResourceFactory<R>) -> Self {
        let max = config.max.max(1);
        Self {
            inner: Arc::new(PoolInner {
                semaphore: Arc::new(Semaphore::new(max)),
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    live: 0,
                }),
                config: PoolConfig { max, ..config },
                factory,
            }),
        }
    }

    /// Acquire a resource for `key`, reusing an idle match when possible.
    ///
    /// Waits FIFO for capacity up to the configured timeout, evicting the
    /// least recently used idle entry when the pool is full of other keys.
    /// A factory failure counts as a dead slot: nothing is retained and
    /// the capacity is released for the next caller.
    pub async fn acquire(&self, key: &str) -> Result<PooledHandle<R>> {
        let inner = &self.inner;
        let permit = tokio::time::timeout(
            inner.config.acquire_timeout,
            Arc::clone(&inner.semaphore).acquire_owned(),
        )
        .await
        .map_err(|_| EngineError::ResourceExhausted {
            what: format!("{} pool acquire timed out", inner.config.name),
        })?
        .map_err(|_| EngineError::internal("pool semaphore closed"))?;

        // Fast path: reuse the most recently used idle entry for this key
        let reuse = {
            let mut state = inner.state.lock();
            if let Some(pos) = state.idle.iter().rposition(|e| e.key == key) {
                state.idle.remove(pos).map(|e| e.resource)
            } else {
                if state.live >= inner.config.max {
                    // Full of other keys: evict the least recently used
                    if let Some(victim) = state.idle.pop_front() {
                        log::debug!(
                            "{} pool evicting idle '{}' after {:?}",
                            inner.config.name,
                            victim.key,
                            victim.since.elapsed()
                        );
                        state.live -= 1;
                    }
                }
                None
            }
        };

        let resource = match reuse {
            Some(resource) => resource,
            None => {
                let created = (inner.factory)(key.to_string()).await.map_err(|e| {
                    log::warn!("{} pool factory failed for '{}': {}", inner.config.name, key, e);
                    e
                })?;
                let mut state = inner.state.lock();
                state.live += 1;
                Arc::new(created)
            }
        };

        Ok(PooledHandle {
            resource: Some(resource),
            key: key.to_string(),
            pool: Arc::clone(inner),
            broken: AtomicBool::new(false),
            _permit: permit,
        })
    }

    /// Live / idle counts, for diagnostics and tests
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            live: state.live,
            idle: state.idle.len(),
            capacity: self.inner.config.max,
        }
    }
}

/// Snapshot of a pool's occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub live: usize,
    pub idle: usize,
    pub capacity: usize,
}

/// An acquired resource. Returned to the pool on drop unless marked
/// broken, in which case the slot is discarded and re-created on demand.
pub struct PooledHandle<R: Send + Sync + 'static> {
    resource: Option<Arc<R>>,
    key: String,
    pool: Arc<PoolInner<R>>,
    broken: AtomicBool,
    _permit: OwnedSemaphorePermit,
}

impl<R: Send + Sync + 'static> std::fmt::Debug for PooledHandle<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledHandle")
            .field("key", &self.key)
            .field("broken", &self.broken)
            .finish()
    }
}

impl<R: Send + Sync + 'static> PooledHandle<R> {
    /// The key this handle was acquired under
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Shared reference to the resource for the duration of the borrow
    pub fn resource(&self) -> &R {
        self.resource
            .as_deref()
            .unwrap_or_else(|| unreachable!("resource taken before drop"))
    }

    /// Shared ownership of the resource (for handing to data ports)
    pub fn share(&self) -> Arc<R> {
        Arc::clone(self.resource.as_ref().unwrap_or_else(|| unreachable!()))
    }

    /// Mark the resource unhealthy; it will not be re-pooled
    pub fn mark_broken(&self) {
        self.broken.store(true, Ordering::Relaxed);
    }
}

impl<R: Send + Sync + 'static> std::ops::Deref for PooledHandle<R> {
    type Target = R;

    fn deref(&self) -> &R {
        self.resource()
    }
}

impl<R: Send + Sync + 'static> Drop for PooledHandle<R> {
    fn drop(&mut self) {
        let Some(resource) = self.resource.take() else {
            return;
        };
        let mut state = self.pool.state.lock();
        if self.broken.load(Ordering::Relaxed) {
            state.live -= 1;
            log::debug!("{} pool dropping broken '{}'", self.pool.config.name, self.key);
        } else {
            state.idle.push_back(IdleEntry {
                key: std::mem::take(&mut self.key),
                resource,
                since: Instant::now(),
            });
        }
        // The permit drops after this, releasing capacity FIFO
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_pool(max: usize) -> (Pool<usize>, Arc<AtomicUsize>) {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&created);
        let pool = Pool::new(
            PoolConfig {
                name: "test",
                max,
                acquire_timeout: Duration::from_millis(50),
            },
            Arc::new(move |_key| {
                let counter = Arc::clone(&counter);
                Box::pin(async move { Ok(counter.fetch_add(1, Ordering::SeqCst)) })
            }),
        );
        (pool, created)
    }

    #[tokio::test]
    async fn test_reuse_idle_entry() {
        let (pool, created) = counting_pool(2);
        {
            let handle = pool.acquire("a").await.unwrap();
            assert_eq!(*handle.resource(), 0);
        }
        let handle = pool.acquire("a").await.unwrap();
        assert_eq!(*handle.resource(), 0);
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_capacity_blocks_until_release() {
        let (pool, _) = counting_pool(1);
        let first = pool.acquire("a").await.unwrap();
        // Second acquire must time out while the first is held
        let err = pool.acquire("a").await.unwrap_err();
        assert!(matches!(err, EngineError::ResourceExhausted { .. }));
        drop(first);
        assert!(pool.acquire("a").await.is_ok());
    }

    #[tokio::test]
    async fn test_lru_eviction_across_keys() {
        let (pool, created) = counting_pool(2);
        drop(pool.acquire("a").await.unwrap());
        drop(pool.acquire("b").await.unwrap());
        assert_eq!(pool.stats().idle, 2);

        // A third key forces eviction of the least recently used ("a")
        drop(pool.acquire("c").await.unwrap());
        assert_eq!(created.load(Ordering::SeqCst), 3);
        let stats = pool.stats();
        assert_eq!(stats.live, 2);

        // "b" is still idle and reusable without a new creation
        drop(pool.acquire("b").await.unwrap());
        assert_eq!(created.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_broken_handles_are_not_repooled() {
        let (pool, created) = counting_pool(1);
        {
            let handle = pool.acquire("a").await.unwrap();
            handle.mark_broken();
        }
        assert_eq!(pool.stats(), PoolStats { live: 0, idle: 0, capacity: 1 });
        drop(pool.acquire("a").await.unwrap());
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_factory_failure_releases_capacity() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let pool: Pool<usize> = Pool::new(
            PoolConfig {
                name: "flaky",
                max: 1,
                acquire_timeout: Duration::from_millis(50),
            },
            Arc::new(move |_key| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                Box::pin(async move {
                    if n == 0 {
                        Err(EngineError::ResourceExhausted {
                            what: "connect refused".into(),
                        })
                    } else {
                        Ok(n)
                    }
                })
            }),
        );

        assert!(pool.acquire("a").await.is_err());
        // The dead slot was not retained; the next acquire re-creates
        let handle = pool.acquire("a").await.unwrap();
        assert_eq!(*handle.resource(), 1);
    }
}
