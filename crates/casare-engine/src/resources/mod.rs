//! Pooled shared resources: browsers, HTTP sessions, database connections
//!
//! One `ResourceManager` is created per engine instance and shared by all
//! runs. Concrete drivers (how a browser is actually launched, how a DB
//! target is dialled) are collaborator traits; the manager owns pooling,
//! quotas and teardown.

pub mod pool;
pub mod rate_limit;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use pool::{Pool, PoolConfig, PooledHandle, PoolStats, ResourceFactory};

/// The resource classes the engine pools
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Browser,
    Http,
    Database,
}

/// A pooled browser instance
#[derive(Debug)]
pub struct BrowserSession {
    pub id: Uuid,
    /// Remote-debugging endpoint of the launched browser
    pub endpoint: String,
}

/// A pooled HTTP session with connection reuse
#[derive(Debug)]
pub struct HttpSession {
    pub client: reqwest::Client,
}

/// A pooled database connection. The inner connection object belongs to
/// the driver; nodes downcast it through their driver crate.
pub struct DbSession {
    pub target: String,
    pub connection: Arc<dyn std::any::Any + Send + Sync>,
}

impl std::fmt::Debug for DbSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DbSession({})", self.target)
    }
}

/// Launches browser instances for the browser pool
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn launch(&self) -> Result<BrowserSession>;
}

/// Dials database targets for the connection pool
#[async_trait]
pub trait DatabaseConnector: Send + Sync {
    async fn connect(&self, target: &str) -> Result<DbSession>;
}

/// Driver used when no browser integration is configured
struct UnconfiguredBrowserDriver;

#[async_trait]
impl BrowserDriver for UnconfiguredBrowserDriver {
    async fn launch(&self) -> Result<BrowserSession> {
        Err(EngineError::ResourceExhausted {
            what: "no browser driver configured".into(),
        })
    }
}

struct UnconfiguredDatabaseConnector;

#[async_trait]
impl DatabaseConnector for UnconfiguredDatabaseConnector {
    async fn connect(&self, target: &str) -> Result<DbSession> {
        Err(EngineError::ResourceExhausted {
            what: format!("no database connector configured for '{}'", target),
        })
    }
}

/// Pool sizing
#[derive(Debug, Clone)]
pub struct ResourceConfig {
    pub browser_max: usize,
    pub http_max: usize,
    pub db_max: usize,
    pub acquire_timeout: Duration,
    /// HTTP request timeout applied to pooled clients
    pub http_timeout: Duration,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            browser_max: 3,
            http_max: 10,
            db_max: 5,
            acquire_timeout: Duration::from_secs(30),
            http_timeout: Duration::from_secs(30),
        }
    }
}

/// Shared pools for one engine instance
pub struct ResourceManager {
    config: ResourceConfig,
    browsers: Pool<BrowserSession>,
    http: Pool<HttpSession>,
    databases: Pool<DbSession>,
}

impl ResourceManager {
    pub fn new(config: ResourceConfig) -> Self {
        Self::with_drivers(
            config,
            Arc::new(UnconfiguredBrowserDriver),
            Arc::new(UnconfiguredDatabaseConnector),
        )
    }

    /// Build a manager with concrete drivers
    pub fn with_drivers(
        config: ResourceConfig,
        browser_driver: Arc<dyn BrowserDriver>,
        db_connector: Arc<dyn DatabaseConnector>,
    ) -> Self {
        let browser_factory: ResourceFactory<BrowserSession> = {
            let driver = Arc::clone(&browser_driver);
            Arc::new(move |_key| {
                let driver = Arc::clone(&driver);
                Box::pin(async move { driver.launch().await })
            })
        };

        let http_timeout = config.http_timeout;
        let http_factory: ResourceFactory<HttpSession> = Arc::new(move |_key| {
            Box::pin(async move {
                let client = reqwest::Client::builder()
                    .timeout(http_timeout)
                    .build()
                    .map_err(|e| EngineError::internal(format!("http client build: {}", e)))?;
                Ok(HttpSession { client })
            })
        });

        let db_factory: ResourceFactory<DbSession> = {
            let connector = Arc::clone(&db_connector);
            Arc::new(move |key| {
                let connector = Arc::clone(&connector);
                Box::pin(async move { connector.connect(&key).await })
            })
        };

        Self {
            browsers: Pool::new(
                PoolConfig {
                    name: "browser",
                    max: config.browser_max,
                    acquire_timeout: config.acquire_timeout,
                },
                browser_factory,
            ),
            http: Pool::new(
                PoolConfig {
                    name: "http",
                    max: config.http_max,
                    acquire_timeout: config.acquire_timeout,
                },
                http_factory,
            ),
            databases: Pool::new(
                PoolConfig {
                    name: "database",
                    max: config.db_max,
                    acquire_timeout: config.acquire_timeout,
                },
                db_factory,
            ),
            config,
        }
    }

    pub fn config(&self) -> &ResourceConfig {
        &self.config
    }

    pub async fn acquire_browser(&self) -> Result<PooledHandle<BrowserSession>> {
        self.browsers.acquire("").await
    }

    pub async fn acquire_http(&self) -> Result<PooledHandle<HttpSession>> {
        self.http.acquire("").await
    }

    pub async fn acquire_database(&self, target: &str) -> Result<PooledHandle<DbSession>> {
        self.databases.acquire(target).await
    }

    pub fn stats(&self, kind: ResourceKind) -> PoolStats {
        match kind {
            ResourceKind::Browser => self.browsers.stats(),
            ResourceKind::Http => self.http.stats(),
            ResourceKind::Database => self.databases.stats(),
        }
    }
}

/// Per-run quota gate layered over the shared pools.
///
/// A run acquires through its `RunResources`, which counts concurrent
/// handles against the quota before touching the pool. Dropping the
/// returned guard releases both.
pub struct RunResources {
    manager: Arc<ResourceManager>,
    quota: Option<Arc<Semaphore>>,
    quota_fail_fast: bool,
    acquire_timeout: Duration,
}

/// A pool handle plus its quota permit
pub struct ResourceGuard<R: Send + Sync + 'static> {
    handle: PooledHandle<R>,
    _quota: Option<OwnedSemaphorePermit>,
}

impl<R: Send + Sync + 'static> std::fmt::Debug for ResourceGuard<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceGuard")
            .field("handle", &self.handle)
            .finish()
    }
}

impl<R: Send + Sync + 'static> ResourceGuard<R> {
    pub fn handle(&self) -> &PooledHandle<R> {
        &self.handle
    }

    pub fn share(&self) -> Arc<R> {
        self.handle.share()
    }

    pub fn mark_broken(&self) {
        self.handle.mark_broken();
    }
}

impl<R: Send + Sync + 'static> std::ops::Deref for ResourceGuard<R> {
    type Target = R;

    fn deref(&self) -> &R {
        self.handle.resource()
    }
}

/// Handles reserved for a run at start time, released together at teardown
pub enum ReservedResource {
    Browser(ResourceGuard<BrowserSession>),
    Http(ResourceGuard<HttpSession>),
    Database(ResourceGuard<DbSession>),
}

impl RunResources {
    pub fn new(
        manager: Arc<ResourceManager>,
        quota: Option<usize>,
        quota_fail_fast: bool,
    ) -> Self {
        let acquire_timeout = manager.config().acquire_timeout;
        Self {
            manager,
            quota: quota.map(|n| Arc::new(Semaphore::new(n.max(1)))),
            quota_fail_fast,
            acquire_timeout,
        }
    }

    async fn quota_permit(&self) -> Result<Option<OwnedSemaphorePermit>> {
        let Some(quota) = &self.quota else {
            return Ok(None);
        };
        if self.quota_fail_fast {
            return Arc::clone(quota)
                .try_acquire_owned()
                .map(Some)
                .map_err(|_| EngineError::ResourceExhausted {
                    what: "run resource quota exceeded".into(),
                });
        }
        tokio::time::timeout(self.acquire_timeout, Arc::clone(quota).acquire_owned())
            .await
            .map_err(|_| EngineError::ResourceExhausted {
                what: "run resource quota wait timed out".into(),
            })?
            .map(Some)
            .map_err(|_| EngineError::internal("quota semaphore closed"))
    }

    pub async fn acquire_browser(&self) -> Result<ResourceGuard<BrowserSession>> {
        let quota = self.quota_permit().await?;
        Ok(ResourceGuard {
            handle: self.manager.acquire_browser().await?,
            _quota: quota,
        })
    }

    pub async fn acquire_http(&self) -> Result<ResourceGuard<HttpSession>> {
        let quota = self.quota_permit().await?;
        Ok(ResourceGuard {
            handle: self.manager.acquire_http().await?,
            _quota: quota,
        })
    }

    pub async fn acquire_database(&self, target: &str) -> Result<ResourceGuard<DbSession>> {
        let quota = self.quota_permit().await?;
        Ok(ResourceGuard {
            handle: self.manager.acquire_database(target).await?,
            _quota: quota,
        })
    }

    /// Reserve one handle per kind up front (derived from plan analysis)
    /// so concurrent node starts do not storm the pools.
    pub async fn reserve(&self, kinds: &[ResourceKind]) -> Result<Vec<ReservedResource>> {
        let mut reserved = Vec::with_capacity(kinds.len());
        for kind in kinds {
            let entry = match kind {
                ResourceKind::Browser => ReservedResource::Browser(self.acquire_browser().await?),
                ResourceKind::Http => ReservedResource::Http(self.acquire_http().await?),
                ResourceKind::Database => {
                    ReservedResource::Database(self.acquire_database("").await?)
                }
            };
            reserved.push(entry);
        }
        Ok(reserved)
    }

    pub fn manager(&self) -> &Arc<ResourceManager> {
        &self.manager
    }
}
