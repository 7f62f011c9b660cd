//! Bounded resource pool.
//!
//! At most `max_size` resources are checked out at any instant; a tokio
//! semaphore with that many permits enforces the bound. Idle resources sit in
//! a `parking_lot` protected queue so that they can be handed back from
//! `Drop`, which is how a [`Lease`] returns its resource on every exit path.

use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

/// Builds and tears down the resources held by a [`ResourcePool`].
#[async_trait]
pub trait ResourceFactory: Send + Sync + 'static {
    type Resource: Send + 'static;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Creates a fresh resource.
    async fn build(&self) -> Result<Self::Resource, Self::Error>;

    /// Tears a resource down. Dropping it is the default.
    fn destroy(&self, resource: Self::Resource) {
        drop(resource);
    }

    /// Whether a resource coming back from a caller may be handed out again.
    fn is_reusable(&self, _resource: &Self::Resource) -> bool {
        true
    }
}

/// Pool sizing and acquire timeout.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Upper bound on resources checked out at once
    pub max_size: usize,
    /// Resources kept alive by [`ResourcePool::fill`]
    pub min_size: usize,
    /// How long [`ResourcePool::lease`] waits for a permit
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 30,
            min_size: 1,
            acquire_timeout: Duration::from_secs(4),
        }
    }
}

/// Why a resource could not be handed out.
#[derive(Debug, Error)]
pub enum PoolError<E> {
    #[error("timed out after {0:?} waiting for a pooled resource")]
    Timeout(Duration),

    #[error("pool has been disposed")]
    Disposed,

    #[error("failed to build resource: {0}")]
    Build(E),

    #[error("operation panicked while holding a pooled resource")]
    Panicked,
}

/// Result of [`ResourcePool::consume`].
///
/// `NotAcquired` is an ordinary value, not an error path: the caller decides
/// whether to retry elsewhere or give up.
#[derive(Debug)]
pub enum Consumed<R, E> {
    Acquired(R),
    NotAcquired(PoolError<E>),
}

impl<R, E> Consumed<R, E> {
    pub fn is_acquired(&self) -> bool {
        matches!(self, Consumed::Acquired(_))
    }

    pub fn into_result(self) -> Result<R, PoolError<E>> {
        match self {
            Consumed::Acquired(value) => Ok(value),
            Consumed::NotAcquired(err) => Err(err),
        }
    }
}

struct Idle<T> {
    resource: T,
    since: Instant,
}

struct Shared<F: ResourceFactory> {
    factory: F,
    config: PoolConfig,
    idle: Mutex<VecDeque<Idle<F::Resource>>>,
    semaphore: Arc<Semaphore>,
    /// Resources in existence: idle, checked out, or being built
    live: AtomicUsize,
    disposed: AtomicBool,
}

impl<F: ResourceFactory> Shared<F> {
    fn checkin(&self, resource: F::Resource) {
        if !self.factory.is_reusable(&resource) {
            self.discard(resource);
            return;
        }

        let mut idle = self.idle.lock();
        // Checked under the idle lock so a concurrent dispose cannot miss it
        if self.disposed.load(Ordering::Acquire) {
            drop(idle);
            self.discard(resource);
            return;
        }
        idle.push_back(Idle {
            resource,
            since: Instant::now(),
        });
    }

    fn discard(&self, resource: F::Resource) {
        self.live.fetch_sub(1, Ordering::AcqRel);
        self.factory.destroy(resource);
    }

    fn take_idle(&self) -> Option<F::Resource> {
        loop {
            let idle = self.idle.lock().pop_back()?;
            if self.factory.is_reusable(&idle.resource) {
                return Some(idle.resource);
            }
            debug!("discarding stale idle resource");
            self.discard(idle.resource);
        }
    }
}

/// Decrements the live count unless the build it guards completes.
struct Reservation<'a> {
    live: &'a AtomicUsize,
    armed: bool,
}

impl<'a> Reservation<'a> {
    fn new(live: &'a AtomicUsize) -> Self {
        Self { live, armed: true }
    }

    fn commit(mut self) {
        self.armed = false;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.live.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// Bounded pool of reusable resources.
pub struct ResourcePool<F: ResourceFactory> {
    shared: Arc<Shared<F>>,
}

impl<F: ResourceFactory> ResourcePool<F> {
    /// Creates an empty pool. Resources are built on demand, or up front
    /// with [`fill`](Self::fill).
    ///
    /// A pool with `max_size == 0` never hands anything out.
    pub fn new(factory: F, config: PoolConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_size));
        Self {
            shared: Arc::new(Shared {
                factory,
                config,
                idle: Mutex::new(VecDeque::new()),
                semaphore,
                live: AtomicUsize::new(0),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn factory(&self) -> &F {
        &self.shared.factory
    }

    pub fn max_size(&self) -> usize {
        self.shared.config.max_size
    }

    /// Permits not currently held by a lease.
    pub fn available_permits(&self) -> usize {
        self.shared.semaphore.available_permits()
    }

    pub fn idle_count(&self) -> usize {
        self.shared.idle.lock().len()
    }

    /// Resources in existence, idle or checked out.
    pub fn live_count(&self) -> usize {
        self.shared.live.load(Ordering::Acquire)
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::Acquire)
    }

    /// Checks a resource out, waiting up to the acquire timeout for a permit.
    ///
    /// Reuses the most recently returned idle resource, building a new one
    /// when none is idle. The lease gives the resource back when it is
    /// released or dropped.
    pub async fn lease(&self) -> Result<Lease<F>, PoolError<F::Error>> {
        if self.is_disposed() {
            return Err(PoolError::Disposed);
        }

        let wait = self.shared.config.acquire_timeout;
        let permit = match tokio::time::timeout(wait, self.shared.semaphore.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            // Semaphore closed by dispose
            Ok(Err(_)) => return Err(PoolError::Disposed),
            Err(_) => return Err(PoolError::Timeout(wait)),
        };

        if self.is_disposed() {
            return Err(PoolError::Disposed);
        }

        let resource = match self.shared.take_idle() {
            Some(resource) => resource,
            None => self.build_one().await?,
        };

        Ok(Lease {
            shared: Arc::clone(&self.shared),
            resource: Some(resource),
            _permit: permit,
        })
    }

    /// Runs `op` with exclusive access to one pooled resource.
    ///
    /// The resource goes back to the pool however `op` ends, including by
    /// panicking; a panic is reported as `NotAcquired(Panicked)`.
    pub async fn consume<R, Op>(&self, op: Op) -> Consumed<R, F::Error>
    where
        Op: for<'a> FnOnce(&'a mut F::Resource) -> BoxFuture<'a, R>,
    {
        let mut lease = match self.lease().await {
            Ok(lease) => lease,
            Err(err) => return Consumed::NotAcquired(err),
        };

        let result = AssertUnwindSafe(async { op(&mut *lease).await })
            .catch_unwind()
            .await;
        lease.release();

        match result {
            Ok(value) => Consumed::Acquired(value),
            Err(_) => {
                warn!("operation panicked while holding a pooled resource");
                Consumed::NotAcquired(PoolError::Panicked)
            }
        }
    }

    /// Builds idle resources until `target` exist (capped at `max_size`).
    ///
    /// Only uses permits nobody is waiting on, so it never pushes the pool
    /// past its bound. Returns how many resources were built.
    pub async fn fill(&self, target: usize) -> Result<usize, PoolError<F::Error>> {
        let cap = target.min(self.shared.config.max_size);
        let mut built = 0;

        loop {
            if self.is_disposed() {
                return Err(PoolError::Disposed);
            }

            let permit = match self.shared.semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let reserved = self
                .shared
                .live
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < cap).then_some(n + 1))
                .is_ok();
            if !reserved {
                break;
            }

            let reservation = Reservation::new(&self.shared.live);
            let resource = self.shared.factory.build().await.map_err(PoolError::Build)?;
            reservation.commit();

            self.shared.checkin(resource);
            drop(permit);
            built += 1;
        }

        if built > 0 {
            debug!(built, live = self.live_count(), "pool filled");
        }
        Ok(built)
    }

    /// Destroys idle resources unused for at least `max_idle`, along with
    /// any idle resource that is no longer reusable.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let expired: Vec<Idle<F::Resource>> = {
            let mut idle = self.shared.idle.lock();
            let factory = &self.shared.factory;
            let (keep, expired): (Vec<_>, Vec<_>) = idle
                .drain(..)
                .partition(|entry| entry.since.elapsed() < max_idle && factory.is_reusable(&entry.resource));
            idle.extend(keep);
            expired
        };

        let evicted = expired.len();
        for entry in expired {
            self.shared.discard(entry.resource);
        }
        if evicted > 0 {
            debug!(evicted, "evicted idle resources");
        }
        evicted
    }

    /// Shuts the pool down and destroys every idle resource.
    ///
    /// Waiting and future leases fail with `Disposed`; resources still
    /// checked out are destroyed when they come back. Calling it again does
    /// nothing. Returns how many idle resources were destroyed.
    pub fn dispose(&self) -> usize {
        if self.shared.disposed.swap(true, Ordering::AcqRel) {
            return 0;
        }
        self.shared.semaphore.close();

        let drained: Vec<_> = self.shared.idle.lock().drain(..).collect();
        let destroyed = drained.len();
        for entry in drained {
            self.shared.discard(entry.resource);
        }

        debug!(destroyed, "pool disposed");
        destroyed
    }

    async fn build_one(&self) -> Result<F::Resource, PoolError<F::Error>> {
        self.shared.live.fetch_add(1, Ordering::AcqRel);
        let reservation = Reservation::new(&self.shared.live);
        let resource = self.shared.factory.build().await.map_err(PoolError::Build)?;
        reservation.commit();

        debug!(live = self.live_count(), "pool grew");
        Ok(resource)
    }
}

impl<F: ResourceFactory> fmt::Debug for ResourcePool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcePool")
            .field("max_size", &self.max_size())
            .field("live", &self.live_count())
            .field("idle", &self.idle_count())
            .field("available_permits", &self.available_permits())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// A checked-out resource.
///
/// Holds one pool permit. [`release`](Self::release) hands the resource back
/// explicitly; dropping the lease does the same. A resource the factory no
/// longer considers reusable is destroyed instead of returned.
pub struct Lease<F: ResourceFactory> {
    shared: Arc<Shared<F>>,
    resource: Option<F::Resource>,
    _permit: OwnedSemaphorePermit,
}

impl<F: ResourceFactory> Lease<F> {
    /// Returns the resource to the pool and frees the permit.
    pub fn release(self) {
        drop(self);
    }

    /// Destroys the resource instead of returning it.
    pub fn discard(mut self) {
        if let Some(resource) = self.resource.take() {
            self.shared.discard(resource);
        }
    }
}

impl<F: ResourceFactory> Deref for Lease<F> {
    type Target = F::Resource;

    fn deref(&self) -> &Self::Target {
        self.resource.as_ref().expect("lease holds its resource until dropped")
    }
}

impl<F: ResourceFactory> DerefMut for Lease<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.resource.as_mut().expect("lease holds its resource until dropped")
    }
}

impl<F: ResourceFactory> Drop for Lease<F> {
    fn drop(&mut self) {
        // Resource goes back before the permit field is dropped
        if let Some(resource) = self.resource.take() {
            self.shared.checkin(resource);
        }
    }
}

impl<F: ResourceFactory> fmt::Debug for Lease<F>
where
    F::Resource: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease").field("resource", &self.resource).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug)]
    struct Probe {
        id: usize,
        healthy: bool,
    }

    #[derive(Debug, Error)]
    #[error("factory refused")]
    struct Refused;

    #[derive(Default)]
    struct ProbeFactory {
        built: AtomicUsize,
        destroyed: AtomicUsize,
        refuse: AtomicBool,
    }

    #[async_trait]
    impl ResourceFactory for Arc<ProbeFactory> {
        type Resource = Probe;
        type Error = Refused;

        async fn build(&self) -> Result<Probe, Refused> {
            if self.refuse.load(Ordering::SeqCst) {
                return Err(Refused);
            }
            let id = self.built.fetch_add(1, Ordering::SeqCst);
            Ok(Probe { id, healthy: true })
        }

        fn destroy(&self, _resource: Probe) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }

        fn is_reusable(&self, resource: &Probe) -> bool {
            resource.healthy
        }
    }

    fn pool(max_size: usize, acquire_timeout: Duration) -> (ResourcePool<Arc<ProbeFactory>>, Arc<ProbeFactory>) {
        let factory = Arc::new(ProbeFactory::default());
        let config = PoolConfig {
            max_size,
            min_size: 0,
            acquire_timeout,
        };
        (ResourcePool::new(factory.clone(), config), factory)
    }

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_size, 30);
        assert_eq!(config.min_size, 1);
        assert_eq!(config.acquire_timeout, Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_consume_reuses_resource() {
        let (pool, factory) = pool(2, Duration::from_secs(1));

        let first = pool.consume(|probe| async move { probe.id }.boxed()).await;
        let second = pool.consume(|probe| async move { probe.id }.boxed()).await;

        assert_eq!(first.into_result().unwrap(), 0);
        assert_eq!(second.into_result().unwrap(), 0);
        assert_eq!(factory.built.load(Ordering::SeqCst), 1);
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(pool.available_permits(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pool_bound_invariant() {
        let (pool, _factory) = pool(3, Duration::from_secs(10));
        let pool = Arc::new(pool);
        let checked_out = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..24)
            .map(|_| {
                let pool = pool.clone();
                let checked_out = checked_out.clone();
                let peak = peak.clone();
                tokio::spawn(async move {
                    pool.consume(move |_probe| {
                        async move {
                            let now = checked_out.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(5)).await;
                            checked_out.fetch_sub(1, Ordering::SeqCst);
                        }
                        .boxed()
                    })
                    .await
                    .is_acquired()
                })
            })
            .collect();

        for result in futures::future::join_all(tasks).await {
            assert!(result.unwrap());
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(pool.available_permits(), 3);
        assert!(pool.live_count() <= 3);
    }

    #[tokio::test]
    async fn test_resource_survives_panic() {
        let (pool, factory) = pool(1, Duration::from_millis(200));

        let outcome: Consumed<(), Refused> = pool.consume(|_probe| async { panic!("boom") }.boxed()).await;
        assert!(matches!(outcome, Consumed::NotAcquired(PoolError::Panicked)));

        assert_eq!(pool.available_permits(), 1);
        for _ in 0..3 {
            assert!(pool.consume(|probe| async move { probe.id }.boxed()).await.is_acquired());
        }
        assert_eq!(factory.built.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_consume_times_out_when_exhausted() {
        let (pool, _factory) = pool(1, Duration::from_millis(50));
        let held = pool.lease().await.unwrap();

        let outcome = pool.consume(|probe| async move { probe.id }.boxed()).await;
        assert!(matches!(outcome, Consumed::NotAcquired(PoolError::Timeout(_))));

        held.release();
        assert!(pool.consume(|probe| async move { probe.id }.boxed()).await.is_acquired());
    }

    #[tokio::test]
    async fn test_lease_release_and_drop() {
        let (pool, _factory) = pool(2, Duration::from_secs(1));

        let lease = pool.lease().await.unwrap();
        assert_eq!(pool.available_permits(), 1);
        lease.release();
        assert_eq!(pool.available_permits(), 2);
        assert_eq!(pool.idle_count(), 1);

        {
            let _lease = pool.lease().await.unwrap();
            assert_eq!(pool.idle_count(), 0);
        }
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(pool.available_permits(), 2);
    }

    #[tokio::test]
    async fn test_broken_resource_is_destroyed() {
        let (pool, factory) = pool(1, Duration::from_secs(1));

        pool.consume(|probe| {
            async move {
                probe.healthy = false;
            }
            .boxed()
        })
        .await;

        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.live_count(), 0);
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);

        let id = pool.consume(|probe| async move { probe.id }.boxed()).await;
        assert_eq!(id.into_result().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_build_failure_releases_permit() {
        let (pool, factory) = pool(2, Duration::from_secs(1));
        factory.refuse.store(true, Ordering::SeqCst);

        let outcome = pool.consume(|probe| async move { probe.id }.boxed()).await;
        assert!(matches!(outcome, Consumed::NotAcquired(PoolError::Build(Refused))));
        assert_eq!(pool.available_permits(), 2);
        assert_eq!(pool.live_count(), 0);
    }

    #[tokio::test]
    async fn test_fill_respects_max_size() {
        let (pool, factory) = pool(2, Duration::from_secs(1));

        assert_eq!(pool.fill(5).await.unwrap(), 2);
        assert_eq!(pool.idle_count(), 2);
        assert_eq!(pool.fill(5).await.unwrap(), 0);
        assert_eq!(factory.built.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fill_counts_checked_out_resources() {
        let (pool, _factory) = pool(3, Duration::from_secs(1));
        let held = pool.lease().await.unwrap();

        assert_eq!(pool.fill(2).await.unwrap(), 1);
        assert_eq!(pool.live_count(), 2);
        held.release();
    }

    #[tokio::test]
    async fn test_evict_idle() {
        let (pool, factory) = pool(3, Duration::from_secs(1));
        pool.fill(2).await.unwrap();

        assert_eq!(pool.evict_idle(Duration::from_secs(60)), 0);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(pool.evict_idle(Duration::from_millis(10)), 2);

        assert_eq!(pool.idle_count(), 0);
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let (pool, factory) = pool(3, Duration::from_secs(1));
        pool.fill(2).await.unwrap();

        assert_eq!(pool.dispose(), 2);
        assert_eq!(pool.dispose(), 0);
        assert!(pool.is_disposed());
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 2);

        let outcome = pool.consume(|probe| async move { probe.id }.boxed()).await;
        assert!(matches!(outcome, Consumed::NotAcquired(PoolError::Disposed)));
    }

    #[tokio::test]
    async fn test_lease_returned_after_dispose_is_destroyed() {
        let (pool, factory) = pool(1, Duration::from_secs(1));
        let lease = pool.lease().await.unwrap();

        pool.dispose();
        lease.release();

        assert_eq!(pool.idle_count(), 0);
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dispose_wakes_waiters() {
        let (pool, _factory) = pool(1, Duration::from_secs(5));
        let pool = Arc::new(pool);
        let held = pool.lease().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.lease().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.dispose();

        assert!(matches!(waiter.await.unwrap(), Err(PoolError::Disposed)));
        held.release();
    }
}
