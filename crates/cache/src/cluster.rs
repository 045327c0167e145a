//! Cluster-wide deduplicating cache.
//!
//! [`ClusterCache`] layers a [`SingleFlightCache`] over a shared store so
//! that, for a given key, one process in the cluster computes and everyone
//! else reuses the result.
//!
//! # Miss protocol
//!
//! 1. Subscribe to the item's channel (named after its store key).
//! 2. Read the store; a present value is returned as is.
//! 3. Until the cluster deadline, try the computation lock. Between
//!    attempts, wait a random 50–250 ms pause for a broadcast of the value
//!    and re-read the store.
//! 4. With the lock held, compute, store the value guarded by the lock and
//!    broadcast it on the item's channel.
//! 5. Always unsubscribe and, if held, release the lock. This also happens
//!    when the caller's future is dropped mid-protocol: the cleanup is then
//!    spawned on the runtime.
//!
//! A process that loses its lock while computing (TTL expiry or forced
//! pre-emption) keeps its result locally but neither stores nor broadcasts it.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::TimeDelta;
use connector_cluster_transport::{
    ClusterTransport, LockGuard, Namespace, SharedClock, Subscription, TransportExt, TransportResult,
    decode_payload, system_clock,
};
use rand::Rng;
use serde::{Serialize, de::DeserializeOwned};
use tokio::{
    runtime::Handle,
    time::{Instant, sleep, timeout},
};

use crate::{
    config::{CacheConfig, LockGranularity},
    handler::{Computed, MissError, MissHandler, MissResult},
    metrics::{CacheMetrics, CacheMetricsSnapshot},
    single_flight::SingleFlightCache,
};

/// Extra time the local layer allows on top of the cluster protocol's own
/// bounds before abandoning a miss.
const LOCAL_TIMEOUT_SLACK: Duration = Duration::from_secs(5);

/// A cache whose misses are computed once across the whole cluster.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use connector_cluster_cache::{CacheConfig, ClusterCache, Computed, MissResult, miss_fn};
/// use connector_cluster_transport::MemoryCluster;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let cluster = MemoryCluster::new();
/// let cache = ClusterCache::new(
///     CacheConfig::builder("refresh").build()?,
///     Arc::new(cluster.connect()),
///     miss_fn(|_key: String, refresh_token: String| async move {
///         let tokens: MissResult<String> = Ok(Some(Computed::new(format!("exchanged:{refresh_token}"))));
///         tokens
///     }),
/// );
/// let tokens = cache.get("session-1", "rt-abc".to_owned()).await;
/// # let _ = tokens;
/// # Ok(())
/// # }
/// ```
pub struct ClusterCache<T, A = ()>
where
    T: Clone + Send + Sync + 'static,
{
    local: SingleFlightCache<T, A>,
    transport: Arc<dyn ClusterTransport>,
    namespace: Namespace,
    config: CacheConfig,
}

impl<T, A> ClusterCache<T, A>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    A: Send + 'static,
{
    /// Creates a cluster cache over `transport`, computing misses with
    /// `handler`.
    pub fn new(
        config: CacheConfig,
        transport: Arc<dyn ClusterTransport>,
        handler: impl MissHandler<T, A> + 'static,
    ) -> Self {
        Self::with_clock(config, transport, handler, system_clock())
    }

    /// Like [`ClusterCache::new`] with an explicit clock.
    pub fn with_clock(
        config: CacheConfig,
        transport: Arc<dyn ClusterTransport>,
        handler: impl MissHandler<T, A> + 'static,
        clock: SharedClock,
    ) -> Self {
        let namespace = Namespace::new(config.prefix());
        let metrics = CacheMetrics::new();
        let miss = ClusterMiss {
            transport: Arc::clone(&transport),
            namespace: namespace.clone(),
            config: config.clone(),
            inner: Arc::new(handler),
            metrics: metrics.clone(),
            clock: Arc::clone(&clock),
        };
        let local_timeout = config.cluster_deadline() + config.compute_timeout() + LOCAL_TIMEOUT_SLACK;
        let local = SingleFlightCache::from_parts(
            config.with_compute_timeout(local_timeout),
            Arc::new(miss),
            metrics,
            clock,
        );
        Self { local, transport, namespace, config }
    }

    /// Returns the value for `key`, computing it on miss at most once across
    /// the cluster.
    ///
    /// Returns `None` if no value could be obtained within the configured
    /// bounds; errors are logged, never returned.
    pub async fn get(&self, key: &str, args: A) -> Option<T> {
        self.local.get(key, args).await
    }

    /// Removes `key` from the shared store and from this process's cache.
    ///
    /// The computation lock is taken by force so an in-progress computation
    /// elsewhere cannot store its result afterwards. Returns whether a stored
    /// value was removed.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the lock or removal failed. The local
    /// entry is dropped and the lock released regardless.
    #[tracing::instrument(skip(self), fields(cache = %self.config.title()))]
    pub async fn invalidate_cache(&self, key: &str) -> TransportResult<bool> {
        let item_key = self.namespace.cache_item(self.config.title(), key);
        let lock_key = lock_key(&self.namespace, &self.config, key);

        let forced = LockGuard::force(Arc::clone(&self.transport), lock_key.as_str(), self.config.lock_ttl()).await;
        let result = match forced {
            Ok(guard) => {
                let removed = self.transport.remove(&item_key, Some(&lock_key)).await;
                if let Err(error) = guard.release().await {
                    tracing::warn!(lock_key = %lock_key, error = %error, "Failed to release lock after invalidation");
                }
                removed
            },
            Err(error) => Err(error),
        };
        self.local.invalidate(key).await;

        if let Ok(removed) = &result {
            tracing::info!(item_key = %item_key, removed, "Cluster cache entry invalidated");
        }
        result
    }

    /// Returns the locally cached value for `key` without computing on miss.
    pub async fn peek(&self, key: &str) -> Option<T> {
        self.local.peek(key).await
    }

    /// Snapshot of this cache's counters, including cluster activity.
    pub fn metrics(&self) -> CacheMetricsSnapshot {
        self.local.metrics()
    }

    /// The cache configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }
}

impl<T, A> std::fmt::Debug for ClusterCache<T, A>
where
    T: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterCache")
            .field("title", &self.config.title())
            .field("sender_id", &self.transport.sender_id())
            .field("local", &self.local)
            .finish_non_exhaustive()
    }
}

fn lock_key(namespace: &Namespace, config: &CacheConfig, key: &str) -> String {
    match config.lock_granularity() {
        LockGranularity::PerCache => namespace.cache_lock(config.title()),
        LockGranularity::PerItem => namespace.cache_item_lock(config.title(), key),
    }
}

/// Resources one cluster miss holds: the item subscription and, once won,
/// the computation lock.
///
/// [`close`](Self::close) releases both. Dropping an unclosed scope spawns
/// the unsubscribe, and the [`LockGuard`] spawns its own unlock.
struct MissScope {
    transport: Arc<dyn ClusterTransport>,
    subscription: Option<Subscription>,
    lock: Option<LockGuard>,
}

impl MissScope {
    async fn close(&mut self) {
        if let Some(subscription) = self.subscription.take()
            && let Err(error) = self.transport.unsubscribe(subscription).await
        {
            tracing::warn!(error = %error, "Failed to unsubscribe from cache channel");
        }
        if let Some(lock) = self.lock.take() {
            let lock_key = lock.key().to_owned();
            match lock.release().await {
                Ok(true) => {},
                Ok(false) => tracing::debug!(lock_key = %lock_key, "Computation lock already expired or taken over"),
                Err(error) => tracing::warn!(lock_key = %lock_key, error = %error, "Failed to release computation lock"),
            }
        }
    }
}

impl Drop for MissScope {
    fn drop(&mut self) {
        let Some(subscription) = self.subscription.take() else {
            return;
        };
        if let Ok(handle) = Handle::try_current() {
            let transport = Arc::clone(&self.transport);
            handle.spawn(async move {
                if let Err(error) = transport.unsubscribe(subscription).await {
                    tracing::debug!(error = %error, "Failed to unsubscribe abandoned cache channel");
                }
            });
        }
    }
}

/// Miss handler running the cluster protocol around the user's handler.
struct ClusterMiss<T, A> {
    transport: Arc<dyn ClusterTransport>,
    namespace: Namespace,
    config: CacheConfig,
    inner: Arc<dyn MissHandler<T, A>>,
    metrics: CacheMetrics,
    clock: SharedClock,
}

impl<T, A> ClusterMiss<T, A>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    A: Send + 'static,
{
    async fn resolve(
        &self,
        key: &str,
        item_key: &str,
        lock_key: &str,
        scope: &mut MissScope,
        args: A,
    ) -> MissResult<T> {
        if let Some(value) = self.read_store(item_key).await {
            self.metrics.record_cluster_hit();
            return Ok(Some(value));
        }

        let deadline = Instant::now() + self.config.cluster_deadline();
        loop {
            match LockGuard::acquire(Arc::clone(&self.transport), lock_key, self.config.lock_ttl()).await {
                Ok(Some(guard)) => {
                    scope.lock = Some(guard);
                    break;
                },
                Ok(None) => {},
                Err(error) => {
                    tracing::warn!(lock_key, error = %error, "Failed to attempt computation lock");
                },
            }

            let now = Instant::now();
            if now >= deadline {
                self.metrics.record_cluster_deadline();
                tracing::debug!(
                    item_key,
                    deadline_ms = self.config.cluster_deadline().as_millis() as u64,
                    "Gave up waiting for computation lock"
                );
                return Ok(None);
            }

            let pause = self.poll_pause().min(deadline - now);
            if let Some(value) = self.await_broadcast(&mut scope.subscription, pause).await {
                self.metrics.record_broadcast_hit();
                return Ok(Some(value));
            }
            if let Some(value) = self.read_store(item_key).await {
                self.metrics.record_cluster_hit();
                return Ok(Some(value));
            }
        }

        // The previous lock holder may have stored just before releasing.
        if let Some(value) = self.read_store(item_key).await {
            self.metrics.record_cluster_hit();
            return Ok(Some(value));
        }

        let computed = match timeout(self.config.compute_timeout(), self.inner.on_miss(key, args)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(MissError::from(format!(
                    "computation exceeded {}ms",
                    self.config.compute_timeout().as_millis()
                )));
            },
        };
        let Some(computed) = computed else {
            return Ok(None);
        };

        let now = self.clock.now();
        let Some(ttl) = computed.ttl(now, self.config.default_ttl()) else {
            tracing::debug!(item_key, "Computed value already expired; not shared");
            return Ok(Some(computed));
        };
        // Pin the expiry so every process caches the value for the same span.
        let expires_at = computed
            .expires_at
            .or_else(|| TimeDelta::from_std(ttl).ok().and_then(|ttl| now.checked_add_signed(ttl)));
        let computed = Computed { data: computed.data, expires_at };

        fail::fail_point!("cluster-cache-before-store", |_| Ok(Some(computed.clone())));

        match self.transport.store_json(item_key, &computed, Some(ttl), Some(lock_key)).await {
            Ok(true) => {
                if let Err(error) = self.transport.publish_json(item_key, &computed).await {
                    tracing::warn!(item_key, error = %error, "Failed to broadcast computed value");
                }
            },
            Ok(false) => {
                self.metrics.record_lost_lock();
                tracing::warn!(item_key, lock_key, "Computation lock lost before store; result not shared");
            },
            Err(error) => {
                tracing::warn!(item_key, error = %error, "Failed to store computed value");
            },
        }
        Ok(Some(computed))
    }

    async fn read_store(&self, item_key: &str) -> Option<Computed<T>> {
        match self.transport.get_json::<Computed<T>>(item_key).await {
            Ok(value) => value.filter(|value| self.is_live(value)),
            Err(error) => {
                tracing::warn!(item_key, error = %error, "Failed to read cluster cache entry");
                None
            },
        }
    }

    /// Waits up to `pause` for a broadcast of the value. A closed
    /// subscription is dropped and later pauses become plain sleeps.
    async fn await_broadcast(
        &self,
        subscription: &mut Option<Subscription>,
        pause: Duration,
    ) -> Option<Computed<T>> {
        let Some(active) = subscription.as_mut() else {
            sleep(pause).await;
            return None;
        };

        let received = tokio::select! {
            message = active.recv() => Some(message),
            () = sleep(pause) => None,
        };
        match received {
            None => None,
            Some(None) => {
                tracing::debug!("Cache channel closed; polling the store instead");
                *subscription = None;
                None
            },
            Some(Some(envelope)) => match decode_payload::<Computed<T>>(&envelope) {
                Ok(value) if self.is_live(&value) => Some(value),
                Ok(_) => None,
                Err(error) => {
                    tracing::warn!(sender_id = %envelope.sender_id, error = %error, "Ignoring malformed cache broadcast");
                    None
                },
            },
        }
    }

    fn is_live(&self, value: &Computed<T>) -> bool {
        value.ttl(self.clock.now(), self.config.default_ttl()).is_some()
    }

    fn poll_pause(&self) -> Duration {
        let (min, max) = self.config.poll_range();
        rand::rng().random_range(min..=max)
    }
}

#[async_trait]
impl<T, A> MissHandler<T, A> for ClusterMiss<T, A>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    A: Send + 'static,
{
    async fn on_miss(&self, key: &str, args: A) -> MissResult<T> {
        let item_key = self.namespace.cache_item(self.config.title(), key);
        let lock_key = lock_key(&self.namespace, &self.config, key);

        let subscription = match self.transport.subscribe(&item_key, true).await {
            Ok(subscription) => Some(subscription),
            Err(error) => {
                tracing::warn!(item_key, error = %error, "Failed to subscribe to cache channel; polling only");
                None
            },
        };
        let mut scope = MissScope { transport: Arc::clone(&self.transport), subscription, lock: None };

        let result = self.resolve(key, &item_key, &lock_key, &mut scope, args).await;
        scope.close().await;
        result
    }
}
