//! Process-local cache with single-flight computation.
//!
//! For any key, at most one miss callback runs at a time inside the process.
//! Callers arriving while it runs wait for its outcome (bounded by
//! [`CacheConfig::max_wait`]) instead of starting their own computation.
//!
//! # Lock identity
//!
//! Each computation takes an in-flight lock tagged with a fresh id. When the
//! computation finishes it only stores and resolves if the lock still carries
//! its id; [`SingleFlightCache::invalidate`] drops the lock, so a computation
//! that raced an invalidation never repopulates the cache.

use std::{collections::HashMap, sync::Arc, time::Duration};

use connector_cluster_transport::{SharedClock, system_clock};
use moka::{Expiry, future::Cache};
use parking_lot::Mutex;
use tokio::{sync::watch, time::timeout};
use uuid::Uuid;

use crate::{
    config::CacheConfig,
    handler::MissHandler,
    metrics::{CacheMetrics, CacheMetricsSnapshot},
};

/// A cached value with the TTL it was stored for.
#[derive(Debug, Clone)]
struct CacheEntry<T> {
    data: T,
    ttl: Duration,
}

/// Per-entry expiry: every write sets the entry's own TTL.
struct EntryExpiry;

impl<T> Expiry<String, CacheEntry<T>> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CacheEntry<T>,
        _created_at: std::time::Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CacheEntry<T>,
        _updated_at: std::time::Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Outcome published to waiters.
#[derive(Debug, Clone)]
enum Resolution<T> {
    Pending,
    Done(Option<T>),
}

impl<T: Clone> Resolution<T> {
    fn is_done(&self) -> bool {
        matches!(self, Self::Done(_))
    }

    fn value(&self) -> Option<T> {
        match self {
            Self::Pending => None,
            Self::Done(value) => value.clone(),
        }
    }
}

/// An in-flight computation.
#[derive(Debug)]
struct InFlight<T> {
    lock_id: Uuid,
    done: watch::Sender<Resolution<T>>,
}

type InFlightMap<T> = Mutex<HashMap<String, InFlight<T>>>;

enum Role<T> {
    Owner(Uuid),
    Waiter(watch::Receiver<Resolution<T>>),
}

/// Releases an in-flight lock when the owning computation ends, including
/// when the owner's future is dropped. Waiters of an abandoned lock observe
/// the dropped sender and return `None`.
struct FlightGuard<'a, T> {
    in_flight: &'a InFlightMap<T>,
    key: &'a str,
    lock_id: Uuid,
    released: bool,
}

impl<T> FlightGuard<'_, T> {
    fn is_held(&self) -> bool {
        self.in_flight.lock().get(self.key).is_some_and(|flight| flight.lock_id == self.lock_id)
    }

    fn release(&mut self) -> Option<InFlight<T>> {
        self.released = true;
        let mut in_flight = self.in_flight.lock();
        match in_flight.get(self.key) {
            Some(flight) if flight.lock_id == self.lock_id => in_flight.remove(self.key),
            _ => None,
        }
    }

    /// Publishes `value` to waiters. Returns `false` if the lock was lost.
    fn resolve(mut self, value: Option<T>) -> bool {
        match self.release() {
            Some(flight) => {
                flight.done.send_replace(Resolution::Done(value));
                true
            },
            None => false,
        }
    }
}

impl<T> Drop for FlightGuard<'_, T> {
    fn drop(&mut self) {
        if !self.released {
            self.release();
        }
    }
}

/// A process-local cache that runs at most one miss computation per key.
///
/// `T` is the cached value; `A` carries per-call arguments for the miss
/// handler.
///
/// # Examples
///
/// ```no_run
/// use connector_cluster_cache::{CacheConfig, Computed, MissResult, SingleFlightCache, miss_fn};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let cache = SingleFlightCache::new(
///     CacheConfig::builder("introspection").build()?,
///     miss_fn(|token: String, _: ()| async move {
///         let result: MissResult<bool> = Ok(Some(Computed::new(!token.is_empty())));
///         result
///     }),
/// );
/// let active = cache.get("opaque-token", ()).await;
/// # let _ = active;
/// # Ok(())
/// # }
/// ```
pub struct SingleFlightCache<T, A = ()>
where
    T: Clone + Send + Sync + 'static,
{
    config: CacheConfig,
    entries: Cache<String, CacheEntry<T>>,
    in_flight: InFlightMap<T>,
    handler: Arc<dyn MissHandler<T, A>>,
    metrics: CacheMetrics,
    clock: SharedClock,
}

impl<T, A> SingleFlightCache<T, A>
where
    T: Clone + Send + Sync + 'static,
    A: Send + 'static,
{
    /// Creates a cache computing misses with `handler`.
    pub fn new(config: CacheConfig, handler: impl MissHandler<T, A> + 'static) -> Self {
        Self::from_parts(config, Arc::new(handler), CacheMetrics::new(), system_clock())
    }

    /// Replaces the clock used to turn value expiry instants into TTLs.
    #[must_use]
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub(crate) fn from_parts(
        config: CacheConfig,
        handler: Arc<dyn MissHandler<T, A>>,
        metrics: CacheMetrics,
        clock: SharedClock,
    ) -> Self {
        let entries = Cache::builder()
            .max_capacity(config.max_entries())
            .expire_after(EntryExpiry)
            .build();
        Self { config, entries, in_flight: Mutex::new(HashMap::new()), handler, metrics, clock }
    }

    /// Returns the value for `key`, computing it on miss.
    ///
    /// Returns `None` when the computation fails, times out, yields no value,
    /// or when this caller waited longer than the configured maximum for
    /// another caller's computation.
    #[tracing::instrument(skip(self, args), fields(cache = %self.config.title()))]
    pub async fn get(&self, key: &str, args: A) -> Option<T> {
        if let Some(entry) = self.entries.get(key).await {
            self.metrics.record_hit();
            return Some(entry.data);
        }

        let role = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.get(key) {
                Some(flight) => Role::Waiter(flight.done.subscribe()),
                None => {
                    let lock_id = Uuid::new_v4();
                    let (done, _) = watch::channel(Resolution::Pending);
                    in_flight.insert(key.to_owned(), InFlight { lock_id, done });
                    Role::Owner(lock_id)
                },
            }
        };

        match role {
            Role::Waiter(rx) => {
                self.metrics.record_wait();
                self.wait(key, rx).await
            },
            Role::Owner(lock_id) => {
                self.metrics.record_miss();
                self.compute(key, lock_id, args).await
            },
        }
    }

    /// Returns the cached value for `key` without computing on miss.
    pub async fn peek(&self, key: &str) -> Option<T> {
        self.entries.get(key).await.map(|entry| entry.data)
    }

    /// Drops the cached value and any in-flight computation for `key`.
    ///
    /// Callers waiting on the dropped computation return `None`; its result
    /// is returned to its own caller but not cached.
    pub async fn invalidate(&self, key: &str) {
        let abandoned = self.in_flight.lock().remove(key);
        if abandoned.is_some() {
            tracing::debug!(key, "Dropped in-flight computation");
        }
        self.entries.invalidate(key).await;
    }

    /// Number of cached entries. Eventually consistent.
    pub fn entry_count(&self) -> u64 {
        self.entries.entry_count()
    }

    /// Snapshot of this cache's counters.
    pub fn metrics(&self) -> CacheMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// The cache configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    async fn wait(&self, key: &str, mut rx: watch::Receiver<Resolution<T>>) -> Option<T> {
        match timeout(self.config.max_wait(), rx.wait_for(Resolution::is_done)).await {
            Ok(Ok(resolution)) => resolution.value(),
            Ok(Err(_)) => {
                tracing::debug!(key, "In-flight computation abandoned");
                None
            },
            Err(_) => {
                self.metrics.record_wait_timeout();
                tracing::debug!(
                    key,
                    max_wait_ms = self.config.max_wait().as_millis() as u64,
                    "Gave up waiting for in-flight computation"
                );
                None
            },
        }
    }

    async fn compute(&self, key: &str, lock_id: Uuid, args: A) -> Option<T> {
        let guard = FlightGuard { in_flight: &self.in_flight, key, lock_id, released: false };

        // A previous owner may have stored between our miss and our lock.
        if let Some(entry) = self.entries.get(key).await {
            guard.resolve(Some(entry.data.clone()));
            return Some(entry.data);
        }

        let computed = match timeout(self.config.compute_timeout(), self.handler.on_miss(key, args)).await
        {
            Ok(Ok(computed)) => computed,
            Ok(Err(error)) => {
                self.metrics.record_compute_failure();
                tracing::warn!(key, error = %error, "Cache miss handler failed");
                None
            },
            Err(_) => {
                self.metrics.record_compute_failure();
                tracing::warn!(
                    key,
                    timeout_ms = self.config.compute_timeout().as_millis() as u64,
                    "Cache miss handler timed out"
                );
                None
            },
        };

        let Some(computed) = computed else {
            guard.resolve(None);
            return None;
        };
        self.metrics.record_computation();
        let ttl = computed.ttl(self.clock.now(), self.config.default_ttl());
        let data = computed.data;

        if !guard.is_held() {
            self.metrics.record_lost_lock();
            tracing::debug!(key, "In-flight lock lost; result not cached");
            return Some(data);
        }

        if let Some(ttl) = ttl {
            self.entries.insert(key.to_owned(), CacheEntry { data: data.clone(), ttl }).await;
        }

        if !guard.resolve(Some(data.clone())) {
            // Invalidated while the entry was being written.
            self.entries.invalidate(key).await;
            self.metrics.record_lost_lock();
        }
        Some(data)
    }
}

impl<T, A> std::fmt::Debug for SingleFlightCache<T, A>
where
    T: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleFlightCache")
            .field("title", &self.config.title())
            .field("entries", &self.entries.entry_count())
            .field("in_flight", &self.in_flight.lock().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::TimeDelta;
    use connector_cluster_transport::{Clock, testutil::TokioClock};
    use tokio::{task::JoinSet, time::sleep};

    use super::*;
    use crate::handler::{Computed, MissError, MissResult, miss_fn};

    fn config() -> CacheConfig {
        CacheConfig::builder("test")
            .max_wait(Duration::from_secs(5))
            .compute_timeout(Duration::from_secs(2))
            .build()
            .unwrap()
    }

    /// Handler that counts invocations and sleeps `delay` before answering.
    fn counting(
        calls: Arc<AtomicUsize>,
        delay: Duration,
    ) -> impl MissHandler<String, ()> + 'static {
        miss_fn(move |key: String, (): ()| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                sleep(delay).await;
                Ok(Some(Computed::new(format!("value-{key}"))))
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_computation() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache =
            Arc::new(SingleFlightCache::new(config(), counting(Arc::clone(&calls), Duration::from_millis(100))));

        let mut set = JoinSet::new();
        for _ in 0..20 {
            let cache = Arc::clone(&cache);
            set.spawn(async move { cache.get("k", ()).await });
        }
        while let Some(result) = set.join_next().await {
            assert_eq!(result.unwrap().as_deref(), Some("value-k"));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let metrics = cache.metrics();
        assert_eq!(metrics.computations, 1);
        assert_eq!(metrics.misses + metrics.waits + metrics.hits, 20);
    }

    #[tokio::test]
    async fn test_hit_after_computation() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = SingleFlightCache::new(config(), counting(Arc::clone(&calls), Duration::ZERO));

        assert_eq!(cache.get("k", ()).await.as_deref(), Some("value-k"));
        assert_eq!(cache.get("k", ()).await.as_deref(), Some("value-k"));
        assert_eq!(cache.peek("k").await.as_deref(), Some("value-k"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.metrics().hits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_resolves_everyone_to_none() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let cache = Arc::new(SingleFlightCache::new(
            config(),
            miss_fn(move |_key: String, (): ()| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    sleep(Duration::from_millis(50)).await;
                    let result: MissResult<String> = Err(MissError::from("upstream unavailable"));
                    result
                }
            }),
        ));

        let mut set = JoinSet::new();
        for _ in 0..5 {
            let cache = Arc::clone(&cache);
            set.spawn(async move { cache.get("k", ()).await });
        }
        while let Some(result) = set.join_next().await {
            assert_eq!(result.unwrap(), None);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.metrics().compute_failures, 1);

        // Failures are not cached.
        assert_eq!(cache.get("k", ()).await, None);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_compute_timeout_yields_none() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = SingleFlightCache::new(config(), counting(Arc::clone(&calls), Duration::from_secs(10)));

        assert_eq!(cache.get("k", ()).await, None);
        assert_eq!(cache.metrics().compute_failures, 1);
        assert_eq!(cache.entry_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_gives_up_after_max_wait() {
        let config = CacheConfig::builder("test")
            .max_wait(Duration::from_millis(100))
            .compute_timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let cache =
            Arc::new(SingleFlightCache::new(config, counting(Arc::clone(&calls), Duration::from_secs(1))));

        let owner = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.get("k", ()).await })
        };
        sleep(Duration::from_millis(10)).await;

        assert_eq!(cache.get("k", ()).await, None);
        assert_eq!(cache.metrics().wait_timeouts, 1);
        assert_eq!(owner.await.unwrap().as_deref(), Some("value-k"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_during_computation_discards_result() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache =
            Arc::new(SingleFlightCache::new(config(), counting(Arc::clone(&calls), Duration::from_millis(200))));

        let owner = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.get("k", ()).await })
        };
        sleep(Duration::from_millis(10)).await;
        let waiter = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.get("k", ()).await })
        };
        sleep(Duration::from_millis(10)).await;

        cache.invalidate("k").await;

        assert_eq!(waiter.await.unwrap(), None, "waiter of an abandoned computation gets nothing");
        assert_eq!(owner.await.unwrap().as_deref(), Some("value-k"));
        assert_eq!(cache.peek("k").await, None);
        assert_eq!(cache.metrics().lost_locks, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_owner_releases_lock() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = SingleFlightCache::new(config(), counting(Arc::clone(&calls), Duration::from_millis(500)));

        let abandoned = timeout(Duration::from_millis(50), cache.get("k", ())).await;
        assert!(abandoned.is_err());

        assert_eq!(cache.get("k", ()).await.as_deref(), Some("value-k"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_expired_value_is_returned_but_not_cached() {
        let clock = TokioClock::fixed();
        let now = clock.now();
        let cache = SingleFlightCache::new(
            config(),
            miss_fn(move |_key: String, (): ()| async move {
                Ok(Some(Computed::expiring(7u32, now - TimeDelta::seconds(1))))
            }),
        )
        .with_clock(clock.shared());

        assert_eq!(cache.get("k", ()).await, Some(7));
        assert_eq!(cache.peek("k").await, None);
    }

    #[tokio::test]
    async fn test_entry_expires_after_own_ttl() {
        let clock = TokioClock::fixed();
        let now = clock.now();
        let cache = SingleFlightCache::new(
            config(),
            miss_fn(move |_key: String, (): ()| async move {
                Ok(Some(Computed::expiring(1u8, now + TimeDelta::milliseconds(1_200))))
            }),
        )
        .with_clock(clock.shared());

        assert_eq!(cache.get("k", ()).await, Some(1));
        assert_eq!(cache.peek("k").await, Some(1));
        sleep(Duration::from_millis(1_500)).await;
        assert_eq!(cache.peek("k").await, None);
    }
}
