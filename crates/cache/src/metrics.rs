//! Cache activity counters.
//!
//! Counters are lock-free `AtomicU64`s updated with `Relaxed` ordering.
//! [`CacheMetrics::snapshot`] reads them one after another, so a snapshot
//! taken under load may be off by an operation or two between fields.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

/// Point-in-time copy of [`CacheMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, bon::Builder)]
pub struct CacheMetricsSnapshot {
    /// Lookups answered from the local cache.
    #[builder(default)]
    pub hits: u64,
    /// Lookups that found neither a cached value nor an in-flight computation.
    #[builder(default)]
    pub misses: u64,
    /// Lookups that joined another caller's in-flight computation.
    #[builder(default)]
    pub waits: u64,
    /// Joined lookups that gave up after the maximum wait.
    #[builder(default)]
    pub wait_timeouts: u64,
    /// Miss callback invocations that produced a value.
    #[builder(default)]
    pub computations: u64,
    /// Miss callback invocations that failed or timed out.
    #[builder(default)]
    pub compute_failures: u64,
    /// Computations whose result was discarded because the lock was lost.
    #[builder(default)]
    pub lost_locks: u64,
    /// Values adopted from the shared store.
    #[builder(default)]
    pub cluster_hits: u64,
    /// Values adopted from another process's broadcast.
    #[builder(default)]
    pub broadcast_hits: u64,
    /// Cluster lookups that gave up before acquiring the computation lock.
    #[builder(default)]
    pub cluster_deadlines: u64,
}

impl CacheMetricsSnapshot {
    /// Fraction of lookups answered locally, in `[0, 1]`.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses + self.waits;
        if total == 0 { 0.0 } else { self.hits as f64 / total as f64 }
    }
}

#[derive(Debug, Default)]
struct MetricsInner {
    hits: AtomicU64,
    misses: AtomicU64,
    waits: AtomicU64,
    wait_timeouts: AtomicU64,
    computations: AtomicU64,
    compute_failures: AtomicU64,
    lost_locks: AtomicU64,
    cluster_hits: AtomicU64,
    broadcast_hits: AtomicU64,
    cluster_deadlines: AtomicU64,
}

/// Shared cache counters. Cloning shares the underlying counters.
#[derive(Debug, Clone, Default)]
pub struct CacheMetrics {
    inner: Arc<MetricsInner>,
}

macro_rules! counter {
    ($(#[$doc:meta])* $name:ident => $field:ident) => {
        $(#[$doc])*
        pub fn $name(&self) {
            self.inner.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl CacheMetrics {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    counter!(
        /// Records a local hit.
        record_hit => hits
    );
    counter!(
        /// Records a miss that started a computation.
        record_miss => misses
    );
    counter!(
        /// Records a caller joining an in-flight computation.
        record_wait => waits
    );
    counter!(
        /// Records a joined caller giving up.
        record_wait_timeout => wait_timeouts
    );
    counter!(
        /// Records a successful computation.
        record_computation => computations
    );
    counter!(
        /// Records a failed or timed-out computation.
        record_compute_failure => compute_failures
    );
    counter!(
        /// Records a computation discarded after its lock was lost.
        record_lost_lock => lost_locks
    );
    counter!(
        /// Records a value read from the shared store.
        record_cluster_hit => cluster_hits
    );
    counter!(
        /// Records a value received by broadcast.
        record_broadcast_hit => broadcast_hits
    );
    counter!(
        /// Records a cluster lookup that hit its deadline.
        record_cluster_deadline => cluster_deadlines
    );

    /// Copies the current counter values.
    #[must_use]
    pub fn snapshot(&self) -> CacheMetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        CacheMetricsSnapshot {
            hits: load(&self.inner.hits),
            misses: load(&self.inner.misses),
            waits: load(&self.inner.waits),
            wait_timeouts: load(&self.inner.wait_timeouts),
            computations: load(&self.inner.computations),
            compute_failures: load(&self.inner.compute_failures),
            lost_locks: load(&self.inner.lost_locks),
            cluster_hits: load(&self.inner.cluster_hits),
            broadcast_hits: load(&self.inner.broadcast_hits),
            cluster_deadlines: load(&self.inner.cluster_deadlines),
        }
    }
}
