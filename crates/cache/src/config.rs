//! Cache configuration.
//!
//! [`CacheConfig`] is shared by [`SingleFlightCache`](crate::SingleFlightCache)
//! and [`ClusterCache`](crate::ClusterCache); the cluster-only fields are
//! ignored by the local cache.

use std::time::Duration;

use connector_cluster_transport::{ConfigError, KEY_PROVIDER_TITLE};

/// Default deployment prefix for store keys and channels.
pub const DEFAULT_PREFIX: &str = "connector";

/// Default TTL for values whose own expiry is unknown.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// Default maximum number of locally cached entries.
pub const DEFAULT_MAX_ENTRIES: u64 = 10_000;

/// Default bound on how long a caller waits for another caller's computation.
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(10);

/// Default bound on one invocation of the miss callback.
pub const DEFAULT_COMPUTE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on waiting for the cluster computation lock.
pub const DEFAULT_CLUSTER_DEADLINE: Duration = Duration::from_secs(30);

/// Default TTL of the cluster computation lock.
///
/// Outlives [`DEFAULT_COMPUTE_TIMEOUT`] so a slow computation keeps the lock.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(45);

/// Default lower bound of the randomized lock retry pause.
pub const DEFAULT_POLL_MIN: Duration = Duration::from_millis(50);

/// Default upper bound of the randomized lock retry pause.
pub const DEFAULT_POLL_MAX: Duration = Duration::from_millis(250);

/// Minimum allowed TTL-like duration.
const MIN_TTL: Duration = Duration::from_secs(1);

/// Scope of the cluster computation lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockGranularity {
    /// One lock per cache title. Unrelated items of the same cache are
    /// computed one at a time across the cluster.
    #[default]
    PerCache,
    /// One lock per cached item.
    PerItem,
}

/// Validated cache configuration.
///
/// # Examples
///
/// ```no_run
/// # use std::time::Duration;
/// # use connector_cluster_cache::{CacheConfig, LockGranularity};
/// let config = CacheConfig::builder("introspection")
///     .default_ttl(Duration::from_secs(120))
///     .lock_granularity(LockGranularity::PerItem)
///     .build()
///     .expect("valid config");
/// ```
#[derive(Debug, Clone)]
pub struct CacheConfig {
    title: String,
    prefix: String,
    default_ttl: Duration,
    max_entries: u64,
    max_wait: Duration,
    compute_timeout: Duration,
    cluster_deadline: Duration,
    lock_ttl: Duration,
    poll_min: Duration,
    poll_max: Duration,
    lock_granularity: LockGranularity,
}

impl CacheConfig {
    /// Starts a builder for a cache named `title`.
    pub fn builder(title: impl Into<String>) -> CacheConfigBuilder {
        CacheConfigBuilder {
            title: title.into(),
            prefix: DEFAULT_PREFIX.to_owned(),
            default_ttl: DEFAULT_TTL,
            max_entries: DEFAULT_MAX_ENTRIES,
            max_wait: DEFAULT_MAX_WAIT,
            compute_timeout: DEFAULT_COMPUTE_TIMEOUT,
            cluster_deadline: DEFAULT_CLUSTER_DEADLINE,
            lock_ttl: DEFAULT_LOCK_TTL,
            poll_min: DEFAULT_POLL_MIN,
            poll_max: DEFAULT_POLL_MAX,
            lock_granularity: LockGranularity::default(),
        }
    }

    /// Cache title, used in store keys and lock names.
    pub fn title(&self) -> &str {
        &self.title
    }

    /// Deployment prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// TTL used when a value carries no expiry of its own.
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Maximum number of locally cached entries.
    pub fn max_entries(&self) -> u64 {
        self.max_entries
    }

    /// How long a caller waits for an in-flight computation.
    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }

    /// Bound on one miss callback invocation.
    pub fn compute_timeout(&self) -> Duration {
        self.compute_timeout
    }

    /// Bound on the cluster lock acquisition loop.
    pub fn cluster_deadline(&self) -> Duration {
        self.cluster_deadline
    }

    /// TTL of the cluster computation lock.
    pub fn lock_ttl(&self) -> Duration {
        self.lock_ttl
    }

    /// Range of the randomized pause between lock attempts.
    pub fn poll_range(&self) -> (Duration, Duration) {
        (self.poll_min, self.poll_max)
    }

    /// Scope of the cluster computation lock.
    pub fn lock_granularity(&self) -> LockGranularity {
        self.lock_granularity
    }

    pub(crate) fn with_compute_timeout(&self, timeout: Duration) -> Self {
        Self { compute_timeout: timeout, ..self.clone() }
    }
}

/// Builder for [`CacheConfig`].
#[derive(Debug, Clone)]
pub struct CacheConfigBuilder {
    title: String,
    prefix: String,
    default_ttl: Duration,
    max_entries: u64,
    max_wait: Duration,
    compute_timeout: Duration,
    cluster_deadline: Duration,
    lock_ttl: Duration,
    poll_min: Duration,
    poll_max: Duration,
    lock_granularity: LockGranularity,
}

impl CacheConfigBuilder {
    /// Sets the deployment prefix.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Sets the fallback TTL for values without their own expiry.
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Sets the maximum number of local entries.
    pub fn max_entries(mut self, max_entries: u64) -> Self {
        self.max_entries = max_entries;
        self
    }

    /// Sets how long callers wait for an in-flight computation.
    pub fn max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Sets the bound on one miss callback invocation.
    pub fn compute_timeout(mut self, timeout: Duration) -> Self {
        self.compute_timeout = timeout;
        self
    }

    /// Sets the bound on the cluster lock acquisition loop.
    pub fn cluster_deadline(mut self, deadline: Duration) -> Self {
        self.cluster_deadline = deadline;
        self
    }

    /// Sets the TTL of the cluster computation lock.
    pub fn lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// Sets the range of the randomized pause between lock attempts.
    pub fn poll_range(mut self, min: Duration, max: Duration) -> Self {
        self.poll_min = min;
        self.poll_max = max;
        self
    }

    /// Sets the scope of the cluster computation lock.
    pub fn lock_granularity(mut self, granularity: LockGranularity) -> Self {
        self.lock_granularity = granularity;
        self
    }

    /// Builds the [`CacheConfig`], validating all fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if:
    /// - `title` or `prefix` is empty
    /// - `title` is [`KEY_PROVIDER_TITLE`], which names the key rotation lock
    /// - `max_entries` is 0
    /// - `default_ttl` or `lock_ttl` is less than 1 second
    /// - `max_wait`, `compute_timeout` or `cluster_deadline` is zero
    /// - `lock_ttl` does not exceed `compute_timeout`
    /// - the poll range is empty or inverted
    pub fn build(self) -> Result<CacheConfig, ConfigError> {
        if self.title.is_empty() {
            return Err(ConfigError::Empty { field: "title" });
        }
        if self.title == KEY_PROVIDER_TITLE {
            return Err(ConfigError::Inconsistent {
                message: format!("cache title `{KEY_PROVIDER_TITLE}` is reserved for key rotation"),
            });
        }
        if self.prefix.is_empty() {
            return Err(ConfigError::Empty { field: "prefix" });
        }
        if self.max_entries == 0 {
            return Err(ConfigError::BelowMinimum {
                field: "max_entries",
                value: self.max_entries.to_string(),
                min: "1".to_owned(),
            });
        }
        for (field, value) in [("default_ttl", self.default_ttl), ("lock_ttl", self.lock_ttl)] {
            if value < MIN_TTL {
                return Err(ConfigError::BelowMinimum {
                    field,
                    value: format!("{}ms", value.as_millis()),
                    min: "1s".to_owned(),
                });
            }
        }
        for (field, value) in [
            ("max_wait", self.max_wait),
            ("compute_timeout", self.compute_timeout),
            ("cluster_deadline", self.cluster_deadline),
        ] {
            if value.is_zero() {
                return Err(ConfigError::BelowMinimum {
                    field,
                    value: "0ms".to_owned(),
                    min: "1ms".to_owned(),
                });
            }
        }
        if self.lock_ttl <= self.compute_timeout {
            return Err(ConfigError::Inconsistent {
                message: format!(
                    "lock_ttl {}ms must exceed compute_timeout {}ms",
                    self.lock_ttl.as_millis(),
                    self.compute_timeout.as_millis()
                ),
            });
        }
        if self.poll_max.is_zero() || self.poll_min > self.poll_max {
            return Err(ConfigError::Inconsistent {
                message: format!(
                    "poll range {}ms..{}ms is empty",
                    self.poll_min.as_millis(),
                    self.poll_max.as_millis()
                ),
            });
        }
        Ok(CacheConfig {
            title: self.title,
            prefix: self.prefix,
            default_ttl: self.default_ttl,
            max_entries: self.max_entries,
            max_wait: self.max_wait,
            compute_timeout: self.compute_timeout,
            cluster_deadline: self.cluster_deadline,
            lock_ttl: self.lock_ttl,
            poll_min: self.poll_min,
            poll_max: self.poll_max,
            lock_granularity: self.lock_granularity,
        })
    }
}
