//! Miss callback contract.
//!
//! A [`MissHandler`] computes the value for a key the cache does not hold.
//! It may fail or return `Ok(None)`; either way the cache reports "no value"
//! to every caller waiting on that computation, never an error.

use std::{future::Future, marker::PhantomData, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Error type returned by miss handlers.
pub type MissError = Box<dyn std::error::Error + Send + Sync>;

/// Result type returned by miss handlers.
pub type MissResult<T> = Result<Option<Computed<T>>, MissError>;

/// A freshly computed value and, when known, the instant it stops being valid
/// (for example a token's `exp`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Computed<T> {
    /// The value.
    pub data: T,
    /// When the value expires on its own.
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl<T> Computed<T> {
    /// A value with no intrinsic expiry; the cache default TTL applies.
    pub fn new(data: T) -> Self {
        Self { data, expires_at: None }
    }

    /// A value that expires at `expires_at`.
    pub fn expiring(data: T, expires_at: DateTime<Utc>) -> Self {
        Self { data, expires_at: Some(expires_at) }
    }

    /// TTL to cache this value for, measured from `now`.
    ///
    /// Uses the value's own expiry when known and `default` otherwise.
    /// Returns `None` when the value has already expired and must not be
    /// cached.
    #[must_use]
    pub fn ttl(&self, now: DateTime<Utc>, default: Duration) -> Option<Duration> {
        match self.expires_at {
            None => Some(default),
            Some(at) => (at - now).to_std().ok().filter(|ttl| !ttl.is_zero()),
        }
    }
}

/// Computes values on cache miss.
///
/// `A` carries whatever per-call arguments the computation needs (for
/// example the refresh token to exchange); it is only consumed by the caller
/// that ends up computing.
#[async_trait]
pub trait MissHandler<T, A>: Send + Sync {
    /// Computes the value for `key`.
    async fn on_miss(&self, key: &str, args: A) -> MissResult<T>;
}

/// Adapts an async closure into a [`MissHandler`].
///
/// # Examples
///
/// ```
/// use connector_cluster_cache::{Computed, MissResult, miss_fn};
///
/// let handler = miss_fn(|key: String, factor: u32| async move {
///     let value: MissResult<usize> = Ok(Some(Computed::new(key.len() * factor as usize)));
///     value
/// });
/// # let _ = handler;
/// ```
pub fn miss_fn<T, A, F, Fut>(f: F) -> FnMissHandler<F, T, A>
where
    F: Fn(String, A) -> Fut + Send + Sync,
    Fut: Future<Output = MissResult<T>> + Send,
{
    FnMissHandler { f, _marker: PhantomData }
}

/// [`MissHandler`] backed by a closure. Created by [`miss_fn`].
pub struct FnMissHandler<F, T, A> {
    f: F,
    _marker: PhantomData<fn(A) -> T>,
}

#[async_trait]
impl<T, A, F, Fut> MissHandler<T, A> for FnMissHandler<F, T, A>
where
    T: Send + 'static,
    A: Send + 'static,
    F: Fn(String, A) -> Fut + Send + Sync,
    Fut: Future<Output = MissResult<T>> + Send,
{
    async fn on_miss(&self, key: &str, args: A) -> MissResult<T> {
        (self.f)(key.to_owned(), args).await
    }
}
