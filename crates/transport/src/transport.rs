//! Cluster transport trait definition.
//!
//! [`ClusterTransport`] wraps a shared key/value store and a pub/sub bus into
//! the three primitives the coordination layer is built from:
//!
//! - **Advisory locking**: [`lock`](ClusterTransport::lock) /
//!   [`unlock`](ClusterTransport::unlock) on a TTL-bounded record whose value
//!   names the owner.
//! - **Raw records**: [`get`](ClusterTransport::get),
//!   [`store`](ClusterTransport::store), [`remove`](ClusterTransport::remove),
//!   optionally guarded by a lock the caller must still own.
//! - **Broadcast**: [`publish`](ClusterTransport::publish) /
//!   [`subscribe`](ClusterTransport::subscribe), wrapped in an [`Envelope`].
//!
//! # Locks are advisory
//!
//! A lock is a hint, not a correctness-grade mutex. There is no fencing
//! token: a holder paused past its TTL can race a new holder. Protocols built
//! on this trait must tolerate double execution, and the only writes that
//! make state authoritative go through the guarded [`store`] whose ownership
//! check and mutation happen in one atomic step at the backend.
//!
//! [`store`]: ClusterTransport::store

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::broadcast;

use crate::{
    envelope::{Envelope, Subscription},
    error::{TransportError, TransportResult},
    lifecycle::ConnectionEvent,
};

/// Shared store and message bus used by every connector process.
///
/// Implementations are cheap handles (`Send + Sync`) representing one
/// process's connection to the cluster. The handle's
/// [`sender_id`](Self::sender_id) doubles as its lock owner token.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use connector_cluster_transport::{ClusterTransport, MemoryCluster};
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let cluster = MemoryCluster::new();
/// let a = cluster.connect();
/// let b = cluster.connect();
///
/// assert!(a.lock("job", Duration::from_secs(30), false).await.unwrap());
/// assert!(!b.lock("job", Duration::from_secs(30), false).await.unwrap());
///
/// // Only the owner may write under the guard.
/// assert!(a.store("result", b"42".to_vec(), None, Some("job")).await.unwrap());
/// assert!(!b.store("result", b"43".to_vec(), None, Some("job")).await.unwrap());
/// # });
/// ```
#[async_trait]
pub trait ClusterTransport: Send + Sync {
    /// Identity stamped on published envelopes and written into lock records.
    fn sender_id(&self) -> &str;

    /// Acquires the advisory lock `key` for `ttl`.
    ///
    /// Succeeds when no live record exists, or unconditionally when `force`
    /// is set (overwriting the current owner). Returns `Ok(false)` when the
    /// lock is held by someone else.
    ///
    /// The record names [`sender_id`](Self::sender_id), which is shared by
    /// every caller in this process. A lock taken by one task is released by
    /// an owner-checked [`unlock`](Self::unlock) from any other task of the
    /// same process.
    #[must_use = "lock acquisition may fail and the outcome must be inspected"]
    async fn lock(&self, key: &str, ttl: Duration, force: bool) -> TransportResult<bool>;

    /// Releases the lock `key` if its record names `owner_token`, or
    /// unconditionally when `force` is set.
    ///
    /// Returns `Ok(true)` when a record was removed.
    #[must_use = "unlock may fail and the outcome must be inspected"]
    async fn unlock(&self, key: &str, owner_token: &str, force: bool) -> TransportResult<bool>;

    /// Reads a raw record.
    #[must_use = "transport operations may fail and errors must be handled"]
    async fn get(&self, key: &str) -> TransportResult<Option<Bytes>>;

    /// Writes a raw record, optionally expiring after `ttl`.
    ///
    /// When `guard_lock_key` is given, the write is applied only if that lock
    /// record still names this transport, and the check and write are one
    /// atomic operation at the backend. Returns `Ok(false)` when the guard
    /// check fails.
    #[must_use = "a guarded write may be rejected and the outcome must be inspected"]
    async fn store(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
        guard_lock_key: Option<&str>,
    ) -> TransportResult<bool>;

    /// Deletes a raw record, with the same guard semantics as
    /// [`store`](Self::store).
    ///
    /// Returns `Ok(false)` when the guard check fails. Removing a missing
    /// record under a passing guard returns `Ok(true)`.
    #[must_use = "a guarded delete may be rejected and the outcome must be inspected"]
    async fn remove(&self, key: &str, guard_lock_key: Option<&str>) -> TransportResult<bool>;

    /// Publishes `data` on `channel`, wrapped in an envelope naming this
    /// transport as sender.
    ///
    /// Delivery is best-effort and at-most-once.
    async fn publish(&self, channel: &str, data: serde_json::Value) -> TransportResult<()>;

    /// Subscribes to `channel`. With `ignore_self`, envelopes published by
    /// this transport are filtered out.
    async fn subscribe(&self, channel: &str, ignore_self: bool) -> TransportResult<Subscription>;

    /// Detaches a subscription.
    async fn unsubscribe(&self, subscription: Subscription) -> TransportResult<()>;

    /// Returns a receiver for this transport's connection lifecycle events.
    fn lifecycle(&self) -> broadcast::Receiver<ConnectionEvent>;
}

/// Typed JSON helpers over any [`ClusterTransport`].
#[async_trait]
pub trait TransportExt: ClusterTransport {
    /// Reads a record and decodes it as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Serialization`] when the stored bytes are
    /// not valid JSON for `T`.
    async fn get_json<T>(&self, key: &str) -> TransportResult<Option<T>>
    where
        T: DeserializeOwned + Send,
    {
        match self.get(key).await? {
            Some(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| {
                TransportError::serialization_with_source(format!("undecodable record {key}"), e)
            }),
            None => Ok(None),
        }
    }

    /// Encodes `value` as JSON and writes it with [`store`](ClusterTransport::store).
    async fn store_json<T>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
        guard_lock_key: Option<&str>,
    ) -> TransportResult<bool>
    where
        T: Serialize + Sync,
    {
        let bytes = serde_json::to_vec(value)?;
        self.store(key, bytes, ttl, guard_lock_key).await
    }

    /// Encodes `data` as JSON and publishes it.
    async fn publish_json<T>(&self, channel: &str, data: &T) -> TransportResult<()>
    where
        T: Serialize + Sync,
    {
        let value = serde_json::to_value(data)?;
        self.publish(channel, value).await
    }
}

impl<T: ClusterTransport + ?Sized> TransportExt for T {}

/// Decodes the payload of an envelope into `T`.
pub fn decode_payload<T: DeserializeOwned>(envelope: &Envelope) -> TransportResult<T> {
    serde_json::from_value(envelope.data.clone()).map_err(|e| {
        TransportError::serialization_with_source(
            format!("unexpected payload from {}", envelope.sender_id),
            e,
        )
    })
}
