//! Conformance test suite for [`ClusterTransport`] implementations.
//!
//! Every backend, in-memory or networked, runs the same checks so the
//! coordination protocols above can rely on one contract. Each check takes
//! two handles connected to the same cluster (two "processes") and a
//! deployment prefix under which all keys and channels are created, so
//! runs against a shared server do not collide.
//!
//! # Usage
//!
//! ```no_run
//! use connector_cluster_transport::{MemoryCluster, conformance};
//!
//! #[tokio::test]
//! async fn memory_transport_conformance() {
//!     let cluster = MemoryCluster::new();
//!     conformance::run_all(&cluster.connect(), &cluster.connect(), "conformance").await;
//! }
//! ```
//!
//! # Test Categories
//!
//! | Category | Contract aspect |
//! |----------|-----------------|
//! | Records | `get` / `store` / `remove` and record TTLs |
//! | Locks | exclusivity, owner-checked unlock, force, TTL expiry |
//! | Guarded writes | writes and removals only under an owned lock |
//! | Broadcast | envelopes, `ignore_self`, unsubscribe |

use std::time::Duration;

use tokio::time::{sleep, timeout};

use crate::transport::ClusterTransport;

const LOCK_TTL: Duration = Duration::from_secs(30);
const DELIVERY_WAIT: Duration = Duration::from_secs(2);

fn key(prefix: &str, name: &str) -> String {
    format!("{prefix}:conformance:{name}")
}

// ============================================================================
// Records
// ============================================================================

/// `get` on a missing key returns `Ok(None)`.
pub async fn get_missing_returns_none<T: ClusterTransport>(a: &T, prefix: &str) {
    let result = a.get(&key(prefix, "missing")).await.expect("get should not fail");
    assert_eq!(result, None);
}

/// A stored value is visible to every process.
pub async fn store_is_shared<T: ClusterTransport>(a: &T, b: &T, prefix: &str) {
    let k = key(prefix, "shared");
    assert!(a.store(&k, b"v1".to_vec(), None, None).await.expect("store"));
    let seen = b.get(&k).await.expect("get").expect("value must be visible");
    assert_eq!(seen.as_ref(), b"v1");

    assert!(b.store(&k, b"v2".to_vec(), None, None).await.expect("overwrite"));
    assert_eq!(a.get(&k).await.expect("get").expect("value").as_ref(), b"v2");
}

/// Removing a key makes it read as absent; removing again is a no-op.
pub async fn remove_deletes_record<T: ClusterTransport>(a: &T, prefix: &str) {
    let k = key(prefix, "removed");
    a.store(&k, b"v".to_vec(), None, None).await.expect("store");
    assert!(a.remove(&k, None).await.expect("remove"));
    assert_eq!(a.get(&k).await.expect("get"), None);
    a.remove(&k, None).await.expect("second remove must not fail");
}

/// A record stored with a TTL disappears after it.
pub async fn store_ttl_expires<T: ClusterTransport>(a: &T, prefix: &str) {
    let k = key(prefix, "ttl");
    a.store(&k, b"v".to_vec(), Some(Duration::from_millis(500)), None).await.expect("store");
    assert!(a.get(&k).await.expect("get").is_some());
    sleep(Duration::from_millis(1_200)).await;
    assert_eq!(a.get(&k).await.expect("get"), None, "record must expire");
}

// ============================================================================
// Locks
// ============================================================================

/// A held lock excludes every other process.
pub async fn lock_is_exclusive<T: ClusterTransport>(a: &T, b: &T, prefix: &str) {
    let k = key(prefix, "lock-exclusive");
    assert!(a.lock(&k, LOCK_TTL, false).await.expect("lock"));
    assert!(!b.lock(&k, LOCK_TTL, false).await.expect("lock"));
    assert!(!a.lock(&k, LOCK_TTL, false).await.expect("lock"), "locks are not reentrant");
    a.unlock(&k, a.sender_id(), false).await.expect("unlock");
}

/// Only the recorded owner may unlock without force.
pub async fn unlock_checks_owner<T: ClusterTransport>(a: &T, b: &T, prefix: &str) {
    let k = key(prefix, "lock-owner");
    assert!(a.lock(&k, LOCK_TTL, false).await.expect("lock"));
    assert!(!b.unlock(&k, b.sender_id(), false).await.expect("unlock"));
    assert!(!b.lock(&k, LOCK_TTL, false).await.expect("lock"), "failed unlock must leave the lock");
    assert!(a.unlock(&k, a.sender_id(), false).await.expect("unlock"));
    assert!(!a.unlock(&k, a.sender_id(), false).await.expect("unlock"), "nothing left to unlock");
    assert!(b.lock(&k, LOCK_TTL, false).await.expect("lock"));
    b.unlock(&k, b.sender_id(), false).await.expect("unlock");
}

/// Forced lock and unlock ignore the current holder.
pub async fn force_overrides_holder<T: ClusterTransport>(a: &T, b: &T, prefix: &str) {
    let k = key(prefix, "lock-force");
    assert!(a.lock(&k, LOCK_TTL, false).await.expect("lock"));
    assert!(b.lock(&k, LOCK_TTL, true).await.expect("forced lock"));
    assert!(!a.unlock(&k, a.sender_id(), false).await.expect("unlock"), "a no longer owns it");
    assert!(a.unlock(&k, a.sender_id(), true).await.expect("forced unlock"));
    assert!(a.lock(&k, LOCK_TTL, false).await.expect("lock"));
    a.unlock(&k, a.sender_id(), false).await.expect("unlock");
}

/// An abandoned lock frees itself after its TTL.
pub async fn lock_expires<T: ClusterTransport>(a: &T, b: &T, prefix: &str) {
    let k = key(prefix, "lock-ttl");
    assert!(a.lock(&k, Duration::from_millis(500), false).await.expect("lock"));
    sleep(Duration::from_millis(1_200)).await;
    assert!(b.lock(&k, LOCK_TTL, false).await.expect("lock"), "expired lock must be free");
    b.unlock(&k, b.sender_id(), false).await.expect("unlock");
}

// ============================================================================
// Guarded writes
// ============================================================================

/// A guarded store succeeds only while the writer owns the guard lock.
pub async fn guarded_store_requires_lock<T: ClusterTransport>(a: &T, b: &T, prefix: &str) {
    let lock = key(prefix, "guard-store-lock");
    let k = key(prefix, "guard-store");

    assert!(!a.store(&k, b"free".to_vec(), None, Some(&lock)).await.expect("store"));
    assert!(a.lock(&lock, LOCK_TTL, false).await.expect("lock"));
    assert!(!b.store(&k, b"b".to_vec(), None, Some(&lock)).await.expect("store"));
    assert!(a.store(&k, b"a".to_vec(), None, Some(&lock)).await.expect("store"));
    assert_eq!(b.get(&k).await.expect("get").expect("value").as_ref(), b"a");

    b.lock(&lock, LOCK_TTL, true).await.expect("forced lock");
    assert!(!a.store(&k, b"late".to_vec(), None, Some(&lock)).await.expect("store"));
    assert_eq!(a.get(&k).await.expect("get").expect("value").as_ref(), b"a");
    b.unlock(&lock, b.sender_id(), false).await.expect("unlock");
}

/// A guarded removal succeeds only while the caller owns the guard lock.
pub async fn guarded_remove_requires_lock<T: ClusterTransport>(a: &T, b: &T, prefix: &str) {
    let lock = key(prefix, "guard-remove-lock");
    let k = key(prefix, "guard-remove");
    a.store(&k, b"v".to_vec(), None, None).await.expect("store");

    assert!(a.lock(&lock, LOCK_TTL, false).await.expect("lock"));
    assert!(!b.remove(&k, Some(&lock)).await.expect("remove"));
    assert!(b.get(&k).await.expect("get").is_some());
    assert!(a.remove(&k, Some(&lock)).await.expect("remove"));
    assert_eq!(b.get(&k).await.expect("get"), None);
    a.unlock(&lock, a.sender_id(), false).await.expect("unlock");
}

// ============================================================================
// Broadcast
// ============================================================================

/// Published messages reach subscribers wrapped in the sender's envelope.
pub async fn publish_reaches_subscribers<T: ClusterTransport>(a: &T, b: &T, prefix: &str) {
    let channel = key(prefix, "channel-basic");
    let mut on_a = a.subscribe(&channel, false).await.expect("subscribe");
    let mut on_b = b.subscribe(&channel, false).await.expect("subscribe");

    a.publish(&channel, serde_json::json!({"n": 1})).await.expect("publish");
    for subscription in [&mut on_a, &mut on_b] {
        let envelope = timeout(DELIVERY_WAIT, subscription.recv())
            .await
            .expect("message must arrive")
            .expect("subscription open");
        assert_eq!(envelope.sender_id, a.sender_id());
        assert_eq!(envelope.data, serde_json::json!({"n": 1}));
    }

    a.unsubscribe(on_a).await.expect("unsubscribe");
    b.unsubscribe(on_b).await.expect("unsubscribe");
}

/// `ignore_self` filters the subscriber's own messages only.
pub async fn subscribe_ignores_self<T: ClusterTransport>(a: &T, b: &T, prefix: &str) {
    let channel = key(prefix, "channel-ignore-self");
    let mut subscription = a.subscribe(&channel, true).await.expect("subscribe");

    a.publish(&channel, serde_json::json!("own")).await.expect("publish");
    b.publish(&channel, serde_json::json!("peer")).await.expect("publish");

    let envelope = timeout(DELIVERY_WAIT, subscription.recv())
        .await
        .expect("peer message must arrive")
        .expect("subscription open");
    assert_eq!(envelope.data, serde_json::json!("peer"));
    assert!(subscription.try_recv().is_none());
    a.unsubscribe(subscription).await.expect("unsubscribe");
}

/// Channels are isolated and unsubscribed listeners receive nothing more.
pub async fn unsubscribe_stops_delivery<T: ClusterTransport>(a: &T, b: &T, prefix: &str) {
    let channel = key(prefix, "channel-unsubscribe");
    let other = key(prefix, "channel-other");
    let mut kept = b.subscribe(&channel, false).await.expect("subscribe");
    let dropped = b.subscribe(&channel, false).await.expect("subscribe");
    b.unsubscribe(dropped).await.expect("unsubscribe");

    a.publish(&other, serde_json::json!("elsewhere")).await.expect("publish");
    a.publish(&channel, serde_json::json!("here")).await.expect("publish");
    let envelope = timeout(DELIVERY_WAIT, kept.recv()).await.expect("arrives").expect("open");
    assert_eq!(envelope.data, serde_json::json!("here"), "other channels must not leak in");
    b.unsubscribe(kept).await.expect("unsubscribe");
}

// ============================================================================
// Full suite
// ============================================================================

/// Runs every conformance check against two handles on the same cluster.
pub async fn run_all<T: ClusterTransport>(a: &T, b: &T, prefix: &str) {
    get_missing_returns_none(a, prefix).await;
    store_is_shared(a, b, prefix).await;
    remove_deletes_record(a, prefix).await;
    store_ttl_expires(a, prefix).await;

    lock_is_exclusive(a, b, prefix).await;
    unlock_checks_owner(a, b, prefix).await;
    force_overrides_holder(a, b, prefix).await;
    lock_expires(a, b, prefix).await;

    guarded_store_requires_lock(a, b, prefix).await;
    guarded_remove_requires_lock(a, b, prefix).await;

    publish_reaches_subscribers(a, b, prefix).await;
    subscribe_ignores_self(a, b, prefix).await;
    unsubscribe_stops_delivery(a, b, prefix).await;
}
