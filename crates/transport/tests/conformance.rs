//! Conformance suite for `MemoryTransport`.
//!
//! Each test runs a single conformance check for fine-grained failure
//! reporting. The `run_all` test exercises the full suite to verify no check
//! is accidentally omitted.

#![allow(clippy::expect_used, clippy::panic)]

use connector_cluster_transport::{MemoryCluster, MemoryTransport, conformance};

const PREFIX: &str = "conformance";

fn processes() -> (MemoryCluster, MemoryTransport, MemoryTransport) {
    let cluster = MemoryCluster::new();
    let (a, b) = (cluster.connect(), cluster.connect());
    (cluster, a, b)
}

// ============================================================================
// Records
// ============================================================================

#[tokio::test]
async fn get_missing_returns_none() {
    let (_cluster, a, _b) = processes();
    conformance::get_missing_returns_none(&a, PREFIX).await;
}

#[tokio::test]
async fn store_is_shared() {
    let (_cluster, a, b) = processes();
    conformance::store_is_shared(&a, &b, PREFIX).await;
}

#[tokio::test]
async fn remove_deletes_record() {
    let (_cluster, a, _b) = processes();
    conformance::remove_deletes_record(&a, PREFIX).await;
}

#[tokio::test]
async fn store_ttl_expires() {
    let (_cluster, a, _b) = processes();
    conformance::store_ttl_expires(&a, PREFIX).await;
}

// ============================================================================
// Locks
// ============================================================================

#[tokio::test]
async fn lock_is_exclusive() {
    let (_cluster, a, b) = processes();
    conformance::lock_is_exclusive(&a, &b, PREFIX).await;
}

#[tokio::test]
async fn unlock_checks_owner() {
    let (_cluster, a, b) = processes();
    conformance::unlock_checks_owner(&a, &b, PREFIX).await;
}

#[tokio::test]
async fn force_overrides_holder() {
    let (_cluster, a, b) = processes();
    conformance::force_overrides_holder(&a, &b, PREFIX).await;
}

#[tokio::test]
async fn lock_expires() {
    let (_cluster, a, b) = processes();
    conformance::lock_expires(&a, &b, PREFIX).await;
}

// ============================================================================
// Guarded writes
// ============================================================================

#[tokio::test]
async fn guarded_store_requires_lock() {
    let (_cluster, a, b) = processes();
    conformance::guarded_store_requires_lock(&a, &b, PREFIX).await;
}

#[tokio::test]
async fn guarded_remove_requires_lock() {
    let (_cluster, a, b) = processes();
    conformance::guarded_remove_requires_lock(&a, &b, PREFIX).await;
}

// ============================================================================
// Broadcast
// ============================================================================

#[tokio::test]
async fn publish_reaches_subscribers() {
    let (_cluster, a, b) = processes();
    conformance::publish_reaches_subscribers(&a, &b, PREFIX).await;
}

#[tokio::test]
async fn subscribe_ignores_self() {
    let (_cluster, a, b) = processes();
    conformance::subscribe_ignores_self(&a, &b, PREFIX).await;
}

#[tokio::test]
async fn unsubscribe_stops_delivery() {
    let (_cluster, a, b) = processes();
    conformance::unsubscribe_stops_delivery(&a, &b, PREFIX).await;
}

// ============================================================================
// Full suite
// ============================================================================

#[tokio::test]
async fn run_all() {
    let (_cluster, a, b) = processes();
    conformance::run_all(&a, &b, PREFIX).await;
}
