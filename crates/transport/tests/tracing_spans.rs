//! Integration test verifying that `#[instrument]` annotations produce
//! spans for the `MemoryTransport` lock and write paths.

#![allow(clippy::expect_used)]

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use connector_cluster_transport::{ClusterTransport, MemoryCluster};
use tracing::Subscriber;
use tracing_subscriber::{layer::SubscriberExt, registry::LookupSpan};

// ---------------------------------------------------------------------------
// Collecting layer: records span names as they are created
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct SpanCollector {
    spans: Arc<Mutex<Vec<String>>>,
}

impl<S> tracing_subscriber::Layer<S> for SpanCollector
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(
        &self,
        _attrs: &tracing::span::Attributes<'_>,
        id: &tracing::span::Id,
        ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        if let Some(span) = ctx.span(id) {
            self.spans.lock().expect("lock poisoned").push(span.name().to_owned());
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn lock_and_unlock_create_spans() {
    let collector = SpanCollector::default();
    let spans = Arc::clone(&collector.spans);

    let subscriber = tracing_subscriber::registry().with(collector);
    let _guard = tracing::subscriber::set_default(subscriber);

    let cluster = MemoryCluster::new();
    let process = cluster.connect();
    assert!(process.lock("l", Duration::from_secs(5), false).await.expect("lock"));
    assert!(process.unlock("l", process.sender_id(), false).await.expect("unlock"));

    let recorded = spans.lock().expect("lock poisoned");
    assert!(recorded.iter().any(|s| s == "lock"), "expected a 'lock' span, got: {recorded:?}");
    assert!(recorded.iter().any(|s| s == "unlock"), "expected an 'unlock' span, got: {recorded:?}");
}

#[tokio::test]
async fn guarded_store_creates_span() {
    let collector = SpanCollector::default();
    let spans = Arc::clone(&collector.spans);

    let subscriber = tracing_subscriber::registry().with(collector);
    let _guard = tracing::subscriber::set_default(subscriber);

    let cluster = MemoryCluster::new();
    let process = cluster.connect();
    let stored = process.store("k", b"v".to_vec(), None, Some("absent-lock")).await;
    assert!(!stored.expect("store"));

    let recorded = spans.lock().expect("lock poisoned");
    assert!(recorded.iter().any(|s| s == "store"), "expected a 'store' span, got: {recorded:?}");
}
