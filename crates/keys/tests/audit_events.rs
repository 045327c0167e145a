//! Verifies that completed rotations emit structured audit events and that
//! skipped rotations do not.

#![allow(clippy::expect_used, clippy::panic)]

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use connector_cluster_keys::testutil::{start_process, test_config};
use connector_cluster_transport::{MemoryCluster, testutil::TokioClock};
use tracing::{
    Event, Subscriber,
    field::{Field, Visit},
};
use tracing_subscriber::{layer::SubscriberExt, registry::LookupSpan};

// ---------------------------------------------------------------------------
// Collecting layer: records the fields of every `audit_event`
// ---------------------------------------------------------------------------

type Fields = BTreeMap<String, String>;

#[derive(Clone, Default)]
struct AuditCollector {
    events: Arc<Mutex<Vec<Fields>>>,
}

#[derive(Default)]
struct FieldVisitor(Fields);

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.insert(field.name().to_owned(), value.to_owned());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.0.insert(field.name().to_owned(), format!("{value:?}"));
    }
}

impl<S> tracing_subscriber::Layer<S> for AuditCollector
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);
        if visitor.0.get("message").map(String::as_str) == Some("audit_event") {
            self.events.lock().expect("lock poisoned").push(visitor.0);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn rotations_are_audited() {
    let collector = AuditCollector::default();
    let events = Arc::clone(&collector.events);
    let _guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(collector));

    let cluster = MemoryCluster::new();
    let coordinator =
        start_process(Arc::new(cluster.connect()), test_config(), TokioClock::fixed().shared())
            .await
            .expect("start coordinator");

    let initial = coordinator.generate_keys().await.expect("key set");
    let rotated = coordinator.rotate().await;
    let rotated = rotated.key_set().expect("rotated key set").clone();
    assert!(!coordinator.rotate().await.is_rotated(), "activation still pending");

    let recorded = events.lock().expect("lock poisoned");
    assert_eq!(recorded.len(), 2, "one event per completed rotation: {recorded:?}");
    for (event, key_set) in recorded.iter().zip([&initial, &rotated]) {
        assert_eq!(event.get("audit.action").map(String::as_str), Some("key_rotation"));
        assert_eq!(event.get("kid"), Some(&key_set.current.kid));
        assert_eq!(event.get("generation"), Some(&key_set.generation.to_string()));
    }
    assert_eq!(recorded[0].get("current_start").map(String::as_str), Some("None"));
}
