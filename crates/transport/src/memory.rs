//! In-memory cluster transport.
//!
//! [`MemoryCluster`] plays the role of the shared store and message bus;
//! each [`MemoryTransport`] obtained from [`MemoryCluster::connect`] is one
//! simulated process with its own sender identity and lifecycle stream.
//!
//! # Features
//!
//! - **Atomic guarded writes**: the ownership check and the mutation run under
//!   one write lock, matching the server-side script of networked backends
//! - **TTL support**: expired records read as absent; a background task
//!   purges them every second using tokio's clock, so paused-time tests can
//!   expire locks with `tokio::time::advance`
//! - **Fault injection**: [`set_message_loss`](MemoryCluster::set_message_loss)
//!   drops broadcasts, [`emit_lifecycle`](MemoryCluster::emit_lifecycle)
//!   simulates reconnects
//!
//! # Example
//!
//! ```
//! use connector_cluster_transport::{ClusterTransport, MemoryCluster};
//!
//! #[tokio::main]
//! async fn main() {
//!     let cluster = MemoryCluster::new();
//!     let transport = cluster.connect();
//!
//!     transport.store("greeting", b"hello".to_vec(), None, None).await.unwrap();
//!     let value = transport.get("greeting").await.unwrap();
//!     assert_eq!(value.unwrap().as_ref(), b"hello");
//! }
//! ```

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::{
    select,
    sync::{broadcast, watch},
    time::{Instant, sleep},
};
use uuid::Uuid;

use crate::{
    envelope::{Envelope, ListenerRegistry, Subscription},
    error::{TransportError, TransportResult},
    lifecycle::{ConnectionEvent, LifecycleHub},
    transport::ClusterTransport,
};

/// Holds the shutdown signal sender. When dropped, the watch channel
/// closes and the cleanup task exits.
struct ShutdownGuard {
    shutdown_tx: watch::Sender<()>,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

#[derive(Debug, Clone)]
struct Record {
    value: Bytes,
    expires_at: Option<Instant>,
}

impl Record {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// Counters describing bus traffic, for assertions in tests.
#[derive(Debug, Default)]
struct BusStats {
    published: AtomicU64,
    dropped: AtomicU64,
}

struct ClusterState {
    records: RwLock<BTreeMap<String, Record>>,
    listeners: ListenerRegistry,
    lifecycles: Mutex<Vec<LifecycleHub>>,
    message_loss: AtomicBool,
    stats: BusStats,
}

/// Shared in-memory store and message bus.
///
/// Cheaply cloneable; clones share the same data. The background TTL purge
/// task stops when the last clone is dropped.
#[derive(Clone)]
pub struct MemoryCluster {
    state: Arc<ClusterState>,
    shutdown_guard: Arc<ShutdownGuard>,
}

impl MemoryCluster {
    /// Creates an empty cluster and spawns its TTL purge task.
    ///
    /// # Panics
    ///
    /// Must be called within a Tokio runtime context.
    pub fn new() -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let cluster = Self {
            state: Arc::new(ClusterState {
                records: RwLock::new(BTreeMap::new()),
                listeners: ListenerRegistry::new(),
                lifecycles: Mutex::new(Vec::new()),
                message_loss: AtomicBool::new(false),
                stats: BusStats::default(),
            }),
            shutdown_guard: Arc::new(ShutdownGuard { shutdown_tx }),
        };

        let state = Arc::downgrade(&cluster.state);
        tokio::spawn(async move {
            purge_expired_records(state, shutdown_rx).await;
        });

        cluster
    }

    /// Opens a new connection, representing one process.
    #[must_use]
    pub fn connect(&self) -> MemoryTransport {
        self.connect_as(Uuid::new_v4().to_string())
    }

    /// Opens a new connection with an explicit sender identity.
    #[must_use]
    pub fn connect_as(&self, sender_id: impl Into<String>) -> MemoryTransport {
        let lifecycle = LifecycleHub::new();
        self.state.lifecycles.lock().push(lifecycle.clone());
        MemoryTransport {
            cluster: self.clone(),
            sender_id: Arc::from(sender_id.into()),
            lifecycle,
        }
    }

    /// When enabled, published messages are silently discarded.
    pub fn set_message_loss(&self, enabled: bool) {
        self.state.message_loss.store(enabled, Ordering::SeqCst);
    }

    /// Sends `event` to every connection's lifecycle stream.
    pub fn emit_lifecycle(&self, event: ConnectionEvent) {
        for hub in self.state.lifecycles.lock().iter() {
            hub.emit(event.clone());
        }
    }

    /// Number of messages accepted by [`publish`](ClusterTransport::publish).
    #[must_use]
    pub fn published_count(&self) -> u64 {
        self.state.stats.published.load(Ordering::Relaxed)
    }

    /// Number of messages discarded while message loss was enabled.
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.state.stats.dropped.load(Ordering::Relaxed)
    }

    /// Returns the owner recorded in lock `key`, if the lock is held.
    #[must_use]
    pub fn lock_owner(&self, key: &str) -> Option<String> {
        let records = self.state.records.read();
        records
            .get(key)
            .filter(|r| r.is_live(Instant::now()))
            .map(|r| String::from_utf8_lossy(&r.value).into_owned())
    }

    /// Number of listeners registered on `channel` across all connections.
    #[must_use]
    pub fn listener_count(&self, channel: &str) -> usize {
        self.state.listeners.listener_count(channel)
    }

    /// Explicitly stops the TTL purge task. Reads still honour expiry.
    pub fn shutdown(&self) {
        let _ = self.shutdown_guard.shutdown_tx.send(());
    }
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

/// Purges expired records every second until shutdown or until the cluster
/// is gone.
async fn purge_expired_records(
    state: std::sync::Weak<ClusterState>,
    mut shutdown_rx: watch::Receiver<()>,
) {
    loop {
        select! {
            _ = sleep(Duration::from_secs(1)) => {}
            _ = shutdown_rx.changed() => {
                return;
            }
        }

        let Some(state) = state.upgrade() else {
            return;
        };
        let now = Instant::now();
        let mut records = state.records.write();
        records.retain(|_, record| record.is_live(now));
    }
}

/// One process's connection to a [`MemoryCluster`].
#[derive(Clone)]
pub struct MemoryTransport {
    cluster: MemoryCluster,
    sender_id: Arc<str>,
    lifecycle: LifecycleHub,
}

impl MemoryTransport {
    /// The cluster this transport is connected to.
    #[must_use]
    pub fn cluster(&self) -> &MemoryCluster {
        &self.cluster
    }

    /// Sends `event` to this connection's lifecycle stream only.
    pub fn emit_lifecycle(&self, event: ConnectionEvent) {
        self.lifecycle.emit(event);
    }

    fn guard_holds(
        &self,
        records: &BTreeMap<String, Record>,
        guard_lock_key: Option<&str>,
        now: Instant,
    ) -> bool {
        match guard_lock_key {
            None => true,
            Some(lock_key) => records
                .get(lock_key)
                .filter(|r| r.is_live(now))
                .is_some_and(|r| r.value.as_ref() == self.sender_id.as_bytes()),
        }
    }
}

fn expiry(ttl: Option<Duration>, now: Instant) -> Option<Instant> {
    ttl.map(|ttl| now + ttl)
}

#[async_trait]
impl ClusterTransport for MemoryTransport {
    fn sender_id(&self) -> &str {
        &self.sender_id
    }

    #[tracing::instrument(skip(self), fields(sender = %self.sender_id))]
    async fn lock(&self, key: &str, ttl: Duration, force: bool) -> TransportResult<bool> {
        let now = Instant::now();
        let mut records = self.cluster.state.records.write();
        let held = records.get(key).is_some_and(|r| r.is_live(now));
        if held && !force {
            return Ok(false);
        }
        records.insert(
            key.to_owned(),
            Record {
                value: Bytes::copy_from_slice(self.sender_id.as_bytes()),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    #[tracing::instrument(skip(self, owner_token), fields(sender = %self.sender_id))]
    async fn unlock(&self, key: &str, owner_token: &str, force: bool) -> TransportResult<bool> {
        let now = Instant::now();
        let mut records = self.cluster.state.records.write();
        let owned = records
            .get(key)
            .filter(|r| r.is_live(now))
            .is_some_and(|r| r.value.as_ref() == owner_token.as_bytes());
        if !owned && !force {
            return Ok(false);
        }
        Ok(records.remove(key).is_some_and(|r| r.is_live(now)))
    }

    async fn get(&self, key: &str) -> TransportResult<Option<Bytes>> {
        let now = Instant::now();
        let records = self.cluster.state.records.read();
        Ok(records.get(key).filter(|r| r.is_live(now)).map(|r| r.value.clone()))
    }

    #[tracing::instrument(skip(self, value), fields(sender = %self.sender_id, len = value.len()))]
    async fn store(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
        guard_lock_key: Option<&str>,
    ) -> TransportResult<bool> {
        let now = Instant::now();
        let mut records = self.cluster.state.records.write();
        if !self.guard_holds(&records, guard_lock_key, now) {
            tracing::debug!(key, "guarded store rejected: lock not owned");
            return Ok(false);
        }
        let record = Record { value: Bytes::from(value), expires_at: expiry(ttl, now) };
        records.insert(key.to_owned(), record);
        Ok(true)
    }

    #[tracing::instrument(skip(self), fields(sender = %self.sender_id))]
    async fn remove(&self, key: &str, guard_lock_key: Option<&str>) -> TransportResult<bool> {
        let now = Instant::now();
        let mut records = self.cluster.state.records.write();
        if !self.guard_holds(&records, guard_lock_key, now) {
            tracing::debug!(key, "guarded remove rejected: lock not owned");
            return Ok(false);
        }
        records.remove(key);
        Ok(true)
    }

    async fn publish(&self, channel: &str, data: serde_json::Value) -> TransportResult<()> {
        let state = &self.cluster.state;
        if state.message_loss.load(Ordering::SeqCst) {
            state.stats.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(channel, "message dropped by loss injection");
            return Ok(());
        }
        state.stats.published.fetch_add(1, Ordering::Relaxed);
        let envelope = Envelope::new(self.sender_id.as_ref(), data);
        let delivered = state.listeners.dispatch(channel, &envelope);
        tracing::trace!(channel, delivered, "message published");
        Ok(())
    }

    async fn subscribe(&self, channel: &str, ignore_self: bool) -> TransportResult<Subscription> {
        let ignore = ignore_self.then(|| self.sender_id.to_string());
        Ok(self.cluster.state.listeners.register(channel, ignore))
    }

    async fn unsubscribe(&self, subscription: Subscription) -> TransportResult<()> {
        if !self.cluster.state.listeners.remove(subscription.channel(), subscription.id()) {
            return Err(TransportError::internal(format!(
                "subscription {} not registered on {}",
                subscription.id(),
                subscription.channel()
            )));
        }
        Ok(())
    }

    fn lifecycle(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.lifecycle.subscribe()
    }
}
