//! Cluster-wide signing key rotation.
//!
//! Every process runs one [`KeyRotationCoordinator`]. It keeps a local copy
//! of the authoritative [`KeySet`] held in the shared store and refreshes it
//! from broadcasts, timers and reconnects. The local copy is a cache; the
//! store is the source of truth.
//!
//! # Rotation protocol
//!
//! Run by whichever process wins the rotation lock:
//!
//! 1. Take the rotation lock; give up if another process holds it.
//! 2. Re-read the stored key set and stop if a rotated key is still waiting
//!    for activation or the previous key is still inside its grace window.
//! 3. Generate a key pair and derive the successor key set. A cluster with no
//!    key set gets one that is active immediately.
//! 4. If activation is delayed, broadcast `pending-jwks-update` so peers arm
//!    a fallback re-read for when the lock expires.
//! 5. Store the key set guarded by the lock. On failure broadcast
//!    `cancel-pending-jwks-update`.
//! 6. Adopt locally, broadcast `new-jwks-available`, schedule activation.
//!    The lock is always released.

use std::{collections::BTreeMap, collections::HashMap, sync::Arc, time::Duration};

use connector_cluster_transport::{
    ClusterTransport, ConnectionEvent, Envelope, LockGuard, Namespace, SharedClock, Subscription,
    TransportError, TransportExt, decode_payload, system_clock, until_millis,
};
use parking_lot::{Mutex, RwLock};
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
    time::{Instant, Interval, MissedTickBehavior, interval_at, sleep},
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    config::RotationConfig,
    error::{KeyError, Result},
    generator::{Ed25519KeyGenerator, KeyGenerator},
    key_set::{KeyPair, KeySet, PublicJwk, RotationBlock},
    messages::{JobStatus, RotationMessage},
};

/// Result of one run of the rotation protocol.
#[derive(Debug)]
#[non_exhaustive]
pub enum RotationOutcome {
    /// A new key set was stored and broadcast.
    Rotated(Arc<KeySet>),
    /// The stored key set was not due for rotation and was left in place.
    Skipped {
        /// Why the key set was not rotated.
        reason: RotationBlock,
        /// The stored key set, now also the local copy.
        key_set: Arc<KeySet>,
    },
    /// Another process holds the rotation lock.
    Busy,
    /// The protocol failed; the stored key set is unchanged.
    Failed(KeyError),
}

impl RotationOutcome {
    /// Whether this run stored a new key set.
    #[must_use]
    pub fn is_rotated(&self) -> bool {
        matches!(self, Self::Rotated(_))
    }

    /// The key set this process holds after the run, when known.
    #[must_use]
    pub fn key_set(&self) -> Option<&Arc<KeySet>> {
        match self {
            Self::Rotated(key_set) | Self::Skipped { key_set, .. } => Some(key_set),
            Self::Busy | Self::Failed(_) => None,
        }
    }
}

/// Where an adopted key set came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Store,
    Broadcast,
    Rotation,
}

impl Source {
    fn as_str(self) -> &'static str {
        match self {
            Self::Store => "store",
            Self::Broadcast => "broadcast",
            Self::Rotation => "rotation",
        }
    }
}

/// A rotation announced by another process whose outcome has not arrived.
#[derive(Debug)]
struct PendingRotation {
    sender_id: String,
    lock_expiration: i64,
    timer: JoinHandle<()>,
}

/// Timer that re-reads the store when a delayed key becomes active.
#[derive(Debug)]
struct ActivationTimer {
    current_start: i64,
    timer: JoinHandle<()>,
}

struct Inner {
    transport: Arc<dyn ClusterTransport>,
    namespace: Namespace,
    config: RotationConfig,
    generator: Arc<dyn KeyGenerator>,
    clock: SharedClock,
    local: RwLock<Option<Arc<KeySet>>>,
    pending: Mutex<HashMap<String, PendingRotation>>,
    activation: Mutex<Option<ActivationTimer>>,
    jobs: Mutex<Vec<JoinHandle<()>>>,
    active_tx: watch::Sender<Option<KeyPair>>,
    cold_start: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
}

/// Keeps this process's signing keys in agreement with the cluster.
///
/// Dropping the coordinator stops its background tasks.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use connector_cluster_keys::{KeyRotationCoordinator, RotationConfig};
/// use connector_cluster_transport::MemoryCluster;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let cluster = MemoryCluster::new();
/// let keys = KeyRotationCoordinator::start(Arc::new(cluster.connect()), RotationConfig::default()).await?;
///
/// keys.generate_keys().await?;
/// let signing = keys.active_keys().await?;
/// let jwks = keys.public_keys().await?;
/// # let _ = (signing, jwks);
/// # Ok(())
/// # }
/// ```
pub struct KeyRotationCoordinator {
    inner: Arc<Inner>,
    listener: JoinHandle<()>,
}

impl KeyRotationCoordinator {
    /// Starts a coordinator generating Ed25519 keys, using the system clock.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Config`] for an invalid configuration, or
    /// [`KeyError::Transport`] if the rotation channel subscription fails.
    pub async fn start(transport: Arc<dyn ClusterTransport>, config: RotationConfig) -> Result<Self> {
        Self::start_with(transport, config, Arc::new(Ed25519KeyGenerator), system_clock()).await
    }

    /// Starts a coordinator with an explicit key generator and clock.
    ///
    /// Subscribes to the rotation channel and spawns the listener task that
    /// handles rotation messages, lifecycle events and the optional periodic
    /// rotation. Does not read or create keys; call
    /// [`generate_keys`](Self::generate_keys) during startup.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Config`] if `config` fails
    /// [`RotationConfig::validate`], or [`KeyError::Transport`] if the
    /// rotation channel subscription fails.
    pub async fn start_with(
        transport: Arc<dyn ClusterTransport>,
        config: RotationConfig,
        generator: Arc<dyn KeyGenerator>,
        clock: SharedClock,
    ) -> Result<Self> {
        config.validate()?;
        let namespace = Namespace::new(config.prefix());
        let lifecycle = transport.lifecycle();
        let subscription = transport.subscribe(&namespace.rotation_channel(), true).await?;
        let (active_tx, _) = watch::channel(None);

        let inner = Arc::new(Inner {
            transport,
            namespace,
            config,
            generator,
            clock,
            local: RwLock::new(None),
            pending: Mutex::new(HashMap::new()),
            activation: Mutex::new(None),
            jobs: Mutex::new(Vec::new()),
            active_tx,
            cold_start: tokio::sync::Mutex::new(()),
            cancel: CancellationToken::new(),
        });
        let listener = tokio::spawn(Arc::clone(&inner).listen(subscription, lifecycle));

        tracing::info!(sender_id = inner.transport.sender_id(), "Key rotation coordinator started");
        Ok(Self { inner, listener })
    }

    /// The key to sign with now.
    ///
    /// While a rotated key waits for activation, this is the previous key.
    /// Only touches the network when no local key set exists yet.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::NoKeySet`] if no key set exists locally and none
    /// could be obtained.
    pub async fn active_keys(&self) -> Result<KeyPair> {
        let key_set = self.local_or_generate().await?;
        Ok(key_set.active(self.inner.clock.now_secs()).clone())
    }

    /// Public keys that verify signatures now: the current key, plus the
    /// previous key while its grace window lasts.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::NoKeySet`] if no key set exists locally and none
    /// could be obtained.
    pub async fn public_keys(&self) -> Result<Vec<PublicJwk>> {
        let key_set = self.local_or_generate().await?;
        Ok(key_set.public_keys(self.inner.clock.now_secs(), self.inner.max_prev_window_secs()))
    }

    /// Obtains the cluster key set, creating it if the cluster has none.
    ///
    /// Each attempt reads the store and adopts what it finds, or else runs
    /// the rotation protocol. Concurrent callers in one process share the
    /// attempts.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::NoKeySet`] when every attempt failed.
    #[tracing::instrument(skip(self), fields(sender_id = self.inner.transport.sender_id()))]
    pub async fn generate_keys(&self) -> Result<Arc<KeySet>> {
        let _cold_start = self.inner.cold_start.lock().await;
        if let Some(key_set) = self.key_set() {
            return Ok(key_set);
        }

        let attempts = self.inner.config.generate_attempts();
        for attempt in 1..=attempts {
            match self.inner.read_store().await {
                Ok(Some(key_set)) => {
                    self.inner.adopt(Arc::new(key_set), Source::Store);
                    if let Some(key_set) = self.key_set() {
                        return Ok(key_set);
                    }
                },
                Ok(None) => {},
                Err(error) => tracing::warn!(attempt, error = %error, "Failed to read key set"),
            }

            match self.inner.rotate().await {
                RotationOutcome::Rotated(key_set) | RotationOutcome::Skipped { key_set, .. } => {
                    return Ok(key_set);
                },
                RotationOutcome::Busy => {
                    tracing::debug!(attempt, "Another process is creating the key set");
                },
                RotationOutcome::Failed(error) => {
                    tracing::warn!(attempt, error = %error, "Key set creation failed");
                },
            }

            if attempt < attempts {
                sleep(self.inner.config.attempt_delay()).await;
            }
        }

        tracing::error!(attempts, "Unable to obtain a signing key set");
        Err(KeyError::NoKeySet { attempts })
    }

    /// Runs the rotation protocol from this process.
    pub async fn rotate(&self) -> RotationOutcome {
        self.inner.rotate().await
    }

    /// Re-reads the stored key set and adopts it. Returns whether the local
    /// copy changed.
    ///
    /// # Errors
    ///
    /// Returns the read or decode error.
    pub async fn resync(&self) -> Result<bool> {
        self.inner.resync().await
    }

    /// The local copy of the key set, if any.
    #[must_use]
    pub fn key_set(&self) -> Option<Arc<KeySet>> {
        self.inner.local.read().clone()
    }

    /// Watches the active signing key.
    ///
    /// The value changes when a key set is first adopted and whenever a
    /// rotated key becomes active; the outer connector uses it to refresh
    /// the key registered with its OIDC client.
    #[must_use]
    pub fn subscribe_active_key(&self) -> watch::Receiver<Option<KeyPair>> {
        self.inner.active_tx.subscribe()
    }

    /// Number of announced remote rotations awaiting their outcome.
    #[must_use]
    pub fn pending_rotations(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Asks every process to rotate and report progress.
    ///
    /// Returns the subscription on which [`RotationMessage::JobStatus`]
    /// replies arrive, one stream of statuses per responding process. This
    /// process does not act on its own request.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Transport`] if subscribing or publishing fails.
    pub async fn request_rotation(&self, job_name: Option<String>) -> Result<Subscription> {
        let channel = self.inner.namespace.key_provider_reply(&Uuid::new_v4().simple().to_string());
        let subscription = self.inner.transport.subscribe(&channel, false).await?;
        let request = RotationMessage::RequestUpdateSystemJwks {
            listening_channel: channel,
            request_time: self.inner.clock.now_millis(),
            job_name,
        };
        self.inner.publish(&request).await?;
        Ok(subscription)
    }

    /// Collects each process's active-key digest for `wait`.
    ///
    /// Returns a map from sender id to the hex MD5 of that process's active
    /// public key, this process included when it has keys. Differing
    /// digests outside a rotation's activation instant indicate divergence.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Transport`] if subscribing or publishing fails.
    pub async fn collect_active_keys(&self, wait: Duration) -> Result<BTreeMap<String, String>> {
        let channel = self.inner.namespace.key_provider_reply(&Uuid::new_v4().simple().to_string());
        let mut subscription = self.inner.transport.subscribe(&channel, true).await?;
        self.inner
            .publish(&RotationMessage::RequestActiveKey { listening_channel: channel })
            .await?;

        let mut digests = BTreeMap::new();
        if let Some(digest) = self.inner.active_digest() {
            digests.insert(self.inner.transport.sender_id().to_owned(), digest);
        }
        let deadline = Instant::now() + wait;
        while let Ok(Some(envelope)) = tokio::time::timeout_at(deadline, subscription.recv()).await {
            match decode_payload::<RotationMessage>(&envelope) {
                Ok(RotationMessage::ServerActiveKey { public_key_md5 }) => {
                    digests.insert(envelope.sender_id, public_key_md5);
                },
                Ok(other) => tracing::debug!(event = other.event(), "Ignoring unexpected reply"),
                Err(error) => tracing::warn!(error = %error, "Ignoring malformed active-key reply"),
            }
        }
        if let Err(error) = self.inner.transport.unsubscribe(subscription).await {
            tracing::warn!(error = %error, "Failed to unsubscribe from reply channel");
        }
        Ok(digests)
    }

    /// Stops background tasks and timers. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        self.inner.cancel.cancel();
        if let Some(activation) = self.inner.activation.lock().take() {
            activation.timer.abort();
        }
        for (_, pending) in self.inner.pending.lock().drain() {
            pending.timer.abort();
        }
        for job in self.inner.jobs.lock().drain(..) {
            job.abort();
        }
        tracing::info!(sender_id = self.inner.transport.sender_id(), "Key rotation coordinator stopped");
    }

    /// Whether the listener task has exited.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.listener.is_finished()
    }

    async fn local_or_generate(&self) -> Result<Arc<KeySet>> {
        match self.key_set() {
            Some(key_set) => Ok(key_set),
            None => self.generate_keys().await,
        }
    }
}

impl Drop for KeyRotationCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for KeyRotationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRotationCoordinator")
            .field("sender_id", &self.inner.transport.sender_id())
            .field("generation", &self.key_set().map(|k| k.generation))
            .field("pending_rotations", &self.pending_rotations())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn max_prev_window_secs(&self) -> i64 {
        self.config.max_prev_window().as_secs() as i64
    }

    async fn read_store(&self) -> Result<Option<KeySet>> {
        Ok(self.transport.get_json::<KeySet>(&self.namespace.key_set()).await?)
    }

    async fn resync(self: &Arc<Self>) -> Result<bool> {
        match self.read_store().await? {
            Some(key_set) => Ok(self.adopt(Arc::new(key_set), Source::Store)),
            None => Ok(false),
        }
    }

    async fn resync_logged(self: &Arc<Self>, reason: &'static str) {
        match self.resync().await {
            Ok(changed) => tracing::debug!(reason, changed, "Key set re-read from store"),
            Err(error) => tracing::warn!(reason, error = %error, "Failed to re-read key set"),
        }
    }

    async fn publish(&self, message: &RotationMessage) -> Result<()> {
        self.transport.publish_json(&self.namespace.rotation_channel(), message).await?;
        Ok(())
    }

    async fn publish_logged(&self, message: &RotationMessage) {
        if let Err(error) = self.publish(message).await {
            tracing::warn!(event = message.event(), error = %error, "Failed to broadcast rotation message");
        }
    }

    fn active_digest(&self) -> Option<String> {
        let key_set = self.local.read().clone()?;
        match key_set.active(self.clock.now_secs()).public_key.md5_hex() {
            Ok(digest) => Some(digest),
            Err(error) => {
                tracing::warn!(error = %error, "Failed to digest active key");
                None
            },
        }
    }

    /// Replaces the local copy with `incoming`. Broadcast copies older than
    /// the local one are refused; store reads always win.
    fn adopt(self: &Arc<Self>, incoming: Arc<KeySet>, source: Source) -> bool {
        let changed = {
            let mut local = self.local.write();
            if source == Source::Broadcast
                && let Some(current) = local.as_ref()
                && incoming.generation < current.generation
            {
                tracing::debug!(
                    incoming = incoming.generation,
                    local = current.generation,
                    "Ignoring stale key set broadcast"
                );
                return false;
            }
            if local.as_deref() == Some(&*incoming) {
                false
            } else {
                *local = Some(Arc::clone(&incoming));
                true
            }
        };

        if changed {
            tracing::info!(
                kid = %incoming.current.kid,
                generation = incoming.generation,
                current_start = ?incoming.current_start,
                source = source.as_str(),
                "Adopted key set"
            );
        }
        self.schedule_activation(&incoming);
        self.refresh_active(&incoming);
        changed
    }

    /// Publishes the active key to watchers if it changed.
    fn refresh_active(&self, key_set: &KeySet) {
        let active = key_set.active(self.clock.now_secs());
        let updated = self.active_tx.send_if_modified(|slot| {
            if slot.as_ref().is_some_and(|key| key.kid == active.kid) {
                false
            } else {
                *slot = Some(active.clone());
                true
            }
        });
        if updated {
            tracing::info!(kid = %active.kid, "Active signing key changed");
        }
    }

    /// Arms a timer for the key set's activation instant, replacing any
    /// timer armed for a different instant.
    fn schedule_activation(self: &Arc<Self>, key_set: &KeySet) {
        let Some(current_start) = key_set.current_start.filter(|_| key_set.activation_pending(self.clock.now_secs()))
        else {
            return;
        };
        if self.cancel.is_cancelled() {
            return;
        }

        let mut activation = self.activation.lock();
        if activation.as_ref().is_some_and(|a| a.current_start == current_start && !a.timer.is_finished()) {
            return;
        }
        let delay = until_millis(self.clock.as_ref(), current_start * 1_000);
        let inner = Arc::clone(self);
        let timer = tokio::spawn(async move {
            sleep(delay).await;
            inner.resync_logged("activation").await;
            if let Some(key_set) = inner.local.read().clone() {
                inner.refresh_active(&key_set);
            }
        });
        if let Some(previous) = activation.replace(ActivationTimer { current_start, timer }) {
            previous.timer.abort();
        }
    }

    async fn rotate(self: &Arc<Self>) -> RotationOutcome {
        let lock_key = self.namespace.rotation_lock();
        let acquired = LockGuard::acquire(Arc::clone(&self.transport), lock_key.as_str(), self.config.lock_ttl()).await;
        let lock = match acquired {
            Ok(Some(lock)) => lock,
            Ok(None) => {
                tracing::debug!("Rotation lock held elsewhere");
                return RotationOutcome::Busy;
            },
            Err(error) => {
                tracing::warn!(error = %error, "Failed to acquire rotation lock");
                return RotationOutcome::Failed(error.into());
            },
        };

        // An abandoned rotation (cancelled job, dropped caller) unlocks from
        // the guard's drop.
        let outcome = self.rotate_locked(&lock_key).await;

        match lock.release().await {
            Ok(true) => {},
            Ok(false) => tracing::debug!("Rotation lock already expired or taken over"),
            Err(error) => tracing::warn!(error = %error, "Failed to release rotation lock"),
        }
        outcome
    }

    async fn rotate_locked(self: &Arc<Self>, lock_key: &str) -> RotationOutcome {
        let now = self.clock.now_secs();
        let existing = match self.read_store().await {
            Ok(existing) => existing,
            Err(error) => return RotationOutcome::Failed(error),
        };

        if let Some(existing) = existing.as_ref()
            && let Some(reason) = existing.rotation_block(now, self.max_prev_window_secs())
        {
            tracing::debug!(%reason, generation = existing.generation, "Key set not due for rotation");
            let key_set = Arc::new(existing.clone());
            self.adopt(Arc::clone(&key_set), Source::Store);
            return RotationOutcome::Skipped { reason, key_set };
        }

        let next_pair = match self.generator.generate().await {
            Ok(pair) => pair,
            Err(error) => return RotationOutcome::Failed(error),
        };
        let next = match existing.as_ref() {
            Some(old) => old.rotated(
                next_pair,
                now,
                self.config.start_delay().as_secs() as i64,
                self.config.prev_window().as_secs() as i64,
            ),
            None => KeySet::initial(next_pair),
        };

        let process_id = Uuid::new_v4().to_string();
        let announced = next.current_start.is_some();
        if announced {
            let end_of_lock_time = self.clock.now_millis() + self.config.lock_ttl().as_millis() as i64;
            self.publish_logged(&RotationMessage::PendingJwksUpdate {
                process_id: process_id.clone(),
                end_of_lock_time,
            })
            .await;
        }

        let stored = match self.store_key_set(&next, lock_key).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(KeyError::LockLost),
            Err(error) => Err(error),
        };
        if let Err(error) = stored {
            tracing::warn!(error = %error, "Failed to store rotated key set");
            if announced {
                self.publish_logged(&RotationMessage::CancelPendingJwksUpdate { process_id }).await;
            }
            return RotationOutcome::Failed(error);
        }

        let next = Arc::new(next);
        self.adopt(Arc::clone(&next), Source::Rotation);
        match serde_json::to_string(&*next) {
            Ok(serialized_key_set) => {
                self.publish_logged(&RotationMessage::NewJwksAvailable { process_id, serialized_key_set })
                    .await;
            },
            Err(error) => tracing::warn!(error = %error, "Failed to encode key set broadcast"),
        }

        tracing::info!(
            audit.action = "key_rotation",
            kid = %next.current.kid,
            generation = next.generation,
            current_start = ?next.current_start,
            prev_expire = ?next.prev_expire,
            "audit_event"
        );
        RotationOutcome::Rotated(next)
    }

    async fn store_key_set(&self, key_set: &KeySet, lock_key: &str) -> Result<bool> {
        fail::fail_point!("rotation-before-store", |_| {
            Err(KeyError::Transport(TransportError::internal("injected store failure")))
        });
        Ok(self.transport.store_json(&self.namespace.key_set(), key_set, None, Some(lock_key)).await?)
    }

    async fn listen(
        self: Arc<Self>,
        mut subscription: Subscription,
        mut lifecycle: broadcast::Receiver<ConnectionEvent>,
    ) {
        let mut ticker = self.config.rotation_interval().map(|period| {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker
        });
        let mut lifecycle_open = true;

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                message = subscription.recv() => match message {
                    Some(envelope) => self.handle_envelope(envelope).await,
                    None => {
                        tracing::warn!("Rotation channel closed");
                        break;
                    },
                },
                event = lifecycle.recv(), if lifecycle_open => match event {
                    Ok(event) if event.requires_resync() => self.resync_logged("reconnect").await,
                    Ok(event) => tracing::debug!(%event, "Transport lifecycle event"),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Missed lifecycle events");
                        self.resync_logged("lifecycle lag").await;
                    },
                    Err(broadcast::error::RecvError::Closed) => lifecycle_open = false,
                },
                () = next_tick(&mut ticker) => {
                    let outcome = self.rotate().await;
                    tracing::debug!(rotated = outcome.is_rotated(), "Scheduled rotation finished");
                },
            }
        }

        if let Err(error) = self.transport.unsubscribe(subscription).await {
            tracing::debug!(error = %error, "Failed to unsubscribe from rotation channel");
        }
    }

    async fn handle_envelope(self: &Arc<Self>, envelope: Envelope) {
        let message = match decode_payload::<RotationMessage>(&envelope) {
            Ok(message) => message,
            Err(error) => {
                tracing::warn!(sender_id = %envelope.sender_id, error = %error, "Dropping malformed rotation message");
                return;
            },
        };
        tracing::debug!(sender_id = %envelope.sender_id, event = message.event(), "Rotation message received");

        match message {
            RotationMessage::PendingJwksUpdate { process_id, end_of_lock_time } => {
                self.track_pending(process_id, envelope.sender_id, end_of_lock_time);
            },
            RotationMessage::CancelPendingJwksUpdate { process_id } => {
                if self.clear_pending(&process_id) {
                    tracing::debug!(process_id = %process_id, "Announced rotation cancelled");
                }
            },
            RotationMessage::NewJwksAvailable { process_id, serialized_key_set } => {
                self.clear_pending(&process_id);
                match serde_json::from_str::<KeySet>(&serialized_key_set) {
                    Ok(key_set) => {
                        self.adopt(Arc::new(key_set), Source::Broadcast);
                    },
                    Err(error) => {
                        tracing::warn!(process_id = %process_id, error = %error, "Dropping undecodable key set; re-reading store");
                        self.resync_logged("undecodable broadcast").await;
                    },
                }
            },
            RotationMessage::RequestUpdateSystemJwks { listening_channel, request_time, job_name } => {
                let age = self.clock.now_millis() - request_time;
                if age > self.config.request_max_age().as_millis() as i64 {
                    tracing::debug!(age_ms = age, "Ignoring stale rotation request");
                    return;
                }
                let job = tokio::spawn(Arc::clone(self).run_job(listening_channel, job_name));
                let mut jobs = self.jobs.lock();
                jobs.retain(|job| !job.is_finished());
                jobs.push(job);
            },
            RotationMessage::RequestActiveKey { listening_channel } => {
                let Some(public_key_md5) = self.active_digest() else {
                    tracing::debug!("No active key to report");
                    return;
                };
                let reply = RotationMessage::ServerActiveKey { public_key_md5 };
                if let Err(error) = self.transport.publish_json(&listening_channel, &reply).await {
                    tracing::warn!(error = %error, "Failed to report active key");
                }
            },
            RotationMessage::ServerActiveKey { .. } | RotationMessage::JobStatus { .. } => {},
            RotationMessage::Unknown => {
                tracing::debug!(sender_id = %envelope.sender_id, "Dropping rotation message with unknown event");
            },
        }
    }

    /// Records an announced remote rotation and arms its fallback re-read
    /// for when the announcer's lock expires.
    fn track_pending(self: &Arc<Self>, process_id: String, sender_id: String, lock_expiration: i64) {
        // Bounded so a skewed or corrupt expiry cannot postpone the re-read indefinitely.
        let delay = until_millis(self.clock.as_ref(), lock_expiration).min(self.config.lock_ttl() * 2);
        let inner = Arc::clone(self);
        let id = process_id.clone();
        let timer = tokio::spawn(async move {
            sleep(delay).await;
            if inner.pending.lock().remove(&id).is_some() {
                tracing::info!(process_id = %id, "Announced rotation outcome not received; re-reading store");
                inner.resync_logged("pending rotation fallback").await;
            }
        });

        tracing::debug!(process_id = %process_id, sender_id = %sender_id, lock_expiration, "Tracking announced rotation");
        let replaced =
            self.pending.lock().insert(process_id, PendingRotation { sender_id, lock_expiration, timer });
        if let Some(replaced) = replaced {
            replaced.timer.abort();
        }
    }

    fn clear_pending(&self, process_id: &str) -> bool {
        match self.pending.lock().remove(process_id) {
            Some(pending) => {
                pending.timer.abort();
                tracing::trace!(
                    process_id,
                    sender_id = %pending.sender_id,
                    lock_expiration = pending.lock_expiration,
                    "Cleared announced rotation"
                );
                true
            },
            None => false,
        }
    }

    /// Runs a requested rotation, reporting progress on `channel`.
    async fn run_job(self: Arc<Self>, channel: String, job_name: Option<String>) {
        let report = |status: JobStatus| RotationMessage::JobStatus {
            process_id: self.transport.sender_id().to_owned(),
            job_name: job_name.clone(),
            status,
        };
        let send = |message: RotationMessage| {
            let channel = channel.clone();
            let inner = Arc::clone(&self);
            async move {
                if let Err(error) = inner.transport.publish_json(&channel, &message).await {
                    tracing::warn!(error = %error, "Failed to report rotation job status");
                }
            }
        };

        send(report(JobStatus::Started)).await;
        let heartbeat_every = self.config.job_heartbeat();
        let mut heartbeat = interval_at(Instant::now() + heartbeat_every, heartbeat_every);
        let rotation = self.rotate();
        tokio::pin!(rotation);
        let outcome = loop {
            tokio::select! {
                outcome = &mut rotation => break outcome,
                _ = heartbeat.tick() => send(report(JobStatus::Heartbeat)).await,
            }
        };

        let status = match outcome {
            RotationOutcome::Rotated(_) => JobStatus::Finished { rotated: true },
            RotationOutcome::Skipped { .. } | RotationOutcome::Busy => JobStatus::Finished { rotated: false },
            RotationOutcome::Failed(error) => JobStatus::Fatal { reason: error.to_string() },
        };
        tracing::info!(job_name = ?job_name, ?status, "Rotation job finished");
        send(report(status)).await;
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        },
        None => std::future::pending().await,
    }
}
