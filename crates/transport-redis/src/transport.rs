//! [`ClusterTransport`] over a Redis server.
//!
//! # Layout
//!
//! - Locks are `SET key owner PX ttl [NX]` records whose value is the
//!   owner's sender id.
//! - Owner-checked unlock and guarded writes run as Lua scripts
//!   (see [`scripts`](crate::scripts)).
//! - One pattern subscription (`<prefix>:*`) receives every channel of the
//!   deployment; incoming envelopes fan out to local listeners through a
//!   [`ListenerRegistry`].
//!
//! # Reconnects
//!
//! Commands share one multiplexed connection. When a command fails because
//! the connection is gone, the transport reports `Reconnecting` and the
//! next command reconnects, reporting `Ready`. The subscriber connection is
//! supervised by a background task that reconnects with exponential backoff
//! and reports `SubscriberReconnected`, after which dependents re-read
//! shared state to cover broadcasts missed in between.

use std::{
    future::Future,
    pin::pin,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use connector_cluster_transport::{
    ClusterTransport, ConnectionEvent, Envelope, LifecycleHub, ListenerRegistry, Namespace,
    Subscription, TransportError, TransportResult,
};
use futures::StreamExt;
use redis::{
    Client, RedisError, RedisResult,
    aio::{MultiplexedConnection, PubSub},
};
use tokio::{
    sync::{Mutex as AsyncMutex, broadcast},
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    config::RedisTransportConfig,
    error::{RedisTransportError, Result, is_connection_loss, map_redis_error, map_script_error},
    retry::Backoff,
    scripts::{Scripts, ttl_arg},
};

type ErrorMapper = fn(RedisError, &str) -> TransportError;

struct Inner {
    client: Client,
    config: RedisTransportConfig,
    sender_id: String,
    channel_prefix: String,
    connection: AsyncMutex<Option<MultiplexedConnection>>,
    connected: AtomicBool,
    listeners: Arc<ListenerRegistry>,
    lifecycle: LifecycleHub,
    scripts: Scripts,
    cancel: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// One process's connection to a Redis-backed cluster.
///
/// Cheaply cloneable; clones share connections and listeners. The
/// subscriber task stops when the last clone is dropped or on
/// [`shutdown`](Self::shutdown).
///
/// # Example
///
/// ```no_run
/// use connector_cluster_transport::ClusterTransport;
/// use connector_cluster_transport_redis::{RedisTransport, RedisTransportConfig};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = RedisTransportConfig::builder().url("redis://127.0.0.1:6379").build()?;
/// let transport = RedisTransport::connect(config).await?;
/// println!("connected as {}", transport.sender_id());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RedisTransport {
    inner: Arc<Inner>,
}

impl RedisTransport {
    /// Connects the command and subscriber connections.
    ///
    /// Fails fast: the server must be reachable now. Later outages are
    /// handled by reconnecting.
    ///
    /// # Errors
    ///
    /// Returns [`RedisTransportError`] if the configuration is invalid or
    /// either connection cannot be established within the connect timeout.
    #[tracing::instrument(skip(config), fields(prefix = config.prefix()))]
    pub async fn connect(config: RedisTransportConfig) -> Result<Self> {
        config.validate()?;
        let client = Client::open(config.url())?;
        let namespace = Namespace::new(config.prefix());
        let pattern = namespace.channel_pattern();

        let connection = open_connection(&client, config.connect_timeout()).await?;
        let pubsub = open_pubsub(&client, &pattern, config.connect_timeout()).await?;

        let sender_id = config.sender_id().map_or_else(|| Uuid::new_v4().to_string(), str::to_owned);
        let listeners = Arc::new(ListenerRegistry::new());
        let lifecycle = LifecycleHub::new();
        let cancel = CancellationToken::new();

        let subscriber = Subscriber {
            client: client.clone(),
            pattern,
            listeners: Arc::clone(&listeners),
            lifecycle: lifecycle.clone(),
            backoff: Backoff::new(config.reconnect_initial_backoff(), config.reconnect_max_backoff()),
            connect_timeout: config.connect_timeout(),
            cancel: cancel.clone(),
        };
        tokio::spawn(subscriber.run(pubsub));

        tracing::info!(sender_id = %sender_id, "Connected to Redis");
        lifecycle.emit(ConnectionEvent::Ready);

        Ok(Self {
            inner: Arc::new(Inner {
                client,
                channel_prefix: format!("{}:", namespace.prefix()),
                config,
                sender_id,
                connection: AsyncMutex::new(Some(connection)),
                connected: AtomicBool::new(true),
                listeners,
                lifecycle,
                scripts: Scripts::new(),
                cancel,
            }),
        })
    }

    /// The configuration this transport was built from.
    #[must_use]
    pub fn config(&self) -> &RedisTransportConfig {
        &self.inner.config
    }

    /// Stops the subscriber task. Commands keep working; local listeners
    /// receive nothing further.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }

    fn check_channel(&self, channel: &str) -> TransportResult<()> {
        if channel.starts_with(&self.inner.channel_prefix) {
            Ok(())
        } else {
            Err(TransportError::internal(format!(
                "channel {channel} is outside the subscribed prefix {}",
                self.inner.channel_prefix
            )))
        }
    }
}

impl std::fmt::Debug for RedisTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisTransport")
            .field("sender_id", &self.inner.sender_id)
            .field("prefix", &self.inner.config.prefix())
            .field("connected", &self.inner.connected.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Inner {
    /// Returns the command connection, reconnecting if it was lost.
    async fn connection(&self) -> TransportResult<MultiplexedConnection> {
        let mut slot = self.connection.lock().await;
        if let Some(connection) = slot.as_ref() {
            return Ok(connection.clone());
        }
        let connection = open_connection(&self.client, self.config.connect_timeout()).await?;
        *slot = Some(connection.clone());
        if !self.connected.swap(true, Ordering::SeqCst) {
            tracing::info!("Redis command connection re-established");
            self.lifecycle.emit(ConnectionEvent::Ready);
        }
        Ok(connection)
    }

    async fn connection_lost(&self, err: &RedisError) {
        self.connection.lock().await.take();
        if self.connected.swap(false, Ordering::SeqCst) {
            tracing::warn!(error = %err, "Redis command connection lost");
            self.lifecycle.emit(ConnectionEvent::Reconnecting);
        }
    }

    /// Runs one command under the command timeout.
    async fn execute<T, F, Fut>(&self, operation: &'static str, map_err: ErrorMapper, command: F) -> TransportResult<T>
    where
        F: FnOnce(MultiplexedConnection) -> Fut + Send,
        Fut: Future<Output = RedisResult<T>> + Send,
    {
        let connection = self.connection().await?;
        match timeout(self.config.command_timeout(), command(connection)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => {
                if is_connection_loss(&err) {
                    self.connection_lost(&err).await;
                }
                Err(map_err(err, operation))
            },
            Err(_) => {
                tracing::warn!(operation, "Redis command timed out");
                Err(TransportError::timeout())
            },
        }
    }
}

#[async_trait]
impl ClusterTransport for RedisTransport {
    fn sender_id(&self) -> &str {
        &self.inner.sender_id
    }

    #[tracing::instrument(skip(self), fields(sender = %self.inner.sender_id))]
    async fn lock(&self, key: &str, ttl: Duration, force: bool) -> TransportResult<bool> {
        let mut command = redis::cmd("SET");
        command.arg(key).arg(&self.inner.sender_id).arg("PX").arg(ttl_arg(Some(ttl)));
        if !force {
            command.arg("NX");
        }
        let reply: Option<String> = self
            .inner
            .execute("lock", map_redis_error, |mut connection| async move {
                command.query_async(&mut connection).await
            })
            .await?;
        Ok(reply.is_some())
    }

    #[tracing::instrument(skip(self, owner_token), fields(sender = %self.inner.sender_id))]
    async fn unlock(&self, key: &str, owner_token: &str, force: bool) -> TransportResult<bool> {
        let script = &self.inner.scripts.unlock;
        let deleted: i64 = self
            .inner
            .execute("unlock", map_script_error, |mut connection| async move {
                script
                    .key(key)
                    .arg(owner_token)
                    .arg(if force { "1" } else { "0" })
                    .invoke_async(&mut connection)
                    .await
            })
            .await?;
        Ok(deleted == 1)
    }

    async fn get(&self, key: &str) -> TransportResult<Option<Bytes>> {
        let value: Option<Vec<u8>> = self
            .inner
            .execute("get", map_redis_error, |mut connection| async move {
                redis::cmd("GET").arg(key).query_async(&mut connection).await
            })
            .await?;
        Ok(value.map(Bytes::from))
    }

    #[tracing::instrument(skip(self, value), fields(sender = %self.inner.sender_id, len = value.len()))]
    async fn store(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
        guard_lock_key: Option<&str>,
    ) -> TransportResult<bool> {
        let Some(lock_key) = guard_lock_key else {
            let mut command = redis::cmd("SET");
            command.arg(key).arg(value.as_slice());
            if let Some(ttl) = ttl {
                command.arg("PX").arg(ttl_arg(Some(ttl)));
            }
            let () = self
                .inner
                .execute("store", map_redis_error, |mut connection| async move {
                    command.query_async(&mut connection).await
                })
                .await?;
            return Ok(true);
        };

        let script = &self.inner.scripts.guarded_store;
        let owner = &self.inner.sender_id;
        let written: i64 = self
            .inner
            .execute("guarded store", map_script_error, |mut connection| async move {
                script
                    .key(lock_key)
                    .key(key)
                    .arg(owner)
                    .arg(value.as_slice())
                    .arg(ttl_arg(ttl))
                    .invoke_async(&mut connection)
                    .await
            })
            .await?;
        if written == 0 {
            tracing::debug!(key, "guarded store rejected: lock not owned");
        }
        Ok(written == 1)
    }

    #[tracing::instrument(skip(self), fields(sender = %self.inner.sender_id))]
    async fn remove(&self, key: &str, guard_lock_key: Option<&str>) -> TransportResult<bool> {
        let Some(lock_key) = guard_lock_key else {
            let _removed: i64 = self
                .inner
                .execute("remove", map_redis_error, |mut connection| async move {
                    redis::cmd("DEL").arg(key).query_async(&mut connection).await
                })
                .await?;
            return Ok(true);
        };

        let script = &self.inner.scripts.guarded_remove;
        let owner = &self.inner.sender_id;
        let removed: i64 = self
            .inner
            .execute("guarded remove", map_script_error, |mut connection| async move {
                script.key(lock_key).key(key).arg(owner).invoke_async(&mut connection).await
            })
            .await?;
        if removed == 0 {
            tracing::debug!(key, "guarded remove rejected: lock not owned");
        }
        Ok(removed == 1)
    }

    async fn publish(&self, channel: &str, data: serde_json::Value) -> TransportResult<()> {
        self.check_channel(channel)?;
        let payload = Envelope::new(self.inner.sender_id.as_str(), data).encode()?;
        let receivers: i64 = self
            .inner
            .execute("publish", map_redis_error, |mut connection| async move {
                redis::cmd("PUBLISH").arg(channel).arg(payload).query_async(&mut connection).await
            })
            .await?;
        tracing::trace!(channel, receivers, "message published");
        Ok(())
    }

    async fn subscribe(&self, channel: &str, ignore_self: bool) -> TransportResult<Subscription> {
        self.check_channel(channel)?;
        let ignore = ignore_self.then(|| self.inner.sender_id.clone());
        Ok(self.inner.listeners.register(channel, ignore))
    }

    async fn unsubscribe(&self, subscription: Subscription) -> TransportResult<()> {
        if !self.inner.listeners.remove(subscription.channel(), subscription.id()) {
            return Err(TransportError::internal(format!(
                "subscription {} not registered on {}",
                subscription.id(),
                subscription.channel()
            )));
        }
        Ok(())
    }

    fn lifecycle(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.lifecycle.subscribe()
    }
}

async fn open_connection(client: &Client, limit: Duration) -> Result<MultiplexedConnection> {
    timeout(limit, client.get_multiplexed_async_connection())
        .await
        .map_err(|_| RedisTransportError::ConnectTimeout)?
        .map_err(RedisTransportError::from)
}

async fn open_pubsub(client: &Client, pattern: &str, limit: Duration) -> Result<PubSub> {
    let connect = async {
        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.psubscribe(pattern).await?;
        Ok::<_, RedisError>(pubsub)
    };
    timeout(limit, connect)
        .await
        .map_err(|_| RedisTransportError::ConnectTimeout)?
        .map_err(RedisTransportError::from)
}

/// Supervises the pattern subscription and feeds local listeners.
struct Subscriber {
    client: Client,
    pattern: String,
    listeners: Arc<ListenerRegistry>,
    lifecycle: LifecycleHub,
    backoff: Backoff,
    connect_timeout: Duration,
    cancel: CancellationToken,
}

impl Subscriber {
    async fn run(self, first: PubSub) {
        let mut pubsub = Some(first);
        let mut attempt = 0u32;
        loop {
            if let Some(connection) = pubsub.take() {
                attempt = 0;
                let mut messages = pin!(connection.into_on_message());
                loop {
                    tokio::select! {
                        () = self.cancel.cancelled() => return,
                        message = messages.next() => match message {
                            Some(message) => self.dispatch(&message),
                            None => break,
                        },
                    }
                }
                tracing::warn!(pattern = %self.pattern, "Redis subscriber connection lost");
                self.lifecycle.emit(ConnectionEvent::Reconnecting);
            }

            let delay = self.backoff.delay(attempt);
            attempt = attempt.saturating_add(1);
            tokio::select! {
                () = self.cancel.cancelled() => return,
                () = sleep(delay) => {},
            }

            match open_pubsub(&self.client, &self.pattern, self.connect_timeout).await {
                Ok(connection) => {
                    tracing::info!(attempt, "Redis subscriber reconnected");
                    self.lifecycle.emit(ConnectionEvent::SubscriberReconnected);
                    pubsub = Some(connection);
                },
                Err(error) => {
                    tracing::warn!(attempt, error = %error, "Redis subscriber reconnect failed");
                    self.lifecycle.emit(ConnectionEvent::Error(error.to_string()));
                },
            }
        }
    }

    fn dispatch(&self, message: &redis::Msg) {
        let channel = message.get_channel_name();
        let payload: String = match message.get_payload() {
            Ok(payload) => payload,
            Err(error) => {
                tracing::warn!(channel, error = %error, "Dropping non-text broadcast");
                return;
            },
        };
        match Envelope::decode(&payload) {
            Ok(envelope) => {
                let delivered = self.listeners.dispatch(channel, &envelope);
                tracing::trace!(channel, delivered, "message received");
            },
            Err(error) => tracing::warn!(channel, error = %error, "Dropping malformed broadcast"),
        }
    }
}
