//! Connection lifecycle events.
//!
//! Transports report connection state changes so dependents can re-arm
//! subscriptions and re-read shared state: a subscriber that reconnects may
//! have missed broadcasts published while it was away.

use std::fmt;

use tokio::sync::broadcast;

/// Capacity of each lifecycle broadcast channel. Slow receivers that fall
/// behind see `Lagged` and should treat it like a reconnect.
pub const LIFECYCLE_CHANNEL_CAPACITY: usize = 64;

/// A connection state change reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The command connection is established and usable.
    Ready,
    /// The connection dropped; the transport is trying to reconnect.
    Reconnecting,
    /// A connection-level error occurred.
    Error(String),
    /// The pub/sub connection came back; messages may have been missed.
    SubscriberReconnected,
}

impl ConnectionEvent {
    /// Returns `true` for events after which shared state should be re-read.
    #[must_use]
    pub fn requires_resync(&self) -> bool {
        matches!(self, Self::Ready | Self::SubscriberReconnected)
    }
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => f.write_str("READY"),
            Self::Reconnecting => f.write_str("RECONNECTING"),
            Self::Error(message) => write!(f, "ERROR: {message}"),
            Self::SubscriberReconnected => f.write_str("SUBSCRIBER_RECONNECTED"),
        }
    }
}

/// Broadcast hub for one transport's lifecycle events.
#[derive(Debug, Clone)]
pub struct LifecycleHub {
    tx: broadcast::Sender<ConnectionEvent>,
}

impl LifecycleHub {
    /// Creates a hub with [`LIFECYCLE_CHANNEL_CAPACITY`].
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(LIFECYCLE_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publishes an event. Having no receivers is not an error.
    pub fn emit(&self, event: ConnectionEvent) {
        tracing::debug!(event = %event, "connection lifecycle event");
        let _ = self.tx.send(event);
    }

    /// Returns a new receiver for subsequent events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.tx.subscribe()
    }
}

impl Default for LifecycleHub {
    fn default() -> Self {
        Self::new()
    }
}
