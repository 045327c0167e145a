//! Pub/sub envelope, subscriptions and the local listener registry.
//!
//! Every broadcast is wrapped in an [`Envelope`] carrying the publishing
//! transport's `senderId`, so subscribers can drop their own messages.
//! Delivery is best-effort and at-most-once; nothing built on top of this
//! module may depend on a message arriving.

use std::{collections::HashMap, sync::atomic::AtomicU64, sync::atomic::Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{TransportError, TransportResult};

/// Wire wrapper placed around every published message.
///
/// Serialized as `{"senderId": "...", "data": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Identity of the publishing transport.
    pub sender_id: String,
    /// Message payload.
    pub data: serde_json::Value,
}

impl Envelope {
    /// Creates a new envelope.
    pub fn new(sender_id: impl Into<String>, data: serde_json::Value) -> Self {
        Self { sender_id: sender_id.into(), data }
    }

    /// Encodes the envelope as JSON text.
    pub fn encode(&self) -> TransportResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes an envelope from JSON text.
    pub fn decode(raw: &str) -> TransportResult<Self> {
        serde_json::from_str(raw).map_err(|e| {
            TransportError::serialization_with_source("malformed pub/sub envelope", e)
        })
    }
}

/// Identifier of one local listener registration.
pub type SubscriptionId = u64;

/// A live subscription to one channel.
///
/// Messages are buffered locally until [`recv`](Self::recv) is called.
/// Dropping the subscription detaches it lazily; call the transport's
/// `unsubscribe` to detach eagerly.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    channel: String,
    ignore_sender: Option<String>,
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl Subscription {
    /// Wraps a registry receiver. `ignore_sender`, when set, filters out
    /// envelopes published by that sender.
    #[must_use]
    pub fn new(
        id: SubscriptionId,
        channel: impl Into<String>,
        ignore_sender: Option<String>,
        rx: mpsc::UnboundedReceiver<Envelope>,
    ) -> Self {
        Self { id, channel: channel.into(), ignore_sender, rx }
    }

    /// Registration id, used to unsubscribe.
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Channel this subscription listens on.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Waits for the next message not sent by an ignored sender.
    ///
    /// Returns `None` once the transport has dropped the registration.
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            let envelope = self.rx.recv().await?;
            if self.ignore_sender.as_deref() == Some(envelope.sender_id.as_str()) {
                continue;
            }
            return Some(envelope);
        }
    }

    /// Returns a buffered message without waiting, if one is available.
    pub fn try_recv(&mut self) -> Option<Envelope> {
        while let Ok(envelope) = self.rx.try_recv() {
            if self.ignore_sender.as_deref() != Some(envelope.sender_id.as_str()) {
                return Some(envelope);
            }
        }
        None
    }
}

/// Local fan-out table from channel name to subscribed listeners.
///
/// Backends deliver each incoming envelope through [`dispatch`](Self::dispatch);
/// listeners whose receiving side has been dropped are pruned on the way.
#[derive(Debug, Default)]
pub struct ListenerRegistry {
    next_id: AtomicU64,
    channels: Mutex<HashMap<String, Vec<(SubscriptionId, mpsc::UnboundedSender<Envelope>)>>>,
}

impl ListenerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener on `channel` and returns its subscription.
    pub fn register(&self, channel: &str, ignore_sender: Option<String>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels.lock().entry(channel.to_owned()).or_default().push((id, tx));
        Subscription::new(id, channel, ignore_sender, rx)
    }

    /// Removes a listener. Returns `true` if it was registered.
    pub fn remove(&self, channel: &str, id: SubscriptionId) -> bool {
        let mut channels = self.channels.lock();
        let Some(listeners) = channels.get_mut(channel) else {
            return false;
        };
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        let removed = listeners.len() != before;
        if listeners.is_empty() {
            channels.remove(channel);
        }
        removed
    }

    /// Delivers `envelope` to every listener on `channel`.
    ///
    /// Returns the number of listeners reached.
    pub fn dispatch(&self, channel: &str, envelope: &Envelope) -> usize {
        let mut channels = self.channels.lock();
        let Some(listeners) = channels.get_mut(channel) else {
            return 0;
        };
        listeners.retain(|(_, tx)| tx.send(envelope.clone()).is_ok());
        let delivered = listeners.len();
        if listeners.is_empty() {
            channels.remove(channel);
        }
        delivered
    }

    /// Number of listeners currently registered on `channel`.
    #[must_use]
    pub fn listener_count(&self, channel: &str) -> usize {
        self.channels.lock().get(channel).map_or(0, Vec::len)
    }

    /// Channels with at least one listener.
    #[must_use]
    pub fn channels(&self) -> Vec<String> {
        self.channels.lock().keys().cloned().collect()
    }
}
