//! Scoped ownership of an advisory lock.
//!
//! Coordination code takes a lock, awaits remote calls and then releases
//! it. Any of those awaits may be the last one: the enclosing future can be
//! dropped by a caller timeout or a cancelled task. [`LockGuard`] keeps the
//! release on every path.

use std::{sync::Arc, time::Duration};

use tokio::runtime::Handle;

use crate::{error::TransportResult, transport::ClusterTransport};

/// An acquired advisory lock.
///
/// [`release`](Self::release) unlocks in place and reports the outcome. A
/// guard dropped while still held spawns the owner-checked unlock on the
/// current tokio runtime; outside a runtime the lock is left to expire with
/// its TTL.
///
/// Ownership is the transport's `sender_id`, so the guard cannot tell apart
/// two holders inside one process. Code that may outlive the lock TTL must
/// not run concurrently with another holder of the same key in the same
/// process.
pub struct LockGuard {
    transport: Arc<dyn ClusterTransport>,
    key: String,
    held: bool,
}

impl LockGuard {
    /// Tries to take `key` for `ttl`.
    ///
    /// Returns `Ok(None)` when another owner holds the lock.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the lock attempt failed.
    pub async fn acquire(
        transport: Arc<dyn ClusterTransport>,
        key: impl Into<String>,
        ttl: Duration,
    ) -> TransportResult<Option<Self>> {
        let key = key.into();
        if transport.lock(&key, ttl, false).await? {
            Ok(Some(Self { transport, key, held: true }))
        } else {
            Ok(None)
        }
    }

    /// Takes `key` for `ttl`, overriding any current holder.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the lock write failed.
    pub async fn force(
        transport: Arc<dyn ClusterTransport>,
        key: impl Into<String>,
        ttl: Duration,
    ) -> TransportResult<Self> {
        let key = key.into();
        transport.lock(&key, ttl, true).await?;
        Ok(Self { transport, key, held: true })
    }

    /// The lock key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Releases the lock if this transport still owns it.
    ///
    /// Returns `Ok(false)` when the lock had already expired or been taken
    /// over.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the unlock failed; the lock then
    /// expires with its TTL.
    pub async fn release(mut self) -> TransportResult<bool> {
        let released = self.transport.unlock(&self.key, self.transport.sender_id(), false).await;
        self.held = false;
        released
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.held {
            return;
        }
        let key = std::mem::take(&mut self.key);
        match Handle::try_current() {
            Ok(handle) => {
                let transport = Arc::clone(&self.transport);
                handle.spawn(async move {
                    match transport.unlock(&key, transport.sender_id(), false).await {
                        Ok(released) => tracing::debug!(key = %key, released, "Released abandoned lock"),
                        Err(error) => tracing::warn!(key = %key, error = %error, "Failed to release abandoned lock"),
                    }
                });
            },
            Err(_) => tracing::warn!(key = %key, "Lock dropped outside a runtime; it expires with its TTL"),
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("owner", &self.transport.sender_id())
            .field("held", &self.held)
            .finish()
    }
}
