//! Shared test utilities for key rotation testing.
//!
//! Feature-gated behind `testutil` so it never leaks into production builds.
//!
//! ```toml
//! [dev-dependencies]
//! connector-cluster-keys = { path = "../keys", features = ["testutil"] }
//! ```

use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use async_trait::async_trait;
use connector_cluster_transport::{ClusterTransport, SharedClock};

use crate::{
    config::RotationConfig,
    coordinator::KeyRotationCoordinator,
    error::{KeyError, Result},
    generator::{KeyGenerator, key_pair_from_seed},
    key_set::KeyPair,
};

/// Generates deterministic Ed25519 keys named `{label}-1`, `{label}-2`, ...
///
/// Clones share the counter.
#[derive(Debug, Clone)]
pub struct SequenceKeyGenerator {
    label: Arc<str>,
    next: Arc<AtomicU32>,
}

impl SequenceKeyGenerator {
    /// Creates a generator whose kids start with `label`.
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self { label: Arc::from(label.into()), next: Arc::new(AtomicU32::new(1)) }
    }

    /// Number of keys generated so far.
    #[must_use]
    pub fn generated(&self) -> u32 {
        self.next.load(Ordering::SeqCst) - 1
    }
}

#[async_trait]
impl KeyGenerator for SequenceKeyGenerator {
    async fn generate(&self) -> Result<KeyPair> {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        let mut seed = [0u8; 32];
        seed[..4].copy_from_slice(&n.to_be_bytes());
        for (slot, byte) in seed[4..].iter_mut().zip(self.label.bytes().cycle()) {
            *slot = byte;
        }
        Ok(key_pair_from_seed(&format!("{}-{n}", self.label), seed))
    }
}

/// Generator that always fails, counting its calls.
#[derive(Debug, Clone, Default)]
pub struct FailingKeyGenerator {
    calls: Arc<AtomicU32>,
}

impl FailingKeyGenerator {
    /// Number of generation attempts made.
    #[must_use]
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeyGenerator for FailingKeyGenerator {
    async fn generate(&self) -> Result<KeyPair> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(KeyError::Generation("generator offline".into()))
    }
}

/// Default rotation timings with a short pause between cold-start attempts.
///
/// Windows: activation after 120s, previous key verifiable for 600s, lock
/// TTL 30s.
#[must_use]
pub fn test_config() -> RotationConfig {
    RotationConfig { attempt_delay: std::time::Duration::from_millis(50), ..RotationConfig::default() }
}

/// Starts a coordinator for one simulated process, using a
/// [`SequenceKeyGenerator`] labelled with the transport's sender id.
///
/// # Errors
///
/// Returns the subscription error from
/// [`KeyRotationCoordinator::start_with`].
pub async fn start_process(
    transport: Arc<dyn ClusterTransport>,
    config: RotationConfig,
    clock: SharedClock,
) -> Result<KeyRotationCoordinator> {
    let generator = Arc::new(SequenceKeyGenerator::new(transport.sender_id()));
    KeyRotationCoordinator::start_with(transport, config, generator, clock).await
}
