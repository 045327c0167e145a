//! # Connector Cluster Keys
//!
//! Cluster-wide signing key rotation for connector processes.
//!
//! Every process holds the same [`KeySet`]: the key it signs with and, for a
//! grace window after each rotation, the key that was replaced. The key set
//! lives in the shared store; [`KeyRotationCoordinator`] keeps a local copy
//! current through broadcasts, activation timers, fallback re-reads and
//! reconnect resyncs.
//!
//! ## Guarantees
//!
//! - At most one process rotates at a time (rotation lock)
//! - A rotation never replaces a key set whose new key is not yet active or
//!   whose previous key is still verifiable
//! - New keys become active `start_delay` after the rotation, so peers
//!   publish them for verification before anyone signs with them
//! - A lost broadcast delays convergence by at most the lock TTL
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use connector_cluster_keys::{KeyRotationCoordinator, RotationConfig};
//! use connector_cluster_transport::MemoryCluster;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let cluster = MemoryCluster::new();
//! let keys = KeyRotationCoordinator::start(Arc::new(cluster.connect()), RotationConfig::default()).await?;
//! keys.generate_keys().await?;
//!
//! let signing = keys.active_keys().await?;
//! let jwks = keys.public_keys().await?;
//! println!("signing with {}, publishing {} keys", signing.kid, jwks.len());
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Rotation configuration.
pub mod config;
/// Rotation coordinator.
pub mod coordinator;
/// Key rotation error types.
pub mod error;
/// Key pair generation.
pub mod generator;
/// Signing key pairs and key sets.
pub mod key_set;
/// Rotation protocol messages.
pub mod messages;
#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use config::RotationConfig;
pub use coordinator::{KeyRotationCoordinator, RotationOutcome};
pub use error::{KeyError, Result};
pub use generator::{Ed25519KeyGenerator, KeyGenerator, key_pair_from_signing_key};
pub use key_set::{ALGORITHM_EDDSA, KeyPair, KeySet, PublicJwk, RotationBlock};
pub use messages::{JobStatus, RotationMessage};
