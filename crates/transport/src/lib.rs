//! Shared store and message bus primitives for connector clusters.
//!
//! Every connector process talks to the same key/value store and pub/sub bus.
//! This crate provides the [`ClusterTransport`] trait that wraps both into
//! advisory locks, guarded writes and enveloped broadcasts, plus an
//! in-memory implementation used by tests and single-node deployments.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────┬──────────────────────────────┐
//! │        ClusterCache          │    KeyRotationCoordinator    │
//! │ (connector-cluster-cache)    │   (connector-cluster-keys)   │
//! ├──────────────────────────────┴──────────────────────────────┤
//! │                  connector-cluster-transport                │
//! │   ClusterTransport: lock / unlock / get / store / remove    │
//! │            publish / subscribe / lifecycle events           │
//! ├──────────────────────────────┬──────────────────────────────┤
//! │  MemoryCluster (testing)     │  RedisTransport (production) │
//! └──────────────────────────────┴──────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```
//! use std::time::Duration;
//! use connector_cluster_transport::{ClusterTransport, MemoryCluster, TransportExt};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cluster = MemoryCluster::new();
//!     let process = cluster.connect();
//!
//!     if process.lock("jobs", Duration::from_secs(30), false).await? {
//!         process.store_json("jobs:last", &42u32, None, Some("jobs")).await?;
//!         process.unlock("jobs", process.sender_id(), false).await?;
//!     }
//!
//!     let last: Option<u32> = process.get_json("jobs:last").await?;
//!     assert_eq!(last, Some(42));
//!     Ok(())
//! }
//! ```
//!
//! # Feature Flags
//!
//! - **`testutil`**: Enables the `testutil` module (tokio-anchored clock,
//!   multi-process cluster factory) and the `conformance` suite for
//!   transport implementations.

#![deny(unsafe_code)]

pub mod clock;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used, clippy::panic)]
pub mod conformance;
pub mod envelope;
pub mod error;
pub mod lifecycle;
pub mod lock;
pub mod memory;
pub mod namespace;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used)]
pub mod testutil;
pub mod transport;

pub use clock::{Clock, SharedClock, SystemClock, system_clock, until_millis};
pub use envelope::{Envelope, ListenerRegistry, Subscription, SubscriptionId};
pub use error::{BoxError, ConfigError, TransportError, TransportResult};
pub use lifecycle::{ConnectionEvent, LIFECYCLE_CHANNEL_CAPACITY, LifecycleHub};
pub use lock::LockGuard;
pub use memory::{MemoryCluster, MemoryTransport};
pub use namespace::{KEY_PROVIDER_TITLE, Namespace};
pub use transport::{ClusterTransport, TransportExt, decode_payload};
