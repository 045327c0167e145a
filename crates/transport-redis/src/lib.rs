//! Redis-backed [`ClusterTransport`](connector_cluster_transport::ClusterTransport)
//! for connector clusters.
//!
//! [`RedisTransport`] maps the transport primitives onto one Redis server:
//! advisory locks are `SET NX PX` records, owner-checked operations run as
//! Lua scripts, and broadcasts travel over Redis pub/sub wrapped in the
//! shared envelope format. Connection loss is reported through the
//! transport's lifecycle stream so the cache and key rotation layers can
//! re-read shared state after a reconnect.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │            ClusterCache │ KeyRotationCoordinator            │
//! ├─────────────────────────────────────────────────────────────┤
//! │                     RedisTransport                          │
//! │   command connection (multiplexed) │ pattern subscriber     │
//! ├─────────────────────────────────────────────────────────────┤
//! │                      Redis server                           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! // Requires a running Redis server.
//! use std::time::Duration;
//! use connector_cluster_transport::ClusterTransport;
//! use connector_cluster_transport_redis::{RedisTransport, RedisTransportConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RedisTransportConfig::builder()
//!         .url("redis://127.0.0.1:6379")
//!         .prefix("connector")
//!         .build()?;
//!     let transport = RedisTransport::connect(config).await?;
//!
//!     if transport.lock("connector:jobs", Duration::from_secs(30), false).await? {
//!         transport.unlock("connector:jobs", transport.sender_id(), false).await?;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Feature Flags
//!
//! - **`testutil`**: Enables the `testutil` module (per-test prefixes and
//!   connection helpers).
//! - **`redis-tests`**: Enables integration tests against `$REDIS_URL`.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Transport configuration.
pub mod config;
/// Error types and Redis error mapping.
pub mod error;
mod retry;
/// Server-side scripts.
pub mod scripts;
#[cfg(any(test, feature = "testutil"))]
pub mod testutil;
/// The Redis transport.
pub mod transport;

pub use config::RedisTransportConfig;
pub use error::{RedisTransportError, Result};
pub use transport::RedisTransport;
