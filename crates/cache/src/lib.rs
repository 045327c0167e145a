//! Deduplicating caches for connector processes.
//!
//! Expensive upstream calls (token introspection, refresh-token exchange)
//! must not be repeated by every concurrent caller. This crate offers two
//! layers:
//!
//! - [`SingleFlightCache`]: inside one process, at most one computation per
//!   key runs at a time; concurrent callers wait for its result.
//! - [`ClusterCache`]: across the cluster, one process computes while the
//!   others read the shared store or receive the value by broadcast.
//!
//! Both report failures as "no value" (`None`) and log the cause.
//!
//! # Feature Flags
//!
//! - **`failpoints`**: Enables the `cluster-cache-before-store` fail point.
//! - **`testutil`**: Enables the transport crate's test utilities.

#![deny(unsafe_code)]

pub mod cluster;
pub mod config;
pub mod handler;
pub mod metrics;
pub mod single_flight;

pub use cluster::ClusterCache;
pub use config::{CacheConfig, CacheConfigBuilder, LockGranularity};
pub use handler::{Computed, FnMissHandler, MissError, MissHandler, MissResult, miss_fn};
pub use metrics::{CacheMetrics, CacheMetricsSnapshot};
pub use single_flight::SingleFlightCache;
