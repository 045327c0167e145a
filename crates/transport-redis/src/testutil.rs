//! Shared test utilities for Redis transport testing.
//!
//! Feature-gated behind `testutil` so it never leaks into production builds.
//! Tests need a live server at `$REDIS_URL` (default
//! `redis://127.0.0.1:6379`); every helper isolates its keys and channels
//! under a fresh random prefix.
//!
//! ```no_run
//! // Requires the `testutil` feature to be enabled.
//! use connector_cluster_transport_redis::testutil::{unique_prefix, connect_process};
//! ```

use uuid::Uuid;

use crate::{config::RedisTransportConfig, error::Result, transport::RedisTransport};

/// Server URL used by tests.
#[must_use]
pub fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_owned())
}

/// A prefix no other test run shares.
#[must_use]
pub fn unique_prefix() -> String {
    format!("test-{}", Uuid::new_v4().simple())
}

/// Builds a test configuration for one simulated process.
///
/// # Errors
///
/// Returns the validation error for an unusable `$REDIS_URL`.
pub fn test_config(prefix: &str, sender_id: &str) -> Result<RedisTransportConfig> {
    Ok(RedisTransportConfig::builder().url(redis_url()).prefix(prefix).sender_id(sender_id).build()?)
}

/// Connects one simulated process under `prefix`.
///
/// # Errors
///
/// Returns the connection error when no server is reachable.
pub async fn connect_process(prefix: &str, sender_id: &str) -> Result<RedisTransport> {
    RedisTransport::connect(test_config(prefix, sender_id)?).await
}
