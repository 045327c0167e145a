//! Error types for the Redis transport.
//!
//! Redis client errors are mapped onto the shared
//! [`TransportError`] categories so the coordination protocols treat a
//! Redis outage like any other transport failure.

use connector_cluster_transport::{ConfigError, TransportError};
use redis::RedisError;
use thiserror::Error;

/// Result type alias for Redis transport setup.
pub type Result<T> = std::result::Result<T, RedisTransportError>;

/// Errors raised while setting up a [`RedisTransport`](crate::RedisTransport).
#[derive(Debug, Error)]
pub enum RedisTransportError {
    /// Error from the Redis client.
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The server did not answer within the connect timeout.
    #[error("Timed out connecting to Redis")]
    ConnectTimeout,
}

impl From<RedisTransportError> for TransportError {
    fn from(err: RedisTransportError) -> Self {
        match err {
            RedisTransportError::Redis(source) => map_redis_error(source, "connect"),
            RedisTransportError::Config(source) => {
                TransportError::internal_with_source("invalid Redis transport configuration", source)
            },
            RedisTransportError::ConnectTimeout => TransportError::timeout(),
        }
    }
}

/// Whether `err` means the connection is gone and must be re-established.
pub(crate) fn is_connection_loss(err: &RedisError) -> bool {
    err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal()
}

/// Converts a Redis error raised by `operation` to a transport error.
pub(crate) fn map_redis_error(err: RedisError, operation: &str) -> TransportError {
    if err.is_timeout() {
        tracing::warn!(operation, "Redis operation timed out");
        TransportError::timeout()
    } else if is_connection_loss(&err) {
        TransportError::connection_with_source(format!("Redis {operation} failed: connection lost"), err)
    } else {
        TransportError::internal_with_source(format!("Redis {operation} failed"), err)
    }
}

/// Converts an error raised by a server-side script.
pub(crate) fn map_script_error(err: RedisError, script: &str) -> TransportError {
    if err.is_timeout() || is_connection_loss(&err) {
        map_redis_error(err, script)
    } else {
        TransportError::script(format!("{script}: {err}"))
    }
}
