//! Transport error types and result alias.
//!
//! Every cluster transport maps its backend failures onto [`TransportError`].
//! Components built on the transport (caches, key rotation) absorb these
//! errors at their own boundary: a failed lock, write or publish is logged and
//! treated as "someone else is handling it", never surfaced to callers.
//!
//! # Example
//!
//! ```
//! use connector_cluster_transport::{TransportError, TransportResult};
//!
//! fn read(key: &str) -> TransportResult<Vec<u8>> {
//!     Err(TransportError::connection(format!("store unreachable while reading {key}")))
//! }
//!
//! assert!(read("a").unwrap_err().is_transient());
//! ```

use std::sync::Arc;

use thiserror::Error;

/// A boxed error type for source chain tracking.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync>;

/// Result type alias for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors that can occur while talking to the shared store or message bus.
///
/// # Non-exhaustive
///
/// New variants may be added in minor releases. Downstream match expressions
/// must include a wildcard arm (`_ =>`).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    /// Network or connection failure (refused, reset, reconnecting).
    #[error("Connection error: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
        /// The underlying error.
        #[source]
        source: Option<BoxError>,
    },

    /// A value or message could not be encoded or decoded.
    #[error("Serialization error: {message}")]
    Serialization {
        /// Description of the serialization error.
        message: String,
        /// The underlying error.
        #[source]
        source: Option<BoxError>,
    },

    /// A server-side script (guarded write, owner-checked unlock) failed.
    #[error("Script error: {message}")]
    Script {
        /// Description of the script failure.
        message: String,
    },

    /// Backend-specific failure that fits no other category.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
        /// The underlying error.
        #[source]
        source: Option<BoxError>,
    },

    /// The operation exceeded its time limit.
    #[error("Operation timeout")]
    Timeout,

    /// The transport has been shut down.
    #[error("Transport closed")]
    Closed,
}

impl TransportError {
    /// Creates a new `Connection` error with the given message.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into(), source: None }
    }

    /// Creates a new `Connection` error with a message and source error.
    #[must_use]
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Serialization` error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization { message: message.into(), source: None }
    }

    /// Creates a new `Serialization` error with a message and source error.
    #[must_use]
    pub fn serialization_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Serialization { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Script` error.
    #[must_use]
    pub fn script(message: impl Into<String>) -> Self {
        Self::Script { message: message.into() }
    }

    /// Creates a new `Internal` error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into(), source: None }
    }

    /// Creates a new `Internal` error with a message and source error.
    #[must_use]
    pub fn internal_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Internal { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Timeout` error.
    #[must_use]
    pub fn timeout() -> Self {
        Self::Timeout
    }

    /// Returns `true` for failures that may succeed when retried later
    /// (connection loss and timeouts).
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout)
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization_with_source("JSON encoding failed", err)
    }
}

/// Configuration validation errors shared by the cluster crates.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A numeric or duration field is below its allowed minimum.
    #[error("{field} must be at least {min}, got {value}")]
    BelowMinimum {
        /// Name of the offending field.
        field: &'static str,
        /// The rejected value, rendered for display.
        value: String,
        /// The minimum allowed value, rendered for display.
        min: String,
    },

    /// A required string field is empty.
    #[error("{field} must not be empty")]
    Empty {
        /// Name of the offending field.
        field: &'static str,
    },

    /// Two fields are inconsistent with each other.
    #[error("{message}")]
    Inconsistent {
        /// Explanation of the inconsistency.
        message: String,
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(TransportError::connection("reset").is_transient());
        assert!(TransportError::timeout().is_transient());
        assert!(!TransportError::serialization("bad json").is_transient());
        assert!(!TransportError::script("NOSCRIPT").is_transient());
        assert!(!TransportError::Closed.is_transient());
    }

    #[test]
    fn test_source_chain_preserved() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = TransportError::connection_with_source("connect failed", io);
        let source = err.source().expect("source should be kept");
        assert_eq!(source.to_string(), "refused");
    }

    #[test]
    fn test_json_error_conversion() {
        let parse = serde_json::from_str::<u32>("not-a-number").unwrap_err();
        let err = TransportError::from(parse);
        assert!(matches!(err, TransportError::Serialization { .. }));
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::BelowMinimum {
            field: "lock_ttl",
            value: "0ms".to_owned(),
            min: "1s".to_owned(),
        };
        assert_eq!(err.to_string(), "lock_ttl must be at least 1s, got 0ms");
    }
}
