//! Configuration for the Redis transport.

use std::time::Duration;

use connector_cluster_transport::ConfigError;
use serde::{Deserialize, Serialize};

/// Default deployment prefix.
const DEFAULT_PREFIX: &str = "connector";

/// Default per-command timeout (5 seconds).
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Default connection establishment timeout (5 seconds).
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default first reconnect delay.
const DEFAULT_RECONNECT_INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Default reconnect delay ceiling.
const DEFAULT_RECONNECT_MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Configuration for [`RedisTransport`](crate::RedisTransport).
///
/// # Example
///
/// ```no_run
/// use connector_cluster_transport_redis::RedisTransportConfig;
///
/// let config = RedisTransportConfig::builder()
///     .url("redis://127.0.0.1:6379")
///     .prefix("oidc")
///     .build()?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedisTransportConfig {
    /// Server URL (`redis://` or `rediss://`).
    pub(crate) url: String,

    /// Deployment prefix; the transport receives every channel under it.
    #[serde(default = "default_prefix")]
    pub(crate) prefix: String,

    /// Identity of this process; a random UUID when absent.
    #[serde(default)]
    pub(crate) sender_id: Option<String>,

    /// Time limit for each command.
    #[serde(with = "humantime_serde", default = "default_command_timeout")]
    pub(crate) command_timeout: Duration,

    /// Time limit for establishing a connection.
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub(crate) connect_timeout: Duration,

    /// First delay before reconnecting the subscriber.
    #[serde(with = "humantime_serde", default = "default_reconnect_initial_backoff")]
    pub(crate) reconnect_initial_backoff: Duration,

    /// Ceiling for reconnect delays.
    #[serde(with = "humantime_serde", default = "default_reconnect_max_backoff")]
    pub(crate) reconnect_max_backoff: Duration,
}

fn default_prefix() -> String {
    DEFAULT_PREFIX.to_owned()
}

fn default_command_timeout() -> Duration {
    DEFAULT_COMMAND_TIMEOUT
}

fn default_connect_timeout() -> Duration {
    DEFAULT_CONNECT_TIMEOUT
}

fn default_reconnect_initial_backoff() -> Duration {
    DEFAULT_RECONNECT_INITIAL_BACKOFF
}

fn default_reconnect_max_backoff() -> Duration {
    DEFAULT_RECONNECT_MAX_BACKOFF
}

#[bon::bon]
impl RedisTransportConfig {
    /// Creates a new configuration, validating all fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the values fail
    /// [`RedisTransportConfig::validate`].
    #[builder]
    pub fn new(
        #[builder(into)] url: String,
        #[builder(into, default = default_prefix())] prefix: String,
        #[builder(into)] sender_id: Option<String>,
        #[builder(default = DEFAULT_COMMAND_TIMEOUT)] command_timeout: Duration,
        #[builder(default = DEFAULT_CONNECT_TIMEOUT)] connect_timeout: Duration,
        #[builder(default = DEFAULT_RECONNECT_INITIAL_BACKOFF)] reconnect_initial_backoff: Duration,
        #[builder(default = DEFAULT_RECONNECT_MAX_BACKOFF)] reconnect_max_backoff: Duration,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            url,
            prefix,
            sender_id,
            command_timeout,
            connect_timeout,
            reconnect_initial_backoff,
            reconnect_max_backoff,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks the configuration, including deserialized ones.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if:
    /// - `url`, `prefix` or an explicit `sender_id` is empty
    /// - a timeout or `reconnect_initial_backoff` is zero
    /// - `reconnect_max_backoff` is shorter than `reconnect_initial_backoff`
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::Empty { field: "url" });
        }
        if self.prefix.is_empty() {
            return Err(ConfigError::Empty { field: "prefix" });
        }
        if self.sender_id.as_deref().is_some_and(str::is_empty) {
            return Err(ConfigError::Empty { field: "sender_id" });
        }
        for (field, value) in [
            ("command_timeout", self.command_timeout),
            ("connect_timeout", self.connect_timeout),
            ("reconnect_initial_backoff", self.reconnect_initial_backoff),
        ] {
            if value.is_zero() {
                return Err(ConfigError::BelowMinimum { field, value: "0ms".to_owned(), min: "1ms".to_owned() });
            }
        }
        if self.reconnect_max_backoff < self.reconnect_initial_backoff {
            return Err(ConfigError::BelowMinimum {
                field: "reconnect_max_backoff",
                value: format!("{}ms", self.reconnect_max_backoff.as_millis()),
                min: format!("{}ms", self.reconnect_initial_backoff.as_millis()),
            });
        }
        Ok(())
    }

    /// Server URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Deployment prefix.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Explicit sender identity, if configured.
    #[must_use]
    pub fn sender_id(&self) -> Option<&str> {
        self.sender_id.as_deref()
    }

    /// Per-command timeout.
    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    /// Connection establishment timeout.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// First reconnect delay.
    #[must_use]
    pub fn reconnect_initial_backoff(&self) -> Duration {
        self.reconnect_initial_backoff
    }

    /// Reconnect delay ceiling.
    #[must_use]
    pub fn reconnect_max_backoff(&self) -> Duration {
        self.reconnect_max_backoff
    }
}
