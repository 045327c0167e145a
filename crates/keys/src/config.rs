//! Key rotation configuration.

use std::time::Duration;

use connector_cluster_transport::ConfigError;
use serde::{Deserialize, Serialize};

/// Default deployment prefix.
pub const DEFAULT_PREFIX: &str = "connector";

/// Default grace window for the previous key (10 minutes).
pub const DEFAULT_PREV_WINDOW: Duration = Duration::from_secs(600);

/// Default upper bound honored for a stored grace window (1 hour).
pub const DEFAULT_MAX_PREV_WINDOW: Duration = Duration::from_secs(3_600);

/// Default delay between storing a rotated key and activating it (2 minutes).
pub const DEFAULT_START_DELAY: Duration = Duration::from_secs(120);

/// Default rotation lock TTL.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(30);

/// Default number of cold-start attempts.
pub const DEFAULT_GENERATE_ATTEMPTS: u32 = 10;

/// Default pause between cold-start attempts.
pub const DEFAULT_ATTEMPT_DELAY: Duration = Duration::from_secs(1);

/// Default interval between rotation job heartbeats.
pub const DEFAULT_JOB_HEARTBEAT: Duration = Duration::from_secs(5);

/// Default age beyond which rotation requests are ignored.
pub const DEFAULT_REQUEST_MAX_AGE: Duration = Duration::from_secs(60);

/// Configuration for [`KeyRotationCoordinator`](crate::KeyRotationCoordinator).
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use connector_cluster_keys::RotationConfig;
///
/// let config = RotationConfig::builder()
///     .prefix("oidc")
///     .rotation_interval(Duration::from_secs(24 * 3600))
///     .build()?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RotationConfig {
    /// Deployment prefix for store keys and channels.
    #[serde(default = "default_prefix")]
    pub(crate) prefix: String,

    /// How long the previous key stays verifiable after a rotation.
    #[serde(with = "humantime_serde", default = "default_prev_window")]
    pub(crate) prev_window: Duration,

    /// Stored grace windows reaching beyond this are ignored.
    #[serde(with = "humantime_serde", default = "default_max_prev_window")]
    pub(crate) max_prev_window: Duration,

    /// Delay before a rotated key becomes the active signing key.
    #[serde(with = "humantime_serde", default = "default_start_delay")]
    pub(crate) start_delay: Duration,

    /// TTL of the rotation lock.
    #[serde(with = "humantime_serde", default = "default_lock_ttl")]
    pub(crate) lock_ttl: Duration,

    /// Cold-start attempts before giving up.
    #[serde(default = "default_generate_attempts")]
    pub(crate) generate_attempts: u32,

    /// Pause between cold-start attempts.
    #[serde(with = "humantime_serde", default = "default_attempt_delay")]
    pub(crate) attempt_delay: Duration,

    /// Periodic rotation interval; `None` rotates only on request.
    #[serde(with = "humantime_serde", default)]
    pub(crate) rotation_interval: Option<Duration>,

    /// Interval between job heartbeats.
    #[serde(with = "humantime_serde", default = "default_job_heartbeat")]
    pub(crate) job_heartbeat: Duration,

    /// Rotation requests older than this are ignored.
    #[serde(with = "humantime_serde", default = "default_request_max_age")]
    pub(crate) request_max_age: Duration,
}

fn default_prefix() -> String {
    DEFAULT_PREFIX.to_owned()
}

fn default_prev_window() -> Duration {
    DEFAULT_PREV_WINDOW
}

fn default_max_prev_window() -> Duration {
    DEFAULT_MAX_PREV_WINDOW
}

fn default_start_delay() -> Duration {
    DEFAULT_START_DELAY
}

fn default_lock_ttl() -> Duration {
    DEFAULT_LOCK_TTL
}

fn default_generate_attempts() -> u32 {
    DEFAULT_GENERATE_ATTEMPTS
}

fn default_attempt_delay() -> Duration {
    DEFAULT_ATTEMPT_DELAY
}

fn default_job_heartbeat() -> Duration {
    DEFAULT_JOB_HEARTBEAT
}

fn default_request_max_age() -> Duration {
    DEFAULT_REQUEST_MAX_AGE
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            prev_window: DEFAULT_PREV_WINDOW,
            max_prev_window: DEFAULT_MAX_PREV_WINDOW,
            start_delay: DEFAULT_START_DELAY,
            lock_ttl: DEFAULT_LOCK_TTL,
            generate_attempts: DEFAULT_GENERATE_ATTEMPTS,
            attempt_delay: DEFAULT_ATTEMPT_DELAY,
            rotation_interval: None,
            job_heartbeat: DEFAULT_JOB_HEARTBEAT,
            request_max_age: DEFAULT_REQUEST_MAX_AGE,
        }
    }
}

#[bon::bon]
impl RotationConfig {
    /// Creates a new configuration, validating all fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the values fail [`RotationConfig::validate`].
    #[builder]
    pub fn new(
        #[builder(into, default = default_prefix())] prefix: String,
        #[builder(default = DEFAULT_PREV_WINDOW)] prev_window: Duration,
        #[builder(default = DEFAULT_MAX_PREV_WINDOW)] max_prev_window: Duration,
        #[builder(default = DEFAULT_START_DELAY)] start_delay: Duration,
        #[builder(default = DEFAULT_LOCK_TTL)] lock_ttl: Duration,
        #[builder(default = DEFAULT_GENERATE_ATTEMPTS)] generate_attempts: u32,
        #[builder(default = DEFAULT_ATTEMPT_DELAY)] attempt_delay: Duration,
        rotation_interval: Option<Duration>,
        #[builder(default = DEFAULT_JOB_HEARTBEAT)] job_heartbeat: Duration,
        #[builder(default = DEFAULT_REQUEST_MAX_AGE)] request_max_age: Duration,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            prefix,
            prev_window,
            max_prev_window,
            start_delay,
            lock_ttl,
            generate_attempts,
            attempt_delay,
            rotation_interval,
            job_heartbeat,
            request_max_age,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks the configuration, including deserialized ones.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if:
    /// - `prefix` is empty
    /// - `lock_ttl` or `prev_window` is shorter than 1 second
    /// - `generate_attempts` is 0
    /// - `job_heartbeat` is zero
    /// - `rotation_interval` is set and shorter than 1 second
    /// - `start_delay` is not shorter than `prev_window` (the previous key
    ///   would stop verifying while it is still the signing key)
    /// - `prev_window` is not shorter than `max_prev_window`
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.prefix.is_empty() {
            return Err(ConfigError::Empty { field: "prefix" });
        }
        for (field, value) in [("lock_ttl", self.lock_ttl), ("prev_window", self.prev_window)] {
            if value < Duration::from_secs(1) {
                return Err(ConfigError::BelowMinimum {
                    field,
                    value: format!("{}ms", value.as_millis()),
                    min: "1s".to_owned(),
                });
            }
        }
        if self.generate_attempts == 0 {
            return Err(ConfigError::BelowMinimum {
                field: "generate_attempts",
                value: "0".to_owned(),
                min: "1".to_owned(),
            });
        }
        if self.job_heartbeat.is_zero() {
            return Err(ConfigError::BelowMinimum {
                field: "job_heartbeat",
                value: "0ms".to_owned(),
                min: "1ms".to_owned(),
            });
        }
        if let Some(interval) = self.rotation_interval
            && interval < Duration::from_secs(1)
        {
            return Err(ConfigError::BelowMinimum {
                field: "rotation_interval",
                value: format!("{}ms", interval.as_millis()),
                min: "1s".to_owned(),
            });
        }
        if self.start_delay >= self.prev_window {
            return Err(ConfigError::Inconsistent {
                message: format!(
                    "start_delay ({}s) must be shorter than prev_window ({}s)",
                    self.start_delay.as_secs(),
                    self.prev_window.as_secs()
                ),
            });
        }
        if self.prev_window >= self.max_prev_window {
            return Err(ConfigError::Inconsistent {
                message: format!(
                    "prev_window ({}s) must be shorter than max_prev_window ({}s)",
                    self.prev_window.as_secs(),
                    self.max_prev_window.as_secs()
                ),
            });
        }
        Ok(())
    }

    /// Deployment prefix.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Grace window for the previous key.
    #[must_use]
    pub fn prev_window(&self) -> Duration {
        self.prev_window
    }

    /// Upper bound honored for a stored grace window.
    #[must_use]
    pub fn max_prev_window(&self) -> Duration {
        self.max_prev_window
    }

    /// Delay before a rotated key becomes active.
    #[must_use]
    pub fn start_delay(&self) -> Duration {
        self.start_delay
    }

    /// Rotation lock TTL.
    #[must_use]
    pub fn lock_ttl(&self) -> Duration {
        self.lock_ttl
    }

    /// Cold-start attempt budget.
    #[must_use]
    pub fn generate_attempts(&self) -> u32 {
        self.generate_attempts
    }

    /// Pause between cold-start attempts.
    #[must_use]
    pub fn attempt_delay(&self) -> Duration {
        self.attempt_delay
    }

    /// Periodic rotation interval.
    #[must_use]
    pub fn rotation_interval(&self) -> Option<Duration> {
        self.rotation_interval
    }

    /// Interval between job heartbeats.
    #[must_use]
    pub fn job_heartbeat(&self) -> Duration {
        self.job_heartbeat
    }

    /// Maximum accepted age of a rotation request.
    #[must_use]
    pub fn request_max_age(&self) -> Duration {
        self.request_max_age
    }
}
