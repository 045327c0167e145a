//! Key provider error types.

use connector_cluster_transport::{ConfigError, TransportError};
use thiserror::Error;

/// Result type alias for key provider operations.
pub type Result<T> = std::result::Result<T, KeyError>;

/// Errors raised while generating, storing or synchronizing signing keys.
///
/// Only [`KeyError::NoKeySet`] escapes to callers of the coordinator's
/// serving operations; everything else is absorbed and logged inside the
/// rotation protocol and reported through
/// [`RotationOutcome::Failed`](crate::RotationOutcome::Failed).
///
/// # Non-exhaustive
///
/// This enum is marked `#[non_exhaustive]`. Downstream match expressions must
/// include a wildcard arm (`_ =>`).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KeyError {
    /// The key generator could not produce a key pair.
    #[error("Key generation failed: {0}")]
    Generation(String),

    /// Stored private key material is malformed.
    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    /// A key set could not be encoded or decoded.
    #[error("Key set serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The shared store or message bus failed.
    ///
    /// Wraps the original [`TransportError`] to preserve its source chain.
    #[error("Key transport error: {0}")]
    Transport(#[from] TransportError),

    /// The rotation configuration is invalid.
    #[error("Invalid rotation configuration: {0}")]
    Config(#[from] ConfigError),

    /// The rotation lock was lost before the key set was stored.
    #[error("Rotation lock lost before store")]
    LockLost,

    /// No key set could be read or created within the attempt budget.
    ///
    /// This is the one fatal condition: a process cannot serve without a
    /// signing identity.
    #[error("No signing key set available after {attempts} attempts")]
    NoKeySet {
        /// Attempts made before giving up.
        attempts: u32,
    },
}

impl KeyError {
    /// Returns `true` for failures worth retrying on a later attempt.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(error) => error.is_transient(),
            Self::LockLost => true,
            _ => false,
        }
    }
}
