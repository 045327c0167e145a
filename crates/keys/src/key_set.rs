//! Signing key pairs and the cluster key set.
//!
//! A [`KeySet`] holds the key new signatures are produced with (`current`)
//! and, during a rotation's grace window, the key it replaced (`previous`).
//! All instants are Unix epoch seconds.
//!
//! ```text
//!  rotation at T          currentStart = T + start_delay     prevExpire = T + prev_window
//!  ──────┬──────────────────────────┬───────────────────────────────┬──────────▶
//!        │ active: previous         │ active: current               │
//!        │ published: current + previous                            │ published: current
//! ```

use ed25519_dalek::{SigningKey, VerifyingKey};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::{KeyError, Result};

/// Signature algorithm of keys produced by this crate.
pub const ALGORITHM_EDDSA: &str = "EdDSA";

/// Public half of a signing key, as published in a JWKS document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicJwk {
    /// Key type (`OKP` for Ed25519).
    pub kty: String,
    /// Curve name.
    pub crv: String,
    /// Public key bytes, base64url without padding.
    pub x: String,
    /// Key identifier.
    pub kid: String,
    /// Signature algorithm.
    pub alg: String,
    /// Intended use (`sig`).
    #[serde(rename = "use")]
    pub key_use: String,
}

impl PublicJwk {
    /// Builds the JWK for an Ed25519 verifying key.
    pub fn ed25519(kid: impl Into<String>, key: &VerifyingKey) -> Self {
        use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};

        Self {
            kty: "OKP".to_owned(),
            crv: "Ed25519".to_owned(),
            x: URL_SAFE_NO_PAD.encode(key.to_bytes()),
            kid: kid.into(),
            alg: ALGORITHM_EDDSA.to_owned(),
            key_use: "sig".to_owned(),
        }
    }

    /// Hex MD5 digest of the JWK's JSON form.
    ///
    /// Processes report this digest when asked for their active key, letting
    /// an auditor spot divergence without exchanging key material.
    pub fn md5_hex(&self) -> Result<String> {
        let encoded = serde_json::to_vec(self)?;
        Ok(format!("{:x}", Md5::digest(&encoded)))
    }
}

/// A signing key pair.
///
/// The private key is a base64url (no padding) PKCS#8 document and is
/// zeroized on drop.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyPair {
    /// Key identifier, shared with the public JWK.
    pub kid: String,
    /// Signature algorithm.
    pub algorithm: String,
    private_key: Zeroizing<String>,
    /// Public half.
    pub public_key: PublicJwk,
}

impl KeyPair {
    /// Assembles a key pair from its parts.
    pub fn new(
        kid: impl Into<String>,
        algorithm: impl Into<String>,
        private_key: Zeroizing<String>,
        public_key: PublicJwk,
    ) -> Self {
        Self { kid: kid.into(), algorithm: algorithm.into(), private_key, public_key }
    }

    /// Private key, base64url-encoded PKCS#8.
    #[must_use]
    pub fn private_key(&self) -> &str {
        &self.private_key
    }

    /// Decodes the private key into an Ed25519 signing key.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::InvalidKey`] if the stored key is not an Ed25519
    /// PKCS#8 document.
    pub fn signing_key(&self) -> Result<SigningKey> {
        crate::generator::decode_pkcs8(&self.private_key)
    }
}

impl PartialEq for KeyPair {
    fn eq(&self, other: &Self) -> bool {
        self.kid == other.kid
            && self.algorithm == other.algorithm
            && self.public_key == other.public_key
            && self.private_key.as_str() == other.private_key.as_str()
    }
}

impl Eq for KeyPair {}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("kid", &self.kid)
            .field("algorithm", &self.algorithm)
            .field("private_key", &"<redacted>")
            .field("public_key", &self.public_key)
            .finish()
    }
}

/// Why a rotation attempt left the key set unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationBlock {
    /// A rotated key is scheduled but not yet active.
    ActivationPending,
    /// The previous key is still inside its grace window.
    GraceWindowOpen,
}

impl std::fmt::Display for RotationBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ActivationPending => f.write_str("activation pending"),
            Self::GraceWindowOpen => f.write_str("grace window open"),
        }
    }
}

/// The cluster's authoritative signing keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeySet {
    /// Key new signatures are produced with once `current_start` has passed.
    pub current: KeyPair,
    /// Key replaced by the last rotation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<KeyPair>,
    /// When `current` becomes the active signing key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_start: Option<i64>,
    /// When `previous` leaves the published verification set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_expire: Option<i64>,
    /// Incremented by every rotation.
    #[serde(default)]
    pub generation: u64,
}

impl KeySet {
    /// Key set for a cluster with no prior keys: `current` is active at once.
    #[must_use]
    pub fn initial(current: KeyPair) -> Self {
        Self { current, previous: None, current_start: None, prev_expire: None, generation: 1 }
    }

    /// Successor of this key set with `next` as the new current key.
    ///
    /// `next` becomes active `start_delay` seconds after `now`; the old
    /// current key stays verifiable for `prev_window` seconds.
    #[must_use]
    pub fn rotated(&self, next: KeyPair, now: i64, start_delay: i64, prev_window: i64) -> Self {
        Self {
            current: next,
            previous: Some(self.current.clone()),
            current_start: Some(now + start_delay),
            prev_expire: Some(now + prev_window),
            generation: self.generation + 1,
        }
    }

    /// Whether `current` is scheduled but not yet active at `now`.
    #[must_use]
    pub fn activation_pending(&self, now: i64) -> bool {
        self.current_start.is_some_and(|start| start > now)
    }

    /// The key to sign with at `now`.
    #[must_use]
    pub fn active(&self, now: i64) -> &KeyPair {
        match &self.previous {
            Some(previous) if self.activation_pending(now) => previous,
            _ => &self.current,
        }
    }

    /// The previous key if it is still verifiable at `now`.
    ///
    /// An expiry at or beyond `now + max_window` is treated as corrupt and
    /// ignored.
    #[must_use]
    pub fn verifiable_previous(&self, now: i64, max_window: i64) -> Option<&KeyPair> {
        let expire = self.prev_expire?;
        (now <= expire && expire < now + max_window).then_some(self.previous.as_ref()).flatten()
    }

    /// Public keys that verify signatures at `now`, current first.
    #[must_use]
    pub fn public_keys(&self, now: i64, max_window: i64) -> Vec<PublicJwk> {
        let mut keys = vec![self.current.public_key.clone()];
        if let Some(previous) = self.verifiable_previous(now, max_window) {
            keys.push(previous.public_key.clone());
        }
        keys
    }

    /// Reason a rotation must not replace this key set at `now`, if any.
    #[must_use]
    pub fn rotation_block(&self, now: i64, max_window: i64) -> Option<RotationBlock> {
        if self.activation_pending(now) {
            Some(RotationBlock::ActivationPending)
        } else if self.verifiable_previous(now, max_window).is_some() {
            Some(RotationBlock::GraceWindowOpen)
        } else {
            None
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use proptest::prelude::*;
    use rstest::rstest;

    use super::*;
    use crate::generator::key_pair_from_seed;

    const MAX_WINDOW: i64 = 3_600;

    fn rotated_at(now: i64) -> KeySet {
        let first = KeySet::initial(key_pair_from_seed("k1", [1; 32]));
        first.rotated(key_pair_from_seed("k2", [2; 32]), now, 120, 600)
    }

    #[test]
    fn test_initial_key_is_active_immediately() {
        let set = KeySet::initial(key_pair_from_seed("k1", [1; 32]));
        assert_eq!(set.active(0).kid, "k1");
        assert_eq!(set.public_keys(0, MAX_WINDOW).len(), 1);
        assert_eq!(set.rotation_block(0, MAX_WINDOW), None);
        assert_eq!(set.generation, 1);
    }

    #[rstest]
    #[case::just_rotated(1_000, "k1", 2, Some(RotationBlock::ActivationPending))]
    #[case::before_activation(1_119, "k1", 2, Some(RotationBlock::ActivationPending))]
    #[case::at_activation(1_120, "k2", 2, Some(RotationBlock::GraceWindowOpen))]
    #[case::after_activation(1_121, "k2", 2, Some(RotationBlock::GraceWindowOpen))]
    #[case::at_expiry(1_600, "k2", 2, Some(RotationBlock::GraceWindowOpen))]
    #[case::after_expiry(1_601, "k2", 1, None)]
    fn test_rotation_timeline(
        #[case] now: i64,
        #[case] active: &str,
        #[case] published: usize,
        #[case] block: Option<RotationBlock>,
    ) {
        let set = rotated_at(1_000);
        assert_eq!(set.active(now).kid, active);
        assert_eq!(set.public_keys(now, MAX_WINDOW).len(), published);
        assert_eq!(set.rotation_block(now, MAX_WINDOW), block);
    }

    #[test]
    fn test_absurd_expiry_is_ignored() {
        let mut set = rotated_at(1_000);
        set.prev_expire = Some(1_000 + MAX_WINDOW * 100);
        assert_eq!(set.public_keys(1_200, MAX_WINDOW).len(), 1);
        assert_eq!(set.rotation_block(1_200, MAX_WINDOW), None);
    }

    #[test]
    fn test_wire_shape() {
        let set = rotated_at(1_000);
        let json = serde_json::to_value(&set).unwrap();
        assert_eq!(json["currentStart"], 1_120);
        assert_eq!(json["prevExpire"], 1_600);
        assert_eq!(json["generation"], 2);
        assert_eq!(json["current"]["publicKey"]["use"], "sig");
        assert_eq!(json["current"]["publicKey"]["kty"], "OKP");
        assert!(json["current"]["privateKey"].is_string());

        let decoded: KeySet = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, set);
    }

    #[test]
    fn test_debug_redacts_private_key() {
        let pair = key_pair_from_seed("k1", [1; 32]);
        let debug = format!("{pair:?}");
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains(pair.private_key()));
    }

    #[test]
    fn test_md5_is_stable_and_distinct() {
        let a = key_pair_from_seed("k1", [1; 32]).public_key;
        let b = key_pair_from_seed("k2", [2; 32]).public_key;
        assert_eq!(a.md5_hex().unwrap(), a.clone().md5_hex().unwrap());
        assert_ne!(a.md5_hex().unwrap(), b.md5_hex().unwrap());
        assert_eq!(a.md5_hex().unwrap().len(), 32);
    }

    proptest! {
        #[test]
        fn prop_previous_published_only_inside_window(
            now in 0i64..10_000_000,
            offset in -10_000i64..10_000,
            max_window in 1i64..7_200,
        ) {
            let mut set = rotated_at(0);
            set.prev_expire = Some(now + offset);
            let published = set.public_keys(now, max_window).len() == 2;
            prop_assert_eq!(published, offset >= 0 && offset < max_window);
        }

        #[test]
        fn prop_active_is_previous_only_before_start(now in 0i64..2_000, start in 0i64..2_000) {
            let mut set = rotated_at(0);
            set.current_start = Some(start);
            let expected = if now < start { "k1" } else { "k2" };
            prop_assert_eq!(set.active(now).kid.as_str(), expected);
        }

        #[test]
        fn prop_rotation_never_replaces_pending_activation(now in 0i64..1_000, delay in 1i64..1_000) {
            let mut set = rotated_at(0);
            set.current_start = Some(now + delay);
            prop_assert_eq!(set.rotation_block(now, 3_600), Some(RotationBlock::ActivationPending));
        }
    }
}
