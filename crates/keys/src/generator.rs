//! Key pair generation.
//!
//! [`KeyGenerator`] is the seam to whatever produces the cluster's signing
//! keys. [`Ed25519KeyGenerator`] is the default.

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use ed25519_dalek::SigningKey;
use rand_core::OsRng;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::{
    error::{KeyError, Result},
    key_set::{ALGORITHM_EDDSA, KeyPair, PublicJwk},
};

/// PKCS#8 v1 header for an Ed25519 private key: the 32 key bytes follow.
const PKCS8_ED25519_PREFIX: [u8; 16] = [
    0x30, 0x2e, // SEQUENCE, 46 bytes
    0x02, 0x01, 0x00, // INTEGER version 0
    0x30, 0x05, // SEQUENCE, 5 bytes (algorithm identifier)
    0x06, 0x03, 0x2b, 0x65, 0x70, // OID 1.3.101.112 (Ed25519)
    0x04, 0x22, // OCTET STRING, 34 bytes
    0x04, 0x20, // OCTET STRING, 32 bytes (the actual key)
];

/// Produces new signing key pairs.
#[async_trait]
pub trait KeyGenerator: Send + Sync {
    /// Generates a fresh key pair with a unique `kid`.
    async fn generate(&self) -> Result<KeyPair>;
}

/// Generates random Ed25519 key pairs.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519KeyGenerator;

#[async_trait]
impl KeyGenerator for Ed25519KeyGenerator {
    async fn generate(&self) -> Result<KeyPair> {
        let signing_key = SigningKey::generate(&mut OsRng);
        let kid = Uuid::new_v4().simple().to_string();
        Ok(key_pair_from_signing_key(kid, &signing_key))
    }
}

/// Builds a key pair around an existing Ed25519 signing key.
pub fn key_pair_from_signing_key(kid: impl Into<String>, signing_key: &SigningKey) -> KeyPair {
    let kid = kid.into();
    let public_key = PublicJwk::ed25519(kid.clone(), &signing_key.verifying_key());

    let private_bytes: Zeroizing<[u8; 32]> = Zeroizing::new(signing_key.to_bytes());
    let mut pkcs8_der = Zeroizing::new(PKCS8_ED25519_PREFIX.to_vec());
    pkcs8_der.extend_from_slice(&*private_bytes);
    let private_key = Zeroizing::new(URL_SAFE_NO_PAD.encode(&*pkcs8_der));

    KeyPair::new(kid, ALGORITHM_EDDSA, private_key, public_key)
}

/// Deterministic key pair from a 32-byte seed.
#[cfg(any(test, feature = "testutil"))]
pub(crate) fn key_pair_from_seed(kid: &str, seed: [u8; 32]) -> KeyPair {
    key_pair_from_signing_key(kid, &SigningKey::from_bytes(&seed))
}

/// Decodes a base64url PKCS#8 Ed25519 private key.
pub(crate) fn decode_pkcs8(encoded: &str) -> Result<SigningKey> {
    let der = Zeroizing::new(
        URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| KeyError::InvalidKey(format!("private key is not base64url: {e}")))?,
    );
    let key_bytes = der
        .strip_prefix(PKCS8_ED25519_PREFIX.as_slice())
        .ok_or_else(|| KeyError::InvalidKey("private key is not Ed25519 PKCS#8".into()))?;
    let seed: Zeroizing<[u8; 32]> = Zeroizing::new(
        key_bytes
            .try_into()
            .map_err(|_| KeyError::InvalidKey(format!("expected 32 key bytes, got {}", key_bytes.len())))?,
    );
    Ok(SigningKey::from_bytes(&seed))
}
