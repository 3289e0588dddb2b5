//! Trusted public keys
//!
//! The key set is baked into the binary and never fetched from the network.
//! The first key is the primary signing key; the rest are rotation keys that
//! keep older (or newer) signatures valid while a key change rolls out.

use base64::{engine::general_purpose, Engine as _};
use ed25519_dalek::VerifyingKey;
use std::fmt;

use super::error::VerifyError;

/// Keys compiled into the client, primary first
///
/// Values are standard base64 of the raw 32-byte Ed25519 public key.
pub const BUILTIN_KEYS: &[(&str, &str)] = &[
    ("brokercat-2025", "V4lH7Iq4plTJiijDf9sX5BgUQrlHbrmRC9pAg910Blo="),
    ("brokercat-2026", "FP5JQdXt1yQemdfqRXyp554MP6i4XsUdR/wOJmRJZRs="),
];

/// Identifier of a trusted key, reported back on successful verification
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyId(String);

impl KeyId {
    pub fn new(id: impl Into<String>) -> Self {
        KeyId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for KeyId {
    fn from(id: &str) -> Self {
        KeyId::new(id)
    }
}

impl From<String> for KeyId {
    fn from(id: String) -> Self {
        KeyId(id)
    }
}

/// A single trusted Ed25519 public key
#[derive(Debug, Clone)]
pub struct TrustedKey {
    pub id: KeyId,
    pub key: VerifyingKey,
}

impl TrustedKey {
    pub fn new(id: impl Into<KeyId>, key: VerifyingKey) -> Self {
        Self { id: id.into(), key }
    }

    /// Decode a key from standard base64 of its 32 raw bytes
    pub fn from_base64(id: &str, encoded: &str) -> Result<Self, VerifyError> {
        let invalid = |reason: String| VerifyError::InvalidKey {
            key_id: KeyId::new(id),
            reason,
        };

        let bytes = general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| invalid(format!("not valid base64: {e}")))?;
        let bytes: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| invalid(format!("expected 32 bytes, got {}", bytes.len())))?;
        let key = VerifyingKey::from_bytes(&bytes)
            .map_err(|_| invalid("not a valid Ed25519 point".to_string()))?;

        Ok(Self::new(id, key))
    }
}

/// Ordered, immutable set of trusted keys
#[derive(Debug, Clone)]
pub struct TrustedKeySet {
    keys: Vec<TrustedKey>,
}

impl TrustedKeySet {
    /// Build a key set; it must be non-empty with unique ids
    pub fn new(keys: Vec<TrustedKey>) -> Result<Self, VerifyError> {
        if keys.is_empty() {
            return Err(VerifyError::EmptyKeySet);
        }

        for (i, key) in keys.iter().enumerate() {
            if keys[..i].iter().any(|k| k.id == key.id) {
                return Err(VerifyError::DuplicateKeyId(key.id.clone()));
            }
        }

        Ok(Self { keys })
    }

    /// Build a key set from `(id, base64)` pairs, primary first
    pub fn from_base64(pairs: &[(&str, &str)]) -> Result<Self, VerifyError> {
        let keys = pairs
            .iter()
            .map(|(id, encoded)| TrustedKey::from_base64(id, encoded))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(keys)
    }

    /// The key set compiled into this binary
    pub fn builtin() -> Result<Self, VerifyError> {
        Self::from_base64(BUILTIN_KEYS)
    }

    /// The primary signing key
    pub fn primary(&self) -> &TrustedKey {
        // `new` guarantees at least one key
        &self.keys[0]
    }

    /// Keys in verification order
    pub fn iter(&self) -> impl Iterator<Item = &TrustedKey> {
        self.keys.iter()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn get(&self, id: &KeyId) -> Option<&TrustedKey> {
        self.keys.iter().find(|k| &k.id == id)
    }
}
