//! Trust system error types

use thiserror::Error;

use super::keys::KeyId;

/// Signature verification errors
///
/// Every variant is a hard rejection of the payload it was raised for. None of
/// them may be downgraded to "accept anyway" by a caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    /// The signature file could not be parsed
    #[error("Malformed signature envelope: {0}")]
    MalformedEnvelope(String),

    /// The signature did not verify under any trusted key
    #[error("Signature does not match any trusted key")]
    NoKeyMatched,

    /// The primary signature verified but the trusted comment's global signature did not
    #[error("Trusted comment signature does not verify under key '{key_id}'")]
    GlobalSignatureMismatch { key_id: KeyId },

    /// A trusted key could not be decoded into an Ed25519 public key
    #[error("Invalid trusted key '{key_id}': {reason}")]
    InvalidKey { key_id: KeyId, reason: String },

    /// A key set must hold at least one key
    #[error("Trusted key set is empty")]
    EmptyKeySet,

    /// Two trusted keys share an id
    #[error("Duplicate trusted key id '{0}'")]
    DuplicateKeyId(KeyId),
}

impl VerifyError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        VerifyError::MalformedEnvelope(reason.into())
    }

    /// Log errors that indicate a tampered or mis-signed payload
    pub fn log_if_security_critical(&self) {
        match self {
            VerifyError::NoKeyMatched | VerifyError::GlobalSignatureMismatch { .. } => {
                tracing::error!(target: "security", "CATALOG SIGNATURE REJECTED: {}", self);
            }
            VerifyError::MalformedEnvelope(_) => {
                tracing::warn!(target: "security", "Catalog signature envelope rejected: {}", self);
            }
            _ => {}
        }
    }
}
