//! Detached Ed25519 signature verification for catalog payloads
//!
//! Pure functions: no I/O and no global state. The trusted keys are passed in
//! explicitly so tests can supply disposable keys.
//!
//! Every `Ok` returned from this module follows a successful
//! `verify_strict`. A verifier that reports success without checking the
//! signature bytes is a security defect, never an acceptable placeholder.

use ed25519_dalek::{Signature, VerifyingKey};
use tracing::{debug, warn};

use super::envelope::SignatureEnvelope;
use super::error::VerifyError;
use super::keys::{KeyId, TrustedKeySet};

/// Verify `message` against a raw signature file
///
/// Keys are tried in order (primary first); the id of the first key that
/// verifies is returned. When the envelope carries a trusted comment, its
/// global signature must verify under that same key.
pub fn verify(
    message: &[u8],
    signature_envelope: &[u8],
    keys: &TrustedKeySet,
) -> Result<KeyId, VerifyError> {
    let envelope = SignatureEnvelope::parse(signature_envelope)?;
    verify_envelope(message, &envelope, keys)
}

/// Verify `message` against an already parsed envelope
pub fn verify_envelope(
    message: &[u8],
    envelope: &SignatureEnvelope,
    keys: &TrustedKeySet,
) -> Result<KeyId, VerifyError> {
    let matched = keys
        .iter()
        .find(|trusted| verify_one(&trusted.key, message, &envelope.signature))
        .ok_or(VerifyError::NoKeyMatched)?;

    if let Some(trusted_comment) = &envelope.trusted {
        let signed = trusted_comment.signed_bytes(&envelope.signature);
        if !verify_one(&matched.key, &signed, &trusted_comment.global_signature) {
            warn!(
                "Payload signature verified with '{}' but trusted comment did not",
                matched.id
            );
            return Err(VerifyError::GlobalSignatureMismatch {
                key_id: matched.id.clone(),
            });
        }
        debug!("Trusted comment verified: {}", trusted_comment.comment);
    }

    if matched.id != keys.primary().id {
        debug!("Payload verified with rotation key '{}'", matched.id);
    }

    Ok(matched.id.clone())
}

fn verify_one(key: &VerifyingKey, message: &[u8], signature: &Signature) -> bool {
    key.verify_strict(message, signature).is_ok()
}
