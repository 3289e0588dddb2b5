//! Detached signature file parsing
//!
//! Layout of `brokers.json.sig` (minisign-style):
//!
//! ```text
//! untrusted comment: <free text, never trusted>
//! <base64 of the 64-byte Ed25519 signature over the payload>
//! trusted comment: <free text>                          (optional)
//! <base64 of the 64-byte signature over sig || comment> (required with the line above)
//! ```

use base64::{engine::general_purpose, Engine as _};
use ed25519_dalek::{Signature, SIGNATURE_LENGTH};

use super::error::VerifyError;

const UNTRUSTED_PREFIX: &str = "untrusted comment:";
const TRUSTED_PREFIX: &str = "trusted comment:";

/// A parsed signature file
#[derive(Debug, Clone)]
pub struct SignatureEnvelope {
    /// Text of the first line; informational only
    pub untrusted_comment: String,
    /// Detached signature over the payload
    pub signature: Signature,
    /// Trusted comment and the global signature covering it
    pub trusted: Option<TrustedComment>,
}

/// A trusted comment line plus its global signature
#[derive(Debug, Clone)]
pub struct TrustedComment {
    pub comment: String,
    pub global_signature: Signature,
}

impl SignatureEnvelope {
    /// Parse a signature file
    pub fn parse(raw: &[u8]) -> Result<Self, VerifyError> {
        let text = std::str::from_utf8(raw)
            .map_err(|_| VerifyError::malformed("signature file is not UTF-8 text"))?;

        let mut lines: Vec<&str> = text
            .split('\n')
            .map(|line| line.strip_suffix('\r').unwrap_or(line))
            .collect();
        while lines.last().is_some_and(|line| line.trim().is_empty()) {
            lines.pop();
        }

        if lines.len() < 2 {
            return Err(VerifyError::malformed(format!(
                "expected at least 2 lines, found {}",
                lines.len()
            )));
        }

        let untrusted_comment = lines[0]
            .strip_prefix(UNTRUSTED_PREFIX)
            .ok_or_else(|| {
                VerifyError::malformed(format!("first line must start with '{UNTRUSTED_PREFIX}'"))
            })?
            .trim()
            .to_string();

        let signature = decode_signature(lines[1], "signature")?;

        let trusted = match lines.len() {
            2 => None,
            4 => {
                let comment = lines[2].strip_prefix(TRUSTED_PREFIX).ok_or_else(|| {
                    VerifyError::malformed(format!(
                        "third line must start with '{TRUSTED_PREFIX}'"
                    ))
                })?;
                let global_signature = decode_signature(lines[3], "global signature")?;
                Some(TrustedComment {
                    // minisign signs the comment text without the leading space
                    comment: comment.strip_prefix(' ').unwrap_or(comment).to_string(),
                    global_signature,
                })
            }
            3 => {
                return Err(VerifyError::malformed(
                    "trusted comment is missing its global signature line",
                ))
            }
            n => {
                return Err(VerifyError::malformed(format!(
                    "expected 2 or 4 lines, found {n}"
                )))
            }
        };

        Ok(Self {
            untrusted_comment,
            signature,
            trusted,
        })
    }
}

impl TrustedComment {
    /// Bytes covered by the global signature: `signature || comment`
    pub fn signed_bytes(&self, signature: &Signature) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(SIGNATURE_LENGTH + self.comment.len());
        bytes.extend_from_slice(&signature.to_bytes());
        bytes.extend_from_slice(self.comment.as_bytes());
        bytes
    }
}

fn decode_signature(line: &str, what: &str) -> Result<Signature, VerifyError> {
    let decoded = general_purpose::STANDARD
        .decode(line.trim())
        .map_err(|e| VerifyError::malformed(format!("{what} line is not valid base64: {e}")))?;

    let bytes: [u8; SIGNATURE_LENGTH] = decoded.as_slice().try_into().map_err(|_| {
        VerifyError::malformed(format!(
            "{what} must decode to {SIGNATURE_LENGTH} bytes, got {}",
            decoded.len()
        ))
    })?;

    Ok(Signature::from_bytes(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b64(bytes: &[u8]) -> String {
        general_purpose::STANDARD.encode(bytes)
    }

    fn assert_malformed(raw: &str, needle: &str) {
        match SignatureEnvelope::parse(raw.as_bytes()) {
            Err(VerifyError::MalformedEnvelope(reason)) => {
                assert!(reason.contains(needle), "unexpected reason: {reason}")
            }
            other => panic!("expected MalformedEnvelope, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_two_line_envelope() {
        let raw = format!("untrusted comment: release 42\n{}\n", b64(&[7u8; 64]));
        let envelope = SignatureEnvelope::parse(raw.as_bytes()).unwrap();

        assert_eq!(envelope.untrusted_comment, "release 42");
        assert_eq!(envelope.signature.to_bytes(), [7u8; 64]);
        assert!(envelope.trusted.is_none());
    }

    #[test]
    fn test_parse_four_line_envelope_with_crlf() {
        let raw = format!(
            "untrusted comment: x\r\n{}\r\ntrusted comment: timestamp:1700000000\r\n{}\r\n",
            b64(&[1u8; 64]),
            b64(&[2u8; 64])
        );
        let envelope = SignatureEnvelope::parse(raw.as_bytes()).unwrap();

        let trusted = envelope.trusted.unwrap();
        assert_eq!(trusted.comment, "timestamp:1700000000");
        assert_eq!(trusted.global_signature.to_bytes(), [2u8; 64]);
    }

    #[test]
    fn test_rejects_single_line() {
        assert_malformed("untrusted comment: only", "at least 2 lines");
        assert_malformed("", "at least 2 lines");
    }

    #[test]
    fn test_rejects_bad_base64() {
        assert_malformed("untrusted comment: x\n@@not-base64@@", "not valid base64");
    }

    #[test]
    fn test_rejects_wrong_signature_length() {
        let raw = format!("untrusted comment: x\n{}", b64(&[0u8; 63]));
        assert_malformed(&raw, "64 bytes, got 63");

        let raw = format!("untrusted comment: x\n{}", b64(&[0u8; 74]));
        assert_malformed(&raw, "64 bytes, got 74");
    }

    #[test]
    fn test_rejects_missing_untrusted_prefix() {
        let raw = format!("comment: x\n{}", b64(&[0u8; 64]));
        assert_malformed(&raw, "untrusted comment:");
    }

    #[test]
    fn test_rejects_trusted_comment_without_global_signature() {
        let raw = format!(
            "untrusted comment: x\n{}\ntrusted comment: y",
            b64(&[0u8; 64])
        );
        assert_malformed(&raw, "missing its global signature");
    }

    #[test]
    fn test_rejects_extra_lines() {
        let raw = format!(
            "untrusted comment: x\n{sig}\ntrusted comment: y\n{sig}\nextra",
            sig = b64(&[0u8; 64])
        );
        assert_malformed(&raw, "expected 2 or 4 lines");
    }

    #[test]
    fn test_rejects_non_utf8() {
        let result = SignatureEnvelope::parse(&[0xff, 0xfe, b'\n', b'a']);
        assert!(matches!(result, Err(VerifyError::MalformedEnvelope(_))));
    }
}
