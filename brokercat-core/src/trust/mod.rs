//! Brokercat Trust System - Ed25519 verification of the remote catalog
//!
//! The remote catalog is only accepted when its detached signature verifies
//! under a key compiled into the client.
//!
//! Design Principles:
//! - Keys are an explicit, immutable value, never a module-level singleton
//! - Ordered key set: primary first, then rotation keys
//! - Pure verification: no I/O, every failure is a hard rejection

pub mod envelope;
pub mod error;
pub mod hasher;
pub mod keys;
pub mod verifier;

pub use envelope::{SignatureEnvelope, TrustedComment};
pub use error::VerifyError;
pub use keys::{KeyId, TrustedKey, TrustedKeySet, BUILTIN_KEYS};
pub use verifier::{verify, verify_envelope};
