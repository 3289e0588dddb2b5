//! SHA-256 content digests
//!
//! Used to bind the cache metadata to the exact payload bytes it describes.

use sha2::{Digest, Sha256};

/// Hash bytes using SHA-256, formatted as `sha256:<hex>`
pub fn hash_bytes(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    let hash = hasher.finalize();
    format!("sha256:{}", hex::encode(hash))
}
