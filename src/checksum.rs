//! SHA-256 integrity checks for replacement binaries.
//!
//! The handoff protocol never calls these itself; callers use them to check
//! bytes before passing them to [`crate::Handoff::update`].

use crate::error::{Error, Result};
use sha2::{Digest, Sha256};

/// Compute the hex-encoded SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Verify that `data` hashes to `expected` (hex, case-insensitive).
pub fn verify(data: &[u8], expected: &str) -> Result<()> {
    let actual = sha256_hex(data);
    let expected = expected.trim().to_lowercase();

    if actual != expected {
        return Err(Error::ChecksumMismatch { expected, actual });
    }
    Ok(())
}
