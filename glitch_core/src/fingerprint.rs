use sha2::{Digest, Sha256};

/// Number of hex characters kept from the SHA-256 digest.
pub const FINGERPRINT_LEN: usize = 16;

/// Short content identifier: SHA-256 of `data`, hex-encoded and truncated.
///
/// Used to name crash files and to tell results apart, never as a security boundary.
pub fn fingerprint(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let mut encoded = hex::encode(digest);
    encoded.truncate(FINGERPRINT_LEN);
    encoded
}
