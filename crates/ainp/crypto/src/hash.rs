use sha2::{Digest, Sha256};

/// SHA-256 of the input, hex encoded. Used for cache keys: embedding
/// content addresses and email content dedupe.
pub fn sha256_hex(input: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input);
    hex::encode(hasher.finalize())
}

/// BLAKE3 of the input, hex encoded. Used for fast local content hashes.
pub fn blake3_hex(input: &[u8]) -> String {
    blake3::hash(input).to_hex().to_string()
}
