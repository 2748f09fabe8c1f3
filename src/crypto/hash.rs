//! Hashing primitives used across the wire protocol
//!
//! Provides SHA-256 based hashing for block and transaction identifiers,
//! frame checksums, and the murmur3 hash used by probabilistic filters.

use sha2::{Digest, Sha256};
use std::io::Cursor;

/// A 256-bit hash in internal (little-endian) byte order
pub type Hash256 = [u8; 32];

/// The all-zero hash
pub const ZERO_HASH: Hash256 = [0u8; 32];

/// Computes SHA-256 hash of the input data
pub fn sha256(data: &[u8]) -> Hash256 {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Computes double SHA-256 hash (SHA-256 of SHA-256)
/// Used for block hashes, transaction ids and frame checksums
pub fn double_sha256(data: &[u8]) -> Hash256 {
    sha256(&sha256(data))
}

/// First four bytes of the double SHA-256 of a payload
pub fn checksum(data: &[u8]) -> [u8; 4] {
    let hash = double_sha256(data);
    [hash[0], hash[1], hash[2], hash[3]]
}

/// Renders a hash the way block explorers do (byte-reversed hex)
pub fn hash_to_hex(hash: &Hash256) -> String {
    let mut reversed = *hash;
    reversed.reverse();
    hex::encode(reversed)
}

/// Parses a byte-reversed hex string into an internal hash
pub fn hash_from_hex(s: &str) -> Option<Hash256> {
    let bytes = hex::decode(s).ok()?;
    let mut hash: Hash256 = bytes.try_into().ok()?;
    hash.reverse();
    Some(hash)
}

/// 32-bit murmur3 of `data` under `seed`
pub fn murmur3(data: &[u8], seed: u32) -> u32 {
    murmur3::murmur3_32(&mut Cursor::new(data), seed).unwrap_or(0)
}

/// Seed for round `n` of a tweaked filter hash (BIP37 layout)
pub fn filter_seed(n: u32, tweak: u32) -> u32 {
    n.wrapping_mul(0xFBA4_C795).wrapping_add(tweak)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256() {
        let data = b"hello world";
        assert_eq!(
            hex::encode(sha256(data)),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_empty_payload_checksum() {
        // Checksum of an empty payload (verack, getaddr, ...)
        assert_eq!(checksum(&[]), [0x5d, 0xf6, 0xe0, 0xe2]);
    }

    #[test]
    fn test_hash_hex_roundtrip() {
        let mut hash = ZERO_HASH;
        hash[0] = 0xab;
        let hex = hash_to_hex(&hash);
        assert!(hex.ends_with("ab"));
        assert_eq!(hash_from_hex(&hex), Some(hash));
        assert_eq!(hash_from_hex("abcd"), None);
    }

    #[test]
    fn test_murmur3_vectors() {
        assert_eq!(murmur3(&[], 0), 0);
        assert_eq!(murmur3(&[0x00], 0), 0x514e_28b7);
    }

    #[test]
    fn test_filter_seed_wraps() {
        assert_eq!(filter_seed(0, 7), 7);
        assert_eq!(filter_seed(2, 0), 0xFBA4_C795u32.wrapping_mul(2));
    }
}
