//! Short transaction identifiers for compact block relay (BIP152)
//!
//! A per-block 128-bit key is derived from the block header and a random
//! nonce; every transaction hash is then mapped to a 48-bit short id with
//! SipHash-2-4 under that key.

use super::hash::{sha256, Hash256};
use siphasher::sip::SipHasher24;
use std::hash::Hasher;

/// Width of a short id in bytes
pub const SHORT_ID_SIZE: usize = 6;

/// Mask selecting the low 48 bits of a SipHash output
pub const SHORT_ID_MASK: u64 = 0xffff_ffff_ffff;

fn hasher(key: &[u8; 16]) -> SipHasher24 {
    let mut k0 = [0u8; 8];
    let mut k1 = [0u8; 8];
    k0.copy_from_slice(&key[..8]);
    k1.copy_from_slice(&key[8..]);
    SipHasher24::new_with_keys(u64::from_le_bytes(k0), u64::from_le_bytes(k1))
}

/// SipHash-2-4 over arbitrary data
pub fn siphash(data: &[u8], key: &[u8; 16]) -> u64 {
    let mut h = hasher(key);
    h.write(data);
    h.finish()
}

/// SipHash-2-4 over a single little-endian 64-bit word
pub fn siphash64(num: u64, key: &[u8; 16]) -> u64 {
    siphash(&num.to_le_bytes(), key)
}

/// SipHash-2-4 over a 256-bit hash
pub fn siphash256(hash: &Hash256, key: &[u8; 16]) -> u64 {
    siphash(hash, key)
}

/// Derives the short-id key: first 16 bytes of sha256(header || nonce)
pub fn short_id_key(header: &[u8], nonce: u64) -> [u8; 16] {
    let mut data = Vec::with_capacity(header.len() + 8);
    data.extend_from_slice(header);
    data.extend_from_slice(&nonce.to_le_bytes());
    let digest = sha256(&data);
    let mut key = [0u8; 16];
    key.copy_from_slice(&digest[..16]);
    key
}

/// Maps a transaction hash to its 48-bit short id
pub fn short_id(hash: &Hash256, key: &[u8; 16]) -> u64 {
    let sum = siphash256(hash, key);
    let hi = (sum >> 32) & 0xffff;
    let lo = sum & 0xffff_ffff;
    (hi << 32) | lo
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference_key() -> [u8; 16] {
        let mut key = [0u8; 16];
        for (i, b) in key.iter_mut().enumerate() {
            *b = i as u8;
        }
        key
    }

    #[test]
    fn test_siphash_reference_vector() {
        // Reference vector from the SipHash paper: 15-byte message 00..0e
        let msg: Vec<u8> = (0u8..15).collect();
        assert_eq!(siphash(&msg, &reference_key()), 0xa129_ca61_49be_45e5);
    }

    #[test]
    fn test_siphash64_matches_bytes() {
        let key = reference_key();
        let n = 0x0706_0504_0302_0100u64;
        assert_eq!(siphash64(n, &key), siphash(&[0, 1, 2, 3, 4, 5, 6, 7], &key));
    }

    #[test]
    fn test_short_id_is_48_bits() {
        let key = reference_key();
        for i in 0..64u8 {
            let hash = [i; 32];
            let id = short_id(&hash, &key);
            assert_eq!(id & !SHORT_ID_MASK, 0);
            assert_eq!(id, siphash256(&hash, &key) & SHORT_ID_MASK);
        }
    }

    #[test]
    fn test_short_id_key_depends_on_nonce() {
        let header = [7u8; 80];
        let a = short_id_key(&header, 1);
        let b = short_id_key(&header, 2);
        assert_ne!(a, b);
        assert_eq!(a, short_id_key(&header, 1));
    }
}
