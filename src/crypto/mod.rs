//! Cryptographic utilities for the wire protocol
//!
//! This module provides:
//! - SHA-256 / double SHA-256 hashing and frame checksums
//! - SipHash-2-4 short transaction ids (BIP152)
//! - Merkle roots and partial merkle tree extraction

pub mod hash;
pub mod merkle;
pub mod siphash;

pub use hash::{
    checksum, double_sha256, filter_seed, hash_from_hex, hash_to_hex, murmur3, sha256, Hash256,
    ZERO_HASH,
};
pub use merkle::{build_partial, extract_matches, merkle_root, PartialMatch};
pub use siphash::{short_id, short_id_key, siphash, siphash256, siphash64, SHORT_ID_MASK};
