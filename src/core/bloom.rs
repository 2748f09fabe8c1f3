//! Bloom filters for SPV peers (BIP 37)
//!
//! A peer that sends `filterload` only wants to hear about transactions
//! matching its filter; this is the filter the session keeps for it.

use crate::core::encoding::{put_var_bytes, read_u32, read_u8, read_var_bytes, EncodingResult};
use crate::crypto::{filter_seed, murmur3};
use bytes::{Buf, BufMut};

// =============================================================================
// Constants
// =============================================================================

/// Maximum filter size in bytes
pub const MAX_BLOOM_FILTER_SIZE: usize = 36_000;

/// Maximum number of hash functions
pub const MAX_HASH_FUNCS: u32 = 50;

const LN2_SQUARED: f64 = std::f64::consts::LN_2 * std::f64::consts::LN_2;

/// Filter update behaviour when an output matches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BloomFlags {
    /// Never update the filter
    None = 0,
    /// Add the outpoint of every matched output
    All = 1,
    /// Add outpoints only for pay-to-pubkey and multisig outputs
    PubkeyOnly = 2,
}

impl BloomFlags {
    pub fn from_u8(value: u8) -> Self {
        match value & 3 {
            1 => BloomFlags::All,
            2 => BloomFlags::PubkeyOnly,
            _ => BloomFlags::None,
        }
    }
}

// =============================================================================
// Bloom Filter
// =============================================================================

/// Bloom filter for efficient address/transaction matching
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    /// Filter data (bit array)
    data: Vec<u8>,
    /// Number of hash functions
    hash_funcs: u32,
    /// Tweak for hash randomization
    tweak: u32,
    /// Update flags
    flags: BloomFlags,
}

impl BloomFilter {
    /// Create a filter from raw parts (as received in `filterload`)
    pub fn new(data: Vec<u8>, hash_funcs: u32, tweak: u32, flags: BloomFlags) -> Self {
        Self {
            data,
            hash_funcs,
            tweak,
            flags,
        }
    }

    /// Create filter optimized for N elements with target false positive rate
    pub fn from_rate(n_elements: usize, fp_rate: f64, flags: BloomFlags) -> Self {
        let n = n_elements.max(1) as f64;
        let size_bits = (-1.0 / LN2_SQUARED * n * fp_rate.ln()) as usize;
        let size_bytes = (size_bits / 8).clamp(1, MAX_BLOOM_FILTER_SIZE);

        let hash_funcs = ((size_bytes * 8) as f64 / n * std::f64::consts::LN_2) as u32;
        let hash_funcs = hash_funcs.clamp(1, MAX_HASH_FUNCS);

        Self::new(vec![0u8; size_bytes], hash_funcs, rand::random(), flags)
    }

    pub fn flags(&self) -> BloomFlags {
        self.flags
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn hash_funcs(&self) -> u32 {
        self.hash_funcs
    }

    pub fn tweak(&self) -> u32 {
        self.tweak
    }

    /// Whether the filter respects the BIP37 size limits
    pub fn is_within_constraints(&self) -> bool {
        self.data.len() <= MAX_BLOOM_FILTER_SIZE && self.hash_funcs <= MAX_HASH_FUNCS
    }

    fn hash(&self, data: &[u8], n: u32) -> usize {
        let bits = self.data.len() * 8;
        murmur3(data, filter_seed(n, self.tweak)) as usize % bits
    }

    /// Add data to the filter
    pub fn insert(&mut self, data: &[u8]) {
        if self.data.is_empty() {
            return;
        }
        for i in 0..self.hash_funcs {
            let idx = self.hash(data, i);
            self.data[idx / 8] |= 1 << (idx % 8);
        }
    }

    /// Check if data might be in the filter
    pub fn contains(&self, data: &[u8]) -> bool {
        if self.data.is_empty() {
            return false;
        }
        (0..self.hash_funcs).all(|i| {
            let idx = self.hash(data, i);
            self.data[idx / 8] & (1 << (idx % 8)) != 0
        })
    }

    /// Clear every bit (`filterclear` keeps the allocation)
    pub fn reset(&mut self) {
        self.data.iter_mut().for_each(|b| *b = 0);
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        put_var_bytes(buf, &self.data);
        buf.put_u32_le(self.hash_funcs);
        buf.put_u32_le(self.tweak);
        buf.put_u8(self.flags as u8);
    }

    /// Decode a filter; size limits are checked separately so the session
    /// can score an oversized filter instead of failing the parse
    pub fn decode<B: Buf>(buf: &mut B) -> EncodingResult<Self> {
        let data = read_var_bytes(buf, MAX_BLOOM_FILTER_SIZE * 2)?;
        let hash_funcs = read_u32(buf)?;
        let tweak = read_u32(buf)?;
        let flags = BloomFlags::from_u8(read_u8(buf)?);
        Ok(Self::new(data, hash_funcs, tweak, flags))
    }
}
