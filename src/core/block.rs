//! Blocks, headers and filtered (merkle) blocks
//!
//! A block contains an 80-byte header and a list of transactions.

use crate::core::bloom::BloomFilter;
use crate::core::encoding::{
    put_var_bytes, put_varint, read_count, read_hash, read_i32, read_u32, read_var_bytes,
    EncodingError, EncodingResult,
};
use crate::core::transaction::Transaction;
use crate::crypto::{
    build_partial, double_sha256, extract_matches, merkle_root, Hash256, PartialMatch,
};
use bytes::{Buf, BufMut};
use std::sync::Arc;

// =============================================================================
// Block Constants
// =============================================================================

/// Maximum block size in bytes (1MB like Bitcoin pre-SegWit)
pub const MAX_BLOCK_SIZE: usize = 1_000_000;

/// Maximum block weight (4MB for SegWit compatibility)
pub const MAX_BLOCK_WEIGHT: usize = 4_000_000;

/// Block header size in bytes
pub const BLOCK_HEADER_SIZE: usize = 80;

/// Smallest possible transaction, used to bound transaction counts
pub const MIN_TX_SIZE: usize = 60;

/// Block header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: i32,
    /// Hash of the previous block
    pub prev_block: Hash256,
    /// Merkle root of all transactions
    pub merkle_root: Hash256,
    pub time: u32,
    /// Compact difficulty target
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_i32_le(self.version);
        buf.put_slice(&self.prev_block);
        buf.put_slice(&self.merkle_root);
        buf.put_u32_le(self.time);
        buf.put_u32_le(self.bits);
        buf.put_u32_le(self.nonce);
    }

    pub fn to_bytes(&self) -> [u8; BLOCK_HEADER_SIZE] {
        let mut out = [0u8; BLOCK_HEADER_SIZE];
        self.encode(&mut &mut out[..]);
        out
    }

    pub fn decode<B: Buf>(buf: &mut B) -> EncodingResult<Self> {
        Ok(Self {
            version: read_i32(buf)?,
            prev_block: read_hash(buf)?,
            merkle_root: read_hash(buf)?,
            time: read_u32(buf)?,
            bits: read_u32(buf)?,
            nonce: read_u32(buf)?,
        })
    }

    /// Block hash (double SHA-256 of the header)
    pub fn hash(&self) -> Hash256 {
        double_sha256(&self.to_bytes())
    }
}

/// A full block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Arc<Transaction>>,
}

impl Block {
    /// Assemble a block, committing the header to the transactions
    pub fn new(mut header: BlockHeader, transactions: Vec<Arc<Transaction>>) -> Self {
        let hashes: Vec<Hash256> = transactions.iter().map(|tx| tx.hash()).collect();
        header.merkle_root = merkle_root(&hashes);
        Self {
            header,
            transactions,
        }
    }

    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    /// Recompute the merkle root and compare it against the header
    pub fn has_valid_merkle_root(&self) -> bool {
        let hashes: Vec<Hash256> = self.transactions.iter().map(|tx| tx.hash()).collect();
        merkle_root(&hashes) == self.header.merkle_root
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B, witness: bool) {
        self.header.encode(buf);
        put_varint(buf, self.transactions.len() as u64);
        for tx in &self.transactions {
            tx.encode(buf, witness);
        }
    }

    pub fn to_bytes(&self, witness: bool) -> Vec<u8> {
        let mut buf = Vec::with_capacity(BLOCK_HEADER_SIZE + self.transactions.len() * 256);
        self.encode(&mut buf, witness);
        buf
    }

    pub fn decode<B: Buf>(buf: &mut B) -> EncodingResult<Self> {
        let header = BlockHeader::decode(buf)?;
        let count = read_count(buf, "transactions", MAX_BLOCK_WEIGHT / MIN_TX_SIZE)?;
        let mut transactions = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            transactions.push(Arc::new(Transaction::decode(buf)?));
        }
        Ok(Self {
            header,
            transactions,
        })
    }

    /// Build a filtered block for an SPV peer, returning it together with
    /// the matched transactions that must follow it
    pub fn to_merkle_block(&self, filter: &mut BloomFilter) -> (MerkleBlock, Vec<Arc<Transaction>>) {
        let mut matched = Vec::with_capacity(self.transactions.len());
        let mut txs = Vec::new();
        for tx in &self.transactions {
            let hit = tx.is_watched(filter);
            if hit {
                txs.push(tx.clone());
            }
            matched.push(hit);
        }

        let leaves: Vec<Hash256> = self.transactions.iter().map(|tx| tx.hash()).collect();
        let (hashes, flags) = build_partial(&leaves, &matched);
        let block = MerkleBlock {
            header: self.header,
            total_tx: self.transactions.len() as u32,
            hashes,
            flags,
        };
        (block, txs)
    }
}

/// Filtered block (BIP37 `merkleblock`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleBlock {
    pub header: BlockHeader,
    pub total_tx: u32,
    pub hashes: Vec<Hash256>,
    pub flags: Vec<u8>,
}

impl MerkleBlock {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    /// Walk the partial tree; `None` if malformed or not committed to by
    /// the header
    pub fn matches(&self) -> Option<PartialMatch> {
        let max_leaves = (MAX_BLOCK_SIZE / MIN_TX_SIZE) as u32;
        let result = extract_matches(self.total_tx, &self.hashes, &self.flags, max_leaves)?;
        if result.root != self.header.merkle_root {
            return None;
        }
        Some(result)
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        self.header.encode(buf);
        buf.put_u32_le(self.total_tx);
        put_varint(buf, self.hashes.len() as u64);
        for hash in &self.hashes {
            buf.put_slice(hash);
        }
        put_var_bytes(buf, &self.flags);
    }

    pub fn decode<B: Buf>(buf: &mut B) -> EncodingResult<Self> {
        let header = BlockHeader::decode(buf)?;
        let total_tx = read_u32(buf)?;
        let count = read_count(buf, "merkle hashes", MAX_BLOCK_SIZE / MIN_TX_SIZE)?;
        let mut hashes = Vec::with_capacity(count);
        for _ in 0..count {
            hashes.push(read_hash(buf)?);
        }
        let flags = read_var_bytes(buf, MAX_BLOCK_SIZE / MIN_TX_SIZE)?;
        if hashes.len() as u64 > total_tx as u64 {
            return Err(EncodingError::InvalidData(
                "more merkle hashes than transactions".into(),
            ));
        }
        Ok(Self {
            header,
            total_tx,
            hashes,
            flags,
        })
    }
}
