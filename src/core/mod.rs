//! Core protocol data types
//!
//! This module contains the objects exchanged between peers:
//! - Consensus encoding helpers (var-ints, little-endian integers)
//! - Transactions (legacy and segwit serialization)
//! - Blocks, headers and filtered merkle blocks
//! - BIP37 bloom filters for SPV peers

pub mod block;
pub mod bloom;
pub mod encoding;
pub mod transaction;

pub use block::{
    Block, BlockHeader, MerkleBlock, BLOCK_HEADER_SIZE, MAX_BLOCK_SIZE, MAX_BLOCK_WEIGHT,
    MIN_TX_SIZE,
};
pub use bloom::{BloomFilter, BloomFlags, MAX_BLOOM_FILTER_SIZE, MAX_HASH_FUNCS};
pub use encoding::{EncodingError, EncodingResult};
pub use transaction::{
    OutPoint, Transaction, TxInput, TxOutput, MAX_MONEY, MAX_SCRIPT_PUSH, SEQUENCE_FINAL,
};
