//! Compact block relay (BIP152)
//!
//! A compact block is a header, a list of 48-bit short transaction ids and
//! a few prefilled transactions (at least the coinbase). The receiver
//! rebuilds the block from its mempool and asks for whatever is missing
//! with `getblocktxn`.
//!
//! Short-id collisions are never fatal: `init` and the fill operations
//! report them through their return value so the caller can fall back to
//! requesting the full block.

use crate::core::encoding::{
    put_varint, read_count, read_hash, read_u16, read_u32, read_u64, read_varint, EncodingError,
    EncodingResult,
};
use crate::core::{
    Block, BlockHeader, Transaction, MAX_BLOCK_SIZE, MAX_BLOCK_WEIGHT, MIN_TX_SIZE,
};
use crate::crypto::siphash::SHORT_ID_SIZE;
use crate::crypto::{short_id, short_id_key, Hash256};
use bytes::{Buf, BufMut};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

/// Highest transaction index a differential encoding may produce
const MAX_INDEX: usize = 0xffff;

/// Sanity failures while preparing a received compact block
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompactBlockError {
    #[error("Empty vectors")]
    Empty,
    #[error("Compact block too big: {0} transactions")]
    TooBig(usize),
    #[error("Prefilled index {0} out of range")]
    IndexOutOfRange(usize),
}

/// Compact block with its reconstruction state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactBlock {
    pub header: BlockHeader,
    pub key_nonce: u64,
    /// Short ids, in block order of the non-prefilled transactions
    pub ids: Vec<u64>,
    /// Prefilled transactions with absolute block indexes
    pub prefilled: Vec<(usize, Arc<Transaction>)>,
    sip_key: [u8; 16],
    available: Vec<Option<Arc<Transaction>>>,
    id_map: HashMap<u64, usize>,
    count: usize,
}

impl CompactBlock {
    fn with_parts(
        header: BlockHeader,
        key_nonce: u64,
        ids: Vec<u64>,
        prefilled: Vec<(usize, Arc<Transaction>)>,
    ) -> Self {
        let sip_key = short_id_key(&header.to_bytes(), key_nonce);
        Self {
            header,
            key_nonce,
            ids,
            prefilled,
            sip_key,
            available: Vec::new(),
            id_map: HashMap::new(),
            count: 0,
        }
    }

    /// Build the announcement for `block`. The coinbase is always prefilled.
    pub fn from_block(block: &Block, witness: bool, key_nonce: u64) -> Self {
        let mut compact = Self::with_parts(block.header, key_nonce, Vec::new(), Vec::new());

        let mut txs = block.transactions.iter();
        if let Some(coinbase) = txs.next() {
            compact.prefilled.push((0, coinbase.clone()));
        }
        for tx in txs {
            let hash = if witness { tx.witness_hash() } else { tx.hash() };
            compact.ids.push(compact.sid(&hash));
        }

        compact
    }

    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    /// Short id of `hash` under this block's key
    pub fn sid(&self, hash: &Hash256) -> u64 {
        short_id(hash, &self.sip_key)
    }

    pub fn total_tx(&self) -> usize {
        self.ids.len() + self.prefilled.len()
    }

    /// Number of resolved slots
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_full(&self) -> bool {
        !self.available.is_empty() && self.count == self.available.len()
    }

    /// Number of entries in the short-id map
    pub fn mapped(&self) -> usize {
        self.id_map.len()
    }

    /// Lay out the availability table and the short-id map.
    ///
    /// `Ok(false)` means two short ids collided; the caller should request
    /// the full block instead.
    pub fn init(&mut self) -> Result<bool, CompactBlockError> {
        let total = self.total_tx();
        if total == 0 {
            return Err(CompactBlockError::Empty);
        }
        if total > MAX_BLOCK_SIZE / 10 {
            return Err(CompactBlockError::TooBig(total));
        }
        // Minimum-size transactions bound the hashing work a peer can cause
        if total > (MAX_BLOCK_SIZE - 81) / MIN_TX_SIZE {
            return Err(CompactBlockError::TooBig(total));
        }

        self.available = vec![None; total];
        self.id_map.clear();
        self.count = 0;

        for (index, tx) in &self.prefilled {
            if *index >= total {
                return Err(CompactBlockError::IndexOutOfRange(*index));
            }
            if self.available[*index].is_none() {
                self.count += 1;
            }
            self.available[*index] = Some(tx.clone());
        }

        let mut offset = 0;
        for (i, id) in self.ids.iter().enumerate() {
            while self.available[i + offset].is_some() {
                offset += 1;
            }
            if self.id_map.insert(*id, i + offset).is_some() {
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// Fill slots from a mempool snapshot. Returns true once every slot is
    /// resolved.
    ///
    /// When two pool entries claim the same slot the slot is emptied again:
    /// there is no way to tell which one the block contains.
    pub fn fill_mempool<'a, I>(&mut self, witness: bool, pool: I) -> bool
    where
        I: IntoIterator<Item = &'a Arc<Transaction>>,
    {
        if self.is_full() {
            return true;
        }

        let mut used = HashSet::new();

        for tx in pool {
            let hash = if witness { tx.witness_hash() } else { tx.hash() };
            let Some(&index) = self.id_map.get(&self.sid(&hash)) else {
                continue;
            };

            if !used.insert(index) {
                if self.available[index].take().is_some() {
                    self.count -= 1;
                }
                continue;
            }

            if self.available[index].is_some() {
                continue;
            }

            self.available[index] = Some(tx.clone());
            self.count += 1;

            if self.count == self.available.len() {
                return true;
            }
        }

        false
    }

    /// Fill the remaining slots from a `blocktxn` response, in order.
    /// Fails without touching anything unless the counts match exactly.
    pub fn fill_missing(&mut self, res: &TxResponse) -> bool {
        let missing = self.available.iter().filter(|tx| tx.is_none()).count();
        if missing != res.txs.len() {
            return false;
        }

        let mut txs = res.txs.iter();
        for slot in self.available.iter_mut().filter(|tx| tx.is_none()) {
            *slot = txs.next().cloned();
        }
        self.count = self.available.len();

        true
    }

    /// `getblocktxn` for every unresolved slot
    pub fn to_request(&self) -> TxRequest {
        let indexes = self
            .available
            .iter()
            .enumerate()
            .filter(|(_, tx)| tx.is_none())
            .map(|(i, _)| i)
            .collect();
        TxRequest::new(self.hash(), indexes)
    }

    /// The reconstructed block, once complete
    pub fn to_block(&self) -> Option<Block> {
        if !self.is_full() {
            return None;
        }
        let transactions = self.available.iter().flatten().cloned().collect();
        Some(Block {
            header: self.header,
            transactions,
        })
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B, witness: bool) {
        self.header.encode(buf);
        buf.put_u64_le(self.key_nonce);

        put_varint(buf, self.ids.len() as u64);
        for id in &self.ids {
            buf.put_u32_le((id & 0xffff_ffff) as u32);
            buf.put_u16_le(((id >> 32) & 0xffff) as u16);
        }

        put_varint(buf, self.prefilled.len() as u64);
        let mut last: Option<usize> = None;
        for (index, tx) in &self.prefilled {
            let delta = match last {
                Some(last) => index - last - 1,
                None => *index,
            };
            put_varint(buf, delta as u64);
            tx.encode(buf, witness);
            last = Some(*index);
        }
    }

    pub fn decode<B: Buf>(buf: &mut B) -> EncodingResult<Self> {
        let header = BlockHeader::decode(buf)?;
        let key_nonce = read_u64(buf)?;

        let id_count = read_count(buf, "short ids", MAX_BLOCK_WEIGHT / SHORT_ID_SIZE)?;
        let mut ids = Vec::with_capacity(id_count.min(MAX_BLOCK_SIZE / MIN_TX_SIZE));
        for _ in 0..id_count {
            let lo = read_u32(buf)? as u64;
            let hi = read_u16(buf)? as u64;
            ids.push((hi << 32) | lo);
        }

        let tx_count = read_count(buf, "prefilled", MAX_BLOCK_WEIGHT / MIN_TX_SIZE)?;
        let mut prefilled = Vec::with_capacity(tx_count.min(1024));
        let mut last: i64 = -1;
        for i in 0..tx_count {
            let delta = read_varint(buf)?;
            if delta > MAX_INDEX as u64 {
                return Err(EncodingError::TooLarge("prefilled index", delta, MAX_INDEX as u64));
            }
            last += delta as i64 + 1;
            if last as usize > MAX_INDEX || last as usize > ids.len() + i {
                return Err(EncodingError::InvalidData(format!(
                    "prefilled index {last} out of range"
                )));
            }
            let tx = Transaction::decode(buf)?;
            prefilled.push((last as usize, Arc::new(tx)));
        }

        Ok(Self::with_parts(header, key_nonce, ids, prefilled))
    }
}

/// `getblocktxn` payload: absolute indexes of the wanted transactions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRequest {
    pub hash: Hash256,
    pub indexes: Vec<usize>,
}

impl TxRequest {
    pub fn new(hash: Hash256, indexes: Vec<usize>) -> Self {
        Self { hash, indexes }
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(&self.hash);
        put_varint(buf, self.indexes.len() as u64);
        let mut prev: Option<usize> = None;
        for index in &self.indexes {
            let delta = match prev {
                Some(prev) => index - prev - 1,
                None => *index,
            };
            put_varint(buf, delta as u64);
            prev = Some(*index);
        }
    }

    pub fn decode<B: Buf>(buf: &mut B) -> EncodingResult<Self> {
        let hash = read_hash(buf)?;
        let count = read_count(buf, "indexes", MAX_INDEX + 1)?;
        let mut indexes = Vec::with_capacity(count);
        let mut offset = 0usize;
        for _ in 0..count {
            let delta = read_varint(buf)?;
            if delta > MAX_INDEX as u64 {
                return Err(EncodingError::TooLarge("index", delta, MAX_INDEX as u64));
            }
            let index = delta as usize + offset;
            if index > MAX_INDEX {
                return Err(EncodingError::TooLarge("index", index as u64, MAX_INDEX as u64));
            }
            indexes.push(index);
            offset = index + 1;
        }
        Ok(Self { hash, indexes })
    }
}

/// `blocktxn` payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxResponse {
    pub hash: Hash256,
    pub txs: Vec<Arc<Transaction>>,
}

impl TxResponse {
    pub fn new(hash: Hash256, txs: Vec<Arc<Transaction>>) -> Self {
        Self { hash, txs }
    }

    /// Answer `req` from a block we have. Indexes past the end stop the
    /// answer short.
    pub fn from_block(block: &Block, req: &TxRequest) -> Self {
        let txs = req
            .indexes
            .iter()
            .map_while(|index| block.transactions.get(*index).cloned())
            .collect();
        Self::new(req.hash, txs)
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B, witness: bool) {
        buf.put_slice(&self.hash);
        put_varint(buf, self.txs.len() as u64);
        for tx in &self.txs {
            tx.encode(buf, witness);
        }
    }

    pub fn decode<B: Buf>(buf: &mut B) -> EncodingResult<Self> {
        let hash = read_hash(buf)?;
        let count = read_count(buf, "transactions", MAX_INDEX + 1)?;
        let mut txs = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            txs.push(Arc::new(Transaction::decode(buf)?));
        }
        Ok(Self { hash, txs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{OutPoint, TxInput, TxOutput};

    fn block_with(count: u8) -> Block {
        let mut txs = vec![Arc::new(Transaction::coinbase(b"cb", 50, vec![0x51]))];
        for i in 1..count {
            let mut input = TxInput::new(OutPoint::new([i; 32], i as u32), vec![0x01, i]);
            if i % 2 == 0 {
                input.witness = vec![vec![i; 20]];
            }
            let output = TxOutput::new(i as i64, vec![0x51]);
            txs.push(Arc::new(Transaction::new(2, vec![input], vec![output], 0)));
        }
        let header = BlockHeader {
            version: 0x2000_0000,
            prev_block: [9; 32],
            merkle_root: [0; 32],
            time: 1_650_000_000,
            bits: 0x1d00_ffff,
            nonce: 42,
        };
        Block::new(header, txs)
    }

    fn received(block: &Block, witness: bool) -> CompactBlock {
        let mut raw = Vec::new();
        CompactBlock::from_block(block, witness, 0x1122_3344_5566_7788).encode(&mut raw, witness);
        CompactBlock::decode(&mut &raw[..]).unwrap()
    }

    #[test]
    fn test_rebuild_from_mempool() {
        let block = block_with(12);
        let mut compact = received(&block, true);

        assert!(compact.init().unwrap());
        assert_eq!(compact.total_tx(), 12);
        assert_eq!(compact.available.len(), 12);
        assert_eq!(compact.mapped(), 12 - compact.prefilled.len());
        assert_eq!(compact.count(), 1);

        // Pool order differs from block order
        let mut pool: Vec<Arc<Transaction>> = block.transactions[1..].to_vec();
        pool.reverse();
        assert!(compact.fill_mempool(true, &pool));

        let rebuilt = compact.to_block().unwrap();
        assert_eq!(rebuilt.header, block.header);
        assert_eq!(rebuilt.hash(), block.hash());
        assert_eq!(rebuilt.transactions, block.transactions);
    }

    #[test]
    fn test_witness_ids_differ_from_legacy() {
        let block = block_with(4);
        let mut compact = received(&block, true);
        assert!(compact.init().unwrap());
        // Legacy hashes do not resolve the witness transaction at index 2
        assert!(!compact.fill_mempool(false, &block.transactions[1..]));
        assert!(compact.available[2].is_none());
    }

    #[test]
    fn test_missing_round_trip() {
        let block = block_with(12);
        let mut compact = received(&block, false);
        assert!(compact.init().unwrap());

        let missing = [2usize, 5, 6, 9];
        let pool: Vec<Arc<Transaction>> = block
            .transactions
            .iter()
            .enumerate()
            .filter(|(i, _)| *i > 0 && !missing.contains(i))
            .map(|(_, tx)| tx.clone())
            .collect();
        assert!(!compact.fill_mempool(false, &pool));

        let req = compact.to_request();
        assert_eq!(req.indexes, missing.to_vec());
        let mut raw = Vec::new();
        req.encode(&mut raw);
        let decoded = TxRequest::decode(&mut &raw[..]).unwrap();
        assert_eq!(decoded, req);

        let res = TxResponse::from_block(&block, &decoded);
        assert_eq!(res.txs.len(), 4);

        let mut short = compact.clone();
        let three = TxResponse::new(res.hash, res.txs[..3].to_vec());
        assert!(!short.fill_missing(&three));

        let mut five_txs = res.txs.clone();
        five_txs.push(block.transactions[1].clone());
        assert!(!short.fill_missing(&TxResponse::new(res.hash, five_txs)));

        assert!(compact.fill_missing(&res));
        assert!(compact.available.iter().all(|tx| tx.is_some()));
        assert_eq!(compact.to_block().unwrap().transactions, block.transactions);
    }

    #[test]
    fn test_request_delta_encoding() {
        let req = TxRequest::new([1; 32], vec![2, 5, 6, 9]);
        let mut raw = Vec::new();
        req.encode(&mut raw);
        // hash, count, then 2, 2, 0, 2
        assert_eq!(&raw[32..], &[4, 2, 2, 0, 2]);
        assert_eq!(TxRequest::decode(&mut &raw[..]).unwrap(), req);
    }

    #[test]
    fn test_short_id_collision_fails_init() {
        let block = block_with(5);
        let mut compact = received(&block, false);
        compact.ids[2] = compact.ids[1];
        assert_eq!(compact.init(), Ok(false));
    }

    #[test]
    fn test_pool_collision_unfills_slot() {
        let block = block_with(4);
        let mut compact = received(&block, false);
        assert!(compact.init().unwrap());

        // A second pool entry claiming slot 1
        let other = Arc::new(Transaction::coinbase(b"other", 1, vec![0x52]));
        compact.id_map.insert(compact.sid(&other.hash()), 1);

        let pool = vec![block.transactions[1].clone(), other];
        assert!(!compact.fill_mempool(false, &pool));
        assert!(compact.available[1].is_none());
        assert_eq!(compact.count(), 1);
        assert_eq!(compact.to_request().indexes, vec![1, 2, 3]);
    }

    #[test]
    fn test_sanity_limits() {
        let header = block_with(1).header;
        let mut empty = CompactBlock::with_parts(header, 0, Vec::new(), Vec::new());
        assert_eq!(empty.init(), Err(CompactBlockError::Empty));

        let ids = (0..(MAX_BLOCK_SIZE - 81) as u64 / 60 + 1).collect();
        let mut big = CompactBlock::with_parts(header, 0, ids, Vec::new());
        assert!(matches!(big.init(), Err(CompactBlockError::TooBig(_))));
    }

    #[test]
    fn test_prefilled_index_out_of_range() {
        let block = block_with(3);
        let mut compact = CompactBlock::from_block(&block, false, 1);
        // Index 5 with only two short ids
        compact.prefilled[0].0 = 5;
        let mut raw = Vec::new();
        compact.encode(&mut raw, false);
        assert!(CompactBlock::decode(&mut &raw[..]).is_err());
    }

    #[test]
    fn test_response_stops_at_block_end() {
        let block = block_with(3);
        let req = TxRequest::new(block.hash(), vec![1, 7]);
        let res = TxResponse::from_block(&block, &req);
        assert_eq!(res.txs.len(), 1);
    }
}
