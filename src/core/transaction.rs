//! Transactions as they travel over the wire
//!
//! Only what the session engine needs: consensus serialization (legacy and
//! segwit), cached txid/wtxid, and BIP37 filter matching. No script
//! execution or policy checks happen here.

use crate::core::bloom::{BloomFilter, BloomFlags};
use crate::core::encoding::{
    put_var_bytes, put_varint, read_count, read_hash, read_i32, read_i64, read_u32, read_u8,
    read_var_bytes, varint_size, EncodingError, EncodingResult,
};
use crate::crypto::{double_sha256, Hash256, ZERO_HASH};
use bytes::{Buf, BufMut};

// =============================================================================
// Constants
// =============================================================================

/// Sequence number that disables locktime
pub const SEQUENCE_FINAL: u32 = 0xFFFFFFFF;

/// Largest single push a filter element may carry (`filteradd`)
pub const MAX_SCRIPT_PUSH: usize = 520;

/// 21 million coins in satoshis
pub const MAX_MONEY: i64 = 21_000_000 * 100_000_000;

/// Upper bound for any script or witness item we are willing to decode
const MAX_SCRIPT_SIZE: usize = 10_000;

/// Upper bound for input/output counts (a 4 MB block of minimal entries)
const MAX_ENTRIES: usize = 100_000;

const OP_PUSHDATA1: u8 = 0x4c;
const OP_PUSHDATA2: u8 = 0x4d;
const OP_PUSHDATA4: u8 = 0x4e;
const OP_1: u8 = 0x51;
const OP_16: u8 = 0x60;
const OP_CHECKSIG: u8 = 0xac;
const OP_CHECKMULTISIG: u8 = 0xae;

/// Reference to a previous transaction output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutPoint {
    pub hash: Hash256,
    pub index: u32,
}

impl OutPoint {
    pub fn new(hash: Hash256, index: u32) -> Self {
        Self { hash, index }
    }

    /// The outpoint spent by a coinbase input
    pub fn null() -> Self {
        Self::new(ZERO_HASH, u32::MAX)
    }

    pub fn is_null(&self) -> bool {
        self.hash == ZERO_HASH && self.index == u32::MAX
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(&self.hash);
        buf.put_u32_le(self.index);
    }

    pub fn to_bytes(&self) -> [u8; 36] {
        let mut out = [0u8; 36];
        out[..32].copy_from_slice(&self.hash);
        out[32..].copy_from_slice(&self.index.to_le_bytes());
        out
    }

    pub fn decode<B: Buf>(buf: &mut B) -> EncodingResult<Self> {
        Ok(Self::new(read_hash(buf)?, read_u32(buf)?))
    }
}

/// Transaction input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxInput {
    pub prevout: OutPoint,
    pub script: Vec<u8>,
    pub sequence: u32,
    /// Segregated witness stack (empty for legacy inputs)
    pub witness: Vec<Vec<u8>>,
}

impl TxInput {
    pub fn new(prevout: OutPoint, script: Vec<u8>) -> Self {
        Self {
            prevout,
            script,
            sequence: SEQUENCE_FINAL,
            witness: Vec::new(),
        }
    }
}

/// Transaction output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutput {
    /// Amount in satoshis
    pub value: i64,
    pub script: Vec<u8>,
}

impl TxOutput {
    pub fn new(value: i64, script: Vec<u8>) -> Self {
        Self { value, script }
    }
}

/// A transaction with its txid and wtxid computed once at construction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub locktime: u32,
    txid: Hash256,
    wtxid: Hash256,
}

impl Transaction {
    pub fn new(version: i32, inputs: Vec<TxInput>, outputs: Vec<TxOutput>, locktime: u32) -> Self {
        let mut tx = Self {
            version,
            inputs,
            outputs,
            locktime,
            txid: ZERO_HASH,
            wtxid: ZERO_HASH,
        };
        tx.txid = double_sha256(&tx.to_bytes(false));
        tx.wtxid = if tx.has_witness() {
            double_sha256(&tx.to_bytes(true))
        } else {
            tx.txid
        };
        tx
    }

    /// Coinbase paying `value` to `script`; `tag` ends up in the input script
    pub fn coinbase(tag: &[u8], value: i64, script: Vec<u8>) -> Self {
        let input = TxInput::new(OutPoint::null(), tag.to_vec());
        Self::new(1, vec![input], vec![TxOutput::new(value, script)], 0)
    }

    /// Transaction id (hash of the legacy serialization)
    pub fn hash(&self) -> Hash256 {
        self.txid
    }

    /// Witness transaction id (equals the txid when there is no witness)
    pub fn witness_hash(&self) -> Hash256 {
        self.wtxid
    }

    pub fn has_witness(&self) -> bool {
        self.inputs.iter().any(|input| !input.witness.is_empty())
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].prevout.is_null()
    }

    /// Serialize, including witness data when `witness` is set and present
    pub fn encode<B: BufMut>(&self, buf: &mut B, witness: bool) {
        let witness = witness && self.has_witness();

        buf.put_i32_le(self.version);
        if witness {
            buf.put_u8(0);
            buf.put_u8(1);
        }

        put_varint(buf, self.inputs.len() as u64);
        for input in &self.inputs {
            input.prevout.encode(buf);
            put_var_bytes(buf, &input.script);
            buf.put_u32_le(input.sequence);
        }

        put_varint(buf, self.outputs.len() as u64);
        for output in &self.outputs {
            buf.put_i64_le(output.value);
            put_var_bytes(buf, &output.script);
        }

        if witness {
            for input in &self.inputs {
                put_varint(buf, input.witness.len() as u64);
                for item in &input.witness {
                    put_var_bytes(buf, item);
                }
            }
        }

        buf.put_u32_le(self.locktime);
    }

    pub fn to_bytes(&self, witness: bool) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.size());
        self.encode(&mut buf, witness);
        buf
    }

    /// Serialized size including witness data
    pub fn size(&self) -> usize {
        let mut size = 4 + 4;
        size += varint_size(self.inputs.len() as u64);
        for input in &self.inputs {
            size += 36 + varint_size(input.script.len() as u64) + input.script.len() + 4;
        }
        size += varint_size(self.outputs.len() as u64);
        for output in &self.outputs {
            size += 8 + varint_size(output.script.len() as u64) + output.script.len();
        }
        if self.has_witness() {
            size += 2;
            for input in &self.inputs {
                size += varint_size(input.witness.len() as u64);
                for item in &input.witness {
                    size += varint_size(item.len() as u64) + item.len();
                }
            }
        }
        size
    }

    pub fn decode<B: Buf>(buf: &mut B) -> EncodingResult<Self> {
        let version = read_i32(buf)?;

        let mut flag = 0u8;
        let mut input_count = read_count(buf, "inputs", MAX_ENTRIES)?;
        if input_count == 0 {
            // Either the segwit marker or a genuinely empty input list
            flag = read_u8(buf)?;
            if flag != 0 {
                input_count = read_count(buf, "inputs", MAX_ENTRIES)?;
            }
        }

        let mut inputs = Vec::with_capacity(input_count.min(1024));
        for _ in 0..input_count {
            let prevout = OutPoint::decode(buf)?;
            let script = read_var_bytes(buf, MAX_SCRIPT_SIZE)?;
            let sequence = read_u32(buf)?;
            inputs.push(TxInput {
                prevout,
                script,
                sequence,
                witness: Vec::new(),
            });
        }

        // An empty input list followed by a zero flag means no outputs either
        let output_count = if input_count == 0 && flag == 0 {
            0
        } else {
            read_count(buf, "outputs", MAX_ENTRIES)?
        };
        let mut outputs = Vec::with_capacity(output_count.min(1024));
        for _ in 0..output_count {
            let value = read_i64(buf)?;
            let script = read_var_bytes(buf, MAX_SCRIPT_SIZE)?;
            outputs.push(TxOutput { value, script });
        }

        if flag & 1 != 0 {
            flag ^= 1;
            for input in &mut inputs {
                let items = read_count(buf, "witness items", MAX_ENTRIES)?;
                for _ in 0..items {
                    input.witness.push(read_var_bytes(buf, MAX_SCRIPT_SIZE)?);
                }
            }
            if inputs.iter().all(|input| input.witness.is_empty()) {
                return Err(EncodingError::InvalidData("superfluous witness".into()));
            }
        }

        if flag != 0 {
            return Err(EncodingError::InvalidData(format!(
                "unknown transaction flag {flag}"
            )));
        }

        let locktime = read_u32(buf)?;
        Ok(Self::new(version, inputs, outputs, locktime))
    }

    /// BIP37 relevance test. Matching outputs may insert their outpoint
    /// into the filter, depending on its update flags.
    pub fn is_watched(&self, filter: &mut BloomFilter) -> bool {
        let hash = self.hash();
        let mut found = filter.contains(&hash);

        for (index, output) in self.outputs.iter().enumerate() {
            let hit = pushed_data(&output.script)
                .into_iter()
                .any(|data| filter.contains(data));
            if !hit {
                continue;
            }
            found = true;

            let outpoint = OutPoint::new(hash, index as u32);
            match filter.flags() {
                BloomFlags::All => filter.insert(&outpoint.to_bytes()),
                BloomFlags::PubkeyOnly if is_pubkey_script(&output.script) => {
                    filter.insert(&outpoint.to_bytes())
                }
                _ => {}
            }
        }

        if found {
            return true;
        }

        self.inputs.iter().any(|input| {
            filter.contains(&input.prevout.to_bytes())
                || pushed_data(&input.script)
                    .into_iter()
                    .any(|data| filter.contains(data))
        })
    }
}

/// Data pushes of a script, stopping at the first malformed opcode
fn pushed_data(script: &[u8]) -> Vec<&[u8]> {
    let mut pushes = Vec::new();
    let mut i = 0;

    while i < script.len() {
        let op = script[i];
        i += 1;

        let len = match op {
            0x01..=0x4b => op as usize,
            OP_PUSHDATA1 => {
                let Some(n) = script.get(i) else { break };
                i += 1;
                *n as usize
            }
            OP_PUSHDATA2 => {
                let Some(n) = script.get(i..i + 2) else { break };
                i += 2;
                u16::from_le_bytes([n[0], n[1]]) as usize
            }
            OP_PUSHDATA4 => {
                let Some(n) = script.get(i..i + 4) else { break };
                i += 4;
                u32::from_le_bytes([n[0], n[1], n[2], n[3]]) as usize
            }
            _ => continue,
        };

        let Some(data) = script.get(i..i + len) else {
            break;
        };
        pushes.push(data);
        i += len;
    }

    pushes
}

/// Pay-to-pubkey or bare multisig output
fn is_pubkey_script(script: &[u8]) -> bool {
    let len = script.len();
    let p2pk = ((len == 35 && script[0] == 33) || (len == 67 && script[0] == 65))
        && script[len - 1] == OP_CHECKSIG;
    let multisig = len >= 3
        && (OP_1..=OP_16).contains(&script[0])
        && (OP_1..=OP_16).contains(&script[len - 2])
        && script[len - 1] == OP_CHECKMULTISIG;
    p2pk || multisig
}
