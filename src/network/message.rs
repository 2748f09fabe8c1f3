//! Network message types for P2P communication
//!
//! Defines the Bitcoin wire protocol message catalog: one variant per
//! command, each with its consensus payload encoding.

use crate::core::encoding::{
    put_var_bytes, put_varint, read_count, read_exact, read_hash, read_i32, read_i64,
    read_u16_be, read_u32, read_u64, read_u8, read_var_bytes, read_var_string, EncodingError,
    EncodingResult,
};
use crate::core::{Block, BlockHeader, BloomFilter, MerkleBlock, Transaction};
use crate::crypto::Hash256;
use crate::network::compact::{CompactBlock, TxRequest, TxResponse};
use bitflags::bitflags;
use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

// =============================================================================
// Protocol Constants
// =============================================================================

/// Protocol version we speak
pub const PROTOCOL_VERSION: u32 = 70015;

/// Oldest protocol version we accept
pub const MIN_VERSION: u32 = 70001;

/// First version with `getheaders`
pub const HEADERS_VERSION: u32 = 31800;

/// First version whose pings carry a nonce and expect a pong
pub const PONG_VERSION: u32 = 60000;

/// First version with the `filterload` relay flag semantics
pub const BLOOM_VERSION: u32 = 70011;

/// First version with `sendheaders`
pub const SENDHEADERS_VERSION: u32 = 70012;

/// First version with compact blocks
pub const COMPACT_VERSION: u32 = 70014;

/// First version with witness compact blocks
pub const COMPACT_WITNESS_VERSION: u32 = 70015;

/// Maximum inventory items per message
pub const MAX_INV: usize = 50_000;

/// Maximum addresses per `addr`
pub const MAX_ADDR: usize = 1_000;

/// Maximum headers per `headers`
pub const MAX_HEADERS: usize = 2_000;

/// Maximum locator hashes
pub const MAX_LOCATOR: usize = 101;

/// Maximum user agent length
pub const MAX_USER_AGENT: usize = 256;

const MAX_REJECT_STRING: usize = 111;
const MAX_FILTER_ADD: usize = 10_000;
const WITNESS_FLAG: u32 = 1 << 30;

bitflags! {
    /// Service bits advertised in `version` and `addr`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ServiceFlags: u64 {
        /// Full node serving the whole chain
        const NETWORK = 1;
        /// BIP64 utxo queries
        const GETUTXO = 1 << 1;
        /// BIP37 bloom filtering
        const BLOOM = 1 << 2;
        /// Segregated witness
        const WITNESS = 1 << 3;
    }
}

// =============================================================================
// Commands
// =============================================================================

/// Numeric command identifiers. Ordering follows the ids, which is the
/// iteration order of the pending-response table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Command {
    Version = 0,
    Verack = 1,
    Ping = 2,
    Pong = 3,
    GetAddr = 4,
    Addr = 5,
    Inv = 6,
    GetData = 7,
    NotFound = 8,
    GetBlocks = 9,
    GetHeaders = 10,
    Headers = 11,
    SendHeaders = 12,
    Block = 13,
    Tx = 14,
    Reject = 15,
    Mempool = 16,
    FilterLoad = 17,
    FilterAdd = 18,
    FilterClear = 19,
    MerkleBlock = 20,
    FeeFilter = 21,
    SendCmpct = 22,
    CmpctBlock = 23,
    GetBlockTxn = 24,
    BlockTxn = 25,
    EncInit = 26,
    EncAck = 27,
    AuthChallenge = 28,
    AuthReply = 29,
    AuthPropose = 30,
    Unknown = 31,
    /// Synthetic: satisfied by any block, tx or notfound
    Data = 33,
}

impl Command {
    const ALL: [Command; 31] = [
        Command::Version,
        Command::Verack,
        Command::Ping,
        Command::Pong,
        Command::GetAddr,
        Command::Addr,
        Command::Inv,
        Command::GetData,
        Command::NotFound,
        Command::GetBlocks,
        Command::GetHeaders,
        Command::Headers,
        Command::SendHeaders,
        Command::Block,
        Command::Tx,
        Command::Reject,
        Command::Mempool,
        Command::FilterLoad,
        Command::FilterAdd,
        Command::FilterClear,
        Command::MerkleBlock,
        Command::FeeFilter,
        Command::SendCmpct,
        Command::CmpctBlock,
        Command::GetBlockTxn,
        Command::BlockTxn,
        Command::EncInit,
        Command::EncAck,
        Command::AuthChallenge,
        Command::AuthReply,
        Command::AuthPropose,
    ];

    pub fn id(self) -> u8 {
        self as u8
    }

    /// Wire name of the command
    pub fn name(self) -> &'static str {
        match self {
            Command::Version => "version",
            Command::Verack => "verack",
            Command::Ping => "ping",
            Command::Pong => "pong",
            Command::GetAddr => "getaddr",
            Command::Addr => "addr",
            Command::Inv => "inv",
            Command::GetData => "getdata",
            Command::NotFound => "notfound",
            Command::GetBlocks => "getblocks",
            Command::GetHeaders => "getheaders",
            Command::Headers => "headers",
            Command::SendHeaders => "sendheaders",
            Command::Block => "block",
            Command::Tx => "tx",
            Command::Reject => "reject",
            Command::Mempool => "mempool",
            Command::FilterLoad => "filterload",
            Command::FilterAdd => "filteradd",
            Command::FilterClear => "filterclear",
            Command::MerkleBlock => "merkleblock",
            Command::FeeFilter => "feefilter",
            Command::SendCmpct => "sendcmpct",
            Command::CmpctBlock => "cmpctblock",
            Command::GetBlockTxn => "getblocktxn",
            Command::BlockTxn => "blocktxn",
            Command::EncInit => "encinit",
            Command::EncAck => "encack",
            Command::AuthChallenge => "authchallenge",
            Command::AuthReply => "authreply",
            Command::AuthPropose => "authpropose",
            Command::Unknown => "unknown",
            Command::Data => "data",
        }
    }

    /// Look up a wire command; `None` for anything we do not parse
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|cmd| cmd.name() == name)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Payload Types
// =============================================================================

/// Network address as carried in `version` and `addr`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetAddress {
    pub time: u32,
    pub services: ServiceFlags,
    pub addr: SocketAddr,
}

impl NetAddress {
    pub fn new(addr: SocketAddr, services: ServiceFlags) -> Self {
        Self {
            time: 0,
            services,
            addr,
        }
    }

    /// Unroutable placeholder used when the address is unknown
    pub fn unspecified() -> Self {
        Self::new(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            ServiceFlags::empty(),
        )
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B, with_time: bool) {
        if with_time {
            buf.put_u32_le(self.time);
        }
        buf.put_u64_le(self.services.bits());
        let ip = match self.addr.ip() {
            IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            IpAddr::V6(v6) => v6,
        };
        buf.put_slice(&ip.octets());
        buf.put_u16(self.addr.port());
    }

    pub fn decode<B: Buf>(buf: &mut B, with_time: bool) -> EncodingResult<Self> {
        let time = if with_time { read_u32(buf)? } else { 0 };
        let services = ServiceFlags::from_bits_retain(read_u64(buf)?);
        let mut octets = [0u8; 16];
        read_exact(buf, &mut octets)?;
        let v6 = Ipv6Addr::from(octets);
        let ip = match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        };
        let port = read_u16_be(buf)?;
        Ok(Self {
            time,
            services,
            addr: SocketAddr::new(ip, port),
        })
    }
}

/// `version` payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    pub version: u32,
    pub services: ServiceFlags,
    pub time: i64,
    pub remote: NetAddress,
    pub local: NetAddress,
    pub nonce: u64,
    pub agent: String,
    pub height: i32,
    pub no_relay: bool,
}

impl VersionMessage {
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_i32_le(self.version as i32);
        buf.put_u64_le(self.services.bits());
        buf.put_i64_le(self.time);
        self.remote.encode(buf, false);
        self.local.encode(buf, false);
        buf.put_u64_le(self.nonce);
        put_var_bytes(buf, self.agent.as_bytes());
        buf.put_i32_le(self.height);
        buf.put_u8(if self.no_relay { 0 } else { 1 });
    }

    pub fn decode<B: Buf>(buf: &mut B) -> EncodingResult<Self> {
        let version = read_i32(buf)?.max(0) as u32;
        let services = ServiceFlags::from_bits_retain(read_u64(buf)?);
        let time = read_i64(buf)?;
        let remote = NetAddress::decode(buf, false)?;

        // Very old peers stop here
        let (local, nonce, agent, height) = if buf.has_remaining() {
            (
                NetAddress::decode(buf, false)?,
                read_u64(buf)?,
                read_var_string(buf, MAX_USER_AGENT)?,
                read_i32(buf)?,
            )
        } else {
            (NetAddress::unspecified(), 0, String::new(), 0)
        };

        let no_relay = if buf.has_remaining() {
            read_u8(buf)? == 0
        } else {
            false
        };

        Ok(Self {
            version,
            services,
            time,
            remote,
            local,
            nonce,
            agent,
            height,
            no_relay,
        })
    }
}

/// Inventory item types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvType {
    Error,
    Tx,
    Block,
    FilteredBlock,
    CmpctBlock,
    WitnessTx,
    WitnessBlock,
    WitnessFilteredBlock,
}

impl InvType {
    pub fn to_u32(self) -> u32 {
        match self {
            InvType::Error => 0,
            InvType::Tx => 1,
            InvType::Block => 2,
            InvType::FilteredBlock => 3,
            InvType::CmpctBlock => 4,
            InvType::WitnessTx => 1 | WITNESS_FLAG,
            InvType::WitnessBlock => 2 | WITNESS_FLAG,
            InvType::WitnessFilteredBlock => 3 | WITNESS_FLAG,
        }
    }

    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            0 => InvType::Error,
            1 => InvType::Tx,
            2 => InvType::Block,
            3 => InvType::FilteredBlock,
            4 => InvType::CmpctBlock,
            v if v == 1 | WITNESS_FLAG => InvType::WitnessTx,
            v if v == 2 | WITNESS_FLAG => InvType::WitnessBlock,
            v if v == 3 | WITNESS_FLAG => InvType::WitnessFilteredBlock,
            _ => return None,
        })
    }
}

/// Inventory vector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InvItem {
    pub kind: InvType,
    pub hash: Hash256,
}

impl InvItem {
    pub fn new(kind: InvType, hash: Hash256) -> Self {
        Self { kind, hash }
    }

    pub fn is_block(&self) -> bool {
        matches!(
            self.kind,
            InvType::Block
                | InvType::WitnessBlock
                | InvType::FilteredBlock
                | InvType::WitnessFilteredBlock
                | InvType::CmpctBlock
        )
    }

    pub fn is_tx(&self) -> bool {
        matches!(self.kind, InvType::Tx | InvType::WitnessTx)
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.kind.to_u32());
        buf.put_slice(&self.hash);
    }

    pub fn decode<B: Buf>(buf: &mut B) -> EncodingResult<Self> {
        let raw = read_u32(buf)?;
        let kind = InvType::from_u32(raw)
            .ok_or_else(|| EncodingError::InvalidData(format!("unknown inv type {raw}")))?;
        Ok(Self::new(kind, read_hash(buf)?))
    }
}

/// `getblocks` / `getheaders` payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatorMessage {
    pub version: u32,
    pub locator: Vec<Hash256>,
    /// All-zero means "as many as allowed"
    pub stop: Hash256,
}

impl LocatorMessage {
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.version);
        put_varint(buf, self.locator.len() as u64);
        for hash in &self.locator {
            buf.put_slice(hash);
        }
        buf.put_slice(&self.stop);
    }

    pub fn decode<B: Buf>(buf: &mut B) -> EncodingResult<Self> {
        let version = read_u32(buf)?;
        let count = read_count(buf, "locator", MAX_LOCATOR)?;
        let mut locator = Vec::with_capacity(count);
        for _ in 0..count {
            locator.push(read_hash(buf)?);
        }
        Ok(Self {
            version,
            locator,
            stop: read_hash(buf)?,
        })
    }
}

/// Reject codes (BIP61)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectCode {
    Malformed,
    Invalid,
    Obsolete,
    Duplicate,
    Nonstandard,
    Dust,
    InsufficientFee,
    Checkpoint,
}

impl RejectCode {
    pub fn to_u8(self) -> u8 {
        match self {
            RejectCode::Malformed => 0x01,
            RejectCode::Invalid => 0x10,
            RejectCode::Obsolete => 0x11,
            RejectCode::Duplicate => 0x12,
            RejectCode::Nonstandard => 0x40,
            RejectCode::Dust => 0x41,
            RejectCode::InsufficientFee => 0x42,
            RejectCode::Checkpoint => 0x43,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x01 => RejectCode::Malformed,
            0x10 => RejectCode::Invalid,
            0x11 => RejectCode::Obsolete,
            0x12 => RejectCode::Duplicate,
            0x40 => RejectCode::Nonstandard,
            0x41 => RejectCode::Dust,
            0x42 => RejectCode::InsufficientFee,
            0x43 => RejectCode::Checkpoint,
            _ => return None,
        })
    }
}

/// `reject` payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectMessage {
    /// Command being rejected
    pub message: String,
    pub code: RejectCode,
    pub reason: String,
    /// Present when rejecting a block or transaction
    pub hash: Option<Hash256>,
}

impl RejectMessage {
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        put_var_bytes(buf, self.message.as_bytes());
        buf.put_u8(self.code.to_u8());
        put_var_bytes(buf, self.reason.as_bytes());
        if let Some(hash) = &self.hash {
            buf.put_slice(hash);
        }
    }

    pub fn decode<B: Buf>(buf: &mut B) -> EncodingResult<Self> {
        let message = read_var_string(buf, 12)?;
        let raw = read_u8(buf)?;
        let code = RejectCode::from_u8(raw)
            .ok_or_else(|| EncodingError::InvalidData(format!("unknown reject code {raw}")))?;
        let reason = read_var_string(buf, MAX_REJECT_STRING)?;
        let hash = if (message == "block" || message == "tx") && buf.remaining() >= 32 {
            Some(read_hash(buf)?)
        } else {
            None
        };
        Ok(Self {
            message,
            code,
            reason,
            hash,
        })
    }
}

// =============================================================================
// Messages
// =============================================================================

/// Network message types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Version(VersionMessage),
    Verack,
    /// Legacy peers send pings without a nonce
    Ping(Option<u64>),
    Pong(u64),
    GetAddr,
    Addr(Vec<NetAddress>),
    Inv(Vec<InvItem>),
    GetData(Vec<InvItem>),
    NotFound(Vec<InvItem>),
    GetBlocks(LocatorMessage),
    GetHeaders(LocatorMessage),
    Headers(Vec<BlockHeader>),
    SendHeaders,
    Block {
        block: Arc<Block>,
        witness: bool,
    },
    Tx {
        tx: Arc<Transaction>,
        witness: bool,
    },
    Reject(RejectMessage),
    Mempool,
    FilterLoad(BloomFilter),
    FilterAdd(Vec<u8>),
    FilterClear,
    MerkleBlock(MerkleBlock),
    FeeFilter(i64),
    SendCmpct {
        mode: u8,
        version: u64,
    },
    CmpctBlock {
        block: CompactBlock,
        witness: bool,
    },
    GetBlockTxn(TxRequest),
    BlockTxn {
        response: TxResponse,
        witness: bool,
    },
    /// Ephemeral public key and cipher selection (BIP151)
    EncInit {
        public_key: [u8; 33],
        cipher: u8,
    },
    EncAck {
        public_key: [u8; 33],
    },
    /// BIP150 messages
    AuthChallenge(Hash256),
    AuthReply([u8; 64]),
    AuthPropose(Hash256),
    /// Anything we do not understand, kept verbatim
    Unknown {
        command: String,
        payload: Vec<u8>,
    },
}

impl Message {
    pub fn command(&self) -> Command {
        match self {
            Message::Version(_) => Command::Version,
            Message::Verack => Command::Verack,
            Message::Ping(_) => Command::Ping,
            Message::Pong(_) => Command::Pong,
            Message::GetAddr => Command::GetAddr,
            Message::Addr(_) => Command::Addr,
            Message::Inv(_) => Command::Inv,
            Message::GetData(_) => Command::GetData,
            Message::NotFound(_) => Command::NotFound,
            Message::GetBlocks(_) => Command::GetBlocks,
            Message::GetHeaders(_) => Command::GetHeaders,
            Message::Headers(_) => Command::Headers,
            Message::SendHeaders => Command::SendHeaders,
            Message::Block { .. } => Command::Block,
            Message::Tx { .. } => Command::Tx,
            Message::Reject(_) => Command::Reject,
            Message::Mempool => Command::Mempool,
            Message::FilterLoad(_) => Command::FilterLoad,
            Message::FilterAdd(_) => Command::FilterAdd,
            Message::FilterClear => Command::FilterClear,
            Message::MerkleBlock(_) => Command::MerkleBlock,
            Message::FeeFilter(_) => Command::FeeFilter,
            Message::SendCmpct { .. } => Command::SendCmpct,
            Message::CmpctBlock { .. } => Command::CmpctBlock,
            Message::GetBlockTxn(_) => Command::GetBlockTxn,
            Message::BlockTxn { .. } => Command::BlockTxn,
            Message::EncInit { .. } => Command::EncInit,
            Message::EncAck { .. } => Command::EncAck,
            Message::AuthChallenge(_) => Command::AuthChallenge,
            Message::AuthReply(_) => Command::AuthReply,
            Message::AuthPropose(_) => Command::AuthPropose,
            Message::Unknown { .. } => Command::Unknown,
        }
    }

    /// Wire name (the original command string for unknown messages)
    pub fn name(&self) -> &str {
        match self {
            Message::Unknown { command, .. } => command,
            other => other.command().name(),
        }
    }

    /// Serialize the payload (without the frame header)
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Message::Version(version) => version.encode(&mut buf),
            Message::Verack
            | Message::GetAddr
            | Message::SendHeaders
            | Message::Mempool
            | Message::FilterClear => {}
            Message::Ping(nonce) => {
                if let Some(nonce) = nonce {
                    buf.put_u64_le(*nonce);
                }
            }
            Message::Pong(nonce) => buf.put_u64_le(*nonce),
            Message::Addr(addrs) => {
                put_varint(&mut buf, addrs.len() as u64);
                for addr in addrs {
                    addr.encode(&mut buf, true);
                }
            }
            Message::Inv(items) | Message::GetData(items) | Message::NotFound(items) => {
                put_varint(&mut buf, items.len() as u64);
                for item in items {
                    item.encode(&mut buf);
                }
            }
            Message::GetBlocks(locator) | Message::GetHeaders(locator) => locator.encode(&mut buf),
            Message::Headers(headers) => {
                put_varint(&mut buf, headers.len() as u64);
                for header in headers {
                    header.encode(&mut buf);
                    put_varint(&mut buf, 0);
                }
            }
            Message::Block { block, witness } => block.encode(&mut buf, *witness),
            Message::Tx { tx, witness } => tx.encode(&mut buf, *witness),
            Message::Reject(reject) => reject.encode(&mut buf),
            Message::FilterLoad(filter) => filter.encode(&mut buf),
            Message::FilterAdd(data) => put_var_bytes(&mut buf, data),
            Message::MerkleBlock(block) => block.encode(&mut buf),
            Message::FeeFilter(rate) => buf.put_i64_le(*rate),
            Message::SendCmpct { mode, version } => {
                buf.put_u8(*mode);
                buf.put_u64_le(*version);
            }
            Message::CmpctBlock { block, witness } => block.encode(&mut buf, *witness),
            Message::GetBlockTxn(request) => request.encode(&mut buf),
            Message::BlockTxn { response, witness } => response.encode(&mut buf, *witness),
            Message::EncInit { public_key, cipher } => {
                buf.put_slice(public_key);
                buf.put_u8(*cipher);
            }
            Message::EncAck { public_key } => buf.put_slice(public_key),
            Message::AuthChallenge(hash) | Message::AuthPropose(hash) => buf.put_slice(hash),
            Message::AuthReply(sig) => buf.put_slice(sig),
            Message::Unknown { payload, .. } => buf.put_slice(payload),
        }
        buf
    }

    /// Parse a payload received under `command`
    pub fn decode(command: &str, payload: &[u8]) -> EncodingResult<Self> {
        let Some(cmd) = Command::from_name(command) else {
            return Ok(Message::Unknown {
                command: command.to_string(),
                payload: payload.to_vec(),
            });
        };

        let buf = &mut &payload[..];
        let msg = match cmd {
            Command::Version => Message::Version(VersionMessage::decode(buf)?),
            Command::Verack => Message::Verack,
            Command::Ping => {
                if buf.remaining() >= 8 {
                    Message::Ping(Some(read_u64(buf)?))
                } else {
                    Message::Ping(None)
                }
            }
            Command::Pong => Message::Pong(read_u64(buf)?),
            Command::GetAddr => Message::GetAddr,
            Command::Addr => {
                let count = read_count(buf, "addr", MAX_ADDR)?;
                let mut addrs = Vec::with_capacity(count);
                for _ in 0..count {
                    addrs.push(NetAddress::decode(buf, true)?);
                }
                Message::Addr(addrs)
            }
            Command::Inv => Message::Inv(decode_inv(buf)?),
            Command::GetData => Message::GetData(decode_inv(buf)?),
            Command::NotFound => Message::NotFound(decode_inv(buf)?),
            Command::GetBlocks => Message::GetBlocks(LocatorMessage::decode(buf)?),
            Command::GetHeaders => Message::GetHeaders(LocatorMessage::decode(buf)?),
            Command::Headers => {
                let count = read_count(buf, "headers", MAX_HEADERS)?;
                let mut headers = Vec::with_capacity(count);
                for _ in 0..count {
                    headers.push(BlockHeader::decode(buf)?);
                    // Transaction count, always zero
                    read_count(buf, "header tx count", 0)?;
                }
                Message::Headers(headers)
            }
            Command::SendHeaders => Message::SendHeaders,
            Command::Block => {
                let block = Block::decode(buf)?;
                let witness = block.transactions.iter().any(|tx| tx.has_witness());
                Message::Block {
                    block: Arc::new(block),
                    witness,
                }
            }
            Command::Tx => {
                let tx = Transaction::decode(buf)?;
                let witness = tx.has_witness();
                Message::Tx {
                    tx: Arc::new(tx),
                    witness,
                }
            }
            Command::Reject => Message::Reject(RejectMessage::decode(buf)?),
            Command::Mempool => Message::Mempool,
            Command::FilterLoad => Message::FilterLoad(BloomFilter::decode(buf)?),
            Command::FilterAdd => Message::FilterAdd(read_var_bytes(buf, MAX_FILTER_ADD)?),
            Command::FilterClear => Message::FilterClear,
            Command::MerkleBlock => Message::MerkleBlock(MerkleBlock::decode(buf)?),
            Command::FeeFilter => Message::FeeFilter(read_i64(buf)?),
            Command::SendCmpct => Message::SendCmpct {
                mode: read_u8(buf)?,
                version: read_u64(buf)?,
            },
            Command::CmpctBlock => {
                let block = CompactBlock::decode(buf)?;
                Message::CmpctBlock {
                    block,
                    witness: true,
                }
            }
            Command::GetBlockTxn => Message::GetBlockTxn(TxRequest::decode(buf)?),
            Command::BlockTxn => Message::BlockTxn {
                response: TxResponse::decode(buf)?,
                witness: true,
            },
            Command::EncInit => {
                let mut public_key = [0u8; 33];
                read_exact(buf, &mut public_key)?;
                Message::EncInit {
                    public_key,
                    cipher: read_u8(buf)?,
                }
            }
            Command::EncAck => {
                let mut public_key = [0u8; 33];
                read_exact(buf, &mut public_key)?;
                Message::EncAck { public_key }
            }
            Command::AuthChallenge => Message::AuthChallenge(read_hash(buf)?),
            Command::AuthReply => {
                let mut sig = [0u8; 64];
                read_exact(buf, &mut sig)?;
                Message::AuthReply(sig)
            }
            Command::AuthPropose => Message::AuthPropose(read_hash(buf)?),
            Command::Unknown | Command::Data => Message::Unknown {
                command: command.to_string(),
                payload: payload.to_vec(),
            },
        };
        Ok(msg)
    }
}

fn decode_inv<B: Buf>(buf: &mut B) -> EncodingResult<Vec<InvItem>> {
    let count = read_count(buf, "inv", MAX_INV)?;
    let mut items = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        items.push(InvItem::decode(buf)?);
    }
    Ok(items)
}
