//! P2P session engine
//!
//! Drives one connection to a remote Bitcoin node from socket to teardown.
//!
//! # Features
//! - Version handshake with optional BIP151 encryption and BIP150 authentication
//! - Message dispatch with ban scoring for protocol violations
//! - Request/response correlation with per-command deadlines
//! - Stall detection and keepalive pings
//! - Write backpressure with drain waiters
//! - BIP152 compact block relay
//! - Inventory relay deduplication with rolling bloom filters

pub mod codec;
pub mod compact;
pub mod config;
pub mod context;
pub mod drain;
pub mod error;
pub mod filter;
pub mod handshake;
pub mod message;
pub mod peer;
pub mod pending;
pub mod server;
pub mod session;
pub mod stall;
pub mod transport;

pub use codec::{frame, CodecError, RawPacket, WireCodec, HEADER_SIZE, MAX_MESSAGE_SIZE};
pub use compact::{CompactBlock, CompactBlockError, TxRequest, TxResponse};
pub use config::{ConfigError, Network, PeerConfig, BAN_SCORE, MAX_COMPACT_BLOCKS};
pub use context::{PoolContext, StaticContext};
pub use drain::{DrainQueue, DEFAULT_MAX_DRAIN};
pub use error::PeerError;
pub use filter::RollingFilter;
pub use handshake::{AuthHandshake, EncryptionHandshake, HandshakeError, HANDSHAKE_TIMEOUT};
pub use message::{
    Command, InvItem, InvType, LocatorMessage, Message, NetAddress, RejectCode, RejectMessage,
    ServiceFlags, VersionMessage, MIN_VERSION, PROTOCOL_VERSION,
};
pub use peer::{OpenWaiter, Peer, PeerEvent, PeerInfo, PeerState};
pub use pending::{ResponseEntry, ResponseTable, ResponseWaiter};
pub use server::Server;
pub use session::{PeerCommand, PeerHandle, Session, CONNECT_TIMEOUT, INV_INTERVAL, PING_INTERVAL};
pub use stall::{StallReason, STALL_INTERVAL};
pub use transport::{AsyncStream, BoxedStream, Connection, WriterEvent};
