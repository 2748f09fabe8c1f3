//! Mini-P2P: the peer session engine of a Bitcoin node in Rust
//!
//! This crate manages a single connection to a remote node:
//! - Version handshake with optional encryption and authentication seams
//! - Message dispatch, ban scoring and relay preferences
//! - Request/response correlation and stall supervision
//! - Write backpressure with drain waiters
//! - BIP152 compact block relay with SipHash short ids
//! - Rolling bloom filters for relay deduplication
//!
//! # Example
//!
//! ```no_run
//! use mini_p2p::network::{PeerConfig, PeerEvent, Session, StaticContext};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), mini_p2p::network::PeerError> {
//! let addr = "127.0.0.1:8333".parse().unwrap();
//! let ctx = Arc::new(StaticContext::new(0, false, true));
//! let (peer, mut events) = Session::connect(1, addr, Arc::new(PeerConfig::default()), ctx);
//!
//! peer.open().await?;
//! while let Some(event) = events.recv().await {
//!     if let PeerEvent::Close { .. } = event {
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod crypto;
pub mod network;

// Re-export commonly used types
pub use core::{Block, BlockHeader, BloomFilter, MerkleBlock, Transaction};
pub use crypto::Hash256;
pub use network::{
    CompactBlock, Message, Peer, PeerConfig, PeerError, PeerEvent, PeerHandle, PoolContext,
    RollingFilter, Server, Session,
};
