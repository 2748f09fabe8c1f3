//! Encryption (BIP151) and authentication (BIP150) seams
//!
//! The session drives both handshakes but the cryptography lives behind
//! these traits. A pool that supports them hands out one instance per
//! session through [`PoolContext`](crate::network::context::PoolContext).

use crate::crypto::Hash256;
use crate::network::codec::RawPacket;
use crate::network::message::Message;
use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;

/// How long each optional handshake may take
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);

/// Errors reported by a handshake implementation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("Handshake rejected: {0}")]
    Rejected(String),
    #[error("Unexpected {0}")]
    OutOfOrder(&'static str),
    #[error("Cipher error: {0}")]
    Cipher(String),
    #[error("No known identity for peer")]
    UnknownIdentity,
}

/// Transport encryption (BIP151)
pub trait EncryptionHandshake: Send {
    /// Our `encinit`
    fn to_encinit(&mut self) -> Message;

    /// Our `encack` in reply to the peer's `encinit`
    fn to_encack(&mut self) -> Message;

    /// Handle the peer's `encinit`
    fn encinit(&mut self, public_key: &[u8; 33], cipher: u8) -> Result<(), HandshakeError>;

    /// Handle the peer's `encack` (also used to signal a rekey)
    fn encack(&mut self, public_key: &[u8; 33]) -> Result<(), HandshakeError>;

    /// Both directions negotiated
    fn is_completed(&self) -> bool;

    /// Frames are encrypted
    fn is_active(&self) -> bool;

    /// Encrypt a packet for the wire
    fn frame(&mut self, command: &str, payload: &[u8]) -> Result<Bytes, HandshakeError>;

    /// Decrypt incoming bytes, returning any complete packets
    fn feed(&mut self, data: &[u8]) -> Result<Vec<RawPacket>, HandshakeError>;

    /// A pending rekey announcement to send to the peer
    fn take_rekey(&mut self) -> Option<Message>;
}

/// Peer authentication (BIP150)
pub trait AuthHandshake: Send {
    fn is_outbound(&self) -> bool;

    /// Whether we know the identity key the peer should prove
    fn has_peer_identity(&self) -> bool;

    /// Our opening `authchallenge` (outbound side)
    fn to_challenge(&mut self) -> Message;

    /// Sign the peer's challenge
    fn challenge(&mut self, hash: &Hash256) -> Result<[u8; 64], HandshakeError>;

    /// Verify the peer's reply; may produce a hash to propose
    fn reply(&mut self, signature: &[u8; 64]) -> Result<Option<Hash256>, HandshakeError>;

    /// Handle a proposal; returns the challenge to send back
    fn propose(&mut self, hash: &Hash256) -> Result<Hash256, HandshakeError>;

    fn is_completed(&self) -> bool;

    fn is_authenticated(&self) -> bool;
}
