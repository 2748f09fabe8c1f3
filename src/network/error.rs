//! Session errors
//!
//! `PeerError` is `Clone` because one failure is delivered to every
//! outstanding waiter of a session.

use crate::core::EncodingError;
use crate::network::codec::CodecError;
use crate::network::handshake::HandshakeError;
use crate::network::message::Command;
use crate::network::stall::StallReason;
use thiserror::Error;

/// Peer-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    #[error("Peer was destroyed")]
    Destroyed,
    #[error("Peer is stalling ({0})")]
    Stalled(StallReason),
    #[error("Connection timed out")]
    ConnectTimeout,
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Socket hangup")]
    Hangup,
    #[error("Timed out waiting for {0}")]
    HandshakeTimeout(&'static str),
    #[error("Handshake failed: {0}")]
    Handshake(String),
    #[error("Protocol violation: {0}")]
    Protocol(String),
    #[error("Peer stalled (drain): {0} bytes buffered")]
    DrainStalled(usize),
    #[error("Session channel closed")]
    ChannelClosed,
    #[error("Already waiting for {0}")]
    AlreadyWaiting(Command),
}

impl From<std::io::Error> for PeerError {
    fn from(e: std::io::Error) -> Self {
        PeerError::ConnectionFailed(e.to_string())
    }
}

impl From<CodecError> for PeerError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Io(e) => e.into(),
            other => PeerError::Protocol(other.to_string()),
        }
    }
}

impl From<EncodingError> for PeerError {
    fn from(e: EncodingError) -> Self {
        PeerError::Protocol(e.to_string())
    }
}

impl From<HandshakeError> for PeerError {
    fn from(e: HandshakeError) -> Self {
        PeerError::Handshake(e.to_string())
    }
}
