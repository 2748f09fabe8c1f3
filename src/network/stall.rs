//! Stall supervision
//!
//! The session driver calls [`Peer::check_stall`] every
//! [`STALL_INTERVAL`]. The first breached deadline wins and the peer is
//! destroyed; stalling never touches the ban score.

use crate::network::error::PeerError;
use crate::network::message::{Command, PONG_VERSION};
use crate::network::peer::Peer;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// How often deadlines are evaluated
pub const STALL_INTERVAL: Duration = Duration::from_secs(5);

/// Time allowed for a requested block or filtered block
pub const BLOCK_TIMEOUT: Duration = Duration::from_secs(120);

/// Time allowed for a requested transaction
pub const TX_TIMEOUT: Duration = Duration::from_secs(120);

/// Base response timeout; also bounds compact block reconstruction
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum silence in either direction
pub const TIMEOUT_INTERVAL: Duration = Duration::from_secs(20 * 60);

/// Grace period after connecting before liveness is judged
pub const LIVENESS_GRACE: Duration = Duration::from_secs(60);

/// Which deadline a peer missed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallReason {
    /// A pending response did not arrive
    Response(Command),
    MerkleBlock,
    /// Block download (loader or per-hash)
    Block,
    Tx,
    /// Compact block reconstruction
    BlockTxn,
    /// Nothing sent or received since connecting
    NoMessage,
    Send,
    Recv,
    Ping,
}

impl fmt::Display for StallReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StallReason::Response(cmd) => write!(f, "{}", cmd),
            StallReason::MerkleBlock => write!(f, "merkleblock"),
            StallReason::Block => write!(f, "block"),
            StallReason::Tx => write!(f, "tx"),
            StallReason::BlockTxn => write!(f, "blocktxn"),
            StallReason::NoMessage => write!(f, "no message"),
            StallReason::Send => write!(f, "send"),
            StallReason::Recv => write!(f, "recv"),
            StallReason::Ping => write!(f, "ping"),
        }
    }
}

impl Peer {
    /// Evaluate every deadline at `now`, in priority order
    pub fn maybe_timeout(&self, now: Instant) -> Option<StallReason> {
        if let Some(cmd) = self.responses.expired(now) {
            return Some(StallReason::Response(cmd));
        }

        if self.merkle.is_some() {
            if let Some(time) = self.merkle_time {
                if now > time + BLOCK_TIMEOUT {
                    return Some(StallReason::MerkleBlock);
                }
            }
        }

        let full = self.ctx.is_synced();

        if self.syncing && self.loader && !full {
            if let Some(time) = self.block_time {
                if now > time + BLOCK_TIMEOUT {
                    return Some(StallReason::Block);
                }
            }
        }

        if full || !self.syncing {
            if self.block_map.values().any(|&time| now > time + BLOCK_TIMEOUT) {
                return Some(StallReason::Block);
            }
            if self.tx_map.values().any(|&time| now > time + TX_TIMEOUT) {
                return Some(StallReason::Tx);
            }
            if self
                .compact_blocks
                .values()
                .any(|(_, time)| now > *time + RESPONSE_TIMEOUT)
            {
                return Some(StallReason::BlockTxn);
            }
        }

        let connected = self.connected_at?;
        if now <= connected + LIVENESS_GRACE {
            return None;
        }

        let (last_send, last_recv) = match (self.last_send, self.last_recv) {
            (Some(send), Some(recv)) => (send, recv),
            _ => return Some(StallReason::NoMessage),
        };

        if now > last_send + TIMEOUT_INTERVAL {
            return Some(StallReason::Send);
        }

        // An unknown version counts as legacy
        let mult = match self.version {
            None => 4,
            Some(version) if version <= PONG_VERSION => 4,
            Some(_) => 1,
        };
        if now > last_recv + TIMEOUT_INTERVAL * mult {
            return Some(StallReason::Recv);
        }

        if self.challenge.is_some() {
            if let Some(last_ping) = self.last_ping {
                if now > last_ping + TIMEOUT_INTERVAL {
                    return Some(StallReason::Ping);
                }
            }
        }

        None
    }

    /// Destroy the peer if any deadline has passed. Returns true if it did.
    pub fn check_stall(&mut self, now: Instant) -> bool {
        if self.is_destroyed() {
            return false;
        }
        match self.maybe_timeout(now) {
            Some(reason) => {
                log::warn!("{}: peer is stalling ({})", self.hostname(), reason);
                self.fail(PeerError::Stalled(reason));
                true
            }
            None => false,
        }
    }
}
