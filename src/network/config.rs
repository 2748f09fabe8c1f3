//! Session configuration

use crate::network::drain::DEFAULT_MAX_DRAIN;
use crate::network::message::{ServiceFlags, PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Default ban threshold
pub const BAN_SCORE: u32 = 100;

/// Compact blocks we reconstruct at once before dropping the peer
pub const MAX_COMPACT_BLOCKS: usize = 15;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Which chain we talk to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    /// Frame magic, as read little-endian off the wire
    pub fn magic(self) -> u32 {
        match self {
            Network::Mainnet => 0xd9b4_bef9,
            Network::Testnet => 0x0709_110b,
            Network::Regtest => 0xdab5_bffa,
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Network::Mainnet => 8333,
            Network::Testnet => 18333,
            Network::Regtest => 18444,
        }
    }
}

/// Per-session options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    pub network: Network,
    /// Protocol version we advertise
    pub version: u32,
    /// Services we advertise
    pub services: ServiceFlags,
    pub agent: String,
    /// Ask peers not to relay transactions until we send a filter
    pub no_relay: bool,
    /// Ban score threshold
    pub ban_score: u32,
    /// Request compact block relay
    pub compact: bool,
    /// 0 for low-bandwidth, 1 for high-bandwidth compact relay
    pub block_mode: u8,
    /// Prefer headers announcements
    pub headers: bool,
    /// We are an SPV client and need bloom filtering from outbound peers
    pub spv: bool,
    /// Allow connecting to ourselves (tests)
    pub self_connect: bool,
    pub max_compact_blocks: usize,
    /// Buffered outbound bytes before the peer is dropped
    pub max_drain: usize,
    /// Buffered bytes after which writes report backpressure
    pub high_water: usize,
    /// Capacity of the event channel to the pool
    pub event_capacity: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            network: Network::Mainnet,
            version: PROTOCOL_VERSION,
            services: ServiceFlags::NETWORK | ServiceFlags::WITNESS,
            agent: format!("/mini-p2p:{}/", env!("CARGO_PKG_VERSION")),
            no_relay: false,
            ban_score: BAN_SCORE,
            compact: true,
            block_mode: 0,
            headers: true,
            spv: false,
            self_connect: false,
            max_compact_blocks: MAX_COMPACT_BLOCKS,
            max_drain: DEFAULT_MAX_DRAIN,
            high_water: 1 << 20,
            event_capacity: 256,
        }
    }
}

impl PeerConfig {
    pub fn magic(&self) -> u32 {
        self.network.magic()
    }

    /// Load from a JSON file; missing fields take their defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_partial_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("peer.json");
        fs::write(&path, r#"{ "network": "testnet", "ban_score": 50 }"#).unwrap();

        let config = PeerConfig::load(&path).unwrap();
        assert_eq!(config.network, Network::Testnet);
        assert_eq!(config.magic(), 0x0709_110b);
        assert_eq!(config.ban_score, 50);
        assert_eq!(config.max_compact_blocks, MAX_COMPACT_BLOCKS);
    }

    #[test]
    fn test_save_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("peer.json");
        let config = PeerConfig {
            spv: true,
            services: ServiceFlags::NETWORK | ServiceFlags::BLOOM,
            ..Default::default()
        };
        config.save(&path).unwrap();

        let loaded = PeerConfig::load(&path).unwrap();
        assert!(loaded.spv);
        assert_eq!(loaded.services, ServiceFlags::NETWORK | ServiceFlags::BLOOM);
    }

    #[test]
    fn test_bad_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("peer.json");
        fs::write(&path, "not json").unwrap();
        assert!(matches!(
            PeerConfig::load(&path),
            Err(ConfigError::SerializationError(_))
        ));
    }
}
