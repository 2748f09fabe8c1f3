//! Pool callback surface
//!
//! Everything a session needs to know about the node it belongs to: chain
//! state, nonces used to detect self-connections, the mempool for compact
//! block reconstruction, and how to open sockets.

use crate::core::{Block, Transaction};
use crate::crypto::Hash256;
use crate::network::handshake::{AuthHandshake, EncryptionHandshake};
use crate::network::transport::BoxedStream;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::net::TcpStream;

/// Callbacks into the pool that owns a session
pub trait PoolContext: Send + Sync + 'static {
    /// Current chain height
    fn height(&self) -> u32;

    /// Whether the chain is caught up
    fn is_synced(&self) -> bool;

    /// Whether we validate and relay witness data
    fn has_witness(&self) -> bool;

    /// Fresh nonce for our `version` to `addr`
    fn create_nonce(&self, addr: &SocketAddr) -> u64;

    /// Whether `nonce` is one we sent (i.e. we connected to ourselves)
    fn has_nonce(&self, nonce: u64) -> bool;

    /// Fee rate of a mempool transaction, in satoshis per kB
    fn fee_rate(&self, hash: &Hash256) -> Option<i64>;

    /// Snapshot of the mempool, if we keep one
    fn mempool(&self) -> Option<Vec<Arc<Transaction>>>;

    /// A stored block and its height
    fn get_block(&self, hash: &Hash256) -> Option<(Arc<Block>, u32)>;

    /// Open an outbound stream to `addr`
    fn create_connection(&self, addr: SocketAddr) -> BoxFuture<'static, io::Result<BoxedStream>> {
        async move {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream) as BoxedStream)
        }
        .boxed()
    }

    /// Encryption handshake for a new session, if supported
    fn create_encryption(&self, _outbound: bool) -> Option<Box<dyn EncryptionHandshake>> {
        None
    }

    /// Authentication handshake for a new session, if supported
    fn create_auth(&self, _outbound: bool) -> Option<Box<dyn AuthHandshake>> {
        None
    }
}

/// In-memory pool state for the CLI and tests
#[derive(Debug, Default)]
pub struct StaticContext {
    pub height: u32,
    pub synced: bool,
    pub witness: bool,
    nonces: Mutex<HashSet<u64>>,
    /// Transactions with their fees
    mempool: Mutex<Vec<(Arc<Transaction>, i64)>>,
    blocks: Mutex<HashMap<Hash256, (Arc<Block>, u32)>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl StaticContext {
    pub fn new(height: u32, synced: bool, witness: bool) -> Self {
        Self {
            height,
            synced,
            witness,
            ..Default::default()
        }
    }

    pub fn add_tx(&self, tx: Arc<Transaction>, fee: i64) {
        lock(&self.mempool).push((tx, fee));
    }

    pub fn add_block(&self, block: Arc<Block>, height: u32) {
        lock(&self.blocks).insert(block.hash(), (block, height));
    }
}

impl PoolContext for StaticContext {
    fn height(&self) -> u32 {
        self.height
    }

    fn is_synced(&self) -> bool {
        self.synced
    }

    fn has_witness(&self) -> bool {
        self.witness
    }

    fn create_nonce(&self, _addr: &SocketAddr) -> u64 {
        let nonce = loop {
            let nonce: u64 = rand::random();
            if nonce != 0 {
                break nonce;
            }
        };
        lock(&self.nonces).insert(nonce);
        nonce
    }

    fn has_nonce(&self, nonce: u64) -> bool {
        lock(&self.nonces).contains(&nonce)
    }

    fn fee_rate(&self, hash: &Hash256) -> Option<i64> {
        lock(&self.mempool)
            .iter()
            .find(|(tx, _)| tx.hash() == *hash)
            .map(|(tx, fee)| fee * 1000 / tx.size().max(1) as i64)
    }

    fn mempool(&self) -> Option<Vec<Arc<Transaction>>> {
        Some(lock(&self.mempool).iter().map(|(tx, _)| tx.clone()).collect())
    }

    fn get_block(&self, hash: &Hash256) -> Option<(Arc<Block>, u32)> {
        lock(&self.blocks).get(hash).cloned()
    }
}
