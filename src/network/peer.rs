//! Peer session core
//!
//! A [`Peer`] holds everything about one connection except the socket
//! itself: handshake progress, negotiated relay preferences, download
//! bookkeeping, compact block reconstruction and the pending-response
//! table. It never blocks or awaits. The session driver feeds it bytes,
//! timer ticks and commands, and collects [`PeerEvent`]s for the pool.
//!
//! # Handshake
//! `Connected → EncryptionHandshake → AuthHandshake → VersionHandshake →
//! Ready`. Each step is re-evaluated by [`Peer::advance`] after every
//! input; the next deadline is exposed through
//! [`Peer::handshake_deadline`] so the driver can sleep until it.

use crate::core::{Block, BlockHeader, BloomFilter, MerkleBlock, Transaction, MAX_MONEY, MAX_SCRIPT_PUSH};
use crate::crypto::{hash_to_hex, Hash256};
use crate::network::codec::{frame, CodecError, RawPacket, WireCodec};
use crate::network::compact::{CompactBlock, TxRequest, TxResponse};
use crate::network::config::PeerConfig;
use crate::network::context::PoolContext;
use crate::network::drain::DrainQueue;
use crate::network::error::PeerError;
use crate::network::filter::RollingFilter;
use crate::network::handshake::{
    AuthHandshake, EncryptionHandshake, HandshakeError, HANDSHAKE_TIMEOUT,
};
use crate::network::message::{
    Command, InvItem, InvType, LocatorMessage, Message, NetAddress, RejectCode, RejectMessage,
    ServiceFlags, VersionMessage, BLOOM_VERSION, COMPACT_VERSION, COMPACT_WITNESS_VERSION,
    HEADERS_VERSION, MAX_ADDR, MAX_HEADERS, MIN_VERSION, PONG_VERSION, SENDHEADERS_VERSION,
};
use crate::network::pending::ResponseTable;
use crate::network::stall::RESPONSE_TIMEOUT;
use crate::network::transport::Connection;
use bytes::{Bytes, BytesMut};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::codec::Decoder;

/// Time allowed for `verack`, and then for the peer's `version`
pub const VERSION_TIMEOUT: Duration = Duration::from_secs(10);

/// Queued inventory that forces an immediate flush
pub const INV_FLUSH_SIZE: usize = 500;

/// Items per outgoing `inv`
pub const INV_CHUNK: usize = 1000;

/// Blocks deeper than this are not served through `getblocktxn`
pub const MAX_BLOCKTXN_DEPTH: u32 = 15;

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Idle,
    Connecting,
    Connected,
    EncryptionHandshake,
    AuthHandshake,
    VersionHandshake,
    Ready,
    Destroyed,
}

/// Notifications for the pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// Handshake complete
    Open,
    /// Transport connected
    Connect,
    /// A message the pool should act on
    Message(Message),
    Error(PeerError),
    /// Emitted once; `connected` tells whether the transport ever connected
    Close { connected: bool },
    /// The ban threshold was reached
    Ban,
}

/// Snapshot of a session for the pool
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub id: u64,
    pub addr: SocketAddr,
    pub outbound: bool,
    pub state: PeerState,
    pub version: Option<u32>,
    pub services: ServiceFlags,
    pub agent: String,
    pub height: i32,
    pub no_relay: bool,
    pub prefer_headers: bool,
    pub compact_mode: Option<u8>,
    pub compact_witness: bool,
    pub fee_rate: Option<i64>,
    pub encrypted: bool,
    pub authenticated: bool,
    pub ban_score: u32,
    pub min_ping: Option<Duration>,
    /// Buffered bytes waiting for the transport
    pub drain_size: usize,
}

/// Waiter for [`Peer::open`]
pub type OpenWaiter = oneshot::Sender<Result<(), PeerError>>;

/// One peer session
pub struct Peer {
    id: u64,
    addr: SocketAddr,
    outbound: bool,
    pub(crate) config: Arc<PeerConfig>,
    pub(crate) ctx: Arc<dyn PoolContext>,
    state: PeerState,

    conn: Option<Connection>,
    codec: WireCodec,
    read_buf: BytesMut,

    enc: Option<Box<dyn EncryptionHandshake>>,
    auth: Option<Box<dyn AuthHandshake>>,
    enc_init_sent: bool,
    auth_started: bool,
    version_sent: bool,
    /// Peer's version arrived before ours went out
    verack_pending: bool,
    version_wait: bool,
    handshake_deadline: Option<Instant>,
    open_requested: bool,
    open_waiters: Vec<OpenWaiter>,

    pub(crate) version: Option<u32>,
    services: ServiceFlags,
    agent: String,
    height: i32,
    no_relay: bool,
    local: Option<NetAddress>,
    prefer_headers: bool,
    fee_rate: Option<i64>,
    spv_filter: Option<BloomFilter>,
    compact_mode: Option<u8>,
    compact_witness: bool,
    ack: bool,
    pub(crate) syncing: bool,
    pub(crate) loader: bool,
    ban_score: u32,
    banned: bool,

    pub(crate) challenge: Option<u64>,
    pub(crate) last_ping: Option<Instant>,
    last_pong: Option<Instant>,
    min_ping: Option<Duration>,

    pub(crate) connected_at: Option<Instant>,
    pub(crate) last_send: Option<Instant>,
    pub(crate) last_recv: Option<Instant>,
    pub(crate) block_time: Option<Instant>,

    inv_filter: RollingFilter,
    addr_filter: RollingFilter,
    inv_queue: Vec<InvItem>,
    pub(crate) block_map: BTreeMap<Hash256, Instant>,
    pub(crate) tx_map: BTreeMap<Hash256, Instant>,
    pub(crate) merkle: Option<MerkleBlock>,
    pub(crate) merkle_time: Option<Instant>,
    merkle_matches: HashSet<Hash256>,
    pub(crate) compact_blocks: BTreeMap<Hash256, (CompactBlock, Instant)>,
    pub(crate) responses: ResponseTable,
    drain: DrainQueue,
    events: VecDeque<PeerEvent>,
}

fn unix_time() -> i64 {
    chrono::Utc::now().timestamp()
}

fn short_checksum(hash: &Hash256) -> [u8; 4] {
    [hash[0], hash[1], hash[2], hash[3]]
}

impl Peer {
    pub fn new(
        id: u64,
        addr: SocketAddr,
        outbound: bool,
        config: Arc<PeerConfig>,
        ctx: Arc<dyn PoolContext>,
    ) -> Self {
        let enc = ctx.create_encryption(outbound);
        let auth = ctx.create_auth(outbound);
        Self {
            id,
            addr,
            outbound,
            codec: WireCodec::new(config.magic()),
            drain: DrainQueue::new(config.max_drain),
            config,
            ctx,
            state: PeerState::Idle,
            conn: None,
            read_buf: BytesMut::new(),
            enc,
            auth,
            enc_init_sent: false,
            auth_started: false,
            version_sent: false,
            verack_pending: false,
            version_wait: false,
            handshake_deadline: None,
            open_requested: false,
            open_waiters: Vec::new(),
            version: None,
            services: ServiceFlags::empty(),
            agent: String::new(),
            height: -1,
            no_relay: false,
            local: None,
            prefer_headers: false,
            fee_rate: None,
            spv_filter: None,
            compact_mode: None,
            compact_witness: false,
            ack: false,
            syncing: false,
            loader: false,
            ban_score: 0,
            banned: false,
            challenge: None,
            last_ping: None,
            last_pong: None,
            min_ping: None,
            connected_at: None,
            last_send: None,
            last_recv: None,
            block_time: None,
            inv_filter: RollingFilter::from_rate(50_000, 0.000001),
            addr_filter: RollingFilter::from_rate(5_000, 0.001),
            inv_queue: Vec::new(),
            block_map: BTreeMap::new(),
            tx_map: BTreeMap::new(),
            merkle: None,
            merkle_time: None,
            merkle_matches: HashSet::new(),
            compact_blocks: BTreeMap::new(),
            responses: ResponseTable::new(),
            events: VecDeque::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_outbound(&self) -> bool {
        self.outbound
    }

    /// Name used in log lines
    pub fn hostname(&self) -> String {
        self.addr.to_string()
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == PeerState::Ready
    }

    pub fn is_destroyed(&self) -> bool {
        self.state == PeerState::Destroyed
    }

    pub fn ban_score(&self) -> u32 {
        self.ban_score
    }

    /// When the current handshake step times out
    pub fn handshake_deadline(&self) -> Option<Instant> {
        self.handshake_deadline
    }

    /// Local address the peer reported seeing us at
    pub fn local_address(&self) -> Option<&NetAddress> {
        self.local.as_ref()
    }

    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            id: self.id,
            addr: self.addr,
            outbound: self.outbound,
            state: self.state,
            version: self.version,
            services: self.services,
            agent: self.agent.clone(),
            height: self.height,
            no_relay: self.no_relay,
            prefer_headers: self.prefer_headers,
            compact_mode: self.compact_mode,
            compact_witness: self.compact_witness,
            fee_rate: self.fee_rate,
            encrypted: self.enc.as_ref().map_or(false, |enc| enc.is_completed()),
            authenticated: self.auth.as_ref().map_or(false, |auth| auth.is_authenticated()),
            ban_score: self.ban_score,
            min_ping: self.min_ping,
            drain_size: self.drain.size(),
        }
    }

    /// Next notification for the pool
    pub fn next_event(&mut self) -> Option<PeerEvent> {
        self.events.pop_front()
    }

    fn emit(&mut self, event: PeerEvent) {
        self.events.push_back(event);
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Outbound connect in progress
    pub fn connecting(&mut self) {
        if self.state == PeerState::Idle {
            self.state = PeerState::Connecting;
        }
    }

    /// The transport is up; writes now go to `conn`
    pub fn on_connect(&mut self, conn: Connection) {
        if self.is_destroyed() {
            return;
        }
        let now = Instant::now();
        self.conn = Some(conn);
        self.state = PeerState::Connected;
        self.connected_at = Some(now);
        log::debug!("{}: connected (outbound={})", self.hostname(), self.outbound);
        self.emit(PeerEvent::Connect);
        self.advance();
    }

    /// Start the handshake; `waiter` resolves once the session is ready
    pub fn open(&mut self, waiter: OpenWaiter) {
        match self.state {
            PeerState::Destroyed => {
                let _ = waiter.send(Err(PeerError::Destroyed));
            }
            PeerState::Ready => {
                let _ = waiter.send(Ok(()));
            }
            _ => {
                self.open_waiters.push(waiter);
                self.open_requested = true;
                self.advance();
            }
        }
    }

    /// Re-evaluate the handshake. Failures destroy the session.
    pub fn advance(&mut self) {
        if let Err(err) = self.step(Instant::now()) {
            self.fail(err);
        }
    }

    fn step(&mut self, now: Instant) -> Result<(), PeerError> {
        let expired = |deadline: Option<Instant>| deadline.map_or(false, |d| now >= d);

        loop {
            match self.state {
                PeerState::Idle
                | PeerState::Connecting
                | PeerState::Ready
                | PeerState::Destroyed => return Ok(()),

                PeerState::Connected => {
                    if !self.open_requested {
                        return Ok(());
                    }
                    self.state = PeerState::EncryptionHandshake;
                    if self.enc.is_some() {
                        self.handshake_deadline = Some(now + HANDSHAKE_TIMEOUT);
                        if self.outbound {
                            self.send_encinit();
                        }
                    }
                }

                PeerState::EncryptionHandshake => {
                    let completed = match self.enc.as_ref() {
                        Some(enc) => enc.is_completed(),
                        None => true,
                    };
                    if completed {
                        if self.enc.is_some() {
                            log::info!("{}: encryption handshake complete", self.hostname());
                        }
                    } else if expired(self.handshake_deadline) {
                        self.encryption_failed(HandshakeError::Rejected(
                            "timed out waiting for encryption".to_string(),
                        ));
                    } else {
                        return Ok(());
                    }
                    self.handshake_deadline = None;
                    self.state = PeerState::AuthHandshake;
                }

                PeerState::AuthHandshake => {
                    if self.auth.is_none() {
                        self.state = PeerState::VersionHandshake;
                        continue;
                    }

                    if !self.auth_started {
                        self.auth_started = true;
                        let encrypted = self.enc.as_ref().map_or(false, |enc| enc.is_completed());
                        if !encrypted {
                            return Err(PeerError::Handshake(
                                "authentication requires an encrypted channel".to_string(),
                            ));
                        }
                        let challenge = match self.auth.as_mut() {
                            Some(auth) if auth.is_outbound() => {
                                if !auth.has_peer_identity() {
                                    return Err(HandshakeError::UnknownIdentity.into());
                                }
                                Some(auth.to_challenge())
                            }
                            _ => None,
                        };
                        if let Some(challenge) = challenge {
                            self.send(challenge);
                        }
                        self.handshake_deadline = Some(now + HANDSHAKE_TIMEOUT);
                    }

                    let (completed, authenticated) = match self.auth.as_ref() {
                        Some(auth) => (auth.is_completed(), auth.is_authenticated()),
                        None => (true, false),
                    };
                    if !completed {
                        if expired(self.handshake_deadline) {
                            return Err(PeerError::HandshakeTimeout("authentication"));
                        }
                        return Ok(());
                    }
                    log::info!(
                        "{}: authentication complete (authenticated={})",
                        self.hostname(),
                        authenticated
                    );
                    self.handshake_deadline = None;
                    self.state = PeerState::VersionHandshake;
                }

                PeerState::VersionHandshake => {
                    if !self.version_sent {
                        self.version_sent = true;
                        self.send_version();
                        if std::mem::take(&mut self.verack_pending) {
                            self.send(Message::Verack);
                        }
                        self.handshake_deadline = Some(now + VERSION_TIMEOUT);
                    }

                    if !self.ack {
                        if expired(self.handshake_deadline) {
                            return Err(PeerError::HandshakeTimeout("verack"));
                        }
                        return Ok(());
                    }

                    if self.version.is_none() {
                        if !self.version_wait {
                            self.version_wait = true;
                            self.handshake_deadline = Some(now + VERSION_TIMEOUT);
                        }
                        if expired(self.handshake_deadline) {
                            return Err(PeerError::HandshakeTimeout("version"));
                        }
                        return Ok(());
                    }

                    self.finalize();
                    return Ok(());
                }
            }
        }
    }

    fn finalize(&mut self) {
        self.state = PeerState::Ready;
        self.handshake_deadline = None;

        log::info!(
            "{}: ready (version={}, agent={}, height={})",
            self.hostname(),
            self.version.unwrap_or(0),
            self.agent,
            self.height
        );

        if self.config.headers && self.version.map_or(false, |v| v >= SENDHEADERS_VERSION) {
            self.send(Message::SendHeaders);
        }

        if self.config.compact && self.has_compact_support() {
            self.send_compact(self.config.block_mode);
        }

        self.emit(PeerEvent::Open);
        for waiter in self.open_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
    }

    /// Report `err`, fail the open waiters with it, and destroy
    pub fn fail(&mut self, err: PeerError) {
        if self.is_destroyed() {
            return;
        }
        log::debug!("{}: {}", self.hostname(), err);
        self.emit(PeerEvent::Error(err.clone()));
        for waiter in self.open_waiters.drain(..) {
            let _ = waiter.send(Err(err.clone()));
        }
        self.destroy();
    }

    /// Tear everything down. Safe to call more than once.
    pub fn destroy(&mut self) {
        if self.is_destroyed() {
            return;
        }

        let connected = self.connected_at.is_some();
        self.state = PeerState::Destroyed;
        self.handshake_deadline = None;
        self.conn = None;
        self.enc = None;
        self.auth = None;

        let err = PeerError::Destroyed;
        self.drain.reject_all(&err);
        self.responses.reject_all(&err);
        for waiter in self.open_waiters.drain(..) {
            let _ = waiter.send(Err(err.clone()));
        }

        self.inv_queue.clear();
        self.block_map.clear();
        self.tx_map.clear();
        self.compact_blocks.clear();
        self.merkle = None;
        self.merkle_matches.clear();

        log::debug!("{}: destroyed", self.hostname());
        self.emit(PeerEvent::Close { connected });
    }

    // =========================================================================
    // Outbound
    // =========================================================================

    /// Frame and write a message
    pub fn send(&mut self, msg: Message) {
        if self.is_destroyed() {
            return;
        }

        // The tx hashes are the checksum of their own serialization
        let checksum = match &msg {
            Message::Tx { tx, witness: true } if !tx.is_coinbase() => {
                Some(short_checksum(&tx.witness_hash()))
            }
            Message::Tx { witness: true, .. } => None,
            Message::Tx { tx, .. } => Some(short_checksum(&tx.hash())),
            _ => None,
        };

        log::trace!("{}: sending {}", self.hostname(), msg.name());
        let payload = msg.encode_payload();
        self.send_raw(msg.name(), &payload, checksum);
        self.add_timeout(&msg);
    }

    /// Frame and write an already serialized payload
    pub fn send_raw(&mut self, command: &str, payload: &[u8], checksum: Option<[u8; 4]>) {
        if self.is_destroyed() {
            return;
        }

        let framed = match self.enc.as_mut() {
            Some(enc) if enc.is_active() => enc.frame(command, payload).map_err(PeerError::from),
            _ => frame(self.codec.magic(), command, payload, checksum).map_err(PeerError::from),
        };

        match framed {
            Ok(data) => self.write(data),
            Err(err) => {
                self.fail(err);
                return;
            }
        }

        let rekey = self.enc.as_mut().and_then(|enc| enc.take_rekey());
        if let Some(rekey) = rekey {
            log::debug!("{}: rekeying", self.hostname());
            self.send(rekey);
        }
    }

    fn write(&mut self, data: Bytes) {
        let Some(conn) = self.conn.as_ref() else {
            return;
        };
        if conn.is_closed() {
            return;
        }

        self.last_send = Some(Instant::now());
        let len = data.len();
        if !conn.write(data) {
            if let Err(err) = self.drain.needs_drain(len) {
                log::warn!("{}: peer is not reading ({} bytes buffered)", self.hostname(), self.drain.size());
                self.fail(err);
            }
        }
    }

    /// The transport flushed its backlog
    pub fn drained(&mut self) {
        self.drain.drained();
    }

    /// Wait for buffered writes to flush; `None` if nothing is buffered
    pub fn wait_drain(&mut self) -> Option<oneshot::Receiver<Result<(), PeerError>>> {
        self.drain.wait()
    }

    /// Register a waiter for the next `cmd` from the peer
    pub fn wait(
        &mut self,
        cmd: Command,
        timeout: Duration,
        waiter: oneshot::Sender<Result<Message, PeerError>>,
    ) {
        if self.is_destroyed() {
            let _ = waiter.send(Err(PeerError::Destroyed));
            return;
        }
        self.responses.wait(cmd, Instant::now() + timeout, waiter);
    }

    fn add_timeout(&mut self, msg: &Message) {
        if !self.outbound {
            return;
        }

        let now = Instant::now();
        match msg {
            Message::Mempool => {
                self.responses.request(Command::Inv, now + RESPONSE_TIMEOUT);
            }
            Message::GetBlocks(_) => {
                if !self.ctx.is_synced() {
                    self.responses.request(Command::Inv, now + RESPONSE_TIMEOUT);
                }
            }
            Message::GetHeaders(_) => {
                self.responses.request(Command::Headers, now + RESPONSE_TIMEOUT * 2);
            }
            Message::GetData(_) => {
                self.responses.request(Command::Data, now + RESPONSE_TIMEOUT * 2);
            }
            Message::GetBlockTxn(_) => {
                self.responses.request(Command::BlockTxn, now + RESPONSE_TIMEOUT);
            }
            _ => {}
        }
    }

    fn send_version(&mut self) {
        let version = VersionMessage {
            version: self.config.version,
            services: self.config.services,
            time: unix_time(),
            remote: NetAddress::new(self.addr, self.services),
            local: NetAddress::new(NetAddress::unspecified().addr, self.config.services),
            nonce: self.ctx.create_nonce(&self.addr),
            agent: self.config.agent.clone(),
            height: self.ctx.height() as i32,
            no_relay: self.config.no_relay,
        };
        self.send(Message::Version(version));
    }

    fn send_encinit(&mut self) {
        let init = match self.enc.as_mut() {
            Some(enc) => enc.to_encinit(),
            None => return,
        };
        self.enc_init_sent = true;
        self.send(init);
    }

    /// Ping the peer, unless a challenge is still outstanding
    pub fn send_ping(&mut self) {
        if !self.is_ready() {
            return;
        }

        if self.version.map_or(true, |v| v <= PONG_VERSION) {
            self.send(Message::Ping(None));
            return;
        }

        if self.challenge.is_some() {
            log::debug!("{}: peer has not responded to ping", self.hostname());
            return;
        }

        let nonce = loop {
            let nonce: u64 = rand::random();
            if nonce != 0 {
                break nonce;
            }
        };
        self.last_ping = Some(Instant::now());
        self.challenge = Some(nonce);
        self.send(Message::Ping(Some(nonce)));
    }

    fn send_compact(&mut self, mode: u8) {
        if self.services.contains(ServiceFlags::WITNESS)
            && self.version.map_or(false, |v| v >= COMPACT_WITNESS_VERSION)
        {
            log::info!("{}: initializing witness compact blocks (mode={})", self.hostname(), mode);
            self.send(Message::SendCmpct { mode, version: 2 });
        }
        log::info!("{}: initializing normal compact blocks (mode={})", self.hostname(), mode);
        self.send(Message::SendCmpct { mode, version: 1 });
    }

    /// Whether the peer can speak the compact block flavour we need
    pub fn has_compact_support(&self) -> bool {
        let Some(version) = self.version else {
            return false;
        };
        if version < COMPACT_VERSION {
            return false;
        }
        if !self.ctx.has_witness() {
            return true;
        }
        if !self.services.contains(ServiceFlags::WITNESS) {
            return false;
        }
        version >= COMPACT_WITNESS_VERSION
    }

    /// Whether the peer asked for compact blocks we can use
    pub fn has_compact(&self) -> bool {
        if self.compact_mode.is_none() {
            return false;
        }
        if !self.ctx.has_witness() {
            return true;
        }
        self.compact_witness
    }

    fn has_witness(&self) -> bool {
        self.services.contains(ServiceFlags::WITNESS)
    }

    /// Inventory type used when asking this peer for blocks
    fn block_type(&self) -> InvType {
        if self.config.spv {
            return InvType::FilteredBlock;
        }
        if self.config.compact && self.has_compact_support() && self.has_compact() {
            return InvType::CmpctBlock;
        }
        if self.has_witness() {
            return InvType::WitnessBlock;
        }
        InvType::Block
    }

    fn tx_type(&self) -> InvType {
        if self.has_witness() {
            InvType::WitnessTx
        } else {
            InvType::Tx
        }
    }

    /// Ask for blocks, tracking each hash for the stall check
    pub fn get_block(&mut self, hashes: &[Hash256]) {
        let kind = self.block_type();
        let now = Instant::now();
        for hash in hashes {
            self.block_map.entry(*hash).or_insert(now);
        }
        self.get_items(kind, hashes);
    }

    pub fn get_tx(&mut self, hashes: &[Hash256]) {
        let kind = self.tx_type();
        let now = Instant::now();
        for hash in hashes {
            self.tx_map.entry(*hash).or_insert(now);
        }
        self.get_items(kind, hashes);
    }

    /// Ask for a complete block regardless of compact relay
    pub fn get_full_block(&mut self, hash: Hash256) {
        let kind = if self.has_witness() {
            InvType::WitnessBlock
        } else {
            InvType::Block
        };
        self.block_map.entry(hash).or_insert_with(Instant::now);
        self.get_items(kind, &[hash]);
    }

    fn get_items(&mut self, kind: InvType, hashes: &[Hash256]) {
        if hashes.is_empty() {
            return;
        }
        let items = hashes.iter().map(|hash| InvItem::new(kind, *hash)).collect();
        self.send(Message::GetData(items));
    }

    /// `getblocks`, marking the sync clock
    pub fn get_blocks(&mut self, locator: Vec<Hash256>, stop: Hash256) {
        self.block_time = Some(Instant::now());
        let version = self.config.version;
        self.send(Message::GetBlocks(LocatorMessage { version, locator, stop }));
    }

    /// `getheaders`, marking the sync clock
    pub fn get_headers(&mut self, locator: Vec<Hash256>, stop: Hash256) {
        self.block_time = Some(Instant::now());
        let version = self.config.version;
        self.send(Message::GetHeaders(LocatorMessage { version, locator, stop }));
    }

    /// Mark this session as the sync loader
    pub fn set_loader(&mut self, loader: bool) {
        self.loader = loader;
        self.syncing = loader;
        if loader {
            self.block_time = Some(Instant::now());
        }
    }

    pub fn send_reject(&mut self, code: RejectCode, reason: &str, item: Option<(Command, Hash256)>) {
        let (message, hash) = match item {
            Some((cmd, hash)) => {
                log::debug!(
                    "{}: rejecting {} {} (code={:?} reason={})",
                    self.hostname(),
                    cmd,
                    hash_to_hex(&hash),
                    code,
                    reason
                );
                (cmd.name().to_string(), Some(hash))
            }
            None => {
                log::debug!("{}: rejecting packet (code={:?} reason={})", self.hostname(), code, reason);
                (String::new(), None)
            }
        };
        self.send(Message::Reject(RejectMessage {
            message,
            code,
            reason: reason.to_string(),
            hash,
        }));
    }

    /// Add to the ban score. Returns true once the threshold is reached;
    /// [`PeerEvent::Ban`] is emitted only on the crossing.
    pub fn increase_ban(&mut self, score: u32) -> bool {
        self.ban_score = self.ban_score.saturating_add(score);
        if self.ban_score < self.config.ban_score {
            return false;
        }
        if !self.banned {
            self.banned = true;
            log::debug!("{}: ban threshold exceeded ({})", self.hostname(), self.ban_score);
            self.emit(PeerEvent::Ban);
        }
        true
    }

    // =========================================================================
    // Relay
    // =========================================================================

    pub fn announce_block(&mut self, blocks: &[Arc<Block>]) {
        if !self.is_ready() {
            return;
        }

        let mut inv = Vec::new();
        let mut headers = Vec::new();
        for block in blocks {
            let hash = block.hash();
            if self.inv_filter.test(&hash) {
                continue;
            }

            if self.compact_mode == Some(1) {
                self.inv_filter.add(&hash);
                self.send_compact_block(block);
                continue;
            }

            if self.prefer_headers {
                headers.push(block.header);
                continue;
            }

            inv.push(InvItem::new(InvType::Block, hash));
        }

        if self.prefer_headers {
            self.send_headers(headers);
            return;
        }

        self.queue_inv(inv);
    }

    pub fn announce_tx(&mut self, txs: &[Arc<Transaction>]) {
        if !self.is_ready() {
            return;
        }

        // No filter loaded yet
        if self.no_relay {
            return;
        }

        let mut inv = Vec::new();
        for tx in txs {
            let hash = tx.hash();
            if self.inv_filter.test(&hash) {
                continue;
            }

            if let Some(filter) = self.spv_filter.as_mut() {
                if !tx.is_watched(filter) {
                    continue;
                }
            }

            if let Some(min_rate) = self.fee_rate {
                if let Some(rate) = self.ctx.fee_rate(&hash) {
                    if rate < min_rate {
                        continue;
                    }
                }
            }

            inv.push(InvItem::new(InvType::Tx, hash));
        }

        self.queue_inv(inv);
    }

    pub fn announce_addr(&mut self, addrs: &[NetAddress]) {
        if !self.is_ready() {
            return;
        }

        let filter = &mut self.addr_filter;
        let items: Vec<NetAddress> = addrs
            .iter()
            .filter(|addr| filter.added(addr.addr.to_string().as_bytes()))
            .cloned()
            .collect();

        for chunk in items.chunks(MAX_ADDR) {
            self.send(Message::Addr(chunk.to_vec()));
        }
    }

    pub fn queue_inv(&mut self, items: Vec<InvItem>) {
        if !self.is_ready() {
            return;
        }

        let has_block = items.iter().any(|item| item.kind == InvType::Block);
        self.inv_queue.extend(items);

        if self.inv_queue.len() >= INV_FLUSH_SIZE || has_block {
            self.flush_inv();
        }
    }

    /// Send queued inventory the peer has not seen yet
    pub fn flush_inv(&mut self) {
        if self.is_destroyed() || self.inv_queue.is_empty() {
            return;
        }

        let queue = std::mem::take(&mut self.inv_queue);
        let filter = &mut self.inv_filter;
        let items: Vec<InvItem> = queue
            .into_iter()
            .filter(|item| filter.added(&item.hash))
            .collect();

        log::trace!("{}: serving {} inv items", self.hostname(), items.len());
        for chunk in items.chunks(INV_CHUNK) {
            self.send(Message::Inv(chunk.to_vec()));
        }
    }

    pub fn send_headers(&mut self, headers: Vec<BlockHeader>) {
        if !self.is_ready() || headers.is_empty() {
            return;
        }

        for header in &headers {
            self.inv_filter.add(&header.hash());
        }

        for chunk in headers.chunks(MAX_HEADERS) {
            self.send(Message::Headers(chunk.to_vec()));
        }
    }

    pub fn send_compact_block(&mut self, block: &Block) {
        let witness = self.compact_witness;
        let compact = CompactBlock::from_block(block, witness, rand::random());
        self.send(Message::CmpctBlock {
            block: compact,
            witness,
        });
    }

    // =========================================================================
    // Inbound
    // =========================================================================

    /// Bytes off the transport
    pub fn feed(&mut self, data: &[u8]) {
        if self.is_destroyed() {
            return;
        }
        self.last_recv = Some(Instant::now());

        let packets = match self.enc.as_mut() {
            Some(enc) if enc.is_active() => match enc.feed(data) {
                Ok(packets) => packets,
                Err(err) => {
                    self.fail(err.into());
                    return;
                }
            },
            _ => {
                self.read_buf.extend_from_slice(data);
                let mut packets = Vec::new();
                loop {
                    match self.codec.decode(&mut self.read_buf) {
                        Ok(Some(packet)) => packets.push(packet),
                        Ok(None) => break,
                        Err(CodecError::BadChecksum(command)) => {
                            self.parse_error(&format!("bad checksum for {}", command));
                        }
                        Err(err) => {
                            self.fail(err.into());
                            return;
                        }
                    }
                }
                packets
            }
        };

        for packet in packets {
            if self.is_destroyed() {
                break;
            }
            self.read_packet(packet);
        }
    }

    fn parse_error(&mut self, reason: &str) {
        log::debug!("{}: parse error ({})", self.hostname(), reason);
        self.emit(PeerEvent::Error(PeerError::Protocol(reason.to_string())));
        self.send_reject(RejectCode::Malformed, "error parsing message", None);
        self.increase_ban(10);
    }

    fn read_packet(&mut self, packet: RawPacket) {
        match Message::decode(&packet.command, &packet.payload) {
            Ok(msg) => self.handle_message(msg),
            Err(err) => self.parse_error(&format!("{}: {}", packet.command, err)),
        }
    }

    /// Process one decoded message
    pub fn handle_message(&mut self, msg: Message) {
        if self.is_destroyed() {
            return;
        }
        log::trace!("{}: received {}", self.hostname(), msg.name());

        let cmd = msg.command();
        let encryption_step = matches!(cmd, Command::EncInit | Command::EncAck);
        let auth_step = matches!(
            cmd,
            Command::AuthChallenge | Command::AuthReply | Command::AuthPropose
        );

        if self.state == PeerState::EncryptionHandshake && self.enc.is_some() && !encryption_step {
            self.encryption_failed(HandshakeError::OutOfOrder("message before encryption handshake"));
        }

        if self.state == PeerState::AuthHandshake && self.auth_started && !auth_step {
            self.fail(PeerError::Handshake("message before authentication".to_string()));
            return;
        }

        if self.version.is_none() && !self.allowed_before_version(cmd) {
            self.send_reject(RejectCode::Invalid, "message before version", None);
            self.increase_ban(1);
            return;
        }

        let forward = match self.dispatch(&msg) {
            Ok(forward) => forward,
            Err(err) => {
                self.fail(err);
                return;
            }
        };

        if self.is_destroyed() {
            return;
        }

        self.responses.fulfill(&msg);

        if forward {
            self.emit(PeerEvent::Message(msg));
        }

        self.advance();
    }

    fn allowed_before_version(&self, cmd: Command) -> bool {
        matches!(
            cmd,
            Command::Version
                | Command::Verack
                | Command::Ping
                | Command::Pong
                | Command::Reject
                | Command::EncInit
                | Command::EncAck
                | Command::AuthChallenge
                | Command::AuthReply
                | Command::AuthPropose
        )
    }

    /// Run the handler for `msg`. Returns whether the pool should see it.
    fn dispatch(&mut self, msg: &Message) -> Result<bool, PeerError> {
        match msg {
            Message::Version(version) => self.handle_version(version).map(|_| false),
            Message::Verack => {
                self.handle_verack();
                Ok(false)
            }
            Message::Ping(nonce) => {
                if let Some(nonce) = nonce {
                    self.send(Message::Pong(*nonce));
                }
                Ok(false)
            }
            Message::Pong(nonce) => {
                self.handle_pong(*nonce);
                Ok(false)
            }
            Message::SendHeaders => {
                self.prefer_headers = true;
                Ok(false)
            }
            Message::FilterLoad(filter) => {
                self.handle_filter_load(filter);
                Ok(false)
            }
            Message::FilterAdd(data) => {
                self.handle_filter_add(data);
                Ok(false)
            }
            Message::FilterClear => {
                if let Some(filter) = self.spv_filter.as_mut() {
                    filter.reset();
                }
                self.no_relay = false;
                Ok(false)
            }
            Message::FeeFilter(rate) => {
                if *rate < 0 || *rate > MAX_MONEY {
                    self.increase_ban(100);
                } else {
                    self.fee_rate = Some(*rate);
                }
                Ok(false)
            }
            Message::SendCmpct { mode, version } => {
                self.handle_send_compact(*mode, *version);
                Ok(false)
            }
            Message::EncInit { public_key, cipher } => {
                self.handle_encinit(public_key, *cipher);
                Ok(false)
            }
            Message::EncAck { public_key } => {
                self.handle_encack(public_key);
                Ok(false)
            }
            Message::AuthChallenge(hash) => self.handle_auth_challenge(hash).map(|_| false),
            Message::AuthReply(signature) => self.handle_auth_reply(signature).map(|_| false),
            Message::AuthPropose(hash) => self.handle_auth_propose(hash).map(|_| false),
            Message::CmpctBlock { block, .. } => {
                self.handle_compact_block(block);
                Ok(false)
            }
            Message::BlockTxn { response, .. } => {
                self.handle_block_txn(response);
                Ok(false)
            }
            Message::GetBlockTxn(request) => {
                self.handle_get_block_txn(request);
                Ok(false)
            }
            Message::MerkleBlock(block) => Ok(self.handle_merkle_block(block)),
            Message::Block { block, .. } => {
                let hash = block.hash();
                self.inv_filter.add(&hash);
                self.block_map.remove(&hash);
                self.compact_blocks.remove(&hash);
                if self.syncing {
                    self.block_time = Some(Instant::now());
                }
                Ok(true)
            }
            Message::Tx { tx, .. } => {
                let hash = tx.hash();
                self.inv_filter.add(&hash);
                self.tx_map.remove(&hash);
                if self.merkle.is_some() && self.merkle_matches.remove(&hash) && self.merkle_matches.is_empty() {
                    self.merkle = None;
                    self.merkle_time = None;
                }
                Ok(true)
            }
            Message::NotFound(items) => {
                for item in items {
                    if item.is_block() {
                        self.block_map.remove(&item.hash);
                    } else if item.is_tx() {
                        self.tx_map.remove(&item.hash);
                    }
                }
                Ok(true)
            }
            Message::Inv(items) => {
                for item in items {
                    self.inv_filter.add(&item.hash);
                }
                Ok(true)
            }
            Message::Addr(addrs) => {
                for addr in addrs {
                    self.addr_filter.add(addr.addr.to_string().as_bytes());
                }
                Ok(true)
            }
            Message::Reject(reject) => {
                log::debug!(
                    "{}: received reject {} (code={:?} reason={})",
                    self.hostname(),
                    reject.message,
                    reject.code,
                    reject.reason
                );
                Ok(true)
            }
            Message::GetAddr
            | Message::GetData(_)
            | Message::GetBlocks(_)
            | Message::GetHeaders(_)
            | Message::Headers(_)
            | Message::Mempool
            | Message::Unknown { .. } => Ok(true),
        }
    }

    fn handle_version(&mut self, msg: &VersionMessage) -> Result<(), PeerError> {
        if self.version.is_some() {
            return Err(PeerError::Protocol("peer sent a duplicate version".to_string()));
        }

        self.version = Some(msg.version);
        self.services = msg.services;
        self.height = msg.height;
        self.agent = msg.agent.clone();
        self.no_relay = msg.no_relay;
        self.local = Some(msg.remote.clone());

        if !self.config.self_connect && self.ctx.has_nonce(msg.nonce) {
            return Err(PeerError::Protocol("we connected to ourself".to_string()));
        }

        if msg.version < MIN_VERSION {
            return Err(PeerError::Protocol(format!(
                "peer does not support required protocol version ({})",
                msg.version
            )));
        }

        if self.outbound {
            if !msg.services.contains(ServiceFlags::NETWORK) {
                return Err(PeerError::Protocol("peer does not support network services".to_string()));
            }

            if self.config.headers && msg.version < HEADERS_VERSION {
                return Err(PeerError::Protocol("peer does not support getheaders".to_string()));
            }

            if self.config.spv {
                if !msg.services.contains(ServiceFlags::BLOOM) {
                    return Err(PeerError::Protocol("peer does not support BIP37".to_string()));
                }
                if msg.version < BLOOM_VERSION {
                    return Err(PeerError::Protocol("peer does not support BIP37".to_string()));
                }
            }

            if self.ctx.has_witness() && !msg.services.contains(ServiceFlags::WITNESS) {
                return Err(PeerError::Protocol(
                    "peer does not support segregated witness".to_string(),
                ));
            }

            if self.config.compact && !self.has_compact_support() {
                log::debug!("{}: peer does not support compact blocks", self.hostname());
            }
        }

        log::debug!(
            "{}: received version (version={} height={} agent={})",
            self.hostname(),
            msg.version,
            msg.height,
            msg.agent
        );

        if self.version_sent {
            self.send(Message::Verack);
        } else {
            self.verack_pending = true;
        }
        Ok(())
    }

    fn handle_verack(&mut self) {
        if self.ack {
            log::debug!("{}: peer sent duplicate verack", self.hostname());
            return;
        }
        self.ack = true;
        log::debug!("{}: received verack", self.hostname());
    }

    fn handle_pong(&mut self, nonce: u64) {
        let Some(challenge) = self.challenge else {
            log::debug!("{}: peer sent an unsolicited pong", self.hostname());
            return;
        };

        if nonce != challenge {
            if nonce == 0 {
                log::debug!("{}: peer sent a zero nonce", self.hostname());
                self.challenge = None;
                return;
            }
            log::debug!("{}: peer sent the wrong nonce", self.hostname());
            return;
        }

        let now = Instant::now();
        if let Some(last_ping) = self.last_ping {
            let rtt = now.saturating_duration_since(last_ping);
            self.last_pong = Some(now);
            self.min_ping = Some(self.min_ping.map_or(rtt, |min| min.min(rtt)));
        }
        self.challenge = None;
    }

    fn handle_filter_load(&mut self, filter: &BloomFilter) {
        if !filter.is_within_constraints() {
            self.increase_ban(100);
            return;
        }
        self.spv_filter = Some(filter.clone());
        self.no_relay = false;
    }

    fn handle_filter_add(&mut self, data: &[u8]) {
        if data.len() > MAX_SCRIPT_PUSH {
            self.increase_ban(100);
            return;
        }
        if let Some(filter) = self.spv_filter.as_mut() {
            filter.insert(data);
        }
        self.no_relay = false;
    }

    fn handle_send_compact(&mut self, mode: u8, version: u64) {
        if self.compact_mode.is_some() {
            log::debug!("{}: peer sent a duplicate sendcmpct", self.hostname());
            return;
        }
        if version > 2 {
            log::info!("{}: peer requested compact blocks version {}", self.hostname(), version);
            return;
        }
        if mode > 1 {
            log::info!("{}: peer requested compact blocks mode {}", self.hostname(), mode);
            return;
        }
        log::info!(
            "{}: peer initialized compact blocks (mode={}, version={})",
            self.hostname(),
            mode,
            version
        );
        self.compact_mode = Some(mode);
        self.compact_witness = version == 2;
    }

    fn encryption_failed(&mut self, err: HandshakeError) {
        log::warn!("{}: encryption handshake failed: {}", self.hostname(), err);
        if self.enc.as_ref().map_or(false, |enc| !enc.is_active()) {
            self.enc = None;
        }
    }

    fn handle_encinit(&mut self, public_key: &[u8; 33], cipher: u8) {
        let Some(enc) = self.enc.as_mut() else {
            return;
        };
        if let Err(err) = enc.encinit(public_key, cipher) {
            self.encryption_failed(err);
            return;
        }
        let ack = enc.to_encack();
        self.send(ack);
        if !self.enc_init_sent {
            self.send_encinit();
        }
    }

    fn handle_encack(&mut self, public_key: &[u8; 33]) {
        let Some(enc) = self.enc.as_mut() else {
            return;
        };
        if let Err(err) = enc.encack(public_key) {
            self.encryption_failed(err);
        }
    }

    fn handle_auth_challenge(&mut self, hash: &Hash256) -> Result<(), PeerError> {
        let Some(auth) = self.auth.as_mut() else {
            return Ok(());
        };
        let signature = auth.challenge(hash)?;
        self.send(Message::AuthReply(signature));
        Ok(())
    }

    fn handle_auth_reply(&mut self, signature: &[u8; 64]) -> Result<(), PeerError> {
        let Some(auth) = self.auth.as_mut() else {
            return Ok(());
        };
        if let Some(hash) = auth.reply(signature)? {
            self.send(Message::AuthPropose(hash));
        }
        Ok(())
    }

    fn handle_auth_propose(&mut self, hash: &Hash256) -> Result<(), PeerError> {
        let Some(auth) = self.auth.as_mut() else {
            return Ok(());
        };
        let challenge = auth.propose(hash)?;
        self.send(Message::AuthChallenge(challenge));
        Ok(())
    }

    fn handle_merkle_block(&mut self, block: &MerkleBlock) -> bool {
        if !self.config.spv {
            log::warn!("{}: peer sent unsolicited merkleblock", self.hostname());
            self.increase_ban(100);
            return false;
        }

        let hash = block.hash();
        if !self.block_map.contains_key(&hash) {
            log::debug!("{}: peer sent an unrequested merkleblock", self.hostname());
            return false;
        }

        if self.merkle.is_some() {
            log::debug!("{}: peer sent a merkleblock while waiting on matches", self.hostname());
            return false;
        }

        let Some(tree) = block.matches() else {
            log::warn!("{}: peer sent an invalid merkleblock", self.hostname());
            self.increase_ban(100);
            return false;
        };

        self.block_map.remove(&hash);
        if !tree.matches.is_empty() {
            self.merkle = Some(block.clone());
            self.merkle_time = Some(Instant::now());
            self.merkle_matches = tree.matches.into_iter().collect();
        }
        true
    }

    fn deliver_block(&mut self, block: Block) {
        let hash = block.hash();
        self.block_map.remove(&hash);
        self.inv_filter.add(&hash);
        let witness = self.compact_witness;
        self.emit(PeerEvent::Message(Message::Block {
            block: Arc::new(block),
            witness,
        }));
    }

    fn handle_compact_block(&mut self, received: &CompactBlock) {
        let hash = received.hash();
        let witness = self.compact_witness;

        if !self.config.compact || !self.has_compact_support() || !self.has_compact() {
            log::info!("{}: peer sent unsolicited cmpctblock", self.hostname());
            self.fail(PeerError::Protocol("unsolicited cmpctblock".to_string()));
            return;
        }

        if self.compact_blocks.contains_key(&hash) {
            log::debug!("{}: peer sent a duplicate compact block", self.hostname());
            return;
        }

        if !self.block_map.contains_key(&hash) {
            if self.config.block_mode != 1 {
                log::warn!("{}: peer sent an unrequested compact block", self.hostname());
                self.fail(PeerError::Protocol("unrequested cmpctblock".to_string()));
                return;
            }
            self.block_map.insert(hash, Instant::now());
        }

        let Some(pool) = self.ctx.mempool() else {
            log::warn!("{}: requesting compact blocks without a mempool", self.hostname());
            return;
        };

        let mut block = received.clone();
        match block.init() {
            Ok(true) => {}
            Ok(false) => {
                log::info!(
                    "{}: siphash collision for {}, requesting full block",
                    self.hostname(),
                    hash_to_hex(&hash)
                );
                self.get_full_block(hash);
                self.increase_ban(10);
                return;
            }
            Err(err) => {
                log::debug!("{}: peer sent an invalid compact block: {}", self.hostname(), err);
                self.increase_ban(100);
                return;
            }
        }

        if block.fill_mempool(witness, pool.iter()) {
            log::debug!("{}: received full compact block {}", self.hostname(), hash_to_hex(&hash));
            match block.to_block() {
                Some(full) => self.deliver_block(full),
                None => self.get_full_block(hash),
            }
            return;
        }

        if self.compact_blocks.len() >= self.config.max_compact_blocks {
            log::warn!("{}: compact block DoS attempt", self.hostname());
            self.fail(PeerError::Protocol("too many compact blocks in flight".to_string()));
            return;
        }

        let request = block.to_request();
        self.compact_blocks.insert(hash, (block, Instant::now()));
        log::debug!(
            "{}: sending getblocktxn for {} ({} missing)",
            self.hostname(),
            hash_to_hex(&hash),
            request.indexes.len()
        );
        self.send(Message::GetBlockTxn(request));
    }

    fn handle_block_txn(&mut self, response: &TxResponse) {
        let Some((mut block, _)) = self.compact_blocks.remove(&response.hash) else {
            log::debug!("{}: peer sent unsolicited blocktxn", self.hostname());
            return;
        };

        if !block.fill_missing(response) {
            log::warn!(
                "{}: peer sent non-full blocktxn for {}, requesting full block",
                self.hostname(),
                hash_to_hex(&response.hash)
            );
            self.get_full_block(response.hash);
            self.increase_ban(10);
            return;
        }

        log::debug!("{}: filled compact block {}", self.hostname(), hash_to_hex(&response.hash));
        match block.to_block() {
            Some(full) => self.deliver_block(full),
            None => self.get_full_block(response.hash),
        }
    }

    fn handle_get_block_txn(&mut self, request: &TxRequest) {
        if self.config.spv {
            return;
        }

        let Some((block, height)) = self.ctx.get_block(&request.hash) else {
            log::debug!("{}: peer sent getblocktxn for non-existent block", self.hostname());
            self.increase_ban(100);
            return;
        };

        if height + MAX_BLOCKTXN_DEPTH < self.ctx.height() {
            log::debug!("{}: peer sent a getblocktxn for a block > 15 deep", self.hostname());
            return;
        }

        let response = TxResponse::from_block(&block, request);
        let witness = self.compact_witness;
        self.send(Message::BlockTxn { response, witness });
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::{OutPoint, TxInput, TxOutput};
    use crate::network::context::StaticContext;
    use crate::network::message::PROTOCOL_VERSION;
    use tokio::sync::mpsc;

    pub(crate) fn addr() -> SocketAddr {
        "10.0.0.1:8333".parse().unwrap()
    }

    pub(crate) fn test_peer(
        config: PeerConfig,
        ctx: Arc<StaticContext>,
        outbound: bool,
    ) -> (Peer, mpsc::UnboundedReceiver<Bytes>) {
        let mut peer = Peer::new(1, addr(), outbound, Arc::new(config), ctx);
        let (conn, rx) = Connection::channel(1 << 20);
        peer.on_connect(conn);
        (peer, rx)
    }

    pub(crate) fn remote_version(services: ServiceFlags) -> Message {
        Message::Version(VersionMessage {
            version: PROTOCOL_VERSION,
            services,
            time: 0,
            remote: NetAddress::unspecified(),
            local: NetAddress::unspecified(),
            nonce: 42,
            agent: "/remote:0.1/".to_string(),
            height: 100,
            no_relay: false,
        })
    }

    /// Everything written so far, decoded
    pub(crate) fn sent(rx: &mut mpsc::UnboundedReceiver<Bytes>) -> Vec<Message> {
        let mut codec = WireCodec::new(PeerConfig::default().magic());
        let mut buf = BytesMut::new();
        while let Ok(data) = rx.try_recv() {
            buf.extend_from_slice(&data);
        }
        let mut out = Vec::new();
        while let Some(packet) = codec.decode(&mut buf).unwrap() {
            out.push(Message::decode(&packet.command, &packet.payload).unwrap());
        }
        out
    }

    fn framed(msg: &Message) -> Bytes {
        frame(PeerConfig::default().magic(), msg.name(), &msg.encode_payload(), None).unwrap()
    }

    fn events(peer: &mut Peer) -> Vec<PeerEvent> {
        std::iter::from_fn(|| peer.next_event()).collect()
    }

    /// Outbound peer that finished the version handshake
    pub(crate) fn ready_peer(
        config: PeerConfig,
        ctx: Arc<StaticContext>,
    ) -> (Peer, mpsc::UnboundedReceiver<Bytes>) {
        let (mut peer, mut rx) = test_peer(config, ctx, true);
        let (tx, _wait) = oneshot::channel();
        peer.open(tx);
        peer.feed(&framed(&remote_version(ServiceFlags::NETWORK | ServiceFlags::WITNESS)));
        peer.feed(&framed(&Message::Verack));
        assert!(peer.is_ready());
        sent(&mut rx);
        events(&mut peer);
        (peer, rx)
    }

    pub(crate) fn make_tx(n: u8) -> Arc<Transaction> {
        let input = TxInput::new(OutPoint::new([n; 32], 0), vec![n]);
        Arc::new(Transaction::new(1, vec![input], vec![TxOutput::new(1000, vec![0x51])], 0))
    }

    pub(crate) fn make_block(txs: usize) -> Block {
        let mut transactions = vec![Arc::new(Transaction::coinbase(b"cb", 50, vec![0x51]))];
        transactions.extend((1..=txs as u8).map(make_tx));
        let header = BlockHeader {
            version: 1,
            prev_block: [1; 32],
            merkle_root: [0; 32],
            time: 1_600_000_000,
            bits: 0x207fffff,
            nonce: 7,
        };
        Block::new(header, transactions)
    }

    #[tokio::test]
    async fn test_version_handshake() {
        let ctx = Arc::new(StaticContext::new(10, true, true));
        let (mut peer, mut rx) = test_peer(PeerConfig::default(), ctx, true);
        assert_eq!(peer.state(), PeerState::Connected);

        let (tx, mut wait) = oneshot::channel();
        peer.open(tx);
        assert_eq!(peer.state(), PeerState::VersionHandshake);
        assert!(peer.handshake_deadline().is_some());
        assert!(matches!(sent(&mut rx)[..], [Message::Version(_)]));

        peer.feed(&framed(&remote_version(ServiceFlags::NETWORK | ServiceFlags::WITNESS)));
        assert_eq!(sent(&mut rx), vec![Message::Verack]);
        assert!(!peer.is_ready());

        peer.feed(&framed(&Message::Verack));
        assert!(peer.is_ready());
        assert_eq!(wait.try_recv().unwrap(), Ok(()));
        assert_eq!(events(&mut peer), vec![PeerEvent::Connect, PeerEvent::Open]);
        assert_eq!(
            sent(&mut rx),
            vec![
                Message::SendHeaders,
                Message::SendCmpct { mode: 0, version: 2 },
                Message::SendCmpct { mode: 0, version: 1 },
            ]
        );

        let info = peer.info();
        assert_eq!(info.version, Some(PROTOCOL_VERSION));
        assert_eq!(info.agent, "/remote:0.1/");
        assert_eq!(info.height, 100);
    }

    #[tokio::test]
    async fn test_missing_witness_is_fatal() {
        let ctx = Arc::new(StaticContext::new(10, true, true));
        let (mut peer, _rx) = test_peer(PeerConfig::default(), ctx, true);
        let (tx, mut wait) = oneshot::channel();
        peer.open(tx);

        peer.handle_message(remote_version(ServiceFlags::NETWORK));
        assert!(peer.is_destroyed());
        assert!(matches!(wait.try_recv().unwrap(), Err(PeerError::Protocol(_))));
        assert_eq!(
            events(&mut peer).last(),
            Some(&PeerEvent::Close { connected: true })
        );
    }

    #[tokio::test]
    async fn test_self_connection() {
        let ctx = Arc::new(StaticContext::new(10, true, false));
        let (mut peer, mut rx) = test_peer(PeerConfig::default(), ctx.clone(), false);
        let (tx, mut wait) = oneshot::channel();
        peer.open(tx);

        let ours = match &sent(&mut rx)[0] {
            Message::Version(version) => version.clone(),
            other => panic!("expected version, got {:?}", other),
        };
        assert!(ctx.has_nonce(ours.nonce));

        peer.handle_message(Message::Version(ours));
        assert!(peer.is_destroyed());
        assert!(wait.try_recv().unwrap().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_verack_timeout() {
        let ctx = Arc::new(StaticContext::new(0, false, false));
        let (mut peer, _rx) = test_peer(PeerConfig::default(), ctx, true);
        let (tx, mut wait) = oneshot::channel();
        peer.open(tx);

        tokio::time::advance(VERSION_TIMEOUT - Duration::from_millis(1)).await;
        peer.advance();
        assert_eq!(peer.state(), PeerState::VersionHandshake);

        tokio::time::advance(Duration::from_millis(1)).await;
        peer.advance();
        assert!(peer.is_destroyed());
        assert_eq!(
            wait.try_recv().unwrap(),
            Err(PeerError::HandshakeTimeout("verack"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_version_timeout_after_verack() {
        let ctx = Arc::new(StaticContext::new(0, false, false));
        let (mut peer, _rx) = test_peer(PeerConfig::default(), ctx, true);
        let (tx, mut wait) = oneshot::channel();
        peer.open(tx);

        tokio::time::advance(Duration::from_secs(9)).await;
        peer.handle_message(Message::Verack);
        assert_eq!(peer.state(), PeerState::VersionHandshake);

        tokio::time::advance(Duration::from_secs(9)).await;
        peer.advance();
        assert!(!peer.is_destroyed());

        tokio::time::advance(Duration::from_secs(1)).await;
        peer.advance();
        assert_eq!(
            wait.try_recv().unwrap(),
            Err(PeerError::HandshakeTimeout("version"))
        );
    }

    #[tokio::test]
    async fn test_early_version_waits_for_ours() {
        let ctx = Arc::new(StaticContext::new(0, true, true));
        let (mut peer, mut rx) = test_peer(PeerConfig::default(), ctx, false);

        peer.handle_message(remote_version(ServiceFlags::NETWORK | ServiceFlags::WITNESS));
        assert!(sent(&mut rx).is_empty());

        let (tx, _wait) = oneshot::channel();
        peer.open(tx);
        let order: Vec<_> = sent(&mut rx).iter().map(|msg| msg.name().to_string()).collect();
        assert_eq!(order, vec!["version", "verack"]);

        peer.handle_message(Message::Verack);
        assert!(peer.is_ready());
    }

    #[tokio::test]
    async fn test_ban_emitted_once() {
        let ctx = Arc::new(StaticContext::default());
        let (mut peer, _rx) = test_peer(PeerConfig::default(), ctx, true);
        events(&mut peer);

        let crossed: Vec<bool> = (0..10).map(|_| peer.increase_ban(11)).collect();
        assert_eq!(crossed.iter().position(|c| *c), Some(9));
        assert_eq!(peer.ban_score(), 110);

        let bans = events(&mut peer)
            .into_iter()
            .filter(|e| *e == PeerEvent::Ban)
            .count();
        assert_eq!(bans, 1);
        assert!(!peer.is_destroyed());
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let ctx = Arc::new(StaticContext::default());
        let (mut peer, _rx) = test_peer(PeerConfig::default(), ctx, true);
        events(&mut peer);

        let (tx, mut rx) = oneshot::channel();
        peer.wait(Command::Headers, Duration::from_secs(60), tx);

        peer.destroy();
        peer.destroy();
        assert_eq!(rx.try_recv().unwrap(), Err(PeerError::Destroyed));
        assert_eq!(events(&mut peer), vec![PeerEvent::Close { connected: true }]);

        let (tx, mut rx) = oneshot::channel();
        peer.wait(Command::Headers, Duration::from_secs(60), tx);
        assert_eq!(rx.try_recv().unwrap(), Err(PeerError::Destroyed));
    }

    #[tokio::test]
    async fn test_wait_resolved_by_message() {
        let ctx = Arc::new(StaticContext::new(0, true, true));
        let (mut peer, _rx) = ready_peer(PeerConfig::default(), ctx);

        let (tx, mut rx) = oneshot::channel();
        peer.wait(Command::Headers, Duration::from_secs(60), tx);
        peer.handle_message(Message::Headers(Vec::new()));
        assert_eq!(rx.try_recv().unwrap(), Ok(Message::Headers(Vec::new())));
        assert_eq!(
            events(&mut peer),
            vec![PeerEvent::Message(Message::Headers(Vec::new()))]
        );
    }

    #[tokio::test]
    async fn test_request_timeouts() {
        let ctx = Arc::new(StaticContext::new(0, false, true));
        let (mut peer, _rx) = ready_peer(PeerConfig::default(), ctx);

        peer.get_headers(vec![[0; 32]], [0; 32]);
        peer.get_block(&[[3; 32]]);
        assert!(peer.responses.contains(Command::Headers));
        assert!(peer.responses.contains(Command::Data));

        peer.get_blocks(vec![[0; 32]], [0; 32]);
        assert!(peer.responses.contains(Command::Inv));
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let ctx = Arc::new(StaticContext::new(0, true, true));
        let (mut peer, mut rx) = ready_peer(PeerConfig::default(), ctx);

        peer.send_ping();
        let nonce = match sent(&mut rx)[..] {
            [Message::Ping(Some(nonce))] => nonce,
            ref other => panic!("unexpected {:?}", other),
        };

        // Outstanding challenge, no second ping
        peer.send_ping();
        assert!(sent(&mut rx).is_empty());

        peer.handle_message(Message::Pong(nonce.wrapping_add(1)));
        assert_eq!(peer.challenge, Some(nonce));

        peer.handle_message(Message::Pong(nonce));
        assert_eq!(peer.challenge, None);
        assert!(peer.info().min_ping.is_some());
    }

    #[tokio::test]
    async fn test_zero_pong_clears_challenge() {
        let ctx = Arc::new(StaticContext::new(0, true, true));
        let (mut peer, _rx) = ready_peer(PeerConfig::default(), ctx);
        peer.send_ping();
        peer.handle_message(Message::Pong(0));
        assert_eq!(peer.challenge, None);
        assert!(peer.info().min_ping.is_none());
    }

    #[tokio::test]
    async fn test_ping_reply() {
        let ctx = Arc::new(StaticContext::new(0, true, true));
        let (mut peer, mut rx) = ready_peer(PeerConfig::default(), ctx);
        peer.handle_message(Message::Ping(Some(9)));
        peer.handle_message(Message::Ping(None));
        assert_eq!(sent(&mut rx), vec![Message::Pong(9)]);
    }

    #[tokio::test]
    async fn test_relay_preferences() {
        let ctx = Arc::new(StaticContext::new(0, true, true));
        let (mut peer, _rx) = ready_peer(PeerConfig::default(), ctx);

        peer.handle_message(Message::FeeFilter(MAX_MONEY + 1));
        assert_eq!(peer.ban_score(), 100);
        peer.handle_message(Message::FeeFilter(1000));
        assert_eq!(peer.info().fee_rate, Some(1000));

        peer.handle_message(Message::FilterAdd(vec![0; MAX_SCRIPT_PUSH + 1]));
        assert_eq!(peer.ban_score(), 200);

        peer.handle_message(Message::SendCmpct { mode: 1, version: 2 });
        peer.handle_message(Message::SendCmpct { mode: 0, version: 1 });
        let info = peer.info();
        assert_eq!(info.compact_mode, Some(1));
        assert!(info.compact_witness);

        peer.handle_message(Message::SendHeaders);
        assert!(peer.info().prefer_headers);
    }

    #[tokio::test]
    async fn test_oversized_filterload() {
        let ctx = Arc::new(StaticContext::new(0, true, true));
        let (mut peer, _rx) = ready_peer(PeerConfig::default(), ctx);
        let filter = BloomFilter::new(vec![0; 36_001], 10, 0, crate::core::BloomFlags::None);
        peer.handle_message(Message::FilterLoad(filter));
        assert_eq!(peer.ban_score(), 100);
        assert!(peer.spv_filter.is_none());
    }

    #[tokio::test]
    async fn test_parse_error_rejects() {
        let ctx = Arc::new(StaticContext::new(0, true, true));
        let (mut peer, mut rx) = ready_peer(PeerConfig::default(), ctx);

        let bad = frame(PeerConfig::default().magic(), "inv", &[5], None).unwrap();
        peer.feed(&bad);

        assert_eq!(peer.ban_score(), 10);
        assert!(!peer.is_destroyed());
        match &sent(&mut rx)[..] {
            [Message::Reject(reject)] => assert_eq!(reject.code, RejectCode::Malformed),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bad_magic_is_fatal() {
        let ctx = Arc::new(StaticContext::new(0, true, true));
        let (mut peer, _rx) = ready_peer(PeerConfig::default(), ctx);
        let bad = frame(0x0709_110b, "verack", &[], None).unwrap();
        peer.feed(&bad);
        assert!(peer.is_destroyed());
    }

    #[tokio::test]
    async fn test_message_before_version() {
        let ctx = Arc::new(StaticContext::new(0, true, true));
        let (mut peer, _rx) = test_peer(PeerConfig::default(), ctx, true);
        events(&mut peer);
        peer.handle_message(Message::Inv(Vec::new()));
        assert_eq!(peer.ban_score(), 1);
        assert!(events(&mut peer).is_empty());
    }

    #[tokio::test]
    async fn test_tx_checksum_is_hash() {
        let ctx = Arc::new(StaticContext::new(0, true, true));
        let (mut peer, mut rx) = ready_peer(PeerConfig::default(), ctx);
        let tx = make_tx(3);
        peer.send(Message::Tx {
            tx: tx.clone(),
            witness: false,
        });

        let data = rx.try_recv().unwrap();
        assert_eq!(&data[20..24], &tx.hash()[..4]);
    }

    #[tokio::test]
    async fn test_announce_tx_dedup() {
        let ctx = Arc::new(StaticContext::new(0, true, true));
        let (mut peer, mut rx) = ready_peer(PeerConfig::default(), ctx);
        let tx = make_tx(1);

        peer.announce_tx(&[tx.clone()]);
        peer.flush_inv();
        peer.announce_tx(&[tx.clone()]);
        peer.flush_inv();

        assert_eq!(
            sent(&mut rx),
            vec![Message::Inv(vec![InvItem::new(InvType::Tx, tx.hash())])]
        );
    }

    #[tokio::test]
    async fn test_announce_addr_dedup() {
        let ctx = Arc::new(StaticContext::new(0, true, true));
        let (mut peer, mut rx) = ready_peer(PeerConfig::default(), ctx);
        let known: Vec<NetAddress> = (1..=3u8)
            .map(|n| NetAddress::new(SocketAddr::from(([10, 0, 0, n], 8333)), ServiceFlags::NETWORK))
            .collect();

        peer.announce_addr(&known[..2]);
        peer.announce_addr(&known);

        let relayed: Vec<Vec<SocketAddr>> = sent(&mut rx)
            .into_iter()
            .map(|msg| match msg {
                Message::Addr(addrs) => addrs.iter().map(|a| a.addr).collect(),
                other => panic!("unexpected {}", other.name()),
            })
            .collect();
        assert_eq!(
            relayed,
            vec![vec![known[0].addr, known[1].addr], vec![known[2].addr]]
        );
    }

    #[tokio::test]
    async fn test_announce_tx_fee_filter() {
        let ctx = Arc::new(StaticContext::new(0, true, true));
        let cheap = make_tx(1);
        ctx.add_tx(cheap.clone(), 1);
        let (mut peer, mut rx) = ready_peer(PeerConfig::default(), ctx);

        peer.handle_message(Message::FeeFilter(100_000));
        peer.announce_tx(&[cheap]);
        peer.flush_inv();
        assert!(sent(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_announce_block_flushes() {
        let ctx = Arc::new(StaticContext::new(0, true, true));
        let (mut peer, mut rx) = ready_peer(PeerConfig::default(), ctx);
        let block = Arc::new(make_block(1));

        peer.announce_block(&[block.clone()]);
        assert_eq!(
            sent(&mut rx),
            vec![Message::Inv(vec![InvItem::new(InvType::Block, block.hash())])]
        );

        peer.handle_message(Message::SendHeaders);
        let other = Arc::new(make_block(2));
        peer.announce_block(&[block.clone(), other.clone()]);
        assert_eq!(sent(&mut rx), vec![Message::Headers(vec![other.header])]);
    }

    #[tokio::test]
    async fn test_announce_block_high_bandwidth() {
        let ctx = Arc::new(StaticContext::new(0, true, true));
        let (mut peer, mut rx) = ready_peer(PeerConfig::default(), ctx);
        peer.handle_message(Message::SendCmpct { mode: 1, version: 2 });

        let block = make_block(2);
        peer.announce_block(&[Arc::new(block.clone())]);
        match &sent(&mut rx)[..] {
            [Message::CmpctBlock { block: compact, witness: true }] => {
                assert_eq!(compact.hash(), block.hash());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    fn compact_peer(ctx: Arc<StaticContext>) -> (Peer, mpsc::UnboundedReceiver<Bytes>) {
        let (mut peer, rx) = ready_peer(PeerConfig::default(), ctx);
        peer.handle_message(Message::SendCmpct { mode: 0, version: 2 });
        (peer, rx)
    }

    #[tokio::test]
    async fn test_compact_block_from_mempool() {
        let ctx = Arc::new(StaticContext::new(0, true, true));
        let block = make_block(3);
        for tx in &block.transactions[1..] {
            ctx.add_tx(tx.clone(), 1000);
        }
        let (mut peer, mut rx) = compact_peer(ctx);

        peer.get_block(&[block.hash()]);
        assert_eq!(
            sent(&mut rx),
            vec![Message::GetData(vec![InvItem::new(InvType::CmpctBlock, block.hash())])]
        );

        let compact = CompactBlock::from_block(&block, true, 99);
        peer.feed(&framed(&Message::CmpctBlock {
            block: compact,
            witness: true,
        }));

        match &events(&mut peer)[..] {
            [PeerEvent::Message(Message::Block { block: full, .. })] => {
                assert_eq!(**full, block);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(peer.block_map.is_empty());
        assert!(!peer.responses.contains(Command::Data));
    }

    #[tokio::test]
    async fn test_compact_block_round_trip() {
        let ctx = Arc::new(StaticContext::new(0, true, true));
        let block = make_block(4);
        ctx.add_tx(block.transactions[2].clone(), 1000);
        let (mut peer, mut rx) = compact_peer(ctx);

        peer.get_block(&[block.hash()]);
        sent(&mut rx);
        peer.handle_message(Message::CmpctBlock {
            block: CompactBlock::from_block(&block, true, 5),
            witness: true,
        });

        let request = match &sent(&mut rx)[..] {
            [Message::GetBlockTxn(request)] => request.clone(),
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(request.indexes, vec![1, 3, 4]);
        assert_eq!(peer.compact_blocks.len(), 1);
        assert!(peer.responses.contains(Command::BlockTxn));

        let response = TxResponse::from_block(&block, &request);
        peer.handle_message(Message::BlockTxn {
            response,
            witness: true,
        });

        assert!(peer.compact_blocks.is_empty());
        assert!(!peer.responses.contains(Command::BlockTxn));
        match &events(&mut peer)[..] {
            [PeerEvent::Message(Message::Block { block: full, .. })] => assert_eq!(**full, block),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_short_blocktxn_falls_back() {
        let ctx = Arc::new(StaticContext::new(0, true, true));
        let block = make_block(3);
        let (mut peer, mut rx) = compact_peer(ctx);

        peer.get_block(&[block.hash()]);
        peer.handle_message(Message::CmpctBlock {
            block: CompactBlock::from_block(&block, true, 5),
            witness: true,
        });
        sent(&mut rx);

        let response = TxResponse::new(block.hash(), vec![block.transactions[1].clone()]);
        peer.handle_message(Message::BlockTxn {
            response,
            witness: true,
        });

        assert_eq!(peer.ban_score(), 10);
        assert_eq!(
            sent(&mut rx),
            vec![Message::GetData(vec![InvItem::new(InvType::WitnessBlock, block.hash())])]
        );
    }

    #[tokio::test]
    async fn test_compact_blocks_in_flight_limit() {
        let ctx = Arc::new(StaticContext::new(0, true, true));
        let (mut peer, _rx) = compact_peer(ctx);
        let limit = PeerConfig::default().max_compact_blocks;

        for n in 0..=limit {
            let mut block = make_block(2);
            block.header.nonce = n as u32;
            peer.get_block(&[block.hash()]);
            peer.handle_message(Message::CmpctBlock {
                block: CompactBlock::from_block(&block, true, n as u64),
                witness: true,
            });
            if n < limit {
                assert!(!peer.is_destroyed());
                assert_eq!(peer.compact_blocks.len(), n + 1);
            }
        }

        assert!(peer.is_destroyed());
        assert!(events(&mut peer)
            .iter()
            .any(|event| matches!(event, PeerEvent::Error(PeerError::Protocol(_)))));
    }

    #[tokio::test]
    async fn test_unrequested_compact_block() {
        let ctx = Arc::new(StaticContext::new(0, true, true));
        let (mut peer, _rx) = compact_peer(ctx);
        let block = make_block(1);
        peer.handle_message(Message::CmpctBlock {
            block: CompactBlock::from_block(&block, true, 5),
            witness: true,
        });
        assert!(peer.is_destroyed());
    }

    #[tokio::test]
    async fn test_compact_without_sendcmpct() {
        let ctx = Arc::new(StaticContext::new(0, true, true));
        let (mut peer, _rx) = ready_peer(PeerConfig::default(), ctx);
        let block = make_block(1);
        peer.get_block(&[block.hash()]);
        peer.handle_message(Message::CmpctBlock {
            block: CompactBlock::from_block(&block, true, 5),
            witness: true,
        });
        assert!(peer.is_destroyed());
    }

    #[tokio::test]
    async fn test_get_block_txn() {
        let ctx = Arc::new(StaticContext::new(100, true, true));
        let known = Arc::new(make_block(3));
        let deep = Arc::new(make_block(2));
        ctx.add_block(known.clone(), 95);
        ctx.add_block(deep.clone(), 10);
        let (mut peer, mut rx) = compact_peer(ctx);

        peer.handle_message(Message::GetBlockTxn(TxRequest::new(known.hash(), vec![2])));
        assert_eq!(
            sent(&mut rx),
            vec![Message::BlockTxn {
                response: TxResponse::new(known.hash(), vec![known.transactions[2].clone()]),
                witness: true,
            }]
        );

        peer.handle_message(Message::GetBlockTxn(TxRequest::new(deep.hash(), vec![1])));
        assert!(sent(&mut rx).is_empty());
        assert_eq!(peer.ban_score(), 0);

        peer.handle_message(Message::GetBlockTxn(TxRequest::new([9; 32], vec![1])));
        assert_eq!(peer.ban_score(), 100);
    }

    #[tokio::test]
    async fn test_notfound_clears_downloads() {
        let ctx = Arc::new(StaticContext::new(0, true, true));
        let (mut peer, _rx) = ready_peer(PeerConfig::default(), ctx);
        peer.get_tx(&[[4; 32]]);
        assert_eq!(peer.tx_map.len(), 1);
        peer.handle_message(Message::NotFound(vec![InvItem::new(InvType::WitnessTx, [4; 32])]));
        assert!(peer.tx_map.is_empty());
    }

    #[derive(Default)]
    struct PlainEncryption {
        got_init: bool,
        got_ack: bool,
    }

    impl EncryptionHandshake for PlainEncryption {
        fn to_encinit(&mut self) -> Message {
            Message::EncInit {
                public_key: [2; 33],
                cipher: 0,
            }
        }

        fn to_encack(&mut self) -> Message {
            Message::EncAck {
                public_key: [3; 33],
            }
        }

        fn encinit(&mut self, _public_key: &[u8; 33], _cipher: u8) -> Result<(), HandshakeError> {
            self.got_init = true;
            Ok(())
        }

        fn encack(&mut self, _public_key: &[u8; 33]) -> Result<(), HandshakeError> {
            self.got_ack = true;
            Ok(())
        }

        fn is_completed(&self) -> bool {
            self.got_init && self.got_ack
        }

        fn is_active(&self) -> bool {
            false
        }

        fn frame(&mut self, _command: &str, _payload: &[u8]) -> Result<Bytes, HandshakeError> {
            Err(HandshakeError::Cipher("inactive".to_string()))
        }

        fn feed(&mut self, _data: &[u8]) -> Result<Vec<RawPacket>, HandshakeError> {
            Ok(Vec::new())
        }

        fn take_rekey(&mut self) -> Option<Message> {
            None
        }
    }

    /// Outbound auth that has no key on file for the peer
    struct NoIdentity;

    impl AuthHandshake for NoIdentity {
        fn is_outbound(&self) -> bool {
            true
        }

        fn has_peer_identity(&self) -> bool {
            false
        }

        fn to_challenge(&mut self) -> Message {
            Message::AuthChallenge([0; 32])
        }

        fn challenge(&mut self, _hash: &Hash256) -> Result<[u8; 64], HandshakeError> {
            Err(HandshakeError::UnknownIdentity)
        }

        fn reply(&mut self, _signature: &[u8; 64]) -> Result<Option<Hash256>, HandshakeError> {
            Ok(None)
        }

        fn propose(&mut self, hash: &Hash256) -> Result<Hash256, HandshakeError> {
            Ok(*hash)
        }

        fn is_completed(&self) -> bool {
            false
        }

        fn is_authenticated(&self) -> bool {
            false
        }
    }

    struct HandshakeContext {
        inner: StaticContext,
        auth: bool,
    }

    impl PoolContext for HandshakeContext {
        fn height(&self) -> u32 {
            self.inner.height()
        }

        fn is_synced(&self) -> bool {
            self.inner.is_synced()
        }

        fn has_witness(&self) -> bool {
            self.inner.has_witness()
        }

        fn create_nonce(&self, addr: &SocketAddr) -> u64 {
            self.inner.create_nonce(addr)
        }

        fn has_nonce(&self, nonce: u64) -> bool {
            self.inner.has_nonce(nonce)
        }

        fn fee_rate(&self, hash: &Hash256) -> Option<i64> {
            self.inner.fee_rate(hash)
        }

        fn mempool(&self) -> Option<Vec<Arc<Transaction>>> {
            self.inner.mempool()
        }

        fn get_block(&self, hash: &Hash256) -> Option<(Arc<Block>, u32)> {
            self.inner.get_block(hash)
        }

        fn create_encryption(&self, _outbound: bool) -> Option<Box<dyn EncryptionHandshake>> {
            Some(Box::new(PlainEncryption::default()))
        }

        fn create_auth(&self, _outbound: bool) -> Option<Box<dyn AuthHandshake>> {
            if self.auth {
                Some(Box::new(NoIdentity))
            } else {
                None
            }
        }
    }

    fn handshake_peer(auth: bool) -> (Peer, mpsc::UnboundedReceiver<Bytes>) {
        let ctx = Arc::new(HandshakeContext {
            inner: StaticContext::default(),
            auth,
        });
        let mut peer = Peer::new(2, addr(), true, Arc::new(PeerConfig::default()), ctx);
        let (conn, rx) = Connection::channel(1 << 20);
        peer.on_connect(conn);
        (peer, rx)
    }

    #[tokio::test]
    async fn test_encryption_handshake() {
        let (mut peer, mut rx) = handshake_peer(false);
        let (tx, _wait) = oneshot::channel();
        peer.open(tx);
        assert_eq!(peer.state(), PeerState::EncryptionHandshake);
        assert!(matches!(sent(&mut rx)[..], [Message::EncInit { .. }]));

        peer.handle_message(Message::EncInit {
            public_key: [5; 33],
            cipher: 0,
        });
        assert!(matches!(sent(&mut rx)[..], [Message::EncAck { .. }]));
        assert_eq!(peer.state(), PeerState::EncryptionHandshake);

        peer.handle_message(Message::EncAck { public_key: [6; 33] });
        assert_eq!(peer.state(), PeerState::VersionHandshake);
        assert!(matches!(sent(&mut rx)[..], [Message::Version(_)]));
        assert!(peer.info().encrypted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_encryption_timeout_is_tolerated() {
        let (mut peer, mut rx) = handshake_peer(false);
        let (tx, _wait) = oneshot::channel();
        peer.open(tx);
        sent(&mut rx);

        tokio::time::advance(HANDSHAKE_TIMEOUT).await;
        peer.advance();
        assert_eq!(peer.state(), PeerState::VersionHandshake);
        assert!(matches!(sent(&mut rx)[..], [Message::Version(_)]));
        assert!(!peer.info().encrypted);
    }

    #[tokio::test]
    async fn test_auth_without_identity() {
        let (mut peer, _rx) = handshake_peer(true);
        let (tx, mut wait) = oneshot::channel();
        peer.open(tx);

        peer.handle_message(Message::EncInit {
            public_key: [5; 33],
            cipher: 0,
        });
        peer.handle_message(Message::EncAck { public_key: [6; 33] });

        assert!(peer.is_destroyed());
        assert!(matches!(wait.try_recv().unwrap(), Err(PeerError::Handshake(_))));
    }
}
