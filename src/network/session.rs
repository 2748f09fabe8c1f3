//! Session driver
//!
//! One tokio task per peer owns the [`Peer`] state machine. Everything that
//! touches the peer arrives through a single `select!` loop: commands from
//! the pool, bytes from the socket, writer notifications and timers. The
//! pool talks to the task through a cloneable [`PeerHandle`] and hears back
//! on an event channel.

use crate::core::{Block, Transaction};
use crate::crypto::Hash256;
use crate::network::config::PeerConfig;
use crate::network::context::PoolContext;
use crate::network::error::PeerError;
use crate::network::message::{Command, Message, NetAddress, RejectCode};
use crate::network::peer::{OpenWaiter, Peer, PeerEvent, PeerInfo};
use crate::network::pending::ResponseWaiter;
use crate::network::stall::STALL_INTERVAL;
use crate::network::transport::{BoxedStream, Connection, WriterEvent};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant};

/// Time allowed for an outbound socket to connect
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Keepalive ping interval
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How often queued inventory is flushed
pub const INV_INTERVAL: Duration = Duration::from_secs(5);

const COMMAND_CAPACITY: usize = 64;
const READ_BUFFER: usize = 64 * 1024;

type DrainReply = oneshot::Sender<Option<oneshot::Receiver<Result<(), PeerError>>>>;

/// Requests from the pool to a session task
#[derive(Debug)]
pub enum PeerCommand {
    Open(OpenWaiter),
    Send(Message),
    AnnounceBlock(Vec<Arc<Block>>),
    AnnounceTx(Vec<Arc<Transaction>>),
    AnnounceAddr(Vec<NetAddress>),
    GetBlock(Vec<Hash256>),
    GetTx(Vec<Hash256>),
    GetFullBlock(Hash256),
    GetBlocks {
        locator: Vec<Hash256>,
        stop: Hash256,
    },
    GetHeaders {
        locator: Vec<Hash256>,
        stop: Hash256,
    },
    Wait {
        cmd: Command,
        timeout: Duration,
        waiter: ResponseWaiter,
    },
    Drain(DrainReply),
    Reject {
        code: RejectCode,
        reason: String,
        item: Option<(Command, Hash256)>,
    },
    IncreaseBan {
        score: u32,
        reply: oneshot::Sender<bool>,
    },
    SetLoader(bool),
    Info(oneshot::Sender<PeerInfo>),
    Destroy,
}

/// Cloneable handle to a running session
#[derive(Debug, Clone)]
pub struct PeerHandle {
    pub id: u64,
    pub addr: SocketAddr,
    tx: mpsc::Sender<PeerCommand>,
}

impl PeerHandle {
    async fn command(&self, cmd: PeerCommand) -> Result<(), PeerError> {
        self.tx.send(cmd).await.map_err(|_| PeerError::ChannelClosed)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> PeerCommand,
    ) -> Result<T, PeerError> {
        let (tx, rx) = oneshot::channel();
        self.command(make(tx)).await?;
        rx.await.map_err(|_| PeerError::ChannelClosed)
    }

    /// Run the handshake; resolves once the session is ready
    pub async fn open(&self) -> Result<(), PeerError> {
        self.request(PeerCommand::Open).await?
    }

    pub async fn send(&self, msg: Message) -> Result<(), PeerError> {
        self.command(PeerCommand::Send(msg)).await
    }

    pub async fn announce_block(&self, blocks: Vec<Arc<Block>>) -> Result<(), PeerError> {
        self.command(PeerCommand::AnnounceBlock(blocks)).await
    }

    pub async fn announce_tx(&self, txs: Vec<Arc<Transaction>>) -> Result<(), PeerError> {
        self.command(PeerCommand::AnnounceTx(txs)).await
    }

    pub async fn announce_addr(&self, addrs: Vec<NetAddress>) -> Result<(), PeerError> {
        self.command(PeerCommand::AnnounceAddr(addrs)).await
    }

    pub async fn get_block(&self, hashes: Vec<Hash256>) -> Result<(), PeerError> {
        self.command(PeerCommand::GetBlock(hashes)).await
    }

    pub async fn get_tx(&self, hashes: Vec<Hash256>) -> Result<(), PeerError> {
        self.command(PeerCommand::GetTx(hashes)).await
    }

    pub async fn get_full_block(&self, hash: Hash256) -> Result<(), PeerError> {
        self.command(PeerCommand::GetFullBlock(hash)).await
    }

    pub async fn get_blocks(&self, locator: Vec<Hash256>, stop: Hash256) -> Result<(), PeerError> {
        self.command(PeerCommand::GetBlocks { locator, stop }).await
    }

    pub async fn get_headers(&self, locator: Vec<Hash256>, stop: Hash256) -> Result<(), PeerError> {
        self.command(PeerCommand::GetHeaders { locator, stop }).await
    }

    /// Resolve with the next `cmd` the peer sends
    pub async fn wait(&self, cmd: Command, timeout: Duration) -> Result<Message, PeerError> {
        self.request(|waiter| PeerCommand::Wait {
            cmd,
            timeout,
            waiter,
        })
        .await?
    }

    /// Resolve once buffered writes have flushed
    pub async fn drain(&self) -> Result<(), PeerError> {
        match self.request(PeerCommand::Drain).await? {
            Some(rx) => rx.await.map_err(|_| PeerError::ChannelClosed)?,
            None => Ok(()),
        }
    }

    pub async fn send_reject(
        &self,
        code: RejectCode,
        reason: &str,
        item: Option<(Command, Hash256)>,
    ) -> Result<(), PeerError> {
        self.command(PeerCommand::Reject {
            code,
            reason: reason.to_string(),
            item,
        })
        .await
    }

    /// Returns true if the peer is now at or over the ban threshold
    pub async fn increase_ban(&self, score: u32) -> Result<bool, PeerError> {
        self.request(|reply| PeerCommand::IncreaseBan { score, reply })
            .await
    }

    pub async fn set_loader(&self, loader: bool) -> Result<(), PeerError> {
        self.command(PeerCommand::SetLoader(loader)).await
    }

    pub async fn info(&self) -> Result<PeerInfo, PeerError> {
        self.request(PeerCommand::Info).await
    }

    pub async fn destroy(&self) -> Result<(), PeerError> {
        self.command(PeerCommand::Destroy).await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// The task side of a session
pub struct Session {
    peer: Peer,
    ctx: Arc<dyn PoolContext>,
    commands: mpsc::Receiver<PeerCommand>,
    events: mpsc::Sender<PeerEvent>,
}

impl Session {
    fn new(
        id: u64,
        addr: SocketAddr,
        outbound: bool,
        config: Arc<PeerConfig>,
        ctx: Arc<dyn PoolContext>,
    ) -> (PeerHandle, Self, mpsc::Receiver<PeerEvent>) {
        let (tx, commands) = mpsc::channel(COMMAND_CAPACITY);
        let (events, events_rx) = mpsc::channel(config.event_capacity.max(1));
        let peer = Peer::new(id, addr, outbound, config, ctx.clone());
        let handle = PeerHandle { id, addr, tx };
        let session = Self {
            peer,
            ctx,
            commands,
            events,
        };
        (handle, session, events_rx)
    }

    /// Dial `addr` and drive the session in a new task
    pub fn connect(
        id: u64,
        addr: SocketAddr,
        config: Arc<PeerConfig>,
        ctx: Arc<dyn PoolContext>,
    ) -> (PeerHandle, mpsc::Receiver<PeerEvent>) {
        let (handle, mut session, events) = Self::new(id, addr, true, config, ctx);
        tokio::spawn(async move {
            session.peer.connecting();
            log::info!("{}: connecting", session.peer.hostname());
            if let Some(stream) = session.establish().await {
                session.run(stream).await;
            }
            session.finish().await;
        });
        (handle, events)
    }

    /// Drive an accepted inbound stream in a new task
    pub fn accept(
        id: u64,
        addr: SocketAddr,
        stream: BoxedStream,
        config: Arc<PeerConfig>,
        ctx: Arc<dyn PoolContext>,
    ) -> (PeerHandle, mpsc::Receiver<PeerEvent>) {
        let (handle, mut session, events) = Self::new(id, addr, false, config, ctx);
        tokio::spawn(async move {
            session.run(stream).await;
            session.finish().await;
        });
        (handle, events)
    }

    /// Open the outbound socket, still serving commands meanwhile
    async fn establish(&mut self) -> Option<BoxedStream> {
        let connect = time::timeout(
            CONNECT_TIMEOUT,
            self.ctx.create_connection(self.peer.addr()),
        );
        tokio::pin!(connect);

        loop {
            tokio::select! {
                result = &mut connect => {
                    match result {
                        Ok(Ok(stream)) => return Some(stream),
                        Ok(Err(e)) => self.peer.fail(e.into()),
                        Err(_) => self.peer.fail(PeerError::ConnectTimeout),
                    }
                    return None;
                }
                cmd = self.commands.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd),
                        None => self.peer.destroy(),
                    }
                    self.flush_events().await;
                    if self.peer.is_destroyed() {
                        return None;
                    }
                }
            }
        }
    }

    async fn run(&mut self, stream: BoxedStream) {
        let (mut reader, writer) = tokio::io::split(stream);
        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel();
        let (conn, _writer) = Connection::spawn(writer, self.peer.config.high_water, writer_tx);
        self.peer.on_connect(conn);
        self.flush_events().await;

        let start = Instant::now();
        let mut stall = time::interval_at(start + STALL_INTERVAL, STALL_INTERVAL);
        let mut ping = time::interval_at(start + PING_INTERVAL, PING_INTERVAL);
        let mut inv = time::interval_at(start + INV_INTERVAL, INV_INTERVAL);
        let mut buf = vec![0u8; READ_BUFFER];

        while !self.peer.is_destroyed() {
            let deadline = self.peer.handshake_deadline();
            let ready = self.peer.is_ready();

            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => {
                        log::debug!("{}: handle dropped", self.peer.hostname());
                        self.peer.destroy();
                    }
                },
                result = reader.read(&mut buf) => match result {
                    Ok(0) => self.peer.fail(PeerError::Hangup),
                    Ok(n) => self.peer.feed(&buf[..n]),
                    Err(e) => self.peer.fail(e.into()),
                },
                Some(event) = writer_rx.recv() => match event {
                    WriterEvent::Drained => self.peer.drained(),
                    WriterEvent::Failed(e) => self.peer.fail(PeerError::ConnectionFailed(e)),
                },
                _ = stall.tick() => {
                    self.peer.check_stall(Instant::now());
                }
                _ = ping.tick(), if ready => self.peer.send_ping(),
                _ = inv.tick(), if ready => self.peer.flush_inv(),
                _ = time::sleep_until(deadline.unwrap_or(start)), if deadline.is_some() => {
                    self.peer.advance();
                }
            }

            self.flush_events().await;
        }
    }

    /// Reject whatever is still queued, then deliver the last events
    async fn finish(&mut self) {
        self.peer.destroy();
        self.commands.close();
        while let Ok(cmd) = self.commands.try_recv() {
            self.handle_command(cmd);
        }
        self.flush_events().await;
    }

    async fn flush_events(&mut self) {
        while let Some(event) = self.peer.next_event() {
            if self.events.send(event).await.is_err() {
                // Nobody is listening; the pool has forgotten us
                self.peer.destroy();
            }
        }
    }

    fn handle_command(&mut self, cmd: PeerCommand) {
        let peer = &mut self.peer;
        match cmd {
            PeerCommand::Open(waiter) => peer.open(waiter),
            PeerCommand::Send(msg) => peer.send(msg),
            PeerCommand::AnnounceBlock(blocks) => peer.announce_block(&blocks),
            PeerCommand::AnnounceTx(txs) => peer.announce_tx(&txs),
            PeerCommand::AnnounceAddr(addrs) => peer.announce_addr(&addrs),
            PeerCommand::GetBlock(hashes) => peer.get_block(&hashes),
            PeerCommand::GetTx(hashes) => peer.get_tx(&hashes),
            PeerCommand::GetFullBlock(hash) => peer.get_full_block(hash),
            PeerCommand::GetBlocks { locator, stop } => peer.get_blocks(locator, stop),
            PeerCommand::GetHeaders { locator, stop } => peer.get_headers(locator, stop),
            PeerCommand::Wait {
                cmd,
                timeout,
                waiter,
            } => peer.wait(cmd, timeout, waiter),
            PeerCommand::Drain(reply) => {
                let _ = reply.send(peer.wait_drain());
            }
            PeerCommand::Reject { code, reason, item } => peer.send_reject(code, &reason, item),
            PeerCommand::IncreaseBan { score, reply } => {
                let _ = reply.send(peer.increase_ban(score));
            }
            PeerCommand::SetLoader(loader) => peer.set_loader(loader),
            PeerCommand::Info(reply) => {
                let _ = reply.send(peer.info());
            }
            PeerCommand::Destroy => peer.destroy(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::codec::{RawPacket, WireCodec};
    use crate::network::context::StaticContext;
    use crate::network::message::{ServiceFlags, VersionMessage, PROTOCOL_VERSION};
    use crate::network::peer::PeerState;
    use crate::network::stall::StallReason;
    use futures::future::BoxFuture;
    use futures::{FutureExt, SinkExt, StreamExt};
    use std::io;
    use std::sync::Mutex;
    use tokio::io::DuplexStream;
    use tokio_util::codec::Framed;

    type Remote = Framed<DuplexStream, WireCodec>;

    fn addr() -> SocketAddr {
        "10.0.0.1:8333".parse().unwrap()
    }

    fn remote(stream: DuplexStream) -> Remote {
        Framed::new(stream, WireCodec::new(PeerConfig::default().magic()))
    }

    async fn say(remote: &mut Remote, msg: Message) {
        remote
            .send(RawPacket::new(msg.name().to_string(), msg.encode_payload()))
            .await
            .unwrap();
    }

    async fn hear(remote: &mut Remote) -> Message {
        let packet = remote.next().await.unwrap().unwrap();
        Message::decode(&packet.command, &packet.payload).unwrap()
    }

    fn version() -> Message {
        Message::Version(VersionMessage {
            version: PROTOCOL_VERSION,
            services: ServiceFlags::NETWORK | ServiceFlags::WITNESS,
            time: 0,
            remote: NetAddress::unspecified(),
            local: NetAddress::unspecified(),
            nonce: 7,
            agent: "/remote:0.1/".to_string(),
            height: 10,
            no_relay: false,
        })
    }

    fn inbound() -> (PeerHandle, mpsc::Receiver<PeerEvent>, Remote) {
        let (local, far) = tokio::io::duplex(1 << 16);
        let (handle, events) = Session::accept(
            1,
            addr(),
            Box::new(local),
            Arc::new(PeerConfig::default()),
            Arc::new(StaticContext::new(0, true, true)),
        );
        (handle, events, remote(far))
    }

    /// Hands out one prepared stream, or never connects
    struct TestContext {
        inner: StaticContext,
        stream: Mutex<Option<DuplexStream>>,
    }

    impl PoolContext for TestContext {
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

        fn create_connection(&self, _addr: SocketAddr) -> BoxFuture<'static, io::Result<BoxedStream>> {
            match self.stream.lock().unwrap().take() {
                Some(stream) => async move { Ok::<_, io::Error>(Box::new(stream) as BoxedStream) }.boxed(),
                None => futures::future::pending::<io::Result<BoxedStream>>().boxed(),
            }
        }
    }

    fn test_context(stream: Option<DuplexStream>) -> Arc<TestContext> {
        Arc::new(TestContext {
            inner: StaticContext::new(0, true, true),
            stream: Mutex::new(stream),
        })
    }

    #[tokio::test]
    async fn test_accept_handshake() {
        let (handle, mut events, mut remote) = inbound();
        assert_eq!(events.recv().await, Some(PeerEvent::Connect));

        let opener = handle.clone();
        let open = tokio::spawn(async move { opener.open().await });

        assert!(matches!(hear(&mut remote).await, Message::Version(_)));
        say(&mut remote, version()).await;
        assert_eq!(hear(&mut remote).await, Message::Verack);
        say(&mut remote, Message::Verack).await;

        open.await.unwrap().unwrap();
        assert_eq!(events.recv().await, Some(PeerEvent::Open));

        let info = handle.info().await.unwrap();
        assert_eq!(info.state, PeerState::Ready);
        assert_eq!(info.version, Some(PROTOCOL_VERSION));
        assert!(!info.outbound);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer() {
        let (handle, mut events, _remote) = inbound();
        let start = Instant::now();
        let result = handle.open().await;
        assert!(matches!(result, Err(PeerError::HandshakeTimeout("verack"))));

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(10));
        assert!(elapsed < Duration::from_secs(21));

        assert_eq!(events.recv().await, Some(PeerEvent::Connect));
        assert!(matches!(events.recv().await, Some(PeerEvent::Error(_))));
        assert_eq!(events.recv().await, Some(PeerEvent::Close { connected: true }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let (handle, mut events) = Session::connect(
            2,
            addr(),
            Arc::new(PeerConfig::default()),
            test_context(None),
        );
        let result = handle.open().await;
        assert_eq!(result, Err(PeerError::ConnectTimeout));
        assert_eq!(events.recv().await, Some(PeerEvent::Error(PeerError::ConnectTimeout)));
        assert_eq!(events.recv().await, Some(PeerEvent::Close { connected: false }));
        assert_eq!(events.recv().await, None);
    }

    #[tokio::test]
    async fn test_outbound_connect() {
        let (local, far) = tokio::io::duplex(1 << 16);
        let (handle, mut events) = Session::connect(
            3,
            addr(),
            Arc::new(PeerConfig::default()),
            test_context(Some(local)),
        );
        let mut remote = remote(far);

        let opener = handle.clone();
        let open = tokio::spawn(async move { opener.open().await });

        assert!(matches!(hear(&mut remote).await, Message::Version(_)));
        say(&mut remote, version()).await;
        say(&mut remote, Message::Verack).await;
        assert_eq!(hear(&mut remote).await, Message::Verack);

        open.await.unwrap().unwrap();
        assert_eq!(events.recv().await, Some(PeerEvent::Connect));
        assert_eq!(events.recv().await, Some(PeerEvent::Open));
        assert!(handle.info().await.unwrap().outbound);
    }

    #[tokio::test]
    async fn test_remote_hangup() {
        let (handle, mut events, remote) = inbound();
        assert_eq!(events.recv().await, Some(PeerEvent::Connect));
        drop(remote);

        assert_eq!(events.recv().await, Some(PeerEvent::Error(PeerError::Hangup)));
        assert_eq!(events.recv().await, Some(PeerEvent::Close { connected: true }));
        assert_eq!(events.recv().await, None);
        assert!(handle.info().await.is_err());
    }

    #[tokio::test]
    async fn test_wait_through_handle() {
        let (handle, mut events, mut remote) = inbound();
        let opener = handle.clone();
        let open = tokio::spawn(async move { opener.open().await });
        hear(&mut remote).await;
        say(&mut remote, version()).await;
        say(&mut remote, Message::Verack).await;
        open.await.unwrap().unwrap();

        let (tx, wait) = oneshot::channel();
        handle
            .command(PeerCommand::Wait {
                cmd: Command::Pong,
                timeout: Duration::from_secs(5),
                waiter: tx,
            })
            .await
            .unwrap();
        // Commands run in order, so the wait is registered once this returns
        handle.info().await.unwrap();
        say(&mut remote, Message::Pong(9)).await;

        assert_eq!(wait.await.unwrap(), Ok(Message::Pong(9)));
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, PeerEvent::Error(_)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_ticker_destroys() {
        let (handle, mut events, _remote) = inbound();
        assert_eq!(events.recv().await, Some(PeerEvent::Connect));

        let start = Instant::now();
        let (tx, wait) = oneshot::channel();
        handle
            .command(PeerCommand::Wait {
                cmd: Command::Headers,
                timeout: Duration::from_secs(1),
                waiter: tx,
            })
            .await
            .unwrap();

        assert_eq!(
            events.recv().await,
            Some(PeerEvent::Error(PeerError::Stalled(StallReason::Response(
                Command::Headers
            ))))
        );
        assert!(start.elapsed() > Duration::from_secs(1));
        assert!(start.elapsed() < STALL_INTERVAL * 2);
        assert_eq!(events.recv().await, Some(PeerEvent::Close { connected: true }));
        assert_eq!(wait.await.unwrap(), Err(PeerError::Destroyed));
    }

    #[tokio::test]
    async fn test_destroy_rejects_waiters() {
        let (handle, mut events, _remote) = inbound();
        assert_eq!(events.recv().await, Some(PeerEvent::Connect));

        let (tx, wait) = oneshot::channel();
        handle
            .command(PeerCommand::Wait {
                cmd: Command::Headers,
                timeout: Duration::from_secs(60),
                waiter: tx,
            })
            .await
            .unwrap();
        handle.destroy().await.unwrap();

        assert_eq!(wait.await.unwrap(), Err(PeerError::Destroyed));
        assert_eq!(events.recv().await, Some(PeerEvent::Close { connected: true }));
    }
}
