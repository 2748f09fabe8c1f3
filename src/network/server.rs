//! TCP listener for inbound peers
//!
//! Accepts sockets and hands each one to a new [`Session`].

use crate::network::config::PeerConfig;
use crate::network::context::PoolContext;
use crate::network::peer::PeerEvent;
use crate::network::session::{PeerHandle, Session};
use crate::network::transport::BoxedStream;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// TCP server for accepting peer connections
pub struct Server {
    listener: TcpListener,
    port: u16,
}

impl Server {
    /// Bind to a port on all interfaces; port 0 picks a free one
    pub async fn bind(port: u16) -> Result<Self, std::io::Error> {
        let addr = format!("0.0.0.0:{}", port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();
        log::info!("Server listening on 0.0.0.0:{}", port);

        Ok(Self { listener, port })
    }

    /// Get the listening port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Accept the next raw connection
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), std::io::Error> {
        let (stream, addr) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok((stream, addr))
    }

    /// Accept the next connection and start an inbound session on it
    pub async fn accept_session(
        &self,
        id: u64,
        config: Arc<PeerConfig>,
        ctx: Arc<dyn PoolContext>,
    ) -> Result<(PeerHandle, mpsc::Receiver<PeerEvent>), std::io::Error> {
        let (stream, addr) = self.accept().await?;
        log::info!("Incoming connection from {}", addr);
        Ok(Session::accept(id, addr, Box::new(stream) as BoxedStream, config, ctx))
    }
}
