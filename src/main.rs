//! Mini-P2P CLI Application
//!
//! Opens sessions to Bitcoin peers and prints what they say.

use clap::{Parser, Subcommand};
use mini_p2p::crypto::hash_to_hex;
use mini_p2p::network::{
    Message, PeerConfig, PeerEvent, PeerHandle, PoolContext, Server, ServiceFlags, Session,
    StaticContext,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "mini-p2p")]
#[command(version)]
#[command(about = "A Bitcoin P2P session engine in Rust", long_about = None)]
struct Cli {
    /// JSON session configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to a peer and log its messages
    Connect {
        /// Peer address (host:port)
        addr: SocketAddr,

        /// Chain height we claim
        #[arg(long, default_value = "0")]
        height: u32,
    },

    /// Accept inbound peers
    Listen {
        /// Port to listen on (defaults to the network port)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Write the default configuration to a file
    InitConfig {
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => PeerConfig::load(path)?,
        None => PeerConfig::default(),
    };

    if let Commands::InitConfig { output } = &cli.command {
        config.save(output)?;
        println!("✅ Wrote configuration to {}", output.display());
        return Ok(());
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        match cli.command {
            Commands::Connect { addr, height } => connect(config, addr, height).await,
            Commands::Listen { port } => listen(config, port).await,
            Commands::InitConfig { .. } => Ok(()),
        }
    })
}

fn context(config: &PeerConfig, height: u32) -> Arc<dyn PoolContext> {
    let witness = config.services.contains(ServiceFlags::WITNESS);
    Arc::new(StaticContext::new(height, false, witness))
}

async fn connect(
    config: PeerConfig,
    addr: SocketAddr,
    height: u32,
) -> Result<(), Box<dyn std::error::Error>> {
    let ctx = context(&config, height);
    println!("🌐 Connecting to {}...", addr);

    let (handle, events) = Session::connect(1, addr, Arc::new(config), ctx);

    let ctrl_c = handle.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        println!("\n📴 Disconnecting...");
        let _ = ctrl_c.destroy().await;
    });

    drive(handle, events).await;
    Ok(())
}

async fn listen(config: PeerConfig, port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let port = port.unwrap_or_else(|| config.network.default_port());
    let ctx = context(&config, 0);
    let config = Arc::new(config);
    let server = Server::bind(port).await?;
    println!("🌐 Listening on port {}...", server.port());

    let mut next_id = 1;
    loop {
        tokio::select! {
            accepted = server.accept_session(next_id, config.clone(), ctx.clone()) => {
                match accepted {
                    Ok((handle, events)) => {
                        next_id += 1;
                        tokio::spawn(drive(handle, events));
                    }
                    Err(e) => log::error!("Accept error: {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\n📴 Shutting down...");
                return Ok(());
            }
        }
    }
}

/// Open the session and print its events until it closes
async fn drive(handle: PeerHandle, mut events: mpsc::Receiver<PeerEvent>) {
    let opener = handle.clone();
    tokio::spawn(async move {
        if let Err(e) = opener.open().await {
            log::warn!("Peer {} failed to open: {}", opener.addr, e);
        }
    });

    while let Some(event) = events.recv().await {
        match event {
            PeerEvent::Connect => println!("🔌 [{}] connected", handle.addr),
            PeerEvent::Open => {
                if let Ok(info) = handle.info().await {
                    println!(
                        "🤝 [{}] ready: version={} agent={} height={}",
                        handle.addr,
                        info.version.unwrap_or(0),
                        info.agent,
                        info.height
                    );
                }
                let _ = handle.send(Message::GetAddr).await;
            }
            PeerEvent::Message(msg) => println!("📨 [{}] {}", handle.addr, describe(&msg)),
            PeerEvent::Error(e) => println!("⚠️  [{}] {}", handle.addr, e),
            PeerEvent::Ban => println!("🚫 [{}] ban threshold reached", handle.addr),
            PeerEvent::Close { connected } => {
                println!("📴 [{}] closed (connected={})", handle.addr, connected);
                break;
            }
        }
    }
}

fn describe(msg: &Message) -> String {
    match msg {
        Message::Inv(items) => format!("inv ({} items)", items.len()),
        Message::Addr(addrs) => format!("addr ({} addresses)", addrs.len()),
        Message::Headers(headers) => format!("headers ({})", headers.len()),
        Message::Block { block, .. } => format!("block {}", hash_to_hex(&block.hash())),
        Message::Tx { tx, .. } => format!("tx {}", hash_to_hex(&tx.hash())),
        Message::Reject(reject) => format!("reject {} ({})", reject.message, reject.reason),
        other => other.name().to_string(),
    }
}
