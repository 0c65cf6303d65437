//! Demo binary: spins up a small in-process overlay over a loopback
//! transport, joins every node through the first one, then exchanges
//! random direct messages while reporting network status.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use clap::Parser;
use ed25519_dalek::{SigningKey, VerifyingKey};
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use meridian::{
    EndpointPair, Functors, NatType, NodeId, Parameters, ResponseEvent, Routing, Transport,
    TransportEvent,
};

#[derive(Parser, Debug)]
#[command(name = "meridian")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of in-process nodes to start.
    #[arg(short, long, default_value = "8")]
    nodes: u16,

    /// Seconds between status reports and demo sends.
    #[arg(short, long, default_value = "5")]
    interval: u64,
}

/// Loopback switchboard: address → event line, plus the key directory
/// behind the key-request functor.
#[derive(Default)]
struct Switchboard {
    lines: Mutex<HashMap<SocketAddr, mpsc::Sender<TransportEvent>>>,
    keys: Mutex<HashMap<NodeId, VerifyingKey>>,
}

struct LoopbackTransport {
    addr: SocketAddr,
    board: Arc<Switchboard>,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn bootstrap(
        &self,
        _peers: &[SocketAddr],
        events: mpsc::Sender<TransportEvent>,
        _local: Option<SocketAddr>,
    ) -> Result<(EndpointPair, NatType)> {
        self.board.lines.lock().insert(self.addr, events);
        Ok((EndpointPair::symmetric(self.addr), NatType::NonSymmetric))
    }

    async fn get_available_endpoint(&self, _peer: SocketAddr) -> Result<(EndpointPair, NatType)> {
        Ok((EndpointPair::symmetric(self.addr), NatType::NonSymmetric))
    }

    async fn add(&self, _our: SocketAddr, peer: SocketAddr, _validation: Vec<u8>) -> Result<()> {
        if self.board.lines.lock().contains_key(&peer) {
            Ok(())
        } else {
            Err(anyhow!("no such peer {peer}"))
        }
    }

    async fn remove(&self, _peer: SocketAddr) {}

    async fn send(&self, peer: SocketAddr, bytes: Vec<u8>) -> Result<()> {
        let line = self
            .board
            .lines
            .lock()
            .get(&peer)
            .cloned()
            .ok_or_else(|| anyhow!("no line to {peer}"))?;
        line.send(TransportEvent::Message(bytes))
            .await
            .map_err(|_| anyhow!("line to {peer} closed"))
    }
}

async fn start_node(
    board: &Arc<Switchboard>,
    index: u16,
    bootstrap: Vec<SocketAddr>,
) -> Result<(Routing<LoopbackTransport>, SocketAddr)> {
    let signing = SigningKey::generate(&mut rand::rngs::OsRng);
    let id = NodeId::random();
    board.keys.lock().insert(id, signing.verifying_key());

    let addr: SocketAddr = format!("127.0.0.1:{}", 9000 + index).parse()?;
    let routing = Routing::new(
        id,
        Some(signing),
        Parameters::default(),
        LoopbackTransport {
            addr,
            board: board.clone(),
        },
        None,
    );

    let board_for_keys = board.clone();
    let label = format!("node-{index}");
    let functors = Functors {
        message_received: Some(Box::new(move |payload: Vec<u8>, reply| {
            info!(node = %label, bytes = payload.len(), "message delivered");
            if let Some(reply) = reply {
                reply(b"acknowledged".to_vec());
            }
        })),
        network_status: Some(Box::new(move |status| {
            info!(node = index, status, "network status changed");
        })),
        request_public_key: Some(Box::new(move |id, deliver| {
            deliver(board_for_keys.keys.lock().get(&id).copied());
        })),
        ..Functors::default()
    };

    routing.join(functors, bootstrap).await?;
    Ok((routing, addr))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let board = Arc::new(Switchboard::default());
    let mut nodes = Vec::new();

    let (first, seed_addr) = start_node(&board, 0, Vec::new()).await?;
    info!(id = %first.node_id(), "seed node running");
    nodes.push(first);

    for index in 1..args.nodes {
        match start_node(&board, index, vec![seed_addr]).await {
            Ok((routing, _)) => {
                info!(id = %routing.node_id(), index, "node joined");
                nodes.push(routing);
            }
            Err(e) => warn!(index, error = %e, "node failed to join"),
        }
        time::sleep(Duration::from_millis(200)).await;
    }

    let mut interval = time::interval(Duration::from_secs(args.interval));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
            _ = interval.tick() => {
                for routing in &nodes {
                    info!(
                        id = %routing.node_id(),
                        status = routing.network_status(),
                        "status"
                    );
                }
                // One random direct send per tick keeps traffic visible.
                if nodes.len() >= 2 {
                    let mut rng = rand::thread_rng();
                    let from = rng.gen_range(0..nodes.len());
                    let mut to = rng.gen_range(0..nodes.len());
                    while to == from {
                        to = rng.gen_range(0..nodes.len());
                    }
                    let destination = nodes[to].node_id();
                    let sender = nodes[from].clone();
                    tokio::spawn(async move {
                        let result = sender.send_direct(
                            destination,
                            b"demo traffic".to_vec(),
                            false,
                            Some(Box::new(|event| {
                                if let ResponseEvent::Payload(msg) = event {
                                    info!(bytes = msg.payload.len(), "demo response received");
                                }
                            })),
                        ).await;
                        if let Err(e) = result {
                            warn!(error = %e, "demo send failed");
                        }
                    });
                }
            }
        }
    }

    for routing in &nodes {
        routing.shutdown().await;
    }
    Ok(())
}
