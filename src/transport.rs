//! # Transport Contract
//!
//! The routing core never opens a socket: it consumes a reliable datagram
//! layer through this trait. Inbound traffic and connection-loss signals
//! arrive on a channel handed over at bootstrap; everything else is
//! request/response against the implementation.
//!
//! Implementations must be cheap to call concurrently; the core guarantees
//! it holds none of its own locks across any of these awaits.

use std::net::SocketAddr;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::peer::{EndpointPair, NatType};

/// Signals the transport pushes into the core.
#[derive(Debug)]
pub enum TransportEvent {
    /// A framed envelope arrived from a peer.
    Message(Vec<u8>),
    /// A managed connection dropped.
    ConnectionLost(SocketAddr),
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Connect to any of `peers`, start delivering events, and report the
    /// local endpoint pair plus observed NAT class.
    async fn bootstrap(
        &self,
        peers: &[SocketAddr],
        events: mpsc::Sender<TransportEvent>,
        local_endpoint: Option<SocketAddr>,
    ) -> Result<(EndpointPair, NatType)>;

    /// Prepare an endpoint for connecting to `peer` (rendezvous step).
    async fn get_available_endpoint(&self, peer: SocketAddr) -> Result<(EndpointPair, NatType)>;

    /// Open a managed connection, presenting `validation` bytes.
    async fn add(
        &self,
        our_endpoint: SocketAddr,
        peer_endpoint: SocketAddr,
        validation: Vec<u8>,
    ) -> Result<()>;

    /// Tear down the managed connection to `peer_endpoint`.
    async fn remove(&self, peer_endpoint: SocketAddr);

    /// Send one framed envelope. An error here is what the forwarder
    /// treats as a failed hop.
    async fn send(&self, peer_endpoint: SocketAddr, bytes: Vec<u8>) -> Result<()>;
}
