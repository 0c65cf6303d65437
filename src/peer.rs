//! # Peer Records
//!
//! A [`PeerInfo`] is the unit both tables store: the peer's identifier, its
//! verified public key, the endpoint pair the transport reaches it on, the
//! derived bucket index relative to the table owner, and connection
//! metadata. The [`PeerInfo::sentinel`] record (zero id, no key) is what
//! closeness queries return when no peer qualifies.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};

use crate::id::NodeId;

/// The local/external address pair a peer is reachable on.
///
/// For peers behind a NAT the two differ; the external address is the one
/// handed to the transport for sends.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointPair {
    pub local: SocketAddr,
    pub external: SocketAddr,
}

impl EndpointPair {
    pub fn new(local: SocketAddr, external: SocketAddr) -> Self {
        Self { local, external }
    }

    /// Both addresses set to the same endpoint (directly reachable peer).
    pub fn symmetric(addr: SocketAddr) -> Self {
        Self {
            local: addr,
            external: addr,
        }
    }

    pub fn unspecified() -> Self {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
        Self {
            local: addr,
            external: addr,
        }
    }

    pub fn is_unspecified(&self) -> bool {
        self.external.ip().is_unspecified() && self.external.port() == 0
    }
}

impl Default for EndpointPair {
    fn default() -> Self {
        Self::unspecified()
    }
}

/// NAT classification reported by the transport at bootstrap.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NatType {
    #[default]
    Unknown,
    /// Port-preserving NAT or none; peer endpoints are predictable.
    NonSymmetric,
    /// Per-destination port mapping; rendezvous is required for inbound.
    Symmetric,
}

/// Lifecycle of a transport connection to a peer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    /// Connection requested, identity not yet confirmed against its key.
    #[default]
    PendingValidation,
    Connected,
    Disconnecting,
}

/// A peer as held by the routing and client tables.
#[derive(Clone, Debug)]
pub struct PeerInfo {
    pub id: NodeId,
    /// Verified key material, supplied through the key-request callback.
    /// Admission requires it to be present.
    pub public_key: Option<VerifyingKey>,
    pub endpoint_pair: EndpointPair,
    /// Shared prefix length with the table owner's id. Derived; the table
    /// recomputes it on insertion so it is never stale.
    pub bucket_index: u32,
    pub connection_state: ConnectionState,
    pub nat_type: NatType,
    /// The peer's own reported close neighbourhood, used to build the
    /// group matrix.
    pub dimension_list: Vec<NodeId>,
}

impl PeerInfo {
    pub fn new(id: NodeId, public_key: VerifyingKey) -> Self {
        Self {
            id,
            public_key: Some(public_key),
            endpoint_pair: EndpointPair::unspecified(),
            bucket_index: 0,
            connection_state: ConnectionState::PendingValidation,
            nat_type: NatType::Unknown,
            dimension_list: Vec::new(),
        }
    }

    /// The "no such peer" record returned by empty-handed lookups.
    pub fn sentinel() -> Self {
        Self {
            id: NodeId::ZERO,
            public_key: None,
            endpoint_pair: EndpointPair::unspecified(),
            bucket_index: 0,
            connection_state: ConnectionState::PendingValidation,
            nat_type: NatType::Unknown,
            dimension_list: Vec::new(),
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.id.is_zero()
    }

    pub fn with_endpoints(mut self, endpoints: EndpointPair) -> Self {
        self.endpoint_pair = endpoints;
        self
    }

    pub fn with_state(mut self, state: ConnectionState) -> Self {
        self.connection_state = state;
        self
    }

    /// The address sends to this peer go to.
    pub fn send_endpoint(&self) -> SocketAddr {
        self.endpoint_pair.external
    }
}

impl Default for PeerInfo {
    fn default() -> Self {
        Self::sentinel()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;

    fn test_key(seed: u8) -> VerifyingKey {
        SigningKey::from_bytes(&[seed; 32]).verifying_key()
    }

    #[test]
    fn sentinel_has_zero_id_and_no_key() {
        let peer = PeerInfo::sentinel();
        assert!(peer.is_sentinel());
        assert!(peer.public_key.is_none());
        assert!(peer.endpoint_pair.is_unspecified());
    }

    #[test]
    fn constructed_peer_is_not_sentinel() {
        let peer = PeerInfo::new(NodeId::random(), test_key(7));
        assert!(!peer.is_sentinel());
        assert_eq!(peer.connection_state, ConnectionState::PendingValidation);
    }

    #[test]
    fn send_endpoint_is_external() {
        let local: SocketAddr = "192.168.0.2:5000".parse().unwrap();
        let external: SocketAddr = "203.0.113.9:5483".parse().unwrap();
        let peer = PeerInfo::new(NodeId::random(), test_key(1))
            .with_endpoints(EndpointPair::new(local, external));
        assert_eq!(peer.send_endpoint(), external);
    }
}
