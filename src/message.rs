//! # Wire Envelope
//!
//! The routing core exchanges one envelope type, [`Message`], over the
//! transport. Encoding is bincode with a hard size limit on decode; the
//! framing below the envelope belongs to the transport.
//!
//! ## Envelope Fields
//!
//! | Field | Meaning |
//! |-------|---------|
//! | `source` / `destination` | 512-bit overlay ids; zero source = not yet joined |
//! | `group` | Destination names a group, not a single node |
//! | `source_group` | Sender claims to speak for a group |
//! | `relay_endpoint` | Reply address for messages from un-joined senders |
//! | `route_history` | Ids that already forwarded this message (loop guard) |
//! | `kind` / `direction` | Protocol verb and request/response side |
//! | `response_id` | Correlates a response with the sender's pending entry |
//! | `cacheable` | Content is eligible for the opportunistic cache |
//!
//! The four addressing variants (single→single, single→group,
//! group→single, group→group) are derived from the two group flags by
//! [`Message::variant`]; the per-variant send entry points on the facade
//! are thin validators over one common routine.

use std::net::SocketAddr;

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::id::NodeId;
use crate::peer::{EndpointPair, NatType};

/// Largest payload accepted in one envelope (1 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Decode limit: payload plus envelope overhead. Guards against
/// memory-exhaustion from hostile length prefixes.
pub const MAX_WIRE_SIZE: u64 = (MAX_PAYLOAD_SIZE as u64) + 8 * 1024;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_WIRE_SIZE)
        .with_fixint_encoding()
}

/// Decode with the size bound enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

/// Protocol verb carried by an envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// Liveness probe.
    Ping,
    /// Connection/admission handshake between two nodes.
    Connect,
    /// Request for the receiver's closest known peers to a target.
    FindNodes,
    /// Request for the members of a target id's group.
    GetGroup,
    /// Application-level payload delivered to the upper layer.
    Data,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Request,
    Response,
}

/// Addressing shape of an envelope, derived from its two group flags.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageVariant {
    SingleToSingle,
    SingleToGroup,
    GroupToSingle,
    GroupToGroup,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub source: NodeId,
    pub destination: NodeId,
    pub group: bool,
    pub source_group: bool,
    pub relay_endpoint: Option<SocketAddr>,
    pub route_history: Vec<NodeId>,
    pub kind: MessageKind,
    pub payload: Vec<u8>,
    pub cacheable: bool,
    pub response_id: Option<u64>,
    pub hop_count: u32,
    pub signature: Option<Vec<u8>>,
    pub direction: Direction,
}

impl Message {
    pub fn request(kind: MessageKind, source: NodeId, destination: NodeId) -> Self {
        Self {
            source,
            destination,
            group: false,
            source_group: false,
            relay_endpoint: None,
            route_history: Vec::new(),
            kind,
            payload: Vec::new(),
            cacheable: false,
            response_id: None,
            hop_count: 0,
            signature: None,
            direction: Direction::Request,
        }
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_group_destination(mut self) -> Self {
        self.group = true;
        self
    }

    pub fn with_cacheable(mut self, cacheable: bool) -> Self {
        self.cacheable = cacheable;
        self
    }

    pub fn with_response_id(mut self, response_id: u64) -> Self {
        self.response_id = Some(response_id);
        self
    }

    #[inline]
    pub fn is_request(&self) -> bool {
        self.direction == Direction::Request
    }

    #[inline]
    pub fn is_response(&self) -> bool {
        self.direction == Direction::Response
    }

    pub fn variant(&self) -> MessageVariant {
        match (self.source_group, self.group) {
            (false, false) => MessageVariant::SingleToSingle,
            (false, true) => MessageVariant::SingleToGroup,
            (true, false) => MessageVariant::GroupToSingle,
            (true, true) => MessageVariant::GroupToGroup,
        }
    }

    /// True iff `id` already forwarded this message.
    pub fn seen(&self, id: &NodeId) -> bool {
        self.route_history.contains(id)
    }

    /// Record `id` as a forwarder, dropping oldest entries beyond `cap`.
    pub fn push_route_history(&mut self, id: NodeId, cap: usize) {
        if self.route_history.last() == Some(&id) {
            return;
        }
        self.route_history.push(id);
        if self.route_history.len() > cap {
            let excess = self.route_history.len() - cap;
            self.route_history.drain(..excess);
        }
        self.hop_count = self.hop_count.saturating_add(1);
    }

    /// Build the response envelope for this request.
    ///
    /// Source and destination swap, the hop record resets, and the
    /// correlation id and cache flag carry over. Replies to un-joined
    /// senders keep the relay endpoint so the forwarder can short-circuit
    /// table routing.
    pub fn to_response(&self, responder: NodeId, payload: Vec<u8>) -> Message {
        Message {
            source: responder,
            destination: self.source,
            group: false,
            source_group: self.group,
            relay_endpoint: self.relay_endpoint,
            route_history: Vec::new(),
            kind: self.kind,
            payload,
            cacheable: self.cacheable,
            response_id: self.response_id,
            hop_count: 0,
            signature: None,
            direction: Direction::Response,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Message, bincode::Error> {
        deserialize_bounded(bytes)
    }
}

// ============================================================================
// Protocol payloads
// ============================================================================

/// Body of a `FindNodes` request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FindNodesRequest {
    pub target: NodeId,
    pub count: usize,
}

/// Body of a `FindNodes` response: the responder's closest known peers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FindNodesResponse {
    pub nodes: Vec<(NodeId, SocketAddr)>,
}

/// Body of a `Connect` request: who is asking and how to reach them.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub requester: NodeId,
    pub endpoints: EndpointPair,
    pub nat_type: NatType,
    /// Requester's close neighbourhood, seeding the receiver's group matrix.
    pub dimension_list: Vec<NodeId>,
    /// Attach as a terminal client instead of a routing peer.
    pub client: bool,
}

/// Body of a `Connect` response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectResponse {
    pub accepted: bool,
    pub responder: NodeId,
    pub endpoints: EndpointPair,
    pub dimension_list: Vec<NodeId>,
}

/// Body of a `GetGroup` response: one group member answering for itself.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetGroupResponse {
    pub member: NodeId,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_id(seed: u8) -> NodeId {
        let mut bytes = [0u8; crate::id::ID_LEN];
        bytes[0] = seed;
        bytes[crate::id::ID_LEN - 1] = 1;
        NodeId::from_bytes(bytes)
    }

    #[test]
    fn envelope_round_trip() {
        let msg = Message::request(MessageKind::Data, make_id(1), make_id(2))
            .with_payload(b"hello".to_vec())
            .with_cacheable(true)
            .with_response_id(42);
        let bytes = msg.encode().unwrap();
        let decoded = Message::decode(&bytes).unwrap();
        assert_eq!(decoded.source, msg.source);
        assert_eq!(decoded.destination, msg.destination);
        assert_eq!(decoded.payload, b"hello");
        assert_eq!(decoded.response_id, Some(42));
        assert!(decoded.cacheable);
    }

    #[test]
    fn malformed_bytes_rejected() {
        assert!(Message::decode(&[0xFF, 0xFE, 0xFD]).is_err());
        let msg = Message::request(MessageKind::Ping, make_id(1), make_id(2));
        let bytes = msg.encode().unwrap();
        assert!(Message::decode(&bytes[..bytes.len() / 2]).is_err());
    }

    #[test]
    fn variant_classification() {
        let mut msg = Message::request(MessageKind::Data, make_id(1), make_id(2));
        assert_eq!(msg.variant(), MessageVariant::SingleToSingle);
        msg.group = true;
        assert_eq!(msg.variant(), MessageVariant::SingleToGroup);
        msg.source_group = true;
        assert_eq!(msg.variant(), MessageVariant::GroupToGroup);
        msg.group = false;
        assert_eq!(msg.variant(), MessageVariant::GroupToSingle);
    }

    #[test]
    fn route_history_caps_and_counts_hops() {
        let mut msg = Message::request(MessageKind::Data, make_id(1), make_id(2));
        for i in 0..10u8 {
            msg.push_route_history(make_id(i + 10), 4);
        }
        assert_eq!(msg.route_history.len(), 4);
        assert_eq!(msg.hop_count, 10);
        // Oldest entries were dropped, newest kept.
        assert!(msg.seen(&make_id(19)));
        assert!(!msg.seen(&make_id(10)));
    }

    #[test]
    fn route_history_skips_consecutive_duplicate() {
        let mut msg = Message::request(MessageKind::Data, make_id(1), make_id(2));
        msg.push_route_history(make_id(3), 8);
        msg.push_route_history(make_id(3), 8);
        assert_eq!(msg.route_history.len(), 1);
    }

    #[test]
    fn response_swaps_endpoints_and_keeps_correlation() {
        let mut req = Message::request(MessageKind::Data, make_id(1), make_id(2))
            .with_cacheable(true)
            .with_response_id(7);
        req.push_route_history(make_id(5), 8);
        let resp = req.to_response(make_id(2), b"reply".to_vec());
        assert!(resp.is_response());
        assert_eq!(resp.source, make_id(2));
        assert_eq!(resp.destination, make_id(1));
        assert_eq!(resp.response_id, Some(7));
        assert!(resp.cacheable);
        assert!(resp.route_history.is_empty());
    }

    #[test]
    fn payload_structs_round_trip() {
        let req = FindNodesRequest {
            target: make_id(9),
            count: 8,
        };
        let bytes = serialize(&req).unwrap();
        let decoded: FindNodesRequest = deserialize_bounded(&bytes).unwrap();
        assert_eq!(decoded.target, make_id(9));
        assert_eq!(decoded.count, 8);

        let resp = FindNodesResponse {
            nodes: vec![(make_id(1), "10.0.0.1:5483".parse().unwrap())],
        };
        let bytes = serialize(&resp).unwrap();
        let decoded: FindNodesResponse = deserialize_bounded(&bytes).unwrap();
        assert_eq!(decoded.nodes.len(), 1);
    }
}
