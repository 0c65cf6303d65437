//! # Forwarder
//!
//! Turns one inbound or outbound envelope into per-hop transport sends,
//! deciding between local delivery, relay, group fan-out and client
//! hand-off against the two tables.
//!
//! ## Classification
//!
//! | # | Condition | Action |
//! |---|-----------|--------|
//! | 1 | destination is us, not group | deliver to the upper layer |
//! | 2 | destination is us, group | deliver, and copy to the remaining group members |
//! | 3 | not us, a table peer is closer | relay to the closest unvisited peer |
//! | 4 | not us, we are closest, group | as 2: we are a member |
//! | 5 | not us, we are closest, direct | hand to the attached client, else the closest peer, else unreachable |
//!
//! Two refinements to 3 and 5: lookup requests (`FindNodes`) target an
//! id rather than a node, so the closest node answers them instead of
//! reporting unreachable; and group traffic is never relayed to a node
//! whose id equals the group id, since the group for an id excludes the
//! id itself.
//!
//! Before any forward the node appends itself to the message's hop record;
//! selection always excludes everything in that record, which is what
//! keeps routes loop-free. A hop whose transport send fails is added to
//! the exclusion set and selection retries, up to
//! `max_forward_attempts`; exhaustion resolves the sender's pending
//! response with a no-route marker.
//!
//! Table locks are taken only around selection; never across a transport
//! call.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, trace, warn};

use crate::client_table::ClientTable;
use crate::config::Parameters;
use crate::error::RoutingError;
use crate::id::NodeId;
use crate::message::{Message, MessageKind};
use crate::peer::PeerInfo;
use crate::table::RoutingTable;
use crate::timer::ResponseRegistry;
use crate::transport::Transport;

pub struct Forwarder<T: Transport> {
    own_id: NodeId,
    params: Parameters,
    table: Arc<RwLock<RoutingTable>>,
    clients: Arc<RwLock<ClientTable>>,
    registry: ResponseRegistry,
    transport: Arc<T>,
}

impl<T: Transport> Forwarder<T> {
    pub fn new(
        own_id: NodeId,
        params: Parameters,
        table: Arc<RwLock<RoutingTable>>,
        clients: Arc<RwLock<ClientTable>>,
        registry: ResponseRegistry,
        transport: Arc<T>,
    ) -> Self {
        Self {
            own_id,
            params,
            table,
            clients,
            registry,
            transport,
        }
    }

    /// Route one envelope. Returns the message back when (also) meant for
    /// this node's upper layer; all remote sends happen internally.
    pub async fn route(&self, msg: Message) -> Option<Message> {
        // Replies to senders that had not joined bypass the tables: the
        // sender is not routable yet, only its relay endpoint is.
        if msg.is_response() && msg.destination != self.own_id {
            let routable =
                !msg.destination.is_zero() && self.table.read().contains(&msg.destination);
            if !routable {
                match msg.relay_endpoint {
                    Some(endpoint) => return self.reply_via_relay(endpoint, msg).await,
                    None if msg.destination.is_zero() => {
                        debug!("response with no destination and no relay endpoint dropped");
                        return None;
                    }
                    None => {}
                }
            }
        }

        let for_me = msg.destination == self.own_id;

        if for_me && !msg.group {
            trace!(source = %msg.source, kind = ?msg.kind, "delivering direct message");
            return Some(msg);
        }

        if for_me && msg.group {
            self.fan_out_group(&msg, self.params.group_size - 1).await;
            return Some(msg);
        }

        let am_closest = self.table.read().closest_to(&msg.destination);

        if !am_closest {
            self.forward_to_closest(msg).await;
            return None;
        }

        if msg.group {
            // We are the member nearest the group id; the rest of the
            // group is ours to copy to.
            self.fan_out_group(&msg, self.params.group_size - 1).await;
            return Some(msg);
        }

        // Lookup requests target an id, not a node: whoever is closest
        // answers them.
        if msg.kind == MessageKind::FindNodes && msg.is_request() {
            return Some(msg);
        }

        // Direct send to someone else, and nobody we know is closer.
        let client_records = self.clients.read().clients_for(&msg.destination);
        if !client_records.is_empty() {
            self.deliver_to_clients(msg, client_records).await;
            return None;
        }
        self.forward_to_closest(msg).await;
        None
    }

    /// Rule 3/5 relay: pick the closest unvisited peer and send, retrying
    /// with a growing exclusion set on transport failure.
    ///
    /// A node whose id equals a group destination is not a member of that
    /// group and never receives its traffic, so group relays skip the
    /// exact match.
    async fn forward_to_closest(&self, mut msg: Message) {
        msg.push_route_history(self.own_id, self.params.route_history_size);
        let mut exclude = msg.route_history.clone();
        let ignore_exact_match = msg.group;

        for attempt in 0..self.params.max_forward_attempts {
            let next = self
                .table
                .read()
                .get_closest_node(&msg.destination, &exclude, ignore_exact_match);
            let Some(peer) = next else {
                break;
            };
            debug_assert!(!msg.route_history.contains(&peer.id));

            match self.send_to_peer(&peer, &msg).await {
                Ok(()) => {
                    trace!(
                        destination = %msg.destination,
                        next_hop = %peer.id,
                        attempt,
                        "message forwarded"
                    );
                    return;
                }
                Err(reason) => {
                    warn!(
                        next_hop = %peer.id,
                        endpoint = %peer.send_endpoint(),
                        attempt,
                        %reason,
                        "hop failed, reselecting"
                    );
                    exclude.push(peer.id);
                }
            }
        }

        self.report_unreachable(&msg);
    }

    /// Rules 2/4: expand the group here. The node closest to the group id
    /// readdresses one copy to each remaining member — the closest peers
    /// to the group id that have not already seen the message, the group
    /// id itself excluded. Member copies are direct so they deliver at
    /// the member instead of re-expanding.
    async fn fan_out_group(&self, msg: &Message, limit: usize) {
        let mut base = msg.clone();
        base.push_route_history(self.own_id, self.params.route_history_size);

        let group_id = base.destination;
        let targets: Vec<PeerInfo> = {
            let table = self.table.read();
            table
                .get_closest_nodes(&group_id, self.params.group_size + base.route_history.len())
                .into_iter()
                .filter(|p| p.id != group_id && !base.seen(&p.id))
                .take(limit)
                .collect()
        };

        trace!(
            group = %group_id,
            members = targets.len(),
            "expanding group message"
        );
        for peer in targets {
            let mut copy = base.clone();
            copy.destination = peer.id;
            copy.group = false;
            if let Err(reason) = self.send_to_peer(&peer, &copy).await {
                warn!(member = %peer.id, %reason, "group copy failed");
            }
        }
    }

    /// Rule 5 client hand-off: the destination is attached here; every one
    /// of its endpoints gets the message.
    async fn deliver_to_clients(&self, mut msg: Message, records: Vec<PeerInfo>) {
        msg.push_route_history(self.own_id, self.params.route_history_size);
        trace!(client = %msg.destination, endpoints = records.len(), "delivering to client");
        for record in records {
            if let Err(reason) = self.send_to_peer(&record, &msg).await {
                warn!(client = %record.id, %reason, "client delivery failed");
            }
        }
    }

    async fn reply_via_relay(&self, endpoint: SocketAddr, msg: Message) -> Option<Message> {
        trace!(%endpoint, "responding via relay endpoint");
        match msg.encode() {
            Ok(bytes) => {
                if let Err(e) = self.transport.send(endpoint, bytes).await {
                    warn!(%endpoint, error = %e, "relay response failed");
                }
            }
            Err(e) => warn!(error = %e, "relay response encode failed"),
        }
        None
    }

    async fn send_to_peer(&self, peer: &PeerInfo, msg: &Message) -> Result<(), RoutingError> {
        let bytes = msg
            .encode()
            .map_err(|e| RoutingError::Transport(e.to_string()))?;
        self.transport
            .send(peer.send_endpoint(), bytes)
            .await
            .map_err(|e| RoutingError::Transport(e.to_string()))
    }

    /// All attempts exhausted. A request we originated resolves its
    /// pending entry; relayed traffic is dropped with a log line.
    fn report_unreachable(&self, msg: &Message) {
        warn!(
            destination = %msg.destination,
            kind = ?msg.kind,
            hops = msg.hop_count,
            "destination unreachable, message dropped"
        );
        if msg.source == self.own_id {
            if let Some(id) = msg.response_id {
                self.registry.fail_task(id, RoutingError::NoRoute);
            }
        }
    }
}
