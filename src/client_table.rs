//! # Client Table
//!
//! Clients attach to a vault and route every message through it, but they
//! are terminals: a client is never offered as a next hop for traffic whose
//! destination is anyone but itself. One client id may be attached through
//! several endpoints (reconnects, multiple devices behind one key), so
//! records here are keyed by `(id, endpoint)` rather than id alone.

use std::net::SocketAddr;

use tracing::{debug, trace};

use crate::config::Parameters;
use crate::id::NodeId;
use crate::peer::PeerInfo;

pub struct ClientTable {
    own_id: NodeId,
    max_size: usize,
    clients: Vec<PeerInfo>,
}

impl ClientTable {
    pub fn new(own_id: NodeId, params: &Parameters) -> Self {
        Self {
            own_id,
            max_size: params.max_client_table_size,
            clients: Vec::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.clients.len()
    }

    /// Is any endpoint of this client id attached?
    pub fn contains(&self, id: &NodeId) -> bool {
        self.clients.iter().any(|c| &c.id == id)
    }

    /// All attached records for `id`, one per endpoint.
    pub fn clients_for(&self, id: &NodeId) -> Vec<PeerInfo> {
        self.clients.iter().filter(|c| &c.id == id).cloned().collect()
    }

    /// Attach a client. Refused for the vault's own id, missing key
    /// material, a duplicate `(id, endpoint)` pair, or a full table.
    pub fn add_client(&mut self, client: PeerInfo) -> bool {
        if client.id == self.own_id || client.id.is_zero() {
            trace!(client = %client.id, "client refused: own or zero id");
            return false;
        }
        if client.public_key.is_none() {
            trace!(client = %client.id, "client refused: no public key");
            return false;
        }
        if self
            .clients
            .iter()
            .any(|c| c.id == client.id && c.endpoint_pair == client.endpoint_pair)
        {
            trace!(client = %client.id, "client refused: endpoint already attached");
            return false;
        }
        if self.clients.len() >= self.max_size {
            debug!(client = %client.id, size = self.clients.len(), "client refused: table full");
            return false;
        }
        debug!(client = %client.id, endpoint = %client.send_endpoint(), "client attached");
        self.clients.push(client);
        true
    }

    /// Detach whatever client record answers to `endpoint`.
    pub fn drop_client_at(&mut self, endpoint: SocketAddr) -> Option<PeerInfo> {
        let idx = self
            .clients
            .iter()
            .position(|c| c.send_endpoint() == endpoint)?;
        let removed = self.clients.remove(idx);
        debug!(client = %removed.id, %endpoint, "client detached");
        Some(removed)
    }

    /// Detach every record for `id`, returning how many were removed.
    pub fn drop_clients(&mut self, id: &NodeId) -> usize {
        let before = self.clients.len();
        self.clients.retain(|c| &c.id != id);
        let dropped = before - self.clients.len();
        if dropped > 0 {
            debug!(client = %id, count = dropped, "client records detached");
        }
        dropped
    }
}
