//! # Routing Table
//!
//! The vault-peer table: a bounded set of peers kept ordered by XOR
//! distance from the owner, tuned so that the immediate neighbourhood is
//! complete while the rest of the key space stays diverse enough to route
//! in logarithmically many hops.
//!
//! ## Admission
//!
//! A candidate is admitted iff either
//!
//! 1. the table has room and the candidate's bucket (shared-prefix length
//!    with the owner) holds fewer than `bucket_target` peers outside the
//!    close neighbourhood, or
//! 2. the candidate would land within the closest `closest_nodes_size`
//!    peers. When the table is full this path evicts the furthest
//!    same-bucket peer outside the close set; with no such evictee the
//!    candidate is refused.
//!
//! ## Invariants
//!
//! - `size() <= max_routing_table_size`; no duplicate ids; never the owner.
//! - The `closest_nodes_size` closest peers are always retained.
//! - Outside the close set, each bucket holds at most `bucket_target` peers.
//! - Every mutation reports whether close-set membership changed, so the
//!   facade can publish `close_node_replaced` exactly once per change.

use std::cmp::Ordering;

use rand::Rng;
use tracing::{debug, trace};

use crate::config::Parameters;
use crate::id::{distance_cmp, NodeId, ID_LEN};
use crate::peer::{ConnectionState, PeerInfo};

/// Verdict of the three-valued group-membership predicate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GroupRangeStatus {
    /// The node is one of the `group_size` peers closest to the group id.
    InRange,
    /// Not a member, but within the owner's close-set radius of the group.
    Proximal,
    OutOfRange,
}

/// Result of an [`RoutingTable::add_node`] call.
#[derive(Debug)]
pub struct AddOutcome {
    pub added: bool,
    pub evicted: Option<PeerInfo>,
    /// Membership of the closest `closest_nodes_size` peers changed.
    pub close_set_changed: bool,
}

impl AddOutcome {
    fn rejected() -> Self {
        Self {
            added: false,
            evicted: None,
            close_set_changed: false,
        }
    }
}

/// Result of an [`RoutingTable::drop_node`] call.
#[derive(Debug)]
pub struct DropOutcome {
    pub removed: Option<PeerInfo>,
    pub close_set_changed: bool,
}

enum Admission {
    /// Room in the table and in the bucket.
    Room,
    /// Lands in the close set; evict the peer at this index first.
    CloseWithEviction(usize),
    /// Lands in the close set, no eviction needed.
    Close,
    Reject,
}

/// The vault-peer table. Peers are kept sorted ascending by XOR distance
/// from the owner, so the close set is always the leading
/// `closest_nodes_size` entries.
pub struct RoutingTable {
    own_id: NodeId,
    params: Parameters,
    nodes: Vec<PeerInfo>,
}

impl RoutingTable {
    pub fn new(own_id: NodeId, params: Parameters) -> Self {
        let nodes = Vec::with_capacity(params.max_routing_table_size);
        Self {
            own_id,
            params,
            nodes,
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.own_id
    }

    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.iter().any(|p| &p.id == id)
    }

    pub fn find(&self, id: &NodeId) -> Option<&PeerInfo> {
        self.nodes.iter().find(|p| &p.id == id)
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerInfo> {
        self.nodes.iter()
    }

    /// The current close neighbourhood, closest first.
    pub fn closest_nodes_snapshot(&self) -> Vec<PeerInfo> {
        let n = self.params.closest_nodes_size.min(self.nodes.len());
        self.nodes[..n].to_vec()
    }

    /// Pure admission predicate: true iff [`RoutingTable::add_node`] would
    /// accept this candidate. Never mutates.
    pub fn check_node(&self, candidate: &PeerInfo) -> bool {
        if candidate.id == self.own_id || candidate.id.is_zero() {
            return false;
        }
        if self.contains(&candidate.id) {
            return false;
        }
        !matches!(self.admission(&candidate.id), Admission::Reject)
    }

    /// Validate and insert a peer.
    ///
    /// Requires a public key, a non-self non-duplicate id, and the
    /// admission rule; recomputes the peer's bucket index on the way in.
    pub fn add_node(&mut self, mut peer: PeerInfo) -> AddOutcome {
        if peer.public_key.is_none() {
            trace!(peer = %peer.id, "add refused: no public key");
            return AddOutcome::rejected();
        }
        if peer.id == self.own_id || peer.id.is_zero() {
            trace!(peer = %peer.id, "add refused: own or zero id");
            return AddOutcome::rejected();
        }
        if self.contains(&peer.id) {
            trace!(peer = %peer.id, "add refused: duplicate");
            return AddOutcome::rejected();
        }

        let admission = self.admission(&peer.id);
        if matches!(admission, Admission::Reject) {
            trace!(peer = %peer.id, size = self.nodes.len(), "add refused: bucket policy");
            return AddOutcome::rejected();
        }

        let before = self.close_set_ids();

        let evicted = match admission {
            Admission::CloseWithEviction(idx) => {
                let out = self.nodes.remove(idx);
                debug!(evicted = %out.id, bucket = out.bucket_index, "evicting to admit closer peer");
                Some(out)
            }
            _ => None,
        };

        peer.bucket_index = self.own_id.common_leading_bits(&peer.id);
        let idx = self.insertion_index(&peer.id);
        debug!(peer = %peer.id, bucket = peer.bucket_index, rank = idx, "peer added");
        self.nodes.insert(idx, peer);

        debug_assert!(self.nodes.len() <= self.params.max_routing_table_size);

        AddOutcome {
            added: true,
            evicted,
            close_set_changed: before != self.close_set_ids(),
        }
    }

    /// Remove a peer if present.
    pub fn drop_node(&mut self, id: &NodeId) -> DropOutcome {
        let before = self.close_set_ids();
        let removed = self
            .nodes
            .iter()
            .position(|p| &p.id == id)
            .map(|idx| self.nodes.remove(idx));
        if let Some(peer) = &removed {
            debug!(peer = %peer.id, remaining = self.nodes.len(), "peer dropped");
        }
        DropOutcome {
            close_set_changed: removed.is_some() && before != self.close_set_ids(),
            removed,
        }
    }

    /// Mark an existing peer's connection as established.
    pub fn mark_connected(&mut self, id: &NodeId) -> bool {
        match self.nodes.iter_mut().find(|p| &p.id == id) {
            Some(peer) => {
                peer.connection_state = ConnectionState::Connected;
                true
            }
            None => false,
        }
    }

    /// Replace a peer's reported close neighbourhood.
    pub fn update_dimension_list(&mut self, id: &NodeId, dimensions: Vec<NodeId>) -> bool {
        match self.nodes.iter_mut().find(|p| &p.id == id) {
            Some(peer) => {
                peer.dimension_list = dimensions;
                true
            }
            None => false,
        }
    }

    /// The peer minimising XOR distance to `target`, skipping `exclude`
    /// and, with `ignore_exact_match`, the target itself. `None` when no
    /// peer qualifies.
    pub fn get_closest_node(
        &self,
        target: &NodeId,
        exclude: &[NodeId],
        ignore_exact_match: bool,
    ) -> Option<PeerInfo> {
        self.nodes
            .iter()
            .filter(|p| !exclude.contains(&p.id))
            .filter(|p| !ignore_exact_match || &p.id != target)
            .min_by(|a, b| {
                distance_cmp(&target.xor_distance(&a.id), &target.xor_distance(&b.id))
            })
            .cloned()
    }

    /// Up to `n` peers ordered ascending by XOR distance to `target`.
    pub fn get_closest_nodes(&self, target: &NodeId, n: usize) -> Vec<PeerInfo> {
        let mut sorted: Vec<&PeerInfo> = self.nodes.iter().collect();
        sorted.sort_unstable_by(|a, b| {
            distance_cmp(&target.xor_distance(&a.id), &target.xor_distance(&b.id))
        });
        sorted.into_iter().take(n).cloned().collect()
    }

    /// True iff the owner is closer to `target` than every table peer.
    pub fn closest_to(&self, target: &NodeId) -> bool {
        let own = target.xor_distance(&self.own_id);
        self.nodes
            .iter()
            .all(|p| distance_cmp(&own, &target.xor_distance(&p.id)) == Ordering::Less)
    }

    /// Three-valued group membership of `node_id` relative to the group
    /// addressed by `group_id`, judged from the owner's local view.
    ///
    /// The group for an id excludes the id itself, and a group centred on
    /// the owner is not a group at all.
    pub fn is_node_id_in_group_range(
        &self,
        group_id: &NodeId,
        node_id: &NodeId,
    ) -> GroupRangeStatus {
        if group_id == &self.own_id || node_id == group_id {
            return GroupRangeStatus::OutOfRange;
        }

        if self
            .group_members(group_id)
            .iter()
            .any(|member| member == node_id)
        {
            return GroupRangeStatus::InRange;
        }

        match self.furthest_close_distance() {
            Some(radius)
                if distance_cmp(&node_id.xor_distance(group_id), &radius) != Ordering::Greater =>
            {
                GroupRangeStatus::Proximal
            }
            _ => GroupRangeStatus::OutOfRange,
        }
    }

    /// Single-argument form: where does the owner stand relative to
    /// `group_id`'s group?
    pub fn own_group_range_status(&self, group_id: &NodeId) -> GroupRangeStatus {
        let own = self.own_id;
        self.is_node_id_in_group_range(group_id, &own)
    }

    /// The `group_size` ids closest to `group_id` known locally, owner
    /// included, the group id itself excluded.
    pub fn group_members(&self, group_id: &NodeId) -> Vec<NodeId> {
        let mut candidates: Vec<NodeId> = self
            .nodes
            .iter()
            .map(|p| p.id)
            .filter(|id| id != group_id)
            .collect();
        if &self.own_id != group_id {
            candidates.push(self.own_id);
        }
        candidates.sort_unstable_by(|a, b| {
            distance_cmp(&group_id.xor_distance(a), &group_id.xor_distance(b))
        });
        candidates.truncate(self.params.group_size);
        candidates
    }

    /// XOR radius of the proximal band: owner's distance to its
    /// `proximal_size`-th closest peer (or furthest available).
    fn furthest_close_distance(&self) -> Option<[u8; ID_LEN]> {
        let idx = self.params.proximal_size.min(self.nodes.len());
        if idx == 0 {
            return None;
        }
        Some(self.own_id.xor_distance(&self.nodes[idx - 1].id))
    }

    /// A random connected peer outside the close neighbourhood.
    pub fn random_connected_node(&self) -> Option<PeerInfo> {
        let candidates: Vec<&PeerInfo> = self
            .nodes
            .iter()
            .skip(self.params.closest_nodes_size)
            .filter(|p| p.connection_state == ConnectionState::Connected)
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..candidates.len());
        Some(candidates[idx].clone())
    }

    fn close_set_ids(&self) -> Vec<NodeId> {
        let n = self.params.closest_nodes_size.min(self.nodes.len());
        self.nodes[..n].iter().map(|p| p.id).collect()
    }

    /// Sorted position of `id` by distance from the owner.
    fn insertion_index(&self, id: &NodeId) -> usize {
        let dist = self.own_id.xor_distance(id);
        self.nodes
            .binary_search_by(|p| distance_cmp(&self.own_id.xor_distance(&p.id), &dist))
            .unwrap_or_else(|idx| idx)
    }

    /// Would `id` land within the close neighbourhood?
    fn would_be_close(&self, id: &NodeId) -> bool {
        if self.nodes.len() < self.params.closest_nodes_size {
            return true;
        }
        let boundary = &self.nodes[self.params.closest_nodes_size - 1];
        distance_cmp(
            &self.own_id.xor_distance(id),
            &self.own_id.xor_distance(&boundary.id),
        ) == Ordering::Less
    }

    /// Peers sharing `bucket` outside the close set, as sorted indices.
    fn non_close_bucket_indices(&self, bucket: u32) -> Vec<usize> {
        self.nodes
            .iter()
            .enumerate()
            .skip(self.params.closest_nodes_size)
            .filter(|(_, p)| p.bucket_index == bucket)
            .map(|(idx, _)| idx)
            .collect()
    }

    fn admission(&self, candidate: &NodeId) -> Admission {
        let bucket = self.own_id.common_leading_bits(candidate);
        let in_bucket = self.non_close_bucket_indices(bucket);

        if self.nodes.len() < self.params.max_routing_table_size
            && in_bucket.len() < self.params.bucket_target
        {
            return Admission::Room;
        }

        if self.would_be_close(candidate) {
            if self.nodes.len() < self.params.max_routing_table_size {
                return Admission::Close;
            }
            // Furthest same-bucket peer outside the close set gives way.
            return match in_bucket.last() {
                Some(&idx) => Admission::CloseWithEviction(idx),
                None => Admission::Reject,
            };
        }

        Admission::Reject
    }
}
