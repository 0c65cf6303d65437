//! # Group Matrix
//!
//! Each close peer reports its own close neighbourhood (its
//! `dimension_list`); laying those rows side by side gives the owner an
//! N×N view of the near key space. The matrix answers two questions the
//! routing table alone cannot:
//!
//! - `estimate_in_group(sender, info_id)`: is a claimed group message
//!   plausibly from a legitimate member of `info_id`'s group, judged
//!   against everything the neighbourhood has reported?
//! - `is_connected(id)`: is this id known to the neighbourhood at all,
//!   either as a row owner or inside someone's row?
//!
//! Rows live and die with the close peers that report them: the facade
//! updates a row whenever a dimension list arrives and removes it when the
//! peer leaves the table.

use std::collections::{HashMap, HashSet};

use tracing::trace;

use crate::id::{distance_cmp, NodeId};

pub struct GroupMatrix {
    own_id: NodeId,
    group_size: usize,
    rows: HashMap<NodeId, Vec<NodeId>>,
}

impl GroupMatrix {
    pub fn new(own_id: NodeId, group_size: usize) -> Self {
        Self {
            own_id,
            group_size,
            rows: HashMap::new(),
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Install or replace the row reported by `peer`.
    pub fn update_row(&mut self, peer: NodeId, mut reported: Vec<NodeId>) {
        reported.retain(|id| !id.is_zero() && id != &peer);
        trace!(peer = %peer, entries = reported.len(), "group matrix row updated");
        self.rows.insert(peer, reported);
    }

    /// Drop the row for a departed peer.
    pub fn remove_row(&mut self, peer: &NodeId) {
        if self.rows.remove(peer).is_some() {
            trace!(peer = %peer, "group matrix row removed");
        }
    }

    /// Known to the neighbourhood: a row owner or a member of any row.
    pub fn is_connected(&self, id: &NodeId) -> bool {
        self.rows.contains_key(id) || self.rows.values().any(|row| row.contains(id))
    }

    /// Every distinct id the matrix knows about, owner included.
    fn known_ids(&self) -> HashSet<NodeId> {
        let mut ids: HashSet<NodeId> = HashSet::new();
        ids.insert(self.own_id);
        for (peer, row) in &self.rows {
            ids.insert(*peer);
            ids.extend(row.iter().copied());
        }
        ids
    }

    /// Judge whether `sender` is plausibly one of the `group_size` peers
    /// closest to `info_id`, using the union of everything the
    /// neighbourhood has reported.
    ///
    /// A sparse matrix errs permissive: with fewer known ids than a full
    /// group, any sender we know of passes.
    pub fn estimate_in_group(&self, sender: &NodeId, info_id: &NodeId) -> bool {
        if sender == info_id || sender.is_zero() {
            return false;
        }
        let mut candidates: Vec<NodeId> = self
            .known_ids()
            .into_iter()
            .filter(|id| id != info_id)
            .collect();
        if candidates.len() <= self.group_size {
            return candidates.contains(sender);
        }
        candidates.sort_unstable_by(|a, b| {
            distance_cmp(&info_id.xor_distance(a), &info_id.xor_distance(b))
        });
        candidates[..self.group_size].contains(sender)
    }
}
