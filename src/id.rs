//! # Node Identifiers and the XOR Metric
//!
//! Every peer in the overlay is addressed by a [`NodeId`]: a 512-bit opaque
//! value. Identifiers form a metric space under bitwise XOR, and every
//! closeness decision the routing core makes reduces to two primitives
//! defined here:
//!
//! - [`NodeId::common_leading_bits`]: the shared prefix length of two ids,
//!   which doubles as the bucket index of a peer relative to the owner.
//! - [`distance_cmp`] / [`NodeId::closer_to_target`]: lexicographic
//!   comparison of XOR distances.
//!
//! ## Metric Invariants
//!
//! - `xor(a, a) == 0`
//! - `xor(a, b) == xor(b, a)`
//! - `xor(a, b) ^ xor(b, c) == xor(a, c)`
//!
//! Because XOR distance is injective in its second argument, two distinct
//! ids can never be equidistant from a target; ordering by distance is total.

use std::cmp::Ordering;
use std::fmt;

use rand::RngCore;
use serde::de::{Error as DeError, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Identifier width in bits.
pub const ID_BITS: u32 = 512;

/// Identifier width in bytes.
pub const ID_LEN: usize = 64;

/// A 512-bit overlay identifier.
///
/// The all-zero id is reserved as a sentinel meaning "no node": it is used
/// as the source of messages sent before a node has joined, and is never
/// admitted to a table.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId([u8; ID_LEN]);

impl NodeId {
    /// The all-zero sentinel id.
    pub const ZERO: NodeId = NodeId([0u8; ID_LEN]);

    #[inline]
    pub fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    /// Generate a uniformly random identifier.
    pub fn random() -> Self {
        let mut bytes = [0u8; ID_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// True for the all-zero sentinel.
    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    /// Bitwise XOR distance to `other`.
    #[inline]
    pub fn xor_distance(&self, other: &NodeId) -> [u8; ID_LEN] {
        let mut out = [0u8; ID_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    /// Length of the shared bit prefix of `self` and `other`, in `[0, 512]`.
    ///
    /// Equal ids share all 512 bits. For a routing table owned by `self`,
    /// this is the bucket index of `other`.
    pub fn common_leading_bits(&self, other: &NodeId) -> u32 {
        for (byte_idx, (a, b)) in self.0.iter().zip(other.0.iter()).enumerate() {
            let diff = a ^ b;
            if diff != 0 {
                return byte_idx as u32 * 8 + diff.leading_zeros();
            }
        }
        ID_BITS
    }

    /// True iff `a` is strictly closer to `self` (the target) than `b`.
    #[inline]
    pub fn closer_to_target(&self, a: &NodeId, b: &NodeId) -> bool {
        distance_cmp(&self.xor_distance(a), &self.xor_distance(b)) == Ordering::Less
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != ID_LEN {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; ID_LEN];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

/// Lexicographic comparison of two XOR distances.
#[inline]
pub fn distance_cmp(a: &[u8; ID_LEN], b: &[u8; ID_LEN]) -> Ordering {
    a.cmp(b)
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// serde's derive covers arrays only up to 32 bytes; a 64-byte id is encoded
// as a raw byte string by hand.
impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

struct NodeIdVisitor;

impl<'de> Visitor<'de> for NodeIdVisitor {
    type Value = NodeId;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a {ID_LEN}-byte node identifier")
    }

    fn visit_bytes<E: DeError>(self, v: &[u8]) -> Result<NodeId, E> {
        if v.len() != ID_LEN {
            return Err(E::invalid_length(v.len(), &self));
        }
        let mut bytes = [0u8; ID_LEN];
        bytes.copy_from_slice(v);
        Ok(NodeId(bytes))
    }

    fn visit_seq<A: serde::de::SeqAccess<'de>>(self, mut seq: A) -> Result<NodeId, A::Error> {
        let mut bytes = [0u8; ID_LEN];
        for (i, slot) in bytes.iter_mut().enumerate() {
            *slot = seq
                .next_element()?
                .ok_or_else(|| A::Error::invalid_length(i, &self))?;
        }
        Ok(NodeId(bytes))
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_bytes(NodeIdVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id_with_prefix(bits: &[u8]) -> NodeId {
        // Sets the given leading bits, rest zero except a trailing one so
        // the id is distinct from ZERO.
        let mut bytes = [0u8; ID_LEN];
        for (i, bit) in bits.iter().enumerate() {
            if *bit != 0 {
                bytes[i / 8] |= 0x80 >> (i % 8);
            }
        }
        bytes[ID_LEN - 1] |= 1;
        NodeId::from_bytes(bytes)
    }

    #[test]
    fn xor_with_self_is_zero() {
        let id = NodeId::random();
        assert_eq!(id.xor_distance(&id), [0u8; ID_LEN]);
    }

    #[test]
    fn xor_is_commutative() {
        let a = NodeId::random();
        let b = NodeId::random();
        assert_eq!(a.xor_distance(&b), b.xor_distance(&a));
    }

    #[test]
    fn common_leading_bits_identical() {
        let id = NodeId::random();
        assert_eq!(id.common_leading_bits(&id), ID_BITS);
    }

    #[test]
    fn common_leading_bits_first_bit_differs() {
        let a = id_with_prefix(&[0]);
        let b = id_with_prefix(&[1]);
        assert_eq!(a.common_leading_bits(&b), 0);
    }

    #[test]
    fn common_leading_bits_partial_prefix() {
        let a = id_with_prefix(&[1, 0, 1, 0]);
        let b = id_with_prefix(&[1, 0, 1, 1]);
        assert_eq!(a.common_leading_bits(&b), 3);
    }

    #[test]
    fn closer_to_target_orders_by_distance() {
        let target = NodeId::from_bytes([0u8; ID_LEN]);
        let mut near = [0u8; ID_LEN];
        near[ID_LEN - 1] = 1;
        let mut far = [0u8; ID_LEN];
        far[0] = 0x80;
        let near = NodeId::from_bytes(near);
        let far = NodeId::from_bytes(far);
        assert!(target.closer_to_target(&near, &far));
        assert!(!target.closer_to_target(&far, &near));
        assert!(!target.closer_to_target(&near, &near));
    }

    #[test]
    fn distinct_ids_never_equidistant() {
        let target = NodeId::random();
        let a = NodeId::random();
        let b = NodeId::random();
        if a != b {
            assert_ne!(
                distance_cmp(&target.xor_distance(&a), &target.xor_distance(&b)),
                Ordering::Equal
            );
        }
    }

    #[test]
    fn hex_round_trip() {
        let id = NodeId::random();
        assert_eq!(NodeId::from_hex(&id.to_hex()).unwrap(), id);
        assert!(NodeId::from_hex("abcd").is_err());
    }

    #[test]
    fn bincode_round_trip() {
        let id = NodeId::random();
        let bytes = bincode::serialize(&id).unwrap();
        let decoded: NodeId = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, id);
    }

    #[test]
    fn zero_sentinel() {
        assert!(NodeId::ZERO.is_zero());
        assert!(!NodeId::random().is_zero());
    }
}
