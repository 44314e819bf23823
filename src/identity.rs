//! # Node Identity
//!
//! Every member of the overlay is described by a [`NodeInfo`]:
//!
//! - `num_id` ([`NumId`]): totally ordered, unique among live nodes. Search
//!   routes greedily on it.
//! - `name_id` ([`NameId`]): a fixed-length bit string. Two nodes are linked at
//!   level `L` only if their name ids share a prefix of length `L`.
//! - `address`: the QUIC endpoint the node listens on.
//!
//! A `NodeInfo` is never mutated after the issuer assigns it. A node that is
//! re-admitted gets a new one.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{SkipGraphError, SkipGraphResult};

pub type NumId = u64;

/// Skip graph levels are indexed from 0 (every node) to `name_id.len()`.
pub type Level = usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Left,
    Right,
}

impl Direction {
    pub fn opposite(self) -> Self {
        match self {
            Direction::Left => Direction::Right,
            Direction::Right => Direction::Left,
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Direction::Left => 0,
            Direction::Right => 1,
        }
    }

    /// Direction a search for `target` must travel from `current`.
    /// `None` when `current` already holds the target.
    pub fn towards(current: NumId, target: NumId) -> Option<Self> {
        match target.cmp(&current) {
            std::cmp::Ordering::Less => Some(Direction::Left),
            std::cmp::Ordering::Greater => Some(Direction::Right),
            std::cmp::Ordering::Equal => None,
        }
    }

    fn tag(self) -> u8 {
        match self {
            Direction::Left => 0,
            Direction::Right => 1,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Left => write!(f, "left"),
            Direction::Right => write!(f, "right"),
        }
    }
}

/// Fixed-length bit string, stored as ASCII `'0'`/`'1'`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NameId(String);

impl NameId {
    pub fn new(bits: impl Into<String>) -> SkipGraphResult<Self> {
        let bits = bits.into();
        if bits.is_empty() {
            return Err(SkipGraphError::InvalidRequest("name id must not be empty".into()));
        }
        if let Some(bad) = bits.chars().find(|c| *c != '0' && *c != '1') {
            return Err(SkipGraphError::InvalidRequest(format!(
                "name id may only contain 0 and 1, found {bad:?}"
            )));
        }
        Ok(Self(bits))
    }

    /// Renders the low `width` bits of `value`, most significant first.
    pub fn from_value(value: u64, width: usize) -> SkipGraphResult<Self> {
        if width == 0 || width > 64 {
            return Err(SkipGraphError::InvalidRequest(format!(
                "name id width must be within 1..=64, got {width}"
            )));
        }
        Self::new(format!("{:0width$b}", value, width = width))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The first `len` bits (saturating at the full name).
    pub fn prefix(&self, len: usize) -> &str {
        &self.0[..len.min(self.0.len())]
    }

    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix)
    }

    pub fn common_prefix_len(&self, other: &NameId) -> usize {
        self.0
            .bytes()
            .zip(other.0.bytes())
            .take_while(|(a, b)| a == b)
            .count()
    }
}

impl fmt::Debug for NameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NameId({})", self.0)
    }
}

impl fmt::Display for NameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for NameId {
    type Err = SkipGraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NameId::new(s)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeInfo {
    pub num_id: NumId,
    pub name_id: NameId,
    pub address: String,
}

impl NodeInfo {
    pub fn new(num_id: NumId, name_id: NameId, address: impl Into<String>) -> Self {
        Self {
            num_id,
            name_id,
            address: address.into(),
        }
    }

    /// Identity comparison. numIDs are unique among live nodes.
    pub fn same_node(&self, other: &NodeInfo) -> bool {
        self.num_id == other.num_id
    }

    /// Highest level this node can participate in.
    pub fn max_level(&self) -> Level {
        self.name_id.len()
    }

    /// Length-prefixed little-endian encoding used inside signed payloads.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.num_id.to_le_bytes());
        encode_str(out, self.name_id.as_str());
        encode_str(out, &self.address);
    }

    /// Encoding of the issued identity alone (the address is not part of it).
    pub fn identity_bytes(&self) -> Vec<u8> {
        identity_bytes(self.num_id, &self.name_id)
    }
}

impl fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.num_id, self.name_id, self.address)
    }
}

pub(crate) fn identity_bytes(num_id: NumId, name_id: &NameId) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + name_id.len());
    out.extend_from_slice(&num_id.to_le_bytes());
    encode_str(&mut out, name_id.as_str());
    out
}

pub(crate) fn encode_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

pub(crate) fn encode_direction(out: &mut Vec<u8>, direction: Option<Direction>) {
    out.push(direction.map(|d| d.tag() + 1).unwrap_or(0));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(bits: &str) -> NameId {
        NameId::new(bits).expect("valid name id")
    }

    #[test]
    fn name_id_rejects_non_binary() {
        assert!(NameId::new("0102").is_err());
        assert!(NameId::new("").is_err());
        assert!(NameId::new("0110").is_ok());
    }

    #[test]
    fn name_id_from_value_pads_to_width() {
        assert_eq!(NameId::from_value(1, 3).unwrap().as_str(), "001");
        assert_eq!(NameId::from_value(5, 3).unwrap().as_str(), "101");
        assert!(NameId::from_value(1, 0).is_err());
    }

    #[test]
    fn common_prefix_and_prefix_match() {
        let a = name("0010");
        let b = name("0011");
        let c = name("1010");
        assert_eq!(a.common_prefix_len(&b), 3);
        assert_eq!(a.common_prefix_len(&c), 0);
        assert_eq!(a.common_prefix_len(&a), 4);
        assert!(b.has_prefix(a.prefix(3)));
        assert!(!c.has_prefix(a.prefix(1)));
        assert_eq!(a.prefix(10), "0010");
    }

    #[test]
    fn direction_towards_target() {
        assert_eq!(Direction::towards(5, 3), Some(Direction::Left));
        assert_eq!(Direction::towards(5, 9), Some(Direction::Right));
        assert_eq!(Direction::towards(5, 5), None);
        assert_eq!(Direction::Left.opposite(), Direction::Right);
    }

    #[test]
    fn identity_bytes_ignore_address() {
        let a = NodeInfo::new(7, name("01"), "127.0.0.1:1000");
        let b = NodeInfo::new(7, name("01"), "127.0.0.1:2000");
        assert_eq!(a.identity_bytes(), b.identity_bytes());

        let mut ea = Vec::new();
        let mut eb = Vec::new();
        a.encode_into(&mut ea);
        b.encode_into(&mut eb);
        assert_ne!(ea, eb);
    }
}
