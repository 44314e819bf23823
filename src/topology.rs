//! # Node Topology
//!
//! A [`NeighborTable`] holds one slot per `(level, direction)` for levels
//! `0..=max_level`, where `max_level` is the owner's nameID length. Each slot
//! has its own `RwLock`, so an insertion splicing a neighbor at level 3 never
//! waits on a search reading level 0.
//!
//! ## Invariants enforced on every write
//!
//! - A level-`L` neighbor shares a nameID prefix of length `>= L` with the owner.
//! - Left neighbors have a smaller numID than the owner, right neighbors a
//!   larger one.
//!
//! Writes that would break either rule are rejected with `InvalidRequest`.
//!
//! Conditional updates only ever move a slot closer to the owner, so joins
//! retried after a conflict converge on the nearest neighbors.

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::trace;

use crate::error::{SkipGraphError, SkipGraphResult};
use crate::identity::{Direction, Level, NodeInfo, NumId};

/// Outcome of a conditional neighbor update.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NeighborUpdate {
    Applied,
    /// The slot already held the requested node; nothing changed.
    Unchanged,
    /// The slot held a node inside the gap the update meant to fill.
    Conflict { current: Option<NodeInfo> },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelSnapshot {
    pub level: Level,
    pub left: Option<NodeInfo>,
    pub right: Option<NodeInfo>,
}

type Slot = RwLock<Option<NodeInfo>>;

pub struct NeighborTable {
    owner: NodeInfo,
    slots: Vec<[Slot; 2]>,
    guards: RwLock<Vec<NodeInfo>>,
}

impl NeighborTable {
    pub fn new(owner: NodeInfo) -> Self {
        let slots = (0..=owner.max_level())
            .map(|_| [RwLock::new(None), RwLock::new(None)])
            .collect();
        Self {
            owner,
            slots,
            guards: RwLock::new(Vec::new()),
        }
    }

    pub fn owner(&self) -> &NodeInfo {
        &self.owner
    }

    pub fn max_level(&self) -> Level {
        self.slots.len() - 1
    }

    fn slot(&self, level: Level, direction: Direction) -> SkipGraphResult<&Slot> {
        self.slots
            .get(level)
            .map(|pair| &pair[direction.index()])
            .ok_or_else(|| {
                SkipGraphError::InvalidRequest(format!(
                    "level {level} exceeds max level {}",
                    self.max_level()
                ))
            })
    }

    fn check_placement(&self, level: Level, direction: Direction, node: &NodeInfo) -> SkipGraphResult<()> {
        if node.same_node(&self.owner) {
            return Err(SkipGraphError::InvalidRequest(format!(
                "node {} cannot be its own neighbor",
                node.num_id
            )));
        }
        if self.owner.name_id.common_prefix_len(&node.name_id) < level {
            return Err(SkipGraphError::InvalidRequest(format!(
                "node {} ({}) does not share a {level}-bit prefix with {} ({})",
                node.num_id, node.name_id, self.owner.num_id, self.owner.name_id
            )));
        }
        let ordered = match direction {
            Direction::Left => node.num_id < self.owner.num_id,
            Direction::Right => node.num_id > self.owner.num_id,
        };
        if !ordered {
            return Err(SkipGraphError::InvalidRequest(format!(
                "node {} cannot be the {direction} neighbor of {}",
                node.num_id, self.owner.num_id
            )));
        }
        Ok(())
    }

    /// `GetNeighbor(level, direction)`.
    pub async fn get(&self, level: Level, direction: Direction) -> SkipGraphResult<Option<NodeInfo>> {
        Ok(self.slot(level, direction)?.read().await.clone())
    }

    /// `SetNeighbor(level, direction, node)`. Returns the previous occupant.
    pub async fn set(
        &self,
        level: Level,
        direction: Direction,
        node: Option<NodeInfo>,
    ) -> SkipGraphResult<Option<NodeInfo>> {
        if let Some(n) = &node {
            self.check_placement(level, direction, n)?;
        }
        let slot = self.slot(level, direction)?;
        let mut guard = slot.write().await;
        trace!(
            owner = self.owner.num_id,
            level,
            %direction,
            neighbor = ?node.as_ref().map(|n| n.num_id),
            "set neighbor"
        );
        Ok(std::mem::replace(&mut *guard, node))
    }

    /// Conditional splice of `node` into a slot, issued by a joiner that
    /// believes `expected` (by numID, `None` meaning nobody) sits just beyond
    /// it. Applies when the slot holds `expected`, or holds a node even
    /// farther from the owner than `expected` (the slot is stale). Any other
    /// occupant is a node inside the joiner's gap that the joiner does not
    /// know about, which is a conflict. A slot already holding `node` is left
    /// unchanged.
    pub async fn compare_and_set(
        &self,
        level: Level,
        direction: Direction,
        expected: Option<NumId>,
        node: Option<NodeInfo>,
    ) -> SkipGraphResult<NeighborUpdate> {
        if let Some(n) = &node {
            self.check_placement(level, direction, n)?;
        }
        let slot = self.slot(level, direction)?;
        let mut guard = slot.write().await;
        let current = guard.as_ref().map(|n| n.num_id);
        if current == node.as_ref().map(|n| n.num_id) {
            *guard = node;
            return Ok(NeighborUpdate::Unchanged);
        }
        let stale = node.is_some() && beyond(direction, current, expected);
        if current != expected && !stale {
            return Ok(NeighborUpdate::Conflict {
                current: guard.clone(),
            });
        }
        *guard = node;
        Ok(NeighborUpdate::Applied)
    }

    /// Highest level at which the owner has at least one neighbor.
    pub async fn highest_populated_level(&self) -> Option<Level> {
        for level in (0..self.slots.len()).rev() {
            for slot in &self.slots[level] {
                if slot.read().await.is_some() {
                    return Some(level);
                }
            }
        }
        None
    }

    pub async fn snapshot(&self) -> Vec<LevelSnapshot> {
        let mut levels = Vec::with_capacity(self.slots.len());
        for (level, [left, right]) in self.slots.iter().enumerate() {
            levels.push(LevelSnapshot {
                level,
                left: left.read().await.clone(),
                right: right.read().await.clone(),
            });
        }
        levels
    }

    // ------------------------------------------------------------------
    // Guards
    // ------------------------------------------------------------------

    /// `SetGuard(position, node)`. A position may overwrite an existing guard
    /// or append one; there are at most `max_level + 1` guards.
    pub async fn set_guard(&self, position: usize, node: NodeInfo) -> SkipGraphResult<()> {
        if node.same_node(&self.owner) {
            return Err(SkipGraphError::InvalidRequest("a node cannot guard itself".into()));
        }
        if position > self.max_level() {
            return Err(SkipGraphError::InvalidRequest(format!(
                "guard position {position} exceeds max level {}",
                self.max_level()
            )));
        }
        let mut guards = self.guards.write().await;
        match position.cmp(&guards.len()) {
            std::cmp::Ordering::Less => guards[position] = node,
            std::cmp::Ordering::Equal => guards.push(node),
            std::cmp::Ordering::Greater => {
                return Err(SkipGraphError::InvalidRequest(format!(
                    "guard position {position} leaves a gap after {} guards",
                    guards.len()
                )));
            }
        }
        Ok(())
    }

    pub async fn guards(&self) -> Vec<NodeInfo> {
        self.guards.read().await.clone()
    }

    /// `GetGuard()`: the first designated guard.
    pub async fn primary_guard(&self) -> Option<NodeInfo> {
        self.guards.read().await.first().cloned()
    }

    /// Drops every guard at or past `len`.
    pub async fn truncate_guards(&self, len: usize) {
        self.guards.write().await.truncate(len);
    }

    /// Swaps in a whole guard list at once.
    pub async fn replace_guards(&self, guards: Vec<NodeInfo>) {
        *self.guards.write().await = guards;
    }
}

/// Whether `current` lies farther from the owner than `expected` along
/// `direction`. An empty slot is farther than any node; nothing is farther
/// than an open end.
fn beyond(direction: Direction, current: Option<NumId>, expected: Option<NumId>) -> bool {
    match (current, expected) {
        (None, Some(_)) => true,
        (Some(c), Some(e)) => match direction {
            Direction::Left => c < e,
            Direction::Right => c > e,
        },
        (_, None) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NameId;
    use std::sync::Arc;

    fn node(num_id: NumId, bits: &str) -> NodeInfo {
        NodeInfo::new(num_id, NameId::new(bits).unwrap(), format!("10.0.0.1:{num_id}"))
    }

    #[tokio::test]
    async fn table_has_a_slot_pair_per_level() {
        let table = NeighborTable::new(node(5, "010"));
        assert_eq!(table.max_level(), 3);
        assert_eq!(table.get(3, Direction::Left).await.unwrap(), None);
        assert!(table.get(4, Direction::Left).await.is_err());
    }

    #[tokio::test]
    async fn placement_enforces_prefix_and_order() {
        let table = NeighborTable::new(node(5, "010"));
        assert!(table.set(0, Direction::Right, Some(node(9, "111"))).await.is_ok());
        assert!(table.set(1, Direction::Right, Some(node(9, "111"))).await.is_err());
        assert!(table.set(2, Direction::Right, Some(node(9, "011"))).await.is_ok());
        assert!(table.set(0, Direction::Left, Some(node(9, "011"))).await.is_err());
        assert!(table.set(0, Direction::Left, Some(node(5, "011"))).await.is_err());
        assert_eq!(table.highest_populated_level().await, Some(2));
    }

    #[tokio::test]
    async fn compare_and_set_detects_conflicts() {
        let table = NeighborTable::new(node(5, "01"));
        let a = node(7, "00");
        let b = node(9, "10");

        assert_eq!(
            table.compare_and_set(0, Direction::Right, None, Some(b.clone())).await.unwrap(),
            NeighborUpdate::Applied
        );
        assert_eq!(
            table.compare_and_set(0, Direction::Right, Some(b.num_id), Some(a.clone())).await.unwrap(),
            NeighborUpdate::Applied
        );
        // Retrying the same splice is a no-op.
        assert_eq!(
            table.compare_and_set(0, Direction::Right, Some(b.num_id), Some(a.clone())).await.unwrap(),
            NeighborUpdate::Unchanged
        );
        // Someone else moved the slot.
        assert_eq!(
            table.compare_and_set(0, Direction::Right, None, Some(b.clone())).await.unwrap(),
            NeighborUpdate::Conflict { current: Some(a) }
        );
    }

    #[tokio::test]
    async fn slots_are_independent_under_concurrency() {
        let table = Arc::new(NeighborTable::new(node(500, "0000")));
        let mut tasks = tokio::task::JoinSet::new();
        for level in 0..=3usize {
            let table = table.clone();
            tasks.spawn(async move {
                for i in 0..50u64 {
                    let right = node(1000 + i, "0000");
                    let left = node(i, "0000");
                    table.set(level, Direction::Right, Some(right)).await.unwrap();
                    table.set(level, Direction::Left, Some(left)).await.unwrap();
                }
            });
        }
        while let Some(res) = tasks.join_next().await {
            res.unwrap();
        }
        for level in table.snapshot().await {
            assert_eq!(level.right.unwrap().num_id, 1049);
            assert_eq!(level.left.unwrap().num_id, 49);
        }
    }

    #[tokio::test]
    async fn held_read_on_one_slot_does_not_block_another() {
        let table = NeighborTable::new(node(5, "00"));
        let _reader = table.slot(0, Direction::Left).unwrap().read().await;
        let write = table.set(1, Direction::Right, Some(node(6, "00")));
        tokio::time::timeout(std::time::Duration::from_secs(1), write)
            .await
            .expect("write to an unrelated slot must not wait")
            .unwrap();
    }

    #[tokio::test]
    async fn stale_slot_accepts_a_closer_joiner() {
        let table = NeighborTable::new(node(20, "1"));
        table.set(0, Direction::Left, Some(node(2, "0"))).await.unwrap();

        // The joiner knows 8 sits between 2 and itself, so 2 is stale.
        assert_eq!(
            table.compare_and_set(0, Direction::Left, Some(8), Some(node(12, "0"))).await.unwrap(),
            NeighborUpdate::Applied
        );
        // 12 sits inside the gap of a joiner that thinks 2 is next.
        assert_eq!(
            table.compare_and_set(0, Direction::Left, Some(2), Some(node(15, "0"))).await.unwrap(),
            NeighborUpdate::Conflict {
                current: Some(node(12, "0"))
            }
        );
        // Claiming to be the leftmost node while 12 exists is a conflict too.
        assert_eq!(
            table.compare_and_set(0, Direction::Left, None, Some(node(14, "0"))).await.unwrap(),
            NeighborUpdate::Conflict {
                current: Some(node(12, "0"))
            }
        );
        // Removal needs an exact match.
        assert!(matches!(
            table.compare_and_set(0, Direction::Left, Some(1), None).await.unwrap(),
            NeighborUpdate::Conflict { .. }
        ));
    }

    #[tokio::test]
    async fn guards_are_positional() {
        let table = NeighborTable::new(node(5, "00"));
        assert_eq!(table.primary_guard().await, None);
        table.set_guard(0, node(9, "10")).await.unwrap();
        table.set_guard(1, node(3, "01")).await.unwrap();
        table.set_guard(0, node(7, "11")).await.unwrap();
        assert_eq!(table.primary_guard().await.unwrap().num_id, 7);
        assert_eq!(table.guards().await.len(), 2);
        assert!(table.set_guard(0, node(5, "00")).await.is_err());

        table.truncate_guards(1).await;
        assert_eq!(table.guards().await, vec![node(7, "11")]);
        table.replace_guards(vec![node(3, "01"), node(9, "10")]).await;
        assert_eq!(table.guards().await.len(), 2);
    }

    #[tokio::test]
    async fn guard_positions_are_bounded() {
        let table = NeighborTable::new(node(5, "00"));
        for position in [1, 3, 1 << 40, usize::MAX] {
            assert!(matches!(
                table.set_guard(position, node(9, "10")).await,
                Err(SkipGraphError::InvalidRequest(_))
            ));
        }
        assert!(table.guards().await.is_empty());

        table.set_guard(0, node(9, "10")).await.unwrap();
        table.set_guard(1, node(3, "01")).await.unwrap();
        table.set_guard(2, node(7, "11")).await.unwrap();
        // Max level 2 allows three guards.
        assert!(table.set_guard(3, node(6, "01")).await.is_err());
        assert_eq!(table.guards().await.len(), 3);
    }
}
