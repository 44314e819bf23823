//! # Skip Graph Node
//!
//! [`SkipNode`] is the protocol core: it owns the node's [`NeighborTable`] and
//! implements insertion, greedy search (plain, closest and authenticated) and
//! the guard side of transcript attestation. It reaches peers only through a
//! [`SkipNodeRpc`] implementation, so the same code runs over QUIC and over the
//! in-memory network used by the tests below.
//!
//! ## Routing core
//!
//! At level `L` a node compares the target with its own numID and with its
//! level-`L` neighbor in the target's direction. If that neighbor does not
//! overshoot the target the request is forwarded to it, still at level `L`.
//! Otherwise the node descends one level. A request never climbs. The three
//! search flavours differ only in what happens when level 0 is exhausted:
//!
//! | flavour | exhausted at level 0 |
//! |---------|----------------------|
//! | exact | `NotFound` |
//! | closest | the current node is the answer |
//! | authenticated | `NotFound` |
//!
//! ## Insertion
//!
//! 1. Route `RouteClosest(own numID)` through the entry node; the answer and
//!    its level-0 neighbor on the other side bracket the joiner.
//! 2. Link level 0, then for each higher level ask the current left and right
//!    neighbors to `FindLadder` the nearest node carrying one more bit of the
//!    joiner's nameID.
//! 3. Each level is linked locally first and then on the peers with a
//!    compare-and-set `UpdateNeighbor`, so a search never follows a link the
//!    joiner does not know about yet.
//!
//! Any failure aborts with `PartialJoin` at the level being linked. Levels
//! below stay linked; running `join` again converges.

use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::config::{GuardPolicy, SkipGraphConfig};
use crate::crypto::PublicParameters;
use crate::error::{SkipGraphError, SkipGraphResult};
use crate::identity::{Direction, Level, NodeInfo, NumId};
use crate::issuer::Registration;
use crate::messages::{MAX_TRANSCRIPT_HOPS, NodeStatus};
use crate::protocols::SkipNodeRpc;
use crate::topology::{NeighborTable, NeighborUpdate};
use crate::transcript::{GuardSignature, RoutingTranscript, SignedTranscript};

/// Summary of a completed insertion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JoinReport {
    /// Number of levels, counted from 0, at which at least one link exists.
    pub levels_linked: usize,
}

enum Step {
    Arrived { level: Level },
    Forward {
        level: Level,
        direction: Direction,
        next: NodeInfo,
    },
    Exhausted,
}

fn overshoots(direction: Direction, candidate: NumId, target: NumId) -> bool {
    match direction {
        Direction::Left => candidate < target,
        Direction::Right => candidate > target,
    }
}

struct SkipNodeInner {
    registration: Registration,
    config: SkipGraphConfig,
    table: NeighborTable,
}

pub struct SkipNode<N: SkipNodeRpc> {
    inner: Arc<SkipNodeInner>,
    network: Arc<N>,
}

impl<N: SkipNodeRpc> Clone for SkipNode<N> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            network: self.network.clone(),
        }
    }
}

impl<N: SkipNodeRpc> SkipNode<N> {
    pub fn new(registration: Registration, config: SkipGraphConfig, network: N) -> Self {
        let table = NeighborTable::new(registration.node.clone());
        Self {
            inner: Arc::new(SkipNodeInner {
                registration,
                config,
                table,
            }),
            network: Arc::new(network),
        }
    }

    pub fn info(&self) -> &NodeInfo {
        &self.inner.registration.node
    }

    pub fn registration(&self) -> &Registration {
        &self.inner.registration
    }

    pub fn public_parameters(&self) -> &PublicParameters {
        &self.inner.registration.public_parameters
    }

    pub fn config(&self) -> &SkipGraphConfig {
        &self.inner.config
    }

    pub fn table(&self) -> &NeighborTable {
        &self.inner.table
    }

    pub async fn status(&self) -> NodeStatus {
        NodeStatus {
            node: self.info().clone(),
            levels: self.table().snapshot().await,
            guards: self.table().guards().await,
        }
    }

    // ------------------------------------------------------------------
    // Routing core
    // ------------------------------------------------------------------

    async fn route_step(&self, target: NumId, level: Option<Level>) -> SkipGraphResult<Step> {
        let top = self.table().highest_populated_level().await.unwrap_or(0);
        let start = level.map_or(top, |requested| requested.min(top));

        let Some(direction) = Direction::towards(self.info().num_id, target) else {
            return Ok(Step::Arrived { level: start });
        };

        for level in (0..=start).rev() {
            if let Some(next) = self.table().get(level, direction).await?
                && !overshoots(direction, next.num_id, target)
            {
                return Ok(Step::Forward {
                    level,
                    direction,
                    next,
                });
            }
        }
        Ok(Step::Exhausted)
    }

    /// `SearchByNumID(target)` started at this node.
    pub async fn search_by_num_id(&self, target: NumId) -> SkipGraphResult<NodeInfo> {
        let result = self.handle_route_search(target, None).await;
        match &result {
            Ok(found) => debug!(target, found = %found, "search completed"),
            Err(e) => debug!(target, error = %e, "search failed"),
        }
        result
    }

    /// `AuthenticatedSearchByNumID(target)` started at this node. The returned
    /// transcript has already been verified against the issuer's parameters,
    /// including that its first hop is this node.
    pub async fn authenticated_search_by_num_id(
        &self,
        target: NumId,
    ) -> SkipGraphResult<(NodeInfo, SignedTranscript)> {
        let (result, signed) = self
            .handle_route_auth_search(target, None, RoutingTranscript::new(target))
            .await?;
        if let Err(e) = signed.verify_from(self.public_parameters(), self.info(), &result) {
            warn!(target, result = %result, error = %e, "untrusted search result");
            return Err(e);
        }
        debug!(
            target,
            hops = signed.transcript().len(),
            guards = signed.guard_signatures().len(),
            "authenticated search completed"
        );
        Ok((result, signed))
    }

    pub async fn handle_route_search(
        &self,
        target: NumId,
        level: Option<Level>,
    ) -> SkipGraphResult<NodeInfo> {
        match self.route_step(target, level).await? {
            Step::Arrived { .. } => Ok(self.info().clone()),
            Step::Forward {
                level,
                direction,
                next,
            } => {
                trace!(target, level, %direction, next = next.num_id, "forwarding search");
                self.network.route_search(&next, target, Some(level)).await
            }
            Step::Exhausted => Err(SkipGraphError::NotFound { target }),
        }
    }

    pub async fn handle_route_closest(
        &self,
        target: NumId,
        level: Option<Level>,
    ) -> SkipGraphResult<NodeInfo> {
        match self.route_step(target, level).await? {
            Step::Arrived { .. } | Step::Exhausted => Ok(self.info().clone()),
            Step::Forward { level, next, .. } => {
                self.network.route_closest(&next, target, Some(level)).await
            }
        }
    }

    pub async fn handle_route_auth_search(
        &self,
        target: NumId,
        level: Option<Level>,
        mut transcript: RoutingTranscript,
    ) -> SkipGraphResult<(NodeInfo, SignedTranscript)> {
        if transcript.target != target {
            return Err(SkipGraphError::InvalidRequest(format!(
                "transcript is for target {} but request is for {target}",
                transcript.target
            )));
        }
        if transcript.len() >= MAX_TRANSCRIPT_HOPS {
            return Err(SkipGraphError::InvalidTranscript(format!(
                "transcript exceeds {MAX_TRANSCRIPT_HOPS} hops"
            )));
        }

        let key = &self.inner.registration.private_key;
        match self.route_step(target, level).await? {
            Step::Arrived { level } => {
                transcript.record_hop(self.info(), level, None, key);
                let signed = self.collect_guard_signatures(transcript).await?;
                Ok((self.info().clone(), signed))
            }
            Step::Forward {
                level,
                direction,
                next,
            } => {
                transcript.record_hop(self.info(), level, Some(direction), key);
                trace!(
                    target,
                    level,
                    %direction,
                    next = next.num_id,
                    hops = transcript.len(),
                    "forwarding authenticated search"
                );
                self.network
                    .route_authenticated_search(&next, target, Some(level), transcript)
                    .await
            }
            Step::Exhausted => Err(SkipGraphError::NotFound { target }),
        }
    }

    async fn collect_guard_signatures(
        &self,
        transcript: RoutingTranscript,
    ) -> SkipGraphResult<SignedTranscript> {
        let guards = self.table().guards().await;
        if guards.is_empty() {
            return Err(SkipGraphError::NoGuard {
                num_id: self.info().num_id,
            });
        }

        let mut signatures = Vec::with_capacity(guards.len());
        for guard in &guards {
            let signature = self
                .network
                .get_guard_signature(guard, self.info(), &transcript)
                .await?;
            if !signature.guard.same_node(guard) {
                return Err(SkipGraphError::InvalidTranscript(format!(
                    "guard {} answered as {}",
                    guard.num_id, signature.guard.num_id
                )));
            }
            signatures.push(signature);
        }
        Ok(SignedTranscript::new(transcript, signatures))
    }

    // ------------------------------------------------------------------
    // Neighbor queries
    // ------------------------------------------------------------------

    pub async fn handle_get_neighbor(
        &self,
        level: Level,
        direction: Direction,
    ) -> SkipGraphResult<Option<NodeInfo>> {
        self.table().get(level, direction).await
    }

    pub async fn handle_find_ladder(
        &self,
        level: Level,
        direction: Direction,
        prefix: &str,
    ) -> SkipGraphResult<Option<NodeInfo>> {
        if self.info().name_id.has_prefix(prefix) {
            return Ok(Some(self.info().clone()));
        }
        match self.table().get(level, direction).await? {
            Some(next) => self.network.find_ladder(&next, level, direction, prefix).await,
            None => Ok(None),
        }
    }

    pub async fn handle_update_neighbor(
        &self,
        level: Level,
        direction: Direction,
        node: Option<NodeInfo>,
        expected: Option<NumId>,
    ) -> SkipGraphResult<()> {
        let proposed = node.as_ref().map(|n| n.num_id);
        match self
            .table()
            .compare_and_set(level, direction, expected, node)
            .await?
        {
            NeighborUpdate::Applied => {
                debug!(
                    num_id = self.info().num_id,
                    level,
                    %direction,
                    neighbor = ?proposed,
                    "neighbor updated"
                );
                Ok(())
            }
            NeighborUpdate::Unchanged => Ok(()),
            NeighborUpdate::Conflict { current } => {
                let current = current.map(|n| n.num_id);
                warn!(
                    num_id = self.info().num_id,
                    level,
                    %direction,
                    ?expected,
                    ?current,
                    "rejecting conflicting neighbor update"
                );
                Err(SkipGraphError::InvalidRequest(format!(
                    "conflicting update at level {level} {direction}: expected {expected:?}, slot holds {current:?}"
                )))
            }
        }
    }

    // ------------------------------------------------------------------
    // Insertion
    // ------------------------------------------------------------------

    /// Inserts this node through `entry`. Without an entry (or with itself as
    /// entry) the node is the first member and stands alone.
    pub async fn join(&self, entry: Option<&NodeInfo>) -> SkipGraphResult<JoinReport> {
        let me = self.info().clone();
        let Some(entry) = entry.filter(|e| !e.same_node(&me)) else {
            info!(num_id = me.num_id, name_id = %me.name_id, "no entry point, starting a new overlay");
            return Ok(JoinReport { levels_linked: 0 });
        };

        let (mut left, mut right) = self
            .level_zero_neighbors(entry)
            .await
            .map_err(|e| SkipGraphError::partial_join(0, e))?;
        self.link_level(0, &left, &right)
            .await
            .map_err(|e| SkipGraphError::partial_join(0, e))?;
        let mut levels_linked = usize::from(left.is_some() || right.is_some());

        for level in 0..me.max_level() {
            let next = level + 1;
            let prefix = me.name_id.prefix(next).to_string();
            let (next_left, next_right) = self
                .climb(level, &left, &right, &prefix)
                .await
                .map_err(|e| SkipGraphError::partial_join(next, e))?;
            if next_left.is_none() && next_right.is_none() {
                break;
            }
            self.link_level(next, &next_left, &next_right)
                .await
                .map_err(|e| SkipGraphError::partial_join(next, e))?;
            levels_linked = next + 1;
            left = next_left;
            right = next_right;
        }

        info!(
            num_id = me.num_id,
            name_id = %me.name_id,
            entry = entry.num_id,
            levels_linked,
            "joined skip graph"
        );
        Ok(JoinReport { levels_linked })
    }

    async fn level_zero_neighbors(
        &self,
        entry: &NodeInfo,
    ) -> SkipGraphResult<(Option<NodeInfo>, Option<NodeInfo>)> {
        let me = self.info();
        let anchor = self.network.route_closest(entry, me.num_id, None).await?;

        // A retry after a partial join can route straight back to us.
        if anchor.same_node(me) {
            return Ok((
                self.table().get(0, Direction::Left).await?,
                self.table().get(0, Direction::Right).await?,
            ));
        }

        let side = if anchor.num_id < me.num_id {
            Direction::Left
        } else {
            Direction::Right
        };
        let other = side.opposite();
        let across = match self.network.get_neighbor(&anchor, 0, other).await? {
            Some(n) if n.same_node(me) => self.table().get(0, other).await?,
            found => found,
        };
        Ok(match side {
            Direction::Left => (Some(anchor), across),
            Direction::Right => (across, Some(anchor)),
        })
    }

    async fn climb(
        &self,
        level: Level,
        left: &Option<NodeInfo>,
        right: &Option<NodeInfo>,
        prefix: &str,
    ) -> SkipGraphResult<(Option<NodeInfo>, Option<NodeInfo>)> {
        let next_left = match left {
            Some(l) => self.network.find_ladder(l, level, Direction::Left, prefix).await?,
            None => None,
        };
        let next_right = match right {
            Some(r) => self.network.find_ladder(r, level, Direction::Right, prefix).await?,
            None => None,
        };
        Ok((next_left, next_right))
    }

    async fn link_level(
        &self,
        level: Level,
        left: &Option<NodeInfo>,
        right: &Option<NodeInfo>,
    ) -> SkipGraphResult<()> {
        let me = self.info();
        self.table().set(level, Direction::Left, left.clone()).await?;
        self.table().set(level, Direction::Right, right.clone()).await?;

        if let Some(l) = left {
            self.network
                .update_neighbor(
                    l,
                    level,
                    Direction::Right,
                    Some(me.clone()),
                    right.as_ref().map(|r| r.num_id),
                )
                .await?;
        }
        if let Some(r) = right {
            self.network
                .update_neighbor(
                    r,
                    level,
                    Direction::Left,
                    Some(me.clone()),
                    left.as_ref().map(|l| l.num_id),
                )
                .await?;
        }
        trace!(
            num_id = me.num_id,
            level,
            left = ?left.as_ref().map(|n| n.num_id),
            right = ?right.as_ref().map(|n| n.num_id),
            "linked level"
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Guards
    // ------------------------------------------------------------------

    async fn select_guards(&self, exclude: Option<&NodeInfo>) -> SkipGraphResult<Vec<NodeInfo>> {
        let allowed = |n: &NodeInfo| exclude.is_none_or(|x| !x.same_node(n));
        let mut chosen: Vec<NodeInfo> = Vec::new();
        match self.config().guard_policy {
            GuardPolicy::Single => {
                for direction in [Direction::Right, Direction::Left] {
                    if let Some(n) = self.table().get(0, direction).await?
                        && allowed(&n)
                    {
                        chosen.push(n);
                        break;
                    }
                }
            }
            GuardPolicy::EveryLevel => {
                let top = self.table().highest_populated_level().await.unwrap_or(0);
                for level in 0..=top {
                    for direction in [Direction::Right, Direction::Left] {
                        if let Some(n) = self.table().get(level, direction).await?
                            && allowed(&n)
                            && !chosen.iter().any(|c| c.same_node(&n))
                        {
                            chosen.push(n);
                            break;
                        }
                    }
                }
            }
        }
        Ok(chosen)
    }

    async fn install_guards(&self, exclude: Option<&NodeInfo>) -> SkipGraphResult<Vec<NodeInfo>> {
        let guards = self.select_guards(exclude).await?;
        if guards.is_empty() {
            return Err(SkipGraphError::NoGuard {
                num_id: self.info().num_id,
            });
        }
        // Overwrite in place and trim afterwards, so the old list keeps
        // answering until the new one is complete.
        let previous = self.table().guards().await;
        for (position, guard) in guards.iter().enumerate() {
            if let Err(e) = self
                .network
                .set_guard_neighbor(self.info(), position, guard)
                .await
            {
                warn!(
                    num_id = self.info().num_id,
                    position,
                    guard = guard.num_id,
                    error = %e,
                    "guard installation failed, keeping previous guards"
                );
                self.table().replace_guards(previous).await;
                return Err(e);
            }
        }
        self.table().truncate_guards(guards.len()).await;
        info!(
            num_id = self.info().num_id,
            policy = ?self.config().guard_policy,
            guards = ?guards.iter().map(|g| g.num_id).collect::<Vec<_>>(),
            "guards assigned"
        );
        Ok(guards)
    }

    /// Picks guards among the current neighbors according to the configured
    /// [`GuardPolicy`] and installs them through a `SetGuardNeighbor` request
    /// to this node itself.
    pub async fn initialize_guards(&self) -> SkipGraphResult<Vec<NodeInfo>> {
        self.install_guards(None).await
    }

    /// Re-runs guard selection without `unreachable`.
    pub async fn reassign_guards(&self, unreachable: &NodeInfo) -> SkipGraphResult<Vec<NodeInfo>> {
        warn!(
            num_id = self.info().num_id,
            guard = unreachable.num_id,
            "reassigning guards"
        );
        self.install_guards(Some(unreachable)).await
    }

    pub async fn handle_set_guard_neighbor(
        &self,
        position: usize,
        neighbor: NodeInfo,
    ) -> SkipGraphResult<()> {
        let is_neighbor = self.table().snapshot().await.iter().any(|level| {
            level.left.as_ref() == Some(&neighbor) || level.right.as_ref() == Some(&neighbor)
        });
        if !is_neighbor {
            return Err(SkipGraphError::InvalidRequest(format!(
                "{} is not a neighbor of {}",
                neighbor.num_id,
                self.info().num_id
            )));
        }
        self.table().set_guard(position, neighbor).await
    }

    /// Guard side of `GetGuardSignature`: signs only a transcript that ends at
    /// `requester`, targets `requester` and carries valid step signatures.
    pub async fn handle_get_guard_signature(
        &self,
        requester: &NodeInfo,
        transcript: &RoutingTranscript,
    ) -> SkipGraphResult<GuardSignature> {
        let terminal = transcript.terminal().map(|hop| &hop.node);
        if terminal != Some(requester) {
            warn!(
                guard = self.info().num_id,
                requester = requester.num_id,
                terminal = ?terminal.map(|n| n.num_id),
                "refusing to sign: transcript does not end at requester"
            );
            return Err(SkipGraphError::GuardMismatch {
                requester: requester.num_id,
                terminal: terminal.map(|n| n.num_id),
            });
        }
        if requester.same_node(self.info()) {
            return Err(SkipGraphError::InvalidRequest("a node cannot guard itself".into()));
        }
        if transcript.target != requester.num_id {
            return Err(SkipGraphError::InvalidTranscript(format!(
                "transcript targets {} but ends at {}",
                transcript.target, requester.num_id
            )));
        }
        transcript.verify_steps(self.public_parameters())?;

        trace!(
            guard = self.info().num_id,
            requester = requester.num_id,
            hops = transcript.len(),
            "signing transcript"
        );
        Ok(GuardSignature::sign(
            self.info(),
            &self.inner.registration.private_key,
            transcript,
        ))
    }
}
