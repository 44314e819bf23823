//! Protocol trait definitions for the skip graph's networking layer.
//!
//! The routing core in [`crate::skipnode`] and the node facade only speak
//! these traits. [`crate::rpc::RpcNode`] implements them over QUIC; unit tests
//! implement them over an in-memory registry.
//!
//! | Protocol | Trait | Purpose |
//! |----------|-------|---------|
//! | Skip graph | [`SkipNodeRpc`] | neighbor queries, routing, guard attestation |
//! | Issuer | [`IssuerRpc`] | admission and release of identifiers |

use async_trait::async_trait;

use crate::error::SkipGraphResult;
use crate::identity::{Direction, Level, NodeInfo, NumId};
use crate::issuer::Registration;
use crate::transcript::{GuardSignature, RoutingTranscript, SignedTranscript};

#[async_trait]
pub trait SkipNodeRpc: Send + Sync + 'static {
    async fn get_neighbor(
        &self,
        to: &NodeInfo,
        level: Level,
        direction: Direction,
    ) -> SkipGraphResult<Option<NodeInfo>>;

    /// Nearest node at or beyond `to`, walking `direction` along `level`,
    /// whose nameID starts with `prefix`.
    async fn find_ladder(
        &self,
        to: &NodeInfo,
        level: Level,
        direction: Direction,
        prefix: &str,
    ) -> SkipGraphResult<Option<NodeInfo>>;

    async fn route_search(
        &self,
        to: &NodeInfo,
        target: NumId,
        level: Option<Level>,
    ) -> SkipGraphResult<NodeInfo>;

    async fn route_closest(
        &self,
        to: &NodeInfo,
        target: NumId,
        level: Option<Level>,
    ) -> SkipGraphResult<NodeInfo>;

    async fn route_authenticated_search(
        &self,
        to: &NodeInfo,
        target: NumId,
        level: Option<Level>,
        transcript: RoutingTranscript,
    ) -> SkipGraphResult<(NodeInfo, SignedTranscript)>;

    /// Sets `to`'s `(level, direction)` slot to `node` if it currently holds
    /// `expected`. A conflicting slot is an error.
    async fn update_neighbor(
        &self,
        to: &NodeInfo,
        level: Level,
        direction: Direction,
        node: Option<NodeInfo>,
        expected: Option<NumId>,
    ) -> SkipGraphResult<()>;

    async fn set_guard_neighbor(
        &self,
        to: &NodeInfo,
        position: usize,
        neighbor: &NodeInfo,
    ) -> SkipGraphResult<()>;

    async fn get_guard_signature(
        &self,
        guard: &NodeInfo,
        requester: &NodeInfo,
        transcript: &RoutingTranscript,
    ) -> SkipGraphResult<GuardSignature>;
}

#[async_trait]
pub trait IssuerRpc: Send + Sync + 'static {
    async fn register(&self, issuer: &str) -> SkipGraphResult<Registration>;

    async fn deregister(&self, issuer: &str, num_id: NumId) -> SkipGraphResult<()>;
}
