//! # Wire Protocol Messages
//!
//! Every request is one variant of the closed [`RpcRequest`] sum type and is
//! matched exhaustively by the handler in [`crate::rpc`]. Messages are bincode
//! encoded with fixed-width integers; decoding is always size bounded.
//!
//! | Service | Request | Response |
//! |---------|---------|----------|
//! | Issuer | [`IssuerRequest`] | [`IssuerResponse`] |
//! | Skip node | [`SkipNodeRequest`] | [`SkipNodeResponse`] |
//!
//! Failures travel as [`RpcResponse::Error`] carrying the typed
//! [`SkipGraphError`], so a `NotFound` decided three hops away reaches the
//! originator as `NotFound`.

use bincode::Options;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::SkipGraphError;
use crate::identity::{Direction, Level, NodeInfo, NumId};
use crate::issuer::Registration;
use crate::topology::LevelSnapshot;
use crate::transcript::{GuardSignature, RoutingTranscript, SignedTranscript};

/// Upper bound on a single request frame.
pub const MAX_REQUEST_SIZE: usize = 256 * 1024;

/// Upper bound on a single response frame.
pub const MAX_RESPONSE_SIZE: usize = 1024 * 1024;

/// Maximum number of hops an authenticated search may accumulate. A search
/// visits at most a few nodes per level, so this is far above any honest path.
pub const MAX_TRANSCRIPT_HOPS: usize = 512;

const MAX_DESERIALIZE_SIZE: u64 = MAX_RESPONSE_SIZE as u64 + 4096;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum IssuerRequest {
    /// Admit the caller. Its address is the one the transport observed.
    Register,
    /// Release the caller's identifiers. Only the registered address may ask.
    Deregister { num_id: NumId },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum IssuerResponse {
    Registered(Box<Registration>),
    Deregistered,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum SkipNodeRequest {
    GetInfo,
    /// `GetLeftNode` / `GetRightNode`.
    GetNeighbor {
        level: Level,
        direction: Direction,
    },
    /// Walk `direction` along `level` until a node carrying `prefix` is found.
    FindLadder {
        level: Level,
        direction: Direction,
        prefix: String,
    },
    /// Exact lookup. `level: None` starts at the receiver's highest level.
    RouteSearchByNumId {
        target: NumId,
        level: Option<Level>,
    },
    /// Same routing core, but ends at the node closest to `target` instead of
    /// failing. Used to place a joining node at level 0.
    RouteClosest {
        target: NumId,
        level: Option<Level>,
    },
    RouteAuthSearchByNumId {
        target: NumId,
        level: Option<Level>,
        transcript: RoutingTranscript,
    },
    /// Conditional splice issued by a joining node.
    UpdateNeighbor {
        level: Level,
        direction: Direction,
        node: Option<NodeInfo>,
        expected: Option<NumId>,
    },
    SetGuardNeighbor {
        position: usize,
        neighbor: NodeInfo,
    },
    GetGuardSignature {
        requester: NodeInfo,
        transcript: RoutingTranscript,
    },
}

impl SkipNodeRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            SkipNodeRequest::GetInfo => "GetInfo",
            SkipNodeRequest::GetNeighbor { .. } => "GetNeighbor",
            SkipNodeRequest::FindLadder { .. } => "FindLadder",
            SkipNodeRequest::RouteSearchByNumId { .. } => "RouteSearchByNumId",
            SkipNodeRequest::RouteClosest { .. } => "RouteClosest",
            SkipNodeRequest::RouteAuthSearchByNumId { .. } => "RouteAuthSearchByNumId",
            SkipNodeRequest::UpdateNeighbor { .. } => "UpdateNeighbor",
            SkipNodeRequest::SetGuardNeighbor { .. } => "SetGuardNeighbor",
            SkipNodeRequest::GetGuardSignature { .. } => "GetGuardSignature",
        }
    }
}

/// Everything `GetInfo` reports about a node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node: NodeInfo,
    pub levels: Vec<LevelSnapshot>,
    pub guards: Vec<NodeInfo>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum SkipNodeResponse {
    Ack,
    Info(NodeStatus),
    Neighbor(Option<NodeInfo>),
    Found(NodeInfo),
    Authenticated {
        result: NodeInfo,
        transcript: SignedTranscript,
    },
    GuardSignature(GuardSignature),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RpcRequest {
    Issuer(IssuerRequest),
    SkipNode(SkipNodeRequest),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RpcResponse {
    Issuer(IssuerResponse),
    SkipNode(SkipNodeResponse),
    Error(SkipGraphError),
}
