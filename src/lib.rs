//! # Skipguard - Authenticated Skip Graph Overlay
//!
//! Skipguard is a peer-to-peer skip graph in which lookups can be audited:
//!
//! - **Issuer**: trusted authority assigning numerical and name identifiers
//!   and identity-bound signing keys
//! - **Topology**: per-level left/right neighbor tables with per-slot locking
//! - **Join**: level-0 placement followed by ladder climbing, spliced with
//!   conditional neighbor updates
//! - **Search**: greedy routing by numerical identifier, plain or
//!   transcript-producing
//! - **Guards**: neighbors that countersign transcripts terminating at a node
//!
//! ## Architecture
//!
//! - [`SkipNode`] is the protocol core. It only talks to peers through the
//!   [`SkipNodeRpc`] trait, so the same routing code runs over QUIC and over
//!   in-memory test networks
//! - The QUIC layer keeps a connection cache owned by an actor task and
//!   answers one request per bidirectional stream
//! - Every request kind is a variant of one closed enum, matched exhaustively
//!
//! ## Security Model
//!
//! - Each visited node step-signs its hop of an authenticated search
//! - The terminal node's guards check the transcript before signing it
//! - A transcript verifies only under the issuer's public parameters
//! - Connections use TLS with throwaway Ed25519 certificates; trust in routing
//!   comes from transcripts, not from transport identities
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | High-level API: issuer host and overlay member |
//! | `issuer` | Identifier allocation and key issuance |
//! | `identity` | NumId, NameId, NodeInfo, Direction |
//! | `crypto` | Identity-bound signatures, TLS configuration |
//! | `topology` | Neighbor table and guard assignments |
//! | `transcript` | Routing transcripts and guard signatures |
//! | `skipnode` | Join, search and guard protocol |
//! | `experiment` | Randomised search rounds for measurements |
//! | `protocols` | Protocol trait definitions (SkipNodeRpc, IssuerRpc) |
//! | `rpc` | QUIC-based RPC layer implementing protocols |
//! | `messages` | Serialization types for all wire protocols |
//! | `config` | System parameters and node configuration |
//! | `error` | Typed protocol errors |

mod config;
mod crypto;
mod error;
mod experiment;
mod identity;
mod issuer;
mod messages;
mod node;
mod protocols;
mod rpc;
mod skipnode;
mod topology;
mod transcript;

pub use config::{GuardPolicy, SkipGraphConfig, SystemParameters};
pub use crypto::{IdentitySignature, PrivateKey, PublicParameters};
pub use error::{RegistrationError, SkipGraphError, SkipGraphResult};
pub use experiment::{
    ExperimentPlan, ExperimentReport, RoundOutcome, RoundRecord, Searcher, run_experiment,
};
pub use identity::{Direction, Level, NameId, NodeInfo, NumId};
pub use issuer::{Issuer, Registration};
pub use messages::NodeStatus;
pub use node::{IssuerNode, Node};
pub use protocols::{IssuerRpc, SkipNodeRpc};
pub use rpc::RpcNode;
pub use skipnode::{JoinReport, SkipNode};
pub use topology::{LevelSnapshot, NeighborTable, NeighborUpdate};
pub use transcript::{GuardSignature, Hop, RoutingTranscript, SignedTranscript};
