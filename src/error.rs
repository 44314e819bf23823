//! # Error Types
//!
//! Every protocol operation returns a [`SkipGraphError`]. The enum is
//! serializable so that a failure raised several hops away (for example a
//! `NotFound` decided by the terminal node of a search) reaches the
//! originator with its kind intact instead of collapsing into a string.
//!
//! Transport problems (unreachable peer, timeout, malformed frame) are
//! reported as [`SkipGraphError::RoutingFailure`]; the core never retries on
//! its own.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::NumId;

pub type SkipGraphResult<T> = std::result::Result<T, SkipGraphError>;

/// Why the issuer refused a registration.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum RegistrationError {
    #[error("system capacity of {capacity} identifiers is exhausted")]
    CapacityExhausted { capacity: u64 },

    #[error("address {address} is already registered")]
    AlreadyRegistered { address: String },

    #[error("identifier already assigned: {0}")]
    IdentifierTaken(String),

    #[error("no registration for numerical id {num_id}")]
    UnknownNode { num_id: NumId },

    #[error("numerical id {num_id} is not registered to {address}")]
    NotOwner { num_id: NumId, address: String },

    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum SkipGraphError {
    #[error("registration failed: {0}")]
    Registration(#[from] RegistrationError),

    #[error("routing failure: {0}")]
    RoutingFailure(String),

    #[error("no node holds numerical id {target}")]
    NotFound { target: NumId },

    #[error("join aborted at level {level}: {reason}")]
    PartialJoin { level: usize, reason: String },

    #[error("guard mismatch: transcript terminates at {terminal:?}, requester is {requester}")]
    GuardMismatch {
        requester: NumId,
        terminal: Option<NumId>,
    },

    #[error("invalid routing transcript: {0}")]
    InvalidTranscript(String),

    #[error("node {num_id} has no designated guard")]
    NoGuard { num_id: NumId },

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl SkipGraphError {
    pub fn routing(err: impl std::fmt::Display) -> Self {
        SkipGraphError::RoutingFailure(err.to_string())
    }

    /// Wraps a failure that happened while linking `level` during insertion.
    /// Errors that already describe a partial join keep their original level.
    pub fn partial_join(level: usize, err: SkipGraphError) -> Self {
        match err {
            SkipGraphError::PartialJoin { .. } => err,
            other => SkipGraphError::PartialJoin {
                level,
                reason: other.to_string(),
            },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SkipGraphError::NotFound { .. })
    }
}

impl From<anyhow::Error> for SkipGraphError {
    fn from(err: anyhow::Error) -> Self {
        SkipGraphError::RoutingFailure(format!("{err:#}"))
    }
}
