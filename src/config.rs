//! Runtime configuration.
//!
//! [`SystemParameters`] are fixed by the issuer and handed to every node at
//! registration. [`SkipGraphConfig`] is local to a node.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{SkipGraphError, SkipGraphResult};

/// Default number of identifiers the issuer may hand out.
pub const DEFAULT_SYSTEM_CAPACITY: u64 = 1024;

/// Default number of experiment rounds a node runs when asked.
pub const DEFAULT_ROUND_COUNT: u32 = 10;

/// Default upper bound, in seconds, of the random pause between rounds.
pub const DEFAULT_WAIT_TIME_SECS: u64 = 0;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemParameters {
    /// Maximum number of concurrently registered identifiers.
    pub capacity: u64,
    /// Width of every nameID. `2^name_id_bits >= capacity`.
    pub name_id_bits: usize,
    pub round_count: u32,
    pub wait_time_secs: u64,
}

impl SystemParameters {
    pub fn with_capacity(capacity: u64) -> SkipGraphResult<Self> {
        let params = Self {
            capacity,
            name_id_bits: name_bits_for(capacity),
            round_count: DEFAULT_ROUND_COUNT,
            wait_time_secs: DEFAULT_WAIT_TIME_SECS,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> SkipGraphResult<()> {
        if self.capacity == 0 {
            return Err(SkipGraphError::InvalidRequest("capacity must be positive".into()));
        }
        if self.name_id_bits == 0 || self.name_id_bits > 63 {
            return Err(SkipGraphError::InvalidRequest(format!(
                "name id width {} outside 1..=63",
                self.name_id_bits
            )));
        }
        if (1u64 << self.name_id_bits) < self.capacity {
            return Err(SkipGraphError::InvalidRequest(format!(
                "{} name id bits cannot label {} nodes",
                self.name_id_bits, self.capacity
            )));
        }
        Ok(())
    }
}

impl Default for SystemParameters {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_SYSTEM_CAPACITY,
            name_id_bits: name_bits_for(DEFAULT_SYSTEM_CAPACITY),
            round_count: DEFAULT_ROUND_COUNT,
            wait_time_secs: DEFAULT_WAIT_TIME_SECS,
        }
    }
}

/// Smallest width able to label `capacity` distinct nodes (at least 1).
pub fn name_bits_for(capacity: u64) -> usize {
    let bits = u64::BITS - capacity.saturating_sub(1).leading_zeros();
    (bits as usize).max(1)
}

/// Which neighbors attest transcripts terminating at a node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum GuardPolicy {
    /// One guard: the level-0 right neighbor, else the level-0 left neighbor.
    #[default]
    Single,
    /// One distinct guard per populated level. All of them must sign.
    EveryLevel,
}

#[derive(Clone, Debug)]
pub struct SkipGraphConfig {
    pub guard_policy: GuardPolicy,
    /// Upper bound on a single outbound request, including every hop it
    /// triggers downstream.
    pub rpc_timeout: Duration,
    /// Upper bound on handling one inbound request.
    pub request_timeout: Duration,
}

impl Default for SkipGraphConfig {
    fn default() -> Self {
        Self {
            guard_policy: GuardPolicy::Single,
            rpc_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
        }
    }
}
