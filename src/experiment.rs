//! Search experiments.
//!
//! A round draws a random target, looks it up with a plain search and then
//! with an authenticated search, and compares both answers against the
//! target. Rounds are paced by a random pause that a caller-supplied future
//! can cut short.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use rand::rngs::StdRng;
use tracing::{debug, info, warn};

use crate::config::SystemParameters;
use crate::error::{SkipGraphError, SkipGraphResult};
use crate::identity::{NodeInfo, NumId};
use crate::protocols::SkipNodeRpc;
use crate::skipnode::SkipNode;
use crate::transcript::SignedTranscript;

/// The two lookups an experiment round performs.
#[async_trait]
pub trait Searcher: Send + Sync {
    async fn search(&self, target: NumId) -> SkipGraphResult<NodeInfo>;

    async fn authenticated_search(
        &self,
        target: NumId,
    ) -> SkipGraphResult<(NodeInfo, SignedTranscript)>;
}

#[async_trait]
impl<N: SkipNodeRpc> Searcher for SkipNode<N> {
    async fn search(&self, target: NumId) -> SkipGraphResult<NodeInfo> {
        self.search_by_num_id(target).await
    }

    async fn authenticated_search(
        &self,
        target: NumId,
    ) -> SkipGraphResult<(NodeInfo, SignedTranscript)> {
        self.authenticated_search_by_num_id(target).await
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExperimentPlan {
    pub rounds: u32,
    /// Upper bound of the pause after each round. Zero disables pacing.
    pub max_wait: Duration,
    /// Inclusive target range.
    pub min_num_id: NumId,
    pub max_num_id: NumId,
}

impl ExperimentPlan {
    /// Targets span the whole identifier space of the system.
    pub fn from_parameters(params: &SystemParameters) -> Self {
        Self {
            rounds: params.round_count,
            max_wait: Duration::from_secs(params.wait_time_secs),
            min_num_id: 0,
            max_num_id: params.capacity.saturating_sub(1),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RoundOutcome {
    /// Both searches returned the target.
    Found,
    /// Both searches agreed that no node holds the target.
    Absent,
    /// At least one search returned a node other than the target, or the two
    /// searches disagreed about whether it exists.
    Mismatch {
        plain: Option<NumId>,
        authenticated: Option<NumId>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoundRecord {
    pub round: u32,
    pub target: NumId,
    pub outcome: RoundOutcome,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExperimentReport {
    pub records: Vec<RoundRecord>,
    /// Set when the cancellation future fired before every round ran.
    pub cancelled: bool,
}

impl ExperimentReport {
    pub fn found(&self) -> usize {
        self.count(|outcome| matches!(outcome, RoundOutcome::Found))
    }

    pub fn absent(&self) -> usize {
        self.count(|outcome| matches!(outcome, RoundOutcome::Absent))
    }

    pub fn mismatches(&self) -> usize {
        self.count(|outcome| matches!(outcome, RoundOutcome::Mismatch { .. }))
    }

    fn count(&self, pred: impl Fn(&RoundOutcome) -> bool) -> usize {
        self.records.iter().filter(|r| pred(&r.outcome)).count()
    }
}

/// `NotFound` is an answer, anything else aborts the experiment.
fn lookup_result(result: SkipGraphResult<NumId>) -> SkipGraphResult<Option<NumId>> {
    match result {
        Ok(num_id) => Ok(Some(num_id)),
        Err(SkipGraphError::NotFound { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

fn classify(target: NumId, plain: Option<NumId>, authenticated: Option<NumId>) -> RoundOutcome {
    match (plain, authenticated) {
        (Some(p), Some(a)) if p == target && a == target => RoundOutcome::Found,
        (None, None) => RoundOutcome::Absent,
        _ => RoundOutcome::Mismatch {
            plain,
            authenticated,
        },
    }
}

/// Runs `plan` against `searcher`. Routing failures abort and are returned;
/// rounds completed before the failure are logged but not reported.
pub async fn run_experiment<S, C>(
    searcher: &S,
    plan: &ExperimentPlan,
    rng: &mut StdRng,
    cancel: C,
) -> SkipGraphResult<ExperimentReport>
where
    S: Searcher + ?Sized,
    C: Future<Output = ()>,
{
    if plan.min_num_id > plan.max_num_id {
        return Err(SkipGraphError::InvalidRequest(format!(
            "empty target range {}..={}",
            plan.min_num_id, plan.max_num_id
        )));
    }

    tokio::pin!(cancel);
    let mut report = ExperimentReport::default();
    info!(rounds = plan.rounds, "experiment started");

    for round in 0..plan.rounds {
        let target = rng.gen_range(plan.min_num_id..=plan.max_num_id);
        debug!(round = round + 1, target, "experiment round");

        let plain = lookup_result(searcher.search(target).await.map(|n| n.num_id))?;
        let authenticated = lookup_result(
            searcher
                .authenticated_search(target)
                .await
                .map(|(n, _)| n.num_id),
        )?;

        let outcome = classify(target, plain, authenticated);
        if let RoundOutcome::Mismatch { .. } = &outcome {
            warn!(round = round + 1, target, ?outcome, "search results disagree");
        }
        report.records.push(RoundRecord {
            round,
            target,
            outcome,
        });

        if plan.max_wait.is_zero() || round + 1 == plan.rounds {
            continue;
        }
        let max_ms = plan.max_wait.as_millis().max(1) as u64;
        let pause = Duration::from_millis(rng.gen_range(1..=max_ms));
        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            _ = &mut cancel => {
                info!(completed = report.records.len(), "experiment cancelled");
                report.cancelled = true;
                return Ok(report);
            }
        }
    }

    info!(
        found = report.found(),
        absent = report.absent(),
        mismatches = report.mismatches(),
        "experiment finished"
    );
    Ok(report)
}
