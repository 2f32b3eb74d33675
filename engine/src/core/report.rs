//! JSON summaries written at the end of a tier and of the experiment.

use serde::{Deserialize, Serialize};

use crate::core::selection::{Selection, SubtestSummary, TieBreak, frontier_cost_of_pass};
use crate::core::tier::TierId;

/// `tier_result.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierResult {
    pub tier: TierId,
    pub best_subtest: String,
    pub tie_breaker: Option<TieBreak>,
    pub pass_rate: f64,
    pub mean_score: f64,
    pub mean_cost_usd: f64,
    pub cost_of_pass: Option<f64>,
    pub subtests: Vec<SubtestSummary>,
}

impl TierResult {
    /// `None` when `selection` names a subtest missing from `summaries`.
    pub fn new(tier: TierId, selection: &Selection, summaries: Vec<SubtestSummary>) -> Option<Self> {
        let best = summaries
            .iter()
            .find(|summary| summary.subtest == selection.subtest)?
            .clone();
        Some(Self {
            tier,
            best_subtest: best.subtest.clone(),
            tie_breaker: selection.tie_breaker,
            pass_rate: best.pass_rate,
            mean_score: best.mean_score,
            mean_cost_usd: best.mean_cost_usd,
            cost_of_pass: best.cost_of_pass(),
            subtests: summaries,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierLine {
    pub tier: TierId,
    pub best_subtest: String,
    pub pass_rate: f64,
    pub mean_cost_usd: f64,
    pub cost_of_pass: Option<f64>,
}

/// `summary.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentSummary {
    pub experiment_id: String,
    pub tiers: Vec<TierLine>,
    /// Cheapest cost-of-pass across tiers.
    pub frontier_cost_of_pass: Option<f64>,
    pub frontier_tier: Option<TierId>,
}

impl ExperimentSummary {
    pub fn new(experiment_id: &str, results: &[TierResult]) -> Self {
        let tiers: Vec<TierLine> = results
            .iter()
            .map(|result| TierLine {
                tier: result.tier,
                best_subtest: result.best_subtest.clone(),
                pass_rate: result.pass_rate,
                mean_cost_usd: result.mean_cost_usd,
                cost_of_pass: result.cost_of_pass,
            })
            .collect();
        let frontier = frontier_cost_of_pass(tiers.iter().map(|line| line.cost_of_pass));
        let frontier_tier = frontier.and_then(|best| {
            tiers
                .iter()
                .find(|line| line.cost_of_pass == Some(best))
                .map(|line| line.tier)
        });
        Self {
            experiment_id: experiment_id.to_string(),
            tiers,
            frontier_cost_of_pass: frontier,
            frontier_tier,
        }
    }
}
