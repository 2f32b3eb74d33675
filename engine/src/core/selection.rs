//! Subtest aggregation and best-subtest selection for a tier.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::core::types::{RunOutcome, RunResult};

/// Aggregate of one subtest's finished runs (`subtest_result.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SubtestSummary {
    pub subtest: String,
    pub runs: u32,
    pub passed: u32,
    pub agent_failures: u32,
    pub pass_rate: f64,
    pub mean_score: f64,
    pub mean_cost_usd: f64,
    pub total_cost_usd: f64,
    pub total_tokens: u64,
}

impl SubtestSummary {
    /// Total spend divided by passing runs; `None` when nothing passed.
    pub fn cost_of_pass(&self) -> Option<f64> {
        cost_of_pass(self.total_cost_usd, self.passed)
    }
}

pub fn summarize_subtest(subtest: &str, results: &[RunResult]) -> SubtestSummary {
    let runs = results.len() as u32;
    if runs == 0 {
        return SubtestSummary {
            subtest: subtest.to_string(),
            ..SubtestSummary::default()
        };
    }
    let passed = results
        .iter()
        .filter(|result| result.outcome() == RunOutcome::Passed)
        .count() as u32;
    let agent_failures = results
        .iter()
        .filter(|result| result.outcome() == RunOutcome::AgentFailed)
        .count() as u32;
    let total_cost_usd: f64 = results.iter().map(|result| result.agent.cost_usd).sum();
    let total_score: f64 = results.iter().map(RunResult::score).sum();
    let total_tokens = results
        .iter()
        .map(|result| result.agent.total_tokens())
        .sum();
    SubtestSummary {
        subtest: subtest.to_string(),
        runs,
        passed,
        agent_failures,
        pass_rate: f64::from(passed) / f64::from(runs),
        mean_score: total_score / f64::from(runs),
        mean_cost_usd: total_cost_usd / f64::from(runs),
        total_cost_usd,
        total_tokens,
    }
}

/// How a close race was decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    LowerCost,
    SubtestId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    pub subtest: String,
    pub tie_breaker: Option<TieBreak>,
}

/// Rank by pass rate, then mean score. When the top two are within `epsilon`
/// on both, prefer lower mean cost, then the lexically smaller id.
pub fn select_best_subtest(summaries: &[SubtestSummary], epsilon: f64) -> Option<Selection> {
    let mut ranked: Vec<&SubtestSummary> = summaries.iter().collect();
    ranked.sort_by(|a, b| {
        b.pass_rate
            .total_cmp(&a.pass_rate)
            .then(b.mean_score.total_cmp(&a.mean_score))
            .then_with(|| a.subtest.cmp(&b.subtest))
    });
    let first = ranked.first()?;
    let Some(second) = ranked.get(1) else {
        return Some(Selection {
            subtest: first.subtest.clone(),
            tie_breaker: None,
        });
    };

    let tied = (first.pass_rate - second.pass_rate).abs() <= epsilon
        && (first.mean_score - second.mean_score).abs() <= epsilon;
    if !tied {
        return Some(Selection {
            subtest: first.subtest.clone(),
            tie_breaker: None,
        });
    }

    let (winner, tie_breaker) = match first.mean_cost_usd.total_cmp(&second.mean_cost_usd) {
        Ordering::Less => (first, TieBreak::LowerCost),
        Ordering::Greater => (second, TieBreak::LowerCost),
        Ordering::Equal => {
            if first.subtest <= second.subtest {
                (first, TieBreak::SubtestId)
            } else {
                (second, TieBreak::SubtestId)
            }
        }
    };
    Some(Selection {
        subtest: winner.subtest.clone(),
        tie_breaker: Some(tie_breaker),
    })
}

pub fn cost_of_pass(total_cost_usd: f64, passed: u32) -> Option<f64> {
    (passed > 0).then(|| total_cost_usd / f64::from(passed))
}

/// Cheapest cost-of-pass across tiers.
pub fn frontier_cost_of_pass(values: impl IntoIterator<Item = Option<f64>>) -> Option<f64> {
    values.into_iter().flatten().min_by(f64::total_cmp)
}
