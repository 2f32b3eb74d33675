//! Render checkpoint state as a tree, a table or JSON.

use std::fmt::Write as _;

use clap::ValueEnum;
use engine::core::checkpoint::Checkpoint;
use engine::core::tier::TierId;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    Tree,
    Table,
    Json,
}

#[derive(Debug, Serialize)]
pub struct ExperimentView {
    pub experiment_id: String,
    pub state: String,
    pub last_updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limited_until: Option<String>,
    pub tiers: Vec<TierView>,
}

#[derive(Debug, Serialize)]
pub struct TierView {
    pub tier: TierId,
    pub state: String,
    pub subtests: Vec<SubtestView>,
}

#[derive(Debug, Serialize)]
pub struct SubtestView {
    pub subtest: String,
    pub state: String,
    pub runs: Vec<RunView>,
}

#[derive(Debug, Serialize)]
pub struct RunView {
    pub run: u32,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
}

impl SubtestView {
    fn finished(&self) -> usize {
        self.runs.iter().filter(|run| run.outcome.is_some()).count()
    }
}

/// Collect the checkpoint into a view, keeping only `tiers` when non-empty.
pub fn view(checkpoint: &Checkpoint, tiers: &[TierId]) -> ExperimentView {
    let tiers = checkpoint
        .tier_states
        .iter()
        .filter(|(tier, _)| tiers.is_empty() || tiers.contains(*tier))
        .map(|(tier, state)| TierView {
            tier: *tier,
            state: state.to_string(),
            subtests: checkpoint
                .subtests(*tier)
                .into_iter()
                .map(|subtest| {
                    let runs = checkpoint
                        .runs(*tier, &subtest)
                        .map(|runs| {
                            runs.iter()
                                .map(|(run, state)| RunView {
                                    run: *run,
                                    state: state.to_string(),
                                    outcome: checkpoint
                                        .completed_outcome(*tier, &subtest, *run)
                                        .map(|outcome| outcome.to_string()),
                                })
                                .collect()
                        })
                        .unwrap_or_default();
                    SubtestView {
                        state: checkpoint
                            .subtest_state(*tier, &subtest)
                            .map(|state| state.to_string())
                            .unwrap_or_default(),
                        subtest,
                        runs,
                    }
                })
                .collect(),
        })
        .collect();
    ExperimentView {
        experiment_id: checkpoint.experiment_id.clone(),
        state: checkpoint.experiment_state.to_string(),
        last_updated_at: checkpoint.last_updated_at.to_rfc3339(),
        rate_limited_until: checkpoint
            .rate_limit
            .as_ref()
            .map(|window| window.resume_at.to_rfc3339()),
        tiers,
    }
}

pub fn render(view: &ExperimentView, format: Format) -> anyhow::Result<String> {
    Ok(match format {
        Format::Tree => render_tree(view),
        Format::Table => render_table(view),
        Format::Json => {
            let mut json = serde_json::to_string_pretty(view)?;
            json.push('\n');
            json
        }
    })
}

fn render_tree(view: &ExperimentView) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{} [{}]", view.experiment_id, view.state);
    if let Some(until) = &view.rate_limited_until {
        let _ = writeln!(out, "  rate limited until {until}");
    }
    for tier in &view.tiers {
        let _ = writeln!(out, "  {} [{}]", tier.tier, tier.state);
        for subtest in &tier.subtests {
            let _ = writeln!(
                out,
                "    {} [{}] {}/{} runs finished",
                subtest.subtest,
                subtest.state,
                subtest.finished(),
                subtest.runs.len()
            );
            for run in &subtest.runs {
                let _ = match &run.outcome {
                    Some(outcome) => writeln!(out, "      run_{:02} {} ({outcome})", run.run, run.state),
                    None => writeln!(out, "      run_{:02} {}", run.run, run.state),
                };
            }
        }
    }
    out
}

fn render_table(view: &ExperimentView) -> String {
    let mut rows: Vec<[String; 5]> = vec![[
        "TIER".to_string(),
        "SUBTEST".to_string(),
        "STATE".to_string(),
        "RUNS".to_string(),
        "PASSED".to_string(),
    ]];
    for tier in &view.tiers {
        if tier.subtests.is_empty() {
            rows.push([
                tier.tier.to_string(),
                "-".to_string(),
                tier.state.clone(),
                "0/0".to_string(),
                "0".to_string(),
            ]);
        }
        for subtest in &tier.subtests {
            let passed = subtest
                .runs
                .iter()
                .filter(|run| run.outcome.as_deref() == Some("passed"))
                .count();
            rows.push([
                tier.tier.to_string(),
                subtest.subtest.clone(),
                subtest.state.clone(),
                format!("{}/{}", subtest.finished(), subtest.runs.len()),
                passed.to_string(),
            ]);
        }
    }

    let mut widths = [0usize; 5];
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }
    let mut out = String::new();
    for row in &rows {
        let line: Vec<String> = row
            .iter()
            .zip(widths)
            .map(|(cell, width)| format!("{cell:<width$}"))
            .collect();
        let _ = writeln!(out, "{}", line.join("  ").trim_end());
    }
    out
}

#[cfg(test)]
mod tests {
    use engine::core::states::{ExperimentState, RunState, SubtestState, TierState};
    use engine::core::types::RunOutcome;
    use engine::test_support::{checkpoint, test_config};

    use super::*;

    fn sample() -> Checkpoint {
        let config = test_config(std::path::Path::new("/tmp/results"), &[TierId::T0, TierId::T1]);
        let mut cp = checkpoint(&config);
        cp.reset_experiment_state(ExperimentState::TiersRunning);
        cp.reset_tier_state(TierId::T0, TierState::SubtestsRunning);
        cp.register_subtest(TierId::T0, "01-a");
        cp.reset_subtest_state(TierId::T0, "01-a", SubtestState::RunsInProgress);
        cp.mark_run_completed(TierId::T0, "01-a", 1, RunOutcome::Passed);
        cp.reset_run_state(TierId::T0, "01-a", 2, RunState::AgentComplete);
        cp
    }

    #[test]
    fn tree_shows_states_and_outcomes() {
        let out = render(&view(&sample(), &[]), Format::Tree).expect("render");
        assert!(out.starts_with("exp [tiers_running]\n"));
        assert!(out.contains("  T0 [subtests_running]\n"));
        assert!(out.contains("    01-a [runs_in_progress] 1/2 runs finished\n"));
        assert!(out.contains("      run_01 worktree_cleaned (passed)\n"));
        assert!(out.contains("      run_02 agent_complete\n"));
        assert!(out.contains("  T1 [pending]\n"));
    }

    #[test]
    fn table_aligns_columns_and_filters_tiers() {
        let out = render(&view(&sample(), &[TierId::T0]), Format::Table).expect("render");
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("TIER  SUBTEST  STATE"));
        assert!(lines[1].starts_with("T0    01-a     runs_in_progress"));
        assert!(lines[1].ends_with("1/2   1"));
        assert!(!out.contains("T1"));
    }

    #[test]
    fn json_lists_run_outcomes() {
        let out = render(&view(&sample(), &[]), Format::Json).expect("render");
        let value: serde_json::Value = serde_json::from_str(&out).expect("json");
        assert_eq!(value["state"], "tiers_running");
        assert_eq!(value["tiers"][0]["subtests"][0]["runs"][0]["outcome"], "passed");
        assert!(value["tiers"][0]["subtests"][0]["runs"][1].get("outcome").is_none());
    }
}
