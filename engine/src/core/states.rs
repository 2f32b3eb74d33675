//! Closed state vocabularies for the experiment → tier → subtest → run hierarchy.
//!
//! Every state type has a forward progression plus side-branch states that are
//! reachable from anywhere (failure, rate limiting, interruption). Tokens are
//! stable snake_case strings; parsing an unknown token is a typed error.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{StateParseError, TransitionError};

/// Shared behaviour of the four state enums.
pub trait Lifecycle:
    Copy + Eq + fmt::Debug + fmt::Display + FromStr<Err = StateParseError> + 'static
{
    /// Human-readable scope name used in errors (`run`, `tier`, ...).
    const KIND: &'static str;
    /// Forward progression, first element is the initial state.
    const FORWARD: &'static [Self];

    fn as_str(self) -> &'static str;

    fn is_terminal(self) -> bool;

    fn is_success(self) -> bool;

    fn initial() -> Self {
        Self::FORWARD[0]
    }

    /// Index in the forward progression; `None` for side-branch states.
    fn position(self) -> Option<usize> {
        Self::FORWARD.iter().position(|state| *state == self)
    }

    fn is_side_branch(self) -> bool {
        self.position().is_none()
    }

    /// Whether `self` has reached `target`. Side-branch states count as past
    /// every forward state.
    fn is_at_or_past(self, target: Self) -> bool {
        match (self.position(), target.position()) {
            (Some(current), Some(target)) => current >= target,
            (None, _) => true,
            (Some(_), None) => false,
        }
    }

    /// The state immediately before `self` ("not yet reached").
    fn predecessor(self) -> Self {
        match self.position() {
            Some(index) if index > 0 => Self::FORWARD[index - 1],
            _ => Self::initial(),
        }
    }

    fn successor(self) -> Option<Self> {
        self.position()
            .and_then(|index| Self::FORWARD.get(index + 1).copied())
    }

    /// Forward-only transition check. Side-branch targets are always allowed;
    /// leaving a side branch requires an explicit reset.
    fn check_transition(self, to: Self) -> Result<(), TransitionError> {
        let allowed = match (self.position(), to.position()) {
            (_, None) => true,
            (Some(from), Some(to)) => to >= from,
            (None, Some(_)) => false,
        };
        if allowed {
            Ok(())
        } else {
            Err(TransitionError {
                kind: Self::KIND,
                from: self.as_str().to_string(),
                to: to.as_str().to_string(),
            })
        }
    }
}

/// Declares a state enum with its tokens, `FromStr`, `Display`, string serde
/// and its [`Lifecycle`] impl. The `forward` block is the progression order.
macro_rules! state_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $kind:literal,
        forward { $($fwd:ident => $fwd_token:literal),+ $(,)? }
        side { $($side:ident => $side_token:literal),* $(,)? }
        terminal { $($terminal:ident),+ $(,)? }
        success $success:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub enum $name {
            $($fwd,)+
            $($side,)*
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$fwd,)+ $($name::$side,)*];

            fn token(self) -> &'static str {
                match self {
                    $($name::$fwd => $fwd_token,)+
                    $($name::$side => $side_token,)*
                }
            }
        }

        impl Lifecycle for $name {
            const KIND: &'static str = $kind;
            const FORWARD: &'static [Self] = &[$($name::$fwd,)+];

            fn as_str(self) -> &'static str {
                self.token()
            }

            fn is_terminal(self) -> bool {
                matches!(self, $($name::$terminal)|+)
            }

            fn is_success(self) -> bool {
                self == $name::$success
            }
        }

        impl FromStr for $name {
            type Err = StateParseError;

            fn from_str(token: &str) -> Result<Self, Self::Err> {
                match token {
                    $($fwd_token => Ok($name::$fwd),)+
                    $($side_token => Ok($name::$side),)*
                    other => Err(StateParseError::new($kind, other)),
                }
            }
        }

        impl TryFrom<String> for $name {
            type Error = StateParseError;

            fn try_from(token: String) -> Result<Self, Self::Error> {
                token.parse()
            }
        }

        impl From<$name> for String {
            fn from(state: $name) -> String {
                state.token().to_string()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.token())
            }
        }
    };
}

state_enum! {
    /// Progress of a single run through the agent → judge pipeline.
    RunState, "run",
    forward {
        Pending => "pending",
        DirStructureCreated => "dir_structure_created",
        WorktreeCreated => "worktree_created",
        ConfigCommitted => "config_committed",
        PromptWritten => "prompt_written",
        AgentComplete => "agent_complete",
        JudgePipelineRun => "judge_pipeline_run",
        RunFinalized => "run_finalized",
        WorktreeCleaned => "worktree_cleaned",
    }
    side {
        RateLimited => "rate_limited",
        Failed => "failed",
        Interrupted => "interrupted",
    }
    // `failed` is terminal after exhausted retries; `interrupted` is terminal
    // for the invocation but never a failure.
    terminal { WorktreeCleaned, Failed, Interrupted }
    success WorktreeCleaned
}

state_enum! {
    /// Aggregate of a subtest's runs.
    SubtestState, "subtest",
    forward {
        Pending => "pending",
        RunsInProgress => "runs_in_progress",
        RunsComplete => "runs_complete",
        Aggregated => "aggregated",
    }
    side {
        Failed => "failed",
    }
    terminal { Aggregated, Failed }
    success Aggregated
}

state_enum! {
    /// Aggregate of a tier's subtests.
    TierState, "tier",
    forward {
        Pending => "pending",
        ConfigLoaded => "config_loaded",
        SubtestsRunning => "subtests_running",
        SubtestsComplete => "subtests_complete",
        BestSelected => "best_selected",
        ReportsGenerated => "reports_generated",
        Complete => "complete",
    }
    side {
        Failed => "failed",
    }
    terminal { Complete, Failed }
    success Complete
}

state_enum! {
    /// Aggregate of the experiment's tiers.
    ExperimentState, "experiment",
    forward {
        Initializing => "initializing",
        DirCreated => "dir_created",
        TiersRunning => "tiers_running",
        TiersComplete => "tiers_complete",
        ReportsGenerated => "reports_generated",
        Complete => "complete",
    }
    side {
        Failed => "failed",
        Interrupted => "interrupted",
    }
    terminal { Complete, Failed, Interrupted }
    success Complete
}

/// A state token as found in a checkpoint.
///
/// Tokens that fail to parse are kept verbatim instead of being coerced, so
/// a corrupt entry stays visible and is treated as unfinished work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded<S> {
    Known(S),
    Unrecognized(String),
}

impl<S: Lifecycle> Recorded<S> {
    pub fn parse(token: &str) -> Self {
        match token.parse::<S>() {
            Ok(state) => Recorded::Known(state),
            Err(_) => Recorded::Unrecognized(token.to_string()),
        }
    }

    pub fn known(&self) -> Result<S, StateParseError> {
        match self {
            Recorded::Known(state) => Ok(*state),
            Recorded::Unrecognized(token) => Err(StateParseError::new(S::KIND, token)),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Recorded::Known(state) => state.as_str(),
            Recorded::Unrecognized(token) => token,
        }
    }

    /// Unrecognized tokens are never terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Recorded::Known(state) if state.is_terminal())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Recorded::Known(state) if state.is_success())
    }

    pub fn is(&self, state: S) -> bool {
        matches!(self, Recorded::Known(current) if *current == state)
    }
}

impl<S> From<S> for Recorded<S> {
    fn from(state: S) -> Self {
        Recorded::Known(state)
    }
}

impl<S: Lifecycle> fmt::Display for Recorded<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<S: Lifecycle> Serialize for Recorded<S> {
    fn serialize<Ser: Serializer>(&self, serializer: Ser) -> Result<Ser::Ok, Ser::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de, S: Lifecycle> Deserialize<'de> for Recorded<S> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let token = String::deserialize(deserializer)?;
        Ok(Recorded::parse(&token))
    }
}

/// `until` control: true when `current` has reached the halt point.
pub fn halt_reached<S: Lifecycle>(until: Option<S>, current: S) -> bool {
    until.is_some_and(|target| !current.is_side_branch() && current.is_at_or_past(target))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_round_trip_through_from_str() {
        for state in RunState::ALL {
            assert_eq!(state.as_str().parse::<RunState>(), Ok(*state));
        }
        for state in TierState::ALL {
            assert_eq!(state.as_str().parse::<TierState>(), Ok(*state));
        }
        for state in SubtestState::ALL {
            assert_eq!(state.as_str().parse::<SubtestState>(), Ok(*state));
        }
        for state in ExperimentState::ALL {
            assert_eq!(state.as_str().parse::<ExperimentState>(), Ok(*state));
        }
    }

    #[test]
    fn unknown_token_is_a_typed_error() {
        let err = "halfway".parse::<TierState>().expect_err("unknown");
        assert_eq!(err.kind, "tier");
        assert_eq!(err.token, "halfway");

        let err = serde_json::from_str::<ExperimentState>("\"done\"").expect_err("unknown");
        assert!(err.to_string().contains("unknown experiment state"));
    }

    #[test]
    fn forward_transitions_only() {
        assert!(
            RunState::PromptWritten
                .check_transition(RunState::AgentComplete)
                .is_ok()
        );
        assert!(
            RunState::AgentComplete
                .check_transition(RunState::AgentComplete)
                .is_ok()
        );
        let err = RunState::AgentComplete
            .check_transition(RunState::Pending)
            .expect_err("backward");
        assert_eq!(err.from, "agent_complete");
        assert!(
            TierState::Complete
                .check_transition(TierState::Failed)
                .is_ok()
        );
        assert!(
            TierState::Failed
                .check_transition(TierState::Pending)
                .is_err()
        );
    }

    #[test]
    fn side_branches_count_as_past_everything() {
        assert!(RunState::Failed.is_at_or_past(RunState::WorktreeCleaned));
        assert!(!RunState::Pending.is_at_or_past(RunState::Failed));
        assert!(RunState::RunFinalized.is_at_or_past(RunState::AgentComplete));
        assert!(!RunState::PromptWritten.is_at_or_past(RunState::AgentComplete));
    }

    #[test]
    fn predecessor_and_successor() {
        assert_eq!(
            RunState::AgentComplete.predecessor(),
            RunState::PromptWritten
        );
        assert_eq!(RunState::Pending.predecessor(), RunState::Pending);
        assert_eq!(TierState::Failed.predecessor(), TierState::Pending);
        assert_eq!(
            ExperimentState::TiersRunning.successor(),
            Some(ExperimentState::TiersComplete)
        );
        assert_eq!(ExperimentState::Complete.successor(), None);
    }

    #[test]
    fn terminal_classification() {
        assert!(RunState::WorktreeCleaned.is_terminal());
        assert!(RunState::Failed.is_terminal());
        assert!(RunState::Interrupted.is_terminal());
        assert!(!RunState::RateLimited.is_terminal());
        assert!(!RunState::Interrupted.is_success());
        assert!(SubtestState::Aggregated.is_success());
        assert!(!TierState::BestSelected.is_terminal());
    }

    fn walk<S: Lifecycle>() -> Vec<S> {
        std::iter::successors(Some(S::initial()), |state| state.successor()).collect()
    }

    #[test]
    fn successor_chain_walks_the_declared_forward_order() {
        assert_eq!(walk::<RunState>(), RunState::FORWARD);
        assert_eq!(walk::<SubtestState>(), SubtestState::FORWARD);
        assert_eq!(walk::<TierState>(), TierState::FORWARD);
        assert_eq!(walk::<ExperimentState>(), ExperimentState::FORWARD);

        assert_eq!(RunState::FORWARD.len(), 9);
        assert_eq!(RunState::FORWARD.last(), Some(&RunState::WorktreeCleaned));
        assert_eq!(&RunState::ALL[..RunState::FORWARD.len()], RunState::FORWARD);
        let side: Vec<_> = RunState::ALL
            .iter()
            .copied()
            .filter(|state| state.is_side_branch())
            .collect();
        assert_eq!(
            side,
            vec![RunState::RateLimited, RunState::Failed, RunState::Interrupted]
        );
        assert_eq!(ExperimentState::FORWARD.len(), 6);
    }

    #[test]
    fn recorded_keeps_corrupt_tokens() {
        let parsed: Recorded<RunState> = serde_json::from_str("\"agnet_complete\"").expect("parse");
        assert_eq!(
            parsed,
            Recorded::Unrecognized("agnet_complete".to_string())
        );
        assert!(!parsed.is_terminal());
        assert!(parsed.known().is_err());
        assert_eq!(
            serde_json::to_string(&parsed).expect("serialize"),
            "\"agnet_complete\""
        );

        let known: Recorded<RunState> = serde_json::from_str("\"failed\"").expect("parse");
        assert!(known.is(RunState::Failed));
        assert!(known.is_terminal());
    }

    #[test]
    fn halt_is_inclusive_of_the_target() {
        assert!(!halt_reached(None, RunState::WorktreeCleaned));
        assert!(halt_reached(
            Some(RunState::AgentComplete),
            RunState::AgentComplete
        ));
        assert!(halt_reached(
            Some(RunState::AgentComplete),
            RunState::RunFinalized
        ));
        assert!(!halt_reached(
            Some(RunState::AgentComplete),
            RunState::PromptWritten
        ));
        assert!(!halt_reached(Some(RunState::AgentComplete), RunState::Failed));
    }
}
