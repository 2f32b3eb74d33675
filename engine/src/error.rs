//! Typed errors surfaced by the orchestration engine.
//!
//! Orchestration glue uses `anyhow` for context chains; the variants here are
//! the conditions callers are expected to match on (config drift, checkpoint
//! corruption, rate limits, pool crashes, missing baselines).

use std::path::PathBuf;

use thiserror::Error;

use crate::core::rate_limit::RateLimitInfo;
use crate::core::tier::TierId;

/// A state token that is not part of the closed state vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} state {token:?}")]
pub struct StateParseError {
    pub kind: &'static str,
    pub token: String,
}

impl StateParseError {
    pub fn new(kind: &'static str, token: &str) -> Self {
        Self {
            kind,
            token: token.to_string(),
        }
    }
}

/// A backward transition attempted without an explicit reset.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {kind} transition {from} -> {to}")]
pub struct TransitionError {
    pub kind: &'static str,
    pub from: String,
    pub to: String,
}

/// Failure reading or writing the checkpoint file.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint not found at {}", path.display())]
    Missing { path: PathBuf },

    #[error("read checkpoint {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse checkpoint {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("unsupported checkpoint version {found} (newest known is {supported})")]
    UnsupportedVersion { found: u64, supported: u32 },

    #[error("invalid checkpoint: {0}")]
    Invalid(String),

    #[error("serialize checkpoint")]
    Serialize(#[source] serde_json::Error),

    #[error("write checkpoint {}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The execution-affecting configuration drifted since the checkpoint was written.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "config hash mismatch for experiment {experiment_id}: checkpoint recorded {recorded}, current config hashes to {current}"
)]
pub struct ConfigMismatch {
    pub experiment_id: String,
    pub recorded: String,
    pub current: String,
}

/// A dependent tier cannot inherit its baseline.
#[derive(Debug, Error)]
pub enum BaselineError {
    #[error("tier {dependency} has no best-subtest selection recorded (required by {tier})")]
    MissingSelection { tier: TierId, dependency: TierId },

    #[error("load baseline for {dependency}")]
    Load {
        dependency: TierId,
        #[source]
        source: anyhow::Error,
    },
}

/// Error returned by an external collaborator (agent or judge).
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("rate limited by {}: {}", .0.source, .0.message)]
    RateLimited(RateLimitInfo),

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// Why a subtest worker stopped before aggregating its runs.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("rate limit persisted after {waits} waits: {}", info.message)]
    RateLimited { info: RateLimitInfo, waits: u32 },

    /// Cooperative shutdown observed while waiting; not a failure.
    #[error("interrupted by shutdown request")]
    Interrupted,

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// Unrecoverable condition in the parallel executor.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error(
        "worker pool for {tier} crashed {attempts} time(s) without rate-limit evidence; unfinished subtests: {}",
        missing.join(", ")
    )]
    PoolCrashed {
        tier: TierId,
        missing: Vec<String>,
        attempts: u32,
    },

    #[error("spawn worker thread")]
    Spawn(#[source] std::io::Error),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

/// Umbrella error for a top-level experiment run.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    ConfigMismatch(#[from] ConfigMismatch),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Baseline(#[from] BaselineError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_parse_error_names_kind_and_token() {
        let err = StateParseError::new("run", "bogus");
        assert_eq!(err.to_string(), "unknown run state \"bogus\"");
    }

    #[test]
    fn config_mismatch_reports_both_hashes() {
        let err = ConfigMismatch {
            experiment_id: "exp".to_string(),
            recorded: "aaa".to_string(),
            current: "bbb".to_string(),
        };
        let message = err.to_string();
        assert!(message.contains("aaa"));
        assert!(message.contains("bbb"));
    }

    #[test]
    fn pool_crash_lists_missing_subtests() {
        let err = ExecutorError::PoolCrashed {
            tier: TierId::T2,
            missing: vec!["01-a".to_string(), "02-b".to_string()],
            attempts: 2,
        };
        assert!(err.to_string().contains("01-a, 02-b"));
    }
}
