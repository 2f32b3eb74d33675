//! Agent adapter abstraction.
//!
//! The [`AgentAdapter`] trait decouples the run pipeline from the coding agent
//! backend. [`CommandAgent`] spawns a configured command; tests use scripted
//! adapters that return predetermined outputs without spawning processes.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, anyhow};
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use crate::core::rate_limit::{RateLimitSource, detect_rate_limit};
use crate::core::types::AgentOutput;
use crate::error::AdapterError;
use crate::io::process::{CommandOutput, run_command};

/// Parameters for one agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub workspace: PathBuf,
    pub model: String,
    /// Composed prompt (task prompt plus resolved prompt blocks).
    pub prompt: String,
    /// Directory receiving `stdout.log` / `stderr.log`.
    pub log_dir: PathBuf,
}

/// Abstraction over coding-agent backends.
pub trait AgentAdapter: Send + Sync {
    /// Run the agent once. A non-zero exit is an `Ok` output, not an error;
    /// errors are reserved for rate limits and failures to run at all.
    fn run(&self, request: &AgentRequest) -> Result<AgentOutput, AdapterError>;
}

/// Agent that spawns `command` in the workspace, feeding the prompt on stdin.
///
/// The model id is exported as `BENCH_MODEL`. If the last non-empty stdout
/// line is a JSON object, token and cost telemetry are read from it.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    pub command: Vec<String>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Telemetry {
    input_tokens: u64,
    output_tokens: u64,
    cost_usd: f64,
    output: Option<String>,
}

impl AgentAdapter for CommandAgent {
    #[instrument(skip_all, fields(workspace = %request.workspace.display(), model = %request.model))]
    fn run(&self, request: &AgentRequest) -> Result<AgentOutput, AdapterError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("agent.command is empty"))?;
        info!(program, "starting agent");

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&request.workspace)
            .env("BENCH_MODEL", &request.model)
            .env("BENCH_WORKSPACE", &request.workspace);
        let output = run_command(
            cmd,
            Some(request.prompt.as_bytes()),
            self.timeout,
            self.output_limit_bytes,
        )
        .context("run agent command")?;
        write_logs(&request.log_dir, &output)?;

        if !output.success()
            && let Some(info) = detect_rate_limit(RateLimitSource::Agent, &output.combined())
        {
            warn!(retry_after_secs = ?info.retry_after_secs, "agent rate limited");
            return Err(AdapterError::RateLimited(info));
        }
        if output.timed_out {
            warn!(timeout_secs = self.timeout.as_secs(), "agent timed out");
        }

        let telemetry = parse_telemetry(&output.stdout);
        let agent_output = AgentOutput {
            exit_code: output.code_or_failure(),
            input_tokens: telemetry.input_tokens,
            output_tokens: telemetry.output_tokens,
            cost_usd: telemetry.cost_usd,
            duration_secs: output.elapsed.as_secs_f64(),
            output: telemetry.output.unwrap_or(output.stdout),
        };
        debug!(
            exit_code = agent_output.exit_code,
            cost_usd = agent_output.cost_usd,
            "agent finished"
        );
        Ok(agent_output)
    }
}

fn parse_telemetry(stdout: &str) -> Telemetry {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .filter(|line| line.starts_with('{'))
        .and_then(|line| serde_json::from_str(line).ok())
        .unwrap_or_default()
}

/// Persist captured stdout/stderr next to the collaborator's result.
pub fn write_logs(dir: &Path, output: &CommandOutput) -> anyhow::Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    let stdout_path = dir.join("stdout.log");
    fs::write(&stdout_path, &output.stdout)
        .with_context(|| format!("write {}", stdout_path.display()))?;
    let mut stderr = output.stderr.clone();
    if output.timed_out {
        stderr.push_str("\n[timed out]\n");
    }
    let stderr_path = dir.join("stderr.log");
    fs::write(&stderr_path, stderr).with_context(|| format!("write {}", stderr_path.display()))?;
    Ok(())
}
