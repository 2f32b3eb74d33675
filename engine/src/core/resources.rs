//! Resource specifications and baseline inheritance between tiers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::tier::TierId;

/// An MCP server the agent is allowed to start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct McpServer {
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
}

/// Resources a subtest exposes to the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ResourceSpec {
    pub model: Option<String>,
    pub prompt_blocks: Vec<String>,
    pub tools: Vec<String>,
    pub skill_categories: Vec<String>,
    pub mcp_servers: BTreeMap<String, McpServer>,
}

impl ResourceSpec {
    /// Layer `overlay` on top of `self`; `overlay` is the more specific source.
    pub fn merge(&mut self, overlay: &ResourceSpec) {
        if overlay.model.is_some() {
            self.model.clone_from(&overlay.model);
        }
        if !overlay.prompt_blocks.is_empty() {
            self.prompt_blocks.clone_from(&overlay.prompt_blocks);
        }
        union_into(&mut self.tools, &overlay.tools);
        union_into(&mut self.skill_categories, &overlay.skill_categories);
        for (name, server) in &overlay.mcp_servers {
            self.mcp_servers.insert(name.clone(), server.clone());
        }
    }

    pub fn merged(mut self, overlay: &ResourceSpec) -> ResourceSpec {
        self.merge(overlay);
        self
    }
}

fn union_into(target: &mut Vec<String>, extra: &[String]) {
    for item in extra {
        if !target.contains(item) {
            target.push(item.clone());
        }
    }
}

/// The winning subtest of a completed tier (`best_subtest.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierBaseline {
    pub tier: TierId,
    pub subtest: String,
    pub resources: ResourceSpec,
}

/// Merge dependency baselines in dependency order.
pub fn merge_baselines<'a>(baselines: impl IntoIterator<Item = &'a TierBaseline>) -> ResourceSpec {
    baselines
        .into_iter()
        .fold(ResourceSpec::default(), |acc, baseline| {
            acc.merged(&baseline.resources)
        })
}
