//! Subtest discovery and resource fixtures.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::debug;

use crate::core::resources::ResourceSpec;
use crate::core::tier::TierId;

/// Source of a tier's subtests and their resource specifications.
pub trait ResourceProvider: Send + Sync {
    /// Subtest ids for `tier`, sorted.
    fn list_subtests(&self, tier: TierId) -> Result<Vec<String>>;

    fn resources(&self, tier: TierId, subtest: &str) -> Result<ResourceSpec>;
}

/// Fixtures laid out as `<root>/<tier>/<subtest>.toml`.
#[derive(Debug, Clone)]
pub struct DirectoryResources {
    pub root: PathBuf,
}

impl DirectoryResources {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn tier_dir(&self, tier: TierId) -> PathBuf {
        self.root.join(tier.as_str())
    }
}

impl ResourceProvider for DirectoryResources {
    fn list_subtests(&self, tier: TierId) -> Result<Vec<String>> {
        let dir = self.tier_dir(tier);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(&dir).with_context(|| format!("read tier dir {}", dir.display()))? {
            let path = entry.context("read subtest entry")?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("toml") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            validate_subtest_id(stem).with_context(|| format!("subtest {}", path.display()))?;
            ids.push(stem.to_string());
        }
        ids.sort();
        debug!(tier = %tier, subtests = ids.len(), "subtests discovered");
        Ok(ids)
    }

    fn resources(&self, tier: TierId, subtest: &str) -> Result<ResourceSpec> {
        validate_subtest_id(subtest)?;
        let path = self.tier_dir(tier).join(format!("{subtest}.toml"));
        load_spec(&path)
    }
}

fn load_spec(path: &Path) -> Result<ResourceSpec> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

fn validate_subtest_id(id: &str) -> Result<()> {
    if id.trim().is_empty() {
        bail!("subtest id must be non-empty");
    }
    if id.contains("..") || id.contains('/') || id.contains('\\') {
        bail!("subtest id {id:?} must not contain path components");
    }
    if !id
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
    {
        bail!("subtest id {id:?} must use [A-Za-z0-9_-] only");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_toml_stems_sorted() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tier_dir = temp.path().join("T1");
        fs::create_dir_all(&tier_dir).expect("mkdir");
        fs::write(tier_dir.join("02-tools.toml"), "tools = [\"bash\"]\n").expect("write");
        fs::write(tier_dir.join("01-base.toml"), "model = \"small\"\n").expect("write");
        fs::write(tier_dir.join("notes.md"), "ignored").expect("write");

        let provider = DirectoryResources::new(temp.path());
        assert_eq!(
            provider.list_subtests(TierId::T1).expect("list"),
            vec!["01-base".to_string(), "02-tools".to_string()]
        );
        assert!(provider.list_subtests(TierId::T4).expect("list").is_empty());

        let spec = provider.resources(TierId::T1, "02-tools").expect("spec");
        assert_eq!(spec.tools, vec!["bash".to_string()]);
        assert_eq!(spec.model, None);
    }

    #[test]
    fn parses_mcp_servers() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tier_dir = temp.path().join("T3");
        fs::create_dir_all(&tier_dir).expect("mkdir");
        fs::write(
            tier_dir.join("01-mcp.toml"),
            "prompt_blocks = [\"use search\"]\n\n[mcp_servers.search]\ncommand = [\"search-mcp\", \"--stdio\"]\n",
        )
        .expect("write");
        let spec = DirectoryResources::new(temp.path())
            .resources(TierId::T3, "01-mcp")
            .expect("spec");
        assert_eq!(spec.mcp_servers["search"].command, vec!["search-mcp", "--stdio"]);
        assert_eq!(spec.prompt_blocks, vec!["use search"]);
    }

    #[test]
    fn rejects_path_like_ids() {
        let provider = DirectoryResources::new("/nonexistent");
        assert!(provider.resources(TierId::T0, "../escape").is_err());
    }
}
