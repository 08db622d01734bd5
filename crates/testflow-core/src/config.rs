//! Test configuration schemas (v1 single-module, v2 multi-submodule).

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::error::AgentError;

/// How discovered tests are split across parallel executors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SplitMode {
    #[default]
    Test,
    File,
}

/// Cache key and the path globs persisted under it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheSpec {
    pub key: String,
    #[serde(default)]
    pub paths: Vec<String>,
}

/// A user command block (pre-run or post-run) with its env overlay.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandBlock {
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Merge-scoped settings of a v1 config: which patterns to discover and the
/// environment they run under.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Merge {
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Single-module test configuration (schema v1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TasConfig {
    pub framework: String,
    #[serde(default = "default_smart_run")]
    pub smart_run: bool,

    #[serde(default)]
    pub pre_merge: Option<Merge>,
    #[serde(default)]
    pub post_merge: Option<Merge>,

    #[serde(default)]
    pub pre_run: Option<CommandBlock>,
    #[serde(default)]
    pub post_run: Option<CommandBlock>,

    #[serde(default)]
    pub cache: CacheSpec,
    #[serde(default)]
    pub split_mode: SplitMode,
    #[serde(default)]
    pub tier: String,
    #[serde(default)]
    pub container_image: String,
    /// Module-level runner config file, forwarded as `--config`.
    #[serde(default)]
    pub config_file: String,
    /// Node toolchain version to install before discovery/execution.
    #[serde(default)]
    pub node_version: String,
    /// Test identifiers blocked from execution.
    #[serde(default)]
    pub blocklist: Vec<String>,
    #[serde(default)]
    pub parallelism: u32,
    #[serde(default)]
    pub version: String,
}

fn default_smart_run() -> bool {
    true
}

impl TasConfig {
    /// Patterns and env overlay for the given merge side.
    pub fn merge_for(&self, pre: bool) -> Option<&Merge> {
        if pre {
            self.pre_merge.as_ref()
        } else {
            self.post_merge.as_ref()
        }
    }
}

/// An independently configured test unit within a v2 repository.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Submodule {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub framework: String,
    #[serde(default)]
    pub config_file: String,
    /// Overlay over the merge-level env map.
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub pre_run: Option<CommandBlock>,
    /// Test identifiers blocked from execution within this submodule.
    #[serde(default)]
    pub blocklist: Vec<String>,
    #[serde(default)]
    pub parallelism: Option<u32>,
}

impl Submodule {
    /// Validate the per-submodule invariants.
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.name.is_empty() {
            return Err(AgentError::failed("submodule name is not defined"));
        }
        if self.path.is_empty() {
            return Err(AgentError::failed(format!(
                "submodule path is not defined for submodule {}",
                self.name
            )));
        }
        if self.patterns.is_empty() {
            return Err(AgentError::failed(format!(
                "submodule {} has no test patterns",
                self.name
            )));
        }
        Ok(())
    }
}

/// Submodule list plus env map for one merge side of a v2 config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeV2 {
    #[serde(default)]
    pub submodules: Vec<Submodule>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl MergeV2 {
    /// Validate every submodule and the name-uniqueness invariant.
    pub fn validate(&self) -> Result<(), AgentError> {
        let mut seen = HashSet::new();
        for submodule in &self.submodules {
            submodule.validate()?;
            if !seen.insert(submodule.name.as_str()) {
                return Err(AgentError::failed(format!(
                    "duplicate submodule name {}",
                    submodule.name
                )));
            }
        }
        Ok(())
    }
}

/// Multi-submodule test configuration (schema v2).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TasConfigV2 {
    #[serde(default = "default_smart_run")]
    pub smart_run: bool,

    #[serde(default)]
    pub pre_merge: MergeV2,
    #[serde(default)]
    pub post_merge: MergeV2,

    #[serde(default)]
    pub cache: CacheSpec,
    #[serde(default)]
    pub split_mode: SplitMode,
    #[serde(default)]
    pub tier: String,
    #[serde(default)]
    pub container_image: String,
    /// Shared parallelism; submodules may override with their own.
    #[serde(default)]
    pub parallelism: u32,
    #[serde(default)]
    pub version: String,
}

impl TasConfigV2 {
    /// Validate both merge lists.
    pub fn validate(&self) -> Result<(), AgentError> {
        self.pre_merge.validate()?;
        self.post_merge.validate()
    }
}

/// Parse the major schema version out of a config `version` value
/// (`"1"`, `"1.2"`, `"2.0.1"` all work).
pub fn parse_major_version(version: &str) -> Result<u32, AgentError> {
    let major = version.split('.').next().unwrap_or(version);
    major
        .trim()
        .parse::<u32>()
        .map_err(|e| AgentError::failed(format!("invalid config version `{version}`: {e}")))
}
