//! Orchestrator configuration stored in `cobbler.toml` at the repository root.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::io::atomic::write_atomic;

/// Orchestrator configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields default to
/// the values of [`CobblerConfig::default`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CobblerConfig {
    pub cycles: CyclesConfig,
    pub agent: AgentConfig,
    pub prompt: PromptConfig,
    pub git: GitConfig,
    pub analyze: AnalyzeConfig,
    pub docs: DocsConfig,
}

/// What `trail run` does when no cycle count (or zero) is given.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum WhenUnspecified {
    /// Run `cycles.default` cycles.
    #[default]
    Default,
    /// Run until a cycle proposes nothing and nothing is ready, capped at
    /// `cycles.until_idle_cap`.
    UntilIdle,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CyclesConfig {
    pub default: u32,
    pub when_unspecified: WhenUnspecified,
    pub until_idle_cap: u32,
}

impl Default for CyclesConfig {
    fn default() -> Self {
        Self {
            default: 3,
            when_unspecified: WhenUnspecified::Default,
            until_idle_cap: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent command; the prompt is written to its stdin.
    pub command: Vec<String>,
    pub measure_timeout_secs: u64,
    pub stitch_timeout_secs: u64,
    /// Attempts per agent invocation for transient failures (timeouts are not retried).
    pub max_attempts: u32,
    /// Backoff before the second attempt; doubles after each failure.
    pub retry_backoff_ms: u64,
    /// Truncate agent stdout/stderr logs beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: [
                "claude",
                "-p",
                "--output-format",
                "json",
                "--dangerously-skip-permissions",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
            measure_timeout_secs: 15 * 60,
            stitch_timeout_secs: 30 * 60,
            max_attempts: 2,
            retry_backoff_ms: 2_000,
            output_limit_bytes: 200_000,
        }
    }
}

impl AgentConfig {
    pub fn measure_timeout(&self) -> Duration {
        Duration::from_secs(self.measure_timeout_secs)
    }

    pub fn stitch_timeout(&self) -> Duration {
        Duration::from_secs(self.stitch_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PromptConfig {
    /// Rendered prompts larger than this drop optional sections.
    pub budget_bytes: usize,
    /// Maximum number of files listed in the source summary.
    pub source_summary_max_files: usize,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            budget_bytes: 60_000,
            source_summary_max_files: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GitConfig {
    /// Branch trails fork from and merge into; defaults to the branch checked
    /// out at the repository root.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub main_branch: Option<String>,
    /// Pattern written to `.git/info/exclude` for the state directory.
    pub exclude_entry: String,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            main_branch: None,
            exclude_entry: "/.cobbler/".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AnalyzeConfig {
    pub requirements: Vec<String>,
    pub use_cases: Vec<String>,
    pub test_suites: Vec<String>,
    pub roadmap: Vec<String>,
    pub requirement_pattern: String,
    pub use_case_pattern: String,
}

impl Default for AnalyzeConfig {
    fn default() -> Self {
        Self {
            requirements: vec!["docs/requirements".to_string()],
            use_cases: vec!["docs/use-cases".to_string()],
            test_suites: vec!["docs/test-suites".to_string()],
            roadmap: vec!["docs/roadmap.md".to_string()],
            requirement_pattern: r"\bR\d+(?:\.\d+)*\b".to_string(),
            use_case_pattern: r"\bUC\d{3}\b".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DocsConfig {
    /// Files or directories (relative to the worktree) attached to prompts.
    pub context: Vec<String>,
}

impl Default for DocsConfig {
    fn default() -> Self {
        Self {
            context: vec!["README.md".to_string(), "docs".to_string()],
        }
    }
}

impl CobblerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.cycles.default == 0 {
            return Err(anyhow!("cycles.default must be > 0"));
        }
        if self.cycles.until_idle_cap == 0 {
            return Err(anyhow!("cycles.until_idle_cap must be > 0"));
        }
        if self.agent.command.is_empty() || self.agent.command[0].trim().is_empty() {
            return Err(anyhow!("agent.command must be a non-empty array"));
        }
        if self.agent.measure_timeout_secs == 0 || self.agent.stitch_timeout_secs == 0 {
            return Err(anyhow!("agent timeouts must be > 0"));
        }
        if self.agent.max_attempts == 0 {
            return Err(anyhow!("agent.max_attempts must be > 0"));
        }
        if self.agent.output_limit_bytes == 0 {
            return Err(anyhow!("agent.output_limit_bytes must be > 0"));
        }
        if self.prompt.budget_bytes == 0 {
            return Err(anyhow!("prompt.budget_bytes must be > 0"));
        }
        if self.git.exclude_entry.trim().is_empty() {
            return Err(anyhow!("git.exclude_entry must not be empty"));
        }
        if let Some(branch) = &self.git.main_branch
            && branch.trim().is_empty()
        {
            return Err(anyhow!("git.main_branch must not be empty when set"));
        }
        Regex::new(&self.analyze.requirement_pattern)
            .context("analyze.requirement_pattern is not a valid regex")?;
        Regex::new(&self.analyze.use_case_pattern)
            .context("analyze.use_case_pattern is not a valid regex")?;
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `CobblerConfig::default()`.
pub fn load_config(path: &Path) -> Result<CobblerConfig> {
    if !path.exists() {
        let cfg = CobblerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: CobblerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Load config, writing the default file first if it is missing.
pub fn load_or_create_config(path: &Path) -> Result<CobblerConfig> {
    if !path.exists() {
        info!(path = %path.display(), "writing default config");
        write_config(path, &CobblerConfig::default())?;
    }
    load_config(path)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &CobblerConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())
}
