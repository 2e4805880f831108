//! Size reports for a worktree: lines of code and estimated prompt tokens.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::debug;

use crate::io::agent::Agent;
use crate::io::context::{collect_docs, project_files};
use crate::io::registry::load_registry;
use crate::orchestrator::Orchestrator;

/// Rough bytes-per-token ratio used for estimates.
const BYTES_PER_TOKEN: usize = 4;

const MARKDOWN_EXTENSIONS: &[&str] = &["md", "markdown"];

pub fn estimate_tokens(bytes: usize) -> usize {
    bytes.div_ceil(BYTES_PER_TOKEN)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExtensionStats {
    pub files: usize,
    pub lines: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocWords {
    pub path: String,
    pub words: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LocReport {
    /// Keyed by file extension; files without one are under `(none)`.
    pub by_extension: BTreeMap<String, ExtensionStats>,
    pub docs: Vec<DocWords>,
    pub total_lines: usize,
}

/// Count lines per extension, and words in markdown documents, under `root`.
pub fn loc(root: &Path) -> Result<LocReport> {
    let mut report = LocReport::default();
    for rel in project_files(root)? {
        let path = root.join(&rel);
        let bytes = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
        let lines = bytes.iter().filter(|&&b| b == b'\n').count();
        let ext = Path::new(&rel)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);

        let entry = report
            .by_extension
            .entry(ext.clone().unwrap_or_else(|| "(none)".to_string()))
            .or_default();
        entry.files += 1;
        entry.lines += lines;
        report.total_lines += lines;

        if ext.is_some_and(|e| MARKDOWN_EXTENSIONS.contains(&e.as_str())) {
            let text = String::from_utf8_lossy(&bytes);
            report.docs.push(DocWords {
                path: rel,
                words: text.split_whitespace().count(),
            });
        }
    }
    debug!(root = %root.display(), lines = report.total_lines, "loc counted");
    Ok(report)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenEntry {
    pub name: String,
    pub bytes: usize,
    pub tokens: usize,
}

impl TokenEntry {
    fn new(name: impl Into<String>, bytes: usize) -> Self {
        Self {
            name: name.into(),
            bytes,
            tokens: estimate_tokens(bytes),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenReport {
    /// Documents attached to prompts.
    pub files: Vec<TokenEntry>,
    /// Rendered Measure prompt of the active trail, when there is one.
    pub measure_prompt: Option<TokenEntry>,
    pub total_tokens: usize,
}

impl<A: Agent> Orchestrator<A> {
    /// Worktree of the active trail if it exists, otherwise the repository root.
    pub fn stats_root(&self) -> Result<PathBuf> {
        let registry = load_registry(&self.paths.registry_path)?;
        let worktree = registry
            .active
            .as_deref()
            .and_then(|name| registry.get(name))
            .map(|record| self.paths.root.join(&record.worktree))
            .filter(|path| path.exists());
        Ok(worktree.unwrap_or_else(|| self.paths.root.clone()))
    }

    pub fn loc_stats(&self) -> Result<LocReport> {
        loc(&self.stats_root()?)
    }

    /// Estimated tokens of prompt-attached documents and the Measure prompt.
    pub fn token_stats(&self) -> Result<TokenReport> {
        let root = self.stats_root()?;
        let files: Vec<TokenEntry> = collect_docs(&root, &self.config.docs.context)?
            .into_iter()
            .map(|doc| TokenEntry::new(doc.path, doc.contents.len()))
            .collect();

        let registry = load_registry(&self.paths.registry_path)?;
        let measure_prompt = if registry.active.is_some() {
            let prompt = self.measure_prompt()?;
            Some(TokenEntry::new("measure prompt", prompt.len()))
        } else {
            None
        };

        let total_tokens = files.iter().map(|f| f.tokens).sum::<usize>()
            + measure_prompt.as_ref().map_or(0, |p| p.tokens);
        Ok(TokenReport {
            files,
            measure_prompt,
            total_tokens,
        })
    }
}
