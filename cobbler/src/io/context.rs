//! Project context gathered from a trail worktree for agent prompts.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

use crate::core::graph::TaskGraph;
use crate::core::types::{Task, TaskStatus};
use crate::io::config::CobblerConfig;
use crate::io::prompt::{DocFile, MeasureInputs, StitchInputs, TaskContext};

/// Directories never summarized or attached.
const SKIP_DIRS: &[&str] = &[".git", ".cobbler", "target", "node_modules"];
/// Extensions attached when a docs entry is a directory.
const DOC_EXTENSIONS: &[&str] = &["md", "markdown", "txt", "yaml", "yml", "toml"];

fn is_skipped(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| SKIP_DIRS.contains(&name))
}

/// Relative paths of every regular file under `root`, sorted.
pub fn project_files(root: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_skipped(e))
    {
        let entry = entry.with_context(|| format!("walk {}", root.display()))?;
        // Worktrees have a `.git` file rather than a directory.
        if !entry.file_type().is_file() || entry.file_name() == ".git" {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .with_context(|| format!("strip prefix {}", root.display()))?;
        files.push(rel.to_string_lossy().replace('\\', "/"));
    }
    Ok(files)
}

/// One line per file (`path (N lines)`), capped at `max_files`.
pub fn source_summary(root: &Path, max_files: usize) -> Result<String> {
    let files = project_files(root)?;
    let mut out = String::new();
    for rel in files.iter().take(max_files) {
        let lines = fs::read(root.join(rel))
            .map(|bytes| bytes.iter().filter(|&&b| b == b'\n').count())
            .unwrap_or(0);
        out.push_str(&format!("{rel} ({lines} lines)\n"));
    }
    if files.len() > max_files {
        out.push_str(&format!("... and {} more files\n", files.len() - max_files));
    }
    debug!(files = files.len(), "source summary built");
    Ok(out)
}

/// Read the configured documentation entries (files, or directories of
/// text documents) relative to `root`. Missing entries are skipped.
pub fn collect_docs(root: &Path, entries: &[String]) -> Result<Vec<DocFile>> {
    let mut docs = Vec::new();
    for entry in entries {
        let path = root.join(entry);
        if path.is_file() {
            docs.push(read_doc(root, &path)?);
        } else if path.is_dir() {
            for item in WalkDir::new(&path)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(|e| !is_skipped(e))
            {
                let item = item.with_context(|| format!("walk {}", path.display()))?;
                let is_doc = item
                    .path()
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|ext| DOC_EXTENSIONS.contains(&ext));
                if item.file_type().is_file() && is_doc {
                    docs.push(read_doc(root, item.path())?);
                }
            }
        } else {
            debug!(entry = %entry, "docs entry missing, skipping");
        }
    }
    Ok(docs)
}

fn read_doc(root: &Path, path: &Path) -> Result<DocFile> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read doc {}", path.display()))?;
    let rel = path.strip_prefix(root).unwrap_or(path);
    Ok(DocFile {
        path: rel.to_string_lossy().replace('\\', "/"),
        contents,
    })
}

/// Assemble Measure inputs from the worktree and the current task set.
pub fn measure_inputs(
    trail: &str,
    cycle: u32,
    worktree: &Path,
    tasks: &[Task],
    config: &CobblerConfig,
) -> Result<MeasureInputs> {
    Ok(MeasureInputs {
        trail: trail.to_string(),
        cycle,
        source_summary: source_summary(worktree, config.prompt.source_summary_max_files)?,
        docs: collect_docs(worktree, &config.docs.context)?,
        tasks: tasks.iter().map(TaskContext::from_task).collect(),
        failures: tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .map(TaskContext::from_task)
            .collect(),
    })
}

/// Assemble Stitch inputs for one task.
pub fn stitch_inputs(
    trail: &str,
    cycle: u32,
    worktree: &Path,
    graph: &TaskGraph,
    task_id: &str,
    config: &CobblerConfig,
) -> Result<StitchInputs> {
    let task = graph
        .get(task_id)
        .with_context(|| format!("unknown task '{task_id}'"))?;
    let dependencies = task
        .depends_on
        .iter()
        .filter_map(|dep| graph.get(dep))
        .map(TaskContext::from_task)
        .collect();
    Ok(StitchInputs {
        trail: trail.to_string(),
        cycle,
        task: TaskContext::from_task(task),
        dependencies,
        source_summary: source_summary(worktree, config.prompt.source_summary_max_files)?,
        docs: collect_docs(worktree, &config.docs.context)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(root: &Path, rel: &str, contents: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, contents).expect("write");
    }

    #[test]
    fn summary_skips_state_and_build_dirs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        write(root, "src/main.rs", "fn main() {}\n\n");
        write(root, "target/debug/out", "binary");
        write(root, ".cobbler/registry.json", "{}");
        write(root, ".git", "gitdir: elsewhere\n");

        let summary = source_summary(root, 10).expect("summary");
        assert_eq!(summary, "src/main.rs (2 lines)\n");
    }

    #[test]
    fn summary_reports_overflow() {
        let temp = tempfile::tempdir().expect("tempdir");
        for name in ["a.rs", "b.rs", "c.rs"] {
            write(temp.path(), name, "x\n");
        }
        let summary = source_summary(temp.path(), 2).expect("summary");
        assert!(summary.starts_with("a.rs (1 lines)\nb.rs (1 lines)\n"));
        assert!(summary.ends_with("... and 1 more files\n"));
    }

    #[test]
    fn docs_accept_files_and_directories() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        write(root, "README.md", "# Readme\n");
        write(root, "docs/b.md", "b");
        write(root, "docs/a.md", "a");
        write(root, "docs/diagram.png", "png");

        let docs = collect_docs(
            root,
            &["README.md".to_string(), "docs".to_string(), "missing".to_string()],
        )
        .expect("docs");
        let paths: Vec<&str> = docs.iter().map(|d| d.path.as_str()).collect();
        assert_eq!(paths, vec!["README.md", "docs/a.md", "docs/b.md"]);
    }
}
