//! Git adapter for orchestrator commands.
//!
//! Trails live on their own branch in their own worktree, and every task
//! outcome is a commit, so we keep a small, explicit wrapper around `git`
//! subprocess calls. Failures surface as [`CobblerError::GitOperation`].

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::error::CobblerError;

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// True if the working directory is inside a git repository.
    pub fn is_repo(&self) -> bool {
        self.run(&["rev-parse", "--git-dir"])
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    /// Directory shared by all worktrees (`.git` of the main checkout).
    pub fn common_dir(&self) -> Result<PathBuf> {
        let out = self.run_capture(&["rev-parse", "--git-common-dir"])?;
        let dir = PathBuf::from(out.trim());
        Ok(if dir.is_absolute() {
            dir
        } else {
            self.workdir.join(dir)
        })
    }

    /// Return the current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD in {}", self.workdir.display()));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    /// Full SHA of HEAD.
    pub fn head_sha(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    /// Resolve a revision to a commit SHA, or `None` if it does not exist.
    pub fn rev_parse(&self, rev: &str) -> Result<Option<String>> {
        let spec = format!("{rev}^{{commit}}");
        let out = self.run(&["rev-parse", "--verify", "--quiet", &spec])?;
        if !out.status.success() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&out.stdout).trim().to_string()))
    }

    /// First parent of `rev`, or `None` for a root commit.
    pub fn parent_of(&self, rev: &str) -> Result<Option<String>> {
        self.rev_parse(&format!("{rev}^"))
    }

    /// Full commit message of `rev`.
    pub fn commit_message(&self, rev: &str) -> Result<String> {
        self.run_capture(&["log", "-1", "--format=%B", rev])
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// True if the worktree has any staged, unstaged or untracked change.
    pub fn is_dirty(&self) -> Result<bool> {
        Ok(!self.status_porcelain()?.is_empty())
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let status = self
            .run(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])?
            .status;
        Ok(status.success())
    }

    /// Force-delete a local branch.
    #[instrument(skip_all, fields(branch = %branch))]
    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "deleting branch");
        self.run_checked(&["branch", "-D", branch])?;
        Ok(())
    }

    #[instrument(skip_all, fields(rev = %rev))]
    pub fn reset_hard(&self, rev: &str) -> Result<()> {
        debug!(rev, "hard reset");
        self.run_checked(&["reset", "--hard", rev])?;
        self.run_checked(&["clean", "-fd"])?;
        Ok(())
    }

    /// Discard every uncommitted change.
    pub fn discard_changes(&self) -> Result<()> {
        self.reset_hard("HEAD")
    }

    /// Fast-forward the current branch to `branch` if possible.
    ///
    /// Returns false (and leaves the tree untouched) when a fast-forward is
    /// not possible.
    #[instrument(skip_all, fields(branch = %branch))]
    pub fn merge_ff_only(&self, branch: &str) -> Result<bool> {
        let out = self.run(&["merge", "--ff-only", branch])?;
        debug!(success = out.status.success(), "fast-forward attempt");
        Ok(out.status.success())
    }

    /// Merge `branch` with a merge commit; a conflicting merge is aborted.
    #[instrument(skip_all, fields(branch = %branch))]
    pub fn merge_no_ff(&self, branch: &str, message: &str) -> Result<()> {
        let args = ["merge", "--no-ff", "-m", message, branch];
        let out = self.run(&args)?;
        if out.status.success() {
            return Ok(());
        }
        warn!(branch, "merge failed, aborting");
        let abort = self.run(&["merge", "--abort"])?;
        if !abort.status.success() {
            warn!(
                stderr = %String::from_utf8_lossy(&abort.stderr).trim(),
                "merge --abort failed"
            );
        }
        let mut detail = String::from_utf8_lossy(&out.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&out.stderr);
        if !stderr.trim().is_empty() {
            detail.push('\n');
            detail.push_str(stderr.trim());
        }
        Err(CobblerError::GitOperation {
            command: args.join(" "),
            stderr: detail,
        }
        .into())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CobblerError::GitOperation {
                command: args.join(" "),
                stderr: stderr.trim().to_string(),
            }
            .into());
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn path_arg(path: &Path) -> Result<&str> {
    path.to_str()
        .with_context(|| format!("path is not valid UTF-8: {}", path.display()))
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}
