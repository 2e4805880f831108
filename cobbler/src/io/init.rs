//! Canonical `.cobbler/` layout and tracker scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::io::git::Git;

/// Name of the orchestrator state directory at the repository root.
pub const STATE_DIR: &str = ".cobbler";
/// Config file name at the repository root.
pub const CONFIG_FILE: &str = "cobbler.toml";

/// All canonical paths within `.cobbler/` for a repository root.
#[derive(Debug, Clone)]
pub struct CobblerPaths {
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub config_path: PathBuf,
    pub registry_path: PathBuf,
    pub lock_path: PathBuf,
    pub trails_dir: PathBuf,
    pub worktrees_dir: PathBuf,
    pub scratch_dir: PathBuf,
}

impl CobblerPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let state_dir = root.join(STATE_DIR);
        Self {
            root: root.clone(),
            config_path: root.join(CONFIG_FILE),
            registry_path: state_dir.join("registry.json"),
            lock_path: state_dir.join("orchestrator.lock"),
            trails_dir: state_dir.join("trails"),
            worktrees_dir: state_dir.join("worktrees"),
            scratch_dir: state_dir.join("scratch"),
            state_dir,
        }
    }

    /// Worktree path of a trail, relative to the repository root.
    pub fn worktree_rel(name: &str) -> PathBuf {
        Path::new(STATE_DIR).join("worktrees").join(name)
    }

    /// Absolute worktree path of a trail.
    pub fn worktree(&self, name: &str) -> PathBuf {
        self.worktrees_dir.join(name)
    }

    /// Scratch directory for one trail.
    pub fn scratch(&self, name: &str) -> PathBuf {
        self.scratch_dir.join(name)
    }

    pub fn trail(&self, name: &str) -> TrailPaths {
        TrailPaths::new(self.trails_dir.join(name))
    }
}

/// Paths of one trail's persisted state.
#[derive(Debug, Clone)]
pub struct TrailPaths {
    pub dir: PathBuf,
    pub tasks_path: PathBuf,
    pub events_path: PathBuf,
    pub checkpoint_path: PathBuf,
    pub cycles_dir: PathBuf,
    pub archive_dir: PathBuf,
}

impl TrailPaths {
    fn new(dir: PathBuf) -> Self {
        Self {
            tasks_path: dir.join("tasks.json"),
            events_path: dir.join("events.jsonl"),
            checkpoint_path: dir.join("checkpoint.json"),
            cycles_dir: dir.join("cycles"),
            archive_dir: dir.join("archive"),
            dir,
        }
    }

    pub fn cycle_dir(&self, index: u32) -> PathBuf {
        self.cycles_dir.join(index.to_string())
    }
}

/// Result of `init_layout`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitOutcome {
    /// True if the `.cobbler/` directory did not exist before.
    pub created: bool,
    /// True if the git exclude entry was added by this call.
    pub exclude_added: bool,
}

/// Create the `.cobbler/` layout and keep it out of git.
///
/// Idempotent: existing directories and exclude entries are left alone.
pub fn init_layout(paths: &CobblerPaths, repo: &Git, exclude_entry: &str) -> Result<InitOutcome> {
    let created = !paths.state_dir.exists();
    for dir in [
        &paths.state_dir,
        &paths.trails_dir,
        &paths.worktrees_dir,
        &paths.scratch_dir,
    ] {
        create_dir(dir)?;
    }

    let exclude_path = repo.common_dir()?.join("info").join("exclude");
    let exclude_added = ensure_exclude_entry(&exclude_path, exclude_entry)?;
    if created || exclude_added {
        info!(root = %paths.root.display(), exclude_added, "initialized tracker layout");
    }
    Ok(InitOutcome {
        created,
        exclude_added,
    })
}

/// Append `entry` to a git exclude file unless an identical line exists.
fn ensure_exclude_entry(path: &Path, entry: &str) -> Result<bool> {
    let existing = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    if existing.lines().any(|line| line.trim() == entry) {
        debug!(path = %path.display(), "exclude entry already present");
        return Ok(false);
    }
    let mut contents = existing;
    if !contents.is_empty() && !contents.ends_with('\n') {
        contents.push('\n');
    }
    contents.push_str(entry);
    contents.push('\n');
    if let Some(parent) = path.parent() {
        create_dir(parent)?;
    }
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))?;
    Ok(true)
}

/// Remove a directory tree if it exists.
pub fn remove_dir_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err).with_context(|| format!("remove {}", path.display())),
    }
}

pub fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}
