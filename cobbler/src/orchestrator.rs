//! The orchestrator handle shared by every trail operation.
//!
//! [`Orchestrator`] owns the repository paths, the configuration value, the
//! root git handle and the agent. Lifecycle operations (`lifecycle`), the
//! cycle engine (`cycle`, `measure`, `stitch`) and recovery (`recovery`) are
//! implemented as `impl` blocks on it in their own modules.

use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, warn};

use crate::core::graph::TaskGraph;
use crate::core::types::TrailState;
use crate::error::CobblerError;
use crate::io::agent::Agent;
use crate::io::checkpoint::{Checkpoint, load_checkpoint, write_checkpoint};
use crate::io::config::CobblerConfig;
use crate::io::git::Git;
use crate::io::init::{CobblerPaths, TrailPaths, create_dir};
use crate::io::lock::OrchestratorLock;
use crate::io::registry::{Registry, TrailRecord, load_registry, write_registry};
use crate::io::tracker::{TaskEvent, TaskStore};

pub struct Orchestrator<A: Agent> {
    pub(crate) paths: CobblerPaths,
    pub(crate) config: CobblerConfig,
    pub(crate) agent: A,
    pub(crate) repo: Git,
}

impl<A: Agent> Orchestrator<A> {
    /// Create an orchestrator for the repository at `root`.
    ///
    /// Fails if `root` is not inside a git repository.
    pub fn new(root: impl Into<PathBuf>, config: CobblerConfig, agent: A) -> Result<Self> {
        let root = root.into();
        let repo = Git::new(&root);
        if !repo.is_repo() {
            return Err(anyhow!("{} is not a git repository", root.display()));
        }
        config.validate().context("invalid configuration")?;
        Ok(Self {
            paths: CobblerPaths::new(root),
            config,
            agent,
            repo,
        })
    }

    pub fn paths(&self) -> &CobblerPaths {
        &self.paths
    }

    pub fn config(&self) -> &CobblerConfig {
        &self.config
    }

    pub fn agent(&self) -> &A {
        &self.agent
    }

    /// Take the process-wide orchestrator lock for a mutating command.
    pub(crate) fn lock(&self, subject: &str) -> Result<OrchestratorLock> {
        create_dir(&self.paths.state_dir)?;
        OrchestratorLock::acquire(&self.paths.lock_path, subject)
    }

    /// Load the registry while holding the lock.
    ///
    /// With the lock held no other process can be driving a trail, so any
    /// persisted `Running` state belongs to a dead process and is rewritten
    /// as `Interrupted`.
    pub(crate) fn load_registry_locked(&self) -> Result<Registry> {
        let mut registry = load_registry(&self.paths.registry_path)?;
        let mut changed = false;
        for record in &mut registry.trails {
            if record.state == TrailState::Running {
                warn!(trail = %record.name, "trail was running without a live process; marking interrupted");
                record.set_state(TrailState::Interrupted);
                changed = true;
            }
        }
        if changed {
            self.save_registry(&registry)?;
        }
        Ok(registry)
    }

    pub(crate) fn save_registry(&self, registry: &Registry) -> Result<()> {
        write_registry(&self.paths.registry_path, registry)
    }

    /// Branch trails fork from: configured, or whatever the root has checked out.
    pub(crate) fn base_branch(&self) -> Result<String> {
        match &self.config.git.main_branch {
            Some(branch) => Ok(branch.clone()),
            None => self.repo.current_branch(),
        }
    }

    /// Re-create a trail's worktree from its branch if it was removed.
    ///
    /// Returns true if the worktree had to be re-created.
    pub(crate) fn ensure_worktree(&self, record: &TrailRecord) -> Result<bool> {
        let path = self.paths.root.join(&record.worktree);
        if path.exists() {
            return Ok(false);
        }
        if !self.repo.branch_exists(&record.branch)? {
            return Err(CobblerError::TrailNotFound {
                name: record.name.clone(),
                detail: format!("branch {} no longer exists", record.branch),
            }
            .into());
        }
        info!(trail = %record.name, path = %path.display(), "re-creating worktree from branch");
        self.repo.worktree_prune()?;
        self.repo.worktree_add(&path, &record.branch)?;
        Ok(true)
    }

    /// Open the persisted state of a trail.
    pub(crate) fn open_session(&self, record: &TrailRecord) -> Result<TrailSession> {
        self.ensure_worktree(record)?;
        let trail_paths = self.paths.trail(&record.name);
        let store = TaskStore::new(&trail_paths);
        let graph = TaskGraph::new(store.load()?)
            .with_context(|| format!("load task graph of trail '{}'", record.name))?;
        let checkpoint = load_checkpoint(&trail_paths.checkpoint_path)?;
        debug!(
            trail = %record.name,
            tasks = graph.len(),
            checkpoint_cycle = checkpoint.cycle_index,
            "session opened"
        );
        Ok(TrailSession {
            name: record.name.clone(),
            worktree: Git::new(self.paths.root.join(&record.worktree)),
            scratch: self.paths.scratch(&record.name),
            trail_paths,
            store,
            graph,
            checkpoint,
        })
    }

    /// Commit pending edits in the active trail's worktree before another
    /// trail takes over.
    ///
    /// Only a `Started` trail is parked: the uncommitted edits of an
    /// interrupted trail belong to an in-flight task and are left for
    /// Resume to discard. Returns the parking commit, if one was made.
    pub(crate) fn park(&self, registry: &Registry) -> Result<Option<String>> {
        let Some(active) = registry.active.as_deref() else {
            return Ok(None);
        };
        let Some(record) = registry.get(active) else {
            return Ok(None);
        };
        if record.state != TrailState::Started || !self.paths.root.join(&record.worktree).exists()
        {
            return Ok(None);
        }
        let mut session = self.open_session(record)?;
        let commit = session.save_work(&format!("cobbler: park trail {active}"))?;
        if let Some(sha) = &commit {
            info!(trail = %active, commit = %sha, "parked trail");
        }
        Ok(commit)
    }
}

/// Loaded state of one trail: its worktree, task graph and checkpoint.
pub(crate) struct TrailSession {
    pub name: String,
    pub worktree: Git,
    pub trail_paths: TrailPaths,
    pub scratch: PathBuf,
    pub store: TaskStore,
    pub graph: TaskGraph,
    pub checkpoint: Checkpoint,
}

impl TrailSession {
    /// Persist the task graph and log `events`.
    pub fn persist(&self, events: &[TaskEvent]) -> Result<()> {
        self.store.commit(self.graph.tasks(), events)
    }

    /// Point the checkpoint at the current HEAD and task states, and write it.
    pub fn checkpoint_now(&mut self) -> Result<()> {
        let head = self.worktree.head_sha()?;
        self.checkpoint.update(&head, self.graph.tasks());
        write_checkpoint(&self.trail_paths.checkpoint_path, &self.checkpoint)
    }

    /// Commit any pending edits and move the checkpoint to the new HEAD.
    ///
    /// Used when the orchestrator itself adds a commit outside a task
    /// (parking, stopping, starting a run), so the checkpoint keeps
    /// matching HEAD.
    pub fn save_work(&mut self, message: &str) -> Result<Option<String>> {
        let committed = self.worktree.commit_all(message, false)?;
        let head = self.worktree.head_sha()?;
        if head != self.checkpoint.commit {
            debug!(trail = %self.name, commit = %head, "moving checkpoint to HEAD");
            self.checkpoint.commit = head.clone();
            write_checkpoint(&self.trail_paths.checkpoint_path, &self.checkpoint)?;
        }
        Ok(committed.then_some(head))
    }

    /// Ids of tasks currently being executed.
    pub fn in_flight(&self) -> Vec<String> {
        self.graph.in_progress()
    }
}
