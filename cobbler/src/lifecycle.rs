//! Trail lifecycle operations: start, run, stop, list, switch and reset.
//!
//! Every mutating operation takes the orchestrator lock, checks its
//! precondition against the persisted state before touching git, and
//! rewrites the registry atomically once the transition is done.

use std::path::PathBuf;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::core::graph::TaskGraph;
use crate::core::ids::validate_id;
use crate::core::lifecycle::{TrailOp, check, observe};
use crate::core::recovery::resume_phase;
use crate::core::types::{StatusCounts, TrailState};
use crate::cycle::CycleReport;
use crate::error::CobblerError;
use crate::io::agent::Agent;
use crate::io::checkpoint::{Checkpoint, write_checkpoint};
use crate::io::config::{CobblerConfig, WhenUnspecified};
use crate::io::git::Git;
use crate::io::init::{CobblerPaths, InitOutcome, create_dir, init_layout, remove_dir_if_exists};
use crate::io::lock::OrchestratorLock;
use crate::io::registry::{Registry, TrailRecord, load_registry};
use crate::io::tracker::TaskStore;
use crate::orchestrator::Orchestrator;

/// Branch name of a trail.
pub fn trail_branch(name: &str) -> String {
    format!("trail/{name}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartOutcome {
    pub name: String,
    pub branch: String,
    pub worktree: PathBuf,
    pub base_branch: String,
    /// Commit the trail forked from.
    pub commit: String,
    /// Commit made while parking the previously active trail.
    pub parked: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunOutcome {
    pub name: String,
    pub cycles: Vec<CycleReport>,
    pub cycles_completed: u32,
    pub cycle_budget: u32,
    pub counts: StatusCounts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeKind {
    FastForward,
    MergeCommit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopOutcome {
    pub name: String,
    pub merge: MergeKind,
    pub merge_commit: String,
    pub cycles_completed: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchOutcome {
    pub from: Option<String>,
    pub to: String,
    pub parked: Option<String>,
    pub recreated_worktree: bool,
}

/// One row of `trail list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrailSummary {
    pub name: String,
    pub state: TrailState,
    pub active: bool,
    pub branch: String,
    pub cycles_completed: u32,
    pub cycle_budget: u32,
    pub tasks: StatusCounts,
    pub worktree_present: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetOutcome {
    pub name: String,
    /// False when the trail was already absent (nothing was done).
    pub existed: bool,
}

/// Cycle count for `trail run [n]` and whether the run stops when idle.
///
/// `None` and `Some(0)` fall back to the configured behavior.
pub fn resolve_cycle_count(requested: Option<u32>, config: &CobblerConfig) -> (u32, bool) {
    match requested {
        Some(n) if n > 0 => (n, false),
        _ => match config.cycles.when_unspecified {
            WhenUnspecified::Default => (config.cycles.default, false),
            WhenUnspecified::UntilIdle => (config.cycles.until_idle_cap, true),
        },
    }
}

impl<A: Agent> Orchestrator<A> {
    /// Create `.cobbler/` and its git exclude entry.
    pub fn init(&self) -> Result<InitOutcome> {
        let _lock = self.lock("tracker")?;
        init_layout(&self.paths, &self.repo, &self.config.git.exclude_entry)
    }

    /// Create a trail on a new branch and worktree and make it active.
    #[instrument(skip_all, fields(trail = %name))]
    pub fn start(&self, name: &str) -> Result<StartOutcome> {
        validate_id(name).map_err(|err| anyhow!("invalid trail name: {err}"))?;
        let _lock = self.lock(name)?;
        let mut registry = self.load_registry_locked()?;

        let branch = trail_branch(name);
        let worktree_rel = CobblerPaths::worktree_rel(name);
        let worktree = self.paths.root.join(&worktree_rel);
        let exists = |detail: String| -> anyhow::Error {
            CobblerError::TrailExists {
                name: name.to_string(),
                detail,
            }
            .into()
        };
        if let Some(record) = registry.get(name) {
            return Err(exists(format!("registered as {}", record.state)));
        }
        if self.repo.branch_exists(&branch)? {
            return Err(exists(format!("branch {branch} already exists")));
        }
        if worktree.exists() {
            return Err(exists(format!("worktree {} already exists", worktree.display())));
        }

        init_layout(&self.paths, &self.repo, &self.config.git.exclude_entry)?;
        let base_branch = self.base_branch()?;
        let parked = self.park(&registry)?;
        self.repo
            .worktree_add_new_branch(&worktree, &branch, &base_branch)?;

        let trail_paths = self.paths.trail(name);
        create_dir(&trail_paths.dir)?;
        TaskStore::new(&trail_paths).save(&[])?;
        let commit = Git::new(&worktree).head_sha()?;
        write_checkpoint(
            &trail_paths.checkpoint_path,
            &Checkpoint::initial(name, &commit),
        )?;

        let now = Utc::now();
        registry.insert(TrailRecord {
            name: name.to_string(),
            branch: branch.clone(),
            worktree: worktree_rel,
            base_branch: base_branch.clone(),
            state: TrailState::Started,
            cycle_budget: 0,
            cycles_completed: 0,
            until_idle: false,
            created_at: now,
            updated_at: now,
            checkpoint: trail_paths
                .checkpoint_path
                .strip_prefix(&self.paths.root)
                .map(PathBuf::from)
                .unwrap_or_else(|_| trail_paths.checkpoint_path.clone()),
            stopped_at: None,
            merge_commit: None,
        });
        registry.active = Some(name.to_string());
        self.save_registry(&registry)?;
        info!(branch = %branch, base = %base_branch, commit = %commit, "trail started");

        Ok(StartOutcome {
            name: name.to_string(),
            branch,
            worktree,
            base_branch,
            commit,
            parked,
        })
    }

    /// Run `cycles` more cycles on the active trail.
    #[instrument(skip_all, fields(?cycles))]
    pub fn run(&self, cycles: Option<u32>) -> Result<RunOutcome> {
        let _lock = self.lock("active trail")?;
        let mut registry = self.load_registry_locked()?;
        let name = registry.active_name()?;
        let record = registry.require(&name)?.clone();
        check(&name, record.state, TrailOp::Run)?;

        let (count, until_idle) = resolve_cycle_count(cycles, &self.config);
        let mut session = self.open_session(&record)?;
        session.save_work(&format!("cobbler: save work before run on trail {name}"))?;

        // A cycle opened by a standalone Measure continues in Stitch and
        // counts toward this run.
        let next = record.cycles_completed + 1;
        let phase = resume_phase(
            next,
            session.checkpoint.measured_cycle,
            session.graph.tasks(),
            &session.checkpoint.tasks,
        );

        let record = registry.require_mut(&name)?;
        record.cycle_budget = record.cycles_completed.saturating_add(count);
        record.until_idle = until_idle;
        info!(trail = %name, count, until_idle, budget = record.cycle_budget, ?phase, "run requested");

        let reports = self.drive(&mut registry, &mut session, phase, false)?;
        let record = registry.require(&name)?;
        Ok(RunOutcome {
            name: name.clone(),
            cycles: reports,
            cycles_completed: record.cycles_completed,
            cycle_budget: record.cycle_budget,
            counts: session.graph.counts(),
        })
    }

    /// Merge a trail into its base branch and retire its worktree.
    #[instrument(skip_all, fields(?name))]
    pub fn stop(&self, name: Option<&str>) -> Result<StopOutcome> {
        let _lock = self.lock(name.unwrap_or("active trail"))?;
        let mut registry = self.load_registry_locked()?;
        let name = match name {
            Some(name) => name.to_string(),
            None => registry.active_name()?,
        };
        let record = registry.require(&name)?.clone();
        check(&name, record.state, TrailOp::Stop)?;

        let mut session = self.open_session(&record)?;
        if let Some(task) = session.in_flight().first() {
            return Err(CobblerError::TrailBusy {
                name: name.clone(),
                detail: format!("task '{task}' is in progress (resume the trail first)"),
            }
            .into());
        }
        let current = self.repo.current_branch()?;
        if current != record.base_branch {
            return Err(anyhow!(
                "cannot merge trail '{name}': repository root is on '{current}', expected '{}'",
                record.base_branch
            ));
        }

        session.save_work(&format!("cobbler: final changes on trail {name}"))?;
        let merge = if self.repo.merge_ff_only(&record.branch)? {
            MergeKind::FastForward
        } else {
            self.repo
                .merge_no_ff(&record.branch, &format!("Merge trail '{name}'"))?;
            MergeKind::MergeCommit
        };
        let merge_commit = self.repo.head_sha()?;
        let worktree = self.paths.root.join(&record.worktree);
        self.repo.worktree_remove(&worktree)?;
        self.repo.worktree_prune()?;

        let record = registry.require_mut(&name)?;
        record.set_state(TrailState::Stopped);
        record.stopped_at = Some(Utc::now());
        record.merge_commit = Some(merge_commit.clone());
        let cycles_completed = record.cycles_completed;
        if registry.active.as_deref() == Some(name.as_str()) {
            registry.active = None;
        }
        self.save_registry(&registry)?;
        info!(trail = %name, ?merge, commit = %merge_commit, "trail stopped");

        Ok(StopOutcome {
            name,
            merge,
            merge_commit,
            cycles_completed,
        })
    }

    /// Enumerate trails in creation order. Read-only; takes no lock.
    pub fn list(&self) -> Result<Vec<TrailSummary>> {
        let registry = load_registry(&self.paths.registry_path)?;
        let owner_alive = OrchestratorLock::is_held(&self.paths.lock_path)?;
        let mut rows = Vec::new();
        for record in registry.by_creation() {
            let tasks = TaskStore::new(&self.paths.trail(&record.name)).load()?;
            rows.push(TrailSummary {
                name: record.name.clone(),
                state: observe(record.state, owner_alive),
                active: registry.active.as_deref() == Some(record.name.as_str()),
                branch: record.branch.clone(),
                cycles_completed: record.cycles_completed,
                cycle_budget: record.cycle_budget,
                tasks: StatusCounts::from_tasks(&tasks),
                worktree_present: self.paths.root.join(&record.worktree).exists(),
                created_at: record.created_at,
            });
        }
        Ok(rows)
    }

    /// Park the active trail and make `target` active.
    #[instrument(skip_all, fields(target = %target))]
    pub fn switch(&self, target: &str) -> Result<SwitchOutcome> {
        let _lock = self.lock(target)?;
        let mut registry = self.load_registry_locked()?;
        let record = registry.require(target)?.clone();
        check(target, record.state, TrailOp::Switch)?;

        let from = registry.active.clone();
        let parked = if from.as_deref() == Some(target) {
            None
        } else {
            self.park(&registry)?
        };
        let recreated_worktree = self.ensure_worktree(&record)?;
        registry.active = Some(target.to_string());
        self.save_registry(&registry)?;
        info!(from = ?from, recreated_worktree, "switched trail");

        Ok(SwitchOutcome {
            from,
            to: target.to_string(),
            parked,
            recreated_worktree,
        })
    }

    /// Destroy a trail's branch, worktree and state. A missing trail is a no-op.
    #[instrument(skip_all, fields(trail = %name))]
    pub fn reset_trail(&self, name: &str) -> Result<ResetOutcome> {
        let _lock = self.lock(name)?;
        let mut registry = self.load_registry_locked()?;
        let Some(record) = registry.get(name).cloned() else {
            info!("trail absent, nothing to reset");
            return Ok(ResetOutcome {
                name: name.to_string(),
                existed: false,
            });
        };
        check(name, record.state, TrailOp::Reset)?;
        self.destroy_trail(&record)?;
        registry.remove(name);
        self.save_registry(&registry)?;
        Ok(ResetOutcome {
            name: name.to_string(),
            existed: true,
        })
    }

    /// Reset every trail, then remove scratch output and tracker state.
    ///
    /// Returns the names of the trails that were destroyed.
    pub fn reset_all(&self) -> Result<Vec<String>> {
        let _lock = self.lock("all trails")?;
        let registry = self.load_registry_locked()?;
        let mut names = Vec::new();
        for record in registry.by_creation() {
            check(&record.name, record.state, TrailOp::Reset)?;
            self.destroy_trail(record)?;
            names.push(record.name.clone());
        }
        for dir in [
            &self.paths.scratch_dir,
            &self.paths.trails_dir,
            &self.paths.worktrees_dir,
        ] {
            remove_dir_if_exists(dir)?;
        }
        self.save_registry(&Registry::default())?;
        info!(trails = names.len(), "full reset complete");
        Ok(names)
    }

    /// Archive the task store of a trail and start over with no tasks.
    ///
    /// Returns the archive directory, if there was anything to archive.
    #[instrument(skip_all, fields(?name))]
    pub fn reset_tracker(&self, name: Option<&str>) -> Result<Option<PathBuf>> {
        let _lock = self.lock(name.unwrap_or("active trail"))?;
        let mut registry = self.load_registry_locked()?;
        let name = match name {
            Some(name) => name.to_string(),
            None => registry.active_name()?,
        };
        let record = registry.require(&name)?.clone();
        check(&name, record.state, TrailOp::TrackerReset)?;

        let mut session = self.open_session(&record)?;
        let archive = session.store.archive(&session.trail_paths.archive_dir)?;
        session.graph = TaskGraph::default();
        session.persist(&[])?;
        if record.state == TrailState::Interrupted {
            warn!(trail = %name, "discarding in-flight work of interrupted trail");
            session.worktree.discard_changes()?;
            let record = registry.require_mut(&name)?;
            record.cycle_budget = record.cycles_completed;
            record.set_state(TrailState::Started);
        }
        session.checkpoint.measured_cycle = None;
        session.checkpoint.cycle_index = record.cycles_completed;
        session.checkpoint_now()?;
        self.save_registry(&registry)?;
        info!(trail = %name, archive = ?archive, "tracker reset");
        Ok(archive)
    }

    /// Remove a trail's worktree, branch, state directory and scratch output.
    fn destroy_trail(&self, record: &TrailRecord) -> Result<()> {
        let worktree = self.paths.root.join(&record.worktree);
        if worktree.exists()
            && let Err(err) = self.repo.worktree_remove(&worktree)
        {
            warn!(error = %format!("{err:#}"), "git worktree remove failed, deleting directory");
            remove_dir_if_exists(&worktree)?;
        }
        self.repo.worktree_prune()?;
        if self.repo.branch_exists(&record.branch)? {
            self.repo.delete_branch(&record.branch)?;
        }
        remove_dir_if_exists(&self.paths.trail(&record.name).dir)?;
        remove_dir_if_exists(&self.paths.scratch(&record.name))?;
        info!(trail = %record.name, "trail destroyed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_or_missing_count_uses_config_default() {
        let mut cfg = CobblerConfig::default();
        cfg.cycles.default = 4;
        assert_eq!(resolve_cycle_count(None, &cfg), (4, false));
        assert_eq!(resolve_cycle_count(Some(0), &cfg), (4, false));
        assert_eq!(resolve_cycle_count(Some(2), &cfg), (2, false));
    }

    #[test]
    fn until_idle_uses_cap() {
        let mut cfg = CobblerConfig::default();
        cfg.cycles.when_unspecified = WhenUnspecified::UntilIdle;
        cfg.cycles.until_idle_cap = 7;
        assert_eq!(resolve_cycle_count(Some(0), &cfg), (7, true));
        assert_eq!(resolve_cycle_count(Some(3), &cfg), (3, false));
    }

    #[test]
    fn trail_branch_is_namespaced() {
        assert_eq!(trail_branch("demo"), "trail/demo");
    }
}
