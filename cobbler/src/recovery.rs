//! Resume an interrupted trail from its last checkpoint.

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::core::graph::TaskGraph;
use crate::core::lifecycle::{TrailOp, check};
use crate::core::recovery::{
    HeadState, TASK_TRAILER, Verdict, classify, parse_trailer, reconcile, resume_phase,
};
use crate::core::types::{CyclePhase, TaskStatus};
use crate::cycle::CycleReport;
use crate::error::CobblerError;
use crate::io::agent::Agent;
use crate::io::checkpoint::write_checkpoint;
use crate::io::tracker::TaskEvent;
use crate::orchestrator::Orchestrator;

/// How the worktree was brought back in line with the checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recovery {
    /// HEAD matched the checkpoint; uncommitted edits were discarded.
    Clean,
    /// A task commit that never reached the checkpoint was dropped.
    RolledBack { task_id: String, discarded: String },
    /// `--force`: HEAD was adopted as the new checkpoint commit.
    Forced { previous: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeOutcome {
    pub name: String,
    pub recovery: Recovery,
    /// Cycle the run resumed in.
    pub cycle: u32,
    pub phase: CyclePhase,
    /// Tasks that were in progress when the trail was interrupted.
    pub in_flight: Vec<String>,
    pub cycles: Vec<CycleReport>,
    pub cycles_completed: u32,
    pub cycle_budget: u32,
}

impl<A: Agent> Orchestrator<A> {
    /// Restore the active trail from its checkpoint and finish its run.
    ///
    /// Fails with [`CobblerError::StaleCheckpoint`] when HEAD moved in a way
    /// that cannot be attributed to an in-flight task, unless `force` is set.
    #[instrument(skip_all, fields(force = force))]
    pub fn resume(&self, force: bool) -> Result<ResumeOutcome> {
        let _lock = self.lock("active trail")?;
        let mut registry = self.load_registry_locked()?;
        let name = registry.active_name()?;
        let record = registry.require(&name)?.clone();
        check(&name, record.state, TrailOp::Resume)?;

        let mut session = self.open_session(&record)?;
        let mut tasks = session.graph.tasks().to_vec();
        let reconciled = reconcile(&mut tasks, &session.checkpoint.tasks);
        let in_flight: Vec<String> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::InProgress)
            .map(|t| t.id.clone())
            .collect();

        let head = session.worktree.head_sha()?;
        let state = HeadState {
            parent: session.worktree.parent_of(&head)?,
            head_task: parse_trailer(&session.worktree.commit_message(&head)?, TASK_TRAILER),
            head: head.clone(),
        };
        let verdict = classify(&session.checkpoint.commit, &state, &in_flight);
        if verdict == Verdict::Stale && !force {
            return Err(CobblerError::StaleCheckpoint {
                trail: name.clone(),
                expected: session.checkpoint.commit.clone(),
                found: head,
            }
            .into());
        }

        if !reconciled.is_empty() {
            warn!(trail = %name, changes = reconciled.len(), "task store lagged checkpoint; reconciling");
            session.graph = TaskGraph::new(tasks)?;
            let cycle = session.checkpoint.cycle_index + 1;
            let events: Vec<TaskEvent> = reconciled
                .iter()
                .map(|change| TaskEvent::changed(change, cycle).with_note("reconciled from checkpoint"))
                .collect();
            session.persist(&events)?;
        }

        let recovery = match verdict {
            Verdict::Clean => {
                session.worktree.discard_changes()?;
                Recovery::Clean
            }
            Verdict::RollBack { task_id } => {
                warn!(trail = %name, task = %task_id, commit = %head, "rolling back unrecorded task commit");
                session.worktree.reset_hard(&session.checkpoint.commit)?;
                Recovery::RolledBack {
                    task_id,
                    discarded: head,
                }
            }
            Verdict::Stale => {
                let previous = session.checkpoint.commit.clone();
                warn!(trail = %name, previous = %previous, head = %head, "adopting HEAD as checkpoint commit");
                session.worktree.discard_changes()?;
                session.checkpoint.commit = head;
                write_checkpoint(&session.trail_paths.checkpoint_path, &session.checkpoint)?;
                Recovery::Forced { previous }
            }
        };

        let next = session.checkpoint.cycle_index + 1;
        let phase = resume_phase(
            next,
            session.checkpoint.measured_cycle,
            session.graph.tasks(),
            &session.checkpoint.tasks,
        );
        let record = registry.require_mut(&name)?;
        record.cycles_completed = session.checkpoint.cycle_index;
        // A cycle whose tasks were already measured is finished even if the
        // budget that started it was consumed elsewhere.
        if phase == CyclePhase::Stitch {
            record.cycle_budget = record.cycle_budget.max(next);
        }
        info!(
            trail = %name,
            cycle = next,
            ?phase,
            ?recovery,
            in_flight = ?in_flight,
            budget = record.cycle_budget,
            "resuming trail"
        );

        let cycles = self.drive(&mut registry, &mut session, phase, true)?;
        let record = registry.require(&name)?;
        Ok(ResumeOutcome {
            name: name.clone(),
            recovery,
            cycle: next,
            phase,
            in_flight,
            cycles,
            cycles_completed: record.cycles_completed,
            cycle_budget: record.cycle_budget,
        })
    }
}
