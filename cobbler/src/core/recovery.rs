//! Recovery decisions for interrupted trails.
//!
//! Given the last checkpoint and what is observed in the worktree, decide
//! whether resumption is clean, needs a one-commit rollback, or is stale.
//! Task commits carry a `Cobbler-Task: <id>` trailer; that trailer is how a
//! commit made after the last checkpoint is attributed to an in-flight task.

use std::collections::BTreeMap;

use crate::core::types::{CyclePhase, StatusChange, Task, TaskStatus};

pub const TASK_TRAILER: &str = "Cobbler-Task";
pub const CYCLE_TRAILER: &str = "Cobbler-Cycle";

/// Build the commit message for a stitched task.
pub fn task_commit_message(task_id: &str, title: &str, cycle: u32) -> String {
    format!("cobbler: {title}\n\n{TASK_TRAILER}: {task_id}\n{CYCLE_TRAILER}: {cycle}\n")
}

/// Extract a trailer value from a commit message.
pub fn parse_trailer(message: &str, key: &str) -> Option<String> {
    message.lines().rev().find_map(|line| {
        let (k, v) = line.split_once(':')?;
        if k.trim() == key {
            let v = v.trim();
            (!v.is_empty()).then(|| v.to_string())
        } else {
            None
        }
    })
}

/// What the worktree looks like at resume time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadState {
    pub head: String,
    pub parent: Option<String>,
    /// Task trailer of the HEAD commit, if any.
    pub head_task: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// HEAD is the checkpoint commit.
    Clean,
    /// HEAD is one task commit past the checkpoint for an in-flight task whose
    /// outcome never reached the checkpoint; reset to the checkpoint and
    /// re-execute the task.
    RollBack { task_id: String },
    /// History moved in a way the orchestrator cannot attribute.
    Stale,
}

pub fn classify(checkpoint_commit: &str, head: &HeadState, in_flight: &[String]) -> Verdict {
    if head.head == checkpoint_commit {
        return Verdict::Clean;
    }
    if head.parent.as_deref() == Some(checkpoint_commit)
        && let Some(task_id) = &head.head_task
        && in_flight.iter().any(|id| id == task_id)
    {
        return Verdict::RollBack {
            task_id: task_id.clone(),
        };
    }
    Verdict::Stale
}

/// Bring the task store forward to the checkpoint snapshot.
///
/// Task outcomes reach the checkpoint before the store, so the store may lag
/// it. Statuses only ever move forward.
pub fn reconcile(tasks: &mut [Task], snapshot: &BTreeMap<String, TaskStatus>) -> Vec<StatusChange> {
    let mut changes = Vec::new();
    for task in tasks.iter_mut() {
        let Some(&recorded) = snapshot.get(&task.id) else {
            continue;
        };
        if recorded.rank() > task.status.rank() {
            changes.push(StatusChange {
                task_id: task.id.clone(),
                from: task.status,
                to: recorded,
            });
            task.status = recorded;
        }
    }
    changes
}

/// Phase the next incomplete cycle resumes in.
///
/// Stitch if that cycle's Measure already committed its tasks: either the
/// checkpoint says so, or the store holds tasks of that cycle that no
/// checkpoint has seen yet.
pub fn resume_phase(
    next_cycle: u32,
    measured_cycle: Option<u32>,
    tasks: &[Task],
    snapshot: &BTreeMap<String, TaskStatus>,
) -> CyclePhase {
    if measured_cycle == Some(next_cycle) {
        return CyclePhase::Stitch;
    }
    let unseen = tasks
        .iter()
        .any(|t| t.origin_cycle == next_cycle && !snapshot.contains_key(&t.id));
    if unseen {
        CyclePhase::Stitch
    } else {
        CyclePhase::Measure
    }
}
