//! Shared deterministic types for the orchestrator core.
//!
//! These types define stable contracts between the cycle engine, the
//! readiness resolver and the persisted stores. They carry no I/O and
//! serialize deterministically.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Proposed,
    Blocked,
    Ready,
    InProgress,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Proposed => "proposed",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Ready => "ready",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
        }
    }

    /// Done and failed tasks never change status again.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }

    /// Position along the forward-only status progression.
    ///
    /// Used when reconciling two views of the same task: the view with the
    /// higher rank is the more recent one.
    pub fn rank(self) -> u8 {
        match self {
            TaskStatus::Proposed => 0,
            TaskStatus::Blocked => 1,
            TaskStatus::Ready => 2,
            TaskStatus::InProgress => 3,
            TaskStatus::Done | TaskStatus::Failed => 4,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work proposed by Measure and executed by Stitch.
///
/// Tasks are never deleted. Failed tasks keep their failure reason so the
/// next Measure can address them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub status: TaskStatus,
    /// Cycle whose Measure proposed this task.
    pub origin_cycle: u32,
    /// Creation sequence number, unique per trail.
    pub seq: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

/// Persisted lifecycle state of a generation trail.
///
/// `Uninitialized` and `Reset` have no representation: a trail in either
/// state has no registry record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrailState {
    Started,
    Running,
    Interrupted,
    Stopped,
}

impl TrailState {
    pub fn as_str(self) -> &'static str {
        match self {
            TrailState::Started => "started",
            TrailState::Running => "running",
            TrailState::Interrupted => "interrupted",
            TrailState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for TrailState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final status of a recorded cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    /// Every stitched task finished `done`.
    Complete,
    /// The cycle ended but some tasks failed, or it has not ended yet.
    Partial,
    /// The cycle aborted (Measure or git failure).
    Failed,
}

/// Phase a cycle starts (or resumes) in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Measure,
    Stitch,
}

/// Outcome of executing one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskOutcome {
    Done,
    Failed,
}

impl TaskOutcome {
    pub fn status(self) -> TaskStatus {
        match self {
            TaskOutcome::Done => TaskStatus::Done,
            TaskOutcome::Failed => TaskStatus::Failed,
        }
    }
}

/// One `(task id, outcome)` pair produced by Stitch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub outcome: TaskOutcome,
    /// Commit recorded for a done task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    pub detail: String,
}

/// A status change applied to one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub task_id: String,
    pub from: TaskStatus,
    pub to: TaskStatus,
}

/// Per-status task counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub proposed: usize,
    pub blocked: usize,
    pub ready: usize,
    pub in_progress: usize,
    pub done: usize,
    pub failed: usize,
}

impl StatusCounts {
    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Self {
        let mut counts = Self::default();
        for task in tasks {
            match task.status {
                TaskStatus::Proposed => counts.proposed += 1,
                TaskStatus::Blocked => counts.blocked += 1,
                TaskStatus::Ready => counts.ready += 1,
                TaskStatus::InProgress => counts.in_progress += 1,
                TaskStatus::Done => counts.done += 1,
                TaskStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.proposed + self.blocked + self.ready + self.in_progress + self.done + self.failed
    }
}

/// Structured output of a Measure agent session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeasureOutput {
    pub tasks: Vec<ProposedTask>,
}

/// A task as proposed by the agent, before the orchestrator assigns ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposedTask {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// Agent-declared verdict for a stitched task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StitchVerdict {
    Done,
    Failed,
}

/// Structured output of a Stitch agent session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StitchOutput {
    pub status: StitchVerdict,
    pub summary: String,
}
