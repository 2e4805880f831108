//! Stitch step: execute ready tasks until no further task becomes ready.
//!
//! Tasks run one at a time in dependency order. Every task outcome is made
//! durable in this order: git commit (done tasks only), checkpoint, task
//! store. A crash between any two of these is repaired by Resume.

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::agents::SessionLimits;
use crate::agents::stitch::StitchAgent;
use crate::core::recovery::task_commit_message;
use crate::core::types::{StitchVerdict, TaskOutcome, TaskResult, TaskStatus};
use crate::error::CobblerError;
use crate::io::agent::Agent;
use crate::io::context::stitch_inputs;
use crate::io::cycle_log::{CycleRecord, SessionPaths, write_cycle_record};
use crate::io::tracker::TaskEvent;
use crate::orchestrator::{Orchestrator, TrailSession};

impl<A: Agent> Orchestrator<A> {
    /// Run Stitch for cycle `cycle`, appending results to `record`.
    ///
    /// Tasks left `in_progress` by an interrupted run are re-executed first.
    /// A failing task does not stop the step; a git error does.
    #[instrument(skip_all, fields(trail = %session.name, cycle = cycle))]
    pub(crate) fn stitch_step(
        &self,
        session: &mut TrailSession,
        cycle: u32,
        record: &mut CycleRecord,
    ) -> Result<()> {
        for id in session.in_flight() {
            info!(task = %id, "re-executing in-flight task");
            self.execute_task(session, cycle, &id, record)?;
        }

        loop {
            let changes = session.graph.refresh_readiness();
            if !changes.is_empty() {
                let events: Vec<TaskEvent> = changes
                    .iter()
                    .map(|change| TaskEvent::changed(change, cycle))
                    .collect();
                session.persist(&events)?;
            }
            let ready = session.graph.ready_order();
            if ready.is_empty() {
                break;
            }
            for id in ready {
                self.execute_task(session, cycle, &id, record)?;
            }
        }
        Ok(())
    }

    /// Execute one `ready` (or in-flight) task and record its outcome.
    fn execute_task(
        &self,
        session: &mut TrailSession,
        cycle: u32,
        task_id: &str,
        record: &mut CycleRecord,
    ) -> Result<()> {
        let status = session
            .graph
            .get(task_id)
            .map(|t| t.status)
            .with_context(|| format!("unknown task '{task_id}'"))?;
        if status == TaskStatus::Ready {
            let change = session.graph.begin(task_id)?;
            session.persist(&[TaskEvent::changed(&change, cycle)])?;
        }

        let inputs = stitch_inputs(
            &session.name,
            cycle,
            session.worktree.workdir(),
            &session.graph,
            task_id,
            &self.config,
        )?;
        let paths = SessionPaths::stitch(&session.scratch, cycle, task_id);
        let session_result = StitchAgent::new(SessionLimits::stitch(&self.config)).run(
            &self.agent,
            session.worktree.workdir(),
            &paths,
            &inputs,
        );

        let (outcome, detail, commit) = match session_result {
            Ok(output) if output.status == StitchVerdict::Done => {
                let message = task_commit_message(task_id, &inputs.task.title, cycle);
                session
                    .worktree
                    .commit_all(&message, true)
                    .with_context(|| format!("commit task '{task_id}'"))?;
                let sha = session.worktree.head_sha()?;
                info!(task = %task_id, commit = %sha, "task done");
                (TaskOutcome::Done, output.summary, Some(sha))
            }
            Ok(output) => {
                warn!(task = %task_id, summary = %output.summary, "agent reported task failed");
                session.worktree.discard_changes()?;
                (TaskOutcome::Failed, output.summary, None)
            }
            Err(err) => {
                let failure = CobblerError::TaskExecution {
                    task: task_id.to_string(),
                    reason: format!("{err:#}"),
                };
                warn!(error = %failure, "task execution failed");
                session.worktree.discard_changes()?;
                (TaskOutcome::Failed, failure.to_string(), None)
            }
        };

        let change = session.graph.finish(task_id, outcome, &detail)?;
        session.checkpoint_now()?;
        session.persist(&[TaskEvent::changed(&change, cycle).with_note(detail.clone())])?;

        record.results.push(TaskResult {
            task_id: task_id.to_string(),
            outcome,
            commit,
            detail,
        });
        write_cycle_record(&session.trail_paths, record)?;
        Ok(())
    }
}
