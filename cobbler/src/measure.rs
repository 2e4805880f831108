//! Measure step: ask the agent for new tasks and commit them atomically.

use std::collections::HashSet;

use anyhow::{Result, anyhow};
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::agents::SessionLimits;
use crate::agents::measure::MeasureAgent;
use crate::core::graph::TaskGraph;
use crate::core::ids::{slugify, validate_id};
use crate::core::types::{MeasureOutput, Task, TaskStatus};
use crate::error::CobblerError;
use crate::io::agent::Agent;
use crate::io::context::measure_inputs;
use crate::io::cycle_log::SessionPaths;
use crate::io::tracker::TaskEvent;
use crate::orchestrator::{Orchestrator, TrailSession};

/// Longest id derived from a task title.
const SLUG_MAX_LEN: usize = 48;

impl<A: Agent> Orchestrator<A> {
    /// Run Measure for cycle `cycle` and insert the proposed tasks.
    ///
    /// All proposed tasks are inserted, or none are. Malformed output and
    /// timeouts surface as [`CobblerError::Measure`]; dependency errors as
    /// [`CobblerError::InvalidDependency`]. Returns the new task ids.
    #[instrument(skip_all, fields(trail = %session.name, cycle = cycle))]
    pub(crate) fn measure_step(&self, session: &mut TrailSession, cycle: u32) -> Result<Vec<String>> {
        let inputs = measure_inputs(
            &session.name,
            cycle,
            session.worktree.workdir(),
            session.graph.tasks(),
            &self.config,
        )?;
        let paths = SessionPaths::measure(&session.scratch, cycle);
        let output = MeasureAgent::new(SessionLimits::measure(&self.config))
            .run(&self.agent, session.worktree.workdir(), &paths, &inputs)
            .map_err(|err| {
                warn!(error = %format!("{err:#}"), "measure session failed");
                anyhow!(CobblerError::Measure {
                    cycle,
                    reason: format!("{err:#}"),
                })
            })?;

        let batch = build_tasks(output, &session.graph, cycle)?;
        let ids: Vec<String> = batch.iter().map(|t| t.id.clone()).collect();
        let mut events: Vec<TaskEvent> = batch.iter().map(TaskEvent::created).collect();
        session.graph.insert_batch(batch)?;
        events.extend(
            session
                .graph
                .refresh_readiness()
                .iter()
                .map(|change| TaskEvent::changed(change, cycle)),
        );
        session.persist(&events)?;

        session.checkpoint.measured_cycle = Some(cycle);
        session.checkpoint_now()?;
        info!(proposed = ids.len(), "measure committed tasks");
        Ok(ids)
    }
}

/// Turn agent proposals into tasks with final ids and sequence numbers.
///
/// Agent-supplied ids are kept (and validated); missing ids are derived from
/// the title and made unique against existing and sibling ids.
fn build_tasks(output: MeasureOutput, graph: &TaskGraph, cycle: u32) -> Result<Vec<Task>> {
    let mut taken: HashSet<String> = graph.tasks().iter().map(|t| t.id.clone()).collect();
    taken.extend(output.tasks.iter().filter_map(|p| p.id.clone()));
    let mut seq = graph.next_seq();
    let now = Utc::now();

    let mut tasks = Vec::with_capacity(output.tasks.len());
    for proposed in output.tasks {
        let id = match proposed.id {
            Some(id) => {
                validate_id(&id).map_err(|err| {
                    anyhow!(CobblerError::Measure {
                        cycle,
                        reason: format!("invalid task id: {err}"),
                    })
                })?;
                id
            }
            None => {
                let base = slugify(&proposed.title, SLUG_MAX_LEN)
                    .unwrap_or_else(|| format!("task-{seq}"));
                let id = unique_id(&base, &taken);
                debug!(id = %id, title = %proposed.title, "derived task id");
                taken.insert(id.clone());
                id
            }
        };
        tasks.push(Task {
            id,
            title: proposed.title,
            description: proposed.description,
            depends_on: proposed.depends_on,
            status: TaskStatus::Proposed,
            origin_cycle: cycle,
            seq,
            created_at: now,
            summary: None,
            failure: None,
        });
        seq += 1;
    }
    Ok(tasks)
}

fn unique_id(base: &str, taken: &HashSet<String>) -> String {
    if !taken.contains(base) {
        return base.to_string();
    }
    (2..)
        .map(|n| format!("{base}-{n}"))
        .find(|candidate| !taken.contains(candidate))
        .unwrap_or_else(|| base.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ProposedTask;
    use crate::test_support::task;

    fn proposed(id: Option<&str>, title: &str, deps: &[&str]) -> ProposedTask {
        ProposedTask {
            id: id.map(str::to_string),
            title: title.to_string(),
            description: String::new(),
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
        }
    }

    #[test]
    fn derived_ids_avoid_collisions() {
        let graph = TaskGraph::new(vec![task("add-parser", 0, &[])]).expect("graph");
        let output = MeasureOutput {
            tasks: vec![
                proposed(None, "Add parser", &[]),
                proposed(None, "Add parser!", &[]),
                proposed(Some("tests"), "Write tests", &["add-parser"]),
            ],
        };
        let tasks = build_tasks(output, &graph, 2).expect("build");
        let ids: Vec<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["add-parser-2", "add-parser-3", "tests"]);
        assert_eq!(tasks[0].seq, 1);
        assert!(tasks.iter().all(|t| t.origin_cycle == 2));
    }

    #[test]
    fn invalid_agent_id_is_a_measure_error() {
        let output = MeasureOutput {
            tasks: vec![proposed(Some("../escape"), "Bad", &[])],
        };
        let err = build_tasks(output, &TaskGraph::default(), 1).unwrap_err();
        assert!(matches!(
            CobblerError::find(&err),
            Some(CobblerError::Measure { cycle: 1, .. })
        ));
    }

    #[test]
    fn untitled_tasks_fall_back_to_sequence_ids() {
        let output = MeasureOutput {
            tasks: vec![proposed(None, "???", &[])],
        };
        let tasks = build_tasks(output, &TaskGraph::default(), 1).expect("build");
        assert_eq!(tasks[0].id, "task-0");
    }
}
