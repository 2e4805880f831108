//! Task readiness resolver.
//!
//! Keeps the trail's tasks as a DAG keyed by task id. The graph is validated
//! on every insertion (unique ids, known dependencies, no self edges, no
//! cycles) so readiness and ordering can assume acyclicity.

use std::collections::{HashMap, HashSet};

use anyhow::{Result, anyhow, bail};

use crate::core::types::{StatusChange, StatusCounts, Task, TaskOutcome, TaskStatus};
use crate::error::CobblerError;

/// True if a task may move from `from` to `to` during normal execution.
pub fn is_allowed_transition(from: TaskStatus, to: TaskStatus) -> bool {
    matches!(
        (from, to),
        (TaskStatus::Proposed, TaskStatus::Blocked)
            | (TaskStatus::Proposed, TaskStatus::Ready)
            | (TaskStatus::Blocked, TaskStatus::Ready)
            | (TaskStatus::Ready, TaskStatus::InProgress)
            | (TaskStatus::InProgress, TaskStatus::Done)
            | (TaskStatus::InProgress, TaskStatus::Failed)
    )
}

#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    tasks: Vec<Task>,
    index: HashMap<String, usize>,
}

impl TaskGraph {
    /// Build a graph from persisted tasks, validating the whole set.
    pub fn new(mut tasks: Vec<Task>) -> Result<Self> {
        tasks.sort_by_key(|t| t.seq);
        validate_graph(&tasks)?;
        let index = build_index(&tasks);
        Ok(Self { tasks, index })
    }

    /// Tasks in creation order.
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn into_tasks(self) -> Vec<Task> {
        self.tasks
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.index.get(id).map(|&i| &self.tasks[i])
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn counts(&self) -> StatusCounts {
        StatusCounts::from_tasks(&self.tasks)
    }

    /// Next unused creation sequence number.
    pub fn next_seq(&self) -> u64 {
        self.tasks.iter().map(|t| t.seq + 1).max().unwrap_or(0)
    }

    /// Insert a batch of new tasks atomically.
    ///
    /// Either every task in the batch is added, or (on any validation error)
    /// the graph is left untouched.
    pub fn insert_batch(&mut self, batch: Vec<Task>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut combined = self.tasks.clone();
        combined.extend(batch);
        combined.sort_by_key(|t| t.seq);
        validate_graph(&combined)?;
        self.index = build_index(&combined);
        self.tasks = combined;
        Ok(())
    }

    /// Recompute readiness for every waiting task.
    ///
    /// `proposed`/`blocked` tasks whose dependencies are all `done` become
    /// `ready`; `proposed` tasks with an unfinished dependency become
    /// `blocked`. Returns the applied changes in creation order.
    pub fn refresh_readiness(&mut self) -> Vec<StatusChange> {
        let mut changes = Vec::new();
        for i in 0..self.tasks.len() {
            let from = self.tasks[i].status;
            if !matches!(from, TaskStatus::Proposed | TaskStatus::Blocked) {
                continue;
            }
            let to = if self.deps_done(&self.tasks[i]) {
                TaskStatus::Ready
            } else {
                TaskStatus::Blocked
            };
            if to != from {
                self.tasks[i].status = to;
                changes.push(StatusChange {
                    task_id: self.tasks[i].id.clone(),
                    from,
                    to,
                });
            }
        }
        changes
    }

    /// Ready task ids in execution order.
    ///
    /// Order is dependency-topological (by dependency depth), ties broken by
    /// creation sequence.
    pub fn ready_order(&self) -> Vec<String> {
        let depths = self.depths();
        let mut ready: Vec<&Task> = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Ready)
            .collect();
        ready.sort_by_key(|t| (depths.get(t.id.as_str()).copied().unwrap_or(0), t.seq));
        ready.into_iter().map(|t| t.id.clone()).collect()
    }

    /// Ids of tasks currently `in_progress`, in creation order.
    pub fn in_progress(&self) -> Vec<String> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::InProgress)
            .map(|t| t.id.clone())
            .collect()
    }

    /// Move a ready task to `in_progress`.
    pub fn begin(&mut self, id: &str) -> Result<StatusChange> {
        let i = self.position(id)?;
        if !self.deps_done(&self.tasks[i]) {
            bail!("task '{id}' has unfinished dependencies");
        }
        self.transition(i, TaskStatus::InProgress)
    }

    /// Record the outcome of an `in_progress` task.
    pub fn finish(&mut self, id: &str, outcome: TaskOutcome, detail: &str) -> Result<StatusChange> {
        let i = self.position(id)?;
        let change = self.transition(i, outcome.status())?;
        let task = &mut self.tasks[i];
        match outcome {
            TaskOutcome::Done => {
                task.summary = Some(detail.to_string());
                task.failure = None;
            }
            TaskOutcome::Failed => task.failure = Some(detail.to_string()),
        }
        Ok(change)
    }

    fn transition(&mut self, i: usize, to: TaskStatus) -> Result<StatusChange> {
        let task = &mut self.tasks[i];
        let from = task.status;
        if !is_allowed_transition(from, to) {
            bail!("task '{}' cannot move from {from} to {to}", task.id);
        }
        task.status = to;
        Ok(StatusChange {
            task_id: task.id.clone(),
            from,
            to,
        })
    }

    fn position(&self, id: &str) -> Result<usize> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| anyhow!("unknown task '{id}'"))
    }

    fn deps_done(&self, task: &Task) -> bool {
        task.depends_on
            .iter()
            .all(|dep| self.get(dep).is_some_and(|d| d.status == TaskStatus::Done))
    }

    /// Longest dependency chain below each task.
    fn depths(&self) -> HashMap<&str, usize> {
        let mut depths: HashMap<&str, usize> = HashMap::new();
        // Dependencies always precede dependents in creation order for tasks
        // inserted batch by batch, but a batch may list a dependent first.
        let mut changed = true;
        while changed {
            changed = false;
            for task in &self.tasks {
                let depth = task
                    .depends_on
                    .iter()
                    .map(|dep| depths.get(dep.as_str()).copied().unwrap_or(0) + 1)
                    .max()
                    .unwrap_or(0);
                if depths.get(task.id.as_str()).copied() != Some(depth) {
                    depths.insert(task.id.as_str(), depth);
                    changed = true;
                }
            }
        }
        depths
    }
}

fn build_index(tasks: &[Task]) -> HashMap<String, usize> {
    tasks
        .iter()
        .enumerate()
        .map(|(i, t)| (t.id.clone(), i))
        .collect()
}

fn invalid(task: &str, detail: impl Into<String>) -> anyhow::Error {
    CobblerError::InvalidDependency {
        task: task.to_string(),
        detail: detail.into(),
    }
    .into()
}

/// Validate ids and dependency edges of a full task set.
fn validate_graph(tasks: &[Task]) -> Result<()> {
    let mut ids = HashSet::new();
    for task in tasks {
        if !ids.insert(task.id.as_str()) {
            return Err(invalid(&task.id, "duplicate task id"));
        }
    }
    for task in tasks {
        let mut seen = HashSet::new();
        for dep in &task.depends_on {
            if dep == &task.id {
                return Err(invalid(&task.id, "task depends on itself"));
            }
            if !ids.contains(dep.as_str()) {
                return Err(invalid(&task.id, format!("unknown dependency '{dep}'")));
            }
            if !seen.insert(dep.as_str()) {
                return Err(invalid(&task.id, format!("dependency '{dep}' listed twice")));
            }
        }
    }
    if let Some(cycle) = find_cycle(tasks) {
        let first = cycle.first().cloned().unwrap_or_default();
        return Err(invalid(
            &first,
            format!("dependency cycle: {}", cycle.join(" -> ")),
        ));
    }
    Ok(())
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Visited,
}

/// Return one dependency cycle (as a closed path of ids), if any.
fn find_cycle(tasks: &[Task]) -> Option<Vec<String>> {
    let deps: HashMap<&str, &[String]> = tasks
        .iter()
        .map(|t| (t.id.as_str(), t.depends_on.as_slice()))
        .collect();
    let mut marks: HashMap<&str, Mark> = HashMap::new();
    let mut stack: Vec<&str> = Vec::new();

    for task in tasks {
        if let Some(cycle) = visit(task.id.as_str(), &deps, &mut marks, &mut stack) {
            return Some(cycle);
        }
    }
    None
}

fn visit<'a>(
    node: &'a str,
    deps: &HashMap<&'a str, &'a [String]>,
    marks: &mut HashMap<&'a str, Mark>,
    stack: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    match marks.get(node) {
        Some(Mark::Visited) => return None,
        Some(Mark::Visiting) => {
            let start = stack.iter().position(|n| *n == node).unwrap_or(0);
            let mut cycle: Vec<String> = stack[start..].iter().map(|n| n.to_string()).collect();
            cycle.push(node.to_string());
            return Some(cycle);
        }
        None => {}
    }

    marks.insert(node, Mark::Visiting);
    stack.push(node);
    for dep in deps.get(node).copied().unwrap_or_default() {
        if let Some(cycle) = visit(dep.as_str(), deps, marks, stack) {
            return Some(cycle);
        }
    }
    stack.pop();
    marks.insert(node, Mark::Visited);
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::task;

    fn graph(tasks: Vec<Task>) -> TaskGraph {
        TaskGraph::new(tasks).expect("valid graph")
    }

    fn invalid_detail(err: anyhow::Error) -> String {
        match err.downcast_ref::<CobblerError>() {
            Some(CobblerError::InvalidDependency { detail, .. }) => detail.clone(),
            other => panic!("expected InvalidDependency, got {other:?}"),
        }
    }

    #[test]
    fn refresh_marks_unblocked_tasks_ready_and_others_blocked() {
        let mut g = graph(vec![task("a", 0, &[]), task("b", 1, &["a"])]);
        let changes = g.refresh_readiness();
        assert_eq!(changes.len(), 2);
        assert_eq!(g.get("a").unwrap().status, TaskStatus::Ready);
        assert_eq!(g.get("b").unwrap().status, TaskStatus::Blocked);
    }

    /// Completing a dependency unblocks its dependent on the next refresh.
    #[test]
    fn finishing_a_dependency_chains_readiness() {
        let mut g = graph(vec![task("a", 0, &[]), task("b", 1, &["a"])]);
        g.refresh_readiness();
        g.begin("a").expect("begin a");
        g.finish("a", TaskOutcome::Done, "ok").expect("finish a");
        let changes = g.refresh_readiness();
        assert_eq!(
            changes,
            vec![StatusChange {
                task_id: "b".to_string(),
                from: TaskStatus::Blocked,
                to: TaskStatus::Ready,
            }]
        );
        assert_eq!(g.ready_order(), vec!["b".to_string()]);
    }

    #[test]
    fn failed_dependency_keeps_dependent_blocked() {
        let mut g = graph(vec![task("a", 0, &[]), task("b", 1, &["a"])]);
        g.refresh_readiness();
        g.begin("a").expect("begin");
        g.finish("a", TaskOutcome::Failed, "boom").expect("finish");
        g.refresh_readiness();
        assert_eq!(g.get("b").unwrap().status, TaskStatus::Blocked);
        assert_eq!(g.get("a").unwrap().failure.as_deref(), Some("boom"));
        assert!(g.ready_order().is_empty());
    }

    #[test]
    fn begin_rejects_unfinished_dependencies() {
        let mut g = graph(vec![task("a", 0, &[]), task("b", 1, &["a"])]);
        g.refresh_readiness();
        let err = g.begin("b").unwrap_err();
        assert!(err.to_string().contains("unfinished dependencies"));
    }

    #[test]
    fn finish_requires_in_progress() {
        let mut g = graph(vec![task("a", 0, &[])]);
        g.refresh_readiness();
        let err = g.finish("a", TaskOutcome::Done, "ok").unwrap_err();
        assert!(err.to_string().contains("cannot move from ready to done"));
    }

    /// Ready tasks run in dependency depth order, then creation order.
    #[test]
    fn ready_order_is_topological_then_by_sequence() {
        let mut done = task("root", 0, &[]);
        done.status = TaskStatus::Done;
        let mut g = graph(vec![
            done,
            task("deep", 1, &["root"]),
            task("z-shallow", 2, &[]),
            task("a-shallow", 3, &[]),
        ]);
        g.refresh_readiness();
        assert_eq!(
            g.ready_order(),
            vec![
                "z-shallow".to_string(),
                "a-shallow".to_string(),
                "deep".to_string()
            ]
        );
    }

    #[test]
    fn rejects_cycles_with_path() {
        let err = TaskGraph::new(vec![
            task("a", 0, &["c"]),
            task("b", 1, &["a"]),
            task("c", 2, &["b"]),
        ])
        .unwrap_err();
        let detail = invalid_detail(err);
        assert!(detail.starts_with("dependency cycle: "), "{detail}");
        assert!(detail.contains("a") && detail.contains("b") && detail.contains("c"));
    }

    #[test]
    fn rejects_self_unknown_and_duplicate() {
        let detail = invalid_detail(TaskGraph::new(vec![task("a", 0, &["a"])]).unwrap_err());
        assert!(detail.contains("itself"));

        let detail = invalid_detail(TaskGraph::new(vec![task("a", 0, &["nope"])]).unwrap_err());
        assert!(detail.contains("unknown dependency 'nope'"));

        let detail =
            invalid_detail(TaskGraph::new(vec![task("a", 0, &[]), task("a", 1, &[])]).unwrap_err());
        assert!(detail.contains("duplicate"));
    }

    /// A rejected batch leaves the graph exactly as it was.
    #[test]
    fn insert_batch_is_all_or_nothing() {
        let mut g = graph(vec![task("a", 0, &[])]);
        let err = g
            .insert_batch(vec![task("b", 1, &["a"]), task("c", 2, &["missing"])])
            .unwrap_err();
        assert!(err.downcast_ref::<CobblerError>().is_some());
        assert_eq!(g.len(), 1);
        assert!(g.get("b").is_none());

        g.insert_batch(vec![task("b", 1, &["a"])]).expect("insert");
        assert_eq!(g.len(), 2);
        assert_eq!(g.next_seq(), 2);
    }

    #[test]
    fn transition_table_is_forward_only() {
        assert!(is_allowed_transition(TaskStatus::Blocked, TaskStatus::Ready));
        assert!(!is_allowed_transition(TaskStatus::Ready, TaskStatus::Blocked));
        assert!(!is_allowed_transition(TaskStatus::Done, TaskStatus::InProgress));
        assert!(!is_allowed_transition(TaskStatus::Proposed, TaskStatus::InProgress));
    }
}
