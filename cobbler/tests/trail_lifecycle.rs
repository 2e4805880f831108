//! End-to-end trail lifecycle tests: start, run, stop, switch, reset.
//!
//! Each test drives an [`Orchestrator`] over a throwaway git repository with
//! a scripted agent, then checks git history and persisted state.

use std::fs;

use cobbler::core::types::{CycleStatus, TaskOutcome, TaskStatus, TrailState};
use cobbler::error::CobblerError;
use cobbler::io::checkpoint::load_checkpoint;
use cobbler::io::config::WhenUnspecified;
use cobbler::io::init::CobblerPaths;
use cobbler::io::lock::OrchestratorLock;
use cobbler::io::tracker::TaskStore;
use cobbler::lifecycle::MergeKind;
use cobbler::test_support::{Reply, ScriptedAgent, TestRepo, git_in, test_config};
use cobbler::Orchestrator;

fn orchestrator(repo: &TestRepo, agent: &ScriptedAgent) -> Orchestrator<ScriptedAgent> {
    Orchestrator::new(repo.path(), test_config(), agent.clone()).expect("orchestrator")
}

/// Two cycles: the first proposes `a` and `b` (b depends on a) and stitches
/// both in dependency order; the second is idle.
#[test]
fn run_executes_dependent_tasks_in_one_stitch_step() {
    let repo = TestRepo::new().expect("repo");
    let agent = ScriptedAgent::new(vec![
        Reply::measure(&[("a", &[]), ("b", &["a"])]),
        Reply::done("a.txt", "A\n"),
        Reply::done("b.txt", "B\n"),
        Reply::idle(),
    ]);
    let orch = orchestrator(&repo, &agent);

    let started = orch.start("demo").expect("start");
    assert_eq!(started.branch, "trail/demo");
    assert!(started.worktree.join("README.md").exists());

    let outcome = orch.run(Some(2)).expect("run");
    agent.assert_drained();
    assert_eq!(outcome.cycles_completed, 2);
    assert_eq!(outcome.cycle_budget, 2);
    assert_eq!(outcome.cycles.len(), 2);

    let first = &outcome.cycles[0];
    assert_eq!(first.proposed, vec!["a", "b"]);
    assert_eq!(first.status, CycleStatus::Complete);
    let executed: Vec<(&str, TaskOutcome)> = first
        .results
        .iter()
        .map(|r| (r.task_id.as_str(), r.outcome))
        .collect();
    assert_eq!(
        executed,
        vec![("a", TaskOutcome::Done), ("b", TaskOutcome::Done)]
    );
    assert!(outcome.cycles[1].is_idle());
    assert_eq!(outcome.counts.done, 2);

    let worktree = &started.worktree;
    let subjects = git_in(worktree, &["log", "--format=%s", "-n", "2"]).expect("log");
    assert_eq!(subjects, "cobbler: Task b\ncobbler: Task a");
    let body = git_in(worktree, &["log", "-1", "--format=%B"]).expect("body");
    assert!(body.contains("Cobbler-Task: b"), "{body}");
    assert!(body.contains("Cobbler-Cycle: 1"), "{body}");

    let head = git_in(worktree, &["rev-parse", "HEAD"]).expect("head");
    let paths = CobblerPaths::new(repo.path());
    let checkpoint = load_checkpoint(&paths.trail("demo").checkpoint_path).expect("checkpoint");
    assert_eq!(checkpoint.commit, head);
    assert_eq!(checkpoint.cycle_index, 2);
    assert_eq!(checkpoint.measured_cycle, None);

    let rows = orch.list().expect("list");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].state, TrailState::Started);
    assert!(rows[0].active);
    assert_eq!(rows[0].tasks.done, 2);
}

#[test]
fn failed_task_leaves_dependents_blocked() {
    let repo = TestRepo::new().expect("repo");
    let agent = ScriptedAgent::new(vec![
        Reply::measure(&[("a", &[]), ("b", &["a"]), ("c", &[])]),
        Reply::failed("cannot do a"),
        Reply::done("c.txt", "C\n"),
    ]);
    let orch = orchestrator(&repo, &agent);
    orch.start("demo").expect("start");

    let outcome = orch.run(Some(1)).expect("run");
    agent.assert_drained();
    let cycle = &outcome.cycles[0];
    assert_eq!(cycle.status, CycleStatus::Partial);
    assert_eq!(cycle.results.len(), 2);
    assert_eq!(cycle.results[0].outcome, TaskOutcome::Failed);
    assert_eq!(cycle.results[0].detail, "cannot do a");

    let paths = CobblerPaths::new(repo.path());
    let tasks = TaskStore::new(&paths.trail("demo")).load().expect("tasks");
    let status = |id: &str| tasks.iter().find(|t| t.id == id).map(|t| t.status);
    assert_eq!(status("a"), Some(TaskStatus::Failed));
    assert_eq!(status("b"), Some(TaskStatus::Blocked));
    assert_eq!(status("c"), Some(TaskStatus::Done));
}

#[test]
fn run_without_count_uses_configured_default() {
    let repo = TestRepo::new().expect("repo");
    let agent = ScriptedAgent::new(vec![Reply::idle(), Reply::idle()]);
    let mut config = test_config();
    config.cycles.default = 2;
    let orch = Orchestrator::new(repo.path(), config, agent.clone()).expect("orchestrator");
    orch.start("demo").expect("start");

    let outcome = orch.run(Some(0)).expect("run");
    agent.assert_drained();
    assert_eq!(outcome.cycles_completed, 2);
}

#[test]
fn until_idle_run_stops_after_first_idle_cycle() {
    let repo = TestRepo::new().expect("repo");
    let agent = ScriptedAgent::new(vec![
        Reply::measure(&[("a", &[])]),
        Reply::done("a.txt", "A\n"),
        Reply::idle(),
    ]);
    let mut config = test_config();
    config.cycles.when_unspecified = WhenUnspecified::UntilIdle;
    config.cycles.until_idle_cap = 5;
    let orch = Orchestrator::new(repo.path(), config, agent.clone()).expect("orchestrator");
    orch.start("demo").expect("start");

    let outcome = orch.run(None).expect("run");
    agent.assert_drained();
    assert_eq!(outcome.cycles.len(), 2);
    assert_eq!(outcome.cycles_completed, 2);
    assert_eq!(outcome.cycle_budget, 2);
}

#[test]
fn budget_accumulates_across_runs() {
    let repo = TestRepo::new().expect("repo");
    let agent = ScriptedAgent::new(vec![Reply::idle(), Reply::idle(), Reply::idle()]);
    let orch = orchestrator(&repo, &agent);
    orch.start("demo").expect("start");

    orch.run(Some(1)).expect("first run");
    let outcome = orch.run(Some(2)).expect("second run");
    agent.assert_drained();
    assert_eq!(outcome.cycles_completed, 3);
    assert_eq!(outcome.cycles[0].index, 2);
}

#[test]
fn stop_merges_trail_and_removes_worktree() {
    let repo = TestRepo::new().expect("repo");
    let agent = ScriptedAgent::new(vec![
        Reply::measure(&[("a", &[])]),
        Reply::done("a.txt", "A\n"),
    ]);
    let orch = orchestrator(&repo, &agent);
    let started = orch.start("demo").expect("start");
    orch.run(Some(1)).expect("run");

    let stopped = orch.stop(None).expect("stop");
    assert_eq!(stopped.merge, MergeKind::FastForward);
    assert_eq!(stopped.cycles_completed, 1);
    assert_eq!(
        fs::read_to_string(repo.path().join("a.txt")).expect("merged file"),
        "A\n"
    );
    assert_eq!(
        repo.git(&["rev-parse", "HEAD"]).expect("head"),
        stopped.merge_commit
    );
    assert!(!started.worktree.exists());

    let rows = orch.list().expect("list");
    assert_eq!(rows[0].state, TrailState::Stopped);
    assert!(!rows[0].active);
    assert!(!rows[0].worktree_present);

    let err = orch.run(Some(1)).unwrap_err();
    assert!(matches!(
        CobblerError::find(&err),
        Some(CobblerError::NoActiveTrail)
    ));
    let err = orch.switch("demo").unwrap_err();
    assert!(matches!(
        CobblerError::find(&err),
        Some(CobblerError::TrailNotFound { .. })
    ));
}

#[test]
fn stop_creates_merge_commit_when_base_moved() {
    let repo = TestRepo::new().expect("repo");
    let agent = ScriptedAgent::new(vec![
        Reply::measure(&[("a", &[])]),
        Reply::done("a.txt", "A\n"),
    ]);
    let orch = orchestrator(&repo, &agent);
    orch.start("demo").expect("start");
    orch.run(Some(1)).expect("run");

    repo.write("base.txt", "moved\n").expect("write");
    repo.git(&["add", "base.txt"]).expect("add");
    repo.git(&["commit", "--quiet", "-m", "move base"]).expect("commit");

    let stopped = orch.stop(Some("demo")).expect("stop");
    assert_eq!(stopped.merge, MergeKind::MergeCommit);
    assert!(repo.path().join("a.txt").exists());
    assert!(repo.path().join("base.txt").exists());
}

#[test]
fn stop_commits_uncommitted_work() {
    let repo = TestRepo::new().expect("repo");
    let agent = ScriptedAgent::default();
    let orch = orchestrator(&repo, &agent);
    let started = orch.start("demo").expect("start");
    fs::write(started.worktree.join("notes.txt"), "notes\n").expect("write");

    orch.stop(None).expect("stop");
    assert!(repo.path().join("notes.txt").exists());
    let subject = repo.git(&["log", "-1", "--format=%s"]).expect("log");
    assert_eq!(subject, "cobbler: final changes on trail demo");
}

#[test]
fn switch_parks_active_trail_and_restores_target() {
    let repo = TestRepo::new().expect("repo");
    let agent = ScriptedAgent::default();
    let orch = orchestrator(&repo, &agent);
    let alpha = orch.start("alpha").expect("start alpha");
    fs::write(alpha.worktree.join("notes.txt"), "draft\n").expect("write");

    let beta = orch.start("beta").expect("start beta");
    let parked = beta.parked.expect("alpha parked");
    let alpha_tip = repo.git(&["rev-parse", "trail/alpha"]).expect("alpha tip");
    assert_eq!(parked, alpha_tip);
    let subject = repo
        .git(&["log", "-1", "--format=%s", "trail/alpha"])
        .expect("log");
    assert_eq!(subject, "cobbler: park trail alpha");

    let paths = CobblerPaths::new(repo.path());
    let checkpoint = load_checkpoint(&paths.trail("alpha").checkpoint_path).expect("checkpoint");
    assert_eq!(checkpoint.commit, alpha_tip);

    let switched = orch.switch("alpha").expect("switch");
    assert_eq!(switched.from.as_deref(), Some("beta"));
    assert_eq!(switched.parked, None);
    assert!(!switched.recreated_worktree);
    assert_eq!(
        fs::read_to_string(alpha.worktree.join("notes.txt")).expect("notes"),
        "draft\n"
    );
    let status = git_in(&alpha.worktree, &["status", "--porcelain"]).expect("status");
    assert!(status.is_empty(), "{status}");

    let active: Vec<String> = orch
        .list()
        .expect("list")
        .into_iter()
        .filter(|row| row.active)
        .map(|row| row.name)
        .collect();
    assert_eq!(active, vec!["alpha"]);
}

#[test]
fn switch_recreates_missing_worktree() {
    let repo = TestRepo::new().expect("repo");
    let agent = ScriptedAgent::default();
    let orch = orchestrator(&repo, &agent);
    orch.start("alpha").expect("start alpha");
    let beta = orch.start("beta").expect("start beta");
    fs::remove_dir_all(&beta.worktree).expect("remove worktree");

    orch.switch("alpha").expect("switch alpha");
    let switched = orch.switch("beta").expect("switch beta");
    assert!(switched.recreated_worktree);
    assert!(beta.worktree.join("README.md").exists());
}

#[test]
fn start_rejects_existing_trail_and_bad_names() {
    let repo = TestRepo::new().expect("repo");
    let agent = ScriptedAgent::default();
    let orch = orchestrator(&repo, &agent);
    orch.start("demo").expect("start");

    let err = orch.start("demo").unwrap_err();
    assert!(matches!(
        CobblerError::find(&err),
        Some(CobblerError::TrailExists { .. })
    ));

    repo.git(&["branch", "trail/taken"]).expect("branch");
    let err = orch.start("taken").unwrap_err();
    assert!(matches!(
        CobblerError::find(&err),
        Some(CobblerError::TrailExists { .. })
    ));

    assert!(orch.start("../escape").is_err());
}

#[test]
fn reset_destroys_trail_and_is_noop_when_absent() {
    let repo = TestRepo::new().expect("repo");
    let agent = ScriptedAgent::default();
    let orch = orchestrator(&repo, &agent);

    let absent = orch.reset_trail("ghost").expect("reset absent");
    assert!(!absent.existed);

    let started = orch.start("demo").expect("start");
    let reset = orch.reset_trail("demo").expect("reset");
    assert!(reset.existed);
    assert!(!started.worktree.exists());
    assert!(
        repo.git(&["branch", "--list", "trail/demo"])
            .expect("branches")
            .is_empty()
    );
    assert!(orch.list().expect("list").is_empty());

    // The name is free again.
    orch.start("demo").expect("restart");
}

#[test]
fn full_reset_removes_every_trail() {
    let repo = TestRepo::new().expect("repo");
    let agent = ScriptedAgent::default();
    let orch = orchestrator(&repo, &agent);
    orch.start("alpha").expect("alpha");
    orch.start("beta").expect("beta");

    let names = orch.reset_all().expect("reset all");
    assert_eq!(names, vec!["alpha", "beta"]);
    assert!(orch.list().expect("list").is_empty());
    assert!(!orch.paths().worktrees_dir.exists());
}

#[test]
fn mutating_commands_fail_while_lock_is_held() {
    let repo = TestRepo::new().expect("repo");
    let agent = ScriptedAgent::default();
    let orch = orchestrator(&repo, &agent);
    orch.start("demo").expect("start");

    let _held = OrchestratorLock::acquire(&orch.paths().lock_path, "test").expect("lock");
    let err = orch.run(Some(1)).unwrap_err();
    assert!(matches!(
        CobblerError::find(&err),
        Some(CobblerError::TrailBusy { .. })
    ));
    // Read-only commands still work.
    assert_eq!(orch.list().expect("list").len(), 1);
}

#[test]
fn tracker_reset_archives_tasks() {
    let repo = TestRepo::new().expect("repo");
    let agent = ScriptedAgent::new(vec![
        Reply::measure(&[("a", &[])]),
        Reply::done("a.txt", "A\n"),
    ]);
    let orch = orchestrator(&repo, &agent);
    orch.start("demo").expect("start");
    orch.run(Some(1)).expect("run");

    let archive = orch
        .reset_tracker(None)
        .expect("tracker reset")
        .expect("archived");
    assert!(archive.join("tasks.json").exists());

    let paths = CobblerPaths::new(repo.path());
    let trail = paths.trail("demo");
    assert!(TaskStore::new(&trail).load().expect("tasks").is_empty());
    let checkpoint = load_checkpoint(&trail.checkpoint_path).expect("checkpoint");
    assert!(checkpoint.tasks.is_empty());
    assert_eq!(checkpoint.cycle_index, 1);
}

#[test]
fn standalone_measure_then_stitch_completes_one_cycle() {
    let repo = TestRepo::new().expect("repo");
    let agent = ScriptedAgent::new(vec![
        Reply::measure(&[("a", &[])]),
        Reply::done("a.txt", "A\n"),
    ]);
    let orch = orchestrator(&repo, &agent);
    orch.start("demo").expect("start");

    let measured = orch.measure_once().expect("measure");
    assert_eq!(measured.cycle, 1);
    assert_eq!(measured.proposed, vec!["a"]);

    let prompt = orch.stitch_prompt(None).expect("stitch prompt");
    assert!(prompt.contains("Task a"), "{prompt}");

    let report = orch.stitch_once().expect("stitch");
    agent.assert_drained();
    assert_eq!(report.index, 1);
    assert_eq!(report.proposed, vec!["a"]);
    assert_eq!(report.results[0].outcome, TaskOutcome::Done);

    let rows = orch.list().expect("list");
    assert_eq!(rows[0].cycles_completed, 1);
    assert_eq!(rows[0].state, TrailState::Started);
}

#[test]
fn measure_prompt_lists_existing_tasks() {
    let repo = TestRepo::new().expect("repo");
    let agent = ScriptedAgent::new(vec![
        Reply::measure(&[("a", &[]), ("b", &["a"])]),
        Reply::failed("no"),
    ]);
    let orch = orchestrator(&repo, &agent);
    orch.start("demo").expect("start");
    orch.run(Some(1)).expect("run");

    let prompt = orch.measure_prompt().expect("prompt");
    assert!(prompt.contains("Task a"), "{prompt}");
    assert!(prompt.contains("Task b"), "{prompt}");
    assert_eq!(agent.prompts().len(), 2);
}

fn orchestrator_retrying(repo: &TestRepo, agent: &ScriptedAgent) -> Orchestrator<ScriptedAgent> {
    let mut cfg = test_config();
    cfg.agent.max_attempts = 2;
    Orchestrator::new(repo.path(), cfg, agent.clone()).expect("orchestrator")
}

#[test]
fn run_after_tracker_reset_executes_exactly_the_requested_cycles() {
    let repo = TestRepo::new().expect("repo");
    let agent = ScriptedAgent::new(vec![Reply::Output("not json".to_string())]);
    let orch = orchestrator(&repo, &agent);
    orch.start("demo").expect("start");
    orch.run(Some(1)).unwrap_err();
    orch.reset_tracker(None).expect("tracker reset");

    agent.push(vec![Reply::idle()]);
    let outcome = orch.run(Some(1)).expect("run");
    agent.assert_drained();
    assert_eq!(outcome.cycles.len(), 1);
    assert_eq!(outcome.cycles_completed, 1);
    assert_eq!(outcome.cycle_budget, 1);
}

#[test]
fn run_continues_cycle_opened_by_standalone_measure() {
    let repo = TestRepo::new().expect("repo");
    let agent = ScriptedAgent::new(vec![
        Reply::measure(&[("a", &[])]),
        Reply::done("a.txt", "A\n"),
    ]);
    let orch = orchestrator(&repo, &agent);
    orch.start("demo").expect("start");
    orch.measure_once().expect("measure");

    let outcome = orch.run(Some(1)).expect("run");
    agent.assert_drained();
    assert_eq!(outcome.cycles.len(), 1);
    let cycle = &outcome.cycles[0];
    assert_eq!(cycle.index, 1);
    assert_eq!(cycle.proposed, vec!["a"]);
    assert_eq!(cycle.results[0].outcome, TaskOutcome::Done);
    assert_eq!(outcome.cycles_completed, 1);

    // Measure ran once; the run went straight to Stitch.
    let prompts = agent.prompts();
    assert_eq!(prompts.len(), 2);
    assert!(prompts[1].contains("# Stitch: task `a`"));
}

#[test]
fn retried_stitch_attempt_starts_from_clean_worktree() {
    let repo = TestRepo::new().expect("repo");
    let agent = ScriptedAgent::new(vec![
        Reply::measure(&[("a", &[])]),
        Reply::Fail {
            message: "agent exited with status Some(1)".to_string(),
            edits: vec![("junk.txt".to_string(), "partial\n".to_string())],
        },
        Reply::done("a.txt", "A\n"),
    ]);
    let orch = orchestrator_retrying(&repo, &agent);
    let worktree = orch.start("demo").expect("start").worktree;

    let outcome = orch.run(Some(1)).expect("run");
    agent.assert_drained();
    assert_eq!(outcome.cycles[0].results[0].outcome, TaskOutcome::Done);

    let files = git_in(&worktree, &["ls-files"]).expect("ls-files");
    assert!(files.lines().any(|f| f == "a.txt"));
    assert!(!files.lines().any(|f| f == "junk.txt"), "{files}");
    assert!(!worktree.join("junk.txt").exists());
}

#[test]
fn stitch_gives_up_after_max_attempts() {
    let repo = TestRepo::new().expect("repo");
    let fail = |n: u32| Reply::Fail {
        message: format!("crash {n}"),
        edits: Vec::new(),
    };
    let agent = ScriptedAgent::new(vec![Reply::measure(&[("a", &[])]), fail(1), fail(2)]);
    let orch = orchestrator_retrying(&repo, &agent);
    orch.start("demo").expect("start");

    let outcome = orch.run(Some(1)).expect("run");
    agent.assert_drained();
    let result = &outcome.cycles[0].results[0];
    assert_eq!(result.outcome, TaskOutcome::Failed);
    assert!(result.detail.contains("after 2 attempt(s)"), "{}", result.detail);
}

#[test]
fn measure_retries_malformed_output() {
    let repo = TestRepo::new().expect("repo");
    let agent = ScriptedAgent::new(vec![Reply::Output("not json".to_string()), Reply::idle()]);
    let orch = orchestrator_retrying(&repo, &agent);
    orch.start("demo").expect("start");

    let outcome = orch.run(Some(1)).expect("run");
    agent.assert_drained();
    assert_eq!(outcome.cycles_completed, 1);
    assert!(outcome.cycles[0].is_idle());
}

/// A timed-out task fails without a retry and the cycle goes on to the next
/// ready task.
#[test]
fn stitch_timeout_fails_task_and_cycle_continues() {
    let repo = TestRepo::new().expect("repo");
    let agent = ScriptedAgent::new(vec![
        Reply::measure(&[("a", &[]), ("b", &[])]),
        Reply::Timeout,
        Reply::done("b.txt", "B\n"),
    ]);
    let orch = orchestrator_retrying(&repo, &agent);
    orch.start("demo").expect("start");

    let outcome = orch.run(Some(1)).expect("run");
    agent.assert_drained();
    let results = &outcome.cycles[0].results;
    assert_eq!(results[0].task_id, "a");
    assert_eq!(results[0].outcome, TaskOutcome::Failed);
    assert!(results[0].detail.contains("timed out"), "{}", results[0].detail);
    assert_eq!(results[1].task_id, "b");
    assert_eq!(results[1].outcome, TaskOutcome::Done);

    let tasks = TaskStore::new(&CobblerPaths::new(repo.path()).trail("demo"))
        .load()
        .expect("tasks");
    let a = tasks.iter().find(|t| t.id == "a").expect("task a");
    assert_eq!(a.status, TaskStatus::Failed);
}

#[test]
fn invalid_measure_batch_inserts_nothing_and_interrupts() {
    for batch in [
        Reply::measure(&[("a", &["b"]), ("b", &["a"])]),
        Reply::measure(&[("a", &[]), ("b", &["missing"])]),
    ] {
        let repo = TestRepo::new().expect("repo");
        let agent = ScriptedAgent::new(vec![batch]);
        let orch = orchestrator(&repo, &agent);
        orch.start("demo").expect("start");

        let err = orch.run(Some(1)).unwrap_err();
        assert!(
            matches!(
                CobblerError::find(&err),
                Some(CobblerError::InvalidDependency { .. })
            ),
            "{err:#}"
        );
        let tasks = TaskStore::new(&CobblerPaths::new(repo.path()).trail("demo"))
            .load()
            .expect("tasks");
        assert!(tasks.is_empty());
        assert_eq!(orch.list().expect("list")[0].state, TrailState::Interrupted);
    }
}
